use std::{fs, path::Path};

use anyhow::Result;
use fjall::{Database, Keyspace};
use meridian_common::{BlockHash, BlockHeader, BlockNum};

use super::HeaderStore;

const HEADERS_KEYSPACE: &str = "headers";
const CANONICAL_KEYSPACE: &str = "canonical-hashes-by-number";

/// Header store on a fjall database.
///
/// `headers` maps hash to the header encoding; `canonical` maps big-endian
/// height to hash, so its last entry is the highest header.
pub struct FjallHeaderStore {
    database: Database,
    headers: Keyspace,
    canonical: Keyspace,
}

impl FjallHeaderStore {
    pub fn new(path: &Path, clear: bool) -> Result<Self> {
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }
        let database = Database::builder(path).open()?;
        let headers = database.keyspace(HEADERS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let canonical =
            database.keyspace(CANONICAL_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        Ok(Self {
            database,
            headers,
            canonical,
        })
    }

    fn get_by_hash(&self, hash: &[u8]) -> Result<Option<BlockHeader>> {
        let Some(bytes) = self.headers.get(hash)? else {
            return Ok(None);
        };
        Ok(Some(BlockHeader::decode(&bytes)?))
    }
}

impl HeaderStore for FjallHeaderStore {
    fn read_header(&self, number: BlockNum, hash: &BlockHash) -> Result<Option<BlockHeader>> {
        Ok(self.get_by_hash(hash.as_ref())?.filter(|header| header.number() == number))
    }

    fn read_header_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockHeader>> {
        self.get_by_hash(hash.as_ref())
    }

    fn read_header_by_number(&self, number: BlockNum) -> Result<Option<BlockHeader>> {
        let Some(hash) = self.canonical.get(number.to_be_bytes())? else {
            return Ok(None);
        };
        self.get_by_hash(&hash)
    }

    fn highest_header(&self) -> Result<Option<BlockHeader>> {
        let Some(res) = self.canonical.last_key_value() else {
            return Ok(None);
        };
        let hash = res.value()?;
        self.get_by_hash(&hash)
    }

    fn append_header(&self, header: &BlockHeader) -> Result<()> {
        let hash = header.hash();
        let mut batch = self.database.batch();
        batch.insert(&self.headers, *hash, header.encode());
        batch.insert(&self.canonical, header.number().to_be_bytes(), *hash);
        batch.commit()?;
        Ok(())
    }
}
