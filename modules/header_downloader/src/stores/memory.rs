use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use anyhow::{anyhow, Result};
use meridian_common::{BlockHash, BlockHeader, BlockNum};

use super::HeaderStore;

/// Header store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryHeaderStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    headers: HashMap<BlockHash, BlockHeader>,
    canonical: BTreeMap<BlockNum, BlockHash>,
}

impl InMemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `headers`, appended in order.
    pub fn with_headers<'a>(headers: impl IntoIterator<Item = &'a BlockHeader>) -> Result<Self> {
        let store = Self::new();
        for header in headers {
            store.append_header(header)?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.headers.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T> {
        let inner = self.inner.read().map_err(|_| anyhow!("header store lock poisoned"))?;
        Ok(f(&inner))
    }
}

impl HeaderStore for InMemoryHeaderStore {
    fn read_header(&self, number: BlockNum, hash: &BlockHash) -> Result<Option<BlockHeader>> {
        self.read(|inner| inner.headers.get(hash).filter(|h| h.number() == number).cloned())
    }

    fn read_header_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockHeader>> {
        self.read(|inner| inner.headers.get(hash).cloned())
    }

    fn read_header_by_number(&self, number: BlockNum) -> Result<Option<BlockHeader>> {
        self.read(|inner| {
            inner.canonical.get(&number).and_then(|hash| inner.headers.get(hash)).cloned()
        })
    }

    fn highest_header(&self) -> Result<Option<BlockHeader>> {
        self.read(|inner| {
            inner
                .canonical
                .last_key_value()
                .and_then(|(_, hash)| inner.headers.get(hash))
                .cloned()
        })
    }

    fn append_header(&self, header: &BlockHeader) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| anyhow!("header store lock poisoned"))?;
        inner.headers.insert(header.hash(), header.clone());
        inner.canonical.insert(header.number(), header.hash());
        Ok(())
    }
}
