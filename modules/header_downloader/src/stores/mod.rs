//! Header storage behind the downloader.

use std::sync::Arc;

use anyhow::Result;
use meridian_common::{BlockHash, BlockHeader, BlockNum};
use tracing::info;

use crate::configuration::{DownloaderConfig, StoreKind};

pub mod fjall;
pub mod memory;

pub use self::fjall::FjallHeaderStore;
pub use self::memory::InMemoryHeaderStore;

/// Durable home of persisted headers.
///
/// Headers are keyed by hash, so several forks may share a height. The
/// header most recently appended at a height is the canonical one there.
pub trait HeaderStore: Send + Sync {
    fn read_header(&self, number: BlockNum, hash: &BlockHash) -> Result<Option<BlockHeader>>;
    fn read_header_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockHeader>>;
    fn read_header_by_number(&self, number: BlockNum) -> Result<Option<BlockHeader>>;
    fn highest_header(&self) -> Result<Option<BlockHeader>>;
    fn append_header(&self, header: &BlockHeader) -> Result<()>;
}

/// Open the store selected in `config`.
pub fn open(config: &DownloaderConfig) -> Result<Arc<dyn HeaderStore>> {
    Ok(match config.store {
        StoreKind::Memory => {
            info!("Using in-memory header store");
            Arc::new(InMemoryHeaderStore::new())
        }
        StoreKind::Fjall => {
            info!("Using fjall header store at {}", config.database_path.display());
            Arc::new(FjallHeaderStore::new(
                &config.database_path,
                config.clear_on_start,
            )?)
        }
    })
}
