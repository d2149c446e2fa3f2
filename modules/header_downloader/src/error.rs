//! Errors raised by header download collaborators.

use meridian_common::{BlockHash, BlockNum};

/// Failures that stop a persistence round. Misbehaving peers never end up
/// here; they earn penalties instead.
#[derive(Debug, thiserror::Error)]
pub enum HeaderDownloadError {
    #[error("header store failure: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("parent {hash} of header at height {number} missing from store")]
    MissingParent { number: BlockNum, hash: BlockHash },
}
