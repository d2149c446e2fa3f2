//! Header chain builders shared by Meridian tests

use meridian_common::{BlockHash, BlockHeader, BlockNum};

/// Timestamp of the test genesis header.
pub const GENESIS_TIME: u64 = 1_600_000_000;

/// Seconds between consecutive test headers.
pub const BLOCK_TIME: u64 = 12;

/// Helper: create a BlockHash from a u8 value.
pub fn hash(n: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    BlockHash::from(bytes)
}

/// Header at height 0 with the all-zero parent.
pub fn genesis() -> BlockHeader {
    BlockHeader::new(BlockHash::default(), 0, GENESIS_TIME, 1, b"genesis".to_vec())
}

/// Next header on top of `parent`.
pub fn child(parent: &BlockHeader) -> BlockHeader {
    child_with_salt(parent, 0)
}

/// Next header on top of `parent`; different salts give sibling headers with
/// different hashes.
pub fn child_with_salt(parent: &BlockHeader, salt: u8) -> BlockHeader {
    BlockHeader::new(
        parent.hash(),
        parent.number() + 1,
        parent.timestamp() + BLOCK_TIME,
        1,
        vec![salt],
    )
}

/// `len` headers on top of `parent`, ascending.
pub fn chain_from(parent: &BlockHeader, len: usize) -> Vec<BlockHeader> {
    fork_from(parent, len, 0)
}

/// `len` headers on top of `parent`, ascending, every header salted with
/// `salt` so the branch never collides with one built from another salt.
pub fn fork_from(parent: &BlockHeader, len: usize, salt: u8) -> Vec<BlockHeader> {
    let mut headers: Vec<BlockHeader> = Vec::with_capacity(len);
    for _ in 0..len {
        let next = child_with_salt(headers.last().unwrap_or(parent), salt);
        headers.push(next);
    }
    headers
}

/// Genesis followed by `len` headers, ascending. Index `n` holds height `n`.
pub fn chain(len: usize) -> Vec<BlockHeader> {
    let genesis = genesis();
    let mut headers = vec![genesis.clone()];
    headers.extend(chain_from(&genesis, len));
    headers
}

/// A header at `number` whose parent is not part of any test chain.
pub fn orphan(number: BlockNum, parent: u8) -> BlockHeader {
    BlockHeader::new(
        hash(parent),
        number,
        GENESIS_TIME + number * BLOCK_TIME,
        1,
        vec![parent],
    )
}

/// Wire encodings of `headers`.
pub fn encode_all(headers: &[BlockHeader]) -> Vec<Vec<u8>> {
    headers.iter().map(BlockHeader::encode).collect()
}
