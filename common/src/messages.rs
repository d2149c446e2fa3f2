//! Definition of Meridian bus messages

// Caryatid core messages
use caryatid_module_clock::messages::ClockTickMessage;

use crate::{hash::BlockHash, header::BlockNum, peer::PeerId, penalty::Penalty};

/// Starting point of a header request
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HashOrNumber {
    Hash(BlockHash),
    Number(BlockNum),
}

/// GetBlockHeaders request body, as defined by the peer protocol
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GetBlockHeadersRequest {
    /// First header to return
    pub origin: HashOrNumber,

    /// Maximum number of headers to return
    pub amount: u64,

    /// Headers to skip between consecutive returned headers
    pub skip: u64,

    /// Walk towards genesis instead of towards the tip
    pub reverse: bool,
}

/// Headers exchanged with a peer, as raw CBOR encodings
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockHeadersMessage {
    /// Remote peer (sender when inbound, recipient when outbound)
    pub peer: PeerId,

    /// Request this batch answers
    pub request_id: u64,

    /// Encoded headers
    pub headers: Vec<Vec<u8>>,
}

/// Header request received from a peer
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetBlockHeadersMessage {
    pub peer: PeerId,
    pub request_id: u64,
    pub request: GetBlockHeadersRequest,
}

/// Header request to be sent to any peer known to have reached `min_block`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SendGetBlockHeadersMessage {
    pub request_id: u64,
    pub request: GetBlockHeadersRequest,

    /// Target selector for the transport
    pub min_block: BlockNum,
}

/// A single new-block announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockAnnounce {
    pub hash: BlockHash,
    pub number: BlockNum,
}

/// New block hashes announced by a peer
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewBlockHashesMessage {
    pub peer: PeerId,
    pub announces: Vec<BlockAnnounce>,
}

/// Ask the transport to penalise a peer
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PenalizePeerMessage {
    pub peer: PeerId,
    pub penalty: Penalty,
}

/// Tell the transport how far a peer has been seen to progress
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerMinBlockMessage {
    pub peer: PeerId,
    pub min_block: BlockNum,
}

/// A contiguous range of headers has been committed to storage
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeadersPersistedMessage {
    /// Lowest committed height in this round
    pub from: BlockNum,

    /// Highest committed height in this round
    pub to: BlockNum,

    /// Hash of the highest committed header
    pub tip_hash: BlockHash,
}

/// Header synchronisation messages
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SyncMessage {
    BlockHeaders(BlockHeadersMessage),              // Peer delivered headers
    SendBlockHeaders(BlockHeadersMessage),          // Reply to a peer's header request
    GetBlockHeaders(GetBlockHeadersMessage),        // Peer asked us for headers
    SendGetBlockHeaders(SendGetBlockHeadersMessage), // Ask peers for headers
    NewBlockHashes(NewBlockHashesMessage),          // Peer announced new blocks
    PenalizePeer(PenalizePeerMessage),              // Peer misbehaved
    PeerMinBlock(PeerMinBlockMessage),              // Peer progress hint
    HeadersPersisted(HeadersPersistedMessage),      // Headers committed
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),          // Simple string
    JSON(serde_json::Value), // JSON object

    // Caryatid standard messages
    Clock(ClockTickMessage), // Clock tick

    // Header synchronisation
    Sync(SyncMessage),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}

impl From<SyncMessage> for Message {
    fn from(msg: SyncMessage) -> Self {
        Message::Sync(msg)
    }
}
