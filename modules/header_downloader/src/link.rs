//! Nodes of the header forest.

use meridian_common::{BlockHash, BlockHeader, BlockNum, PeerId};

/// Stable handle of a [`Link`]. Never reused within one forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub(crate) u64);

/// Stable handle of an [`Anchor`]. Never reused within one forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnchorId(pub(crate) u64);

/// What a new link hangs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attachment {
    Link(LinkId),
    Anchor(AnchorId),
}

/// One header known to the forest.
///
/// A pending link owns its header. Once persisted the header lives in
/// storage and the link stays behind as a stub so that later headers can
/// still find their parent.
#[derive(Debug, Clone)]
pub struct Link {
    /// Hash of the header (identity key).
    pub hash: BlockHash,
    /// Hash of the parent header.
    pub parent_hash: BlockHash,
    /// Block height.
    pub height: BlockNum,
    /// The header; `None` once persisted.
    pub header: Option<BlockHeader>,
    /// Child links.
    pub next: Vec<LinkId>,
    /// Parent link, if the parent is in the forest.
    pub parent: Option<LinkId>,
    /// Anchor this link hangs from directly, if its parent is missing.
    pub anchor: Option<AnchorId>,
    /// Already written to storage.
    pub persisted: bool,
    /// Known to lead up to a trusted checkpoint.
    pub preverified: bool,
    /// Peer that delivered the header.
    pub peer: PeerId,
}

impl Link {
    pub(crate) fn new(header: BlockHeader, peer: PeerId) -> Self {
        Self {
            hash: header.hash(),
            parent_hash: header.parent_hash(),
            height: header.number(),
            header: Some(header),
            next: Vec::new(),
            parent: None,
            anchor: None,
            persisted: false,
            preverified: false,
            peer,
        }
    }

    /// A persisted link recovered from storage.
    pub(crate) fn stub(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            parent_hash: header.parent_hash(),
            height: header.number(),
            header: None,
            next: Vec::new(),
            parent: None,
            anchor: None,
            persisted: true,
            preverified: false,
            peer: PeerId::default(),
        }
    }
}

/// A gap below some pending links: their parent is not known yet.
#[derive(Debug, Clone)]
pub struct Anchor {
    /// The missing header every attached link claims as parent.
    pub parent_hash: BlockHash,
    /// Lowest height among attached links; the gap is at `block_height - 1`.
    pub block_height: BlockNum,
    /// Unix seconds when the next request may go out; 0 if never requested.
    pub timestamp: u64,
    /// Request deadlines missed so far.
    pub timeout_count: u32,
    /// Links hanging directly from this anchor.
    pub links: Vec<LinkId>,
    /// Peer that supplied the headers above the gap.
    pub peer: PeerId,
}

impl Anchor {
    pub(crate) fn new(parent_hash: BlockHash, block_height: BlockNum, peer: PeerId) -> Self {
        Self {
            parent_hash,
            block_height,
            timestamp: 0,
            timeout_count: 0,
            links: Vec::new(),
            peer,
        }
    }
}
