//! Verdicts against peers that supplied invalid or unhelpful data.

use crate::peer::PeerId;

/// Reason a peer is being penalised.
///
/// The peer-protocol layer decides what each kind costs the peer; header
/// synchronisation only reports them.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, thiserror::Error,
)]
pub enum Penalty {
    #[error("bad block")]
    BadBlock,

    #[error("duplicate header in batch")]
    DuplicateHeader,

    #[error("child header height does not follow its parent")]
    WrongChildBlockHeight,

    #[error("child header difficulty inconsistent with its parent")]
    WrongChildDifficulty,

    #[error("invalid seal")]
    InvalidSeal,

    #[error("header too far in the future")]
    TooFarFuture,

    #[error("header too far in the past")]
    TooFarPast,

    #[error("anchor abandoned after repeated request timeouts")]
    AbandonedAnchor,

    #[error("undecodable message")]
    Kick,
}

/// A penalty attributed to the peer that earned it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerPenalty {
    pub peer: PeerId,
    pub penalty: Penalty,
}

impl PeerPenalty {
    pub fn new(peer: PeerId, penalty: Penalty) -> Self {
        Self { peer, penalty }
    }
}
