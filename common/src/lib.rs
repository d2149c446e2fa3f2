// Meridian common library - main library exports

pub mod hash;
pub mod header;
pub mod messages;
pub mod peer;
pub mod penalty;

// Flattened re-exports
pub use self::hash::{BlockHash, Hash};
pub use self::header::{BlockHeader, BlockNum, HeaderDecodeError};
pub use self::peer::PeerId;
pub use self::penalty::{Penalty, PeerPenalty};
