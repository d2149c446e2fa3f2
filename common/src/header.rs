//! Block header as seen by header synchronisation.
//!
//! Only `number`, `hash` and `parent_hash` matter for chain linkage; the
//! remaining fields are carried so the consensus validator has something to
//! check and so the encoding round-trips byte for byte.

use blake2::{digest::consts::U32, Blake2b, Digest};
use minicbor::{Decode, Encode};

use crate::hash::BlockHash;

/// Block height.
pub type BlockNum = u64;

const HEADER_FIELDS: u64 = 5;

/// Errors decoding a header from its wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum HeaderDecodeError {
    #[error("malformed header: {0}")]
    Cbor(#[from] minicbor::decode::Error),

    #[error("header encoding is not canonical")]
    NonCanonical,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HeaderFields {
    parent_hash: BlockHash,
    number: BlockNum,
    timestamp: u64,
    difficulty: u64,
    extra_data: Vec<u8>,
}

impl<C> Encode<C> for HeaderFields {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(HEADER_FIELDS)?;
        self.parent_hash.encode(e, ctx)?;
        e.u64(self.number)?;
        e.u64(self.timestamp)?;
        e.u64(self.difficulty)?;
        e.bytes(&self.extra_data)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for HeaderFields {
    fn decode(d: &mut minicbor::Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        if d.array()? != Some(HEADER_FIELDS) {
            return Err(minicbor::decode::Error::message(
                "header must be a definite array of 5 fields",
            ));
        }
        Ok(Self {
            parent_hash: BlockHash::decode(d, ctx)?,
            number: d.u64()?,
            timestamp: d.u64()?,
            difficulty: d.u64()?,
            extra_data: d.bytes()?.to_vec(),
        })
    }
}

/// An immutable block header with its hash computed once at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    fields: HeaderFields,
    hash: BlockHash,
}

impl BlockHeader {
    pub fn new(
        parent_hash: BlockHash,
        number: BlockNum,
        timestamp: u64,
        difficulty: u64,
        extra_data: Vec<u8>,
    ) -> Self {
        let fields = HeaderFields {
            parent_hash,
            number,
            timestamp,
            difficulty,
            extra_data,
        };
        let hash = digest(&encode_fields(&fields));
        Self { fields, hash }
    }

    /// Decode a header from its CBOR bytes.
    ///
    /// Only the canonical encoding is accepted, so the hash of the bytes on
    /// the wire is always the hash of the re-encoded header.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderDecodeError> {
        let fields: HeaderFields = minicbor::decode(bytes)?;
        if encode_fields(&fields) != bytes {
            return Err(HeaderDecodeError::NonCanonical);
        }
        Ok(Self {
            fields,
            hash: digest(bytes),
        })
    }

    /// Canonical CBOR encoding.
    pub fn encode(&self) -> Vec<u8> {
        encode_fields(&self.fields)
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.fields.parent_hash
    }

    pub fn number(&self) -> BlockNum {
        self.fields.number
    }

    pub fn timestamp(&self) -> u64 {
        self.fields.timestamp
    }

    pub fn difficulty(&self) -> u64 {
        self.fields.difficulty
    }

    pub fn extra_data(&self) -> &[u8] {
        &self.fields.extra_data
    }
}

fn encode_fields(fields: &HeaderFields) -> Vec<u8> {
    minicbor::to_vec(fields).expect("encoding into a Vec is infallible")
}

fn digest(bytes: &[u8]) -> BlockHash {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(bytes);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    BlockHash::new(hash)
}
