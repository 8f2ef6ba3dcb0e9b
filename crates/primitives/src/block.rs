//! Block header and block types.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;
use crate::Hash256;

pub const HEADER_SIZE: usize = 80;

/// Validation verdict recorded against a header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Validation {
    #[default]
    Unvalidated,
    Valid,
    Failed(u32),
}

impl Validation {
    pub fn is_valid(self) -> bool {
        self == Validation::Valid
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Validation::Failed(_))
    }

    pub fn error_code(self) -> u32 {
        match self {
            Validation::Failed(code) => code,
            _ => 0,
        }
    }
}

/// Chain-state snapshot attached to a header once its context is known.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainContext {
    pub median_time_past: u32,
}

impl ChainContext {
    pub fn median_time_past(&self) -> u32 {
        self.median_time_past
    }
}

/// Populated by the block store when a header is stored or looked up.
#[derive(Clone, Debug, Default)]
pub struct HeaderMetadata {
    pub exists: bool,
    pub populated: bool,
    pub candidate: bool,
    pub confirmed: bool,
    pub validation: Validation,
    pub median_time_past: u32,
    pub state: Option<ChainContext>,
}

#[derive(Clone, Debug, Default)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub metadata: HeaderMetadata,
}

// Metadata is store state, not header identity.
impl PartialEq for BlockHeader {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.prev_block == other.prev_block
            && self.merkle_root == other.merkle_root
            && self.time == other.time
            && self.bits == other.bits
            && self.nonce == other.nonce
    }
}

impl Eq for BlockHeader {}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    }

    pub fn consensus_decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash_le()?;
        let merkle_root = decoder.read_hash_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
            metadata: HeaderMetadata::default(),
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce: 12345,
            metadata: HeaderMetadata::default(),
        }
    }

    #[test]
    fn header_serializes_to_80_bytes() {
        let mut encoder = Encoder::new();
        sample_header().consensus_encode(&mut encoder);
        assert_eq!(encoder.into_inner().len(), HEADER_SIZE);
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let mut encoder = Encoder::new();
        header.consensus_encode(&mut encoder);
        let decoded = BlockHeader::consensus_decode_bytes(&encoder.into_inner()).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn metadata_does_not_affect_equality() {
        let mut a = sample_header();
        let b = sample_header();
        a.metadata.exists = true;
        a.metadata.validation = Validation::Failed(7);
        assert_eq!(a, b);
    }
}
