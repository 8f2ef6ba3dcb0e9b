//! Block, header and transaction types with consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub type Hash256 = [u8; 32];

pub use block::{Block, BlockHeader, ChainContext, HeaderMetadata, Validation};
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxLink, TxMetadata, TxOut};
