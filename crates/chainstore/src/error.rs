use std::fmt;

use ledgerdb_storage::StoreError;

/// Error codes surfaced by store operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainError {
    /// The flush-lock sentinel could not be created or removed.
    StoreLockFailure,
    /// A leaf store reported a write could not be completed.
    OperationFailed,
    /// A transaction with the same hash is already stored.
    DuplicateTransaction,
    /// The referenced header or transaction is not stored.
    NotFound,
    /// The fork point does not name an indexed header.
    InvalidForkPoint,
    /// The height is not the next index position or names the wrong header.
    InvalidHeight,
    /// The header does not link to the current index top.
    MissingParent,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::StoreLockFailure => write!(f, "store lock failure"),
            ChainError::OperationFailed => write!(f, "operation failed"),
            ChainError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ChainError::NotFound => write!(f, "not found"),
            ChainError::InvalidForkPoint => write!(f, "invalid fork point"),
            ChainError::InvalidHeight => write!(f, "invalid block height"),
            ChainError::MissingParent => write!(f, "missing parent block"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ledgerdb_log::log_debug!("leaf store failure: {err}");
        ChainError::OperationFailed
    }
}
