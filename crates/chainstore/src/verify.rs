//! Read-only preconditions checked before any leaf mutation. Failures
//! surface verbatim; no sentinel is written and no leaf state changes.

use ledgerdb_primitives::{Block, BlockHeader, Transaction};
use ledgerdb_storage::KeyValueStore;

use crate::block_store::BlockStore;
use crate::error::ChainError;
use crate::reorg::ForkPoint;
use crate::transaction_store::TransactionStore;

pub fn verify_exists_header<S: KeyValueStore>(
    blocks: &BlockStore<S>,
    header: &BlockHeader,
) -> Result<(), ChainError> {
    match blocks.get(&header.hash())? {
        Some(_) => Ok(()),
        None => Err(ChainError::NotFound),
    }
}

pub fn verify_exists_transaction<S: KeyValueStore>(
    transactions: &TransactionStore<S>,
    tx: &Transaction,
) -> Result<(), ChainError> {
    if transactions.exists(&tx.txid())? {
        Ok(())
    } else {
        Err(ChainError::NotFound)
    }
}

pub fn verify_missing<S: KeyValueStore>(
    transactions: &TransactionStore<S>,
    tx: &Transaction,
) -> Result<(), ChainError> {
    if transactions.exists(&tx.txid())? {
        Err(ChainError::DuplicateTransaction)
    } else {
        Ok(())
    }
}

/// The header must extend the candidate top: next height, linked by
/// previous-hash. Height zero is accepted onto an empty index.
pub fn verify_push_header<S: KeyValueStore>(
    blocks: &BlockStore<S>,
    header: &BlockHeader,
    height: u32,
) -> Result<(), ChainError> {
    match blocks.top(true) {
        None => {
            if height == 0 {
                Ok(())
            } else {
                Err(ChainError::InvalidHeight)
            }
        }
        Some(top) => {
            if height != top + 1 {
                return Err(ChainError::InvalidHeight);
            }
            let parent = blocks.get_at(top, true)?.ok_or(ChainError::OperationFailed)?;
            if header.prev_block != parent.hash {
                return Err(ChainError::MissingParent);
            }
            Ok(())
        }
    }
}

/// The block's header must already be the candidate at `height` and the
/// confirmed index must end exactly one below it.
pub fn verify_push_block<S: KeyValueStore>(
    blocks: &BlockStore<S>,
    block: &Block,
    height: u32,
) -> Result<(), ChainError> {
    let candidate = blocks
        .get_at(height, true)?
        .ok_or(ChainError::InvalidHeight)?;
    if candidate.hash != block.hash() {
        return Err(ChainError::InvalidHeight);
    }
    match (height, blocks.top(false)) {
        (0, None) => Ok(()),
        (height, Some(top)) if top + 1 == height => Ok(()),
        _ => Err(ChainError::InvalidHeight),
    }
}

pub fn verify_top<S: KeyValueStore>(
    blocks: &BlockStore<S>,
    height: u32,
    candidate: bool,
) -> Result<(), ChainError> {
    if blocks.top(candidate) == Some(height) {
        Ok(())
    } else {
        Err(ChainError::OperationFailed)
    }
}

/// The header must be confirmed at `height` with no transaction
/// associations yet.
pub fn verify_update<S: KeyValueStore>(
    blocks: &BlockStore<S>,
    block: &Block,
    height: u32,
) -> Result<(), ChainError> {
    let result = blocks.get_at(height, false)?.ok_or(ChainError::NotFound)?;
    if result.hash != block.hash() {
        return Err(ChainError::InvalidHeight);
    }
    if !result.tx_links.is_empty() {
        return Err(ChainError::OperationFailed);
    }
    Ok(())
}

/// The header must be stored and not carry a failed verdict.
pub fn verify_not_failed<S: KeyValueStore>(
    blocks: &BlockStore<S>,
    block: &Block,
) -> Result<(), ChainError> {
    let result = blocks.get(&block.hash())?.ok_or(ChainError::NotFound)?;
    if result.validation().is_failed() {
        return Err(ChainError::OperationFailed);
    }
    Ok(())
}

/// The fork point must name the indexed header at its height.
pub fn verify_fork_point<S: KeyValueStore>(
    blocks: &BlockStore<S>,
    fork_point: &ForkPoint,
    candidate: bool,
) -> Result<(), ChainError> {
    let Some(top) = blocks.top(candidate) else {
        return Err(ChainError::InvalidForkPoint);
    };
    if fork_point.height > top {
        return Err(ChainError::InvalidForkPoint);
    }
    let entry = blocks
        .get_at(fork_point.height, candidate)?
        .ok_or(ChainError::InvalidForkPoint)?;
    if entry.hash != fork_point.hash {
        return Err(ChainError::InvalidForkPoint);
    }
    Ok(())
}
