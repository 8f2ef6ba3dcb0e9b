//! Chain reorganization: pop the tail of an index above a fork point,
//! then push the replacement branch, at header or block granularity.
//!
//! Each pop and each push is an independent write transaction. A crash mid
//! reorganization leaves a valid chain whose top lies between the old and
//! the new tips; holding the flush lock across a long reorganization would
//! pin the sentinel past useful granularity and lengthen recovery.

use ledgerdb_log::log_debug;
use ledgerdb_primitives::{Block, BlockHeader, Hash256, Transaction};
use ledgerdb_storage::KeyValueStore;

use crate::block_store::BlockResult;
use crate::error::ChainError;
use crate::lock::ConditionalLock;
use crate::store::Store;
use crate::verify;

/// The last common ancestor between the old and the new chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForkPoint {
    pub height: u32,
    pub hash: Hash256,
}

impl<S: KeyValueStore> Store<S> {
    /// Replace the candidate-index tail above the fork point with the
    /// incoming headers. Popped headers are returned through `outgoing` in
    /// ascending height order.
    pub fn reorganize(
        &self,
        fork_point: &ForkPoint,
        incoming: &mut [BlockHeader],
        outgoing: &mut Vec<BlockHeader>,
    ) -> Result<(), ChainError> {
        if incoming.len() > (u32::MAX - fork_point.height) as usize {
            return Err(ChainError::OperationFailed);
        }
        self.pop_above_headers(outgoing, fork_point)?;
        self.push_all_headers(incoming, fork_point)
    }

    /// Block-granularity twin of `reorganize`, operating on the confirmed
    /// index. The candidate index is unchanged.
    pub fn reorganize_blocks(
        &self,
        fork_point: &ForkPoint,
        incoming: &mut [Block],
        outgoing: &mut Vec<Block>,
    ) -> Result<(), ChainError> {
        if incoming.len() > (u32::MAX - fork_point.height) as usize {
            return Err(ChainError::OperationFailed);
        }
        self.pop_above_blocks(outgoing, fork_point)?;
        self.push_all_blocks(incoming, fork_point)
    }

    fn push_all_headers(
        &self,
        headers: &mut [BlockHeader],
        fork_point: &ForkPoint,
    ) -> Result<(), ChainError> {
        let first_height = fork_point.height + 1;
        for (index, header) in headers.iter_mut().enumerate() {
            let median_time_past = header.metadata.median_time_past;
            self.push_header(header, first_height + index as u32, median_time_past)?;
        }
        Ok(())
    }

    fn pop_above_headers(
        &self,
        headers: &mut Vec<BlockHeader>,
        fork_point: &ForkPoint,
    ) -> Result<(), ChainError> {
        headers.clear();
        verify::verify_fork_point(self.blocks(), fork_point, true)?;

        let top = self.blocks().top(true).ok_or(ChainError::OperationFailed)?;
        let depth = top - fork_point.height;
        headers.reserve(depth as usize);
        if depth == 0 {
            return Ok(());
        }

        for height in (fork_point.height + 1..=top).rev() {
            let header = self.pop_header(height)?;
            headers.insert(0, header);
        }
        Ok(())
    }

    /// Append the next candidate header. Expects `metadata.exists` to be
    /// populated; an already-stored header is reused, not re-stored.
    pub fn push_header(
        &self,
        header: &mut BlockHeader,
        height: u32,
        median_time_past: u32,
    ) -> Result<(), ChainError> {
        let _write = self.write_mutex().lock().expect("write mutex");
        verify::verify_push_header(self.blocks(), header, height)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), self.flush_lock_mutex());
        if !self.begin_write() {
            log_debug!("push header: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        if !header.metadata.exists {
            self.write_step(
                "push header: store",
                self.blocks().store(header, height, median_time_past),
            )?;
        }
        self.write_step(
            "push header: index",
            self.blocks().index(&header.hash(), height, true),
        )?;
        self.write_commit("push header", self.blocks().commit())?;
        self.finish_write("push header")
    }

    /// Remove the candidate top, releasing the candidate marks of its
    /// transactions. Returns the popped header.
    pub fn pop_header(&self, height: u32) -> Result<BlockHeader, ChainError> {
        let _write = self.write_mutex().lock().expect("write mutex");
        verify::verify_top(self.blocks(), height, true)?;
        let result = self
            .blocks()
            .get_at(height, true)?
            .ok_or(ChainError::OperationFailed)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), self.flush_lock_mutex());
        if !self.begin_write() {
            log_debug!("pop header: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        for link in &result.tx_links {
            self.write_step(
                "pop header: uncandidate",
                self.transactions().uncandidate(*link),
            )?;
        }
        self.write_step(
            "pop header: unindex",
            self.blocks().unindex(&result.hash, height, true),
        )?;
        self.write_commit("pop header", self.blocks().commit())?;
        self.finish_write("pop header")?;
        Ok(result.header)
    }

    fn push_all_blocks(
        &self,
        blocks: &mut [Block],
        fork_point: &ForkPoint,
    ) -> Result<(), ChainError> {
        let first_height = fork_point.height + 1;
        for (index, block) in blocks.iter_mut().enumerate() {
            self.push_block(block, first_height + index as u32)?;
        }
        Ok(())
    }

    fn pop_above_blocks(
        &self,
        blocks: &mut Vec<Block>,
        fork_point: &ForkPoint,
    ) -> Result<(), ChainError> {
        blocks.clear();
        verify::verify_fork_point(self.blocks(), fork_point, false)?;

        let top = self.blocks().top(false).ok_or(ChainError::OperationFailed)?;
        let depth = top - fork_point.height;
        blocks.reserve(depth as usize);
        if depth == 0 {
            return Ok(());
        }

        for height in (fork_point.height + 1..=top).rev() {
            let block = self.pop_block(height)?;
            blocks.insert(0, block);
        }
        Ok(())
    }

    /// Confirm the candidate block at `height`: set each transaction's
    /// confirmation tuple in on-wire order, then append to the confirmed
    /// index. The candidate index is unchanged.
    pub fn push_block(&self, block: &mut Block, height: u32) -> Result<(), ChainError> {
        debug_assert!(block.header.metadata.state.is_some());
        let median_time_past = block
            .header
            .metadata
            .state
            .map(|state| state.median_time_past())
            .unwrap_or(block.header.metadata.median_time_past);

        let _write = self.write_mutex().lock().expect("write mutex");
        verify::verify_push_block(self.blocks(), block, height)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), self.flush_lock_mutex());
        if !self.begin_write() {
            log_debug!("push block: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        for (position, tx) in block.transactions.iter().enumerate() {
            self.write_step(
                "push block: confirm",
                self.transactions().confirm(
                    tx.metadata.link,
                    height,
                    median_time_past,
                    position as u32,
                ),
            )?;
        }
        self.write_step(
            "push block: index",
            self.blocks().index(&block.hash(), height, false),
        )?;
        self.write_commit("push block", self.commit_leaves())?;
        self.finish_write("push block")
    }

    /// Remove the confirmed top, unconfirming its transactions and
    /// releasing their claimed prevouts. Returns the popped block with its
    /// transactions hydrated. The candidate index is unchanged.
    pub fn pop_block(&self, height: u32) -> Result<Block, ChainError> {
        let _write = self.write_mutex().lock().expect("write mutex");
        verify::verify_top(self.blocks(), height, false)?;
        let result = self
            .blocks()
            .get_at(height, false)?
            .ok_or(ChainError::OperationFailed)?;

        let out_block = Block {
            header: result.header.clone(),
            transactions: self.to_transactions(&result)?,
        };
        debug_assert_eq!(out_block.hash(), result.hash);

        let _flush = ConditionalLock::new(self.flush_each_write(), self.flush_lock_mutex());
        if !self.begin_write() {
            log_debug!("pop block: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        for tx in &out_block.transactions {
            self.write_step(
                "pop block: unconfirm",
                self.transactions().unconfirm(tx.metadata.link),
            )?;
        }
        self.write_step(
            "pop block: unindex",
            self.blocks().unindex(&result.hash, height, false),
        )?;
        self.write_commit("pop block", self.commit_leaves())?;
        self.finish_write("pop block")?;
        Ok(out_block)
    }

    /// Hydrate a block's transactions from its association links.
    fn to_transactions(&self, result: &BlockResult) -> Result<Vec<Transaction>, ChainError> {
        let mut txs = Vec::with_capacity(result.tx_links.len());
        for link in &result.tx_links {
            let tx_result = self
                .transactions()
                .get(*link)?
                .ok_or(ChainError::OperationFailed)?;
            txs.push(tx_result.transaction);
        }
        Ok(txs)
    }
}
