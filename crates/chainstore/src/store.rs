//! Store coordinator: opens and closes the leaf stores, serializes writers,
//! and drives the block lifecycle state machine.
//!
//! Every mutating operation follows the same write-transaction protocol:
//! take the write mutex, check preconditions against leaf state, take the
//! conditional flush lock, `begin_write`, mutate leaves in order, commit,
//! `end_write`. A failure after `begin_write` attempts `end_write` and
//! returns without rolling back leaf mutations; the flush-lock sentinel is
//! the sole durable recovery signal.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ledgerdb_log::{log_debug, log_error};
use ledgerdb_primitives::{Block, BlockHeader, Transaction, Validation};
use ledgerdb_storage::{KeyValueStore, StoreError};

use crate::address_store::AddressStore;
use crate::block_store::BlockStore;
use crate::error::ChainError;
use crate::lock::{ConditionalLock, ExclusiveFileLock, FlushLockFile};
use crate::settings::Settings;
use crate::transaction_store::TransactionStore;
use crate::verify;

pub struct Store<S: KeyValueStore> {
    settings: Settings,
    blocks: BlockStore<Arc<S>>,
    transactions: TransactionStore<Arc<S>>,
    addresses: Option<AddressStore<Arc<S>>>,
    write_mutex: Mutex<()>,
    flush_lock_mutex: Mutex<()>,
    exclusive_lock: Mutex<Option<ExclusiveFileLock>>,
    flush_lock: FlushLockFile,
    flush_lock_engaged: AtomicBool,
    closed: AtomicBool,
}

impl<S: KeyValueStore> Store<S> {
    pub fn new(backend: Arc<S>, settings: Settings) -> Self {
        let blocks = BlockStore::new(
            Arc::clone(&backend),
            settings.block_table_buckets as usize,
        );
        let transactions = TransactionStore::new(
            Arc::clone(&backend),
            settings.cache_capacity as usize,
        );
        let addresses = settings
            .index_addresses
            .then(|| AddressStore::new(Arc::clone(&backend)));
        let flush_lock = FlushLockFile::new(&settings.directory);
        Self {
            settings,
            blocks,
            transactions,
            addresses,
            write_mutex: Mutex::new(()),
            flush_lock_mutex: Mutex::new(()),
            exclusive_lock: Mutex::new(None),
            flush_lock,
            flush_lock_engaged: AtomicBool::new(false),
            closed: AtomicBool::new(true),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // Reader interfaces. Leaf stores outlive any read borrow taken through
    // these; ownership stays with the store.

    pub fn blocks(&self) -> &BlockStore<Arc<S>> {
        &self.blocks
    }

    pub fn transactions(&self) -> &TransactionStore<Arc<S>> {
        &self.transactions
    }

    pub fn addresses(&self) -> Option<&AddressStore<Arc<S>>> {
        self.addresses.as_ref()
    }

    // Open and close.

    /// Create backing state for every leaf and push the genesis block. Not
    /// idempotent: fails if leaf state already exists. On failure the
    /// partially created directory is left for the caller to recover.
    pub fn create(&self, genesis: &mut Block) -> Result<(), ChainError> {
        if fs::create_dir_all(&self.settings.directory).is_err() {
            log_error!(
                "failed to create data directory {}",
                self.settings.directory.display()
            );
            return Err(ChainError::OperationFailed);
        }
        self.lock_exclusive()?;
        self.blocks.create()?;
        self.transactions.create()?;
        if let Some(addresses) = &self.addresses {
            addresses.create()?;
        }
        self.closed.store(false, Ordering::SeqCst);
        self.push(genesis, 0, 0)
    }

    /// Open all leaves. Fails when a stale flush-lock sentinel from a prior
    /// run is present: the store shut down unclean and requires recovery.
    /// May be called again after `close`.
    pub fn open(&self) -> Result<(), ChainError> {
        self.lock_exclusive()?;
        if self.flush_lock.exists() {
            log_error!(
                "flush lock {} present: unclean shutdown, store requires recovery",
                self.flush_lock.path().display()
            );
            self.unlock_exclusive();
            return Err(ChainError::StoreLockFailure);
        }
        self.blocks.open()?;
        self.transactions.open()?;
        if let Some(addresses) = &self.addresses {
            addresses.open()?;
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Idempotent and safe from any thread. Waits out an in-flight write,
    /// closes leaves in reverse order, then releases the directory lock.
    pub fn close(&self) -> Result<(), ChainError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _write = self.write_mutex.lock().expect("write mutex");

        let mut result = Ok(());
        if let Some(addresses) = &self.addresses {
            if addresses.close().is_err() {
                result = Err(ChainError::OperationFailed);
            }
        }
        if self.transactions.close().is_err() {
            result = Err(ChainError::OperationFailed);
        }
        if self.blocks.close().is_err() {
            result = Err(ChainError::OperationFailed);
        }

        // The sentinel held for the store's lifetime comes off only after a
        // completed flush; a failed flush leaves it for recovery to find.
        if !self.settings.flush_writes && self.flush_lock_engaged.load(Ordering::SeqCst) {
            let _flush_guard = self.flush_lock_mutex.lock().expect("flush lock mutex");
            match self.flush() {
                Ok(()) => {
                    if self.flush_lock.unlock() {
                        self.flush_lock_engaged.store(false, Ordering::SeqCst);
                    } else {
                        result = Err(ChainError::StoreLockFailure);
                    }
                }
                Err(err) => {
                    log_error!("flush on close failed: {err}");
                    result = Err(ChainError::OperationFailed);
                }
            }
        }

        self.unlock_exclusive();
        result
    }

    /// Flush every leaf in dependency order. Runs even when closed: a flush
    /// skipped because close won the race would delete the flush lock over
    /// unflushed writes.
    pub fn flush(&self) -> Result<(), ChainError> {
        self.blocks.flush()?;
        self.transactions.flush()?;
        if let Some(addresses) = &self.addresses {
            addresses.flush()?;
        }
        Ok(())
    }

    // Public writers.

    /// Index a transaction's payments. A no-op without the address index or
    /// when the transaction was already stored (and therefore indexed).
    pub fn index_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        let Some(addresses) = &self.addresses else {
            return Ok(());
        };
        if tx.metadata.existed {
            return Ok(());
        }

        let _write = self.write_mutex.lock().expect("write mutex");
        verify::verify_exists_transaction(&self.transactions, tx)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), &self.flush_lock_mutex);
        if !self.begin_write() {
            log_debug!("index transaction: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        self.write_step(
            "index transaction",
            addresses.index(tx, |outpoint| self.transactions.output(outpoint)),
        )?;
        self.write_commit("index transaction", addresses.commit())?;
        self.finish_write("index transaction")
    }

    /// Index every not-yet-stored transaction of a block. A no-op without
    /// the address index.
    pub fn index_block(&self, block: &Block) -> Result<(), ChainError> {
        let Some(addresses) = &self.addresses else {
            return Ok(());
        };

        let _write = self.write_mutex.lock().expect("write mutex");
        verify::verify_exists_header(&self.blocks, &block.header)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), &self.flush_lock_mutex);
        if !self.begin_write() {
            log_debug!("index block: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        // Existence check prevents duplicated indexing.
        for tx in &block.transactions {
            if !tx.metadata.existed {
                self.write_step(
                    "index block",
                    addresses.index(tx, |outpoint| self.transactions.output(outpoint)),
                )?;
            }
        }
        self.write_commit("index block", addresses.commit())?;
        self.finish_write("index block")
    }

    /// Store a pool transaction. Fails with `DuplicateTransaction` when the
    /// hash is already present.
    pub fn store_transaction(&self, tx: &mut Transaction, forks: u32) -> Result<(), ChainError> {
        let _write = self.write_mutex.lock().expect("write mutex");
        verify::verify_missing(&self.transactions, tx)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), &self.flush_lock_mutex);
        if !self.begin_write() {
            log_debug!("store transaction: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        self.write_step("store transaction", self.transactions.store(tx, forks))?;
        self.write_commit("store transaction", self.transactions.commit())?;
        self.finish_write("store transaction")
    }

    /// Bind missing transactions to an existing confirmed header. The
    /// header's state is unchanged.
    pub fn update(&self, block: &mut Block, height: u32) -> Result<(), ChainError> {
        let _write = self.write_mutex.lock().expect("write mutex");
        verify::verify_update(&self.blocks, block, height)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), &self.flush_lock_mutex);
        if !self.begin_write() {
            log_debug!("update: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        self.write_step(
            "update: store transactions",
            self.transactions.store_all(&mut block.transactions),
        )?;
        self.write_step("update: bind links", self.blocks.update(block))?;
        self.write_commit("update", self.commit_leaves())?;
        self.finish_write("update")
    }

    /// Record a validation verdict against a stored header. Confirmation
    /// state is not unwound; a confirmed block stays confirmed with the
    /// failure on record.
    pub fn invalidate(&self, header: &mut BlockHeader, error_code: u32) -> Result<(), ChainError> {
        let _write = self.write_mutex.lock().expect("write mutex");
        verify::verify_exists_header(&self.blocks, header)?;

        let _flush = ConditionalLock::new(self.flush_each_write(), &self.flush_lock_mutex);
        if !self.begin_write() {
            log_debug!("invalidate: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        self.write_step("invalidate", self.blocks.validate(&header.hash(), error_code))?;
        header.metadata.validation = if error_code == 0 {
            Validation::Valid
        } else {
            Validation::Failed(error_code)
        };
        self.finish_write("invalidate")
    }

    /// Mark a candidate block valid and its transactions, and the outputs
    /// they spend, as candidate.
    pub fn candidate(&self, block: &mut Block) -> Result<(), ChainError> {
        let _write = self.write_mutex.lock().expect("write mutex");
        verify::verify_not_failed(&self.blocks, block)?;
        debug_assert!(!block.header.metadata.validation.is_failed());

        let _flush = ConditionalLock::new(self.flush_each_write(), &self.flush_lock_mutex);
        if !self.begin_write() {
            log_debug!("candidate: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        self.write_step("candidate: validate", self.blocks.validate(&block.hash(), 0))?;
        for tx in &block.transactions {
            self.write_step(
                "candidate: mark transaction",
                self.transactions.candidate(tx.metadata.link),
            )?;
        }
        block.header.metadata.validation = Validation::Valid;
        self.finish_write("candidate")
    }

    /// Store, associate, confirm and index the presumed-valid block on both
    /// chains. Used for main-chain extension.
    pub fn push(
        &self,
        block: &mut Block,
        height: u32,
        median_time_past: u32,
    ) -> Result<(), ChainError> {
        let _write = self.write_mutex.lock().expect("write mutex");

        let _flush = ConditionalLock::new(self.flush_each_write(), &self.flush_lock_mutex);
        if !self.begin_write() {
            log_debug!("push: begin_write failed");
            return Err(ChainError::StoreLockFailure);
        }

        let hash = block.hash();
        self.write_step(
            "push: store header",
            self.blocks.store(&mut block.header, height, median_time_past),
        )?;
        self.write_step("push: index candidate", self.blocks.index(&hash, height, true))?;
        self.write_step(
            "push: store transactions",
            self.transactions.store_all(&mut block.transactions),
        )?;
        self.write_step("push: bind links", self.blocks.update(block))?;
        self.write_step(
            "push: confirm transactions",
            self.transactions
                .confirm_all(&block.transactions, height, median_time_past),
        )?;
        self.write_step("push: validate", self.blocks.validate(&hash, 0))?;
        self.write_step("push: index confirmed", self.blocks.index(&hash, height, false))?;
        self.write_commit("push", self.commit_leaves())?;
        self.finish_write("push")
    }

    // Write-transaction protocol.

    pub(crate) fn write_mutex(&self) -> &Mutex<()> {
        &self.write_mutex
    }

    pub(crate) fn flush_lock_mutex(&self) -> &Mutex<()> {
        &self.flush_lock_mutex
    }

    pub(crate) fn flush_each_write(&self) -> bool {
        self.settings.flush_writes
    }

    /// Record the in-flight marker. With per-write flushing the sentinel is
    /// created for this write alone; otherwise the first write engages it
    /// for the life of the store.
    pub(crate) fn begin_write(&self) -> bool {
        if self.settings.flush_writes {
            self.flush_lock.try_lock()
        } else if !self.flush_lock_engaged.swap(true, Ordering::SeqCst) {
            if self.flush_lock.try_lock() {
                true
            } else {
                self.flush_lock_engaged.store(false, Ordering::SeqCst);
                false
            }
        } else {
            true
        }
    }

    /// Clear the in-flight marker. With per-write flushing this flushes all
    /// leaves and removes the sentinel; the sentinel stays put when the
    /// flush fails.
    pub(crate) fn end_write(&self) -> bool {
        if !self.settings.flush_writes {
            return true;
        }
        if self.flush().is_err() {
            return false;
        }
        self.flush_lock.unlock()
    }

    pub(crate) fn commit_leaves(&self) -> Result<(), StoreError> {
        if let Some(addresses) = &self.addresses {
            addresses.commit()?;
        }
        self.transactions.commit()?;
        self.blocks.commit()
    }

    /// Leaf-failure path: attempt `end_write` (logging when it also fails)
    /// and surface `OperationFailed`. Completed mutations stay in place.
    pub(crate) fn fail_write(&self, operation: &'static str) -> ChainError {
        if !self.end_write() {
            log_debug!("{operation}: end_write failed after leaf failure");
        }
        ChainError::OperationFailed
    }

    pub(crate) fn write_step(
        &self,
        operation: &'static str,
        result: Result<bool, StoreError>,
    ) -> Result<(), ChainError> {
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.fail_write(operation)),
            Err(err) => {
                log_debug!("{operation}: {err}");
                Err(self.fail_write(operation))
            }
        }
    }

    pub(crate) fn write_commit(
        &self,
        operation: &'static str,
        result: Result<(), StoreError>,
    ) -> Result<(), ChainError> {
        self.write_step(operation, result.map(|()| true))
    }

    pub(crate) fn finish_write(&self, operation: &'static str) -> Result<(), ChainError> {
        if self.end_write() {
            Ok(())
        } else {
            log_debug!("{operation}: end_write failed");
            Err(ChainError::StoreLockFailure)
        }
    }

    fn lock_exclusive(&self) -> Result<(), ChainError> {
        let mut guard = self.exclusive_lock.lock().expect("exclusive lock mutex");
        if guard.is_some() {
            return Err(ChainError::StoreLockFailure);
        }
        match ExclusiveFileLock::acquire(&self.settings.directory) {
            Some(lock) => {
                *guard = Some(lock);
                Ok(())
            }
            None => Err(ChainError::StoreLockFailure),
        }
    }

    fn unlock_exclusive(&self) {
        self.exclusive_lock
            .lock()
            .expect("exclusive lock mutex")
            .take();
    }
}

impl<S: KeyValueStore> Drop for Store<S> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
