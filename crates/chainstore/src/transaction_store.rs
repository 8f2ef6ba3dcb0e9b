//! Transaction records with confirmation state and per-output spender links.
//!
//! Records are keyed by an opaque link allocated at store time; a secondary
//! index maps transaction hash to link. Each output slot carries the height
//! of the confirmed transaction that spent it and a candidate-spend mark.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use ledgerdb_primitives::encoding::{Decoder, Encodable, Encoder};
use ledgerdb_primitives::{Hash256, OutPoint, Transaction, TxLink, TxOut};
use ledgerdb_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const META_NEXT_LINK: &[u8] = b"transactions:next_link";

/// Position value of an unconfirmed transaction. The height slot of an
/// unconfirmed record holds the forks value given at store time.
pub const POSITION_UNCONFIRMED: u32 = u32::MAX;

/// Spender height of an unspent output.
pub const SPENDER_UNSPENT: u32 = u32::MAX;

/// Decoded view of a stored transaction.
#[derive(Clone, Debug)]
pub struct TxResult {
    pub transaction: Transaction,
    pub link: TxLink,
    pub height: u32,
    pub median_time_past: u32,
    pub position: u32,
    pub candidate: bool,
    pub spender_heights: Vec<u32>,
    pub candidate_spends: Vec<bool>,
}

impl TxResult {
    pub fn is_confirmed(&self) -> bool {
        self.position != POSITION_UNCONFIRMED
    }
}

#[derive(Clone)]
struct TxRecord {
    height: u32,
    median_time_past: u32,
    position: u32,
    candidate: bool,
    spenders: Vec<(u32, bool)>,
    tx_bytes: Vec<u8>,
}

impl TxRecord {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.median_time_past);
        encoder.write_u32_le(self.position);
        encoder.write_u8(u8::from(self.candidate));
        encoder.write_varint(self.spenders.len() as u64);
        for (spender_height, candidate_spend) in &self.spenders {
            encoder.write_u32_le(*spender_height);
            encoder.write_u8(u8::from(*candidate_spend));
        }
        encoder.write_bytes(&self.tx_bytes);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut decoder = Decoder::new(bytes);
        let parse = |err: ledgerdb_primitives::encoding::DecodeError| {
            StoreError::Backend(err.to_string())
        };
        let height = decoder.read_u32_le().map_err(parse)?;
        let median_time_past = decoder.read_u32_le().map_err(parse)?;
        let position = decoder.read_u32_le().map_err(parse)?;
        let candidate = decoder.read_u8().map_err(parse)? != 0;
        let count = decoder.read_varint().map_err(parse)?;
        let mut spenders = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let spender_height = decoder.read_u32_le().map_err(parse)?;
            let candidate_spend = decoder.read_u8().map_err(parse)? != 0;
            spenders.push((spender_height, candidate_spend));
        }
        let tx_bytes = decoder.rest().to_vec();
        Ok(Self {
            height,
            median_time_past,
            position,
            candidate,
            spenders,
            tx_bytes,
        })
    }

    fn transaction(&self) -> Result<Transaction, StoreError> {
        Transaction::consensus_decode_bytes(&self.tx_bytes)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

struct RecordCacheEntry {
    bytes: Vec<u8>,
    stamp: u64,
}

struct RecordCache {
    entries: HashMap<u64, RecordCacheEntry>,
    order: VecDeque<(u64, u64)>,
    capacity: usize,
    clock: u64,
}

impl RecordCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            clock: 0,
        }
    }

    fn get(&mut self, link: u64) -> Option<Vec<u8>> {
        if self.capacity == 0 {
            return None;
        }
        let stamp = self.bump_stamp();
        let entry = self.entries.get_mut(&link)?;
        entry.stamp = stamp;
        self.order.push_back((link, stamp));
        Some(entry.bytes.clone())
    }

    fn insert(&mut self, link: u64, bytes: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.bump_stamp();
        self.entries.insert(link, RecordCacheEntry { bytes, stamp });
        self.order.push_back((link, stamp));
        self.evict();
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn bump_stamp(&mut self) -> u64 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((link, stamp)) = self.order.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get(&link) else {
                continue;
            };
            if entry.stamp != stamp {
                continue;
            }
            self.entries.remove(&link);
        }
    }
}

pub struct TransactionStore<S> {
    store: S,
    next_link: Mutex<u64>,
    cache: Mutex<RecordCache>,
}

impl<S: KeyValueStore> TransactionStore<S> {
    pub fn new(store: S, cache_capacity: usize) -> Self {
        Self {
            store,
            next_link: Mutex::new(0),
            cache: Mutex::new(RecordCache::new(cache_capacity)),
        }
    }

    pub fn create(&self) -> Result<(), StoreError> {
        if self.store.get(Column::Meta, META_NEXT_LINK)?.is_some() {
            return Err(StoreError::Backend(
                "transaction store already exists".into(),
            ));
        }
        self.store
            .put(Column::Meta, META_NEXT_LINK, &0u64.to_le_bytes())?;
        *self.next_link.lock().expect("transaction link counter") = 0;
        Ok(())
    }

    pub fn open(&self) -> Result<(), StoreError> {
        let bytes = self
            .store
            .get(Column::Meta, META_NEXT_LINK)?
            .ok_or_else(|| StoreError::Backend("transaction store not created".into()))?;
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid transaction link counter".into()))?;
        *self.next_link.lock().expect("transaction link counter") = u64::from_le_bytes(bytes);
        Ok(())
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.cache.lock().expect("transaction record cache").clear();
        Ok(())
    }

    /// Persist the link counter, making records allocated since the last
    /// commit reachable.
    pub fn commit(&self) -> Result<(), StoreError> {
        let next = *self.next_link.lock().expect("transaction link counter");
        self.store
            .put(Column::Meta, META_NEXT_LINK, &next.to_le_bytes())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    pub fn exists(&self, hash: &Hash256) -> Result<bool, StoreError> {
        Ok(self.link_of(hash)?.is_some())
    }

    /// Store the transaction if missing and always set its link metadata.
    /// The forks value is recorded in the height slot while unconfirmed.
    pub fn store(&self, tx: &mut Transaction, forks: u32) -> Result<bool, StoreError> {
        let hash = tx.txid();
        if let Some(link) = self.link_of(&hash)? {
            tx.metadata.link = link;
            tx.metadata.existed = true;
            return Ok(true);
        }

        let link = self.allocate_link();
        let mut encoder = Encoder::new();
        tx.consensus_encode(&mut encoder);
        let record = TxRecord {
            height: forks,
            median_time_past: 0,
            position: POSITION_UNCONFIRMED,
            candidate: false,
            spenders: vec![(SPENDER_UNSPENT, false); tx.outputs.len()],
            tx_bytes: encoder.into_inner(),
        };
        let mut batch = WriteBatch::new();
        let bytes = self.stage(&mut batch, link, &record);
        batch.put(Column::TxHashIndex, hash, link.to_le_bytes());
        self.store.write_batch(&batch)?;
        self.cache
            .lock()
            .expect("transaction record cache")
            .insert(link.0, bytes);
        tx.metadata.link = link;
        tx.metadata.existed = false;
        Ok(true)
    }

    /// Store any missing transactions and set link metadata on all.
    pub fn store_all(&self, txs: &mut [Transaction]) -> Result<bool, StoreError> {
        for tx in txs.iter_mut() {
            if !self.store(tx, 0)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn get(&self, link: TxLink) -> Result<Option<TxResult>, StoreError> {
        let Some(record) = self.load(link)? else {
            return Ok(None);
        };
        let mut transaction = record.transaction()?;
        transaction.metadata.link = link;
        transaction.metadata.existed = true;
        Ok(Some(TxResult {
            transaction,
            link,
            height: record.height,
            median_time_past: record.median_time_past,
            position: record.position,
            candidate: record.candidate,
            spender_heights: record.spenders.iter().map(|(height, _)| *height).collect(),
            candidate_spends: record.spenders.iter().map(|(_, mark)| *mark).collect(),
        }))
    }

    pub fn get_by_hash(&self, hash: &Hash256) -> Result<Option<TxResult>, StoreError> {
        match self.link_of(hash)? {
            Some(link) => self.get(link),
            None => Ok(None),
        }
    }

    /// Resolve a prevout to its output.
    pub fn output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, StoreError> {
        let Some(result) = self.get_by_hash(&outpoint.hash)? else {
            return Ok(None);
        };
        Ok(result
            .transaction
            .outputs
            .into_iter()
            .nth(outpoint.index as usize))
    }

    /// Set the confirmation tuple and mark each claimed prevout with the
    /// confirming height.
    pub fn confirm(
        &self,
        link: TxLink,
        height: u32,
        median_time_past: u32,
        position: u32,
    ) -> Result<bool, StoreError> {
        self.transition(link, |record| {
            record.height = height;
            record.median_time_past = median_time_past;
            record.position = position;
        }, |spender| {
            spender.0 = height;
        })
    }

    /// Confirm a block's transactions in on-wire order.
    pub fn confirm_all(
        &self,
        txs: &[Transaction],
        height: u32,
        median_time_past: u32,
    ) -> Result<bool, StoreError> {
        for (position, tx) in txs.iter().enumerate() {
            if !self.confirm(tx.metadata.link, height, median_time_past, position as u32)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Clear the confirmation tuple and release each claimed prevout.
    pub fn unconfirm(&self, link: TxLink) -> Result<bool, StoreError> {
        self.transition(link, |record| {
            record.height = 0;
            record.median_time_past = 0;
            record.position = POSITION_UNCONFIRMED;
        }, |spender| {
            spender.0 = SPENDER_UNSPENT;
        })
    }

    /// Mark the transaction and the outputs it spends as candidate.
    pub fn candidate(&self, link: TxLink) -> Result<bool, StoreError> {
        self.transition(link, |record| {
            record.candidate = true;
        }, |spender| {
            spender.1 = true;
        })
    }

    /// Clear the candidate marks set by `candidate`.
    pub fn uncandidate(&self, link: TxLink) -> Result<bool, StoreError> {
        self.transition(link, |record| {
            record.candidate = false;
        }, |spender| {
            spender.1 = false;
        })
    }

    /// Apply a state transition to a record and the output slot of every
    /// prevout its inputs claim, as one batch.
    fn transition(
        &self,
        link: TxLink,
        apply: impl FnOnce(&mut TxRecord),
        mark_spender: impl Fn(&mut (u32, bool)),
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.load(link)? else {
            return Ok(false);
        };
        let transaction = record.transaction()?;
        apply(&mut record);

        let mut touched: HashMap<u64, TxRecord> = HashMap::new();
        if !transaction.is_coinbase() {
            for input in &transaction.inputs {
                let prevout = &input.prevout;
                if prevout.is_null() {
                    continue;
                }
                let Some(prev_link) = self.link_of(&prevout.hash)? else {
                    return Ok(false);
                };
                let entry = match touched.entry(prev_link.0) {
                    std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                    std::collections::hash_map::Entry::Vacant(vacant) => {
                        let Some(prev_record) = self.load(prev_link)? else {
                            return Ok(false);
                        };
                        vacant.insert(prev_record)
                    }
                };
                let Some(spender) = entry.spenders.get_mut(prevout.index as usize) else {
                    return Ok(false);
                };
                mark_spender(spender);
            }
        }

        let mut batch = WriteBatch::new();
        let mut staged = Vec::with_capacity(1 + touched.len());
        staged.push((link.0, self.stage(&mut batch, link, &record)));
        for (prev_link, prev_record) in &touched {
            staged.push((*prev_link, self.stage(&mut batch, TxLink(*prev_link), prev_record)));
        }
        self.store.write_batch(&batch)?;
        let mut cache = self.cache.lock().expect("transaction record cache");
        for (staged_link, bytes) in staged {
            cache.insert(staged_link, bytes);
        }
        Ok(true)
    }

    fn stage(&self, batch: &mut WriteBatch, link: TxLink, record: &TxRecord) -> Vec<u8> {
        let bytes = record.encode();
        batch.put(Column::TxRecord, link.to_le_bytes(), bytes.clone());
        bytes
    }

    fn load(&self, link: TxLink) -> Result<Option<TxRecord>, StoreError> {
        if !link.is_valid() {
            return Ok(None);
        }
        if let Some(bytes) = self
            .cache
            .lock()
            .expect("transaction record cache")
            .get(link.0)
        {
            return TxRecord::decode(&bytes).map(Some);
        }
        let Some(bytes) = self.store.get(Column::TxRecord, &link.to_le_bytes())? else {
            return Ok(None);
        };
        self.cache
            .lock()
            .expect("transaction record cache")
            .insert(link.0, bytes.clone());
        TxRecord::decode(&bytes).map(Some)
    }

    fn link_of(&self, hash: &Hash256) -> Result<Option<TxLink>, StoreError> {
        let Some(bytes) = self.store.get(Column::TxHashIndex, hash)? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid transaction link".into()))?;
        Ok(Some(TxLink::from_le_bytes(bytes)))
    }

    fn allocate_link(&self) -> TxLink {
        let mut next = self.next_link.lock().expect("transaction link counter");
        let link = TxLink(*next);
        *next += 1;
        link
    }
}
