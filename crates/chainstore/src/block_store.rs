//! Header records plus the candidate and confirmed height indices.
//!
//! Record data is written through immediately; the authoritative index
//! lengths live in memory and reach the meta column only on `commit`, so
//! entries appended past the last committed length are unreachable after a
//! crash.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use ledgerdb_primitives::encoding::{Decodable, Decoder, Encodable, Encoder};
use ledgerdb_primitives::{Block, BlockHeader, ChainContext, Hash256, TxLink, Validation};
use ledgerdb_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::block_state;

const META_CANDIDATE_LEN: &[u8] = b"blocks:candidate_len";
const META_CONFIRMED_LEN: &[u8] = b"blocks:confirmed_len";

// header:80 | median_time_past:4 | height:4 | state:1 | code:4
const BLOCK_RECORD_LEN: usize = 93;

/// Decoded view of a stored header and its index state.
#[derive(Clone, Debug)]
pub struct BlockResult {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    pub median_time_past: u32,
    pub state: u8,
    pub error_code: u32,
    pub tx_links: Vec<TxLink>,
}

impl BlockResult {
    pub fn transaction_count(&self) -> usize {
        self.tx_links.len()
    }

    pub fn validation(&self) -> Validation {
        if block_state::is_failed(self.state) {
            Validation::Failed(self.error_code)
        } else if block_state::is_valid(self.state) {
            Validation::Valid
        } else {
            Validation::Unvalidated
        }
    }
}

#[derive(Clone, Copy, Default)]
struct IndexLengths {
    candidate: u32,
    confirmed: u32,
}

struct RecordCache {
    entries: HashMap<Hash256, Vec<u8>>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl RecordCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.entries.get(hash).cloned()
    }

    fn insert(&mut self, hash: Hash256, bytes: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(hash, bytes).is_some() {
            return;
        }
        self.order.push_back(hash);
        if self.entries.len() > self.capacity {
            while let Some(evicted) = self.order.pop_front() {
                if self.entries.remove(&evicted).is_some() {
                    break;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

pub struct BlockStore<S> {
    store: S,
    lengths: Mutex<IndexLengths>,
    cache: Mutex<RecordCache>,
}

impl<S: KeyValueStore> BlockStore<S> {
    pub fn new(store: S, cache_capacity: usize) -> Self {
        Self {
            store,
            lengths: Mutex::new(IndexLengths::default()),
            cache: Mutex::new(RecordCache::new(cache_capacity)),
        }
    }

    pub fn create(&self) -> Result<(), StoreError> {
        if self.store.get(Column::Meta, META_CANDIDATE_LEN)?.is_some() {
            return Err(StoreError::Backend("block store already exists".into()));
        }
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, META_CANDIDATE_LEN, 0u32.to_le_bytes());
        batch.put(Column::Meta, META_CONFIRMED_LEN, 0u32.to_le_bytes());
        self.store.write_batch(&batch)?;
        *self.lengths.lock().expect("block index lengths") = IndexLengths::default();
        Ok(())
    }

    pub fn open(&self) -> Result<(), StoreError> {
        let candidate = self.read_length(META_CANDIDATE_LEN)?;
        let confirmed = self.read_length(META_CONFIRMED_LEN)?;
        *self.lengths.lock().expect("block index lengths") = IndexLengths {
            candidate,
            confirmed,
        };
        Ok(())
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.cache.lock().expect("block record cache").clear();
        Ok(())
    }

    /// Persist the index lengths, making entries appended since the last
    /// commit reachable.
    pub fn commit(&self) -> Result<(), StoreError> {
        let lengths = *self.lengths.lock().expect("block index lengths");
        let mut batch = WriteBatch::new();
        batch.put(
            Column::Meta,
            META_CANDIDATE_LEN,
            lengths.candidate.to_le_bytes(),
        );
        batch.put(
            Column::Meta,
            META_CONFIRMED_LEN,
            lengths.confirmed.to_le_bytes(),
        );
        self.store.write_batch(&batch)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    /// Store a header record. New headers enter in the candidate state.
    pub fn store(
        &self,
        header: &mut BlockHeader,
        height: u32,
        median_time_past: u32,
    ) -> Result<bool, StoreError> {
        debug_assert!(!header.metadata.exists);
        let hash = header.hash();
        let bytes = encode_record(
            header,
            median_time_past,
            height,
            block_state::CANDIDATE,
            0,
        );
        self.store.put(Column::BlockHeader, &hash, &bytes)?;
        self.cache
            .lock()
            .expect("block record cache")
            .insert(hash, bytes);
        header.metadata.exists = true;
        header.metadata.median_time_past = median_time_past;
        Ok(true)
    }

    /// Bind the header to its ordered transaction links. State is unchanged.
    pub fn update(&self, block: &Block) -> Result<bool, StoreError> {
        let hash = block.hash();
        if self.load_record(&hash)?.is_none() {
            return Ok(false);
        }
        let mut bytes = Vec::with_capacity(block.transactions.len() * 8);
        for tx in &block.transactions {
            debug_assert!(tx.metadata.link.is_valid());
            bytes.extend_from_slice(&tx.metadata.link.to_le_bytes());
        }
        self.store.put(Column::BlockTxs, &hash, &bytes)?;
        Ok(true)
    }

    /// Record a validation verdict: zero for valid, a consensus error code
    /// for failed. The code slot is only written for failures.
    pub fn validate(&self, hash: &Hash256, error_code: u32) -> Result<bool, StoreError> {
        let Some(bytes) = self.load_record(hash)? else {
            return Ok(false);
        };
        let (header, median_time_past, height, state, code) = decode_record(&bytes)?;
        let updated_state = block_state::with_validation(state, error_code == 0);
        let updated_code = if error_code != 0 { error_code } else { code };
        let updated = encode_record(&header, median_time_past, height, updated_state, updated_code);
        self.store.put(Column::BlockHeader, hash, &updated)?;
        self.cache
            .lock()
            .expect("block record cache")
            .insert(*hash, updated);
        Ok(true)
    }

    /// Append the header to the top of an index. Only the next height is
    /// accepted.
    pub fn index(&self, hash: &Hash256, height: u32, candidate: bool) -> Result<bool, StoreError> {
        let mut lengths = self.lengths.lock().expect("block index lengths");
        let length = if candidate {
            lengths.candidate
        } else {
            lengths.confirmed
        };
        if height != length {
            return Ok(false);
        }
        let Some(bytes) = self.load_record(hash)? else {
            return Ok(false);
        };
        let (header, median_time_past, record_height, state, code) = decode_record(&bytes)?;
        let updated_state = block_state::with_confirmation(state, true, candidate);
        let updated = encode_record(&header, median_time_past, record_height, updated_state, code);
        self.store.put(Column::BlockHeader, hash, &updated)?;
        self.cache
            .lock()
            .expect("block record cache")
            .insert(*hash, updated);
        self.store
            .put(index_column(candidate), &height.to_le_bytes(), hash)?;
        if candidate {
            lengths.candidate += 1;
        } else {
            lengths.confirmed += 1;
        }
        Ok(true)
    }

    /// Remove the header at the top of an index. Only the top height is
    /// accepted; the element is resolved through the index itself.
    pub fn unindex(&self, hash: &Hash256, height: u32, candidate: bool) -> Result<bool, StoreError> {
        let mut lengths = self.lengths.lock().expect("block index lengths");
        let length = if candidate {
            lengths.candidate
        } else {
            lengths.confirmed
        };
        if height + 1 != length {
            return Ok(false);
        }
        let Some(indexed_hash) = self.read_index(height, candidate)? else {
            return Ok(false);
        };
        debug_assert_eq!(indexed_hash, *hash);
        let Some(bytes) = self.load_record(&indexed_hash)? else {
            return Ok(false);
        };
        let (header, median_time_past, record_height, state, code) = decode_record(&bytes)?;
        let updated_state = block_state::with_confirmation(state, false, candidate);
        let updated = encode_record(&header, median_time_past, record_height, updated_state, code);
        self.store.put(Column::BlockHeader, &indexed_hash, &updated)?;
        self.cache
            .lock()
            .expect("block record cache")
            .insert(indexed_hash, updated);
        self.store
            .delete(index_column(candidate), &height.to_le_bytes())?;
        if candidate {
            lengths.candidate -= 1;
        } else {
            lengths.confirmed -= 1;
        }
        Ok(true)
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<BlockResult>, StoreError> {
        let Some(bytes) = self.load_record(hash)? else {
            return Ok(None);
        };
        let (mut header, median_time_past, height, state, error_code) = decode_record(&bytes)?;
        let tx_links = self.read_links(hash)?;
        header.metadata.exists = true;
        header.metadata.populated = !tx_links.is_empty();
        header.metadata.candidate = block_state::is_candidate(state);
        header.metadata.confirmed = block_state::is_confirmed(state);
        header.metadata.median_time_past = median_time_past;
        header.metadata.state = Some(ChainContext { median_time_past });
        header.metadata.validation = if block_state::is_failed(state) {
            Validation::Failed(error_code)
        } else if block_state::is_valid(state) {
            Validation::Valid
        } else {
            Validation::Unvalidated
        };
        Ok(Some(BlockResult {
            hash: *hash,
            header,
            height,
            median_time_past,
            state,
            error_code,
            tx_links,
        }))
    }

    pub fn get_at(&self, height: u32, candidate: bool) -> Result<Option<BlockResult>, StoreError> {
        {
            let lengths = self.lengths.lock().expect("block index lengths");
            let length = if candidate {
                lengths.candidate
            } else {
                lengths.confirmed
            };
            if height >= length {
                return Ok(None);
            }
        }
        let Some(hash) = self.read_index(height, candidate)? else {
            return Ok(None);
        };
        self.get(&hash)
    }

    /// Top height of an index, none while the index is empty.
    pub fn top(&self, candidate: bool) -> Option<u32> {
        let lengths = self.lengths.lock().expect("block index lengths");
        let length = if candidate {
            lengths.candidate
        } else {
            lengths.confirmed
        };
        if length == 0 {
            None
        } else {
            Some(length - 1)
        }
    }

    /// Populate a header's metadata from the store. Default metadata values
    /// already indicate not found.
    pub fn get_header_metadata(&self, header: &mut BlockHeader) -> Result<(), StoreError> {
        let Some(result) = self.get(&header.hash())? else {
            return Ok(());
        };
        header.metadata = result.header.metadata.clone();
        Ok(())
    }

    fn read_length(&self, key: &[u8]) -> Result<u32, StoreError> {
        let bytes = self
            .store
            .get(Column::Meta, key)?
            .ok_or_else(|| StoreError::Backend("block store not created".into()))?;
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid block index length".into()))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_index(&self, height: u32, candidate: bool) -> Result<Option<Hash256>, StoreError> {
        let Some(bytes) = self
            .store
            .get(index_column(candidate), &height.to_le_bytes())?
        else {
            return Ok(None);
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid index entry".into()))?;
        Ok(Some(hash))
    }

    fn read_links(&self, hash: &Hash256) -> Result<Vec<TxLink>, StoreError> {
        let Some(bytes) = self.store.get(Column::BlockTxs, hash)? else {
            return Ok(Vec::new());
        };
        if bytes.len() % 8 != 0 {
            return Err(StoreError::Backend("invalid transaction link array".into()));
        }
        let mut links = Vec::with_capacity(bytes.len() / 8);
        for chunk in bytes.chunks_exact(8) {
            let raw: [u8; 8] = chunk.try_into().expect("chunk length");
            links.push(TxLink::from_le_bytes(raw));
        }
        Ok(links)
    }

    fn load_record(&self, hash: &Hash256) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(bytes) = self.cache.lock().expect("block record cache").get(hash) {
            return Ok(Some(bytes));
        }
        let Some(bytes) = self.store.get(Column::BlockHeader, hash)? else {
            return Ok(None);
        };
        self.cache
            .lock()
            .expect("block record cache")
            .insert(*hash, bytes.clone());
        Ok(Some(bytes))
    }
}

fn index_column(candidate: bool) -> Column {
    if candidate {
        Column::CandidateIndex
    } else {
        Column::ConfirmedIndex
    }
}

fn encode_record(
    header: &BlockHeader,
    median_time_past: u32,
    height: u32,
    state: u8,
    code: u32,
) -> Vec<u8> {
    let mut encoder = Encoder::new();
    header.consensus_encode(&mut encoder);
    encoder.write_u32_le(median_time_past);
    encoder.write_u32_le(height);
    encoder.write_u8(state);
    encoder.write_u32_le(code);
    let bytes = encoder.into_inner();
    debug_assert_eq!(bytes.len(), BLOCK_RECORD_LEN);
    bytes
}

fn decode_record(bytes: &[u8]) -> Result<(BlockHeader, u32, u32, u8, u32), StoreError> {
    if bytes.len() != BLOCK_RECORD_LEN {
        return Err(StoreError::Backend("invalid block record".into()));
    }
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::consensus_decode(&mut decoder)
        .map_err(|err| StoreError::Backend(err.to_string()))?;
    let median_time_past = decoder
        .read_u32_le()
        .map_err(|err| StoreError::Backend(err.to_string()))?;
    let height = decoder
        .read_u32_le()
        .map_err(|err| StoreError::Backend(err.to_string()))?;
    let state = decoder
        .read_u8()
        .map_err(|err| StoreError::Backend(err.to_string()))?;
    let code = decoder
        .read_u32_le()
        .map_err(|err| StoreError::Backend(err.to_string()))?;
    Ok((header, median_time_past, height, state, code))
}
