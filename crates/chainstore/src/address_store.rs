//! Inverted index from payment-script hash to payment records.
//!
//! Each confirmed output contributes a row carrying its value; each input
//! with a resolvable prevout script contributes a row carrying the prevout
//! checksum. Rows are keyed by the 20-byte script hash plus an append
//! sequence, so a prefix scan returns a script's history in insertion order.

use std::sync::Mutex;

use ledgerdb_primitives::hash::hash160;
use ledgerdb_primitives::{OutPoint, Transaction, TxLink, TxOut};
use ledgerdb_storage::{Column, KeyValueStore, StoreError};

const META_NEXT_ROW: &[u8] = b"addresses:next_row";

pub const SCRIPT_HASH_LEN: usize = 20;

pub fn script_hash(script_pubkey: &[u8]) -> [u8; SCRIPT_HASH_LEN] {
    hash160(script_pubkey)
}

const PAYMENT_RECORD_LEN: usize = 21;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaymentRecord {
    pub link: TxLink,
    pub index: u32,
    pub value: u64,
    pub is_output: bool,
}

impl PaymentRecord {
    pub fn encode(&self) -> [u8; PAYMENT_RECORD_LEN] {
        let mut out = [0u8; PAYMENT_RECORD_LEN];
        out[0..8].copy_from_slice(&self.link.to_le_bytes());
        out[8..12].copy_from_slice(&self.index.to_le_bytes());
        out[12..20].copy_from_slice(&self.value.to_le_bytes());
        out[20] = u8::from(self.is_output);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PAYMENT_RECORD_LEN {
            return None;
        }
        let link = TxLink::from_le_bytes(bytes[0..8].try_into().ok()?);
        let index = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
        let value = u64::from_le_bytes(bytes[12..20].try_into().ok()?);
        let is_output = bytes[20] != 0;
        Some(Self {
            link,
            index,
            value,
            is_output,
        })
    }
}

pub struct AddressStore<S> {
    store: S,
    next_row: Mutex<u64>,
}

impl<S: KeyValueStore> AddressStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            next_row: Mutex::new(0),
        }
    }

    pub fn create(&self) -> Result<(), StoreError> {
        if self.store.get(Column::Meta, META_NEXT_ROW)?.is_some() {
            return Err(StoreError::Backend("address store already exists".into()));
        }
        self.store
            .put(Column::Meta, META_NEXT_ROW, &0u64.to_le_bytes())?;
        *self.next_row.lock().expect("address row counter") = 0;
        Ok(())
    }

    pub fn open(&self) -> Result<(), StoreError> {
        let bytes = self
            .store
            .get(Column::Meta, META_NEXT_ROW)?
            .ok_or_else(|| StoreError::Backend("address store not created".into()))?;
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid address row counter".into()))?;
        *self.next_row.lock().expect("address row counter") = u64::from_le_bytes(bytes);
        Ok(())
    }

    pub fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StoreError> {
        let next = *self.next_row.lock().expect("address row counter");
        self.store
            .put(Column::Meta, META_NEXT_ROW, &next.to_le_bytes())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    /// Append a payment row for a script hash.
    pub fn store(
        &self,
        script_hash: &[u8; SCRIPT_HASH_LEN],
        record: &PaymentRecord,
    ) -> Result<bool, StoreError> {
        let row = {
            let mut next = self.next_row.lock().expect("address row counter");
            let row = *next;
            *next += 1;
            row
        };
        let mut key = [0u8; SCRIPT_HASH_LEN + 8];
        key[..SCRIPT_HASH_LEN].copy_from_slice(script_hash);
        key[SCRIPT_HASH_LEN..].copy_from_slice(&row.to_be_bytes());
        self.store.put(Column::Payment, &key, &record.encode())?;
        Ok(true)
    }

    /// Index a transaction's payments: one output row per output, one spend
    /// row per input whose prevout script the resolver yields.
    pub fn index<F>(&self, tx: &Transaction, mut resolve_prevout: F) -> Result<bool, StoreError>
    where
        F: FnMut(&OutPoint) -> Result<Option<TxOut>, StoreError>,
    {
        let link = tx.metadata.link;
        debug_assert!(link.is_valid());

        for (index, output) in tx.outputs.iter().enumerate() {
            let record = PaymentRecord {
                link,
                index: index as u32,
                value: output.value as u64,
                is_output: true,
            };
            self.store(&script_hash(&output.script_pubkey), &record)?;
        }

        if tx.is_coinbase() {
            return Ok(true);
        }

        for (index, input) in tx.inputs.iter().enumerate() {
            let Some(prevout) = resolve_prevout(&input.prevout)? else {
                continue;
            };
            let record = PaymentRecord {
                link,
                index: index as u32,
                value: input.prevout.checksum(),
                is_output: false,
            };
            self.store(&script_hash(&prevout.script_pubkey), &record)?;
        }
        Ok(true)
    }

    /// All payment rows for a script hash, in insertion order.
    pub fn get(
        &self,
        script_hash: &[u8; SCRIPT_HASH_LEN],
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let entries = self.store.scan_prefix(Column::Payment, script_hash)?;
        let mut records = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            let record = PaymentRecord::decode(&value)
                .ok_or_else(|| StoreError::Backend("invalid payment record".into()))?;
            records.push(record);
        }
        Ok(records)
    }
}
