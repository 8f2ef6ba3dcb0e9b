use std::path::PathBuf;

/// Store configuration, owned by the embedding application.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Data directory holding the lock files and backend storage.
    pub directory: PathBuf,
    /// Maintain the payment-script address index.
    pub index_addresses: bool,
    /// Flush to disk at the end of every write transaction.
    pub flush_writes: bool,
    /// Sizing hint for the block table, also caps the header record cache.
    pub block_table_buckets: u32,
    /// Sizing hint for the transaction table.
    pub transaction_table_buckets: u32,
    /// Sizing hint for the payment table.
    pub address_table_buckets: u32,
    /// Backend file growth increment, percent.
    pub file_growth_rate: u16,
    /// Transaction record cache entries.
    pub cache_capacity: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("ledgerdb"),
            index_addresses: false,
            flush_writes: false,
            block_table_buckets: 650_503,
            transaction_table_buckets: 1_310_729,
            address_table_buckets: 655_373,
            file_growth_rate: 50,
            cache_capacity: 10_000,
        }
    }
}

impl Settings {
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }
}
