use std::path::Path;
use std::sync::Arc;

use ledgerdb_chainstore::lock::FLUSH_LOCK_FILE;
use ledgerdb_chainstore::{ChainError, Settings, Store};
use ledgerdb_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use ledgerdb_storage::memory::MemoryStore;

fn coinbase_tx(height: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50_000,
            script_pubkey: vec![0x51],
        }],
        ..Transaction::default()
    }
}

fn make_header(prev_block: [u8; 32], time: u32, tag: u8) -> BlockHeader {
    BlockHeader {
        version: 4,
        prev_block,
        merkle_root: [tag; 32],
        time,
        bits: 0x1d00_ffff,
        nonce: u32::from(tag),
        ..BlockHeader::default()
    }
}

fn genesis_block() -> Block {
    Block {
        header: make_header([0u8; 32], 1_700_000_000, 0),
        transactions: vec![coinbase_tx(0)],
    }
}

fn new_store(directory: &Path) -> Store<MemoryStore> {
    Store::new(
        Arc::new(MemoryStore::new()),
        Settings::with_directory(directory),
    )
}

#[test]
fn genesis_bootstrap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    assert_eq!(store.blocks().top(true), Some(0));
    assert_eq!(store.blocks().top(false), Some(0));
    let candidate = store
        .blocks()
        .get_at(0, true)
        .expect("get")
        .expect("genesis candidate");
    assert_eq!(candidate.hash, genesis.hash());
    let confirmed = store
        .blocks()
        .get_at(0, false)
        .expect("get")
        .expect("genesis confirmed");
    assert_eq!(confirmed.hash, genesis.hash());
    assert_eq!(confirmed.transaction_count(), 1);

    store.close().expect("close");
    assert!(!dir.path().join(FLUSH_LOCK_FILE).exists());
}

#[test]
fn close_is_idempotent_and_reopenable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    store.close().expect("first close");
    store.close().expect("second close");
    store.close().expect("third close");

    store.open().expect("reopen");
    assert_eq!(store.blocks().top(false), Some(0));
    store.close().expect("close after reopen");
}

#[test]
fn flush_runs_while_closed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");
    store.close().expect("close");

    // A flush skipped because the store is closed would silently drop the
    // race against close; it must still run and report its result.
    store.flush().expect("flush while closed");
}

#[test]
fn open_refuses_stale_flush_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");
    store.close().expect("close");

    std::fs::write(dir.path().join(FLUSH_LOCK_FILE), b"").expect("write sentinel");
    assert_eq!(store.open(), Err(ChainError::StoreLockFailure));

    std::fs::remove_file(dir.path().join(FLUSH_LOCK_FILE)).expect("remove sentinel");
    store.open().expect("open after recovery");
    store.close().expect("close");
}

#[test]
fn second_store_cannot_open_locked_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let other = new_store(dir.path());
    assert_eq!(other.open(), Err(ChainError::StoreLockFailure));

    store.close().expect("close");
}

#[test]
fn duplicate_transaction_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let mut tx = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint {
                hash: [5u8; 32],
                index: 0,
            },
            script_sig: vec![0x01],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 10,
            script_pubkey: vec![0x51],
        }],
        ..Transaction::default()
    };
    store.store_transaction(&mut tx, 3).expect("store");
    let link = tx.metadata.link;

    let mut duplicate = tx.clone();
    assert_eq!(
        store.store_transaction(&mut duplicate, 3),
        Err(ChainError::DuplicateTransaction)
    );

    // Exactly one record exists for the hash.
    let result = store
        .transactions()
        .get_by_hash(&tx.txid())
        .expect("get")
        .expect("present");
    assert_eq!(result.link, link);
    assert_eq!(result.height, 3);

    store.close().expect("close");
}
