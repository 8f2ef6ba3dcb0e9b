use std::path::Path;
use std::sync::Arc;

use ledgerdb_chainstore::transaction_store::SPENDER_UNSPENT;
use ledgerdb_chainstore::{ChainError, Settings, Store};
use ledgerdb_primitives::{
    Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, Validation,
};
use ledgerdb_storage::memory::MemoryStore;

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn make_tx(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        inputs,
        outputs,
        lock_time: 0,
        ..Transaction::default()
    }
}

fn coinbase_tx(height: u32) -> Transaction {
    make_tx(
        vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vec![TxOut {
            value: 50_000,
            script_pubkey: p2pkh_script(0x11),
        }],
    )
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
fn three_block_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let coinbase1 = coinbase_tx(1);
    let coinbase1_txid = coinbase1.txid();
    let mut block1 = Block {
        header: make_header(genesis.hash(), 1_700_000_100, 1),
        transactions: vec![coinbase1],
    };
    store.push(&mut block1, 1, 101).expect("push 1");
    assert_eq!(store.blocks().top(true), Some(1));
    assert_eq!(store.blocks().top(false), Some(1));

    let spend = make_tx(
        vec![TxIn {
            prevout: OutPoint {
                hash: coinbase1_txid,
                index: 0,
            },
            script_sig: vec![0x02],
            sequence: u32::MAX,
        }],
        vec![TxOut {
            value: 40_000,
            script_pubkey: p2pkh_script(0x22),
        }],
    );
    let mut block2 = Block {
        header: make_header(block1.hash(), 1_700_000_200, 2),
        transactions: vec![coinbase_tx(2), spend],
    };
    store.push(&mut block2, 2, 102).expect("push 2");

    let mut block3 = Block {
        header: make_header(block2.hash(), 1_700_000_300, 3),
        transactions: vec![coinbase_tx(3)],
    };
    store.push(&mut block3, 3, 103).expect("push 3");

    assert_eq!(store.blocks().top(true), Some(3));
    assert_eq!(store.blocks().top(false), Some(3));

    // Both indices resolve the same linked chain.
    for height in 0..=3u32 {
        let candidate = store
            .blocks()
            .get_at(height, true)
            .expect("get")
            .expect("candidate entry");
        let confirmed = store
            .blocks()
            .get_at(height, false)
            .expect("get")
            .expect("confirmed entry");
        assert_eq!(candidate.hash, confirmed.hash);
        if height > 0 {
            let parent = store
                .blocks()
                .get_at(height - 1, true)
                .expect("get")
                .expect("parent entry");
            assert_eq!(candidate.header.prev_block, parent.hash);
        }
    }

    // The spend in block 2 is confirmed at height 2 in position 1.
    let spend_link = block2.transactions[1].metadata.link;
    let spend_result = store
        .transactions()
        .get(spend_link)
        .expect("get")
        .expect("spend stored");
    assert!(spend_result.is_confirmed());
    assert_eq!(spend_result.height, 2);
    assert_eq!(spend_result.median_time_past, 102);
    assert_eq!(spend_result.position, 1);

    // Its prevout carries the confirming height.
    let funding_link = block1.transactions[0].metadata.link;
    let funding = store
        .transactions()
        .get(funding_link)
        .expect("get")
        .expect("funding stored");
    assert_eq!(funding.spender_heights, vec![2]);

    store.close().expect("close");
}

#[test]
fn push_header_pop_header_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let mut header = make_header(genesis.hash(), 1_700_000_100, 1);
    store.push_header(&mut header, 1, 555).expect("push header");
    assert_eq!(store.blocks().top(true), Some(1));
    assert_eq!(store.blocks().top(false), Some(0));

    let popped = store.pop_header(1).expect("pop header");
    assert_eq!(popped, header);
    assert_eq!(store.blocks().top(true), Some(0));
    assert!(store.blocks().get_at(1, true).expect("get").is_none());

    // The stored record is reused on a second push of the same header.
    assert!(header.metadata.exists);
    store.push_header(&mut header, 1, 555).expect("push again");
    assert_eq!(store.blocks().top(true), Some(1));
    let again = store.pop_header(1).expect("pop again");
    assert_eq!(again, header);
    assert_eq!(store.blocks().top(true), Some(0));

    store.close().expect("close");
}

#[test]
fn push_block_pop_block_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let mut block1 = Block {
        header: make_header(genesis.hash(), 1_700_000_100, 1),
        transactions: vec![coinbase_tx(1)],
    };
    store.push(&mut block1, 1, 777).expect("push");

    let mut popped = store.pop_block(1).expect("pop block");
    assert_eq!(popped.hash(), block1.hash());
    assert_eq!(popped.transactions, block1.transactions);
    assert_eq!(store.blocks().top(false), Some(0));
    // The candidate index is unchanged by a block pop.
    assert_eq!(store.blocks().top(true), Some(1));

    let coinbase_link = popped.transactions[0].metadata.link;
    let unconfirmed = store
        .transactions()
        .get(coinbase_link)
        .expect("get")
        .expect("present");
    assert!(!unconfirmed.is_confirmed());

    store.push_block(&mut popped, 1).expect("push block");
    assert_eq!(store.blocks().top(false), Some(1));
    let confirmed = store
        .transactions()
        .get(coinbase_link)
        .expect("get")
        .expect("present");
    assert!(confirmed.is_confirmed());
    assert_eq!(confirmed.height, 1);
    assert_eq!(confirmed.median_time_past, 777);

    store.close().expect("close");
}

#[test]
fn confirm_then_invalidate_records_verdict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let mut block1 = Block {
        header: make_header(genesis.hash(), 1_700_000_100, 1),
        transactions: vec![coinbase_tx(1)],
    };
    store.push(&mut block1, 1, 101).expect("push");

    store
        .invalidate(&mut block1.header, 4242)
        .expect("invalidate");
    assert_eq!(block1.header.metadata.validation, Validation::Failed(4242));

    let result = store
        .blocks()
        .get(&block1.hash())
        .expect("get")
        .expect("present");
    assert_eq!(result.error_code, 4242);
    assert_eq!(result.validation(), Validation::Failed(4242));

    // The verdict does not unwind confirmation.
    assert_eq!(store.blocks().top(false), Some(1));
    assert_eq!(
        store
            .blocks()
            .get_at(1, false)
            .expect("get")
            .expect("present")
            .hash,
        block1.hash()
    );

    store.close().expect("close");
}

#[test]
fn update_binds_transactions_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    // Confirm the bare header first; associations come later.
    let header = make_header(genesis.hash(), 1_700_000_100, 1);
    let mut bare = Block {
        header: header.clone(),
        transactions: Vec::new(),
    };
    store.push(&mut bare, 1, 101).expect("push bare header");
    assert_eq!(
        store
            .blocks()
            .get(&bare.hash())
            .expect("get")
            .expect("present")
            .transaction_count(),
        0
    );

    let mut full = Block {
        header,
        transactions: vec![coinbase_tx(1)],
    };
    store.update(&mut full, 1).expect("update");

    let result = store
        .blocks()
        .get(&full.hash())
        .expect("get")
        .expect("present");
    assert_eq!(result.transaction_count(), 1);
    let link = full.transactions[0].metadata.link;
    assert!(store.transactions().get(link).expect("get").is_some());

    // A second update is refused once associations exist.
    let mut again = full.clone();
    assert_eq!(store.update(&mut again, 1), Err(ChainError::OperationFailed));

    store.close().expect("close");
}

#[test]
fn candidate_marks_transactions_and_spent_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let mut funding = coinbase_tx(1);
    store.store_transaction(&mut funding, 0).expect("store");
    let mut spend = make_tx(
        vec![TxIn {
            prevout: OutPoint {
                hash: funding.txid(),
                index: 0,
            },
            script_sig: vec![0x02],
            sequence: u32::MAX,
        }],
        vec![TxOut {
            value: 40_000,
            script_pubkey: p2pkh_script(0x22),
        }],
    );
    store.store_transaction(&mut spend, 0).expect("store");

    let mut header = make_header(genesis.hash(), 1_700_000_100, 1);
    store.push_header(&mut header, 1, 101).expect("push header");

    let mut block = Block {
        header,
        transactions: vec![funding.clone(), spend.clone()],
    };
    store.candidate(&mut block).expect("candidate");
    assert_eq!(block.header.metadata.validation, Validation::Valid);

    let marked = store
        .transactions()
        .get(spend.metadata.link)
        .expect("get")
        .expect("present");
    assert!(marked.candidate);
    let funded = store
        .transactions()
        .get(funding.metadata.link)
        .expect("get")
        .expect("present");
    assert_eq!(funded.candidate_spends, vec![true]);
    assert_eq!(funded.spender_heights, vec![SPENDER_UNSPENT]);

    // A failed header cannot re-enter the candidate path.
    store
        .invalidate(&mut block.header, 9)
        .expect("invalidate");
    assert_eq!(
        store.candidate(&mut block),
        Err(ChainError::OperationFailed)
    );

    store.close().expect("close");
}

#[test]
fn address_index_tracks_payments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings {
        index_addresses: true,
        ..Settings::with_directory(dir.path())
    };
    let store = Store::new(Arc::new(MemoryStore::new()), settings);
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    let funding_script = p2pkh_script(0x11);
    let spend_script = p2pkh_script(0x22);

    let coinbase1 = coinbase_tx(1);
    let coinbase1_txid = coinbase1.txid();
    let mut block1 = Block {
        header: make_header(genesis.hash(), 1_700_000_100, 1),
        transactions: vec![coinbase1],
    };
    store.push(&mut block1, 1, 101).expect("push 1");
    store.index_block(&block1).expect("index 1");

    let spend = make_tx(
        vec![TxIn {
            prevout: OutPoint {
                hash: coinbase1_txid,
                index: 0,
            },
            script_sig: vec![0x02],
            sequence: u32::MAX,
        }],
        vec![TxOut {
            value: 40_000,
            script_pubkey: spend_script.clone(),
        }],
    );
    let mut block2 = Block {
        header: make_header(block1.hash(), 1_700_000_200, 2),
        transactions: vec![coinbase_tx(2), spend],
    };
    store.push(&mut block2, 2, 102).expect("push 2");
    store.index_block(&block2).expect("index 2");

    let addresses = store.addresses().expect("address store");
    let script_hash = ledgerdb_chainstore::address_store::script_hash(&funding_script);
    let rows = addresses.get(&script_hash).expect("get rows");
    // One output row from the funding coinbase, one spend row from block 2.
    assert_eq!(rows.len(), 3);
    let output_rows: Vec<_> = rows.iter().filter(|row| row.is_output).collect();
    let spend_rows: Vec<_> = rows.iter().filter(|row| !row.is_output).collect();
    assert_eq!(output_rows.len(), 2);
    assert_eq!(spend_rows.len(), 1);
    assert_eq!(
        spend_rows[0].value,
        OutPoint {
            hash: coinbase1_txid,
            index: 0
        }
        .checksum()
    );

    let spend_hash = ledgerdb_chainstore::address_store::script_hash(&spend_script);
    let spend_outputs = addresses.get(&spend_hash).expect("get rows");
    assert_eq!(spend_outputs.len(), 1);
    assert!(spend_outputs[0].is_output);
    assert_eq!(spend_outputs[0].value, 40_000);

    store.close().expect("close");
}

#[test]
fn index_transaction_without_address_store_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = new_store(dir.path());
    let mut genesis = genesis_block();
    store.create(&mut genesis).expect("create");

    assert!(store.addresses().is_none());
    let mut tx = coinbase_tx(7);
    store.store_transaction(&mut tx, 0).expect("store");
    store.index_transaction(&tx).expect("index");

    store.close().expect("close");
}
