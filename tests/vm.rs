use qcoreth::atomic::{AtomicTxError, EvmInput, ExportTx, Tx, UnsignedAtomicTx};
use qcoreth::avax::{TransferableOutput, Utxo, UtxoId};
use qcoreth::block::{BlockError, SnowmanBlock, Status};
use qcoreth::chain::{EngineError, EthBlock, EthTx, EvmEngine, Header};
use qcoreth::codec::Codec;
use qcoreth::common::{Addr, Bytes, Hash, Id, ShortId, Wei, U256};
use qcoreth::db::AcceptedIndex;
use qcoreth::mempool::TxIntake;
use qcoreth::processor::ProcessError;
use qcoreth::secp256k1fx::{OutputOwners, PrivateKey, TransferOutput};
use qcoreth::shared_memory::{Element, SharedMemory};
use qcoreth::state::StateDB;
use qcoreth::vm::{EngineMessage, VmError};
use qcoreth_tools::*;

const CONFIG: &str = r#"{"tx_fee": 1, "min_gas_price": 100}"#;

fn evm(amount: u64) -> U256 {
    U256::from(amount) * U256::from(1_000_000_000u64)
}

fn eth_addr(key: &PrivateKey) -> Addr {
    key.public_key().eth_address()
}

fn x_addr() -> ShortId {
    test_key(9).public_key().address()
}

fn setup(alloc: &[(Addr, U256)]) -> TestVm {
    let _ = env_logger::builder().is_test(true).try_init();
    match TestVm::new(alloc, CONFIG) {
        Ok(t) => t,
        Err(e) => panic!("cannot start vm: {}", e),
    }
}

fn balance_at(t: &TestVm, block: &Id, addr: &Addr) -> U256 {
    t.engine
        .block_state(&Hash::from(*block))
        .unwrap()
        .get_balance(addr)
}

/// Put a UTXO owned by `key` into the C-Chain's inbound partition.
async fn fund(t: &TestVm, tx: u8, key: &PrivateKey, amt: u64) -> Utxo {
    let owner = key.public_key().address();
    let utxo = Utxo {
        utxo_id: UtxoId {
            tx_id: Id::new([tx; 32]),
            output_index: 0,
        },
        asset_id: avax_asset_id(),
        out: TransferOutput {
            amt,
            owners: OutputOwners::new(0, 1, vec![owner.clone()]),
        },
    };
    t.x_shared_memory
        .put(
            &c_chain_id(),
            vec![Element {
                key: utxo.input_id().as_bytes().to_vec(),
                value: Codec::marshal(&utxo),
                traits: vec![owner.as_bytes().to_vec()],
            }],
        )
        .await
        .unwrap();
    utxo
}

fn export(t: &TestVm, key: &PrivateKey, amount: u64) -> Tx {
    t.vm
        .new_export_tx(avax_asset_id(), amount, x_chain_id(), x_addr(), &[key.clone()])
        .unwrap()
}

#[tokio::test]
async fn test_export_happy_path() {
    let key = test_key(1);
    let a = eth_addr(&key);
    let t = setup(&[(a.clone(), evm(100))]);

    let tx = export(&t, &key, 10);
    let tx_id = *tx.id();
    t.vm.issue_tx(tx).unwrap();
    assert_eq!(t.messages.try_recv(), Ok(EngineMessage::PendingTxs));

    let b1 = t.vm.build_block().await.unwrap();
    assert_eq!(b1.atomic_tx().map(|tx| *tx.id()), Some(tx_id));
    assert_eq!(b1.parent_id(), t.vm.genesis_id());
    assert_eq!(b1.status(), Status::Processing);
    b1.verify().await.unwrap();
    b1.accept().await.unwrap();

    assert_eq!(b1.status(), Status::Accepted);
    assert_eq!(t.vm.last_accepted(), b1.id());
    assert!(t.engine.is_accepted(&b1.eth_block().hash()));
    assert!(t.vm.mempool().is_empty());
    assert_eq!(balance_at(&t, &b1.id(), &a), evm(89));

    // exactly one UTXO shows up on the X-Chain side
    let values = t
        .x_shared_memory
        .indexed(&c_chain_id(), &[x_addr().as_bytes().to_vec()], 10)
        .await
        .unwrap();
    assert_eq!(values.len(), 1);
    let utxo: Utxo = Codec::unmarshal(&values[0]).unwrap();
    assert_eq!(utxo.out.amt, 10);
    assert_eq!(utxo.out.addresses(), &[x_addr()]);
    let key = UtxoId {
        tx_id,
        output_index: 0,
    }
    .input_id();
    assert_eq!(
        t.x_shared_memory
            .get(&c_chain_id(), &[key.as_bytes().to_vec()])
            .await
            .unwrap(),
        vec![Some(values[0].clone())]
    );
}

#[tokio::test]
async fn test_import_happy_path() {
    let key = test_key(1);
    let a = eth_addr(&key);
    let t = setup(&[(a.clone(), evm(100))]);
    t.vm.ctx().set_bootstrapped(true);
    let u = fund(&t, 2, &key, 20).await;

    let owned = t
        .vm
        .get_atomic_utxos(&x_chain_id(), &[key.public_key().address()], 10)
        .await
        .unwrap();
    assert_eq!(owned, vec![u.clone()]);

    let tx = t
        .vm
        .new_import_tx(x_chain_id(), a.clone(), &[key.clone()])
        .await
        .unwrap();
    assert_eq!(tx.input_utxos().len(), 1);
    assert!(tx.input_utxos().contains(&u.input_id()));
    t.vm.issue_tx(tx).unwrap();

    let b2 = t.vm.build_block().await.unwrap();
    b2.verify().await.unwrap();
    b2.accept().await.unwrap();

    // the fee comes out of the imported amount
    assert_eq!(balance_at(&t, &b2.id(), &a), evm(100) + evm(19));
    assert_eq!(
        t.shared_memory
            .get(&x_chain_id(), &[u.input_id().as_bytes().to_vec()])
            .await
            .unwrap(),
        vec![None]
    );
    assert!(t
        .vm
        .get_atomic_utxos(&x_chain_id(), &[key.public_key().address()], 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_sibling_import_conflict() {
    let key = test_key(1);
    let a = eth_addr(&key);
    let t = setup(&[(a.clone(), evm(100))]);
    t.vm.ctx().set_bootstrapped(true);
    let u = fund(&t, 2, &key, 20).await;

    let tx = t
        .vm
        .new_import_tx(x_chain_id(), a, &[key])
        .await
        .unwrap();
    t.vm.issue_tx(tx.clone()).unwrap();
    let s1 = t.vm.build_block().await.unwrap();
    t.vm.issue_tx(tx).unwrap();
    let s2 = t.vm.build_block().await.unwrap();
    assert_ne!(s1.id(), s2.id());
    assert_eq!(s1.parent_id(), t.vm.genesis_id());
    assert_eq!(s2.parent_id(), t.vm.genesis_id());

    s1.verify().await.unwrap();
    s2.verify().await.unwrap();
    s1.accept().await.unwrap();

    assert_eq!(
        s2.verify().await,
        Err(BlockError::AtomicInputConflict(u.input_id()))
    );
    s2.reject().await.unwrap();
    assert_eq!(s2.status(), Status::Rejected);
}

#[tokio::test]
async fn test_export_nonce_mismatch_fails_block() {
    let key = test_key(1);
    let a = eth_addr(&key);
    let t = setup(&[(a.clone(), evm(100))]);
    let genesis = t.vm.get_block(&t.vm.genesis_id()).unwrap();

    let unsigned = UnsignedAtomicTx::Export(ExportTx::new(
        NETWORK_ID,
        c_chain_id(),
        x_chain_id(),
        vec![EvmInput {
            address: a.clone(),
            amount: 2,
            asset_id: avax_asset_id(),
            nonce: 4,
        }],
        vec![TransferableOutput {
            asset_id: avax_asset_id(),
            out: TransferOutput {
                amt: 1,
                owners: OutputOwners::new(0, 1, vec![x_addr()]),
            },
        }],
    ));
    let tx = Tx::sign(unsigned, &[vec![key]]);
    let eth = EthBlock::new(
        Header {
            parent_hash: genesis.eth_block().hash(),
            coinbase: Addr::zero().clone(),
            state_root: Hash::zero().clone(),
            tx_root: Hash::zero().clone(),
            number: 1,
            gas_limit: 8_000_000,
            timestamp: 1,
            extra_data: tx.bytes().to_vec().into(),
        },
        Vec::new(),
    );

    let block = t.vm.parse_block(&eth.encode()).unwrap();
    assert_eq!(block.height(), 1);
    assert_eq!(
        block.verify().await,
        Err(BlockError::Process(ProcessError::Atomic(
            AtomicTxError::InvalidNonce {
                address: a,
                expected: 0,
                got: 4
            }
        )))
    );
}

#[tokio::test]
async fn test_gas_price_gate() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    let cheap = EthTx::signed(
        0,
        Wei::from(99u64),
        21000,
        Some(Addr::from([9; 20])),
        Wei::from(1u64),
        Bytes::empty(),
        EVM_CHAIN_ID,
        |h| key.sign_hash(h),
    );
    let hash = cheap.hash();
    t.engine.add_pending(cheap);

    let block = t.vm.build_block().await.unwrap();
    assert!(block.atomic_tx().is_none());
    assert_eq!(block.eth_block().txs.len(), 1);
    // the gate is off while bootstrapping
    assert_eq!(block.verify().await, Ok(()));

    t.vm.ctx().set_bootstrapped(true);
    assert_eq!(
        block.verify().await,
        Err(BlockError::InsufficientGasPrice {
            tx: hash,
            price: Wei::from(99u64)
        })
    );
}

#[tokio::test]
async fn test_reject_and_reissue() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    let tx = export(&t, &key, 10);
    let tx_id = *tx.id();
    t.vm.issue_tx(tx).unwrap();

    let b = t.vm.build_block().await.unwrap();
    b.verify().await.unwrap();
    assert!(t.vm.mempool().is_empty());
    b.reject().await.unwrap();
    assert_eq!(b.status(), Status::Rejected);
    assert_eq!(t.vm.mempool().reissue_head(), Some(tx_id));

    t.vm.set_preference(&t.vm.genesis_id()).unwrap();
    let rebuilt = t.vm.build_block().await.unwrap();
    assert_ne!(rebuilt.id(), b.id());
    assert_eq!(rebuilt.atomic_tx().map(|tx| *tx.id()), Some(tx_id));
    rebuilt.verify().await.unwrap();
    rebuilt.accept().await.unwrap();
    assert_eq!(t.vm.last_accepted(), rebuilt.id());
}

#[tokio::test]
async fn test_decisions_are_final() {
    let k1 = test_key(1);
    let k2 = test_key(2);
    let t = setup(&[(eth_addr(&k1), evm(100)), (eth_addr(&k2), evm(100))]);
    t.vm.issue_tx(export(&t, &k1, 10)).unwrap();
    t.vm.issue_tx(export(&t, &k2, 10)).unwrap();
    let s1 = t.vm.build_block().await.unwrap();
    let s2 = t.vm.build_block().await.unwrap();
    assert_eq!(s1.height(), s2.height());
    s1.verify().await.unwrap();
    s2.verify().await.unwrap();

    s1.accept().await.unwrap();
    s2.reject().await.unwrap();
    assert_eq!(
        s2.accept().await,
        Err(BlockError::AlreadyDecided {
            id: s2.id(),
            status: Status::Rejected
        })
    );
    assert_eq!(
        s1.reject().await,
        Err(BlockError::AlreadyDecided {
            id: s1.id(),
            status: Status::Accepted
        })
    );
    assert_eq!(
        s1.accept().await,
        Err(BlockError::AlreadyDecided {
            id: s1.id(),
            status: Status::Accepted
        })
    );
    // rejecting twice is harmless
    assert_eq!(s2.reject().await, Ok(()));
    assert_eq!(s1.status(), Status::Accepted);
    assert_eq!(s2.status(), Status::Rejected);

    // a fresh VM on the same storage reconstructs both decisions
    let t2 = TestVm::with_engine(t.engine.clone(), t.db.clone(), CONFIG).unwrap();
    assert_eq!(t2.vm.last_accepted(), s1.id());
    assert_eq!(t2.vm.get_block(&s1.id()).unwrap().status(), Status::Accepted);
    assert_eq!(t2.vm.get_block(&s2.id()).unwrap().status(), Status::Rejected);
}

#[tokio::test]
async fn test_rejected_descendant_stays_rejected() {
    const SMALL_CACHE: &str =
        r#"{"tx_fee": 1, "min_gas_price": 100, "status_cache_size": 1}"#;
    let _ = env_logger::builder().is_test(true).try_init();
    let (k1, k2, k3) = (test_key(1), test_key(2), test_key(3));
    let t = TestVm::new(
        &[
            (eth_addr(&k1), evm(100)),
            (eth_addr(&k2), evm(100)),
            (eth_addr(&k3), evm(100)),
        ],
        SMALL_CACHE,
    )
    .unwrap();

    t.vm.issue_tx(export(&t, &k1, 10)).unwrap();
    let b1 = t.vm.build_block().await.unwrap();
    let tx2 = export(&t, &k2, 10);
    let tx2_id = *tx2.id();
    t.vm.issue_tx(tx2).unwrap();
    let sibling = t.vm.build_block().await.unwrap();
    b1.verify().await.unwrap();
    sibling.verify().await.unwrap();

    t.vm.set_preference(&sibling.id()).unwrap();
    let tx3 = export(&t, &k3, 10);
    let tx3_id = *tx3.id();
    t.vm.issue_tx(tx3).unwrap();
    let child = t.vm.build_block().await.unwrap();
    assert_eq!(child.parent_id(), sibling.id());
    child.verify().await.unwrap();

    b1.accept().await.unwrap();
    assert_eq!(child.status(), Status::Rejected);
    sibling.reject().await.unwrap();
    child.reject().await.unwrap();
    assert_eq!(t.vm.mempool().reissue_head(), Some(tx2_id));
    assert_eq!(t.vm.mempool().len(), 2);

    // a lookup of b1 pushes the child out of the status cache
    assert_eq!(b1.status(), Status::Accepted);
    assert_eq!(child.status(), Status::Rejected);
    assert_eq!(sibling.status(), Status::Rejected);

    let t2 =
        TestVm::with_engine(t.engine.clone(), t.db.clone(), SMALL_CACHE).unwrap();
    let status = |id: &Id| t2.vm.get_block(id).unwrap().status();
    assert_eq!(status(&child.id()), Status::Rejected);
    assert_eq!(status(&sibling.id()), Status::Rejected);
    assert_eq!(status(&b1.id()), Status::Accepted);

    // both rejected txs find their way into a block again
    t.vm.set_preference(&b1.id()).unwrap();
    let rebuilt = t.vm.build_block().await.unwrap();
    assert_eq!(rebuilt.atomic_tx().map(|tx| *tx.id()), Some(tx2_id));
    assert_eq!(t.vm.mempool().len(), 1);
    assert_eq!(t.vm.mempool().reissue_head(), Some(tx3_id));
}

#[tokio::test]
async fn test_acceptance_index() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    let index = AcceptedIndex::new(t.db.clone());
    assert_eq!(index.get(0), Ok(Some(t.vm.genesis_id())));

    t.vm.issue_tx(export(&t, &key, 10)).unwrap();
    let b1 = t.vm.build_block().await.unwrap();
    b1.verify().await.unwrap();
    t.vm.set_preference(&b1.id()).unwrap();

    // built on b1's post-state, so the nonce moved on
    t.vm.issue_tx(export(&t, &key, 5)).unwrap();
    let b2 = t.vm.build_block().await.unwrap();
    assert_eq!(b2.parent_id(), b1.id());
    b2.verify().await.unwrap();

    assert_eq!(
        b2.accept().await,
        Err(BlockError::ParentNotLastAccepted {
            parent: b1.id(),
            last_accepted: t.vm.genesis_id()
        })
    );
    b1.accept().await.unwrap();
    b2.accept().await.unwrap();

    for b in [&b1, &b2] {
        assert_eq!(index.get(b.height()), Ok(Some(b.id())));
    }
    assert_eq!(index.last_accepted(), Ok(Some(b2.id())));
    assert_eq!(balance_at(&t, &b2.id(), &eth_addr(&key)), evm(100 - 11 - 6));

    let t2 = TestVm::with_engine(t.engine.clone(), t.db.clone(), CONFIG).unwrap();
    assert_eq!(t2.vm.last_accepted(), b2.id());
    assert_eq!(t2.vm.preferred(), b2.id());
}

#[tokio::test]
async fn test_accept_survives_shared_memory_failure() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    t.vm.issue_tx(export(&t, &key, 10)).unwrap();
    let b = t.vm.build_block().await.unwrap();
    b.verify().await.unwrap();

    t.shared_memory.set_unavailable(true);
    let err = b.accept().await.unwrap_err();
    assert!(err.is_temporary());
    assert_eq!(b.status(), Status::Processing);
    assert_eq!(t.vm.last_accepted(), t.vm.genesis_id());
    assert_eq!(AcceptedIndex::new(t.db.clone()).get(1), Ok(None));
    assert!(!t.engine.is_accepted(&b.eth_block().hash()));

    t.shared_memory.set_unavailable(false);
    b.accept().await.unwrap();
    assert_eq!(b.status(), Status::Accepted);
}

#[tokio::test]
async fn test_accept_commits_even_if_engine_does_not_follow() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    let tx = export(&t, &key, 10);
    t.vm.issue_tx(tx).unwrap();
    // never verified, so the engine has not seen it
    let b = t.vm.build_block().await.unwrap();

    assert_eq!(
        b.accept().await,
        Err(BlockError::Engine(EngineError::UnknownBlock(
            b.eth_block().hash()
        )))
    );
    assert_eq!(t.vm.last_accepted(), b.id());
    assert_eq!(b.status(), Status::Accepted);
    assert_eq!(AcceptedIndex::new(t.db.clone()).get(1), Ok(Some(b.id())));
    assert!(t.vm.mempool().is_empty());
    assert_eq!(
        b.accept().await,
        Err(BlockError::AlreadyDecided {
            id: b.id(),
            status: Status::Accepted
        })
    );
}

#[tokio::test]
async fn test_unreadable_import_waits_for_shared_memory() {
    let key = test_key(1);
    let a = eth_addr(&key);
    let t = setup(&[(a.clone(), evm(100))]);
    t.vm.ctx().set_bootstrapped(true);
    fund(&t, 2, &key, 20).await;
    let tx = t.vm.new_import_tx(x_chain_id(), a, &[key]).await.unwrap();
    let tx_id = *tx.id();
    t.vm.issue_tx(tx).unwrap();

    t.shared_memory.set_unavailable(true);
    for _ in 0..2 {
        assert!(matches!(
            t.vm.build_block().await,
            Err(VmError::EmptyBlock)
        ));
        assert_eq!(t.vm.mempool().len(), 1);
    }

    t.shared_memory.set_unavailable(false);
    let b = t.vm.build_block().await.unwrap();
    assert_eq!(b.atomic_tx().map(|tx| *tx.id()), Some(tx_id));
    b.verify().await.unwrap();
    assert!(t.vm.mempool().is_empty());
}

#[tokio::test]
async fn test_build_empty_block() {
    let t = setup(&[]);
    assert!(matches!(
        t.vm.build_block().await,
        Err(VmError::EmptyBlock)
    ));
}

#[tokio::test]
async fn test_parse_and_lookup() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    t.vm.issue_tx(export(&t, &key, 10)).unwrap();
    let b = t.vm.build_block().await.unwrap();

    let parsed = t.vm.parse_block(&b.bytes()).unwrap();
    assert_eq!(parsed.id(), b.id());
    assert_eq!(
        parsed.atomic_tx().map(|tx| *tx.id()),
        b.atomic_tx().map(|tx| *tx.id())
    );
    assert_eq!(parsed.parent().id(), t.vm.genesis_id());
    assert!(matches!(
        t.vm.parse_block(&[0xc0, 0x01]),
        Err(VmError::MalformedBlock(_))
    ));

    let unknown = Id::new([0x42; 32]);
    assert!(t.vm.get_block(&unknown).is_none());
    assert!(matches!(
        t.vm.set_preference(&unknown),
        Err(VmError::UnknownBlock(_))
    ));
}

#[tokio::test]
async fn test_tx_builders_reject_what_they_cannot_fund() {
    let key = test_key(1);
    let a = eth_addr(&key);
    let t = setup(&[(a.clone(), evm(100))]);

    let avax = avax_asset_id();
    assert!(matches!(
        t.vm.new_export_tx(avax, 100, x_chain_id(), x_addr(), &[key.clone()]),
        Err(VmError::InsufficientFunds(id)) if id == avax
    ));
    assert!(matches!(
        t.vm.new_export_tx(avax, 1, c_chain_id(), x_addr(), &[key.clone()]),
        Err(VmError::Atomic(AtomicTxError::WrongChainId))
    ));
    assert!(matches!(
        t.vm.new_import_tx(x_chain_id(), a, &[key]).await,
        Err(VmError::Atomic(AtomicTxError::NoImportInputs))
    ));
}

#[tokio::test]
async fn test_issue_rejects_duplicates() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    let tx = export(&t, &key, 10);
    t.vm.issue_tx(tx.clone()).unwrap();
    assert!(matches!(t.vm.issue_tx(tx), Err(VmError::Mempool(_))));
    assert_eq!(t.vm.mempool().len(), 1);
}

#[tokio::test]
async fn test_tx_intake() {
    let key = test_key(1);
    let t = setup(&[(eth_addr(&key), evm(100))]);
    let tx = export(&t, &key, 10);

    let intake = TxIntake::spawn(t.vm.clone(), 4);
    intake.submit(vec![1, 2, 3]).unwrap();
    intake.submit(tx.bytes().to_vec()).unwrap();
    intake.shutdown();

    assert_eq!(t.vm.mempool().len(), 1);
    assert_eq!(t.messages.try_recv(), Ok(EngineMessage::PendingTxs));
}
