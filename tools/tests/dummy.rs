use std::sync::Arc;

use qcoreth::common::{Addr, Id, U256};
use qcoreth::db::{AcceptedIndex, Database};
use qcoreth::shared_memory::{Element, SharedMemory, SharedMemoryError};
use qcoreth::state::StateDB;
use qcoreth_tools::dummy::*;

fn elem(key: u8, value: u8, owner: u8) -> Element {
    Element {
        key: vec![key],
        value: vec![value],
        traits: vec![vec![owner]],
    }
}

#[tokio::test]
async fn test_shared_memory_partitions() {
    let memory = DummyAtomicMemory::new();
    let a = Id::new([1; 32]);
    let b = Id::new([2; 32]);
    let sm_a = memory.new_shared_memory(a);
    let sm_b = memory.new_shared_memory(b);

    sm_a.put(&b, vec![elem(1, 10, 9), elem(2, 20, 8)]).await.unwrap();
    // a's own view does not see what it sent
    assert_eq!(sm_a.get(&b, &[vec![1]]).await.unwrap(), vec![None]);
    assert_eq!(
        sm_b.get(&a, &[vec![1], vec![3]]).await.unwrap(),
        vec![Some(vec![10]), None]
    );
    assert_eq!(sm_b.indexed(&a, &[vec![8]], 10).await.unwrap(), vec![vec![20]]);
    assert_eq!(
        sm_b.indexed(&a, &[vec![8], vec![9]], 1).await.unwrap(),
        vec![vec![10]]
    );

    sm_b.remove(&a, vec![vec![1]]).await.unwrap();
    assert_eq!(sm_b.get(&a, &[vec![1]]).await.unwrap(), vec![None]);

    sm_b.set_unavailable(true);
    assert!(matches!(
        sm_b.get(&a, &[vec![2]]).await,
        Err(SharedMemoryError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_shared_memory_apply_with_batch() {
    let memory = DummyAtomicMemory::new();
    let a = Id::new([1; 32]);
    let b = Id::new([2; 32]);
    let sm_a = memory.new_shared_memory(a);
    let sm_b = memory.new_shared_memory(b);
    let db = Arc::new(DummyDatabase::new());
    let index = AcceptedIndex::new(db.clone());

    let mut requests = std::collections::HashMap::new();
    requests.insert(
        b,
        qcoreth::shared_memory::Requests {
            put_requests: vec![elem(1, 10, 9)],
            ..Default::default()
        },
    );
    sm_a.apply(requests.clone(), Some(index.accept_batch(1, &a)))
        .await
        .unwrap();
    assert_eq!(index.get(1).unwrap(), Some(a));
    assert_eq!(sm_b.get(&a, &[vec![1]]).await.unwrap(), vec![Some(vec![10])]);

    // a failing batch leaves shared memory untouched
    requests.get_mut(&b).unwrap().put_requests = vec![elem(2, 20, 9)];
    db.close();
    assert!(sm_a
        .apply(requests, Some(index.accept_batch(2, &b)))
        .await
        .is_err());
    assert_eq!(sm_b.get(&a, &[vec![2]]).await.unwrap(), vec![None]);
    assert!(db.get(b"anything").is_err());
}

#[test]
fn test_state_snapshot_and_root() {
    let addr = Addr::from([5; 20]);
    let coin = Id::new([3; 32]);
    let mut s = DummyState::with_balances(&[(addr.clone(), U256::from(100u64))]);
    let root0 = s.root();
    let snap = s.snapshot();
    s.sub_balance(&addr, &U256::from(30u64));
    s.add_balance_multi_coin(&addr, &coin, &U256::from(7u64));
    s.set_nonce(&addr, 1);
    assert_eq!(s.get_balance(&addr), U256::from(70u64));
    assert_eq!(s.get_balance_multi_coin(&addr, &coin), U256::from(7u64));
    assert_eq!(snap.get_balance(&addr), U256::from(100u64));
    assert_eq!(snap.get_nonce(&addr), 0);
    assert_eq!(snap.root(), root0);
    assert_ne!(s.root(), root0);
}

#[test]
fn test_random_state_cross_validate() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let addrs: Vec<Addr> = (0..8u8).map(|i| Addr::from([i; 20])).collect();
    let coin = Id::new([3; 32]);
    let mut s1 = DummyState::new();
    let mut s2 = DummyState::new();
    let mut snap = s1.snapshot();
    let mut snap_root = snap.root();
    for round in 0..500 {
        let addr = &addrs[rng.gen_range(0..addrs.len())];
        let amount = U256::from(rng.gen_range(0..1000u64));
        let op = rng.gen_range(0..5);
        for s in [&mut s1, &mut s2] {
            match op {
                0 => s.add_balance(addr, &amount),
                1 => s.sub_balance(addr, &amount),
                2 => s.add_balance_multi_coin(addr, &coin, &amount),
                3 => s.sub_balance_multi_coin(addr, &coin, &amount),
                _ => {
                    let n = s.get_nonce(addr);
                    s.set_nonce(addr, n + 1)
                }
            }
        }
        assert_eq!(s1.root(), s2.root());
        assert_eq!(snap.root(), snap_root);
        if round % 50 == 0 {
            snap = s1.snapshot();
            snap_root = s1.root();
        }
    }
}
