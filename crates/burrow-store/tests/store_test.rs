//! Concurrency behavior of the embedded store and its registries.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::thread;

use burrow_common::error::BurrowError;
use burrow_store::registry::{Discovery, Node, Registry, StoreRegistry};
use burrow_store::{JsonStore, Store, load_or_store};

#[test]
fn optimistic_increments_never_lose_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(JsonStore::open(&dir.path().join("store.json")).expect("open"));
    let _ = store.put("counter", 0, b"0").unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..25 {
                    loop {
                        let (version, raw) = store.get("counter").unwrap();
                        let n: u64 = String::from_utf8(raw).unwrap().parse().unwrap();
                        match store.put("counter", version, (n + 1).to_string().as_bytes()) {
                            Ok(_) => break,
                            Err(BurrowError::StaleWrite { .. }) => {}
                            Err(e) => panic!("unexpected store error: {e}"),
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let (version, raw) = store.get("counter").unwrap();
    assert_eq!(raw, b"100");
    assert_eq!(version, 101);
}

#[test]
fn concurrent_load_or_store_agrees_on_one_value() {
    let store: Arc<dyn Store> = Arc::new(JsonStore::memory());
    let values: Vec<Vec<u8>> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || load_or_store(store.as_ref(), "id", format!("node-{i}").as_bytes()).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().expect("worker"))
        .collect();
    assert!(values.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn sequences_are_unique_across_threads() {
    let store = Arc::new(JsonStore::memory());
    let mut seen: Vec<u64> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || (0..50).map(|_| store.next_sequence().unwrap()).collect::<Vec<_>>())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flat_map(|h| h.join().expect("worker"))
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 200);
}

#[test]
fn registry_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.json");
    {
        let store: Arc<dyn Store> = Arc::new(JsonStore::open(&path).expect("open"));
        let reg = StoreRegistry::new(store, "cntrs");
        reg.put("n1,1", &Node::at("10.0.0.1:7420")).unwrap();
    }
    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&path).expect("reopen"));
    let reg = StoreRegistry::new(store, "cntrs");
    assert_eq!(reg.get("n1,1").unwrap(), Some(Node::at("10.0.0.1:7420")));
    assert_eq!(reg.list().unwrap().len(), 1);
}
