#![forbid(unsafe_code)]

use std::sync::Arc;

use xtrack_core::{ClaimRecord, Origin};
use xtrack_store::{Inventory, MemoryStore};

fn batch(prefix: &str, n: usize) -> Vec<ClaimRecord> {
    (0..n)
        .map(|i| ClaimRecord {
            gvr: String::new(),
            group: "g".into(),
            kind: "Widget".into(),
            namespace: "team-a".into(),
            name: format!("{prefix}-{i}"),
            creator: Some("alice".into()),
            team: None,
            composition: String::new(),
            source: Origin::Central,
            ready: i % 2 == 0,
            reason: String::new(),
            created_at: Some(chrono::Utc::now()),
            xr_ref: String::new(),
        })
        .collect()
}

// Readers must only ever observe a whole partition: either the full "a"
// batch or the full "b" batch, never a mix.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_half_replaced_partition() {
    let store = Arc::new(MemoryStore::new());
    store.replace_claims("g/v1/widgets", batch("a", 200));

    let writer = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            for round in 0..200 {
                let prefix = if round % 2 == 0 { "b" } else { "a" };
                store.replace_claims("g/v1/widgets", batch(prefix, 200));
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..3 {
        let store = Arc::clone(&store);
        readers.push(tokio::task::spawn_blocking(move || {
            for _ in 0..200 {
                let snap = store.snapshot_claims();
                assert_eq!(snap.len(), 200);
                let first = snap[0].name.split('-').next().unwrap().to_string();
                assert!(snap.iter().all(|c| c.name.starts_with(&first)));
                let _ = store.claim_count();
            }
        }));
    }

    writer.await.unwrap();
    for r in readers {
        r.await.unwrap();
    }
    assert_eq!(store.claim_count(), 200);
}
