//! Internal stress tests for routing and pooling.
//!
//! These tests verify the client under high concurrency against the mock
//! cluster, including slot migration while commands are in flight.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::cluster::key_slot;
use crate::core::builder::ClientBuilder;
use crate::core::capability::KvClient;
use crate::testing::MockCluster;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commands_share_small_pools() {
    let cluster = MockCluster::start(3).await;
    let client = ClientBuilder::new()
        .address(cluster.endpoint(0).to_string())
        .backup_addresses(cluster.endpoint(1).to_string())
        .pool_size(2)
        .build()
        .await
        .expect("Failed to connect");

    let mut handles = Vec::new();
    for i in 0..300 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("registry:stress:{}", i);
            client.set(&key, i.to_string()).await.unwrap();
            let value = client.get(&key).await.unwrap();
            assert_eq!(value, Some(Bytes::from(i.to_string())));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(client.outstanding_connections(), 0);
    for node in 0..3 {
        assert!(cluster.connections_accepted(node) <= 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commands_survive_slot_migration() {
    let cluster = Arc::new(MockCluster::start(3).await);
    let client = ClientBuilder::new()
        .address(cluster.endpoint(0).to_string())
        .build()
        .await
        .expect("Failed to connect");

    let keys: Vec<String> = (0..50).map(|i| format!("registry:moving:{}", i)).collect();
    for key in &keys {
        client.set(key, "before").await.unwrap();
    }

    let migrator = {
        let cluster = cluster.clone();
        let keys = keys.clone();
        tokio::spawn(async move {
            for key in keys.iter().step_by(3) {
                let slot = key_slot(key.as_bytes());
                let to = (cluster.owner_index(key.as_bytes()) + 1) % 3;
                cluster.migrate_slot(slot, to);
                tokio::task::yield_now().await;
            }
        })
    };

    let mut handles = Vec::new();
    for key in keys.clone() {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                client.set(&key, "after").await.unwrap();
                assert_eq!(client.get(&key).await.unwrap(), Some(Bytes::from("after")));
            }
        }));
    }
    migrator.await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(client.outstanding_connections(), 0);
    // Redirects coalesce onto far fewer refreshes than there were commands.
    assert!(cluster.cluster_slots_calls() < 100);

    let outcome = client
        .scan_with_cancel("registry:moving:*", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.complete);
    assert_eq!(outcome.keys.len(), keys.len());
}
