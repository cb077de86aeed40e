//! Benchmarks for cluster routing, scans and slot computation.
//!
//! Commands run against the in-process mock cluster, so no external
//! deployment is needed.
//!
//! Run benchmarks:
//! ```bash
//! cargo bench --bench cluster_benchmark --features test-utils
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shardis::cluster::topology::ClusterTopology;
use shardis::testing::MockCluster;
use shardis::{key_slot, ClusterClient, Cmd, Endpoint, KvClient};
use tokio::runtime::Runtime;

/// Starts a mock cluster and a client connected to it.
fn create_client(rt: &Runtime, nodes: usize) -> (MockCluster, ClusterClient) {
    rt.block_on(async {
        let cluster = MockCluster::start(nodes).await;
        let client = ClusterClient::connect(cluster.client_config())
            .await
            .expect("failed to connect to mock cluster");
        (cluster, client)
    })
}

/// Benchmark: SET operation with different value sizes.
fn bench_cluster_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_set");
    let rt = Runtime::new().unwrap();
    let (_cluster, client) = create_client(&rt, 3);

    for size in [64, 1024, 16384].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let value = Bytes::from(vec![b'x'; size]);
            let key = format!("bench:set:{}", size);

            b.to_async(&rt).iter(|| async {
                client
                    .set(black_box(&key), black_box(value.clone()))
                    .await
                    .expect("SET failed");
            });
        });
    }

    group.finish();
}

/// Benchmark: HSET and HGETALL on a registry-style hash.
fn bench_cluster_hash(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_cluster, client) = create_client(&rt, 3);

    rt.block_on(async {
        for i in 0..32 {
            client
                .hset("bench:registry", &format!("10.0.0.{}:20880", i), "1")
                .await
                .expect("failed to prepare data");
        }
    });

    c.bench_function("cluster_hset", |b| {
        b.to_async(&rt).iter(|| async {
            client
                .hset(black_box("bench:registry"), "10.0.0.1:20880", "2")
                .await
                .expect("HSET failed");
        });
    });

    c.bench_function("cluster_hgetall_32", |b| {
        b.to_async(&rt).iter(|| async {
            client
                .hgetall(black_box("bench:registry"))
                .await
                .expect("HGETALL failed");
        });
    });
}

/// Benchmark: Cluster-wide scan.
fn bench_cluster_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_scan");
    let rt = Runtime::new().unwrap();

    for nodes in [1, 3, 6].iter() {
        let (cluster, client) = create_client(&rt, *nodes);
        for node in 0..*nodes {
            for key in cluster.keys_on(node, "bench:scan:", 200) {
                cluster.insert_string(&key, "1");
            }
        }
        group.bench_with_input(BenchmarkId::from_parameter(nodes), nodes, |b, _| {
            b.to_async(&rt).iter(|| async {
                client.scan(black_box("bench:scan:*")).await.expect("SCAN failed");
            });
        });
    }

    group.finish();
}

/// Benchmark: Slot calculation.
fn bench_slot_calculation(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_calculation");

    // Short key
    group.bench_function("short_key", |b| {
        b.iter(|| key_slot(black_box(b"key")));
    });

    // Long key
    group.bench_function("long_key", |b| {
        let key = "a".repeat(100);
        b.iter(|| key_slot(black_box(key.as_bytes())));
    });

    // Key with hash tag
    group.bench_function("hash_tag", |b| {
        b.iter(|| key_slot(black_box(b"user:{12345}:profile")));
    });

    group.finish();
}

/// Benchmark: Slot lookup and multi-key checks.
fn bench_slot_lookup(c: &mut Criterion) {
    let ranges = (0..6u16)
        .map(|i| {
            let start = i * 2731;
            let end = if i == 5 { 16383 } else { start + 2730 };
            (start, end, Endpoint::new("127.0.0.1", 7000 + i))
        })
        .collect();
    let topology = ClusterTopology::from_slot_ranges(1, ranges).expect("valid ranges");

    c.bench_function("node_for_slot", |b| {
        b.iter(|| topology.node_for_slot(black_box(key_slot(b"registry:providers"))));
    });

    let cmd = Cmd::new("DEL")
        .key("{tag}:key1")
        .key("{tag}:key2")
        .key("{tag}:key3")
        .key("{tag}:key4")
        .key("{tag}:key5");
    c.bench_function("command_slot_5_keys", |b| {
        b.iter(|| shardis::cluster::dispatcher::Dispatcher::command_slot(black_box(&cmd)));
    });
}

/// Benchmark: Concurrent operations.
fn bench_concurrent_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_operations");
    let rt = Runtime::new().unwrap();
    let (_cluster, client) = create_client(&rt, 3);

    for num_tasks in [1, 10, 50].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_tasks),
            num_tasks,
            |b, &num_tasks| {
                b.to_async(&rt).iter(|| async {
                    let mut handles = vec![];

                    for i in 0..num_tasks {
                        let client_clone = client.clone();
                        let handle = tokio::spawn(async move {
                            let key = format!("bench:concurrent:{}", i);

                            client_clone.set(&key, "value").await?;
                            client_clone.get(&key).await?;
                            client_clone.del(&key).await?;

                            Ok::<_, shardis::Error>(())
                        });
                        handles.push(handle);
                    }

                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Topology refresh.
fn bench_topology_refresh(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_cluster, client) = create_client(&rt, 3);

    c.bench_function("refresh_topology", |b| {
        b.to_async(&rt).iter(|| async {
            client.refresh_topology().await.expect("refresh failed");
        });
    });
}

criterion_group!(
    benches,
    bench_cluster_set,
    bench_cluster_hash,
    bench_cluster_scan,
    bench_slot_calculation,
    bench_slot_lookup,
    bench_concurrent_operations,
    bench_topology_refresh
);

criterion_main!(benches);
