mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hdb_compact::discovery::BucketDiscovery;
use hdb_compact::{CombineConfig, PipelineConfig};
use hdb_store::memory::OpKind;
use hdb_store::{
    AddressFamily, BucketKey, HistoryProvider, IndexLayout, Keyspace, MemoryStore, RemoteAddr,
    RespConfig, RespServer, Session, SessionOptions, UserId,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn day5(store: &MemoryStore) {
    common::seed_bucket(store, &[1], "day5", &[("u1", "A"), ("u2", "B"), ("u3", "C")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn day5_is_combined_and_indexed() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    day5(&store);
    let result = common::orchestrator(&store, vec![1], 1, PipelineConfig::new("combined"))
        .run(&[BucketKey::from("day5")])
        .await;

    for (user, expected) in [("u1", "A"), ("u2", "B"), ("u3", "C")] {
        let stored = store
            .get(1, &format!("{user}.combined"))
            .ok_or_else(|| anyhow::anyhow!("{user} not written"))?;
        assert_eq!(stored.data, Bytes::from(expected));
    }
    let session = Session::new(store.clone(), SessionOptions::new(vec![1]));
    let found: BTreeSet<_> = session
        .find_any_indexes(&["combined".to_string()])
        .await?
        .into_iter()
        .map(|entry| UserId::new(entry.value_str().into_owned()))
        .collect();
    assert_eq!(found, common::users(&["u1", "u2", "u3"]));
    assert_eq!((result.successes, result.failures, result.bytes_written), (3, 0, 3));
    assert_eq!(result.index_successes, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_activity_index_stays_discoverable_after_combining() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let layout = IndexLayout::from_chunks(16);
    let provider = HistoryProvider::new(store.clone(), vec![1], 1).with_index_layout(layout);
    for (user, data) in [("u1", "A"), ("u2", "B"), ("u3", "C")] {
        let (log, activity) = provider
            .add_log_with_activity(&UserId::from(user), "day5", Bytes::from(data))
            .await;
        log?;
        activity?;
    }

    let config = PipelineConfig::new("combined").with_index_layout(layout);
    let result = common::orchestrator(&store, vec![1], 1, config)
        .run(&[BucketKey::from("day5")])
        .await;
    assert_eq!((result.successes, result.index_successes), (3, 3));

    let discovery = BucketDiscovery::new(
        Session::new(store.clone(), SessionOptions::new(vec![1])),
        layout,
    );
    let combined = discovery
        .discover(&BucketKey::from("combined"), &BTreeSet::new())
        .await?;
    assert_eq!(combined, common::users(&["u1", "u2", "u3"]));

    let active = provider
        .get_active_users(&[BucketKey::from("combined")])
        .await?;
    assert_eq!(active, common::users(&["u1", "u2", "u3"]));

    let logs = provider
        .get_user_logs(&UserId::from("u2"), &[BucketKey::from("combined")])
        .await;
    assert_eq!(logs, Bytes::from_static(b"B"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rerunning_reproduces_the_same_content() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::with_seed(99));
    let mut rng = SmallRng::seed_from_u64(42);
    let mut fragments = Vec::new();
    for i in 0..40 {
        let len = rng.gen_range(1..64);
        let data: String = (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
        fragments.push((format!("user{i:02}"), data));
    }
    let borrowed: Vec<(&str, &str)> = fragments
        .iter()
        .map(|(u, d)| (u.as_str(), d.as_str()))
        .collect();
    common::seed_bucket(&store, &[1, 2], "7", &borrowed);

    let config = PipelineConfig::new("week").with_batch_size(common::batch_size(7));
    let snapshot = |store: &MemoryStore| -> BTreeMap<String, Bytes> {
        fragments
            .iter()
            .filter_map(|(u, _)| {
                let id = format!("{u}.week");
                store.get(2, &id).map(|v| (id, v.data))
            })
            .collect()
    };

    let first = common::orchestrator(&store, vec![1, 2], 2, config.clone())
        .run(&[BucketKey::from("7")])
        .await;
    let after_first = snapshot(&store);
    let second = common::orchestrator(&store, vec![1, 2], 2, config)
        .run(&[BucketKey::from("7")])
        .await;
    let after_second = snapshot(&store);

    assert_eq!(after_first.len(), 40);
    assert_eq!(after_first, after_second);
    assert_eq!(first.bytes_written, second.bytes_written);
    for (user, data) in &fragments {
        assert_eq!(after_second[&format!("{user}.week")], Bytes::from(data.clone()));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batches_cover_the_discovered_set_exactly_once() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let names: Vec<String> = (0..23).map(|i| format!("u{i:02}")).collect();
    let fragments: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "x")).collect();
    common::seed_bucket(&store, &[1], "b", &fragments);

    let config = PipelineConfig::new("k").with_batch_size(common::batch_size(5));
    let result = common::orchestrator(&store, vec![1], 1, config)
        .run(&[BucketKey::from("b")])
        .await;

    let bucket = &result.buckets[0];
    assert_eq!(bucket.batches.len(), 5);
    assert_eq!(bucket.batches.iter().map(|b| b.users).sum::<usize>(), 23);
    assert!(bucket.batches.iter().all(|b| b.users <= 5));

    let reads: Vec<String> = store
        .journal()
        .into_iter()
        .filter(|op| op.op == OpKind::Read)
        .map(|op| op.id)
        .collect();
    let unique: BTreeSet<_> = reads.iter().cloned().collect();
    assert_eq!(reads.len(), 23, "every user is read exactly once");
    assert_eq!(unique.len(), 23);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_failures_are_isolated() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    common::seed_bucket(
        &store,
        &[1],
        "d",
        &[("a", "1"), ("b", "22"), ("c", "333"), ("e", "4444"), ("f", "55555")],
    );
    store.fail_reads("b.d");
    store.fail_reads("e.d");

    let result = common::orchestrator(&store, vec![1], 1, PipelineConfig::new("k"))
        .run(&[BucketKey::from("d")])
        .await;
    assert_eq!(result.successes, 3);
    assert!(result.failures >= 2);
    assert_eq!(result.bytes_written, 1 + 3 + 5);
    for user in ["a", "c", "f"] {
        assert!(store.get(1, &format!("{user}.k")).is_some(), "{user} written");
    }
    for user in ["b", "e"] {
        assert!(store.get(1, &format!("{user}.k")).is_none());
    }
    assert_eq!(common::indexed(&store, 1, "k"), common::users(&["a", "c", "f"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn index_failures_do_not_touch_write_counters() -> anyhow::Result<()> {
    let clean = Arc::new(MemoryStore::new());
    day5(&clean);
    let baseline = common::orchestrator(&clean, vec![1], 1, PipelineConfig::new("combined"))
        .run(&[BucketKey::from("day5")])
        .await;

    let faulty = Arc::new(MemoryStore::new());
    day5(&faulty);
    faulty.fail_index_updates("u2");
    faulty.fail_index_updates("u3");
    let result = common::orchestrator(&faulty, vec![1], 1, PipelineConfig::new("combined"))
        .run(&[BucketKey::from("day5")])
        .await;

    assert_eq!(result.successes, baseline.successes);
    assert_eq!(result.bytes_written, baseline.bytes_written);
    assert_eq!(result.failures, 0);
    assert_eq!((result.index_successes, result.index_failures), (1, 2));
    assert!(faulty.get(1, "u2.combined").is_some(), "the write is not rolled back");
    assert_eq!(common::indexed(&faulty, 1, "combined"), common::users(&["u1"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allow_list_limits_every_stage() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    day5(&store);
    let config = PipelineConfig::new("combined").with_allow(common::users(&["u1"]));
    let result = common::orchestrator(&store, vec![1], 1, config)
        .run(&[BucketKey::from("day5")])
        .await;

    assert_eq!((result.successes, result.failures), (1, 0));
    assert_eq!(result.buckets[0].discovered, 1);
    assert!(store.get(1, "u2.combined").is_none());
    assert!(store.get(1, "u3.combined").is_none());
    assert_eq!(common::indexed(&store, 1, "combined"), common::users(&["u1"]));

    let touched: BTreeSet<String> = store
        .journal()
        .into_iter()
        .filter(|op| op.op != OpKind::FindIndexes)
        .map(|op| op.id)
        .collect();
    assert!(touched.iter().all(|id| id.starts_with("u1")), "touched {touched:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn under_replicated_writes_count_as_failures() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    common::seed_bucket(&store, &[1, 2, 3], "day5", &[("u1", "A"), ("u2", "B")]);
    store.set_group_down(3, true);

    let strict = common::orchestrator(&store, vec![1, 2, 3], 3, PipelineConfig::new("all"))
        .run(&[BucketKey::from("day5")])
        .await;
    assert_eq!((strict.successes, strict.failures), (0, 2));
    assert_eq!(strict.index_successes + strict.index_failures, 0);

    let quorum = common::orchestrator(&store, vec![1, 2, 3], 2, PipelineConfig::new("two"))
        .run(&[BucketKey::from("day5")])
        .await;
    assert_eq!((quorum.successes, quorum.failures), (2, 0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_latency_is_overlapped_within_a_batch() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(100)));
    let names: Vec<String> = (0..20).map(|i| format!("u{i}")).collect();
    let fragments: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "x")).collect();
    common::seed_bucket(&store, &[1], "b", &fragments);

    let result = common::orchestrator(&store, vec![1], 1, PipelineConfig::new("k"))
        .run(&[BucketKey::from("b")])
        .await;
    assert_eq!(result.successes, 20);
    // Serial execution would take 20 writes + 20 index updates at 100ms each.
    assert!(result.elapsed < Duration::from_secs(2), "took {:?}", result.elapsed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn combine_runs_end_to_end_over_resp() -> anyhow::Result<()> {
    let keyspace = Arc::new(Keyspace::new());
    for (user, data) in [("u1", "A"), ("u2", "B"), ("u3", "C")] {
        keyspace.set(&format!("1:{user}.day5"), data);
        keyspace.hset("1:idx:day5", user, user);
    }
    let server = RespServer::start("127.0.0.1:0".parse::<SocketAddr>()?, keyspace.clone()).await?;
    let dir = tempfile::tempdir()?;
    let summary_path = dir.path().join("out").join("summary.json");

    let config = CombineConfig {
        pipeline: PipelineConfig::new("combined"),
        buckets: vec![BucketKey::from("day5")],
        remotes: vec![
            RemoteAddr {
                host: "127.0.0.1".to_string(),
                port: server.addr().port(),
                family: AddressFamily::Inet,
            },
        ],
        groups: vec![1],
        min_writes: 1,
        resp: RespConfig {
            op_timeout: Duration::from_secs(5),
            connections_per_remote: 2,
        },
        summary_json: Some(summary_path.clone()),
    };
    let result = hdb_compact::combine(&config).await?;
    assert_eq!((result.successes, result.failures), (3, 0));
    for (user, expected) in [("u1", "A"), ("u2", "B"), ("u3", "C")] {
        assert_eq!(keyspace.get(&format!("1:{user}.combined")), Some(expected.as_bytes().to_vec()));
    }
    assert_eq!(keyspace.hash("1:idx:combined").len(), 3);

    hdb_compact::write_summary(&summary_path, &result)?;
    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&summary_path)?)?;
    assert_eq!(json["successes"], 3);
    assert_eq!(json["buckets"][0]["bucket"], "day5");

    server.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_remotes_are_a_configuration_error() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let config = CombineConfig {
        pipeline: PipelineConfig::new("combined"),
        buckets: vec![BucketKey::from("day5")],
        remotes: vec![RemoteAddr {
            host: "127.0.0.1".to_string(),
            port,
            family: AddressFamily::Inet,
        }],
        groups: vec![1],
        min_writes: 1,
        resp: RespConfig {
            op_timeout: Duration::from_secs(2),
            connections_per_remote: 1,
        },
        summary_json: None,
    };
    let err = hdb_compact::combine(&config).await.expect_err("nothing listens");
    assert_eq!(
        err.downcast_ref::<hdb_compact::ConfigError>(),
        Some(&hdb_compact::ConfigError::NoReachableRemote)
    );
    Ok(())
}
