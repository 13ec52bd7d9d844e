//! Cluster-wide delivery properties over the in-memory transport.

use std::time::Duration;

use ordo_core::config::{NodeConfig, OperationConfig, OperationShape, PartitionConfig};
use ordo_core::partition::PartitionScope;
use ordo_testkit::{single_partition_config, TestCluster};

/// Poll until `probe` holds or the deadline passes.
async fn wait_until(probe: impl Fn() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(probe(), "condition not reached within the deadline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fully_ordered_partition_executes_identically_everywhere() {
    let cluster = TestCluster::start(&[1, 2, 3], |id| {
        single_partition_config(id, 1, &["kv.put"])
    })
    .expect("cluster");

    for round in 0..5 {
        for id in [1u32, 2, 3] {
            cluster
                .member(id)
                .node
                .submit("kv.put", None, format!("{id}-{round}").into_bytes())
                .await
                .expect("submitted");
        }
    }

    wait_until(|| cluster.logs().values().all(|log| log.len() == 15)).await;

    let logs = cluster.logs();
    assert_eq!(logs[&1], logs[&2]);
    assert_eq!(logs[&2], logs[&3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unordered_operations_skip_gating() {
    let config = |id: u32| {
        let mut config = single_partition_config(id, 1, &["kv.put"]);
        config.partitions.push(PartitionConfig {
            id: 2,
            scope: PartitionScope::Unordered,
            sequencer: 1,
        });
        config.operations.push(OperationConfig {
            name: "kv.stats".to_owned(),
            kind: OperationShape::Simple,
            partition: Some(2),
            children: vec![],
            ordered: false,
            idempotent: true,
        });
        config
    };
    let cluster = TestCluster::start(&[1, 2], config).expect("cluster");

    cluster
        .member(2)
        .node
        .submit("kv.stats", None, b"x".to_vec())
        .await
        .expect("submitted");

    wait_until(|| cluster.logs().values().all(|log| log.len() == 1)).await;
    assert_eq!(cluster.logs()[&1], vec!["kv.stats:x".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_streams_order_independently() {
    let config = |id: u32| NodeConfig {
        node: id,
        partitions: vec![PartitionConfig {
            id: -1,
            scope: PartitionScope::SessionOrdered,
            sequencer: 1,
        }],
        operations: vec![OperationConfig {
            name: "cart.add".to_owned(),
            kind: OperationShape::Simple,
            partition: Some(-1),
            children: vec![],
            ordered: true,
            idempotent: false,
        }],
        ..NodeConfig::default()
    };
    let cluster = TestCluster::start(&[1, 2], config).expect("cluster");

    for item in ["hat", "mug"] {
        cluster
            .member(1)
            .node
            .submit("cart.add", Some("alice".to_owned()), item.as_bytes().to_vec())
            .await
            .expect("submitted");
    }
    cluster
        .member(2)
        .node
        .submit("cart.add", Some("bob".to_owned()), b"pen".to_vec())
        .await
        .expect("submitted");

    wait_until(|| cluster.logs().values().all(|log| log.len() == 3)).await;

    let logs = cluster.logs();
    for log in logs.values() {
        let alice: Vec<&str> = log
            .iter()
            .filter(|tag| tag.contains("@alice"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            alice,
            vec!["cart.add@alice:hat", "cart.add@alice:mug"],
            "per-session order must hold on every node"
        );
        assert!(log.iter().any(|tag| tag.contains("@bob")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn composite_request_spans_two_sequencers() {
    let config = |id: u32| NodeConfig {
        node: id,
        partitions: vec![
            PartitionConfig {
                id: 1,
                scope: PartitionScope::FullyOrdered,
                sequencer: 1,
            },
            PartitionConfig {
                id: 2,
                scope: PartitionScope::FullyOrdered,
                sequencer: 2,
            },
        ],
        operations: vec![
            OperationConfig {
                name: "stock.reserve".to_owned(),
                kind: OperationShape::Simple,
                partition: Some(1),
                children: vec![],
                ordered: true,
                idempotent: false,
            },
            OperationConfig {
                name: "ledger.charge".to_owned(),
                kind: OperationShape::Simple,
                partition: Some(2),
                children: vec![],
                ordered: true,
                idempotent: false,
            },
            OperationConfig {
                name: "checkout".to_owned(),
                kind: OperationShape::Composite,
                partition: None,
                children: vec!["stock.reserve".to_owned(), "ledger.charge".to_owned()],
                ordered: true,
                idempotent: false,
            },
        ],
        ..NodeConfig::default()
    };
    let cluster = TestCluster::start(&[1, 2, 3], config).expect("cluster");

    cluster
        .member(3)
        .node
        .submit("checkout", None, b"o1".to_vec())
        .await
        .expect("submitted");

    wait_until(|| cluster.logs().values().all(|log| log.len() == 2)).await;

    let logs = cluster.logs();
    for log in logs.values() {
        assert_eq!(
            log,
            &vec!["stock.reserve:o1".to_owned(), "ledger.charge:o1".to_owned()],
            "composite leaves execute in program order"
        );
    }
}
