//! End-to-end sequencer-crash recovery over the in-memory cluster.

use std::time::Duration;

use ordo_core::token::{NodeId, PartitionId};
use ordo_testkit::{single_partition_config, TestCluster};

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
async fn survivors_agree_and_resume_after_sequencer_crash() {
    let mut cluster = TestCluster::start(&[1, 2, 3], |id| {
        single_partition_config(id, 3, &["kv.put"])
    })
    .expect("cluster");

    // committed traffic before the crash
    for value in ["a", "b", "c"] {
        cluster
            .member(1)
            .node
            .submit("kv.put", None, value.as_bytes().to_vec())
            .await
            .expect("submitted");
    }
    wait_until(|| cluster.logs().values().all(|log| log.len() == 3)).await;

    cluster.crash(3);

    // the survivors run the consensus round and re-open the partition with
    // the agreed candidate (the lowest survivor) as sequencer
    wait_until(|| {
        [1u32, 2].iter().all(|id| {
            let handle = cluster
                .member(*id)
                .node
                .context()
                .partition(PartitionId(1))
                .expect("partition");
            handle.is_accepting_requests() && handle.sequencer() == NodeId(1)
        })
    })
    .await;

    // ordering continues seamlessly after recovery
    cluster
        .member(2)
        .node
        .submit("kv.put", None, b"d".to_vec())
        .await
        .expect("submitted");

    wait_until(|| cluster.logs().values().all(|log| log.len() == 4)).await;
    let logs = cluster.logs();
    assert_eq!(logs[&1], logs[&2]);
    assert_eq!(logs[&1].last().map(String::as_str), Some("kv.put:d"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_in_flight_at_crash_time_is_retransmitted() {
    let mut cluster = TestCluster::start(&[1, 2, 3], |id| {
        single_partition_config(id, 3, &["kv.put"])
    })
    .expect("cluster");

    cluster.crash(3);

    // submitted against a crashed (or already suspended) sequencer: the
    // request parks in the outstanding cache until the skip agreement
    // triggers its retransmission to the new sequencer
    cluster
        .member(2)
        .node
        .submit("kv.put", None, b"recovered".to_vec())
        .await
        .expect("submitted");

    wait_until(|| {
        cluster
            .logs()
            .values()
            .all(|log| log.iter().any(|tag| tag == "kv.put:recovered"))
    })
    .await;

    let logs = cluster.logs();
    assert_eq!(logs[&1], logs[&2]);
}
