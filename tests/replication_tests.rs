//! Log replication and commit/apply pipeline tests: majority commitment,
//! ordered exactly-once delivery, and the submission interface.


use std::time::Duration;

use quorum_lite::raft::RaftMessage;
use quorum_lite::QuorumError;
use test_harness::{assert_eventually, quiescent_node_config, wait_for, TestCluster};

/// A submitted command lands at (index 1, term 1), commits once a majority
/// holds it, and reaches the upstream service exactly once on every peer.
#[tokio::test]
async fn submitted_command_commits_and_applies_once() {
    let configs = vec![
        quiescent_node_config(1, vec![2, 3]),
        quiescent_node_config(2, vec![1, 3]),
        quiescent_node_config(3, vec![1, 2]),
    ];
    let mut cluster = TestCluster::with_configs(configs).await;

    cluster
        .get_node(1)
        .unwrap()
        .raft_node
        .message_sender()
        .send(RaftMessage::TriggerElection)
        .await
        .unwrap();
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");

    let submitted = cluster.submit(b"x").await.expect("leader accepts");
    assert_eq!(submitted.index, 1);
    assert_eq!(submitted.term, 1);

    assert!(
        cluster.wait_for_commit_on_all(1, Duration::from_secs(5)).await,
        "entry should commit everywhere"
    );

    for node in cluster.nodes.values() {
        assert_eventually(
            || async { !node.applied().await.is_empty() },
            Duration::from_secs(2),
            "every peer applies the committed entry",
        )
        .await;
    }

    // Give re-delivery every chance to misbehave, then check exactly-once.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for node in cluster.nodes.values() {
        let applied = node.applied().await;
        assert_eq!(applied.len(), 1, "node {} applied duplicates", node.node_id);
        assert_eq!(applied[0].index, 1);
        assert_eq!(applied[0].command, b"x".to_vec());
    }

    cluster.shutdown().await;
}

/// Several commands apply in submission order, gapless, on every peer.
#[tokio::test]
async fn commands_apply_in_order_on_all_peers() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");

    let commands: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d"];
    for (i, command) in commands.iter().enumerate() {
        let submitted = cluster.submit(command).await.expect("leader accepts");
        assert_eq!(submitted.index, i as u64 + 1);
    }

    assert!(
        cluster
            .wait_for_commit_on_all(commands.len() as u64, Duration::from_secs(5))
            .await,
        "all entries should commit everywhere"
    );

    for node in cluster.nodes.values() {
        assert_eventually(
            || async { node.applied().await.len() >= commands.len() },
            Duration::from_secs(2),
            "every peer applies all entries",
        )
        .await;

        let applied = node.applied().await;
        assert_eq!(applied.len(), commands.len());
        for (i, msg) in applied.iter().enumerate() {
            assert_eq!(msg.index, i as u64 + 1, "delivery must be gapless");
            assert_eq!(msg.command, commands[i].to_vec());
        }
    }

    assert!(cluster.logs_consistent().await);

    cluster.shutdown().await;
}

/// Submitting to a follower fails fast with a not-leader indication and no
/// side effect on its log.
#[tokio::test]
async fn follower_rejects_submission() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");

    let follower = cluster
        .nodes
        .keys()
        .copied()
        .find(|&id| id != leader)
        .unwrap();

    let node = cluster.get_node(follower).unwrap();
    let before = node.log_len().await;
    let err = node.raft_node.submit(b"nope".to_vec()).await.unwrap_err();
    assert!(matches!(err, QuorumError::NotLeader(_)));
    assert_eq!(node.log_len().await, before, "rejection has no side effect");

    cluster.shutdown().await;
}

/// The commit index never decreases over a peer's lifetime.
#[tokio::test]
async fn commit_index_is_monotonic() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader should be elected");

    let mut last_seen: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
    for round in 0..5 {
        // Retry around transient leader churn; the property under test is
        // monotonicity, not leader stability.
        let mut attempts = 0;
        while cluster
            .submit(format!("cmd-{round}").as_bytes())
            .await
            .is_err()
        {
            attempts += 1;
            assert!(attempts < 100, "no leader accepted the command");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for _ in 0..5 {
            for node in cluster.nodes.values() {
                let commit = node.commit_index().await;
                let seen = last_seen.entry(node.node_id).or_insert(0);
                assert!(commit >= *seen, "commit index went backward");
                *seen = commit;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    assert!(cluster.wait_for_commit_on_all(5, Duration::from_secs(5)).await);

    cluster.shutdown().await;
}

/// A lone peer forms a majority of one: its submissions commit without any
/// other cluster member.
#[tokio::test]
async fn single_peer_cluster_commits_alone() {
    let configs = vec![test_harness::test_node_config(1, Vec::new())];
    let mut cluster = TestCluster::with_configs(configs).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a lone peer elects itself");

    let submitted = cluster.submit(b"solo").await.expect("leader accepts");
    assert_eq!(submitted.index, 1);

    let node = cluster.get_node(1).unwrap();
    assert!(
        wait_for(
            || async { node.commit_index().await >= 1 },
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .await,
        "a majority of one commits immediately"
    );
    assert_eventually(
        || async { node.applied().await.len() == 1 },
        Duration::from_secs(2),
        "the lone peer applies its own entry",
    )
    .await;

    cluster.shutdown().await;
}
