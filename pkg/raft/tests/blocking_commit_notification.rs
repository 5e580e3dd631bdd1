//! Scenario 4: a blocking submission's `CommandListener` fires once the
//! command is known to have committed, whether it's handed to the leader
//! directly or forwarded there from a follower.

mod support;

use std::time::Duration;

use support::{kv_command, TestCluster};

#[test]
fn blocking_submit_notifies_on_both_leader_and_follower() {
    let ids = [31, 32, 33];
    let cluster = TestCluster::new(&ids, Duration::from_millis(15), Duration::from_millis(45));
    let leader = cluster.wait_for_leader(Duration::from_secs(2));

    let outcome = leader.submit_blocking(kv_command("k", "v6"));
    assert!(outcome.is_applied());

    let follower_id = *ids.iter().find(|&&id| id != leader.id()).unwrap();
    let follower = cluster.node(follower_id);
    let outcome = follower.submit_blocking(kv_command("k", "v7"));
    assert!(outcome.is_applied());

    let commit_index = cluster.wait_for_common_commit_index(&ids, Duration::from_secs(2));
    assert_eq!(commit_index, 2);

    for &id in &ids {
        assert_eq!(cluster.kvs[&id].get("k"), Some("v7".to_string()));
    }
}
