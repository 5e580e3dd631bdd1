//! Scenario 3: a follower that's partitioned away misses writes, then
//! catches up via the targeted resync path once reconnected.

mod support;

use std::time::Duration;

use support::{kv_command, TestCluster};

#[test]
fn reconnected_follower_catches_up_via_resync() {
    let ids = [21, 22, 23, 24, 25];
    // `term_timeout` is kept well above how long the partition stays open so
    // the cut-off follower never notices the outage and starts its own
    // campaign -- it just falls behind on the log and resyncs once healed,
    // rather than fighting the incumbent leader for a new term.
    let cluster = TestCluster::new(&ids, Duration::from_millis(20), Duration::from_millis(500));
    let leader = cluster.wait_for_leader(Duration::from_secs(3));

    let laggard = *ids.iter().find(|&&id| id != leader.id()).unwrap();
    cluster.partition(laggard, &ids);

    assert!(leader.submit_blocking(kv_command("k", "v4")).is_applied());
    assert!(leader.submit_blocking(kv_command("k", "v5")).is_applied());

    // the partitioned follower must not have observed either write
    assert_eq!(cluster.kvs[&laggard].get("k"), None);

    cluster.heal(laggard, &ids);

    let commit_index = cluster.wait_for_common_commit_index(&ids, Duration::from_secs(3));
    assert_eq!(commit_index, 2);

    for &id in &ids {
        assert_eq!(cluster.kvs[&id].get("k"), Some("v5".to_string()));
    }
}
