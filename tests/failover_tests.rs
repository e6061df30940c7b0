//! Domain failover coordination: the change callback must interlock with
//! task processing, recompute levels for domains newly active here, push
//! synthetic notifications to force a store scan, and advance the shard's
//! domain notification version.

mod common;

use common::*;

use shardflow::domain::{
    DomainCacheEntry, DomainConfiguration, DomainInfo, DomainReplicationConfig,
};
use shardflow::shard::ShardContext;
use shardflow::{TimerTaskKind, TransferTaskKind};

const GLOBAL_DOMAIN_ID: &str = "99999999-8888-4777-8666-555555555544";

fn global_domain(active_cluster: &str, versions: (i64, i64, i64)) -> DomainCacheEntry {
    let (failover_version, failover_notification_version, notification_version) = versions;
    DomainCacheEntry {
        info: DomainInfo {
            id: GLOBAL_DOMAIN_ID.to_string(),
            name: "global-domain".to_string(),
        },
        config: DomainConfiguration::default(),
        replication_config: DomainReplicationConfig {
            active_cluster_name: active_cluster.to_string(),
            clusters: vec![ACTIVE_CLUSTER.to_string(), STANDBY_CLUSTER.to_string()],
        },
        is_global: true,
        failover_version,
        failover_notification_version,
        notification_version,
    }
}

#[tokio::test]
async fn failover_to_this_cluster_notifies_both_processors() {
    let fixture = engine_fixture();
    fixture.domains.put_domain(global_domain(STANDBY_CLUSTER, (2, 0, 0)));

    let transfer_before = fixture.transfer.notifications.lock().unwrap().len();
    let timer_before = fixture.timer.notifications.lock().unwrap().len();

    // the domain fails over to this cluster
    fixture
        .domains
        .refresh_domains(vec![global_domain(ACTIVE_CLUSTER, (11, 5, 7))])
        .await;

    // both processors recomputed levels for the failed-over domain
    let transfer_failovers = fixture.transfer.failovers.lock().unwrap();
    assert_eq!(transfer_failovers.len(), 1);
    assert!(transfer_failovers[0].contains(GLOBAL_DOMAIN_ID));
    let timer_failovers = fixture.timer.failovers.lock().unwrap();
    assert_eq!(timer_failovers.len(), 1);

    // one synthetic decision task forces a transfer-store scan
    let transfer_notifications = fixture.transfer.notifications.lock().unwrap();
    let synthetic = &transfer_notifications[transfer_before..];
    assert_eq!(synthetic.len(), 1);
    assert_eq!(synthetic[0].0, ACTIVE_CLUSTER);
    assert!(matches!(
        synthetic[0].1[0].kind,
        TransferTaskKind::DecisionTask { schedule_id: 0, .. }
    ));

    // and one synthetic decision-timeout timestamped now for the timer side
    let timer_notifications = fixture.timer.notifications.lock().unwrap();
    let synthetic = &timer_notifications[timer_before..];
    assert_eq!(synthetic.len(), 1);
    assert!(matches!(
        synthetic[0].2[0].kind,
        TimerTaskKind::DecisionTimeout { schedule_id: 0, .. }
    ));
    assert_eq!(synthetic[0].1, synthetic[0].2[0].fire_at_ms);

    // the shard version advances past the highest observed domain version
    assert_eq!(fixture.shard.domain_notification_version(), 8);

    // the interlock was released
    let lock_events = fixture.transfer.lock_events.lock().unwrap();
    assert_eq!(
        *lock_events,
        vec!["transfer-lock", "transfer-unlock"]
    );
}

#[tokio::test]
async fn stale_failover_notification_does_not_trigger_failover() {
    let fixture = engine_fixture();
    fixture.shard.update_domain_notification_version(10);

    fixture
        .domains
        .refresh_domains(vec![global_domain(ACTIVE_CLUSTER, (11, 5, 12))])
        .await;

    // failover notification version 5 < shard version 10: no failover
    assert!(fixture.transfer.failovers.lock().unwrap().is_empty());
    assert!(fixture.timer.failovers.lock().unwrap().is_empty());
    // the shard version still advances
    assert_eq!(fixture.shard.domain_notification_version(), 13);
}

#[tokio::test]
async fn domain_active_elsewhere_does_not_trigger_failover() {
    let fixture = engine_fixture();

    fixture
        .domains
        .refresh_domains(vec![global_domain(STANDBY_CLUSTER, (12, 5, 3))])
        .await;

    assert!(fixture.transfer.failovers.lock().unwrap().is_empty());
    assert_eq!(fixture.shard.domain_notification_version(), 4);
}

#[tokio::test]
async fn engine_stop_unregisters_the_callback() {
    let fixture = engine_fixture();
    fixture.engine.stop();

    fixture
        .domains
        .refresh_domains(vec![global_domain(ACTIVE_CLUSTER, (11, 5, 7))])
        .await;

    assert!(fixture.transfer.failovers.lock().unwrap().is_empty());
    assert_eq!(fixture.shard.domain_notification_version(), 0);
}

#[tokio::test]
async fn sync_shard_status_advances_remote_clock_and_pokes_processors() {
    let fixture = engine_fixture();
    fixture
        .engine
        .sync_shard_status(shardflow::engine::SyncShardStatusRequest {
            source_cluster: STANDBY_CLUSTER.to_string(),
            timestamp_ms: 123_456,
        })
        .await
        .unwrap();

    assert_eq!(fixture.shard.current_time_ms(STANDBY_CLUSTER), 123_456);
    assert!(fixture
        .transfer
        .notifications
        .lock()
        .unwrap()
        .iter()
        .any(|(cluster, tasks)| cluster == STANDBY_CLUSTER && tasks.is_empty()));
    assert!(fixture
        .timer
        .notifications
        .lock()
        .unwrap()
        .iter()
        .any(|(cluster, time, tasks)| cluster == STANDBY_CLUSTER
            && *time == 123_456
            && tasks.is_empty()));
}
