//! Shared test harness: a full engine over the in-memory shard with
//! recording queue processors.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use shardflow::config::Config;
use shardflow::domain::{
    ClusterInfo, ClusterMetadata, DomainCacheEntry, DomainConfiguration, InMemoryDomainCache,
};
use shardflow::engine::{
    Engine, EngineParams, RecordDecisionTaskStartedRequest, RecordDecisionTaskStartedResponse,
    RespondDecisionTaskCompletedRequest, RespondDecisionTaskCompletedResponse,
    StartWorkflowExecutionRequest,
};
use shardflow::notifier::HistoryEventNotifier;
use shardflow::queues::{
    TaskProcessingLock, TimerQueueProcessor, TransferQueueProcessor,
};
use shardflow::shard::in_memory::InMemoryShard;
use shardflow::{
    Decision, EngineError, HistoryEvent, TaskToken, TimerTask, TransferTask, TransferTaskKind,
    WorkflowExecution,
};

pub const DOMAIN_ID: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";
pub const DOMAIN_NAME: &str = "unit-test-domain";
pub const ACTIVE_CLUSTER: &str = "cluster-active";
pub const STANDBY_CLUSTER: &str = "cluster-standby";

/// Transfer queue processor that records every interaction.
#[derive(Default)]
pub struct RecordingTransferProcessor {
    lock: TaskProcessingLock,
    pub notifications: Mutex<Vec<(String, Vec<TransferTask>)>>,
    pub failovers: Mutex<Vec<HashSet<String>>>,
    pub lock_events: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl TransferQueueProcessor for RecordingTransferProcessor {
    fn start(&self) {}
    fn stop(&self) {}

    async fn lock_task_processing(&self) {
        self.lock.lock().await;
        self.lock_events.lock().unwrap().push("transfer-lock");
    }

    fn unlock_task_processing(&self) {
        self.lock.unlock();
        self.lock_events.lock().unwrap().push("transfer-unlock");
    }

    fn failover_domain(&self, domain_ids: &HashSet<String>) {
        self.failovers.lock().unwrap().push(domain_ids.clone());
    }

    fn notify_new_task(&self, cluster_name: &str, tasks: &[TransferTask]) {
        self.notifications
            .lock()
            .unwrap()
            .push((cluster_name.to_string(), tasks.to_vec()));
    }
}

/// Timer queue processor that records every interaction.
#[derive(Default)]
pub struct RecordingTimerProcessor {
    lock: TaskProcessingLock,
    pub notifications: Mutex<Vec<(String, i64, Vec<TimerTask>)>>,
    pub failovers: Mutex<Vec<HashSet<String>>>,
}

#[async_trait]
impl TimerQueueProcessor for RecordingTimerProcessor {
    fn start(&self) {}
    fn stop(&self) {}

    async fn lock_task_processing(&self) {
        self.lock.lock().await;
    }

    fn unlock_task_processing(&self) {
        self.lock.unlock();
    }

    fn failover_domain(&self, domain_ids: &HashSet<String>) {
        self.failovers.lock().unwrap().push(domain_ids.clone());
    }

    fn notify_new_timers(&self, cluster_name: &str, current_time_ms: i64, tasks: &[TimerTask]) {
        self.notifications
            .lock()
            .unwrap()
            .push((cluster_name.to_string(), current_time_ms, tasks.to_vec()));
    }
}

pub struct EngineFixture {
    pub engine: Arc<Engine>,
    pub shard: Arc<InMemoryShard>,
    pub domains: Arc<InMemoryDomainCache>,
    pub transfer: Arc<RecordingTransferProcessor>,
    pub timer: Arc<RecordingTimerProcessor>,
    pub notifier: Arc<HistoryEventNotifier>,
}

pub fn test_domain_entry() -> DomainCacheEntry {
    let mut entry = DomainCacheEntry::local(DOMAIN_ID, DOMAIN_NAME, ACTIVE_CLUSTER);
    entry.config = DomainConfiguration {
        retention_days: 1,
        bad_binaries: HashSet::new(),
        archival_enabled: false,
    };
    entry
}

pub fn engine_fixture() -> EngineFixture {
    engine_fixture_with_config(Config::default())
}

pub fn engine_fixture_with_config(config: Config) -> EngineFixture {
    let shard = Arc::new(InMemoryShard::new(1));
    let domains = Arc::new(InMemoryDomainCache::new());
    domains.put_domain(test_domain_entry());
    let transfer = Arc::new(RecordingTransferProcessor::default());
    let timer = Arc::new(RecordingTimerProcessor::default());
    let notifier = Arc::new(HistoryEventNotifier::new());
    let cluster_metadata = Arc::new(ClusterMetadata {
        current_cluster_name: ACTIVE_CLUSTER.to_string(),
        enable_global_domain: true,
        failover_version_increment: 10,
        clusters: vec![
            ClusterInfo {
                name: ACTIVE_CLUSTER.to_string(),
                initial_failover_version: 1,
            },
            ClusterInfo {
                name: STANDBY_CLUSTER.to_string(),
                initial_failover_version: 2,
            },
        ],
    });
    let engine = Engine::new(EngineParams {
        shard: shard.clone(),
        history_store: shard.clone(),
        execution_store: shard.clone(),
        visibility_store: shard.clone(),
        domain_cache: domains.clone(),
        cluster_metadata,
        transfer_processor: transfer.clone(),
        timer_processor: timer.clone(),
        replicator_processor: None,
        replicator: None,
        resetor: None,
        archival_client: None,
        notifier: notifier.clone(),
        config,
    });
    engine.start();
    EngineFixture {
        engine,
        shard,
        domains,
        transfer,
        timer,
        notifier,
    }
}

pub fn start_request(workflow_id: &str, request_id: &str) -> StartWorkflowExecutionRequest {
    StartWorkflowExecutionRequest {
        domain_id: DOMAIN_ID.to_string(),
        workflow_id: workflow_id.to_string(),
        workflow_type: "TestWorkflow".to_string(),
        task_list: "test-task-list".to_string(),
        input: "{}".to_string(),
        execution_timeout_seconds: 60,
        decision_timeout_seconds: 10,
        identity: "test-client".to_string(),
        request_id: request_id.to_string(),
        ..Default::default()
    }
}

pub async fn start_workflow(fixture: &EngineFixture, workflow_id: &str, request_id: &str) -> String {
    fixture
        .engine
        .start_workflow_execution(start_request(workflow_id, request_id))
        .await
        .expect("start workflow")
        .run_id
}

pub fn history(fixture: &EngineFixture, workflow_id: &str, run_id: &str) -> Vec<HistoryEvent> {
    fixture
        .shard
        .history_of(DOMAIN_ID, &WorkflowExecution::new(workflow_id, run_id))
}

/// Schedule ID of the latest decision-task transfer task.
pub fn latest_decision_task_schedule_id(fixture: &EngineFixture) -> i64 {
    fixture
        .shard
        .transfer_tasks()
        .iter()
        .rev()
        .find_map(|t| match &t.kind {
            TransferTaskKind::DecisionTask { schedule_id, .. } => Some(*schedule_id),
            _ => None,
        })
        .expect("no decision transfer task found")
}

pub fn decision_token(workflow_id: &str, run_id: &str, schedule_id: i64, attempt: i64) -> Vec<u8> {
    TaskToken {
        domain_id: DOMAIN_ID.to_string(),
        workflow_id: workflow_id.to_string(),
        run_id: run_id.to_string(),
        schedule_id: Some(schedule_id),
        schedule_attempt: attempt,
        activity_id: None,
    }
    .serialize()
    .expect("serialize token")
}

pub fn activity_token(workflow_id: &str, run_id: &str, schedule_id: i64, attempt: i64) -> Vec<u8> {
    decision_token(workflow_id, run_id, schedule_id, attempt)
}

pub async fn poll_decision(
    fixture: &EngineFixture,
    workflow_id: &str,
    run_id: &str,
    schedule_id: i64,
) -> RecordDecisionTaskStartedResponse {
    fixture
        .engine
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution::new(workflow_id, run_id),
            schedule_id,
            request_id: Uuid::new_v4().to_string(),
            identity: "test-worker".to_string(),
        })
        .await
        .expect("record decision task started")
}

pub async fn complete_decision(
    fixture: &EngineFixture,
    workflow_id: &str,
    run_id: &str,
    schedule_id: i64,
    attempt: i64,
    decisions: Vec<Decision>,
) -> Result<RespondDecisionTaskCompletedResponse, EngineError> {
    fixture
        .engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: DOMAIN_ID.to_string(),
            task_token: decision_token(workflow_id, run_id, schedule_id, attempt),
            decisions,
            identity: "test-worker".to_string(),
            ..Default::default()
        })
        .await
}

/// Start a workflow, poll its first decision task and return
/// `(run_id, schedule_id)`, ready for a completion call.
pub async fn start_and_poll(
    fixture: &EngineFixture,
    workflow_id: &str,
    request_id: &str,
) -> (String, i64) {
    let run_id = start_workflow(fixture, workflow_id, request_id).await;
    let schedule_id = latest_decision_task_schedule_id(fixture);
    poll_decision(fixture, workflow_id, &run_id, schedule_id).await;
    (run_id, schedule_id)
}
