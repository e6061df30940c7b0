//! Start-path behavior: first batch shape, request-ID idempotency, the
//! workflow-ID reuse policy and create failure handling.

mod common;

use common::*;

use shardflow::engine::TerminateWorkflowExecutionRequest;
use shardflow::shard::ExecutionStore;
use shardflow::{
    EngineError, EventAttributes, TimerTaskKind, TransferTaskKind, WorkflowExecution,
    WorkflowIdReusePolicy,
};

#[tokio::test]
async fn start_produces_first_batch_and_tasks() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-start", "request-1").await;

    let events = history(&fixture, "wf-start", &run_id);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0].attributes,
        EventAttributes::WorkflowExecutionStarted { .. }
    ));
    assert!(matches!(
        events[1].attributes,
        EventAttributes::DecisionTaskScheduled { .. }
    ));
    assert_eq!(events[0].event_id, 1);
    assert_eq!(events[1].event_id, 2);

    let transfer = fixture.shard.transfer_tasks();
    assert!(transfer
        .iter()
        .any(|t| matches!(t.kind, TransferTaskKind::RecordWorkflowStarted)));
    assert!(transfer
        .iter()
        .any(|t| matches!(t.kind, TransferTaskKind::DecisionTask { schedule_id: 2, .. })));

    let timers = fixture.shard.timer_tasks();
    let timeout = timers
        .iter()
        .find(|t| matches!(t.kind, TimerTaskKind::WorkflowTimeout))
        .expect("workflow timeout task");
    let now = shardflow_now();
    assert!(timeout.fire_at_ms > now + 55_000 && timeout.fire_at_ms <= now + 65_000);

    // the engine surfaced the new timers to the timer processor
    assert!(!fixture.timer.notifications.lock().unwrap().is_empty());
}

fn shardflow_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[tokio::test]
async fn duplicate_start_with_same_request_id_is_idempotent() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-dup", "request-1").await;
    let events_before = history(&fixture, "wf-dup", &run_id).len();
    let transfer_before = fixture.shard.transfer_tasks().len();

    let response = fixture
        .engine
        .start_workflow_execution(start_request("wf-dup", "request-1"))
        .await
        .unwrap();
    assert_eq!(response.run_id, run_id);
    assert!(!response.timed_out);

    // no new events, no new tasks on the surviving run
    assert_eq!(history(&fixture, "wf-dup", &run_id).len(), events_before);
    assert_eq!(fixture.shard.transfer_tasks().len(), transfer_before);
}

#[tokio::test]
async fn start_with_different_request_id_while_running_is_rejected() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-running", "request-1").await;

    let err = fixture
        .engine
        .start_workflow_execution(start_request("wf-running", "request-2"))
        .await
        .unwrap_err();
    match err {
        EngineError::WorkflowExecutionAlreadyStarted(details) => {
            assert_eq!(details.run_id, run_id);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

async fn terminate(fixture: &EngineFixture, workflow_id: &str, run_id: &str) {
    fixture
        .engine
        .terminate_workflow_execution(TerminateWorkflowExecutionRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution::new(workflow_id, run_id),
            reason: "test".into(),
            details: String::new(),
            identity: "test".into(),
        })
        .await
        .expect("terminate");
}

#[tokio::test]
async fn reuse_policy_allow_duplicate_failed_only() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-reuse", "request-1").await;
    terminate(&fixture, "wf-reuse", &run_id).await;

    // terminated counts as a failed close: reuse allowed
    let mut request = start_request("wf-reuse", "request-2");
    request.reuse_policy = WorkflowIdReusePolicy::AllowDuplicateFailedOnly;
    let response = fixture.engine.start_workflow_execution(request).await.unwrap();
    assert_ne!(response.run_id, run_id);
}

#[tokio::test]
async fn reuse_policy_reject_duplicate() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-reject", "request-1").await;
    terminate(&fixture, "wf-reject", &run_id).await;

    let mut request = start_request("wf-reject", "request-2");
    request.reuse_policy = WorkflowIdReusePolicy::RejectDuplicate;
    let err = fixture.engine.start_workflow_execution(request).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::WorkflowExecutionAlreadyStarted(_)
    ));
}

#[tokio::test]
async fn reuse_allow_duplicate_accepts_any_close() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-allow", "request-1").await;
    terminate(&fixture, "wf-allow", &run_id).await;

    let response = fixture
        .engine
        .start_workflow_execution(start_request("wf-allow", "request-2"))
        .await
        .unwrap();
    assert_ne!(response.run_id, run_id);

    let current = fixture
        .shard
        .get_current_execution(DOMAIN_ID, "wf-allow")
        .await
        .unwrap();
    assert_eq!(current.run_id, response.run_id);
}

#[tokio::test]
async fn start_validation_rejects_bad_requests() {
    let fixture = engine_fixture();

    let mut missing_request_id = start_request("wf-v", "");
    missing_request_id.request_id = String::new();
    assert!(matches!(
        fixture
            .engine
            .start_workflow_execution(missing_request_id)
            .await,
        Err(EngineError::BadRequest { .. })
    ));

    let mut bad_timeout = start_request("wf-v", "r");
    bad_timeout.execution_timeout_seconds = 0;
    assert!(matches!(
        fixture.engine.start_workflow_execution(bad_timeout).await,
        Err(EngineError::BadRequest { .. })
    ));

    let mut no_task_list = start_request("wf-v", "r");
    no_task_list.task_list = String::new();
    assert!(matches!(
        fixture.engine.start_workflow_execution(no_task_list).await,
        Err(EngineError::BadRequest { .. })
    ));

    let mut bad_cron = start_request("wf-v", "r");
    bad_cron.cron_schedule = "every five minutes".into();
    assert!(matches!(
        fixture.engine.start_workflow_execution(bad_cron).await,
        Err(EngineError::BadRequest { .. })
    ));

    let mut bad_domain = start_request("wf-v", "r");
    bad_domain.domain_id = "not-a-uuid".into();
    assert!(matches!(
        fixture.engine.start_workflow_execution(bad_domain).await,
        Err(EngineError::BadRequest { .. })
    ));
}

#[tokio::test]
async fn cron_start_delays_first_decision() {
    let fixture = engine_fixture();
    let mut request = start_request("wf-cron", "request-1");
    request.cron_schedule = "*/5 * * * *".into();
    request.first_decision_backoff_seconds = 120;
    let run_id = fixture
        .engine
        .start_workflow_execution(request)
        .await
        .unwrap()
        .run_id;

    // no decision scheduled while the backoff is pending
    let events = history(&fixture, "wf-cron", &run_id);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0].attributes,
        EventAttributes::WorkflowExecutionStarted { .. }
    ));
    assert!(!fixture
        .shard
        .transfer_tasks()
        .iter()
        .any(|t| matches!(t.kind, TransferTaskKind::DecisionTask { .. })));

    let timers = fixture.shard.timer_tasks();
    assert!(timers
        .iter()
        .any(|t| matches!(t.kind, TimerTaskKind::WorkflowBackoff { .. })));
    // the workflow timeout accounts for the backoff
    let timeout = timers
        .iter()
        .find(|t| matches!(t.kind, TimerTaskKind::WorkflowTimeout))
        .unwrap();
    let backoff = timers
        .iter()
        .find(|t| matches!(t.kind, TimerTaskKind::WorkflowBackoff { .. }))
        .unwrap();
    assert_eq!(timeout.fire_at_ms - backoff.fire_at_ms, 60_000);
}

#[tokio::test]
async fn create_timeout_is_tentative_success_and_leaks_history() {
    let fixture = engine_fixture();
    fixture
        .shard
        .inject_create_error(EngineError::ShardOperationTimeout);

    let response = fixture
        .engine
        .start_workflow_execution(start_request("wf-timeout", "request-1"))
        .await
        .unwrap();
    assert!(response.timed_out);

    // orphan history is deliberately not deleted on the timeout path
    assert!(!history(&fixture, "wf-timeout", &response.run_id).is_empty());
}

#[tokio::test]
async fn create_failure_deletes_orphan_history() {
    let fixture = engine_fixture();
    fixture
        .shard
        .inject_create_error(EngineError::internal("disk on fire"));

    let err = fixture
        .engine
        .start_workflow_execution(start_request("wf-fail", "request-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Internal { .. }));

    // no current run, and whatever history was appended is gone
    assert!(fixture
        .shard
        .get_current_execution(DOMAIN_ID, "wf-fail")
        .await
        .is_err());
}
