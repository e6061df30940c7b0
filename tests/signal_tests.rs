//! Signals: dedup, caps, signal-with-start and OCC conflict recovery.

mod common;

use common::*;

use shardflow::config::Config;
use shardflow::engine::{
    RemoveSignalMutableStateRequest, SignalWithStartWorkflowExecutionRequest,
    SignalWorkflowExecutionRequest, TerminateWorkflowExecutionRequest,
};
use shardflow::shard::{ShardContext, UpdateWorkflowExecutionRequest};
use shardflow::{EngineError, EventAttributes, TransferTaskKind, WorkflowExecution};

fn signal_request(workflow_id: &str, run_id: &str, request_id: &str) -> SignalWorkflowExecutionRequest {
    SignalWorkflowExecutionRequest {
        domain_id: DOMAIN_ID.to_string(),
        execution: WorkflowExecution::new(workflow_id, run_id),
        signal_name: "sig".into(),
        input: "data".into(),
        identity: "signaler".into(),
        request_id: request_id.to_string(),
        external_execution: None,
        child_workflow_only: false,
    }
}

fn signaled_count(fixture: &EngineFixture, workflow_id: &str, run_id: &str) -> usize {
    history(fixture, workflow_id, run_id)
        .iter()
        .filter(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionSignaled { .. }))
        .count()
}

#[tokio::test]
async fn signal_appends_event_and_schedules_decision() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-sig", "r1").await;
    // consume the first decision task so the signal needs a new one
    let first = latest_decision_task_schedule_id(&fixture);
    poll_decision(&fixture, "wf-sig", &run_id, first).await;
    complete_decision(&fixture, "wf-sig", &run_id, first, 0, vec![]).await.unwrap();

    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig", &run_id, "req-1"))
        .await
        .unwrap();

    assert_eq!(signaled_count(&fixture, "wf-sig", &run_id), 1);
    let decision_tasks = fixture
        .shard
        .transfer_tasks()
        .iter()
        .filter(|t| matches!(t.kind, TransferTaskKind::DecisionTask { .. }))
        .count();
    assert_eq!(decision_tasks, 2, "signal scheduled a fresh decision task");
}

#[tokio::test]
async fn signal_is_deduplicated_by_request_id() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-sig-dedup", "r1").await;

    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-dedup", &run_id, "same-request"))
        .await
        .unwrap();
    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-dedup", &run_id, "same-request"))
        .await
        .unwrap();

    assert_eq!(signaled_count(&fixture, "wf-sig-dedup", &run_id), 1);
}

#[tokio::test]
async fn removing_the_request_id_allows_the_signal_again() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-sig-remove", "r1").await;

    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-remove", &run_id, "req"))
        .await
        .unwrap();
    fixture
        .engine
        .remove_signal_mutable_state(RemoveSignalMutableStateRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution::new("wf-sig-remove", run_id.as_str()),
            request_id: "req".into(),
        })
        .await
        .unwrap();
    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-remove", &run_id, "req"))
        .await
        .unwrap();

    assert_eq!(signaled_count(&fixture, "wf-sig-remove", &run_id), 2);
}

#[tokio::test]
async fn signal_cap_is_enforced_one_below_cap_succeeds() {
    let mut config = Config::default();
    config.maximum_signals_per_execution = 2;
    let fixture = engine_fixture_with_config(config);
    let run_id = start_workflow(&fixture, "wf-sig-cap", "r1").await;

    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-cap", &run_id, "r-a"))
        .await
        .unwrap();
    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-cap", &run_id, "r-b"))
        .await
        .unwrap();
    let err = fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-cap", &run_id, "r-c"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::SignalsLimitExceeded);
    assert_eq!(signaled_count(&fixture, "wf-sig-cap", &run_id), 2);
}

#[tokio::test]
async fn signal_on_closed_workflow_is_rejected() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-sig-closed", "r1").await;
    fixture
        .engine
        .terminate_workflow_execution(TerminateWorkflowExecutionRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution::new("wf-sig-closed", run_id.as_str()),
            reason: "done".into(),
            details: String::new(),
            identity: "t".into(),
        })
        .await
        .unwrap();

    let err = fixture
        .engine
        .signal_workflow_execution(signal_request("wf-sig-closed", &run_id, "r"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WorkflowCompleted);
}

// An out-of-band write advances the condition under the engine's feet; the
// cached state loses exactly one conditional update, reloads and wins.
#[tokio::test]
async fn occ_conflict_is_recovered_with_one_retry() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-occ", "r1").await;

    // warm the cache
    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-occ", &run_id, "warm"))
        .await
        .unwrap();
    assert_eq!(fixture.engine.update_conflict_count(), 0);

    // out-of-band writer (e.g. another host) appends a signal directly
    let execution = WorkflowExecution::new("wf-occ", run_id.as_str());
    let mut snapshot = fixture
        .shard
        .get_workflow_execution(DOMAIN_ID, &execution)
        .await
        .unwrap();
    let condition = snapshot.next_event_id();
    snapshot
        .add_workflow_execution_signaled("external".into(), "".into(), "other-host".into(), 0)
        .unwrap();
    let batch = snapshot.close_transaction(ACTIVE_CLUSTER).unwrap();
    use shardflow::shard::{AppendHistoryEventsRequest, HistoryStore};
    fixture
        .shard
        .append_history_events(AppendHistoryEventsRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: execution.clone(),
            first_event_id: batch.first_event_id,
            events: batch.events,
            transaction_id: 999,
        })
        .await
        .unwrap();
    fixture
        .shard
        .update_workflow_execution(UpdateWorkflowExecutionRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: execution.clone(),
            snapshot,
            condition,
            transaction_id: 999,
            transfer_tasks: vec![],
            timer_tasks: vec![],
            replication_tasks: vec![],
            continue_as_new: None,
        })
        .await
        .unwrap();

    // the engine's cached state is now stale: one conflict, then success
    fixture
        .engine
        .signal_workflow_execution(signal_request("wf-occ", &run_id, "after"))
        .await
        .unwrap();
    assert_eq!(fixture.engine.update_conflict_count(), 1);
    assert_eq!(signaled_count(&fixture, "wf-occ", &run_id), 3);
}

#[tokio::test]
async fn signal_with_start_signals_the_running_execution() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-sws", "r1").await;

    let response = fixture
        .engine
        .signal_with_start_workflow_execution(SignalWithStartWorkflowExecutionRequest {
            start: start_request("wf-sws", "r2"),
            signal_name: "sig".into(),
            signal_input: "data".into(),
        })
        .await
        .unwrap();

    // same run: signaled, not restarted
    assert_eq!(response.run_id, run_id);
    assert_eq!(signaled_count(&fixture, "wf-sws", &run_id), 1);
}

#[tokio::test]
async fn signal_with_start_starts_fresh_when_none_running() {
    let fixture = engine_fixture();
    let response = fixture
        .engine
        .signal_with_start_workflow_execution(SignalWithStartWorkflowExecutionRequest {
            start: start_request("wf-sws-new", "r1"),
            signal_name: "sig".into(),
            signal_input: "data".into(),
        })
        .await
        .unwrap();

    let events = history(&fixture, "wf-sws-new", &response.run_id);
    assert!(matches!(
        events[0].attributes,
        EventAttributes::WorkflowExecutionStarted { .. }
    ));
    assert!(matches!(
        events[1].attributes,
        EventAttributes::WorkflowExecutionSignaled { .. }
    ));
    assert!(matches!(
        events[2].attributes,
        EventAttributes::DecisionTaskScheduled { .. }
    ));
}

#[tokio::test]
async fn signal_with_start_replaces_a_closed_run() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-sws-closed", "r1").await;
    fixture
        .engine
        .terminate_workflow_execution(TerminateWorkflowExecutionRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution::new("wf-sws-closed", run_id.as_str()),
            reason: "done".into(),
            details: String::new(),
            identity: "t".into(),
        })
        .await
        .unwrap();

    let response = fixture
        .engine
        .signal_with_start_workflow_execution(SignalWithStartWorkflowExecutionRequest {
            start: start_request("wf-sws-closed", "r2"),
            signal_name: "sig".into(),
            signal_input: "data".into(),
        })
        .await
        .unwrap();
    assert_ne!(response.run_id, run_id);
    assert_eq!(signaled_count(&fixture, "wf-sws-closed", &response.run_id), 1);
}
