//! Long-poll `get_mutable_state`: wake on new events, wake on close,
//! expiration, and subscription cleanup on every exit path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;

use shardflow::config::Config;
use shardflow::engine::{GetMutableStateRequest, SignalWorkflowExecutionRequest};
use shardflow::{WorkflowExecution, WorkflowIdentifier};

fn get_state_request(workflow_id: &str, run_id: &str, expected: Option<i64>) -> GetMutableStateRequest {
    GetMutableStateRequest {
        domain_id: DOMAIN_ID.to_string(),
        execution: WorkflowExecution::new(workflow_id, run_id),
        expected_next_event_id: expected,
    }
}

#[tokio::test]
async fn snapshot_returns_current_state_without_blocking() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-poll", "r1").await;

    let response = fixture
        .engine
        .get_mutable_state(get_state_request("wf-poll", &run_id, None))
        .await
        .unwrap();
    assert_eq!(response.next_event_id, 3);
    assert!(response.is_workflow_running);
    assert_eq!(response.workflow_type, "TestWorkflow");
}

#[tokio::test]
async fn empty_run_id_resolves_to_the_current_run() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-poll-current", "r1").await;

    let response = fixture
        .engine
        .get_mutable_state(get_state_request("wf-poll-current", "", None))
        .await
        .unwrap();
    assert_eq!(response.execution.run_id, run_id);
}

#[tokio::test]
async fn long_poll_wakes_on_new_events() {
    let fixture = Arc::new(engine_fixture());
    let run_id = start_workflow(&fixture, "wf-poll-wake", "r1").await;
    let current_next = fixture
        .engine
        .get_mutable_state(get_state_request("wf-poll-wake", &run_id, None))
        .await
        .unwrap()
        .next_event_id;

    let poller = {
        let fixture = fixture.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            fixture
                .engine
                .get_mutable_state(get_state_request("wf-poll-wake", &run_id, Some(current_next)))
                .await
        })
    };

    // give the poller time to subscribe, then produce an event
    tokio::time::sleep(Duration::from_millis(100)).await;
    fixture
        .engine
        .signal_workflow_execution(SignalWorkflowExecutionRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution::new("wf-poll-wake", run_id.as_str()),
            signal_name: "wake".into(),
            input: String::new(),
            identity: "s".into(),
            request_id: "r".into(),
            external_execution: None,
            child_workflow_only: false,
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), poller)
        .await
        .expect("long poll should wake")
        .unwrap()
        .unwrap();
    assert!(response.next_event_id > current_next);

    // the subscription was released on exit
    let identifier = WorkflowIdentifier::new(DOMAIN_ID, "wf-poll-wake", run_id.as_str());
    assert_eq!(fixture.notifier.subscriber_count(&identifier), 0);
}

#[tokio::test]
async fn long_poll_expires_with_the_current_snapshot() {
    let mut config = Config::default();
    config.long_poll_expiration_interval = Duration::from_millis(100);
    let fixture = engine_fixture_with_config(config);
    let run_id = start_workflow(&fixture, "wf-poll-expire", "r1").await;
    let current_next = 3;

    let started = std::time::Instant::now();
    let response = fixture
        .engine
        .get_mutable_state(get_state_request("wf-poll-expire", &run_id, Some(current_next)))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(response.next_event_id, current_next);

    let identifier = WorkflowIdentifier::new(DOMAIN_ID, "wf-poll-expire", run_id.as_str());
    assert_eq!(fixture.notifier.subscriber_count(&identifier), 0);
}

#[tokio::test]
async fn long_poll_returns_immediately_when_expectation_already_met() {
    let fixture = engine_fixture();
    let run_id = start_workflow(&fixture, "wf-poll-met", "r1").await;

    // expected below the current next event ID: no blocking
    let started = std::time::Instant::now();
    let response = fixture
        .engine
        .get_mutable_state(get_state_request("wf-poll-met", &run_id, Some(1)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response.next_event_id, 3);
}
