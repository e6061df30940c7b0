//! Decision-batch processing: completions, cron and retry continue-as-new,
//! the fail-decision path, size limits and inline decision delivery.

mod common;

use common::*;

use shardflow::config::Config;
use shardflow::engine::SignalWorkflowExecutionRequest;
use shardflow::shard::ExecutionStore;
use shardflow::{
    CompleteWorkflowExecutionAttributes, ContinueAsNewInitiator, Decision,
    DecisionTaskFailedCause, EngineError, EventAttributes, FailWorkflowExecutionAttributes,
    RequestCancelActivityTaskAttributes, RetryPolicy, ScheduleActivityTaskAttributes,
    StartTimerAttributes, TimerTaskKind, TransferTaskKind, WorkflowExecution,
    FAILURE_REASON_BLOB_SIZE_EXCEEDS_LIMIT, FAILURE_REASON_TRANSACTION_SIZE_EXCEEDS_LIMIT,
};

fn complete_workflow_decision(result: &str) -> Decision {
    Decision::CompleteWorkflowExecution(CompleteWorkflowExecutionAttributes {
        result: result.to_string(),
    })
}

fn schedule_activity_decision(activity_id: &str) -> Decision {
    Decision::ScheduleActivityTask(ScheduleActivityTaskAttributes {
        activity_id: activity_id.to_string(),
        activity_type: "TestActivity".to_string(),
        task_list: "activity-task-list".to_string(),
        input: "payload".to_string(),
        schedule_to_close_timeout_seconds: 30,
        schedule_to_start_timeout_seconds: 10,
        start_to_close_timeout_seconds: 20,
        ..Default::default()
    })
}

async fn signal(fixture: &EngineFixture, workflow_id: &str, run_id: &str, request_id: &str) {
    fixture
        .engine
        .signal_workflow_execution(SignalWorkflowExecutionRequest {
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution::new(workflow_id, run_id),
            signal_name: "sig".into(),
            input: "data".into(),
            identity: "signaler".into(),
            request_id: request_id.to_string(),
            external_execution: None,
            child_workflow_only: false,
        })
        .await
        .expect("signal");
}

#[tokio::test]
async fn complete_workflow_closes_run_and_emits_cleanup_tasks() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-complete", "r1").await;

    complete_decision(
        &fixture,
        "wf-complete",
        &run_id,
        schedule_id,
        0,
        vec![complete_workflow_decision("done")],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-complete", &run_id);
    let last = events.last().unwrap();
    assert!(matches!(
        last.attributes,
        EventAttributes::WorkflowExecutionCompleted { .. }
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::DecisionTaskCompleted { .. })));

    let transfer = fixture.shard.transfer_tasks();
    assert!(transfer
        .iter()
        .any(|t| matches!(t.kind, TransferTaskKind::CloseExecution)));
    let timers = fixture.shard.timer_tasks();
    assert!(timers
        .iter()
        .any(|t| matches!(t.kind, TimerTaskKind::DeleteHistoryEvent)));
}

#[tokio::test]
async fn schedule_activity_emits_transfer_and_timer_tasks() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-activity", "r1").await;

    complete_decision(
        &fixture,
        "wf-activity",
        &run_id,
        schedule_id,
        0,
        vec![schedule_activity_decision("act-1")],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-activity", &run_id);
    let scheduled = events
        .iter()
        .find(|e| matches!(e.attributes, EventAttributes::ActivityTaskScheduled { .. }))
        .expect("activity scheduled event");

    // the transfer task points at the schedule event that justified it
    let transfer = fixture.shard.transfer_tasks();
    let activity_task = transfer
        .iter()
        .find_map(|t| match &t.kind {
            TransferTaskKind::ActivityTask { schedule_id, .. } => Some(*schedule_id),
            _ => None,
        })
        .expect("activity transfer task");
    assert_eq!(activity_task, scheduled.event_id);

    assert!(fixture
        .shard
        .timer_tasks()
        .iter()
        .any(|t| matches!(t.kind, TimerTaskKind::ActivityTimeout { .. })));
}

#[tokio::test]
async fn cron_completion_continues_as_new() {
    let fixture = engine_fixture();
    let mut request = start_request("wf-cron-can", "r1");
    request.cron_schedule = "*/5 * * * *".into();
    let run_id = fixture
        .engine
        .start_workflow_execution(request)
        .await
        .unwrap()
        .run_id;
    let schedule_id = latest_decision_task_schedule_id(&fixture);
    poll_decision(&fixture, "wf-cron-can", &run_id, schedule_id).await;

    complete_decision(
        &fixture,
        "wf-cron-can",
        &run_id,
        schedule_id,
        0,
        vec![complete_workflow_decision("cron-result")],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-cron-can", &run_id);
    // continued-as-new instead of completed, with the cron initiator and a
    // non-zero backoff
    assert!(!events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionCompleted { .. })));
    let can = events
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::WorkflowExecutionContinuedAsNew {
                initiator,
                backoff_start_interval_seconds,
                new_execution_run_id,
                last_completion_result,
                ..
            } => Some((
                *initiator,
                *backoff_start_interval_seconds,
                new_execution_run_id.clone(),
                last_completion_result.clone(),
            )),
            _ => None,
        })
        .expect("continued-as-new event");
    assert_eq!(can.0, ContinueAsNewInitiator::CronSchedule);
    assert!(can.1 > 0 && can.1 <= 300);
    assert_eq!(can.3.as_deref(), Some("cron-result"));

    // the successor run is now current, carries the start event and waits
    // behind a backoff timer
    let current = fixture
        .shard
        .get_current_execution(DOMAIN_ID, "wf-cron-can")
        .await
        .unwrap();
    assert_eq!(current.run_id, can.2);
    let successor_events = history(&fixture, "wf-cron-can", &can.2);
    assert!(matches!(
        successor_events[0].attributes,
        EventAttributes::WorkflowExecutionStarted { .. }
    ));
    assert!(fixture
        .shard
        .timer_tasks()
        .iter()
        .any(|t| matches!(t.kind, TimerTaskKind::WorkflowBackoff { .. })));
}

#[tokio::test]
async fn failed_workflow_with_retry_policy_continues_as_new() {
    let fixture = engine_fixture();
    let mut request = start_request("wf-retry", "r1");
    request.retry_policy = Some(RetryPolicy {
        initial_interval_seconds: 5,
        backoff_coefficient: 2.0,
        maximum_interval_seconds: 60,
        maximum_attempts: 3,
        expiration_seconds: 0,
        non_retriable_reasons: vec![],
    });
    let run_id = fixture
        .engine
        .start_workflow_execution(request)
        .await
        .unwrap()
        .run_id;
    let schedule_id = latest_decision_task_schedule_id(&fixture);
    poll_decision(&fixture, "wf-retry", &run_id, schedule_id).await;

    complete_decision(
        &fixture,
        "wf-retry",
        &run_id,
        schedule_id,
        0,
        vec![Decision::FailWorkflowExecution(FailWorkflowExecutionAttributes {
            reason: "boom".into(),
            details: "stack".into(),
        })],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-retry", &run_id);
    assert!(!events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionFailed { .. })));
    let (initiator, backoff) = events
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::WorkflowExecutionContinuedAsNew {
                initiator,
                backoff_start_interval_seconds,
                ..
            } => Some((*initiator, *backoff_start_interval_seconds)),
            _ => None,
        })
        .expect("continued-as-new event");
    assert_eq!(initiator, ContinueAsNewInitiator::RetryPolicy);
    assert_eq!(backoff, 5);
}

#[tokio::test]
async fn unhandled_events_fail_the_completion_decision() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-unhandled", "r1").await;

    // arrives while the decision is started: buffered
    signal(&fixture, "wf-unhandled", &run_id, "sig-req-1").await;

    complete_decision(
        &fixture,
        "wf-unhandled",
        &run_id,
        schedule_id,
        0,
        vec![complete_workflow_decision("too-early")],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-unhandled", &run_id);
    assert!(!events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionCompleted { .. })));
    let failed = events
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::DecisionTaskFailed { cause, .. } => Some(*cause),
            _ => None,
        })
        .expect("decision task failed event");
    assert_eq!(failed, DecisionTaskFailedCause::UnhandledDecision);
    // the buffered signal flushed once the decision left the started state
    assert!(events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionSignaled { .. })));

    // the worker gets a fresh (transient) decision attempt
    let retry_schedule_id = latest_decision_task_schedule_id(&fixture);
    let started = poll_decision(&fixture, "wf-unhandled", &run_id, retry_schedule_id).await;
    assert_eq!(started.attempt, 1);
    assert!(started.transient_decision.is_some());

    // completing the retry materializes the transient events and closes
    complete_decision(
        &fixture,
        "wf-unhandled",
        &run_id,
        retry_schedule_id,
        1,
        vec![complete_workflow_decision("now")],
    )
    .await
    .unwrap();
    let events = history(&fixture, "wf-unhandled", &run_id);
    assert!(events
        .iter()
        .any(|e| matches!(
            e.attributes,
            EventAttributes::DecisionTaskScheduled { attempt: 1, .. }
        )));
    assert!(matches!(
        events.last().unwrap().attributes,
        EventAttributes::WorkflowExecutionCompleted { .. }
    ));
}

#[tokio::test]
async fn multiple_completion_decisions_keep_only_the_first() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-multi", "r1").await;

    complete_decision(
        &fixture,
        "wf-multi",
        &run_id,
        schedule_id,
        0,
        vec![
            complete_workflow_decision("first"),
            complete_workflow_decision("second"),
        ],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-multi", &run_id);
    let completions = events
        .iter()
        .filter(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn duplicate_timer_id_fails_the_decision() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-timer-dup", "r1").await;

    let timer = |id: &str| {
        Decision::StartTimer(StartTimerAttributes {
            timer_id: id.to_string(),
            start_to_fire_timeout_seconds: 60,
        })
    };
    complete_decision(
        &fixture,
        "wf-timer-dup",
        &run_id,
        schedule_id,
        0,
        vec![timer("t1"), timer("t1")],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-timer-dup", &run_id);
    let cause = events
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::DecisionTaskFailed { cause, .. } => Some(*cause),
            _ => None,
        })
        .expect("decision failed");
    assert_eq!(cause, DecisionTaskFailedCause::StartTimerDuplicateId);
    // the pending mutations were discarded: no TimerStarted survived
    assert!(!events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::TimerStarted { .. })));
}

#[tokio::test]
async fn oversized_payload_fails_the_workflow() {
    let mut config = Config::default();
    config.blob_size_limit_warn = 16;
    config.blob_size_limit_error = 32;
    let fixture = engine_fixture_with_config(config);
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-blob", "r1").await;

    let mut decision = schedule_activity_decision("act-big");
    if let Decision::ScheduleActivityTask(attrs) = &mut decision {
        attrs.input = "x".repeat(64);
    }
    complete_decision(&fixture, "wf-blob", &run_id, schedule_id, 0, vec![decision])
        .await
        .unwrap();

    let events = history(&fixture, "wf-blob", &run_id);
    let reason = events
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::WorkflowExecutionFailed { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .expect("workflow failed event");
    assert_eq!(reason, FAILURE_REASON_BLOB_SIZE_EXCEEDS_LIMIT);
    let current = fixture
        .shard
        .get_current_execution(DOMAIN_ID, "wf-blob")
        .await
        .unwrap();
    assert_eq!(current.state, shardflow::WorkflowState::Completed);
}

#[tokio::test]
async fn cancel_unstarted_activity_cancels_immediately_and_reschedules() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-cancel-act", "r1").await;

    complete_decision(
        &fixture,
        "wf-cancel-act",
        &run_id,
        schedule_id,
        0,
        vec![schedule_activity_decision("act-1")],
    )
    .await
    .unwrap();

    // a signal schedules the decision that will carry the cancel
    signal(&fixture, "wf-cancel-act", &run_id, "poke").await;
    let schedule = latest_decision_task_schedule_id(&fixture);
    poll_decision(&fixture, "wf-cancel-act", &run_id, schedule).await;

    complete_decision(
        &fixture,
        "wf-cancel-act",
        &run_id,
        schedule,
        0,
        vec![Decision::RequestCancelActivityTask(
            RequestCancelActivityTaskAttributes {
                activity_id: "act-1".into(),
            },
        )],
    )
    .await
    .unwrap();

    let events = history(&fixture, "wf-cancel-act", &run_id);
    assert!(events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::ActivityTaskCancelRequested { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::ActivityTaskCanceled { .. })));
    // cancellation before start forces a fresh decision so the workflow
    // observes it
    assert!(events
        .iter()
        .filter(|e| matches!(e.attributes, EventAttributes::DecisionTaskScheduled { .. }))
        .count()
        >= 2);
}

#[tokio::test]
async fn return_new_decision_task_inline() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-inline", "r1").await;

    let response = fixture
        .engine
        .respond_decision_task_completed(
            shardflow::engine::RespondDecisionTaskCompletedRequest {
                domain_id: DOMAIN_ID.to_string(),
                task_token: decision_token("wf-inline", &run_id, schedule_id, 0),
                decisions: vec![],
                identity: "worker".into(),
                force_create_new_decision_task: true,
                return_new_decision_task: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let started = response.started_response.expect("inline decision task");
    assert!(started.sticky_execution_enabled);
    // the inline decision is already started: no transfer task was created
    let transfer = fixture.shard.transfer_tasks();
    let decision_tasks = transfer
        .iter()
        .filter(|t| matches!(t.kind, TransferTaskKind::DecisionTask { .. }))
        .count();
    assert_eq!(decision_tasks, 1, "only the first decision went through the queue");

    let events = history(&fixture, "wf-inline", &run_id);
    assert!(matches!(
        events.last().unwrap().attributes,
        EventAttributes::DecisionTaskStarted { .. }
    ));
}

#[tokio::test]
async fn transaction_size_limit_terminates_the_workflow() {
    let fixture = engine_fixture();
    let (run_id, schedule_id) = start_and_poll(&fixture, "wf-txn", "r1").await;

    fixture.shard.inject_update_error(EngineError::TransactionSizeLimit {
        message: "batch too large".into(),
    });

    let err = complete_decision(
        &fixture,
        "wf-txn",
        &run_id,
        schedule_id,
        0,
        vec![complete_workflow_decision("big")],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::TransactionSizeLimit { .. }));

    let events = history(&fixture, "wf-txn", &run_id);
    let reason = events
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::WorkflowExecutionTerminated { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .expect("terminated event");
    assert_eq!(reason, FAILURE_REASON_TRANSACTION_SIZE_EXCEEDS_LIMIT);
    assert!(fixture
        .shard
        .transfer_tasks()
        .iter()
        .any(|t| matches!(t.kind, TransferTaskKind::CloseExecution)));
}
