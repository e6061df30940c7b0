//! Request and response shapes of the engine's public operations. The RPC
//! surface lives outside this crate; these are the types it maps onto.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::state::ReplicationInfo;
use crate::{
    Decision, DecisionTaskFailedCause, HistoryEvent, ParentExecutionInfo, RetryPolicy,
    TimeoutKind, WorkflowExecution, WorkflowIdReusePolicy,
};

#[derive(Debug, Clone, Default)]
pub struct StartWorkflowExecutionRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: String,
    pub execution_timeout_seconds: i32,
    pub decision_timeout_seconds: i32,
    pub identity: String,
    /// Idempotency key: repeating a start with the same request ID returns
    /// the run it originally created.
    pub request_id: String,
    pub reuse_policy: WorkflowIdReusePolicy,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: String,
    pub first_decision_backoff_seconds: i32,
    pub parent: Option<ParentExecutionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartWorkflowExecutionResponse {
    pub run_id: String,
    /// The create timed out at persistence but the run may exist; retrying
    /// with the same request ID resolves the ambiguity.
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct GetMutableStateRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    /// Long-poll trigger: block while `next_event_id <= expected` and the
    /// workflow is running.
    pub expected_next_event_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct GetMutableStateResponse {
    pub execution: WorkflowExecution,
    pub workflow_type: String,
    pub last_first_event_id: i64,
    pub next_event_id: i64,
    pub previous_started_event_id: Option<i64>,
    pub task_list: String,
    pub sticky_task_list: String,
    pub sticky_schedule_to_start_timeout_seconds: i32,
    pub is_workflow_running: bool,
    pub replication_info: HashMap<String, ReplicationInfo>,
}

#[derive(Debug, Clone)]
pub struct RecordDecisionTaskStartedRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    pub request_id: String,
    pub identity: String,
}

/// Transient decision attempts live only in mutable state; the response
/// synthesizes the scheduled/started events the worker would otherwise read
/// from history.
#[derive(Debug, Clone)]
pub struct TransientDecisionInfo {
    pub scheduled_event: HistoryEvent,
    pub started_event: HistoryEvent,
}

#[derive(Debug, Clone)]
pub struct RecordDecisionTaskStartedResponse {
    pub workflow_type: String,
    pub previous_started_event_id: Option<i64>,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub next_event_id: i64,
    pub attempt: i64,
    pub sticky_execution_enabled: bool,
    pub task_list: String,
    pub scheduled_timestamp_ms: i64,
    pub started_timestamp_ms: i64,
    pub transient_decision: Option<TransientDecisionInfo>,
}

#[derive(Debug, Clone)]
pub struct RecordActivityTaskStartedRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub schedule_id: i64,
    pub request_id: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RecordActivityTaskStartedResponse {
    pub activity_id: String,
    pub activity_type: String,
    pub input: String,
    pub scheduled_timestamp_ms: i64,
    pub started_timestamp_ms: i64,
    pub attempt: i32,
    pub heartbeat_details: String,
    pub workflow_type: String,
    pub workflow_domain: String,
}

/// Worker affinity attributes carried on decision completions.
#[derive(Debug, Clone)]
pub struct StickyExecutionAttributes {
    pub worker_task_list: String,
    pub schedule_to_start_timeout_seconds: i32,
}

#[derive(Debug, Clone, Default)]
pub struct RespondDecisionTaskCompletedRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub decisions: Vec<Decision>,
    pub identity: String,
    pub binary_checksum: String,
    pub sticky_attributes: Option<StickyExecutionAttributes>,
    /// Worker wants another decision task even without new events.
    pub force_create_new_decision_task: bool,
    /// Deliver the next decision task inline in the response, bypassing the
    /// transfer queue.
    pub return_new_decision_task: bool,
}

impl Default for StickyExecutionAttributes {
    fn default() -> Self {
        StickyExecutionAttributes {
            worker_task_list: String::new(),
            schedule_to_start_timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RespondDecisionTaskCompletedResponse {
    pub started_response: Option<RecordDecisionTaskStartedResponse>,
}

#[derive(Debug, Clone)]
pub struct RespondDecisionTaskFailedRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub cause: DecisionTaskFailedCause,
    pub details: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RespondActivityTaskCompletedRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub result: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RespondActivityTaskFailedRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub reason: String,
    pub details: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RespondActivityTaskCanceledRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub details: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RecordActivityTaskHeartbeatRequest {
    pub domain_id: String,
    pub task_token: Vec<u8>,
    pub details: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordActivityTaskHeartbeatResponse {
    pub cancel_requested: bool,
}

#[derive(Debug, Clone)]
pub struct RequestCancelWorkflowExecutionRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub cause: String,
    pub identity: String,
    pub request_id: Option<String>,
    /// When set, the request is honored only if it names this run's parent.
    pub external_execution: Option<WorkflowExecution>,
    pub child_workflow_only: bool,
}

#[derive(Debug, Clone)]
pub struct SignalWorkflowExecutionRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub signal_name: String,
    pub input: String,
    pub identity: String,
    /// Dedup key; empty disables deduplication.
    pub request_id: String,
    pub external_execution: Option<WorkflowExecution>,
    pub child_workflow_only: bool,
}

#[derive(Debug, Clone)]
pub struct SignalWithStartWorkflowExecutionRequest {
    pub start: StartWorkflowExecutionRequest,
    pub signal_name: String,
    pub signal_input: String,
}

#[derive(Debug, Clone)]
pub struct RemoveSignalMutableStateRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub request_id: String,
}

#[derive(Debug, Clone)]
pub struct TerminateWorkflowExecutionRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub reason: String,
    pub details: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct ScheduleDecisionTaskRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub is_first_decision: bool,
}

#[derive(Debug, Clone)]
pub struct RecordChildExecutionStartedRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub initiated_event_id: i64,
    pub child_domain: String,
    pub child_execution: WorkflowExecution,
    pub child_workflow_type: String,
}

/// Terminal outcome of a child execution, routed into the parent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildCompletion {
    Completed { result: String },
    Failed { reason: String, details: String },
    Canceled { details: String },
    Terminated,
    TimedOut { timeout_kind: TimeoutKind },
}

#[derive(Debug, Clone)]
pub struct RecordChildExecutionCompletedRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub initiated_event_id: i64,
    pub completed_execution: WorkflowExecution,
    pub completion: ChildCompletion,
}

#[derive(Debug, Clone)]
pub struct ResetWorkflowExecutionRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub reason: String,
    pub decision_finish_event_id: i64,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetWorkflowExecutionResponse {
    pub run_id: String,
}

#[derive(Debug, Clone)]
pub struct ResetStickyTaskListRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
}

#[derive(Debug, Clone)]
pub struct DescribeWorkflowExecutionRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
}

#[derive(Debug, Clone)]
pub struct PendingActivityDescription {
    pub activity_id: String,
    pub activity_type: String,
    pub state: PendingActivityState,
    pub scheduled_timestamp_ms: Option<i64>,
    pub last_started_timestamp_ms: Option<i64>,
    pub last_heartbeat_timestamp_ms: Option<i64>,
    pub heartbeat_details: Option<String>,
    pub attempt: i32,
    pub maximum_attempts: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingActivityState {
    Scheduled,
    Started,
    CancelRequested,
}

#[derive(Debug, Clone)]
pub struct DescribeWorkflowExecutionResponse {
    pub execution: WorkflowExecution,
    pub workflow_type: String,
    pub task_list: String,
    pub execution_timeout_seconds: i32,
    pub decision_timeout_seconds: i32,
    pub start_timestamp_ms: i64,
    /// Start adjusted by cron/retry backoff.
    pub execution_timestamp_ms: i64,
    pub history_length: i64,
    pub close_status: Option<crate::WorkflowCloseStatus>,
    pub close_timestamp_ms: Option<i64>,
    pub parent: Option<WorkflowExecution>,
    pub pending_activities: Vec<PendingActivityDescription>,
}

#[derive(Debug, Clone)]
pub struct DescribeMutableStateRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
}

/// Diagnostic dual view of the mutable state, JSON-rendered.
#[derive(Debug, Clone)]
pub struct DescribeMutableStateResponse {
    pub mutable_state_in_cache: Option<String>,
    pub mutable_state_in_database: String,
}

#[derive(Debug, Clone)]
pub struct SyncShardStatusRequest {
    pub source_cluster: String,
    pub timestamp_ms: i64,
}

/// Opaque replication payloads; the replication algorithm lives with the
/// injected [`super::Replicator`].
#[derive(Debug, Clone)]
pub struct ReplicateEventsRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub version: i64,
    pub events: Vec<HistoryEvent>,
    pub new_run_events: Vec<HistoryEvent>,
}

#[derive(Debug, Clone)]
pub struct ReplicateRawEventsRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub history_blob: Vec<u8>,
    pub new_run_history_blob: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SyncActivityRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub scheduled_id: i64,
    pub version: i64,
    pub attempt: i32,
    pub last_heartbeat_ms: i64,
    pub details: String,
}

/// Retention timer payload driving visibility deletion and archival.
#[derive(Debug, Clone)]
pub struct RetentionTask {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub task_id: i64,
}

/// Retention-time archival hand-off payload.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
}
