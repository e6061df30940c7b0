//! # Shardflow: per-shard workflow history engine
//!
//! Shardflow is the history engine of a distributed, durable-workflow
//! orchestration service. One engine instance owns a contiguous range of
//! workflow executions (a *shard*) and is responsible for:
//!
//! - Accepting requests to start, signal, cancel, terminate and reset
//!   workflow executions.
//! - Recording the deterministic **event history** that defines each
//!   execution.
//! - Dispatching **decision tasks** and **activity tasks** to external
//!   workers and ingesting their responses.
//! - Scheduling **transfer tasks** (cross-shard / cross-system effects) and
//!   **timer tasks** (activity timeouts, decision timeouts, workflow
//!   timeouts, user timers, backoffs, retention deletion).
//! - Enforcing safety under concurrent updates via optimistic concurrency
//!   control on a monotonically increasing per-execution condition number.
//! - Participating in multi-cluster replication: domains have an active
//!   cluster, and failover must not drop tasks created before the handover.
//!
//! ## Key Concepts
//!
//! - **Mutable state**: the in-memory aggregate for one execution - pending
//!   activities, the in-flight decision, user timers, pending children, the
//!   signal dedup set, replication state and the event buffer. Loaded and
//!   persisted as one unit; see [`state::MutableState`].
//! - **Decision task**: a unit of work handed to a worker which replies with
//!   an ordered batch of [`Decision`]s. The engine applies the batch in one
//!   optimistic-concurrency transaction; see [`engine::Engine`].
//! - **Transfer / timer tasks**: durable records written atomically with the
//!   history events that justify them, then drained by external queue
//!   processors.
//! - **Continue-as-new**: a terminal event for one run that atomically
//!   starts a successor run sharing the workflow ID (cron re-fires and retry
//!   backoffs are expressed this way).
//!
//! ## Architecture
//!
//! ```text
//! worker RPC ──> Engine ──> ExecutionCache ──> ExecutionContext (lease)
//!                  │                               │
//!                  │        DecisionHandler mutates MutableState
//!                  │        TimerBuilder derives owed timer tasks
//!                  │                               │
//!                  │        history events + state delta + tasks persist
//!                  │        conditionally on the loaded condition number
//!                  │                               │
//!                  └──< ShardContextWrapper notifies queue processors,
//!                       HistoryEventNotifier wakes long-poll tailers
//! ```
//!
//! The persistence layer, the queue processors that drain persisted tasks,
//! the cross-cluster replicator and the matching service are external
//! collaborators reached through the traits in [`shard`], [`queues`] and
//! [`domain`]. [`shard::in_memory::InMemoryShard`] is a complete reference
//! store used by the integration tests and embeddable for local runs.

use serde::{Deserialize, Serialize};

pub mod cache;
pub mod config;
pub mod cron;
pub mod domain;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod queues;
pub mod shard;
pub mod state;
pub mod timers;

pub use config::Config;
pub use engine::Engine;
pub use error::EngineError;

/// First event ID of every run. History positions are contiguous from here.
pub const FIRST_EVENT_ID: i64 = 1;

/// Version recorded on events and tasks of executions in local-only domains.
pub const EMPTY_VERSION: i64 = 0;

/// Identity stamped on events the engine itself appends (size-limit
/// terminations and the like).
pub const ENGINE_IDENTITY: &str = "shardflow-history-engine";

/// Failure reason recorded when a decision payload exceeds the hard blob
/// size limit.
pub const FAILURE_REASON_BLOB_SIZE_EXCEEDS_LIMIT: &str = "DECISION_BLOB_SIZE_EXCEEDS_LIMIT";

/// Termination reason recorded when a persist is rejected for transaction
/// size and the run is force-closed.
pub const FAILURE_REASON_TRANSACTION_SIZE_EXCEEDS_LIMIT: &str = "TRANSACTION_SIZE_EXCEEDS_LIMIT";

pub(crate) const ACTIVITY_CANCELLATION_MSG_ACTIVITY_ID_UNKNOWN: &str = "ACTIVITY_ID_UNKNOWN";
pub(crate) const ACTIVITY_CANCELLATION_MSG_NOT_STARTED: &str = "ACTIVITY_ID_NOT_STARTED";
pub(crate) const TIMER_CANCELLATION_MSG_TIMER_ID_UNKNOWN: &str = "TIMER_ID_UNKNOWN";

/// Milliseconds since the Unix epoch. All engine timestamps use this scale.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Identity
// ============================================================================

/// A workflow execution within a domain: the workflow ID chosen by the
/// caller plus the engine-generated run ID (a fresh UUID per run).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Fully-qualified execution identity: the cache key, the notifier key and
/// the persistence key are all this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentifier {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowIdentifier {
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(self.workflow_id.clone(), self.run_id.clone())
    }
}

// ============================================================================
// Workflow lifecycle
// ============================================================================

/// Coarse lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
}

/// How a completed execution closed. `None` while the execution is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowCloseStatus {
    None,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
    ContinuedAsNew,
}

impl WorkflowCloseStatus {
    /// Close states that count as "failed" for the
    /// `AllowDuplicateFailedOnly` workflow-ID reuse policy.
    pub fn is_failed_close(&self) -> bool {
        matches!(
            self,
            WorkflowCloseStatus::Failed
                | WorkflowCloseStatus::Canceled
                | WorkflowCloseStatus::Terminated
                | WorkflowCloseStatus::TimedOut
        )
    }
}

/// Policy governing reuse of a workflow ID whose previous run has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowIdReusePolicy {
    AllowDuplicate,
    AllowDuplicateFailedOnly,
    RejectDuplicate,
}

impl Default for WorkflowIdReusePolicy {
    fn default() -> Self {
        WorkflowIdReusePolicy::AllowDuplicate
    }
}

/// What initiated a continue-as-new transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinueAsNewInitiator {
    Decider,
    RetryPolicy,
    CronSchedule,
}

// ============================================================================
// Retry policy
// ============================================================================

/// Server-side retry policy for workflows and activities.
///
/// Attempt counting is zero-based on the running attempt: the backoff before
/// attempt `n + 1` is `initial_interval * coefficient^n`, capped at
/// `maximum_interval`. Retries stop at `maximum_attempts`, at a
/// non-retriable failure reason, or once the next attempt would start past
/// the expiration time, whichever comes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_seconds: i32,
    pub backoff_coefficient: f64,
    pub maximum_interval_seconds: i32,
    pub maximum_attempts: i32,
    pub expiration_seconds: i32,
    pub non_retriable_reasons: Vec<String>,
}

impl RetryPolicy {
    /// Validate the shape of a caller-supplied policy.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.initial_interval_seconds <= 0 {
            return Err(EngineError::bad_request(
                "A valid InitialIntervalInSeconds is not set on retry policy.",
            ));
        }
        if self.backoff_coefficient < 1.0 {
            return Err(EngineError::bad_request(
                "BackoffCoefficient cannot be less than 1 on retry policy.",
            ));
        }
        if self.maximum_interval_seconds < 0 {
            return Err(EngineError::bad_request(
                "MaximumIntervalInSeconds cannot be negative on retry policy.",
            ));
        }
        if self.maximum_interval_seconds > 0
            && self.maximum_interval_seconds < self.initial_interval_seconds
        {
            return Err(EngineError::bad_request(
                "MaximumIntervalInSeconds cannot be less than InitialIntervalInSeconds on retry policy.",
            ));
        }
        if self.maximum_attempts < 0 {
            return Err(EngineError::bad_request(
                "MaximumAttempts cannot be negative on retry policy.",
            ));
        }
        if self.expiration_seconds < 0 {
            return Err(EngineError::bad_request(
                "ExpirationIntervalInSeconds cannot be negative on retry policy.",
            ));
        }
        if self.maximum_attempts == 0 && self.expiration_seconds == 0 {
            return Err(EngineError::bad_request(
                "MaximumAttempts and ExpirationIntervalInSeconds are both 0. At least one of them must be specified.",
            ));
        }
        Ok(())
    }

    /// Backoff in milliseconds before the next attempt, or `None` when the
    /// policy is exhausted for this `attempt` / `reason` / clock position.
    pub fn next_backoff(
        &self,
        attempt: i32,
        reason: &str,
        now_ms: i64,
        expiration_time_ms: i64,
    ) -> Option<i64> {
        if self.maximum_attempts == 0 && self.expiration_seconds == 0 {
            return None;
        }
        if self.maximum_attempts > 0 && attempt >= self.maximum_attempts - 1 {
            // the running attempt is the last one allowed
            return None;
        }
        if self.non_retriable_reasons.iter().any(|r| r == reason) {
            return None;
        }
        let factor = self.backoff_coefficient.powi(attempt.max(0));
        let mut interval_secs = (self.initial_interval_seconds as f64 * factor).ceil() as i64;
        if self.maximum_interval_seconds > 0 {
            interval_secs = interval_secs.min(self.maximum_interval_seconds as i64);
        }
        let backoff_ms = interval_secs * 1000;
        if expiration_time_ms > 0 && now_ms + backoff_ms >= expiration_time_ms {
            return None;
        }
        Some(backoff_ms)
    }
}

/// Validate an optional retry policy supplied on a request or decision.
pub fn validate_retry_policy(policy: Option<&RetryPolicy>) -> Result<(), EngineError> {
    match policy {
        Some(p) => p.validate(),
        None => Ok(()),
    }
}

// ============================================================================
// History events
// ============================================================================

/// One entry in the append-only history of a run.
///
/// `event_id` is the position in history (contiguous from
/// [`FIRST_EVENT_ID`]); `version` is the failover version of the cluster
/// that wrote the event ([`EMPTY_VERSION`] for local domains).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub timestamp_ms: i64,
    pub version: i64,
    #[serde(flatten)]
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Whether this event closes the run. Invariant: no event may follow a
    /// close event within one run.
    pub fn is_workflow_close(&self) -> bool {
        matches!(
            self.attributes,
            EventAttributes::WorkflowExecutionCompleted { .. }
                | EventAttributes::WorkflowExecutionFailed { .. }
                | EventAttributes::WorkflowExecutionCanceled { .. }
                | EventAttributes::WorkflowExecutionTerminated { .. }
                | EventAttributes::WorkflowExecutionTimedOut { .. }
                | EventAttributes::WorkflowExecutionContinuedAsNew { .. }
        )
    }
}

/// Event payloads, tagged by type for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: String,
        execution_timeout_seconds: i32,
        decision_timeout_seconds: i32,
        identity: String,
        request_id: String,
        parent: Option<ParentExecutionInfo>,
        retry_policy: Option<RetryPolicy>,
        attempt: i32,
        expiration_time_ms: i64,
        cron_schedule: String,
        first_decision_backoff_seconds: i32,
        initiator: Option<ContinueAsNewInitiator>,
        continued_from_run_id: Option<String>,
        continued_failure_reason: Option<String>,
        continued_failure_details: Option<String>,
        last_completion_result: Option<String>,
    },
    WorkflowExecutionCompleted {
        decision_task_completed_event_id: i64,
        result: String,
    },
    WorkflowExecutionFailed {
        decision_task_completed_event_id: i64,
        reason: String,
        details: String,
    },
    WorkflowExecutionCanceled {
        decision_task_completed_event_id: i64,
        details: String,
    },
    WorkflowExecutionTerminated {
        reason: String,
        details: String,
        identity: String,
    },
    WorkflowExecutionTimedOut {
        timeout_kind: TimeoutKind,
    },
    WorkflowExecutionContinuedAsNew {
        decision_task_completed_event_id: i64,
        new_execution_run_id: String,
        workflow_type: String,
        task_list: String,
        input: String,
        execution_timeout_seconds: i32,
        decision_timeout_seconds: i32,
        backoff_start_interval_seconds: i32,
        initiator: ContinueAsNewInitiator,
        failure_reason: Option<String>,
        failure_details: Option<String>,
        last_completion_result: Option<String>,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: String,
        identity: String,
    },
    WorkflowExecutionCancelRequested {
        cause: String,
        identity: String,
        external_execution: Option<WorkflowExecution>,
    },
    DecisionTaskScheduled {
        task_list: String,
        start_to_close_timeout_seconds: i32,
        attempt: i64,
    },
    DecisionTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        request_id: String,
    },
    DecisionTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        identity: String,
        binary_checksum: String,
    },
    DecisionTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        cause: DecisionTaskFailedCause,
        details: String,
        identity: String,
    },
    DecisionTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_kind: TimeoutKind,
    },
    ActivityTaskScheduled {
        decision_task_completed_event_id: i64,
        activity_id: String,
        activity_type: String,
        domain: Option<String>,
        task_list: String,
        input: String,
        schedule_to_close_timeout_seconds: i32,
        schedule_to_start_timeout_seconds: i32,
        start_to_close_timeout_seconds: i32,
        heartbeat_timeout_seconds: i32,
        retry_policy: Option<RetryPolicy>,
    },
    ActivityTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        request_id: String,
        attempt: i32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        result: String,
        identity: String,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        reason: String,
        details: String,
        identity: String,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_kind: TimeoutKind,
        details: String,
    },
    ActivityTaskCancelRequested {
        decision_task_completed_event_id: i64,
        activity_id: String,
    },
    RequestCancelActivityTaskFailed {
        decision_task_completed_event_id: i64,
        activity_id: String,
        cause: String,
    },
    ActivityTaskCanceled {
        scheduled_event_id: i64,
        started_event_id: Option<i64>,
        latest_cancel_requested_event_id: i64,
        details: String,
        identity: String,
    },
    TimerStarted {
        decision_task_completed_event_id: i64,
        timer_id: String,
        start_to_fire_timeout_seconds: i64,
    },
    TimerFired {
        started_event_id: i64,
        timer_id: String,
    },
    TimerCanceled {
        decision_task_completed_event_id: i64,
        started_event_id: i64,
        timer_id: String,
        identity: String,
    },
    CancelTimerFailed {
        decision_task_completed_event_id: i64,
        timer_id: String,
        cause: String,
        identity: String,
    },
    MarkerRecorded {
        decision_task_completed_event_id: i64,
        marker_name: String,
        details: String,
    },
    StartChildWorkflowExecutionInitiated {
        decision_task_completed_event_id: i64,
        domain: Option<String>,
        workflow_id: String,
        workflow_type: String,
        task_list: String,
        input: String,
        execution_timeout_seconds: i32,
        decision_timeout_seconds: i32,
        request_id: String,
    },
    ChildWorkflowExecutionStarted {
        initiated_event_id: i64,
        domain: String,
        execution: WorkflowExecution,
        workflow_type: String,
    },
    ChildWorkflowExecutionCompleted {
        initiated_event_id: i64,
        started_event_id: i64,
        execution: WorkflowExecution,
        result: String,
    },
    ChildWorkflowExecutionFailed {
        initiated_event_id: i64,
        started_event_id: i64,
        execution: WorkflowExecution,
        reason: String,
        details: String,
    },
    ChildWorkflowExecutionCanceled {
        initiated_event_id: i64,
        started_event_id: i64,
        execution: WorkflowExecution,
        details: String,
    },
    ChildWorkflowExecutionTerminated {
        initiated_event_id: i64,
        started_event_id: i64,
        execution: WorkflowExecution,
    },
    ChildWorkflowExecutionTimedOut {
        initiated_event_id: i64,
        started_event_id: i64,
        execution: WorkflowExecution,
        timeout_kind: TimeoutKind,
    },
    RequestCancelExternalWorkflowExecutionInitiated {
        decision_task_completed_event_id: i64,
        domain: Option<String>,
        execution: WorkflowExecution,
        child_workflow_only: bool,
        cancel_request_id: String,
    },
    SignalExternalWorkflowExecutionInitiated {
        decision_task_completed_event_id: i64,
        domain: Option<String>,
        execution: WorkflowExecution,
        signal_name: String,
        input: String,
        child_workflow_only: bool,
        signal_request_id: String,
    },
}

/// Parent linkage recorded on the started event of child workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentExecutionInfo {
    pub domain_id: String,
    pub domain_name: String,
    pub execution: WorkflowExecution,
    pub initiated_event_id: i64,
}

/// Why a decision task was failed by the engine or reported failed by a
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionTaskFailedCause {
    UnhandledDecision,
    BadBinary,
    ScheduleActivityDuplicateId,
    StartTimerDuplicateId,
    WorkflowWorkerUnhandledFailure,
    ResetWorkflow,
}

/// Timeout discriminator shared by timer tasks and timeout events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    StartToClose,
    ScheduleToStart,
    ScheduleToClose,
    Heartbeat,
}

// ============================================================================
// Decisions
// ============================================================================

/// One decision emitted by a worker in a decision-task completion. The
/// engine applies the whole ordered batch in a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Decision {
    ScheduleActivityTask(ScheduleActivityTaskAttributes),
    RequestCancelActivityTask(RequestCancelActivityTaskAttributes),
    StartTimer(StartTimerAttributes),
    CancelTimer(CancelTimerAttributes),
    RecordMarker(RecordMarkerAttributes),
    CompleteWorkflowExecution(CompleteWorkflowExecutionAttributes),
    FailWorkflowExecution(FailWorkflowExecutionAttributes),
    CancelWorkflowExecution(CancelWorkflowExecutionAttributes),
    ContinueAsNewWorkflowExecution(ContinueAsNewWorkflowExecutionAttributes),
    StartChildWorkflowExecution(StartChildWorkflowExecutionAttributes),
    RequestCancelExternalWorkflowExecution(RequestCancelExternalWorkflowExecutionAttributes),
    SignalExternalWorkflowExecution(SignalExternalWorkflowExecutionAttributes),
}

impl Decision {
    /// Whether this decision closes the workflow when applied.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Decision::CompleteWorkflowExecution(_)
                | Decision::FailWorkflowExecution(_)
                | Decision::CancelWorkflowExecution(_)
                | Decision::ContinueAsNewWorkflowExecution(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleActivityTaskAttributes {
    pub activity_id: String,
    pub activity_type: String,
    /// Target domain by name; empty means the workflow's own domain.
    pub domain: String,
    pub task_list: String,
    pub input: String,
    pub schedule_to_close_timeout_seconds: i32,
    pub schedule_to_start_timeout_seconds: i32,
    pub start_to_close_timeout_seconds: i32,
    pub heartbeat_timeout_seconds: i32,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelActivityTaskAttributes {
    pub activity_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartTimerAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_seconds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelTimerAttributes {
    pub timer_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMarkerAttributes {
    pub marker_name: String,
    pub details: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteWorkflowExecutionAttributes {
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailWorkflowExecutionAttributes {
    pub reason: String,
    pub details: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelWorkflowExecutionAttributes {
    pub details: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinueAsNewWorkflowExecutionAttributes {
    /// Unspecified fields inherit from the closing run.
    pub workflow_type: String,
    pub task_list: String,
    pub input: String,
    pub execution_timeout_seconds: i32,
    pub decision_timeout_seconds: i32,
    pub backoff_start_interval_seconds: i32,
    pub initiator: Option<ContinueAsNewInitiator>,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: String,
    pub failure_reason: Option<String>,
    pub failure_details: Option<String>,
    pub last_completion_result: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowExecutionAttributes {
    /// Target domain by name; empty means the parent's domain.
    pub domain: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: String,
    pub execution_timeout_seconds: i32,
    pub decision_timeout_seconds: i32,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelExternalWorkflowExecutionAttributes {
    pub domain: String,
    pub workflow_id: String,
    pub run_id: String,
    pub child_workflow_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalWorkflowExecutionAttributes {
    pub domain: String,
    pub execution: WorkflowExecution,
    pub signal_name: String,
    pub input: String,
    pub child_workflow_only: bool,
}

// ============================================================================
// Durable tasks
// ============================================================================

/// Durable record of cross-shard or cross-system work to perform after the
/// write that carries it commits. Drained FIFO per shard by the transfer
/// queue processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Assigned by the shard at persist time.
    pub task_id: i64,
    pub version: i64,
    pub created_at_ms: i64,
    pub kind: TransferTaskKind,
}

impl TransferTask {
    pub fn new(kind: TransferTaskKind) -> Self {
        TransferTask {
            task_id: 0,
            version: EMPTY_VERSION,
            created_at_ms: 0,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferTaskKind {
    /// Dispatch an activity task to the matching service.
    ActivityTask {
        target_domain_id: String,
        task_list: String,
        schedule_id: i64,
    },
    /// Dispatch a decision task to the matching service.
    DecisionTask {
        domain_id: String,
        task_list: String,
        schedule_id: i64,
    },
    /// Record the execution as started in the visibility store.
    RecordWorkflowStarted,
    /// Post-close fan-out: visibility close record, parent notification,
    /// archival hand-off.
    CloseExecution,
    /// Deliver a cancellation request to another execution.
    CancelExecution {
        target_domain_id: String,
        target_workflow_id: String,
        target_run_id: String,
        target_child_workflow_only: bool,
        initiated_event_id: i64,
    },
    /// Deliver a signal to another execution.
    SignalExecution {
        target_domain_id: String,
        target_workflow_id: String,
        target_run_id: String,
        target_child_workflow_only: bool,
        initiated_event_id: i64,
    },
    /// Start a child execution on behalf of this run.
    StartChildExecution {
        target_domain_id: String,
        target_workflow_id: String,
        initiated_event_id: i64,
    },
}

/// Durable record that fires at or after `fire_at_ms`. Drained in fire-time
/// order by the timer queue processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    pub version: i64,
    pub fire_at_ms: i64,
    pub kind: TimerTaskKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimerTaskKind {
    /// Execution start-to-close timeout.
    WorkflowTimeout,
    /// Delay before the first decision of a cron or retry run.
    WorkflowBackoff { backoff: WorkflowBackoffKind },
    DecisionTimeout {
        schedule_id: i64,
        attempt: i64,
        timeout_kind: TimeoutKind,
    },
    ActivityTimeout {
        schedule_id: i64,
        attempt: i32,
        timeout_kind: TimeoutKind,
    },
    /// Server-side retry backoff for a failed activity attempt.
    ActivityRetry { schedule_id: i64, attempt: i32 },
    UserTimer { started_event_id: i64 },
    /// Retention-driven deletion of the closed run.
    DeleteHistoryEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowBackoffKind {
    Cron,
    Retry,
}

/// Durable record instructing the replicator to ship a history range to
/// peer clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub first_event_id: i64,
    pub next_event_id: i64,
    pub version: i64,
}

/// Stamp the failover version and creation timestamp on freshly generated
/// tasks right before persist.
pub(crate) fn stamp_task_info(
    version: i64,
    timestamp_ms: i64,
    transfer_tasks: &mut [TransferTask],
    timer_tasks: &mut [TimerTask],
) {
    for task in transfer_tasks.iter_mut() {
        task.version = version;
        task.created_at_ms = timestamp_ms;
    }
    for task in timer_tasks.iter_mut() {
        task.version = version;
    }
}

// ============================================================================
// Task tokens
// ============================================================================

/// Opaque token round-tripped through workers to correlate task responses
/// with the pending task they answer. JSON-serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskToken {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    /// `None` for by-activity-ID completions.
    pub schedule_id: Option<i64>,
    pub schedule_attempt: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
}

impl TaskToken {
    pub fn serialize(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| EngineError::Internal {
            message: format!("failed to serialize task token: {e}"),
        })
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(raw).map_err(|_| EngineError::DeserializingToken)
    }
}
