//! Mutable state: the in-memory aggregate for one workflow execution.
//!
//! Everything the engine needs to make a decision about a run without
//! re-reading history lives here: the execution info, the pending
//! activity/decision/timer/child collections, the signal dedup set, the
//! replication state and the buffer of events produced while a decision is
//! in flight. The aggregate is loaded and persisted as one unit because
//! optimistic concurrency operates on the whole; the condition number is
//! `next_event_id` at load time.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::{
    cron, ContinueAsNewInitiator, ContinueAsNewWorkflowExecutionAttributes, DecisionTaskFailedCause,
    EventAttributes, HistoryEvent, ParentExecutionInfo, RetryPolicy, ScheduleActivityTaskAttributes,
    StartChildWorkflowExecutionAttributes, StartTimerAttributes, TimerTask, TimerTaskKind,
    TransferTask, TransferTaskKind, WorkflowBackoffKind, WorkflowCloseStatus, WorkflowExecution,
    WorkflowState, EMPTY_VERSION, FIRST_EVENT_ID,
};

/// Execution-scoped scalar state. Persisted as part of the mutable-state
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub parent: Option<ParentExecutionInfo>,
    pub workflow_type: String,
    pub task_list: String,
    /// Empty when stickiness is disabled.
    pub sticky_task_list: String,
    pub sticky_schedule_to_start_timeout_seconds: i32,
    pub workflow_timeout_seconds: i32,
    pub decision_timeout_seconds: i32,
    pub state: WorkflowState,
    pub close_status: WorkflowCloseStatus,
    pub start_timestamp_ms: i64,
    pub close_timestamp_ms: Option<i64>,
    /// Started event ID of the last completed decision.
    pub last_processed_event_id: Option<i64>,
    /// Idempotency key of the start request.
    pub create_request_id: String,
    pub cancel_requested: bool,
    pub cancel_request_id: Option<String>,
    pub cron_schedule: String,
    /// Delay before the first decision of a cron or retry run.
    pub first_decision_backoff_seconds: i32,
    pub has_retry_policy: bool,
    pub retry_initial_interval_seconds: i32,
    pub retry_backoff_coefficient: f64,
    pub retry_maximum_interval_seconds: i32,
    pub retry_maximum_attempts: i32,
    pub retry_expiration_time_ms: i64,
    pub retry_non_retriable_reasons: Vec<String>,
    /// Workflow-level attempt, carried across retry-initiated runs.
    pub attempt: i32,
    pub signal_count: i64,
    pub auto_reset_points: Vec<ResetPoint>,
    /// Transient decision attempt counter; > 0 after a decision failure.
    pub decision_attempt: i64,
    /// First event ID of the last persisted batch.
    pub last_first_event_id: i64,
    pub next_event_id: i64,
}

/// A known-good decision completion recorded for reset purposes. The list is
/// bounded; the oldest entry rotates out at the cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetPoint {
    pub binary_checksum: String,
    pub run_id: String,
    pub first_decision_completed_id: i64,
    pub created_time_ms: i64,
}

/// The pending decision. At most one exists per execution at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub version: i64,
    pub schedule_id: i64,
    pub started_id: Option<i64>,
    pub request_id: String,
    pub task_list: String,
    pub decision_timeout_seconds: i32,
    pub attempt: i64,
    pub scheduled_timestamp_ms: i64,
    pub started_timestamp_ms: i64,
}

/// A scheduled activity that has not reached a terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: i64,
    pub schedule_id: i64,
    pub activity_id: String,
    pub activity_type: String,
    pub task_list: String,
    pub input: String,
    pub scheduled_time_ms: i64,
    pub started_id: Option<i64>,
    pub started_time_ms: i64,
    pub request_id: String,
    pub details: String,
    pub last_heartbeat_ms: i64,
    pub cancel_requested: bool,
    pub cancel_requested_event_id: Option<i64>,
    pub schedule_to_close_timeout_seconds: i32,
    pub schedule_to_start_timeout_seconds: i32,
    pub start_to_close_timeout_seconds: i32,
    pub heartbeat_timeout_seconds: i32,
    pub has_retry_policy: bool,
    pub retry_initial_interval_seconds: i32,
    pub retry_backoff_coefficient: f64,
    pub retry_maximum_interval_seconds: i32,
    pub retry_maximum_attempts: i32,
    pub retry_expiration_time_ms: i64,
    pub retry_non_retriable_reasons: Vec<String>,
    pub attempt: i32,
    pub last_failure_reason: String,
    /// Set once a timer task covering this activity has been emitted.
    pub timer_task_created: bool,
}

impl ActivityInfo {
    fn retry_policy(&self) -> Option<RetryPolicy> {
        if !self.has_retry_policy {
            return None;
        }
        Some(RetryPolicy {
            initial_interval_seconds: self.retry_initial_interval_seconds,
            backoff_coefficient: self.retry_backoff_coefficient,
            maximum_interval_seconds: self.retry_maximum_interval_seconds,
            maximum_attempts: self.retry_maximum_attempts,
            expiration_seconds: 0,
            non_retriable_reasons: self.retry_non_retriable_reasons.clone(),
        })
    }
}

/// A user timer that has not fired or been canceled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub version: i64,
    pub timer_id: String,
    pub started_event_id: i64,
    pub fire_at_ms: i64,
    /// Set once a timer task for this fire time has been emitted.
    pub task_created: bool,
}

/// A child execution initiated by this run that has not reached a terminal
/// event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    pub version: i64,
    pub initiated_event_id: i64,
    pub started_event_id: Option<i64>,
    pub started_run_id: Option<String>,
    pub domain_name: Option<String>,
    pub workflow_id: String,
    pub workflow_type: String,
    pub create_request_id: String,
}

/// Per-cluster replication progress for global domains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub version: i64,
    pub last_event_id: i64,
}

/// Replication state of a global-domain execution. `current_version` is the
/// failover version events are stamped with; it is monotonically
/// non-decreasing across successful writes from the same cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub current_version: i64,
    pub start_version: i64,
    pub last_write_version: i64,
    pub last_write_event_id: i64,
    pub last_replication_info: HashMap<String, ReplicationInfo>,
}

/// Parameters for the workflow-started event; shared by the start path and
/// continue-as-new.
#[derive(Debug, Clone, Default)]
pub struct WorkflowStartParams {
    pub workflow_type: String,
    pub task_list: String,
    pub input: String,
    pub execution_timeout_seconds: i32,
    pub decision_timeout_seconds: i32,
    pub identity: String,
    pub request_id: String,
    pub parent: Option<ParentExecutionInfo>,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: String,
    pub first_decision_backoff_seconds: i32,
    pub attempt: i32,
    pub expiration_time_ms: i64,
    pub initiator: Option<ContinueAsNewInitiator>,
    pub continued_from_run_id: Option<String>,
    pub continued_failure_reason: Option<String>,
    pub continued_failure_details: Option<String>,
    pub last_completion_result: Option<String>,
}

/// Successor run produced by a continue-as-new decision, persisted
/// atomically with the closing run.
#[derive(Debug, Clone)]
pub struct ContinueAsNewSuccessor {
    pub state: MutableState,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

/// The batch produced by one mutation cycle, handed to persistence.
#[derive(Debug, Clone)]
pub struct TransactionEvents {
    pub first_event_id: i64,
    pub events: Vec<HistoryEvent>,
}

/// In-memory representation of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
    pub execution_info: ExecutionInfo,
    pending_activities: HashMap<i64, ActivityInfo>,
    activity_ids: HashMap<String, i64>,
    pending_decision: Option<DecisionInfo>,
    pending_timers: HashMap<String, TimerInfo>,
    pending_children: HashMap<i64, ChildExecutionInfo>,
    signals_requested: HashSet<String>,
    buffered_events: Vec<EventAttributes>,
    pub replication_state: Option<ReplicationState>,

    /// Events appended since load; drained at persist.
    #[serde(skip)]
    new_events: Vec<HistoryEvent>,
    /// `next_event_id` observed at load; the OCC condition.
    #[serde(skip)]
    condition: i64,
}

impl MutableState {
    pub fn new(domain_id: impl Into<String>, execution: WorkflowExecution) -> Self {
        let info = ExecutionInfo {
            domain_id: domain_id.into(),
            workflow_id: execution.workflow_id,
            run_id: execution.run_id,
            parent: None,
            workflow_type: String::new(),
            task_list: String::new(),
            sticky_task_list: String::new(),
            sticky_schedule_to_start_timeout_seconds: 0,
            workflow_timeout_seconds: 0,
            decision_timeout_seconds: 0,
            state: WorkflowState::Created,
            close_status: WorkflowCloseStatus::None,
            start_timestamp_ms: 0,
            close_timestamp_ms: None,
            last_processed_event_id: None,
            create_request_id: String::new(),
            cancel_requested: false,
            cancel_request_id: None,
            cron_schedule: String::new(),
            first_decision_backoff_seconds: 0,
            has_retry_policy: false,
            retry_initial_interval_seconds: 0,
            retry_backoff_coefficient: 0.0,
            retry_maximum_interval_seconds: 0,
            retry_maximum_attempts: 0,
            retry_expiration_time_ms: 0,
            retry_non_retriable_reasons: Vec::new(),
            attempt: 0,
            signal_count: 0,
            auto_reset_points: Vec::new(),
            decision_attempt: 0,
            last_first_event_id: FIRST_EVENT_ID,
            next_event_id: FIRST_EVENT_ID,
        };
        MutableState {
            execution_info: info,
            pending_activities: HashMap::new(),
            activity_ids: HashMap::new(),
            pending_decision: None,
            pending_timers: HashMap::new(),
            pending_children: HashMap::new(),
            signals_requested: HashSet::new(),
            buffered_events: Vec::new(),
            replication_state: None,
            new_events: Vec::new(),
            condition: FIRST_EVENT_ID,
        }
    }

    /// Executions in global domains carry replication state regardless of
    /// how many clusters the domain actually replicates to.
    pub fn new_with_replication_state(
        domain_id: impl Into<String>,
        execution: WorkflowExecution,
        failover_version: i64,
    ) -> Self {
        let mut ms = Self::new(domain_id, execution);
        ms.replication_state = Some(ReplicationState {
            current_version: failover_version,
            start_version: failover_version,
            last_write_version: failover_version,
            last_write_event_id: 0,
            last_replication_info: HashMap::new(),
        });
        ms
    }

    // ------------------------------------------------------------------
    // Basics
    // ------------------------------------------------------------------

    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    pub fn last_first_event_id(&self) -> i64 {
        self.execution_info.last_first_event_id
    }

    pub fn condition(&self) -> i64 {
        self.condition
    }

    pub(crate) fn set_condition(&mut self, condition: i64) {
        self.condition = condition;
    }

    pub fn is_workflow_running(&self) -> bool {
        self.execution_info.state != WorkflowState::Completed
    }

    pub fn current_version(&self) -> i64 {
        self.replication_state
            .as_ref()
            .map(|rs| rs.current_version)
            .unwrap_or(EMPTY_VERSION)
    }

    pub fn last_write_version(&self) -> i64 {
        self.replication_state
            .as_ref()
            .map(|rs| rs.last_write_version)
            .unwrap_or(EMPTY_VERSION)
    }

    /// Bump the write version to the domain's failover version. Invariant:
    /// `current_version` never decreases within one cluster's ownership.
    pub fn update_replication_version(&mut self, failover_version: i64) {
        if let Some(rs) = self.replication_state.as_mut() {
            rs.current_version = rs.current_version.max(failover_version);
        }
    }

    pub fn is_sticky_task_list_enabled(&self) -> bool {
        !self.execution_info.sticky_task_list.is_empty()
    }

    pub fn clear_stickiness(&mut self) {
        self.execution_info.sticky_task_list.clear();
        self.execution_info.sticky_schedule_to_start_timeout_seconds = 0;
    }

    pub fn has_parent_execution(&self) -> bool {
        self.execution_info.parent.is_some()
    }

    pub fn previous_started_event_id(&self) -> Option<i64> {
        self.execution_info.last_processed_event_id
    }

    pub fn pending_activities(&self) -> impl Iterator<Item = &ActivityInfo> {
        self.pending_activities.values()
    }

    pub fn pending_timers(&self) -> impl Iterator<Item = &TimerInfo> {
        self.pending_timers.values()
    }

    pub fn pending_children(&self) -> impl Iterator<Item = &ChildExecutionInfo> {
        self.pending_children.values()
    }

    pub(crate) fn pending_timers_mut(&mut self) -> impl Iterator<Item = &mut TimerInfo> {
        self.pending_timers.values_mut()
    }

    pub(crate) fn pending_activities_mut(&mut self) -> impl Iterator<Item = &mut ActivityInfo> {
        self.pending_activities.values_mut()
    }

    // ------------------------------------------------------------------
    // Event append core
    // ------------------------------------------------------------------

    fn allocate_event_id(&mut self) -> i64 {
        let id = self.execution_info.next_event_id;
        self.execution_info.next_event_id += 1;
        id
    }

    fn append_event(&mut self, attributes: EventAttributes) -> i64 {
        let event_id = self.allocate_event_id();
        self.new_events.push(HistoryEvent {
            event_id,
            timestamp_ms: crate::now_ms(),
            version: self.current_version(),
            attributes,
        });
        event_id
    }

    /// Reactive events produced while a decision is in flight are buffered
    /// and flushed (with freshly assigned IDs) once the decision leaves the
    /// started state.
    fn buffer_or_append(
        &mut self,
        attributes: EventAttributes,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        if self.has_in_flight_decision_task() {
            if buffer_cap > 0 && self.buffered_events.len() >= buffer_cap {
                return Err(EngineError::BufferedEventsLimitExceeded);
            }
            self.buffered_events.push(attributes);
            return Ok(None);
        }
        Ok(Some(self.append_event(attributes)))
    }

    pub fn has_buffered_events(&self) -> bool {
        !self.buffered_events.is_empty()
    }

    fn flush_buffered_events(&mut self) {
        let buffered = std::mem::take(&mut self.buffered_events);
        for attributes in buffered {
            self.append_event(attributes);
        }
    }

    // ------------------------------------------------------------------
    // Workflow lifecycle events
    // ------------------------------------------------------------------

    pub fn add_workflow_execution_started_event(&mut self, params: WorkflowStartParams) -> i64 {
        let info = &mut self.execution_info;
        info.workflow_type = params.workflow_type.clone();
        info.task_list = params.task_list.clone();
        info.workflow_timeout_seconds = params.execution_timeout_seconds;
        info.decision_timeout_seconds = params.decision_timeout_seconds;
        info.create_request_id = params.request_id.clone();
        info.parent = params.parent.clone();
        info.cron_schedule = params.cron_schedule.clone();
        info.first_decision_backoff_seconds = params.first_decision_backoff_seconds;
        info.attempt = params.attempt;
        info.state = WorkflowState::Created;
        info.close_status = WorkflowCloseStatus::None;
        info.start_timestamp_ms = crate::now_ms();
        if let Some(policy) = params.retry_policy.as_ref() {
            info.has_retry_policy = true;
            info.retry_initial_interval_seconds = policy.initial_interval_seconds;
            info.retry_backoff_coefficient = policy.backoff_coefficient;
            info.retry_maximum_interval_seconds = policy.maximum_interval_seconds;
            info.retry_maximum_attempts = policy.maximum_attempts;
            info.retry_non_retriable_reasons = policy.non_retriable_reasons.clone();
            info.retry_expiration_time_ms = if params.expiration_time_ms > 0 {
                params.expiration_time_ms
            } else if policy.expiration_seconds > 0 {
                info.start_timestamp_ms + policy.expiration_seconds as i64 * 1000
            } else {
                0
            };
        }
        let event_id = self.append_event(EventAttributes::WorkflowExecutionStarted {
            workflow_type: params.workflow_type,
            task_list: params.task_list,
            input: params.input,
            execution_timeout_seconds: params.execution_timeout_seconds,
            decision_timeout_seconds: params.decision_timeout_seconds,
            identity: params.identity,
            request_id: params.request_id,
            parent: params.parent,
            retry_policy: params.retry_policy,
            attempt: params.attempt,
            expiration_time_ms: params.expiration_time_ms,
            cron_schedule: params.cron_schedule,
            first_decision_backoff_seconds: params.first_decision_backoff_seconds,
            initiator: params.initiator,
            continued_from_run_id: params.continued_from_run_id,
            continued_failure_reason: params.continued_failure_reason,
            continued_failure_details: params.continued_failure_details,
            last_completion_result: params.last_completion_result,
        });
        self.execution_info.state = WorkflowState::Running;
        event_id
    }

    fn close_execution(&mut self, status: WorkflowCloseStatus) {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = status;
        self.execution_info.close_timestamp_ms = Some(crate::now_ms());
    }

    pub fn add_completed_workflow_event(
        &mut self,
        decision_task_completed_event_id: i64,
        result: String,
    ) -> i64 {
        let id = self.append_event(EventAttributes::WorkflowExecutionCompleted {
            decision_task_completed_event_id,
            result,
        });
        self.close_execution(WorkflowCloseStatus::Completed);
        id
    }

    pub fn add_fail_workflow_event(
        &mut self,
        decision_task_completed_event_id: i64,
        reason: String,
        details: String,
    ) -> i64 {
        let id = self.append_event(EventAttributes::WorkflowExecutionFailed {
            decision_task_completed_event_id,
            reason,
            details,
        });
        self.close_execution(WorkflowCloseStatus::Failed);
        id
    }

    pub fn add_workflow_execution_canceled_event(
        &mut self,
        decision_task_completed_event_id: i64,
        details: String,
    ) -> i64 {
        let id = self.append_event(EventAttributes::WorkflowExecutionCanceled {
            decision_task_completed_event_id,
            details,
        });
        self.close_execution(WorkflowCloseStatus::Canceled);
        id
    }

    pub fn add_workflow_execution_terminated_event(
        &mut self,
        reason: String,
        details: String,
        identity: String,
    ) -> i64 {
        let id = self.append_event(EventAttributes::WorkflowExecutionTerminated {
            reason,
            details,
            identity,
        });
        self.close_execution(WorkflowCloseStatus::Terminated);
        id
    }

    pub fn add_workflow_execution_signaled(
        &mut self,
        signal_name: String,
        input: String,
        identity: String,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        self.execution_info.signal_count += 1;
        self.buffer_or_append(
            EventAttributes::WorkflowExecutionSignaled {
                signal_name,
                input,
                identity,
            },
            buffer_cap,
        )
    }

    pub fn is_cancel_requested(&self) -> (bool, Option<String>) {
        (
            self.execution_info.cancel_requested,
            self.execution_info.cancel_request_id.clone(),
        )
    }

    pub fn add_workflow_execution_cancel_requested_event(
        &mut self,
        cause: String,
        identity: String,
        request_id: Option<String>,
        external_execution: Option<WorkflowExecution>,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        self.execution_info.cancel_requested = true;
        self.execution_info.cancel_request_id = request_id;
        self.buffer_or_append(
            EventAttributes::WorkflowExecutionCancelRequested {
                cause,
                identity,
                external_execution,
            },
            buffer_cap,
        )
    }

    // ------------------------------------------------------------------
    // Signal dedup
    // ------------------------------------------------------------------

    pub fn is_signal_requested(&self, request_id: &str) -> bool {
        self.signals_requested.contains(request_id)
    }

    pub fn add_signal_requested(&mut self, request_id: impl Into<String>) {
        self.signals_requested.insert(request_id.into());
    }

    pub fn delete_signal_requested(&mut self, request_id: &str) {
        self.signals_requested.remove(request_id);
    }

    // ------------------------------------------------------------------
    // Decision tasks
    // ------------------------------------------------------------------

    pub fn has_pending_decision_task(&self) -> bool {
        self.pending_decision.is_some()
    }

    pub fn has_in_flight_decision_task(&self) -> bool {
        self.pending_decision
            .as_ref()
            .map(|di| di.started_id.is_some())
            .unwrap_or(false)
    }

    /// Whether any decision has ever been scheduled on this run. Cron runs
    /// delay their first decision, and signals must not force one early.
    pub fn has_processed_or_pending_decision_task(&self) -> bool {
        self.pending_decision.is_some() || self.execution_info.last_processed_event_id.is_some()
    }

    pub fn get_pending_decision(&self, schedule_id: i64) -> Option<&DecisionInfo> {
        self.pending_decision
            .as_ref()
            .filter(|di| di.schedule_id == schedule_id)
    }

    /// Schedule a decision task. Returns `None` when one is already pending.
    ///
    /// Attempts after a decision failure are *transient*: they allocate a
    /// virtual schedule ID past the current history but append no event
    /// until the attempt completes.
    pub fn add_decision_task_scheduled_event(&mut self) -> Option<DecisionInfo> {
        if self.pending_decision.is_some() {
            return None;
        }
        let task_list = if self.is_sticky_task_list_enabled() {
            self.execution_info.sticky_task_list.clone()
        } else {
            self.execution_info.task_list.clone()
        };
        let timeout = self.execution_info.decision_timeout_seconds;
        let attempt = self.execution_info.decision_attempt;
        let schedule_id = if attempt == 0 {
            self.append_event(EventAttributes::DecisionTaskScheduled {
                task_list: task_list.clone(),
                start_to_close_timeout_seconds: timeout,
                attempt,
            })
        } else {
            // transient: no history event until the attempt completes
            self.execution_info.next_event_id
        };
        let di = DecisionInfo {
            version: self.current_version(),
            schedule_id,
            started_id: None,
            request_id: String::new(),
            task_list,
            decision_timeout_seconds: timeout,
            attempt,
            scheduled_timestamp_ms: crate::now_ms(),
            started_timestamp_ms: 0,
        };
        self.pending_decision = Some(di.clone());
        Some(di)
    }

    /// Record a decision task start. The pending decision must match
    /// `schedule_id` and not be started.
    pub fn add_decision_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: String,
        identity: String,
    ) -> Option<DecisionInfo> {
        let di = self.pending_decision.as_ref()?;
        if di.schedule_id != schedule_id || di.started_id.is_some() {
            return None;
        }
        let attempt = di.attempt;
        let started_id = if attempt == 0 {
            self.append_event(EventAttributes::DecisionTaskStarted {
                scheduled_event_id: schedule_id,
                identity,
                request_id: request_id.clone(),
            })
        } else {
            // transient: virtual started ID one past the virtual schedule
            schedule_id + 1
        };
        let di = self.pending_decision.as_mut()?;
        di.started_id = Some(started_id);
        di.request_id = request_id;
        di.started_timestamp_ms = crate::now_ms();
        Some(di.clone())
    }

    /// Complete the started decision. For transient attempts the scheduled
    /// and started events are materialized into history first so the
    /// completion has real events to reference.
    pub fn add_decision_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        identity: String,
        binary_checksum: String,
        max_reset_points: usize,
    ) -> Option<i64> {
        let di = self.pending_decision.clone()?;
        if di.schedule_id != schedule_id || di.started_id != Some(started_id) {
            return None;
        }
        let (scheduled_event_id, started_event_id) = if di.attempt > 0 {
            let scheduled = self.append_event(EventAttributes::DecisionTaskScheduled {
                task_list: di.task_list.clone(),
                start_to_close_timeout_seconds: di.decision_timeout_seconds,
                attempt: di.attempt,
            });
            let started = self.append_event(EventAttributes::DecisionTaskStarted {
                scheduled_event_id: scheduled,
                identity: identity.clone(),
                request_id: di.request_id.clone(),
            });
            (scheduled, started)
        } else {
            (schedule_id, started_id)
        };
        let completed_id = self.append_event(EventAttributes::DecisionTaskCompleted {
            scheduled_event_id,
            started_event_id,
            identity,
            binary_checksum: binary_checksum.clone(),
        });
        self.pending_decision = None;
        self.execution_info.decision_attempt = 0;
        self.execution_info.last_processed_event_id = Some(started_event_id);
        if !binary_checksum.is_empty() {
            self.add_auto_reset_point(binary_checksum, completed_id, max_reset_points);
        }
        Some(completed_id)
    }

    fn add_auto_reset_point(
        &mut self,
        binary_checksum: String,
        first_decision_completed_id: i64,
        max_reset_points: usize,
    ) {
        let points = &mut self.execution_info.auto_reset_points;
        if points.iter().any(|p| p.binary_checksum == binary_checksum) {
            return;
        }
        if max_reset_points > 0 && points.len() >= max_reset_points {
            points.remove(0);
        }
        points.push(ResetPoint {
            binary_checksum,
            run_id: self.execution_info.run_id.clone(),
            first_decision_completed_id,
            created_time_ms: crate::now_ms(),
        });
    }

    /// Fail the started decision and arm the next attempt as transient.
    pub fn add_decision_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        cause: DecisionTaskFailedCause,
        details: String,
        identity: String,
    ) -> i64 {
        let event_id = self.append_event(EventAttributes::DecisionTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            cause,
            details,
            identity,
        });
        self.pending_decision = None;
        self.execution_info.decision_attempt += 1;
        event_id
    }

    // ------------------------------------------------------------------
    // Activity tasks
    // ------------------------------------------------------------------

    pub fn get_activity_info(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    pub fn get_schedule_id_by_activity_id(&self, activity_id: &str) -> Option<i64> {
        self.activity_ids.get(activity_id).copied()
    }

    /// Schedule an activity. Returns `None` on a duplicate activity ID,
    /// which fails the decision.
    pub fn add_activity_task_scheduled_event(
        &mut self,
        decision_task_completed_event_id: i64,
        attrs: &ScheduleActivityTaskAttributes,
    ) -> Option<(i64, ActivityInfo)> {
        if self.activity_ids.contains_key(&attrs.activity_id) {
            return None;
        }
        let schedule_id = self.append_event(EventAttributes::ActivityTaskScheduled {
            decision_task_completed_event_id,
            activity_id: attrs.activity_id.clone(),
            activity_type: attrs.activity_type.clone(),
            domain: if attrs.domain.is_empty() {
                None
            } else {
                Some(attrs.domain.clone())
            },
            task_list: attrs.task_list.clone(),
            input: attrs.input.clone(),
            schedule_to_close_timeout_seconds: attrs.schedule_to_close_timeout_seconds,
            schedule_to_start_timeout_seconds: attrs.schedule_to_start_timeout_seconds,
            start_to_close_timeout_seconds: attrs.start_to_close_timeout_seconds,
            heartbeat_timeout_seconds: attrs.heartbeat_timeout_seconds,
            retry_policy: attrs.retry_policy.clone(),
        });
        let mut ai = ActivityInfo {
            version: self.current_version(),
            schedule_id,
            activity_id: attrs.activity_id.clone(),
            activity_type: attrs.activity_type.clone(),
            task_list: attrs.task_list.clone(),
            input: attrs.input.clone(),
            scheduled_time_ms: crate::now_ms(),
            started_id: None,
            started_time_ms: 0,
            request_id: String::new(),
            details: String::new(),
            last_heartbeat_ms: 0,
            cancel_requested: false,
            cancel_requested_event_id: None,
            schedule_to_close_timeout_seconds: attrs.schedule_to_close_timeout_seconds,
            schedule_to_start_timeout_seconds: attrs.schedule_to_start_timeout_seconds,
            start_to_close_timeout_seconds: attrs.start_to_close_timeout_seconds,
            heartbeat_timeout_seconds: attrs.heartbeat_timeout_seconds,
            has_retry_policy: attrs.retry_policy.is_some(),
            retry_initial_interval_seconds: 0,
            retry_backoff_coefficient: 0.0,
            retry_maximum_interval_seconds: 0,
            retry_maximum_attempts: 0,
            retry_expiration_time_ms: 0,
            retry_non_retriable_reasons: Vec::new(),
            attempt: 0,
            last_failure_reason: String::new(),
            timer_task_created: false,
        };
        if let Some(policy) = attrs.retry_policy.as_ref() {
            ai.retry_initial_interval_seconds = policy.initial_interval_seconds;
            ai.retry_backoff_coefficient = policy.backoff_coefficient;
            ai.retry_maximum_interval_seconds = policy.maximum_interval_seconds;
            ai.retry_maximum_attempts = policy.maximum_attempts;
            ai.retry_non_retriable_reasons = policy.non_retriable_reasons.clone();
            if policy.expiration_seconds > 0 {
                ai.retry_expiration_time_ms =
                    ai.scheduled_time_ms + policy.expiration_seconds as i64 * 1000;
            }
        }
        self.pending_activities.insert(schedule_id, ai.clone());
        self.activity_ids.insert(attrs.activity_id.clone(), schedule_id);
        Some((schedule_id, ai))
    }

    pub fn add_activity_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: String,
        identity: String,
    ) -> Option<i64> {
        let attempt = self.pending_activities.get(&schedule_id)?.attempt;
        let started_id = self.append_event(EventAttributes::ActivityTaskStarted {
            scheduled_event_id: schedule_id,
            identity,
            request_id: request_id.clone(),
            attempt,
        });
        let ai = self.pending_activities.get_mut(&schedule_id)?;
        ai.started_id = Some(started_id);
        ai.started_time_ms = crate::now_ms();
        ai.request_id = request_id;
        Some(started_id)
    }

    fn remove_pending_activity(&mut self, schedule_id: i64) {
        if let Some(ai) = self.pending_activities.remove(&schedule_id) {
            self.activity_ids.remove(&ai.activity_id);
        }
    }

    pub fn add_activity_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        result: String,
        identity: String,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        self.remove_pending_activity(schedule_id);
        self.buffer_or_append(
            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                result,
                identity,
            },
            buffer_cap,
        )
    }

    pub fn add_activity_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        reason: String,
        details: String,
        identity: String,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        self.remove_pending_activity(schedule_id);
        self.buffer_or_append(
            EventAttributes::ActivityTaskFailed {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                reason,
                details,
                identity,
            },
            buffer_cap,
        )
    }

    pub fn add_activity_task_canceled_event(
        &mut self,
        schedule_id: i64,
        started_id: Option<i64>,
        latest_cancel_requested_event_id: i64,
        details: String,
        identity: String,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        self.remove_pending_activity(schedule_id);
        self.buffer_or_append(
            EventAttributes::ActivityTaskCanceled {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                latest_cancel_requested_event_id,
                details,
                identity,
            },
            buffer_cap,
        )
    }

    /// Request cancellation of a pending activity. `None` when the activity
    /// ID is unknown, in which case the caller records a cancel-failed
    /// event and continues.
    pub fn add_activity_task_cancel_requested_event(
        &mut self,
        decision_task_completed_event_id: i64,
        activity_id: &str,
    ) -> Option<(i64, ActivityInfo)> {
        let schedule_id = self.get_schedule_id_by_activity_id(activity_id)?;
        let event_id = self.append_event(EventAttributes::ActivityTaskCancelRequested {
            decision_task_completed_event_id,
            activity_id: activity_id.to_string(),
        });
        let ai = self.pending_activities.get_mut(&schedule_id)?;
        ai.cancel_requested = true;
        ai.cancel_requested_event_id = Some(event_id);
        Some((event_id, ai.clone()))
    }

    pub fn add_request_cancel_activity_task_failed_event(
        &mut self,
        decision_task_completed_event_id: i64,
        activity_id: String,
        cause: String,
    ) -> i64 {
        self.append_event(EventAttributes::RequestCancelActivityTaskFailed {
            decision_task_completed_event_id,
            activity_id,
            cause,
        })
    }

    /// Heartbeat: progress and liveness, no history append.
    pub fn update_activity_progress(&mut self, schedule_id: i64, details: String, now_ms: i64) {
        if let Some(ai) = self.pending_activities.get_mut(&schedule_id) {
            ai.details = details;
            ai.last_heartbeat_ms = now_ms;
        }
    }

    /// Consult the activity's retry policy after a reported failure. When a
    /// retry is owed the pending activity rolls to the next attempt and a
    /// retry timer task is returned; otherwise `None` and the caller records
    /// the terminal event.
    pub fn create_activity_retry_timer(
        &mut self,
        schedule_id: i64,
        failure_reason: &str,
        now_ms: i64,
    ) -> Option<TimerTask> {
        let ai = self.pending_activities.get_mut(&schedule_id)?;
        let policy = ai.retry_policy()?;
        let backoff_ms =
            policy.next_backoff(ai.attempt, failure_reason, now_ms, ai.retry_expiration_time_ms)?;
        ai.attempt += 1;
        ai.started_id = None;
        ai.started_time_ms = 0;
        ai.request_id.clear();
        ai.scheduled_time_ms = now_ms + backoff_ms;
        ai.last_failure_reason = failure_reason.to_string();
        ai.timer_task_created = false;
        Some(TimerTask {
            version: ai.version,
            fire_at_ms: now_ms + backoff_ms,
            kind: TimerTaskKind::ActivityRetry {
                schedule_id,
                attempt: ai.attempt,
            },
        })
    }

    // ------------------------------------------------------------------
    // User timers
    // ------------------------------------------------------------------

    pub fn get_timer_info(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.pending_timers.get(timer_id)
    }

    /// Start a user timer. Returns `None` on a duplicate timer ID, which
    /// fails the decision.
    pub fn add_timer_started_event(
        &mut self,
        decision_task_completed_event_id: i64,
        attrs: &StartTimerAttributes,
        now_ms: i64,
    ) -> Option<(i64, TimerInfo)> {
        if self.pending_timers.contains_key(&attrs.timer_id) {
            return None;
        }
        let started_event_id = self.append_event(EventAttributes::TimerStarted {
            decision_task_completed_event_id,
            timer_id: attrs.timer_id.clone(),
            start_to_fire_timeout_seconds: attrs.start_to_fire_timeout_seconds,
        });
        let ti = TimerInfo {
            version: self.current_version(),
            timer_id: attrs.timer_id.clone(),
            started_event_id,
            fire_at_ms: now_ms + attrs.start_to_fire_timeout_seconds * 1000,
            task_created: false,
        };
        self.pending_timers.insert(attrs.timer_id.clone(), ti.clone());
        Some((started_event_id, ti))
    }

    /// Cancel a pending user timer. `None` when no such timer is pending,
    /// in which case the caller records a cancel-failed event.
    pub fn add_timer_canceled_event(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: &str,
        identity: String,
    ) -> Option<i64> {
        let ti = self.pending_timers.remove(timer_id)?;
        Some(self.append_event(EventAttributes::TimerCanceled {
            decision_task_completed_event_id,
            started_event_id: ti.started_event_id,
            timer_id: timer_id.to_string(),
            identity,
        }))
    }

    pub fn add_cancel_timer_failed_event(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: String,
        cause: String,
        identity: String,
    ) -> i64 {
        self.append_event(EventAttributes::CancelTimerFailed {
            decision_task_completed_event_id,
            timer_id,
            cause,
            identity,
        })
    }

    // ------------------------------------------------------------------
    // Child workflows
    // ------------------------------------------------------------------

    pub fn get_child_execution_info(&self, initiated_event_id: i64) -> Option<&ChildExecutionInfo> {
        self.pending_children.get(&initiated_event_id)
    }

    pub fn add_start_child_workflow_execution_initiated_event(
        &mut self,
        decision_task_completed_event_id: i64,
        create_request_id: String,
        attrs: &StartChildWorkflowExecutionAttributes,
    ) -> (i64, ChildExecutionInfo) {
        let initiated_event_id =
            self.append_event(EventAttributes::StartChildWorkflowExecutionInitiated {
                decision_task_completed_event_id,
                domain: if attrs.domain.is_empty() {
                    None
                } else {
                    Some(attrs.domain.clone())
                },
                workflow_id: attrs.workflow_id.clone(),
                workflow_type: attrs.workflow_type.clone(),
                task_list: attrs.task_list.clone(),
                input: attrs.input.clone(),
                execution_timeout_seconds: attrs.execution_timeout_seconds,
                decision_timeout_seconds: attrs.decision_timeout_seconds,
                request_id: create_request_id.clone(),
            });
        let ci = ChildExecutionInfo {
            version: self.current_version(),
            initiated_event_id,
            started_event_id: None,
            started_run_id: None,
            domain_name: if attrs.domain.is_empty() {
                None
            } else {
                Some(attrs.domain.clone())
            },
            workflow_id: attrs.workflow_id.clone(),
            workflow_type: attrs.workflow_type.clone(),
            create_request_id,
        };
        self.pending_children.insert(initiated_event_id, ci.clone());
        (initiated_event_id, ci)
    }

    pub fn add_child_workflow_execution_started_event(
        &mut self,
        initiated_event_id: i64,
        domain: String,
        execution: WorkflowExecution,
        workflow_type: String,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        let run_id = execution.run_id.clone();
        let event_id = self.buffer_or_append(
            EventAttributes::ChildWorkflowExecutionStarted {
                initiated_event_id,
                domain,
                execution,
                workflow_type,
            },
            buffer_cap,
        )?;
        if let Some(ci) = self.pending_children.get_mut(&initiated_event_id) {
            // the virtual ID is backfilled on flush for buffered starts
            ci.started_event_id = event_id.or(Some(initiated_event_id));
            ci.started_run_id = Some(run_id);
        }
        Ok(event_id)
    }

    pub fn add_child_workflow_terminal_event(
        &mut self,
        initiated_event_id: i64,
        attributes: EventAttributes,
        buffer_cap: usize,
    ) -> Result<Option<i64>, EngineError> {
        self.pending_children.remove(&initiated_event_id);
        self.buffer_or_append(attributes, buffer_cap)
    }

    // ------------------------------------------------------------------
    // External workflow interactions
    // ------------------------------------------------------------------

    pub fn add_request_cancel_external_workflow_execution_initiated_event(
        &mut self,
        decision_task_completed_event_id: i64,
        cancel_request_id: String,
        domain: Option<String>,
        execution: WorkflowExecution,
        child_workflow_only: bool,
    ) -> i64 {
        self.append_event(EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
            decision_task_completed_event_id,
            domain,
            execution,
            child_workflow_only,
            cancel_request_id,
        })
    }

    pub fn add_signal_external_workflow_execution_initiated_event(
        &mut self,
        decision_task_completed_event_id: i64,
        signal_request_id: String,
        domain: Option<String>,
        execution: WorkflowExecution,
        signal_name: String,
        input: String,
        child_workflow_only: bool,
    ) -> i64 {
        self.append_event(EventAttributes::SignalExternalWorkflowExecutionInitiated {
            decision_task_completed_event_id,
            domain,
            execution,
            signal_name,
            input,
            child_workflow_only,
            signal_request_id,
        })
    }

    pub fn add_marker_recorded_event(
        &mut self,
        decision_task_completed_event_id: i64,
        marker_name: String,
        details: String,
    ) -> i64 {
        self.append_event(EventAttributes::MarkerRecorded {
            decision_task_completed_event_id,
            marker_name,
            details,
        })
    }

    // ------------------------------------------------------------------
    // Backoff queries
    // ------------------------------------------------------------------

    /// Backoff until the next cron fire, `None` when this is not a cron
    /// workflow.
    pub fn cron_backoff_ms(&self, now_ms: i64) -> Option<i64> {
        cron::backoff_to_next_fire(
            &self.execution_info.cron_schedule,
            self.execution_info.start_timestamp_ms,
            now_ms,
        )
    }

    /// Backoff owed by the workflow retry policy for a failure with
    /// `reason`, `None` when no retry is owed.
    pub fn retry_backoff_ms(&self, reason: &str, now_ms: i64) -> Option<i64> {
        if !self.execution_info.has_retry_policy {
            return None;
        }
        let policy = RetryPolicy {
            initial_interval_seconds: self.execution_info.retry_initial_interval_seconds,
            backoff_coefficient: self.execution_info.retry_backoff_coefficient,
            maximum_interval_seconds: self.execution_info.retry_maximum_interval_seconds,
            maximum_attempts: self.execution_info.retry_maximum_attempts,
            expiration_seconds: 0,
            non_retriable_reasons: self.execution_info.retry_non_retriable_reasons.clone(),
        };
        policy.next_backoff(
            self.execution_info.attempt,
            reason,
            now_ms,
            self.execution_info.retry_expiration_time_ms,
        )
    }

    // ------------------------------------------------------------------
    // Continue-as-new
    // ------------------------------------------------------------------

    /// Close this run with a continue-as-new event and build the successor
    /// run. The successor is persisted atomically with this run's final
    /// batch.
    #[allow(clippy::too_many_arguments)]
    pub fn add_continue_as_new_event(
        &mut self,
        decision_task_completed_event_id: i64,
        attrs: &ContinueAsNewWorkflowExecutionAttributes,
        new_run_id: String,
        domain_id: &str,
        replicated: bool,
        failover_version: i64,
        now_ms: i64,
    ) -> Result<ContinueAsNewSuccessor, EngineError> {
        let initiator = attrs.initiator.unwrap_or(ContinueAsNewInitiator::Decider);
        self.append_event(EventAttributes::WorkflowExecutionContinuedAsNew {
            decision_task_completed_event_id,
            new_execution_run_id: new_run_id.clone(),
            workflow_type: attrs.workflow_type.clone(),
            task_list: attrs.task_list.clone(),
            input: attrs.input.clone(),
            execution_timeout_seconds: attrs.execution_timeout_seconds,
            decision_timeout_seconds: attrs.decision_timeout_seconds,
            backoff_start_interval_seconds: attrs.backoff_start_interval_seconds,
            initiator,
            failure_reason: attrs.failure_reason.clone(),
            failure_details: attrs.failure_details.clone(),
            last_completion_result: attrs.last_completion_result.clone(),
        });
        self.close_execution(WorkflowCloseStatus::ContinuedAsNew);

        let execution =
            WorkflowExecution::new(self.execution_info.workflow_id.clone(), new_run_id);
        let mut new_state = if replicated {
            MutableState::new_with_replication_state(domain_id, execution, failover_version)
        } else {
            MutableState::new(domain_id, execution)
        };

        let attempt = match initiator {
            ContinueAsNewInitiator::RetryPolicy => self.execution_info.attempt + 1,
            _ => 0,
        };
        let cron_schedule = if attrs.cron_schedule.is_empty() {
            self.execution_info.cron_schedule.clone()
        } else {
            attrs.cron_schedule.clone()
        };
        let retry_policy = attrs.retry_policy.clone().or_else(|| {
            if self.execution_info.has_retry_policy {
                Some(RetryPolicy {
                    initial_interval_seconds: self.execution_info.retry_initial_interval_seconds,
                    backoff_coefficient: self.execution_info.retry_backoff_coefficient,
                    maximum_interval_seconds: self.execution_info.retry_maximum_interval_seconds,
                    maximum_attempts: self.execution_info.retry_maximum_attempts,
                    expiration_seconds: 0,
                    non_retriable_reasons: self.execution_info.retry_non_retriable_reasons.clone(),
                })
            } else {
                None
            }
        });
        // a retry chain keeps counting down one shared expiration clock
        let expiration_time_ms = match initiator {
            ContinueAsNewInitiator::RetryPolicy => self.execution_info.retry_expiration_time_ms,
            _ => 0,
        };
        new_state.add_workflow_execution_started_event(WorkflowStartParams {
            workflow_type: attrs.workflow_type.clone(),
            task_list: attrs.task_list.clone(),
            input: attrs.input.clone(),
            execution_timeout_seconds: attrs.execution_timeout_seconds,
            decision_timeout_seconds: attrs.decision_timeout_seconds,
            identity: String::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            parent: self.execution_info.parent.clone(),
            retry_policy,
            cron_schedule,
            first_decision_backoff_seconds: attrs.backoff_start_interval_seconds,
            attempt,
            expiration_time_ms,
            initiator: Some(initiator),
            continued_from_run_id: Some(self.execution_info.run_id.clone()),
            continued_failure_reason: attrs.failure_reason.clone(),
            continued_failure_details: attrs.failure_details.clone(),
            last_completion_result: attrs.last_completion_result.clone(),
        });

        let mut transfer_tasks = vec![TransferTask::new(TransferTaskKind::RecordWorkflowStarted)];
        let backoff_ms = attrs.backoff_start_interval_seconds as i64 * 1000;
        if backoff_ms == 0 {
            let di = new_state
                .add_decision_task_scheduled_event()
                .ok_or_else(|| EngineError::internal("failed to schedule first decision of successor run"))?;
            transfer_tasks.push(TransferTask::new(TransferTaskKind::DecisionTask {
                domain_id: domain_id.to_string(),
                task_list: di.task_list,
                schedule_id: di.schedule_id,
            }));
        }
        let mut timer_tasks = vec![TimerTask {
            version: new_state.current_version(),
            fire_at_ms: now_ms + attrs.execution_timeout_seconds as i64 * 1000 + backoff_ms,
            kind: TimerTaskKind::WorkflowTimeout,
        }];
        if backoff_ms > 0 {
            let backoff_kind = match initiator {
                ContinueAsNewInitiator::RetryPolicy => WorkflowBackoffKind::Retry,
                _ => WorkflowBackoffKind::Cron,
            };
            timer_tasks.push(TimerTask {
                version: new_state.current_version(),
                fire_at_ms: now_ms + backoff_ms,
                kind: TimerTaskKind::WorkflowBackoff {
                    backoff: backoff_kind,
                },
            });
        }

        Ok(ContinueAsNewSuccessor {
            state: new_state,
            transfer_tasks,
            timer_tasks,
        })
    }

    // ------------------------------------------------------------------
    // Transaction close
    // ------------------------------------------------------------------

    pub fn has_pending_events(&self) -> bool {
        !self.new_events.is_empty() || !self.buffered_events.is_empty()
    }

    /// Close the mutation cycle: flush the buffer when no decision is in
    /// flight, drain the appended events, advance `last_first_event_id` and
    /// the replication write position. Enforces that nothing follows a
    /// close event within the batch.
    pub fn close_transaction(
        &mut self,
        current_cluster: &str,
    ) -> Result<TransactionEvents, EngineError> {
        if !self.has_in_flight_decision_task() {
            self.flush_buffered_events();
        } else if !self.buffered_events.is_empty() {
            warn!(
                workflow_id = %self.execution_info.workflow_id,
                run_id = %self.execution_info.run_id,
                buffered = self.buffered_events.len(),
                "persisting with events still buffered behind an in-flight decision"
            );
        }
        let events = std::mem::take(&mut self.new_events);
        if let Some(position) = events.iter().position(HistoryEvent::is_workflow_close) {
            if position != events.len() - 1 {
                return Err(EngineError::internal(
                    "events appended after workflow close event",
                ));
            }
        }
        let first_event_id = events
            .first()
            .map(|e| e.event_id)
            .unwrap_or(self.execution_info.next_event_id);
        if !events.is_empty() {
            self.execution_info.last_first_event_id = first_event_id;
        }
        if let Some(rs) = self.replication_state.as_mut() {
            rs.last_write_version = rs.current_version;
            if let Some(last) = events.last() {
                rs.last_write_event_id = last.event_id;
                rs.last_replication_info.insert(
                    current_cluster.to_string(),
                    ReplicationInfo {
                        version: rs.current_version,
                        last_event_id: last.event_id,
                    },
                );
            }
        }
        Ok(TransactionEvents {
            first_event_id,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_state() -> MutableState {
        let mut ms = MutableState::new("domain-1", WorkflowExecution::new("wf", "run-1"));
        ms.add_workflow_execution_started_event(WorkflowStartParams {
            workflow_type: "TestWorkflow".into(),
            task_list: "tl".into(),
            execution_timeout_seconds: 60,
            decision_timeout_seconds: 10,
            request_id: "req-1".into(),
            ..Default::default()
        });
        ms
    }

    fn drain(ms: &mut MutableState) -> Vec<HistoryEvent> {
        ms.close_transaction("active").unwrap().events
    }

    #[test]
    fn event_ids_are_contiguous_from_first() {
        let mut ms = running_state();
        ms.add_decision_task_scheduled_event().unwrap();
        let events = drain(&mut ms);
        let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(ms.next_event_id(), 3);
        assert_eq!(ms.last_first_event_id(), 1);
    }

    #[test]
    fn decision_lifecycle_and_last_processed_event() {
        let mut ms = running_state();
        let di = ms.add_decision_task_scheduled_event().unwrap();
        assert_eq!(di.attempt, 0);
        let di = ms
            .add_decision_task_started_event(di.schedule_id, "poll-req".into(), "worker".into())
            .unwrap();
        assert!(ms.has_in_flight_decision_task());
        let completed = ms
            .add_decision_task_completed_event(
                di.schedule_id,
                di.started_id.unwrap(),
                "worker".into(),
                String::new(),
                10,
            )
            .unwrap();
        assert!(!ms.has_pending_decision_task());
        assert_eq!(ms.previous_started_event_id(), di.started_id);
        assert_eq!(completed, di.started_id.unwrap() + 1);
    }

    #[test]
    fn transient_decision_appends_no_events_until_completion() {
        let mut ms = running_state();
        let di = ms.add_decision_task_scheduled_event().unwrap();
        let di = ms
            .add_decision_task_started_event(di.schedule_id, "r1".into(), "w".into())
            .unwrap();
        ms.add_decision_task_failed_event(
            di.schedule_id,
            di.started_id.unwrap(),
            DecisionTaskFailedCause::UnhandledDecision,
            String::new(),
            "w".into(),
        );
        let events_before = drain(&mut ms).len();

        // next attempt is transient: schedule + start produce no events
        let di = ms.add_decision_task_scheduled_event().unwrap();
        assert_eq!(di.attempt, 1);
        let di = ms
            .add_decision_task_started_event(di.schedule_id, "r2".into(), "w".into())
            .unwrap();
        assert!(drain(&mut ms).is_empty());
        assert!(events_before > 0);

        // completion materializes the transient events
        ms.add_decision_task_completed_event(
            di.schedule_id,
            di.started_id.unwrap(),
            "w".into(),
            String::new(),
            10,
        )
        .unwrap();
        let events = drain(&mut ms);
        assert!(matches!(
            events[0].attributes,
            EventAttributes::DecisionTaskScheduled { attempt: 1, .. }
        ));
        assert!(matches!(
            events[1].attributes,
            EventAttributes::DecisionTaskStarted { .. }
        ));
        assert!(matches!(
            events[2].attributes,
            EventAttributes::DecisionTaskCompleted { .. }
        ));
    }

    #[test]
    fn signals_buffer_while_decision_in_flight() {
        let mut ms = running_state();
        let di = ms.add_decision_task_scheduled_event().unwrap();
        ms.add_decision_task_started_event(di.schedule_id, "r".into(), "w".into())
            .unwrap();
        let appended = ms
            .add_workflow_execution_signaled("sig".into(), "in".into(), "id".into(), 10)
            .unwrap();
        assert!(appended.is_none());
        assert!(ms.has_buffered_events());

        // in-flight decision keeps the buffer out of the batch
        let di = ms.get_pending_decision(di.schedule_id).unwrap().clone();
        let batch = drain(&mut ms);
        assert!(!batch.iter().any(|e| matches!(
            e.attributes,
            EventAttributes::WorkflowExecutionSignaled { .. }
        )));

        ms.add_decision_task_completed_event(
            di.schedule_id,
            di.started_id.unwrap(),
            "w".into(),
            String::new(),
            10,
        )
        .unwrap();
        let batch = drain(&mut ms);
        assert!(batch.iter().any(|e| matches!(
            e.attributes,
            EventAttributes::WorkflowExecutionSignaled { .. }
        )));
        assert!(!ms.has_buffered_events());
    }

    #[test]
    fn buffered_events_cap_is_enforced() {
        let mut ms = running_state();
        let di = ms.add_decision_task_scheduled_event().unwrap();
        ms.add_decision_task_started_event(di.schedule_id, "r".into(), "w".into())
            .unwrap();
        ms.add_workflow_execution_signaled("a".into(), "".into(), "".into(), 1)
            .unwrap();
        let err = ms
            .add_workflow_execution_signaled("b".into(), "".into(), "".into(), 1)
            .unwrap_err();
        assert_eq!(err, EngineError::BufferedEventsLimitExceeded);
    }

    #[test]
    fn auto_reset_points_rotate_at_cap() {
        let mut ms = running_state();
        for i in 0..4 {
            let di = ms.add_decision_task_scheduled_event().unwrap();
            let di = ms
                .add_decision_task_started_event(di.schedule_id, format!("r{i}"), "w".into())
                .unwrap();
            ms.add_decision_task_completed_event(
                di.schedule_id,
                di.started_id.unwrap(),
                "w".into(),
                format!("checksum-{i}"),
                3,
            )
            .unwrap();
        }
        let points = &ms.execution_info.auto_reset_points;
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].binary_checksum, "checksum-1");
        assert_eq!(points[2].binary_checksum, "checksum-3");
    }

    #[test]
    fn duplicate_activity_and_timer_ids_are_rejected() {
        let mut ms = running_state();
        let attrs = ScheduleActivityTaskAttributes {
            activity_id: "act-1".into(),
            activity_type: "T".into(),
            task_list: "tl".into(),
            schedule_to_close_timeout_seconds: 30,
            schedule_to_start_timeout_seconds: 10,
            start_to_close_timeout_seconds: 20,
            ..Default::default()
        };
        assert!(ms.add_activity_task_scheduled_event(2, &attrs).is_some());
        assert!(ms.add_activity_task_scheduled_event(2, &attrs).is_none());

        let timer = StartTimerAttributes {
            timer_id: "t-1".into(),
            start_to_fire_timeout_seconds: 5,
        };
        assert!(ms.add_timer_started_event(2, &timer, 0).is_some());
        assert!(ms.add_timer_started_event(2, &timer, 0).is_none());
    }

    #[test]
    fn activity_retry_rolls_attempt_and_emits_timer() {
        let mut ms = running_state();
        let attrs = ScheduleActivityTaskAttributes {
            activity_id: "act-1".into(),
            activity_type: "T".into(),
            task_list: "tl".into(),
            schedule_to_close_timeout_seconds: 300,
            schedule_to_start_timeout_seconds: 300,
            start_to_close_timeout_seconds: 300,
            retry_policy: Some(RetryPolicy {
                initial_interval_seconds: 2,
                backoff_coefficient: 2.0,
                maximum_interval_seconds: 0,
                maximum_attempts: 3,
                expiration_seconds: 0,
                non_retriable_reasons: vec![],
            }),
            ..Default::default()
        };
        let (schedule_id, _) = ms.add_activity_task_scheduled_event(2, &attrs).unwrap();
        let _ = ms.add_activity_task_started_event(schedule_id, "req".into(), "w".into());

        let task = ms.create_activity_retry_timer(schedule_id, "boom", 1_000).unwrap();
        assert_eq!(task.fire_at_ms, 3_000);
        let ai = ms.get_activity_info(schedule_id).unwrap();
        assert_eq!(ai.attempt, 1);
        assert!(ai.started_id.is_none());

        // second failure: backoff doubles
        let task = ms.create_activity_retry_timer(schedule_id, "boom", 10_000).unwrap();
        assert_eq!(task.fire_at_ms, 14_000);
        // third failure exhausts the policy
        assert!(ms.create_activity_retry_timer(schedule_id, "boom", 20_000).is_none());
    }

    #[test]
    fn close_transaction_rejects_events_after_close() {
        let mut ms = running_state();
        ms.add_completed_workflow_event(2, "done".into());
        // simulate a buggy caller appending past the close
        ms.execution_info.state = WorkflowState::Running;
        ms.add_workflow_execution_signaled("late".into(), "".into(), "".into(), 0)
            .unwrap();
        assert!(ms.close_transaction("active").is_err());
    }

    #[test]
    fn signal_dedup_set() {
        let mut ms = running_state();
        assert!(!ms.is_signal_requested("r1"));
        ms.add_signal_requested("r1");
        assert!(ms.is_signal_requested("r1"));
        ms.delete_signal_requested("r1");
        assert!(!ms.is_signal_requested("r1"));
    }

    #[test]
    fn replication_write_state_advances_on_close() {
        let mut ms = MutableState::new_with_replication_state(
            "domain-1",
            WorkflowExecution::new("wf", "run-1"),
            100,
        );
        ms.add_workflow_execution_started_event(WorkflowStartParams {
            workflow_type: "T".into(),
            task_list: "tl".into(),
            execution_timeout_seconds: 60,
            decision_timeout_seconds: 10,
            request_id: "r".into(),
            ..Default::default()
        });
        ms.update_replication_version(120);
        let batch = ms.close_transaction("cluster-a").unwrap();
        let rs = ms.replication_state.as_ref().unwrap();
        assert_eq!(rs.current_version, 120);
        assert_eq!(rs.last_write_version, 120);
        assert_eq!(
            rs.last_write_event_id,
            batch.events.last().unwrap().event_id
        );
        assert_eq!(rs.last_replication_info["cluster-a"].version, 120);

        // versions never regress
        ms.update_replication_version(110);
        assert_eq!(ms.current_version(), 120);
    }

    #[test]
    fn continue_as_new_builds_successor_with_first_decision() {
        let mut ms = running_state();
        let attrs = ContinueAsNewWorkflowExecutionAttributes {
            workflow_type: "TestWorkflow".into(),
            task_list: "tl".into(),
            input: "next".into(),
            execution_timeout_seconds: 60,
            decision_timeout_seconds: 10,
            backoff_start_interval_seconds: 0,
            ..Default::default()
        };
        let successor = ms
            .add_continue_as_new_event(5, &attrs, "run-2".into(), "domain-1", false, 0, 1_000)
            .unwrap();
        assert!(!ms.is_workflow_running());
        assert_eq!(
            ms.execution_info.close_status,
            WorkflowCloseStatus::ContinuedAsNew
        );
        assert_eq!(successor.state.execution_info.run_id, "run-2");
        assert!(successor.state.has_pending_decision_task());
        assert!(successor
            .transfer_tasks
            .iter()
            .any(|t| matches!(t.kind, TransferTaskKind::DecisionTask { .. })));
        assert!(successor
            .timer_tasks
            .iter()
            .any(|t| matches!(t.kind, TimerTaskKind::WorkflowTimeout)));
    }

    #[test]
    fn continue_as_new_with_backoff_delays_first_decision() {
        let mut ms = running_state();
        let attrs = ContinueAsNewWorkflowExecutionAttributes {
            workflow_type: "TestWorkflow".into(),
            task_list: "tl".into(),
            execution_timeout_seconds: 60,
            decision_timeout_seconds: 10,
            backoff_start_interval_seconds: 30,
            initiator: Some(ContinueAsNewInitiator::CronSchedule),
            ..Default::default()
        };
        let successor = ms
            .add_continue_as_new_event(5, &attrs, "run-2".into(), "domain-1", false, 0, 1_000)
            .unwrap();
        assert!(!successor.state.has_pending_decision_task());
        let backoff = successor
            .timer_tasks
            .iter()
            .find(|t| matches!(t.kind, TimerTaskKind::WorkflowBackoff { .. }))
            .unwrap();
        assert_eq!(backoff.fire_at_ms, 31_000);
        let timeout = successor
            .timer_tasks
            .iter()
            .find(|t| matches!(t.kind, TimerTaskKind::WorkflowTimeout))
            .unwrap();
        assert_eq!(timeout.fire_at_ms, 1_000 + 60_000 + 30_000);
    }
}
