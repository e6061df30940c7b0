//! Decision-batch processing.
//!
//! A decision-task completion carries an ordered batch of decisions from
//! one worker attempt. The batch is applied inside the OCC loop: the
//! completed event is appended first, each decision then appends events and
//! enqueues transfer tasks, and afterwards the engine derives owed timer
//! tasks, decides whether a new decision task is needed, and persists.
//! Certain conditions fail the decision instead: all pending mutations are
//! discarded, the state is reloaded and a `DecisionTaskFailed` event is
//! appended so the worker gets a fresh attempt.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ExecutionLease;
use crate::domain::DomainCacheEntry;
use crate::error::EngineError;
use crate::state::{ContinueAsNewSuccessor, MutableState};
use crate::timers::TimerBuilder;
use crate::{
    CancelTimerAttributes, ContinueAsNewInitiator, ContinueAsNewWorkflowExecutionAttributes,
    Decision, DecisionTaskFailedCause, EventAttributes, RecordMarkerAttributes,
    RequestCancelActivityTaskAttributes, RequestCancelExternalWorkflowExecutionAttributes,
    RetryPolicy, ScheduleActivityTaskAttributes, SignalExternalWorkflowExecutionAttributes,
    StartChildWorkflowExecutionAttributes, StartTimerAttributes, TaskToken, TimerTask,
    TransferTask, TransferTaskKind, WorkflowExecution,
    ACTIVITY_CANCELLATION_MSG_ACTIVITY_ID_UNKNOWN, ACTIVITY_CANCELLATION_MSG_NOT_STARTED,
    FAILURE_REASON_BLOB_SIZE_EXCEEDS_LIMIT, FIRST_EVENT_ID, TIMER_CANCELLATION_MSG_TIMER_ID_UNKNOWN,
};

use super::requests::{
    RespondDecisionTaskCompletedRequest, RespondDecisionTaskCompletedResponse,
};
use super::Engine;

/// Enforces payload limits per decision attribute. Crossing the warn limit
/// logs; crossing the error limit converts the batch into a fail-workflow.
struct DecisionBlobSizeChecker {
    size_limit_warn: usize,
    size_limit_error: usize,
    workflow_id: String,
    run_id: String,
}

impl DecisionBlobSizeChecker {
    fn fail_workflow_if_blob_size_exceeds_limit(
        &self,
        ms: &mut MutableState,
        completed_id: i64,
        blob_size: usize,
        message: &str,
    ) -> bool {
        if blob_size <= self.size_limit_warn {
            return false;
        }
        if blob_size <= self.size_limit_error {
            warn!(
                workflow_id = %self.workflow_id,
                run_id = %self.run_id,
                blob_size,
                "decision payload size exceeds warn limit"
            );
            return false;
        }
        warn!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            blob_size,
            "decision payload size exceeds error limit, failing workflow"
        );
        ms.add_fail_workflow_event(
            completed_id,
            FAILURE_REASON_BLOB_SIZE_EXCEEDS_LIMIT.to_string(),
            message.to_string(),
        );
        true
    }
}

/// The run's start attributes, needed to synthesize cron / retry
/// continue-as-new.
struct StartedEventView {
    workflow_type: String,
    task_list: String,
    input: String,
    execution_timeout_seconds: i32,
    decision_timeout_seconds: i32,
    retry_policy: Option<RetryPolicy>,
    last_completion_result: Option<String>,
}

/// Accumulated outcome of one decision batch, before persist.
struct ProcessResult {
    completed_id: i64,
    started_id: i64,
    fail_decision: Option<(DecisionTaskFailedCause, String)>,
    is_complete: bool,
    activity_not_started_cancelled: bool,
    has_unhandled_events: bool,
    has_decision_schedule_activity: bool,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
    continue_as_new: Option<ContinueAsNewSuccessor>,
}

enum LoopStep {
    Stale,
    Proceed(Box<ProcessResult>),
}

impl Engine {
    /// Process a batch of worker-emitted decisions for a single decision
    /// attempt.
    pub async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse, EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let token = TaskToken::deserialize(&request.task_token)?;
        let schedule_id = token
            .schedule_id
            .ok_or_else(|| EngineError::bad_request("ScheduleID is not set on task token."))?;
        let execution = WorkflowExecution::new(token.workflow_id.clone(), token.run_id.clone());

        let mut lease = self
            .cache
            .acquire(&domain_entry.info.id, &execution, self.default_deadline())
            .await?;
        let result = self
            .handle_decision_completed_locked(&mut lease, &domain_entry, &request, &token, schedule_id)
            .await;
        lease.release(&result);
        result
    }

    async fn handle_decision_completed_locked(
        &self,
        lease: &mut ExecutionLease,
        domain_entry: &DomainCacheEntry,
        request: &RespondDecisionTaskCompletedRequest,
        token: &TaskToken,
        schedule_id: i64,
    ) -> Result<RespondDecisionTaskCompletedResponse, EngineError> {
        let domain_id = domain_entry.info.id.clone();
        let size_checker = DecisionBlobSizeChecker {
            size_limit_warn: self.config.blob_size_limit_warn,
            size_limit_error: self.config.blob_size_limit_error,
            workflow_id: token.workflow_id.clone(),
            run_id: token.run_id.clone(),
        };

        for _attempt in 0..self.config.conditional_retry_count {
            let timer_builder = self.timer_builder();

            let step = self
                .process_decision_batch(
                    lease,
                    domain_entry,
                    request,
                    token,
                    schedule_id,
                    &size_checker,
                    &timer_builder,
                )
                .await?;
            let mut result = match step {
                LoopStep::Stale => {
                    self.stale_state_reloads
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    lease.clear();
                    continue;
                }
                LoopStep::Proceed(result) => *result,
            };

            if let Some((cause, message)) = result.fail_decision.take() {
                info!(
                    workflow_id = %token.workflow_id,
                    run_id = %token.run_id,
                    ?cause,
                    "failing the decision"
                );
                // discard everything the batch accumulated and record the
                // failure against a freshly loaded state
                lease.clear();
                let ms = lease.load().await?;
                ms.add_decision_task_failed_event(
                    schedule_id,
                    result.started_id,
                    cause,
                    message,
                    request.identity.clone(),
                );
                result.is_complete = false;
                result.has_unhandled_events = true;
                result.continue_as_new = None;
                result.transfer_tasks.clear();
                result.timer_tasks.clear();
            }

            let mut transfer_tasks = result.transfer_tasks;
            let mut timer_tasks = result.timer_tasks;
            let create_new_decision = !result.is_complete
                && (result.has_unhandled_events
                    || request.force_create_new_decision_task
                    || result.activity_not_started_cancelled);
            let mut new_decision_schedule_id = None;
            {
                let ms = lease
                    .state_mut()
                    .ok_or_else(|| EngineError::internal("mutable state missing in decision loop"))?;
                if let Some(task) = timer_builder.get_user_timer_task_if_needed(ms) {
                    timer_tasks.push(task);
                }
                if result.has_decision_schedule_activity {
                    if let Some(task) = timer_builder.get_activity_timer_task_if_needed(ms) {
                        timer_tasks.push(task);
                    }
                }
                if create_new_decision {
                    let di = ms.add_decision_task_scheduled_event().ok_or_else(|| {
                        EngineError::internal("failed to add decision scheduled event")
                    })?;
                    new_decision_schedule_id = Some(di.schedule_id);
                    if !request.return_new_decision_task {
                        transfer_tasks.push(TransferTask::new(TransferTaskKind::DecisionTask {
                            domain_id: domain_id.clone(),
                            task_list: di.task_list.clone(),
                            schedule_id: di.schedule_id,
                        }));
                        if ms.is_sticky_task_list_enabled() {
                            let timeout =
                                ms.execution_info.sticky_schedule_to_start_timeout_seconds;
                            timer_tasks.push(
                                timer_builder
                                    .add_schedule_to_start_decision_timeout_task(&di, timeout),
                            );
                        }
                    } else {
                        // the worker asked for the next decision inline:
                        // start it now, bypassing transfer dispatch
                        let di = ms
                            .add_decision_task_started_event(
                                di.schedule_id,
                                "request-from-RespondDecisionTaskCompleted".to_string(),
                                request.identity.clone(),
                            )
                            .ok_or_else(|| {
                                EngineError::internal("failed to start inline decision task")
                            })?;
                        timer_tasks
                            .push(timer_builder.add_start_to_close_decision_timeout_task(&di));
                    }
                }
            }

            if result.is_complete {
                let (close_task, delete_task) =
                    self.workflow_cleanup_tasks(&domain_id, &timer_builder).await?;
                transfer_tasks.push(close_task);
                timer_tasks.push(delete_task);
            }

            let transaction_id = self.shard.next_transfer_task_id().await?;
            let mut notify_timers = timer_tasks.clone();
            let update_result = match result.continue_as_new.take() {
                Some(successor) => {
                    notify_timers.extend(successor.timer_tasks.iter().cloned());
                    lease
                        .continue_as_new_workflow_execution(
                            successor,
                            transfer_tasks,
                            timer_tasks,
                            transaction_id,
                        )
                        .await
                }
                None => {
                    lease
                        .update_workflow_execution(transfer_tasks, timer_tasks, transaction_id)
                        .await
                }
            };
            match update_result {
                Ok(()) => {
                    self.notify_new_timers(&notify_timers);
                    let mut response = RespondDecisionTaskCompletedResponse::default();
                    if request.return_new_decision_task && create_new_decision {
                        if let Some(new_schedule_id) = new_decision_schedule_id {
                            let ms = lease.state_mut().ok_or_else(|| {
                                EngineError::internal("mutable state missing after update")
                            })?;
                            if let Some(di) = ms.get_pending_decision(new_schedule_id) {
                                let di = di.clone();
                                let mut started =
                                    Self::record_decision_task_started_response(ms, &di);
                                // sticky is implied when the worker polls
                                // through the completion call
                                started.sticky_execution_enabled = true;
                                response.started_response = Some(started);
                            }
                        }
                    }
                    return Ok(response);
                }
                Err(EngineError::Conflict) => {
                    self.conflict_retries
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    continue;
                }
                Err(original @ EngineError::TransactionSizeLimit { .. }) => {
                    self.terminate_oversized_workflow(lease, &domain_id, &original).await?;
                    return Err(original);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Phase one of the loop body: validate the token against the pending
    /// decision, append the completed event and walk the decision batch.
    #[allow(clippy::too_many_arguments)]
    async fn process_decision_batch(
        &self,
        lease: &mut ExecutionLease,
        domain_entry: &DomainCacheEntry,
        request: &RespondDecisionTaskCompletedRequest,
        token: &TaskToken,
        schedule_id: i64,
        size_checker: &DecisionBlobSizeChecker,
        timer_builder: &TimerBuilder,
    ) -> Result<LoopStep, EngineError> {
        let domain_id = domain_entry.info.id.clone();
        let max_id_length = self.config.max_id_length_limit;
        let max_reset_points = self.config.max_auto_reset_points;
        let buffer_cap = self.config.maximum_buffered_events;
        let now_ms = timer_builder.now_ms();

        let ms = lease.load().await?;
        if !ms.is_workflow_running() {
            return Err(EngineError::WorkflowCompleted);
        }
        let di = match ms.get_pending_decision(schedule_id) {
            None if schedule_id >= ms.next_event_id() => return Ok(LoopStep::Stale),
            None => return Err(EngineError::entity_not_exists("Decision task not found.")),
            Some(di) => di.clone(),
        };
        let started_id = match di.started_id {
            Some(started_id) if di.attempt == token.schedule_attempt => started_id,
            _ => return Err(EngineError::entity_not_exists("Decision task not found.")),
        };

        if ms.execution_info.auto_reset_points.len() >= max_reset_points {
            debug!(
                workflow_id = %token.workflow_id,
                "auto-reset points at limit, oldest will rotate out"
            );
        }
        let completed_id = ms
            .add_decision_task_completed_event(
                schedule_id,
                started_id,
                request.identity.clone(),
                request.binary_checksum.clone(),
                max_reset_points,
            )
            .ok_or_else(|| {
                EngineError::internal("unable to add decision task completed event to history")
            })?;

        let mut result = ProcessResult {
            completed_id,
            started_id,
            fail_decision: None,
            is_complete: false,
            activity_not_started_cancelled: false,
            has_unhandled_events: ms.has_buffered_events(),
            has_decision_schedule_activity: false,
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            continue_as_new: None,
        };

        match request.sticky_attributes.as_ref() {
            None => ms.clear_stickiness(),
            Some(sticky) if sticky.worker_task_list.is_empty() => ms.clear_stickiness(),
            Some(sticky) => {
                ms.execution_info.sticky_task_list = sticky.worker_task_list.clone();
                ms.execution_info.sticky_schedule_to_start_timeout_seconds =
                    sticky.schedule_to_start_timeout_seconds;
            }
        }

        if !request.binary_checksum.is_empty()
            && domain_entry.config.bad_binaries.contains(&request.binary_checksum)
        {
            result.fail_decision = Some((
                DecisionTaskFailedCause::BadBinary,
                format!(
                    "binary {} is already marked as bad deployment",
                    request.binary_checksum
                ),
            ));
            return Ok(LoopStep::Proceed(Box::new(result)));
        }

        'decision_loop: for decision in &request.decisions {
            match decision {
                Decision::ScheduleActivityTask(attrs) => {
                    let mut attrs = attrs.clone();
                    let target_domain_id = if attrs.domain.is_empty() {
                        domain_id.clone()
                    } else {
                        self.domain_cache
                            .get_domain(&attrs.domain)
                            .await
                            .map_err(|_| {
                                EngineError::internal("Unable to schedule activity across domain.")
                            })?
                            .info
                            .id
                            .clone()
                    };
                    validate_activity_schedule_attributes(
                        &mut attrs,
                        ms.execution_info.workflow_timeout_seconds,
                        max_id_length,
                    )?;
                    if size_checker.fail_workflow_if_blob_size_exceeds_limit(
                        ms,
                        completed_id,
                        attrs.input.len(),
                        "ScheduleActivityTaskDecisionAttributes.Input exceeds size limit.",
                    ) {
                        result.is_complete = true;
                        break 'decision_loop;
                    }
                    let Some((activity_schedule_id, _)) =
                        ms.add_activity_task_scheduled_event(completed_id, &attrs)
                    else {
                        result.fail_decision = Some((
                            DecisionTaskFailedCause::ScheduleActivityDuplicateId,
                            format!("duplicate activity ID {}", attrs.activity_id),
                        ));
                        break 'decision_loop;
                    };
                    result.transfer_tasks.push(TransferTask::new(
                        TransferTaskKind::ActivityTask {
                            target_domain_id,
                            task_list: attrs.task_list.clone(),
                            schedule_id: activity_schedule_id,
                        },
                    ));
                    result.has_decision_schedule_activity = true;
                }

                Decision::RequestCancelActivityTask(attrs) => {
                    validate_activity_cancel_attributes(attrs, max_id_length)?;
                    let activity_id = attrs.activity_id.clone();
                    match ms.add_activity_task_cancel_requested_event(completed_id, &activity_id) {
                        None => {
                            ms.add_request_cancel_activity_task_failed_event(
                                completed_id,
                                activity_id,
                                ACTIVITY_CANCELLATION_MSG_ACTIVITY_ID_UNKNOWN.to_string(),
                            );
                        }
                        Some((cancel_requested_event_id, ai)) if ai.started_id.is_none() => {
                            // not started yet: cancel immediately and make
                            // sure the workflow gets a decision to observe it
                            ms.add_activity_task_canceled_event(
                                ai.schedule_id,
                                None,
                                cancel_requested_event_id,
                                ACTIVITY_CANCELLATION_MSG_NOT_STARTED.to_string(),
                                request.identity.clone(),
                                buffer_cap,
                            )?;
                            result.activity_not_started_cancelled = true;
                        }
                        Some(_) => {}
                    }
                }

                Decision::StartTimer(attrs) => {
                    validate_timer_schedule_attributes(attrs, max_id_length)?;
                    if ms.add_timer_started_event(completed_id, attrs, now_ms).is_none() {
                        result.fail_decision = Some((
                            DecisionTaskFailedCause::StartTimerDuplicateId,
                            format!("duplicate timer ID {}", attrs.timer_id),
                        ));
                        break 'decision_loop;
                    }
                }

                Decision::CancelTimer(attrs) => {
                    validate_timer_cancel_attributes(attrs, max_id_length)?;
                    if ms
                        .add_timer_canceled_event(
                            completed_id,
                            &attrs.timer_id,
                            request.identity.clone(),
                        )
                        .is_none()
                    {
                        ms.add_cancel_timer_failed_event(
                            completed_id,
                            attrs.timer_id.clone(),
                            TIMER_CANCELLATION_MSG_TIMER_ID_UNKNOWN.to_string(),
                            request.identity.clone(),
                        );
                    } else {
                        // the canceled timer may have already fired into the
                        // buffer; recompute whether unhandled events remain
                        result.has_unhandled_events = ms.has_buffered_events();
                    }
                }

                Decision::RecordMarker(attrs) => {
                    validate_record_marker_attributes(attrs, max_id_length)?;
                    if size_checker.fail_workflow_if_blob_size_exceeds_limit(
                        ms,
                        completed_id,
                        attrs.details.len(),
                        "RecordMarkerDecisionAttributes.Details exceeds size limit.",
                    ) {
                        result.is_complete = true;
                        break 'decision_loop;
                    }
                    ms.add_marker_recorded_event(
                        completed_id,
                        attrs.marker_name.clone(),
                        attrs.details.clone(),
                    );
                }

                Decision::CompleteWorkflowExecution(attrs) => {
                    if result.has_unhandled_events {
                        result.fail_decision = Some((
                            DecisionTaskFailedCause::UnhandledDecision,
                            String::new(),
                        ));
                        break 'decision_loop;
                    }
                    if result.is_complete {
                        warn!(
                            workflow_id = %token.workflow_id,
                            "multiple completion decisions, only the first is honored"
                        );
                        continue 'decision_loop;
                    }
                    if size_checker.fail_workflow_if_blob_size_exceeds_limit(
                        ms,
                        completed_id,
                        attrs.result.len(),
                        "CompleteWorkflowExecutionDecisionAttributes.Result exceeds size limit.",
                    ) {
                        result.is_complete = true;
                        break 'decision_loop;
                    }
                    match ms.cron_backoff_ms(now_ms) {
                        None => {
                            ms.add_completed_workflow_event(completed_id, attrs.result.clone());
                        }
                        Some(cron_backoff_ms) => {
                            // cron: the run re-fires as a new execution
                            // instead of completing
                            let started = self
                                .get_workflow_started_view(&domain_id, &token.workflow_id, &token.run_id)
                                .await?;
                            let can_attrs = ContinueAsNewWorkflowExecutionAttributes {
                                workflow_type: started.workflow_type,
                                task_list: started.task_list,
                                input: started.input,
                                execution_timeout_seconds: started.execution_timeout_seconds,
                                decision_timeout_seconds: started.decision_timeout_seconds,
                                backoff_start_interval_seconds: ((cron_backoff_ms + 999) / 1000)
                                    as i32,
                                initiator: Some(ContinueAsNewInitiator::CronSchedule),
                                retry_policy: started.retry_policy,
                                cron_schedule: ms.execution_info.cron_schedule.clone(),
                                failure_reason: None,
                                failure_details: None,
                                last_completion_result: Some(attrs.result.clone()),
                            };
                            let successor = ms.add_continue_as_new_event(
                                completed_id,
                                &can_attrs,
                                Uuid::new_v4().to_string(),
                                &domain_id,
                                domain_entry.can_replicate_event(),
                                domain_entry.failover_version,
                                now_ms,
                            )?;
                            result.continue_as_new = Some(successor);
                        }
                    }
                    result.is_complete = true;
                }

                Decision::FailWorkflowExecution(attrs) => {
                    if result.has_unhandled_events {
                        result.fail_decision = Some((
                            DecisionTaskFailedCause::UnhandledDecision,
                            String::new(),
                        ));
                        break 'decision_loop;
                    }
                    if result.is_complete {
                        warn!(
                            workflow_id = %token.workflow_id,
                            "multiple completion decisions, only the first is honored"
                        );
                        continue 'decision_loop;
                    }
                    if size_checker.fail_workflow_if_blob_size_exceeds_limit(
                        ms,
                        completed_id,
                        attrs.details.len(),
                        "FailWorkflowExecutionDecisionAttributes.Details exceeds size limit.",
                    ) {
                        result.is_complete = true;
                        break 'decision_loop;
                    }
                    // the retry backoff takes priority over cron
                    let (backoff_ms, initiator) = match ms.retry_backoff_ms(&attrs.reason, now_ms)
                    {
                        Some(backoff) => (Some(backoff), ContinueAsNewInitiator::RetryPolicy),
                        None => (
                            ms.cron_backoff_ms(now_ms),
                            ContinueAsNewInitiator::CronSchedule,
                        ),
                    };
                    match backoff_ms {
                        None => {
                            ms.add_fail_workflow_event(
                                completed_id,
                                attrs.reason.clone(),
                                attrs.details.clone(),
                            );
                        }
                        Some(backoff_ms) => {
                            let started = self
                                .get_workflow_started_view(&domain_id, &token.workflow_id, &token.run_id)
                                .await?;
                            let can_attrs = ContinueAsNewWorkflowExecutionAttributes {
                                workflow_type: started.workflow_type,
                                task_list: started.task_list,
                                input: started.input,
                                execution_timeout_seconds: started.execution_timeout_seconds,
                                decision_timeout_seconds: started.decision_timeout_seconds,
                                backoff_start_interval_seconds: ((backoff_ms + 999) / 1000) as i32,
                                initiator: Some(initiator),
                                retry_policy: started.retry_policy,
                                cron_schedule: ms.execution_info.cron_schedule.clone(),
                                failure_reason: Some(attrs.reason.clone()),
                                failure_details: Some(attrs.details.clone()),
                                last_completion_result: started.last_completion_result,
                            };
                            let successor = ms.add_continue_as_new_event(
                                completed_id,
                                &can_attrs,
                                Uuid::new_v4().to_string(),
                                &domain_id,
                                domain_entry.can_replicate_event(),
                                domain_entry.failover_version,
                                now_ms,
                            )?;
                            result.continue_as_new = Some(successor);
                        }
                    }
                    result.is_complete = true;
                }

                Decision::CancelWorkflowExecution(attrs) => {
                    if result.has_unhandled_events {
                        result.fail_decision = Some((
                            DecisionTaskFailedCause::UnhandledDecision,
                            String::new(),
                        ));
                        break 'decision_loop;
                    }
                    if result.is_complete {
                        warn!(
                            workflow_id = %token.workflow_id,
                            "multiple completion decisions, only the first is honored"
                        );
                        continue 'decision_loop;
                    }
                    ms.add_workflow_execution_canceled_event(completed_id, attrs.details.clone());
                    result.is_complete = true;
                }

                Decision::ContinueAsNewWorkflowExecution(attrs) => {
                    if result.has_unhandled_events {
                        result.fail_decision = Some((
                            DecisionTaskFailedCause::UnhandledDecision,
                            String::new(),
                        ));
                        break 'decision_loop;
                    }
                    if result.is_complete {
                        warn!(
                            workflow_id = %token.workflow_id,
                            "multiple completion decisions, only the first is honored"
                        );
                        continue 'decision_loop;
                    }
                    let mut attrs = attrs.clone();
                    validate_continue_as_new_attributes(ms, &mut attrs, max_id_length)?;
                    if size_checker.fail_workflow_if_blob_size_exceeds_limit(
                        ms,
                        completed_id,
                        attrs.input.len(),
                        "ContinueAsNewWorkflowExecutionDecisionAttributes.Input exceeds size limit.",
                    ) {
                        result.is_complete = true;
                        break 'decision_loop;
                    }
                    let successor = ms.add_continue_as_new_event(
                        completed_id,
                        &attrs,
                        Uuid::new_v4().to_string(),
                        &domain_id,
                        domain_entry.can_replicate_event(),
                        domain_entry.failover_version,
                        now_ms,
                    )?;
                    result.continue_as_new = Some(successor);
                    result.is_complete = true;
                }

                Decision::StartChildWorkflowExecution(attrs) => {
                    let mut attrs = attrs.clone();
                    validate_start_child_execution_attributes(ms, &mut attrs, max_id_length)?;
                    if size_checker.fail_workflow_if_blob_size_exceeds_limit(
                        ms,
                        completed_id,
                        attrs.input.len(),
                        "StartChildWorkflowExecutionDecisionAttributes.Input exceeds size limit.",
                    ) {
                        result.is_complete = true;
                        break 'decision_loop;
                    }
                    let target_domain_id = if attrs.domain.is_empty() {
                        domain_id.clone()
                    } else {
                        self.domain_cache
                            .get_domain(&attrs.domain)
                            .await
                            .map_err(|_| {
                                EngineError::internal(
                                    "Unable to schedule child execution across domain.",
                                )
                            })?
                            .info
                            .id
                            .clone()
                    };
                    let (initiated_event_id, _) = ms
                        .add_start_child_workflow_execution_initiated_event(
                            completed_id,
                            Uuid::new_v4().to_string(),
                            &attrs,
                        );
                    result.transfer_tasks.push(TransferTask::new(
                        TransferTaskKind::StartChildExecution {
                            target_domain_id,
                            target_workflow_id: attrs.workflow_id.clone(),
                            initiated_event_id,
                        },
                    ));
                }

                Decision::RequestCancelExternalWorkflowExecution(attrs) => {
                    validate_cancel_external_attributes(attrs, max_id_length)?;
                    let target_domain_id = if attrs.domain.is_empty() {
                        domain_id.clone()
                    } else {
                        self.domain_cache
                            .get_domain(&attrs.domain)
                            .await
                            .map_err(|_| {
                                EngineError::internal(format!(
                                    "Unable to cancel workflow across domain: {}.",
                                    attrs.domain
                                ))
                            })?
                            .info
                            .id
                            .clone()
                    };
                    let cancel_request_id = Uuid::new_v4().to_string();
                    let initiated_event_id = ms
                        .add_request_cancel_external_workflow_execution_initiated_event(
                            completed_id,
                            cancel_request_id,
                            (!attrs.domain.is_empty()).then(|| attrs.domain.clone()),
                            WorkflowExecution::new(attrs.workflow_id.clone(), attrs.run_id.clone()),
                            attrs.child_workflow_only,
                        );
                    result.transfer_tasks.push(TransferTask::new(
                        TransferTaskKind::CancelExecution {
                            target_domain_id,
                            target_workflow_id: attrs.workflow_id.clone(),
                            target_run_id: attrs.run_id.clone(),
                            target_child_workflow_only: attrs.child_workflow_only,
                            initiated_event_id,
                        },
                    ));
                }

                Decision::SignalExternalWorkflowExecution(attrs) => {
                    validate_signal_external_attributes(attrs, max_id_length)?;
                    if size_checker.fail_workflow_if_blob_size_exceeds_limit(
                        ms,
                        completed_id,
                        attrs.input.len(),
                        "SignalExternalWorkflowExecutionDecisionAttributes.Input exceeds size limit.",
                    ) {
                        result.is_complete = true;
                        break 'decision_loop;
                    }
                    let target_domain_id = if attrs.domain.is_empty() {
                        domain_id.clone()
                    } else {
                        self.domain_cache
                            .get_domain(&attrs.domain)
                            .await
                            .map_err(|_| {
                                EngineError::internal(format!(
                                    "Unable to signal workflow across domain: {}.",
                                    attrs.domain
                                ))
                            })?
                            .info
                            .id
                            .clone()
                    };
                    // the request ID deduplicates the signal at the target
                    let signal_request_id = Uuid::new_v4().to_string();
                    let initiated_event_id = ms
                        .add_signal_external_workflow_execution_initiated_event(
                            completed_id,
                            signal_request_id,
                            (!attrs.domain.is_empty()).then(|| attrs.domain.clone()),
                            attrs.execution.clone(),
                            attrs.signal_name.clone(),
                            attrs.input.clone(),
                            attrs.child_workflow_only,
                        );
                    result.transfer_tasks.push(TransferTask::new(
                        TransferTaskKind::SignalExecution {
                            target_domain_id,
                            target_workflow_id: attrs.execution.workflow_id.clone(),
                            target_run_id: attrs.execution.run_id.clone(),
                            target_child_workflow_only: attrs.child_workflow_only,
                            initiated_event_id,
                        },
                    ));
                }
            }
        }

        Ok(LoopStep::Proceed(Box::new(result)))
    }

    async fn get_workflow_started_view(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<StartedEventView, EngineError> {
        let execution = WorkflowExecution::new(workflow_id.to_string(), run_id.to_string());
        let events = self
            .history_store
            .read_history(domain_id, &execution, FIRST_EVENT_ID, FIRST_EVENT_ID + 1)
            .await?;
        let Some(first) = events.first() else {
            return Err(EngineError::internal("no history found for execution"));
        };
        match &first.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                task_list,
                input,
                execution_timeout_seconds,
                decision_timeout_seconds,
                retry_policy,
                last_completion_result,
                ..
            } => Ok(StartedEventView {
                workflow_type: workflow_type.clone(),
                task_list: task_list.clone(),
                input: input.clone(),
                execution_timeout_seconds: *execution_timeout_seconds,
                decision_timeout_seconds: *decision_timeout_seconds,
                retry_policy: retry_policy.clone(),
                last_completion_result: last_completion_result.clone(),
            }),
            _ => Err(EngineError::internal(
                "first history event is not workflow started",
            )),
        }
    }
}

// ----------------------------------------------------------------------
// Per-decision validation; unspecified fields inherit as the original does
// ----------------------------------------------------------------------

fn validate_activity_schedule_attributes(
    attrs: &mut ScheduleActivityTaskAttributes,
    workflow_timeout_seconds: i32,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.task_list.is_empty() {
        return Err(EngineError::bad_request("TaskList is not set on decision."));
    }
    if attrs.activity_id.is_empty() {
        return Err(EngineError::bad_request("ActivityId is not set on decision."));
    }
    if attrs.activity_type.is_empty() {
        return Err(EngineError::bad_request("ActivityType is not set on decision."));
    }
    crate::validate_retry_policy(attrs.retry_policy.as_ref())?;
    if attrs.activity_id.len() > max_id_length {
        return Err(EngineError::bad_request("ActivityID exceeds length limit."));
    }
    if attrs.activity_type.len() > max_id_length {
        return Err(EngineError::bad_request("ActivityType exceeds length limit."));
    }
    if attrs.domain.len() > max_id_length {
        return Err(EngineError::bad_request("Domain exceeds length limit."));
    }
    if attrs.schedule_to_close_timeout_seconds < 0
        || attrs.schedule_to_start_timeout_seconds < 0
        || attrs.start_to_close_timeout_seconds < 0
        || attrs.heartbeat_timeout_seconds < 0
    {
        return Err(EngineError::bad_request("A valid timeout may not be negative."));
    }

    // no activity timeout may outlive the workflow timeout
    attrs.schedule_to_close_timeout_seconds =
        attrs.schedule_to_close_timeout_seconds.min(workflow_timeout_seconds);
    attrs.schedule_to_start_timeout_seconds =
        attrs.schedule_to_start_timeout_seconds.min(workflow_timeout_seconds);
    attrs.start_to_close_timeout_seconds =
        attrs.start_to_close_timeout_seconds.min(workflow_timeout_seconds);
    attrs.heartbeat_timeout_seconds = attrs.heartbeat_timeout_seconds.min(workflow_timeout_seconds);

    let valid_schedule_to_close = attrs.schedule_to_close_timeout_seconds > 0;
    let valid_schedule_to_start = attrs.schedule_to_start_timeout_seconds > 0;
    let valid_start_to_close = attrs.start_to_close_timeout_seconds > 0;
    if valid_schedule_to_close {
        if !valid_schedule_to_start {
            attrs.schedule_to_start_timeout_seconds = attrs.schedule_to_close_timeout_seconds;
        }
        if !valid_start_to_close {
            attrs.start_to_close_timeout_seconds = attrs.schedule_to_close_timeout_seconds;
        }
    } else if valid_schedule_to_start && valid_start_to_close {
        attrs.schedule_to_close_timeout_seconds = (attrs.schedule_to_start_timeout_seconds
            + attrs.start_to_close_timeout_seconds)
            .min(workflow_timeout_seconds);
    } else {
        // not enough information to deduce the missing timeouts
        return Err(EngineError::bad_request(
            "A valid ScheduleToCloseTimeout is not set on decision.",
        ));
    }

    // retrying activities must stay schedulable until the policy expires
    if let Some(policy) = attrs.retry_policy.as_ref() {
        let expiration = if policy.expiration_seconds == 0 {
            workflow_timeout_seconds
        } else {
            policy.expiration_seconds
        };
        if attrs.schedule_to_start_timeout_seconds < expiration {
            attrs.schedule_to_start_timeout_seconds = expiration;
        }
        if attrs.schedule_to_close_timeout_seconds < expiration {
            attrs.schedule_to_close_timeout_seconds = expiration;
        }
    }
    Ok(())
}

fn validate_timer_schedule_attributes(
    attrs: &StartTimerAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.timer_id.is_empty() {
        return Err(EngineError::bad_request("TimerId is not set on decision."));
    }
    if attrs.timer_id.len() > max_id_length {
        return Err(EngineError::bad_request("TimerId exceeds length limit."));
    }
    if attrs.start_to_fire_timeout_seconds <= 0 {
        return Err(EngineError::bad_request(
            "A valid StartToFireTimeoutSeconds is not set on decision.",
        ));
    }
    Ok(())
}

fn validate_activity_cancel_attributes(
    attrs: &RequestCancelActivityTaskAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.activity_id.is_empty() {
        return Err(EngineError::bad_request("ActivityId is not set on decision."));
    }
    if attrs.activity_id.len() > max_id_length {
        return Err(EngineError::bad_request("ActivityId exceeds length limit."));
    }
    Ok(())
}

fn validate_timer_cancel_attributes(
    attrs: &CancelTimerAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.timer_id.is_empty() {
        return Err(EngineError::bad_request("TimerId is not set on decision."));
    }
    if attrs.timer_id.len() > max_id_length {
        return Err(EngineError::bad_request("TimerId exceeds length limit."));
    }
    Ok(())
}

fn validate_record_marker_attributes(
    attrs: &RecordMarkerAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.marker_name.is_empty() {
        return Err(EngineError::bad_request("MarkerName is not set on decision."));
    }
    if attrs.marker_name.len() > max_id_length {
        return Err(EngineError::bad_request("MarkerName exceeds length limit."));
    }
    Ok(())
}

fn validate_continue_as_new_attributes(
    ms: &MutableState,
    attrs: &mut ContinueAsNewWorkflowExecutionAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    let info = &ms.execution_info;
    if attrs.workflow_type.is_empty() {
        attrs.workflow_type = info.workflow_type.clone();
    }
    if attrs.task_list.is_empty() {
        attrs.task_list = info.task_list.clone();
    }
    if attrs.task_list.len() > max_id_length {
        return Err(EngineError::bad_request("TaskList exceeds length limit."));
    }
    if attrs.workflow_type.len() > max_id_length {
        return Err(EngineError::bad_request("WorkflowType exceeds length limit."));
    }
    if attrs.execution_timeout_seconds <= 0 {
        attrs.execution_timeout_seconds = info.workflow_timeout_seconds;
    }
    if attrs.decision_timeout_seconds <= 0 {
        attrs.decision_timeout_seconds = info.decision_timeout_seconds;
    }
    Ok(())
}

fn validate_start_child_execution_attributes(
    ms: &MutableState,
    attrs: &mut StartChildWorkflowExecutionAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.workflow_id.is_empty() {
        return Err(EngineError::bad_request(
            "Required field WorkflowID is not set on decision.",
        ));
    }
    if attrs.workflow_type.is_empty() {
        return Err(EngineError::bad_request(
            "Required field WorkflowType is not set on decision.",
        ));
    }
    if attrs.domain.len() > max_id_length {
        return Err(EngineError::bad_request("Domain exceeds length limit."));
    }
    if attrs.workflow_id.len() > max_id_length {
        return Err(EngineError::bad_request("WorkflowId exceeds length limit."));
    }
    if attrs.workflow_type.len() > max_id_length {
        return Err(EngineError::bad_request("WorkflowType exceeds length limit."));
    }
    crate::validate_retry_policy(attrs.retry_policy.as_ref())?;
    crate::cron::validate_schedule(&attrs.cron_schedule)?;

    let info = &ms.execution_info;
    if attrs.task_list.is_empty() {
        attrs.task_list = info.task_list.clone();
    }
    if attrs.task_list.len() > max_id_length {
        return Err(EngineError::bad_request("TaskList exceeds length limit."));
    }
    if attrs.execution_timeout_seconds <= 0 {
        attrs.execution_timeout_seconds = info.workflow_timeout_seconds;
    }
    if attrs.decision_timeout_seconds <= 0 {
        attrs.decision_timeout_seconds = info.decision_timeout_seconds;
    }
    Ok(())
}

fn validate_cancel_external_attributes(
    attrs: &RequestCancelExternalWorkflowExecutionAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.workflow_id.is_empty() {
        return Err(EngineError::bad_request("WorkflowId is not set on decision."));
    }
    if attrs.domain.len() > max_id_length {
        return Err(EngineError::bad_request("Domain exceeds length limit."));
    }
    if attrs.workflow_id.len() > max_id_length {
        return Err(EngineError::bad_request("WorkflowId exceeds length limit."));
    }
    if !attrs.run_id.is_empty() && Uuid::parse_str(&attrs.run_id).is_err() {
        return Err(EngineError::bad_request("Invalid RunId set on decision."));
    }
    Ok(())
}

fn validate_signal_external_attributes(
    attrs: &SignalExternalWorkflowExecutionAttributes,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if attrs.execution.workflow_id.is_empty() {
        return Err(EngineError::bad_request("WorkflowId is not set on decision."));
    }
    if attrs.domain.len() > max_id_length {
        return Err(EngineError::bad_request("Domain exceeds length limit."));
    }
    if attrs.execution.workflow_id.len() > max_id_length {
        return Err(EngineError::bad_request("WorkflowId exceeds length limit."));
    }
    if !attrs.execution.run_id.is_empty() && Uuid::parse_str(&attrs.execution.run_id).is_err() {
        return Err(EngineError::bad_request("Invalid RunId set on decision."));
    }
    if attrs.signal_name.is_empty() {
        return Err(EngineError::bad_request("SignalName is not set on decision."));
    }
    Ok(())
}
