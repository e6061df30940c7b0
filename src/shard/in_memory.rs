//! In-memory reference shard.
//!
//! Implements every persistence seam with real conditional-update
//! semantics: a current-run pointer per workflow ID, per-run state
//! snapshots, append-only histories and inspectable task queues. The
//! integration tests run the whole engine against it; fault injection
//! hooks let them exercise the conflict, timeout and transaction-size
//! paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{EngineError, WorkflowExecutionAlreadyStartedDetails};
use crate::notifier::HistoryEventNotification;
use crate::state::MutableState;
use crate::{
    HistoryEvent, ReplicationTask, TimerTask, TransferTask, WorkflowExecution, WorkflowState,
};

use super::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, CreateWorkflowMode,
    CurrentExecution, ExecutionStore, HistoryStore, ShardContext, UpdateWorkflowExecutionRequest,
    VisibilityStore,
};

type RunKey = (String, String, String);
type WorkflowKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityDeletion {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub task_id: i64,
}

#[derive(Default)]
struct ShardData {
    executions: HashMap<RunKey, MutableState>,
    current_runs: HashMap<WorkflowKey, CurrentExecution>,
    histories: HashMap<RunKey, Vec<HistoryEvent>>,
}

pub struct InMemoryShard {
    shard_id: i32,
    next_task_id: AtomicI64,
    domain_notification_version: AtomicI64,
    cluster_times: Mutex<HashMap<String, i64>>,
    data: Mutex<ShardData>,
    transfer_tasks: Mutex<Vec<TransferTask>>,
    timer_tasks: Mutex<Vec<TimerTask>>,
    replication_tasks: Mutex<Vec<ReplicationTask>>,
    visibility_deletions: Mutex<Vec<VisibilityDeletion>>,
    notifications: Mutex<Vec<HistoryEventNotification>>,
    inject_create_error: Mutex<Option<EngineError>>,
    inject_update_error: Mutex<Option<EngineError>>,
}

impl InMemoryShard {
    pub fn new(shard_id: i32) -> Self {
        InMemoryShard {
            shard_id,
            next_task_id: AtomicI64::new(1),
            domain_notification_version: AtomicI64::new(0),
            cluster_times: Mutex::new(HashMap::new()),
            data: Mutex::new(ShardData::default()),
            transfer_tasks: Mutex::new(Vec::new()),
            timer_tasks: Mutex::new(Vec::new()),
            replication_tasks: Mutex::new(Vec::new()),
            visibility_deletions: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            inject_create_error: Mutex::new(None),
            inject_update_error: Mutex::new(None),
        }
    }

    // -- test inspection ------------------------------------------------

    pub fn transfer_tasks(&self) -> Vec<TransferTask> {
        self.transfer_tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn timer_tasks(&self) -> Vec<TimerTask> {
        self.timer_tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn replication_tasks(&self) -> Vec<ReplicationTask> {
        self.replication_tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn visibility_deletions(&self) -> Vec<VisibilityDeletion> {
        self.visibility_deletions.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn history_notifications(&self) -> Vec<HistoryEventNotification> {
        self.notifications.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn history_of(&self, domain_id: &str, execution: &WorkflowExecution) -> Vec<HistoryEvent> {
        let key = run_key(domain_id, execution);
        self.data
            .lock()
            .map(|d| d.histories.get(&key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Fail the next create with `error`, once.
    pub fn inject_create_error(&self, error: EngineError) {
        if let Ok(mut slot) = self.inject_create_error.lock() {
            *slot = Some(error);
        }
    }

    /// Fail the next update with `error`, once.
    pub fn inject_update_error(&self, error: EngineError) {
        if let Ok(mut slot) = self.inject_update_error.lock() {
            *slot = Some(error);
        }
    }

    fn lock_data(&self) -> Result<std::sync::MutexGuard<'_, ShardData>, EngineError> {
        self.data
            .lock()
            .map_err(|_| EngineError::internal("shard data lock poisoned"))
    }

    fn record_tasks(
        &self,
        transfer: &[TransferTask],
        timer: &[TimerTask],
        replication: &[ReplicationTask],
    ) {
        if let Ok(mut queue) = self.transfer_tasks.lock() {
            for task in transfer {
                let mut task = task.clone();
                task.task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
                queue.push(task);
            }
        }
        if let Ok(mut queue) = self.timer_tasks.lock() {
            queue.extend(timer.iter().cloned());
            queue.sort_by_key(|t| t.fire_at_ms);
        }
        if let Ok(mut queue) = self.replication_tasks.lock() {
            queue.extend(replication.iter().cloned());
        }
    }

    fn current_record_from(snapshot: &MutableState) -> CurrentExecution {
        CurrentExecution {
            run_id: snapshot.execution_info.run_id.clone(),
            state: snapshot.execution_info.state,
            close_status: snapshot.execution_info.close_status,
            last_write_version: snapshot.last_write_version(),
            start_request_id: snapshot.execution_info.create_request_id.clone(),
        }
    }

    fn apply_create(
        &self,
        data: &mut ShardData,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        let workflow_key = (
            request.domain_id.clone(),
            request.execution.workflow_id.clone(),
        );
        if let Some(existing) = data.current_runs.get(&workflow_key) {
            let conflict = match &request.mode {
                CreateWorkflowMode::BrandNew => true,
                CreateWorkflowMode::WorkflowIdReuse { prev_run_id, .. } => {
                    existing.run_id != *prev_run_id || existing.state != WorkflowState::Completed
                }
                CreateWorkflowMode::ContinueAsNew { prev_run_id } => {
                    existing.run_id != *prev_run_id
                }
            };
            if conflict {
                return Err(EngineError::WorkflowExecutionAlreadyStarted(Box::new(
                    WorkflowExecutionAlreadyStartedDetails {
                        message: format!(
                            "Workflow execution already started. WorkflowId: {}, RunId: {}.",
                            request.execution.workflow_id, existing.run_id
                        ),
                        start_request_id: existing.start_request_id.clone(),
                        run_id: existing.run_id.clone(),
                        state: existing.state,
                        close_status: existing.close_status,
                        last_write_version: existing.last_write_version,
                    },
                )));
            }
        }
        let run = run_key(&request.domain_id, &request.execution);
        data.current_runs
            .insert(workflow_key, Self::current_record_from(&request.snapshot));
        data.executions.insert(run, request.snapshot);
        self.record_tasks(
            &request.transfer_tasks,
            &request.timer_tasks,
            &request.replication_tasks,
        );
        Ok(())
    }
}

fn run_key(domain_id: &str, execution: &WorkflowExecution) -> RunKey {
    (
        domain_id.to_string(),
        execution.workflow_id.clone(),
        execution.run_id.clone(),
    )
}

#[async_trait]
impl ShardContext for InMemoryShard {
    fn shard_id(&self) -> i32 {
        self.shard_id
    }

    async fn next_transfer_task_id(&self) -> Result<i64, EngineError> {
        Ok(self.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    fn current_time_ms(&self, cluster_name: &str) -> i64 {
        self.cluster_times
            .lock()
            .ok()
            .and_then(|times| times.get(cluster_name).copied())
            .unwrap_or_else(crate::now_ms)
    }

    fn set_current_time_ms(&self, cluster_name: &str, time_ms: i64) {
        if let Ok(mut times) = self.cluster_times.lock() {
            times.insert(cluster_name.to_string(), time_ms);
        }
    }

    fn domain_notification_version(&self) -> i64 {
        self.domain_notification_version.load(Ordering::SeqCst)
    }

    fn update_domain_notification_version(&self, version: i64) {
        self.domain_notification_version.store(version, Ordering::SeqCst);
    }

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        if let Some(error) = self.inject_create_error.lock().ok().and_then(|mut e| e.take()) {
            return Err(error);
        }
        let mut data = self.lock_data()?;
        self.apply_create(&mut data, request)
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        if let Some(error) = self.inject_update_error.lock().ok().and_then(|mut e| e.take()) {
            return Err(error);
        }
        let mut data = self.lock_data()?;
        let run = run_key(&request.domain_id, &request.execution);
        let stored = data
            .executions
            .get(&run)
            .ok_or_else(|| EngineError::entity_not_exists("workflow execution not found"))?;
        if stored.next_event_id() != request.condition {
            return Err(EngineError::Conflict);
        }
        let workflow_key = (
            request.domain_id.clone(),
            request.execution.workflow_id.clone(),
        );
        let is_current = data
            .current_runs
            .get(&workflow_key)
            .map(|c| c.run_id == request.execution.run_id)
            .unwrap_or(false);
        if is_current {
            data.current_runs
                .insert(workflow_key, Self::current_record_from(&request.snapshot));
        }
        data.executions.insert(run, request.snapshot);
        self.record_tasks(
            &request.transfer_tasks,
            &request.timer_tasks,
            &request.replication_tasks,
        );
        if let Some(new_run) = request.continue_as_new {
            self.apply_create(&mut data, *new_run)?;
        }
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<MutableState, EngineError> {
        let data = self.lock_data()?;
        data.executions
            .get(&run_key(domain_id, execution))
            .cloned()
            .ok_or_else(|| {
                EngineError::entity_not_exists(format!(
                    "workflow execution not found: {}/{}",
                    execution.workflow_id, execution.run_id
                ))
            })
    }

    fn notify_new_history_event(&self, notification: &HistoryEventNotification) {
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push(notification.clone());
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryShard {
    async fn append_history_events(
        &self,
        request: AppendHistoryEventsRequest,
    ) -> Result<(), EngineError> {
        let mut data = self.lock_data()?;
        let events = data
            .histories
            .entry(run_key(&request.domain_id, &request.execution))
            .or_default();
        // a retried append after a conflicting write wins per position
        events.retain(|e| e.event_id < request.first_event_id);
        events.extend(request.events);
        Ok(())
    }

    async fn read_history(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, EngineError> {
        let data = self.lock_data()?;
        let events = data
            .histories
            .get(&run_key(domain_id, execution))
            .ok_or_else(|| EngineError::entity_not_exists("workflow history not found"))?;
        Ok(events
            .iter()
            .filter(|e| e.event_id >= first_event_id && e.event_id < next_event_id)
            .cloned()
            .collect())
    }

    async fn delete_workflow_execution_history(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<(), EngineError> {
        let mut data = self.lock_data()?;
        data.histories.remove(&run_key(domain_id, execution));
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryShard {
    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecution, EngineError> {
        let data = self.lock_data()?;
        data.current_runs
            .get(&(domain_id.to_string(), workflow_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                EngineError::entity_not_exists(format!(
                    "no current execution for workflow {workflow_id}"
                ))
            })
    }
}

#[async_trait]
impl VisibilityStore for InMemoryShard {
    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        task_id: i64,
    ) -> Result<(), EngineError> {
        if let Ok(mut deletions) = self.visibility_deletions.lock() {
            deletions.push(VisibilityDeletion {
                domain_id: domain_id.to_string(),
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
                task_id,
            });
        }
        Ok(())
    }
}
