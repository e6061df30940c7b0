//! Shard persistence seams.
//!
//! The engine reaches storage through four narrow traits: [`ShardContext`]
//! (conditional execution writes, task IDs, per-cluster clocks),
//! [`HistoryStore`] (append-only event storage), [`ExecutionStore`]
//! (current-run lookup) and [`VisibilityStore`] (retention deletion). All
//! execution writes are atomic over the state snapshot and the transfer /
//! timer / replication tasks they carry.
//!
//! [`ShardContextWrapper`] decorates a shard so queue processors hear about
//! freshly persisted tasks immediately after the write commits; processor
//! references are injected after construction to break the reference cycle.

pub mod in_memory;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::error::EngineError;
use crate::notifier::{HistoryEventNotification, HistoryEventNotifier};
use crate::queues::{ReplicatorQueueProcessor, TransferQueueProcessor};
use crate::state::MutableState;
use crate::{HistoryEvent, ReplicationTask, TimerTask, TransferTask, WorkflowExecution};

/// How a create resolves against an existing current run for the same
/// workflow ID.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateWorkflowMode {
    /// No current run may exist.
    BrandNew,
    /// Replace a closed current run after the reuse policy allowed it.
    WorkflowIdReuse {
        prev_run_id: String,
        prev_last_write_version: i64,
    },
    /// Atomic successor creation for continue-as-new.
    ContinueAsNew { prev_run_id: String },
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub snapshot: MutableState,
    pub mode: CreateWorkflowMode,
    pub transaction_id: i64,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    pub replication_tasks: Vec<ReplicationTask>,
}

#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub snapshot: MutableState,
    /// `next_event_id` observed at load; mismatch fails the write with
    /// [`EngineError::Conflict`].
    pub condition: i64,
    pub transaction_id: i64,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    pub replication_tasks: Vec<ReplicationTask>,
    /// Successor run persisted atomically with this update.
    pub continue_as_new: Option<Box<CreateWorkflowExecutionRequest>>,
}

#[derive(Debug, Clone)]
pub struct AppendHistoryEventsRequest {
    pub domain_id: String,
    pub execution: WorkflowExecution,
    pub first_event_id: i64,
    pub events: Vec<HistoryEvent>,
    pub transaction_id: i64,
}

/// Pointer record naming the current run for a workflow ID.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentExecution {
    pub run_id: String,
    pub state: crate::WorkflowState,
    pub close_status: crate::WorkflowCloseStatus,
    pub last_write_version: i64,
    pub start_request_id: String,
}

#[async_trait]
pub trait ShardContext: Send + Sync {
    fn shard_id(&self) -> i32;

    /// Fresh monotonic ID used both as the transaction ID of writes and as
    /// the task ID seed.
    async fn next_transfer_task_id(&self) -> Result<i64, EngineError>;

    /// This shard's view of a cluster's clock (remote clusters lag).
    fn current_time_ms(&self, cluster_name: &str) -> i64;
    fn set_current_time_ms(&self, cluster_name: &str, time_ms: i64);

    fn domain_notification_version(&self) -> i64;
    fn update_domain_notification_version(&self, version: i64);

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), EngineError>;

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), EngineError>;

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<MutableState, EngineError>;

    fn notify_new_history_event(&self, notification: &HistoryEventNotification);
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_history_events(
        &self,
        request: AppendHistoryEventsRequest,
    ) -> Result<(), EngineError>;

    /// Events with `first_event_id <= event_id < next_event_id`.
    async fn read_history(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, EngineError>;

    async fn delete_workflow_execution_history(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<(), EngineError>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecution, EngineError>;
}

#[async_trait]
pub trait VisibilityStore: Send + Sync {
    async fn delete_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        task_id: i64,
    ) -> Result<(), EngineError>;
}

/// Shard decorator that notifies the transfer and replicator processors
/// after successful writes and fans history notifications out to long-poll
/// subscribers. Timer notifications stay with the engine, which knows the
/// per-cluster timestamp to attach.
pub struct ShardContextWrapper {
    inner: Arc<dyn ShardContext>,
    current_cluster_name: String,
    notifier: Arc<HistoryEventNotifier>,
    transfer_processor: OnceLock<Arc<dyn TransferQueueProcessor>>,
    replicator_processor: OnceLock<Arc<dyn ReplicatorQueueProcessor>>,
}

impl ShardContextWrapper {
    pub fn new(
        inner: Arc<dyn ShardContext>,
        current_cluster_name: impl Into<String>,
        notifier: Arc<HistoryEventNotifier>,
    ) -> Self {
        ShardContextWrapper {
            inner,
            current_cluster_name: current_cluster_name.into(),
            notifier,
            transfer_processor: OnceLock::new(),
            replicator_processor: OnceLock::new(),
        }
    }

    /// Late injection; the processors hold the engine's shard reference, so
    /// they cannot exist before the wrapper does.
    pub fn set_transfer_processor(&self, processor: Arc<dyn TransferQueueProcessor>) {
        let _ = self.transfer_processor.set(processor);
    }

    pub fn set_replicator_processor(&self, processor: Arc<dyn ReplicatorQueueProcessor>) {
        let _ = self.replicator_processor.set(processor);
    }

    fn notify_processors(&self, transfer_tasks: &[TransferTask], replication_tasks: usize) {
        if let Some(processor) = self.transfer_processor.get() {
            processor.notify_new_task(&self.current_cluster_name, transfer_tasks);
        }
        if replication_tasks > 0 {
            if let Some(processor) = self.replicator_processor.get() {
                processor.notify_new_task();
            }
        }
    }
}

#[async_trait]
impl ShardContext for ShardContextWrapper {
    fn shard_id(&self) -> i32 {
        self.inner.shard_id()
    }

    async fn next_transfer_task_id(&self) -> Result<i64, EngineError> {
        self.inner.next_transfer_task_id().await
    }

    fn current_time_ms(&self, cluster_name: &str) -> i64 {
        self.inner.current_time_ms(cluster_name)
    }

    fn set_current_time_ms(&self, cluster_name: &str, time_ms: i64) {
        self.inner.set_current_time_ms(cluster_name, time_ms)
    }

    fn domain_notification_version(&self) -> i64 {
        self.inner.domain_notification_version()
    }

    fn update_domain_notification_version(&self, version: i64) {
        self.inner.update_domain_notification_version(version)
    }

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        let transfer_tasks = request.transfer_tasks.clone();
        let replication_tasks = request.replication_tasks.len();
        self.inner.create_workflow_execution(request).await?;
        self.notify_processors(&transfer_tasks, replication_tasks);
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        let mut transfer_tasks = request.transfer_tasks.clone();
        let mut replication_tasks = request.replication_tasks.len();
        if let Some(new_run) = request.continue_as_new.as_deref() {
            transfer_tasks.extend(new_run.transfer_tasks.iter().cloned());
            replication_tasks += new_run.replication_tasks.len();
        }
        self.inner.update_workflow_execution(request).await?;
        self.notify_processors(&transfer_tasks, replication_tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<MutableState, EngineError> {
        self.inner.get_workflow_execution(domain_id, execution).await
    }

    fn notify_new_history_event(&self, notification: &HistoryEventNotification) {
        self.notifier.notify_new_history_event(notification);
        self.inner.notify_new_history_event(notification);
    }
}
