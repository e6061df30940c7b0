//! The history engine: request façade, OCC update loop and failover
//! coordination.
//!
//! Every mutation follows the same discipline: acquire the per-execution
//! lease, load mutable state (condition = `next_event_id`), apply the
//! mutation, persist events + state delta + generated tasks atomically
//! conditional on the loaded condition, and notify the queue processors.
//! `Conflict` and `StaleState` are recovered locally by clearing the cached
//! state and retrying up to `conditional_retry_count` times.

mod decisions;
pub mod requests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{ExecutionCache, ExecutionLease};
use crate::config::Config;
use crate::cron;
use crate::domain::{ClusterMetadata, DomainCache, DomainCacheEntry};
use crate::error::EngineError;
use crate::notifier::HistoryEventNotifier;
use crate::queues::{ReplicatorQueueProcessor, TimerQueueProcessor, TransferQueueProcessor};
use crate::shard::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, CreateWorkflowMode, ExecutionStore,
    HistoryStore, ShardContext, ShardContextWrapper, VisibilityStore,
};
use crate::state::{DecisionInfo, MutableState, WorkflowStartParams};
use crate::timers::TimerBuilder;
use crate::{
    stamp_task_info, EventAttributes, HistoryEvent, ReplicationTask, TimerTask, TimerTaskKind,
    TransferTask, TransferTaskKind, WorkflowBackoffKind, WorkflowCloseStatus, WorkflowExecution,
    WorkflowIdReusePolicy, WorkflowIdentifier, WorkflowState, ENGINE_IDENTITY,
    FAILURE_REASON_TRANSACTION_SIZE_EXCEEDS_LIMIT, FIRST_EVENT_ID,
};

pub use requests::*;

// ============================================================================
// Injected collaborators
// ============================================================================

/// Cross-cluster replication hook points. The conflict-resolution algorithm
/// lives behind this trait.
#[async_trait]
pub trait Replicator: Send + Sync {
    async fn apply_events(&self, request: ReplicateEventsRequest) -> Result<(), EngineError>;
    async fn apply_raw_events(&self, request: ReplicateRawEventsRequest) -> Result<(), EngineError>;
    async fn sync_activity(&self, request: SyncActivityRequest) -> Result<(), EngineError>;
}

/// Reset algorithm hook point; the engine validates, loads the base and
/// current runs and dedups by request ID before delegating here.
#[async_trait]
pub trait WorkflowResetor: Send + Sync {
    async fn reset_workflow_execution(
        &self,
        request: &ResetWorkflowExecutionRequest,
        base_state: MutableState,
        current_state: MutableState,
    ) -> Result<ResetWorkflowExecutionResponse, EngineError>;
}

/// Close-hook archival downstream.
#[async_trait]
pub trait ArchivalClient: Send + Sync {
    async fn archive(&self, request: ArchiveRequest) -> Result<(), EngineError>;
}

/// Everything the engine needs at construction. The shard is wrapped so
/// queue processors hear about freshly persisted tasks.
pub struct EngineParams {
    pub shard: Arc<dyn ShardContext>,
    pub history_store: Arc<dyn HistoryStore>,
    pub execution_store: Arc<dyn ExecutionStore>,
    pub visibility_store: Arc<dyn VisibilityStore>,
    pub domain_cache: Arc<dyn DomainCache>,
    pub cluster_metadata: Arc<ClusterMetadata>,
    pub transfer_processor: Arc<dyn TransferQueueProcessor>,
    pub timer_processor: Arc<dyn TimerQueueProcessor>,
    pub replicator_processor: Option<Arc<dyn ReplicatorQueueProcessor>>,
    pub replicator: Option<Arc<dyn Replicator>>,
    pub resetor: Option<Arc<dyn WorkflowResetor>>,
    pub archival_client: Option<Arc<dyn ArchivalClient>>,
    pub notifier: Arc<HistoryEventNotifier>,
    pub config: Config,
}

/// Effects requested by a mutation on top of the events it appended.
#[derive(Debug, Default)]
pub(crate) struct UpdateWorkflowAction {
    pub delete_workflow: bool,
    pub create_decision: bool,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
}

pub struct Engine {
    current_cluster_name: String,
    shard: Arc<dyn ShardContext>,
    history_store: Arc<dyn HistoryStore>,
    execution_store: Arc<dyn ExecutionStore>,
    visibility_store: Arc<dyn VisibilityStore>,
    domain_cache: Arc<dyn DomainCache>,
    cluster_metadata: Arc<ClusterMetadata>,
    transfer_processor: Arc<dyn TransferQueueProcessor>,
    timer_processor: Arc<dyn TimerQueueProcessor>,
    replicator_processor: Option<Arc<dyn ReplicatorQueueProcessor>>,
    replicator: Option<Arc<dyn Replicator>>,
    resetor: Option<Arc<dyn WorkflowResetor>>,
    archival_client: Option<Arc<dyn ArchivalClient>>,
    notifier: Arc<HistoryEventNotifier>,
    cache: ExecutionCache,
    config: Config,
    shutdown: CancellationToken,
    conflict_retries: AtomicU64,
    stale_state_reloads: AtomicU64,
}

impl Engine {
    pub fn new(params: EngineParams) -> Arc<Engine> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let current_cluster_name = params.cluster_metadata.current_cluster_name().to_string();
        let wrapper = Arc::new(ShardContextWrapper::new(
            params.shard,
            current_cluster_name.clone(),
            params.notifier.clone(),
        ));
        wrapper.set_transfer_processor(params.transfer_processor.clone());
        if let Some(replicator_processor) = params.replicator_processor.as_ref() {
            wrapper.set_replicator_processor(replicator_processor.clone());
        }
        let shard: Arc<dyn ShardContext> = wrapper;
        let cache = ExecutionCache::new(
            params.config.execution_cache_size,
            shard.clone(),
            params.history_store.clone(),
            params.execution_store.clone(),
            params.domain_cache.clone(),
            current_cluster_name.clone(),
        );
        Arc::new(Engine {
            current_cluster_name,
            shard,
            history_store: params.history_store,
            execution_store: params.execution_store,
            visibility_store: params.visibility_store,
            domain_cache: params.domain_cache,
            cluster_metadata: params.cluster_metadata,
            transfer_processor: params.transfer_processor,
            timer_processor: params.timer_processor,
            replicator_processor: params.replicator_processor,
            replicator: params.replicator,
            resetor: params.resetor,
            archival_client: params.archival_client,
            notifier: params.notifier,
            cache,
            config: params.config,
            shutdown: CancellationToken::new(),
            conflict_retries: AtomicU64::new(0),
            stale_state_reloads: AtomicU64::new(0),
        })
    }

    /// Spin up the components serving this shard. Kept lazy so the shard
    /// controller can start many shards sequentially without stalling.
    pub fn start(&self) {
        info!(shard_id = self.shard.shard_id(), "history engine starting");
        self.register_domain_failover_callback();
        self.transfer_processor.start();
        self.timer_processor.start();
        if let Some(replicator_processor) = self.replicator_processor.as_ref() {
            replicator_processor.start();
        }
    }

    pub fn stop(&self) {
        info!(shard_id = self.shard.shard_id(), "history engine stopping");
        self.shutdown.cancel();
        self.transfer_processor.stop();
        self.timer_processor.stop();
        if let Some(replicator_processor) = self.replicator_processor.as_ref() {
            replicator_processor.stop();
        }
        self.domain_cache
            .unregister_domain_change_callback(self.shard.shard_id());
    }

    pub fn default_deadline(&self) -> Instant {
        Instant::now() + self.config.default_operation_timeout
    }

    /// OCC conflicts resolved by retry since start; observable for tests
    /// and operators.
    pub fn update_conflict_count(&self) -> u64 {
        self.conflict_retries.load(Ordering::Relaxed)
    }

    pub fn stale_state_reload_count(&self) -> u64 {
        self.stale_state_reloads.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Domain failover coordination
    // ------------------------------------------------------------------

    // Tasks are created while holding the shard lock, so a task persisted
    // before a domain change is visible to the failover level computation.
    // The callback locks both processors, collects domains newly active
    // here, recomputes their dispatch levels, then pushes one synthetic
    // notification per queue to force a store scan at the new boundary.
    fn register_domain_failover_callback(&self) {
        let transfer_processor = self.transfer_processor.clone();
        let timer_processor = self.timer_processor.clone();
        let prepare_transfer = transfer_processor.clone();
        let prepare_timer = timer_processor.clone();
        let shard = self.shard.clone();
        let current_cluster = self.current_cluster_name.clone();

        self.domain_cache.register_domain_change_callback(
            self.shard.shard_id(),
            self.shard.domain_notification_version(),
            Box::new(move || {
                let transfer = prepare_transfer.clone();
                let timer = prepare_timer.clone();
                Box::pin(async move {
                    transfer.lock_task_processing().await;
                    timer.lock_task_processing().await;
                })
            }),
            Box::new(move |next_domains: Vec<Arc<DomainCacheEntry>>| {
                let transfer = transfer_processor.clone();
                let timer = timer_processor.clone();
                let shard = shard.clone();
                let current_cluster = current_cluster.clone();
                Box::pin(async move {
                    if next_domains.is_empty() {
                        transfer.unlock_task_processing();
                        timer.unlock_task_processing();
                        return;
                    }
                    let shard_notification_version = shard.domain_notification_version();
                    let mut failover_domain_ids = HashSet::new();
                    for next_domain in &next_domains {
                        if next_domain.is_global
                            && next_domain.failover_notification_version >= shard_notification_version
                            && next_domain.replication_config.active_cluster_name == current_cluster
                        {
                            failover_domain_ids.insert(next_domain.info.id.clone());
                        }
                    }
                    if !failover_domain_ids.is_empty() {
                        info!(domains = ?failover_domain_ids, "domain failover start");
                        transfer.failover_domain(&failover_domain_ids);
                        timer.failover_domain(&failover_domain_ids);

                        let now = shard.current_time_ms(&current_cluster);
                        // the synthetic tasks are never executed; they only
                        // need a fresh timestamp to trigger a store scan
                        let fake_decision_task = vec![TransferTask::new(
                            TransferTaskKind::DecisionTask {
                                domain_id: String::new(),
                                task_list: String::new(),
                                schedule_id: 0,
                            },
                        )];
                        let fake_decision_timeout_task = vec![TimerTask {
                            version: crate::EMPTY_VERSION,
                            fire_at_ms: now,
                            kind: TimerTaskKind::DecisionTimeout {
                                schedule_id: 0,
                                attempt: 0,
                                timeout_kind: crate::TimeoutKind::StartToClose,
                            },
                        }];
                        transfer.notify_new_task(&current_cluster, &fake_decision_task);
                        timer.notify_new_timers(&current_cluster, now, &fake_decision_timeout_task);
                    }
                    if let Some(last) = next_domains.last() {
                        shard.update_domain_notification_version(last.notification_version + 1);
                    }
                    transfer.unlock_task_processing();
                    timer.unlock_task_processing();
                })
            }),
        );
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    async fn get_active_domain_entry(
        &self,
        domain_id: &str,
    ) -> Result<Arc<DomainCacheEntry>, EngineError> {
        validate_domain_uuid(domain_id)?;
        let entry = self.domain_cache.get_domain_by_id(domain_id).await?;
        if let Some(err) = entry.domain_not_active_error(&self.current_cluster_name) {
            return Err(err);
        }
        Ok(entry)
    }

    fn create_mutable_state(
        &self,
        domain_entry: &DomainCacheEntry,
        execution: &WorkflowExecution,
    ) -> MutableState {
        if self.cluster_metadata.is_global_domain_enabled() && domain_entry.is_global {
            MutableState::new_with_replication_state(
                domain_entry.info.id.clone(),
                execution.clone(),
                domain_entry.failover_version,
            )
        } else {
            MutableState::new(domain_entry.info.id.clone(), execution.clone())
        }
    }

    fn now_ms(&self) -> i64 {
        self.shard.current_time_ms(&self.current_cluster_name)
    }

    fn timer_builder(&self) -> TimerBuilder {
        TimerBuilder::new(self.now_ms())
    }

    fn notify_new_timers(&self, tasks: &[TimerTask]) {
        self.timer_processor
            .notify_new_timers(&self.current_cluster_name, self.now_ms(), tasks);
    }

    async fn workflow_cleanup_tasks(
        &self,
        domain_id: &str,
        timer_builder: &TimerBuilder,
    ) -> Result<(TransferTask, TimerTask), EngineError> {
        let retention_days = match self.domain_cache.get_domain_by_id(domain_id).await {
            Ok(entry) => entry.retention_days(""),
            Err(EngineError::EntityNotExists { .. }) => 0,
            Err(e) => return Err(e),
        };
        Ok((
            TransferTask::new(TransferTaskKind::CloseExecution),
            timer_builder.create_delete_history_event_timer_task(retention_days),
        ))
    }

    // ------------------------------------------------------------------
    // OCC update loop
    // ------------------------------------------------------------------

    pub(crate) async fn update_workflow_execution_with_action<F>(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        mut action: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&mut MutableState, &TimerBuilder) -> Result<UpdateWorkflowAction, EngineError>,
    {
        let deadline = self.default_deadline();
        let mut lease = self.cache.acquire(domain_id, execution, deadline).await?;
        let result = self.run_update_loop(&mut lease, domain_id, &mut action).await;
        lease.release(&result);
        result
    }

    pub(crate) async fn update_workflow_execution<F>(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        create_deletion_task: bool,
        create_decision_task: bool,
        mut action: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&mut MutableState, &TimerBuilder) -> Result<Vec<TimerTask>, EngineError>,
    {
        self.update_workflow_execution_with_action(domain_id, execution, move |ms, tb| {
            let timer_tasks = action(ms, tb)?;
            Ok(UpdateWorkflowAction {
                delete_workflow: create_deletion_task,
                create_decision: create_decision_task,
                transfer_tasks: Vec::new(),
                timer_tasks,
            })
        })
        .await
    }

    async fn run_update_loop<F>(
        &self,
        lease: &mut ExecutionLease,
        domain_id: &str,
        action: &mut F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&mut MutableState, &TimerBuilder) -> Result<UpdateWorkflowAction, EngineError>,
    {
        for _attempt in 0..self.config.conditional_retry_count {
            let timer_builder = self.timer_builder();
            let post = {
                let ms = lease.load().await?;
                action(ms, &timer_builder)
            };
            let post = match post {
                Ok(post) => post,
                Err(EngineError::StaleState) => {
                    self.stale_state_reloads.fetch_add(1, Ordering::Relaxed);
                    lease.clear();
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut transfer_tasks = post.transfer_tasks;
            let mut timer_tasks = post.timer_tasks;
            if post.delete_workflow {
                let (close_task, delete_task) =
                    self.workflow_cleanup_tasks(domain_id, &timer_builder).await?;
                transfer_tasks.push(close_task);
                timer_tasks.push(delete_task);
            }
            if post.create_decision {
                let ms = lease
                    .state_mut()
                    .ok_or_else(|| EngineError::internal("mutable state missing in update loop"))?;
                if !ms.has_pending_decision_task() {
                    let di = ms.add_decision_task_scheduled_event().ok_or_else(|| {
                        EngineError::internal("failed to add decision scheduled event")
                    })?;
                    transfer_tasks.push(TransferTask::new(TransferTaskKind::DecisionTask {
                        domain_id: domain_id.to_string(),
                        task_list: di.task_list.clone(),
                        schedule_id: di.schedule_id,
                    }));
                    if ms.is_sticky_task_list_enabled() {
                        let timeout = ms.execution_info.sticky_schedule_to_start_timeout_seconds;
                        timer_tasks.push(
                            timer_builder.add_schedule_to_start_decision_timeout_task(&di, timeout),
                        );
                    }
                }
            }

            let transaction_id = self.shard.next_transfer_task_id().await?;
            let notify_timers = timer_tasks.clone();
            match lease
                .update_workflow_execution(transfer_tasks, timer_tasks, transaction_id)
                .await
            {
                Ok(()) => {
                    self.notify_new_timers(&notify_timers);
                    return Ok(());
                }
                Err(EngineError::Conflict) => {
                    self.conflict_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(original @ EngineError::TransactionSizeLimit { .. }) => {
                    self.terminate_oversized_workflow(lease, domain_id, &original).await?;
                    return Err(original);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// A write too large to persist force-terminates the run: reload, append
    /// the terminated event with the size-limit reason, emit close-cleanup
    /// tasks, persist, and surface the original error.
    pub(crate) async fn terminate_oversized_workflow(
        &self,
        lease: &mut ExecutionLease,
        domain_id: &str,
        original: &EngineError,
    ) -> Result<(), EngineError> {
        lease.clear();
        let timer_builder = self.timer_builder();
        {
            let ms = lease.load().await?;
            ms.add_workflow_execution_terminated_event(
                FAILURE_REASON_TRANSACTION_SIZE_EXCEEDS_LIMIT.to_string(),
                original.to_string(),
                ENGINE_IDENTITY.to_string(),
            );
        }
        let (close_task, delete_task) =
            self.workflow_cleanup_tasks(domain_id, &timer_builder).await?;
        let transaction_id = self.shard.next_transfer_task_id().await?;
        let timer_tasks = vec![delete_task];
        lease
            .update_workflow_execution(vec![close_task], timer_tasks.clone(), transaction_id)
            .await?;
        self.notify_new_timers(&timer_tasks);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Start / SignalWithStart
    // ------------------------------------------------------------------

    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse, EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        validate_start_workflow_request(&request, self.config.max_id_length_limit)?;

        let execution =
            WorkflowExecution::new(request.workflow_id.clone(), Uuid::new_v4().to_string());
        let mut ms = self.create_mutable_state(&domain_entry, &execution);
        ms.add_workflow_execution_started_event(start_params_from(&request));

        let is_child = request.parent.is_some();
        let backoff_seconds = request.first_decision_backoff_seconds;
        let transfer_tasks =
            self.generate_first_decision_task(&domain_id, &mut ms, is_child, backoff_seconds)?;

        let now = self.now_ms();
        let backoff_ms = backoff_seconds as i64 * 1000;
        let mut timer_tasks = vec![TimerTask {
            version: crate::EMPTY_VERSION,
            fire_at_ms: now + request.execution_timeout_seconds as i64 * 1000 + backoff_ms,
            kind: TimerTaskKind::WorkflowTimeout,
        }];
        if backoff_seconds != 0 && !is_child {
            timer_tasks.push(TimerTask {
                version: crate::EMPTY_VERSION,
                fire_at_ms: now + backoff_ms,
                kind: TimerTaskKind::WorkflowBackoff {
                    backoff: WorkflowBackoffKind::Cron,
                },
            });
        }

        self.create_execution(
            &domain_entry,
            ms,
            execution,
            &request.request_id,
            request.reuse_policy,
            transfer_tasks,
            timer_tasks,
            None,
        )
        .await
    }

    pub async fn signal_with_start_workflow_execution(
        &self,
        request: SignalWithStartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse, EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.start.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();

        // signal the current run when one is running
        let unresolved = WorkflowExecution::new(request.start.workflow_id.clone(), "");
        let mut prev_execution: Option<PrevRunInfo> = None;
        match self.cache.acquire(&domain_id, &unresolved, self.default_deadline()).await {
            Ok(mut lease) => {
                let outcome = self
                    .signal_existing_execution(&mut lease, &domain_entry, &request)
                    .await;
                lease.release(&outcome);
                match outcome? {
                    SignalWithStartOutcome::Signaled(run_id) => {
                        return Ok(StartWorkflowExecutionResponse {
                            run_id,
                            timed_out: false,
                        });
                    }
                    SignalWithStartOutcome::StartNew(prev) => prev_execution = prev,
                }
            }
            Err(EngineError::EntityNotExists { .. }) => {}
            Err(e) => return Err(e),
        }

        // start a fresh run carrying the signal
        let start = &request.start;
        validate_start_workflow_request(start, self.config.max_id_length_limit)?;
        let execution =
            WorkflowExecution::new(start.workflow_id.clone(), Uuid::new_v4().to_string());
        let mut ms = self.create_mutable_state(&domain_entry, &execution);

        if let Some(prev) = prev_execution.as_ref() {
            if prev.last_write_version > ms.current_version() {
                return Err(EngineError::DomainNotActive {
                    domain_name: domain_entry.info.name.clone(),
                    current_cluster: self.current_cluster_name.clone(),
                    active_cluster: self
                        .cluster_metadata
                        .cluster_name_for_failover_version(prev.last_write_version),
                });
            }
            apply_workflow_id_reuse_policy(
                &prev.start_request_id,
                &prev.run_id,
                prev.state,
                prev.close_status,
                &start.workflow_id,
                start.reuse_policy,
            )?;
        }

        ms.add_workflow_execution_started_event(start_params_from(start));
        ms.add_workflow_execution_signaled(
            request.signal_name.clone(),
            request.signal_input.clone(),
            start.identity.clone(),
            self.config.maximum_buffered_events,
        )?;
        let transfer_tasks =
            self.generate_first_decision_task(&domain_id, &mut ms, start.parent.is_some(), 0)?;
        let timer_tasks = vec![TimerTask {
            version: crate::EMPTY_VERSION,
            fire_at_ms: self.now_ms() + start.execution_timeout_seconds as i64 * 1000,
            kind: TimerTaskKind::WorkflowTimeout,
        }];

        self.create_execution(
            &domain_entry,
            ms,
            execution,
            &start.request_id,
            start.reuse_policy,
            transfer_tasks,
            timer_tasks,
            prev_execution,
        )
        .await
    }

    async fn signal_existing_execution(
        &self,
        lease: &mut ExecutionLease,
        domain_entry: &DomainCacheEntry,
        request: &SignalWithStartWorkflowExecutionRequest,
    ) -> Result<SignalWithStartOutcome, EngineError> {
        let domain_id = domain_entry.info.id.clone();
        for _attempt in 0..self.config.conditional_retry_count {
            let prev = match lease.load().await {
                Err(EngineError::EntityNotExists { .. }) => {
                    return Ok(SignalWithStartOutcome::StartNew(None));
                }
                Err(e) => return Err(e),
                Ok(ms) => {
                    if !ms.is_workflow_running() {
                        Some(PrevRunInfo::from_state(ms))
                    } else {
                        None
                    }
                }
            };
            if let Some(prev) = prev {
                return Ok(SignalWithStartOutcome::StartNew(Some(prev)));
            }

            let timer_builder = self.timer_builder();
            let mut transfer_tasks = Vec::new();
            let mut timer_tasks = Vec::new();
            {
                let ms = lease.load().await?;
                let max_signals = self.config.maximum_signals_per_execution;
                if max_signals > 0 && ms.execution_info.signal_count >= max_signals as i64 {
                    info!(
                        workflow_id = %request.start.workflow_id,
                        signal_count = ms.execution_info.signal_count,
                        "execution limit reached for maximum signals"
                    );
                    return Err(EngineError::SignalsLimitExceeded);
                }
                ms.add_workflow_execution_signaled(
                    request.signal_name.clone(),
                    request.signal_input.clone(),
                    request.start.identity.clone(),
                    self.config.maximum_buffered_events,
                )?;
                if !ms.has_pending_decision_task() {
                    let di = ms.add_decision_task_scheduled_event().ok_or_else(|| {
                        EngineError::internal("failed to add decision scheduled event")
                    })?;
                    transfer_tasks.push(TransferTask::new(TransferTaskKind::DecisionTask {
                        domain_id: domain_id.clone(),
                        task_list: di.task_list.clone(),
                        schedule_id: di.schedule_id,
                    }));
                    if ms.is_sticky_task_list_enabled() {
                        let timeout = ms.execution_info.sticky_schedule_to_start_timeout_seconds;
                        timer_tasks.push(
                            timer_builder.add_schedule_to_start_decision_timeout_task(&di, timeout),
                        );
                    }
                }
            }
            let transaction_id = self.shard.next_transfer_task_id().await?;
            let notify_timers = timer_tasks.clone();
            match lease
                .update_workflow_execution(transfer_tasks, timer_tasks, transaction_id)
                .await
            {
                Ok(()) => {
                    self.notify_new_timers(&notify_timers);
                    return Ok(SignalWithStartOutcome::Signaled(
                        lease.identifier().run_id.clone(),
                    ));
                }
                Err(EngineError::Conflict) => {
                    self.conflict_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    fn generate_first_decision_task(
        &self,
        domain_id: &str,
        ms: &mut MutableState,
        is_child: bool,
        backoff_seconds: i32,
    ) -> Result<Vec<TransferTask>, EngineError> {
        let mut transfer_tasks = Vec::new();
        if !is_child {
            // the visibility record is only created for top-level workflows
            transfer_tasks.push(TransferTask::new(TransferTaskKind::RecordWorkflowStarted));
            if backoff_seconds == 0 {
                let di = ms.add_decision_task_scheduled_event().ok_or_else(|| {
                    EngineError::internal("failed to add decision scheduled event")
                })?;
                transfer_tasks.push(TransferTask::new(TransferTaskKind::DecisionTask {
                    domain_id: domain_id.to_string(),
                    task_list: di.task_list.clone(),
                    schedule_id: di.schedule_id,
                }));
            }
        }
        Ok(transfer_tasks)
    }

    /// Append the first history batch, then create the execution record.
    /// On `WorkflowExecutionAlreadyStarted` the request ID decides
    /// idempotent success, a newer write version routes the caller to the
    /// active cluster, and otherwise the reuse policy gates a second create
    /// in reuse mode. Orphan history is deleted on every failure except
    /// persistence timeout, which is success for idempotency purposes.
    #[allow(clippy::too_many_arguments)]
    async fn create_execution(
        &self,
        domain_entry: &DomainCacheEntry,
        mut ms: MutableState,
        execution: WorkflowExecution,
        request_id: &str,
        reuse_policy: WorkflowIdReusePolicy,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
        prev_execution: Option<PrevRunInfo>,
    ) -> Result<StartWorkflowExecutionResponse, EngineError> {
        let domain_id = domain_entry.info.id.clone();
        let version = ms.current_version();
        let now = self.now_ms();
        stamp_task_info(version, now, &mut transfer_tasks, &mut timer_tasks);
        let batch = ms.close_transaction(&self.current_cluster_name)?;
        let transaction_id = self.shard.next_transfer_task_id().await?;
        self.history_store
            .append_history_events(AppendHistoryEventsRequest {
                domain_id: domain_id.clone(),
                execution: execution.clone(),
                first_event_id: batch.first_event_id,
                events: batch.events,
                transaction_id,
            })
            .await?;
        let mut replication_tasks = Vec::new();
        if domain_entry.can_replicate_event() {
            replication_tasks.push(ReplicationTask {
                first_event_id: batch.first_event_id,
                next_event_id: ms.next_event_id(),
                version,
            });
        }

        let mode = match prev_execution {
            Some(prev) => CreateWorkflowMode::WorkflowIdReuse {
                prev_run_id: prev.run_id,
                prev_last_write_version: prev.last_write_version,
            },
            None => CreateWorkflowMode::BrandNew,
        };
        let mut create_request = CreateWorkflowExecutionRequest {
            domain_id: domain_id.clone(),
            execution: execution.clone(),
            snapshot: ms.clone(),
            mode,
            transaction_id,
            transfer_tasks,
            timer_tasks: timer_tasks.clone(),
            replication_tasks,
        };

        let mut result = self.shard.create_workflow_execution(create_request.clone()).await;
        if let Err(EngineError::WorkflowExecutionAlreadyStarted(details)) = &result {
            let details = details.clone();
            if details.start_request_id == request_id {
                // duplicate start: the original run wins, this run's history
                // was created under a different run ID and must go
                self.delete_orphan_history(&domain_id, &execution).await;
                return Ok(StartWorkflowExecutionResponse {
                    run_id: details.run_id.clone(),
                    timed_out: false,
                });
            }
            if ms.current_version() < details.last_write_version {
                self.delete_orphan_history(&domain_id, &execution).await;
                return Err(EngineError::DomainNotActive {
                    domain_name: domain_entry.info.name.clone(),
                    current_cluster: self.current_cluster_name.clone(),
                    active_cluster: self
                        .cluster_metadata
                        .cluster_name_for_failover_version(details.last_write_version),
                });
            }
            if let Err(e) = apply_workflow_id_reuse_policy(
                &details.start_request_id,
                &details.run_id,
                details.state,
                details.close_status,
                &execution.workflow_id,
                reuse_policy,
            ) {
                self.delete_orphan_history(&domain_id, &execution).await;
                return Err(e);
            }
            create_request.mode = CreateWorkflowMode::WorkflowIdReuse {
                prev_run_id: details.run_id.clone(),
                prev_last_write_version: details.last_write_version,
            };
            result = self.shard.create_workflow_execution(create_request).await;
        }

        match result {
            Ok(()) => {
                self.notify_new_timers(&timer_tasks);
                Ok(StartWorkflowExecutionResponse {
                    run_id: execution.run_id,
                    timed_out: false,
                })
            }
            Err(EngineError::ShardOperationTimeout) => {
                // the create may have landed; leaking history beats deleting
                // a possibly-successful run, and a retry with the same
                // request ID resolves the ambiguity
                warn!(
                    workflow_id = %execution.workflow_id,
                    run_id = %execution.run_id,
                    "create timed out at persistence, returning run ID as tentative success"
                );
                self.notify_new_timers(&timer_tasks);
                Ok(StartWorkflowExecutionResponse {
                    run_id: execution.run_id,
                    timed_out: true,
                })
            }
            Err(e) => {
                self.delete_orphan_history(&domain_id, &execution).await;
                Err(e)
            }
        }
    }

    /// The history batch was created for a run ID nothing else can see yet,
    /// so deleting it on create failure is always safe.
    async fn delete_orphan_history(&self, domain_id: &str, execution: &WorkflowExecution) {
        if let Err(e) = self
            .history_store
            .delete_workflow_execution_history(domain_id, execution)
            .await
        {
            warn!(
                workflow_id = %execution.workflow_id,
                run_id = %execution.run_id,
                error = %e,
                "failed to delete orphan history after create failure"
            );
        }
    }

    // ------------------------------------------------------------------
    // Mutable state reads
    // ------------------------------------------------------------------

    /// Snapshot, or long-poll when the caller already holds the tail:
    /// blocks until a persist advances `next_event_id` past
    /// `expected_next_event_id`, the workflow closes, the per-domain
    /// long-poll interval expires, or the engine shuts down.
    pub async fn get_mutable_state(
        &self,
        request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse, EngineError> {
        validate_domain_uuid(&request.domain_id)?;
        let mut execution = request.execution.clone();
        let response = self
            .get_mutable_state_snapshot(&request.domain_id, &execution)
            .await?;
        // pin the resolved run in case the caller queried the current run
        execution.run_id = response.execution.run_id.clone();

        let expected_next_event_id = request.expected_next_event_id.unwrap_or(FIRST_EVENT_ID);
        if expected_next_event_id < response.next_event_id || !response.is_workflow_running {
            return Ok(response);
        }

        let identifier = WorkflowIdentifier::new(
            request.domain_id.clone(),
            execution.workflow_id.clone(),
            execution.run_id.clone(),
        );
        let (subscriber_id, mut receiver) = self.notifier.watch(&identifier)?;
        let result = async {
            // re-check: the event may have landed between snapshot and watch
            let mut response = self
                .get_mutable_state_snapshot(&request.domain_id, &execution)
                .await?;
            if expected_next_event_id < response.next_event_id || !response.is_workflow_running {
                return Ok(response);
            }
            let expiry = tokio::time::sleep(self.config.long_poll_expiration_interval);
            tokio::pin!(expiry);
            loop {
                tokio::select! {
                    notification = receiver.recv() => {
                        match notification {
                            Some(event) => {
                                response.last_first_event_id = event.last_first_event_id;
                                response.next_event_id = event.next_event_id;
                                response.is_workflow_running = event.is_workflow_running;
                                response.previous_started_event_id = event.previous_started_event_id;
                                if expected_next_event_id < response.next_event_id
                                    || !response.is_workflow_running
                                {
                                    return Ok(response);
                                }
                            }
                            None => return Ok(response),
                        }
                    }
                    _ = &mut expiry => return Ok(response),
                    _ = self.shutdown.cancelled() => return Ok(response),
                }
            }
        }
        .await;
        // the subscription must be released on every exit path
        self.notifier.unwatch(&identifier, subscriber_id);
        result
    }

    async fn get_mutable_state_snapshot(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<GetMutableStateResponse, EngineError> {
        let mut lease = self
            .cache
            .acquire(domain_id, execution, self.default_deadline())
            .await?;
        let result = match lease.load().await {
            Ok(ms) => {
                let info = &ms.execution_info;
                Ok(GetMutableStateResponse {
                    execution: WorkflowExecution::new(info.workflow_id.clone(), info.run_id.clone()),
                    workflow_type: info.workflow_type.clone(),
                    last_first_event_id: ms.last_first_event_id(),
                    next_event_id: ms.next_event_id(),
                    previous_started_event_id: ms.previous_started_event_id(),
                    task_list: info.task_list.clone(),
                    sticky_task_list: info.sticky_task_list.clone(),
                    sticky_schedule_to_start_timeout_seconds: info
                        .sticky_schedule_to_start_timeout_seconds,
                    is_workflow_running: ms.is_workflow_running(),
                    replication_info: ms
                        .replication_state
                        .as_ref()
                        .map(|rs| rs.last_replication_info.clone())
                        .unwrap_or_default(),
                })
            }
            Err(e) => Err(e),
        };
        lease.release(&result);
        result
    }

    /// Diagnostic dual view of the mutable state, cached versus persisted.
    pub async fn describe_mutable_state(
        &self,
        request: DescribeMutableStateRequest,
    ) -> Result<DescribeMutableStateResponse, EngineError> {
        validate_domain_uuid(&request.domain_id)?;
        let (cached, database) = self
            .cache
            .get_and_create(&request.domain_id, &request.execution)
            .await?;
        let render = |ms: &MutableState| {
            serde_json::to_string(ms).map_err(|e| EngineError::internal(e.to_string()))
        };
        Ok(DescribeMutableStateResponse {
            mutable_state_in_cache: cached.as_ref().map(render).transpose()?,
            mutable_state_in_database: render(&database)?,
        })
    }

    pub async fn describe_workflow_execution(
        &self,
        request: DescribeWorkflowExecutionRequest,
    ) -> Result<DescribeWorkflowExecutionResponse, EngineError> {
        validate_domain_uuid(&request.domain_id)?;
        let mut lease = self
            .cache
            .acquire(&request.domain_id, &request.execution, self.default_deadline())
            .await?;
        let result = match lease.load().await {
            Ok(ms) => Ok(Self::describe_from_state(ms)),
            Err(e) => Err(e),
        };
        lease.release(&result);
        result
    }

    fn describe_from_state(ms: &MutableState) -> DescribeWorkflowExecutionResponse {
        let info = &ms.execution_info;
        // execution time shifts by the pending retry or cron backoff
        let backoff_ms = if info.has_retry_policy && info.attempt > 0 {
            let factor = info.retry_backoff_coefficient.powi(info.attempt - 1);
            (info.retry_initial_interval_seconds as f64 * factor * 1000.0) as i64
        } else if !info.cron_schedule.is_empty() {
            cron::backoff_to_next_fire(
                &info.cron_schedule,
                info.start_timestamp_ms,
                info.start_timestamp_ms,
            )
            .unwrap_or(0)
        } else {
            0
        };
        let pending_activities = ms
            .pending_activities()
            .map(|ai| {
                let state = if ai.cancel_requested {
                    PendingActivityState::CancelRequested
                } else if ai.started_id.is_some() {
                    PendingActivityState::Started
                } else {
                    PendingActivityState::Scheduled
                };
                PendingActivityDescription {
                    activity_id: ai.activity_id.clone(),
                    activity_type: ai.activity_type.clone(),
                    state,
                    scheduled_timestamp_ms: (state == PendingActivityState::Scheduled)
                        .then_some(ai.scheduled_time_ms),
                    last_started_timestamp_ms: ai.started_id.map(|_| ai.started_time_ms),
                    last_heartbeat_timestamp_ms: (ai.last_heartbeat_ms > 0)
                        .then_some(ai.last_heartbeat_ms),
                    heartbeat_details: (ai.last_heartbeat_ms > 0).then(|| ai.details.clone()),
                    attempt: ai.attempt,
                    maximum_attempts: ai.retry_maximum_attempts,
                }
            })
            .collect();
        DescribeWorkflowExecutionResponse {
            execution: WorkflowExecution::new(info.workflow_id.clone(), info.run_id.clone()),
            workflow_type: info.workflow_type.clone(),
            task_list: info.task_list.clone(),
            execution_timeout_seconds: info.workflow_timeout_seconds,
            decision_timeout_seconds: info.decision_timeout_seconds,
            start_timestamp_ms: info.start_timestamp_ms,
            execution_timestamp_ms: info.start_timestamp_ms + backoff_ms,
            history_length: ms.next_event_id() - FIRST_EVENT_ID,
            close_status: (info.state == WorkflowState::Completed).then_some(info.close_status),
            close_timestamp_ms: info.close_timestamp_ms,
            parent: info.parent.as_ref().map(|p| p.execution.clone()),
            pending_activities,
        }
    }

    // ------------------------------------------------------------------
    // Decision task recording
    // ------------------------------------------------------------------

    pub async fn record_decision_task_started(
        &self,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse, EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let mut lease = self
            .cache
            .acquire(&domain_id, &request.execution, self.default_deadline())
            .await?;
        let result = self.record_decision_task_started_locked(&mut lease, &request).await;
        lease.release(&result);
        result
    }

    async fn record_decision_task_started_locked(
        &self,
        lease: &mut ExecutionLease,
        request: &RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse, EngineError> {
        let schedule_id = request.schedule_id;
        for _attempt in 0..self.config.conditional_retry_count {
            let timer_builder = self.timer_builder();
            enum Outcome {
                Stale,
                Response(RecordDecisionTaskStartedResponse),
                Started(DecisionInfo),
            }
            let outcome = {
                let ms = lease.load().await?;
                if !ms.is_workflow_running() {
                    return Err(EngineError::WorkflowCompleted);
                }
                let pending = ms.get_pending_decision(schedule_id).cloned();
                match pending {
                    None if schedule_id >= ms.next_event_id() => Outcome::Stale,
                    None => {
                        // most probably a duplicate; the task is safe to drop
                        debug!(schedule_id, "potentially duplicate decision task");
                        return Err(EngineError::entity_not_exists("Decision task not found."));
                    }
                    Some(di) if di.started_id.is_some() => {
                        if di.request_id == request.request_id {
                            Outcome::Response(Self::record_decision_task_started_response(ms, &di))
                        } else {
                            debug!(schedule_id, "decision task already started by another call");
                            return Err(EngineError::EventAlreadyStarted {
                                message: "Decision task already started.".to_string(),
                            });
                        }
                    }
                    Some(_) => {
                        let di = ms
                            .add_decision_task_started_event(
                                schedule_id,
                                request.request_id.clone(),
                                request.identity.clone(),
                            )
                            .ok_or_else(|| {
                                EngineError::internal(
                                    "unable to add decision task started event to history",
                                )
                            })?;
                        Outcome::Started(di)
                    }
                }
            };
            let di = match outcome {
                Outcome::Stale => {
                    self.stale_state_reloads.fetch_add(1, Ordering::Relaxed);
                    lease.clear();
                    continue;
                }
                Outcome::Response(response) => return Ok(response),
                Outcome::Started(di) => di,
            };

            let timer_tasks = vec![timer_builder.add_start_to_close_decision_timeout_task(&di)];
            let transaction_id = self.shard.next_transfer_task_id().await?;
            match lease
                .update_workflow_execution(Vec::new(), timer_tasks.clone(), transaction_id)
                .await
            {
                Ok(()) => {
                    self.notify_new_timers(&timer_tasks);
                    let ms = lease
                        .state_mut()
                        .ok_or_else(|| EngineError::internal("mutable state missing after update"))?;
                    return Ok(Self::record_decision_task_started_response(ms, &di));
                }
                Err(EngineError::Conflict) => {
                    self.conflict_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    pub(crate) fn record_decision_task_started_response(
        ms: &MutableState,
        di: &DecisionInfo,
    ) -> RecordDecisionTaskStartedResponse {
        let transient_decision = (di.attempt > 0).then(|| TransientDecisionInfo {
            // retried from mutable state: the scheduled/started pair is not
            // in history yet, so hand the worker synthesized copies
            scheduled_event: HistoryEvent {
                event_id: di.schedule_id,
                timestamp_ms: di.scheduled_timestamp_ms,
                version: di.version,
                attributes: EventAttributes::DecisionTaskScheduled {
                    task_list: di.task_list.clone(),
                    start_to_close_timeout_seconds: di.decision_timeout_seconds,
                    attempt: di.attempt,
                },
            },
            started_event: HistoryEvent {
                event_id: di.started_id.unwrap_or(di.schedule_id + 1),
                timestamp_ms: di.started_timestamp_ms,
                version: di.version,
                attributes: EventAttributes::DecisionTaskStarted {
                    scheduled_event_id: di.schedule_id,
                    identity: String::new(),
                    request_id: di.request_id.clone(),
                },
            },
        });
        RecordDecisionTaskStartedResponse {
            workflow_type: ms.execution_info.workflow_type.clone(),
            previous_started_event_id: ms.previous_started_event_id(),
            scheduled_event_id: di.schedule_id,
            started_event_id: di.started_id.unwrap_or(di.schedule_id + 1),
            next_event_id: ms.next_event_id(),
            attempt: di.attempt,
            sticky_execution_enabled: ms.is_sticky_task_list_enabled(),
            task_list: ms.execution_info.task_list.clone(),
            scheduled_timestamp_ms: di.scheduled_timestamp_ms,
            started_timestamp_ms: di.started_timestamp_ms,
            transient_decision,
        }
    }

    pub async fn respond_decision_task_failed(
        &self,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let token = crate::TaskToken::deserialize(&request.task_token)?;
        let execution = WorkflowExecution::new(token.workflow_id.clone(), token.run_id.clone());
        let schedule_id = token
            .schedule_id
            .ok_or_else(|| EngineError::bad_request("ScheduleID is not set on task token."))?;

        self.update_workflow_execution(&domain_id, &execution, false, true, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let di = match ms.get_pending_decision(schedule_id) {
                None if schedule_id >= ms.next_event_id() => return Err(EngineError::StaleState),
                None => return Err(EngineError::entity_not_exists("Decision task not found.")),
                Some(di) => di.clone(),
            };
            let started_id = match di.started_id {
                Some(id) if di.attempt == token.schedule_attempt => id,
                _ => return Err(EngineError::entity_not_exists("Decision task not found.")),
            };
            ms.add_decision_task_failed_event(
                schedule_id,
                started_id,
                request.cause,
                request.details.clone(),
                request.identity.clone(),
            );
            Ok(Vec::new())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Activity task recording
    // ------------------------------------------------------------------

    pub async fn record_activity_task_started(
        &self,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse, EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let domain_name = domain_entry.info.name.clone();
        let schedule_id = request.schedule_id;
        let mut response: Option<RecordActivityTaskStartedResponse> = None;

        self.update_workflow_execution(&domain_id, &request.execution, false, false, |ms, tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let ai = match ms.get_activity_info(schedule_id) {
                None if schedule_id >= ms.next_event_id() => return Err(EngineError::StaleState),
                None => {
                    debug!(schedule_id, "potentially duplicate activity task");
                    return Err(EngineError::ActivityTaskNotFound);
                }
                Some(ai) => ai.clone(),
            };
            if ai.started_id.is_some() {
                if ai.request_id == request.request_id {
                    // started within this request scope: positive response
                    response = Some(RecordActivityTaskStartedResponse {
                        activity_id: ai.activity_id.clone(),
                        activity_type: ai.activity_type.clone(),
                        input: ai.input.clone(),
                        scheduled_timestamp_ms: ai.scheduled_time_ms,
                        started_timestamp_ms: ai.started_time_ms,
                        attempt: ai.attempt,
                        heartbeat_details: ai.details.clone(),
                        workflow_type: ms.execution_info.workflow_type.clone(),
                        workflow_domain: domain_name.clone(),
                    });
                    return Ok(Vec::new());
                }
                debug!(schedule_id, "activity task already started by another call");
                return Err(EngineError::EventAlreadyStarted {
                    message: "Activity task already started.".to_string(),
                });
            }
            ms.add_activity_task_started_event(
                schedule_id,
                request.request_id.clone(),
                request.identity.clone(),
            )
            .ok_or_else(|| EngineError::internal("unable to add activity started event"))?;
            let ai = ms
                .get_activity_info(schedule_id)
                .cloned()
                .ok_or_else(|| EngineError::internal("pending activity vanished"))?;
            response = Some(RecordActivityTaskStartedResponse {
                activity_id: ai.activity_id.clone(),
                activity_type: ai.activity_type.clone(),
                input: ai.input.clone(),
                scheduled_timestamp_ms: ai.scheduled_time_ms,
                started_timestamp_ms: ai.started_time_ms,
                attempt: ai.attempt,
                heartbeat_details: ai.details.clone(),
                workflow_type: ms.execution_info.workflow_type.clone(),
                workflow_domain: domain_name.clone(),
            });
            let mut timer_tasks = Vec::new();
            if let Some(task) = tb.get_activity_timer_task_if_needed(ms) {
                timer_tasks.push(task);
            }
            Ok(timer_tasks)
        })
        .await?;

        response.ok_or_else(|| EngineError::internal("activity started response missing"))
    }

    fn resolve_activity_schedule_id(
        token: &crate::TaskToken,
        ms: &MutableState,
    ) -> Result<i64, EngineError> {
        match token.schedule_id {
            Some(id) => Ok(id),
            None => {
                let activity_id = token.activity_id.as_deref().filter(|id| !id.is_empty()).ok_or_else(|| {
                    EngineError::bad_request("Neither ActivityID nor ScheduleID is provided")
                })?;
                ms.get_schedule_id_by_activity_id(activity_id).ok_or_else(|| {
                    EngineError::bad_request(format!("No such activityID: {activity_id}"))
                })
            }
        }
    }

    fn check_activity_responding(
        token: &crate::TaskToken,
        ms: &MutableState,
        schedule_id: i64,
    ) -> Result<crate::state::ActivityInfo, EngineError> {
        let ai = match ms.get_activity_info(schedule_id) {
            None if schedule_id >= ms.next_event_id() => return Err(EngineError::StaleState),
            None => return Err(EngineError::ActivityTaskNotFound),
            Some(ai) => ai.clone(),
        };
        if ai.started_id.is_none()
            || (token.schedule_id.is_some() && token.schedule_attempt != ai.attempt as i64)
        {
            return Err(EngineError::ActivityTaskNotFound);
        }
        Ok(ai)
    }

    pub async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let token = crate::TaskToken::deserialize(&request.task_token)?;
        let execution = WorkflowExecution::new(token.workflow_id.clone(), token.run_id.clone());
        let buffer_cap = self.config.maximum_buffered_events;

        self.update_workflow_execution(&domain_id, &execution, false, true, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let schedule_id = Self::resolve_activity_schedule_id(&token, ms)?;
            let ai = Self::check_activity_responding(&token, ms, schedule_id)?;
            let started_id = ai
                .started_id
                .ok_or(EngineError::ActivityTaskNotFound)?;
            ms.add_activity_task_completed_event(
                schedule_id,
                started_id,
                request.result.clone(),
                request.identity.clone(),
                buffer_cap,
            )?;
            Ok(Vec::new())
        })
        .await
    }

    pub async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let token = crate::TaskToken::deserialize(&request.task_token)?;
        let execution = WorkflowExecution::new(token.workflow_id.clone(), token.run_id.clone());
        let buffer_cap = self.config.maximum_buffered_events;

        self.update_workflow_execution_with_action(&domain_id, &execution, move |ms, tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let schedule_id = Self::resolve_activity_schedule_id(&token, ms)?;
            let ai = Self::check_activity_responding(&token, ms, schedule_id)?;
            let mut post = UpdateWorkflowAction::default();
            if let Some(retry_task) =
                ms.create_activity_retry_timer(schedule_id, &request.reason, tb.now_ms())
            {
                // retry owed: no terminal event, no new decision
                post.timer_tasks.push(retry_task);
            } else {
                let started_id = ai
                    .started_id
                    .ok_or(EngineError::ActivityTaskNotFound)?;
                ms.add_activity_task_failed_event(
                    schedule_id,
                    started_id,
                    request.reason.clone(),
                    request.details.clone(),
                    request.identity.clone(),
                    buffer_cap,
                )?;
                post.create_decision = true;
            }
            Ok(post)
        })
        .await
    }

    pub async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let token = crate::TaskToken::deserialize(&request.task_token)?;
        let execution = WorkflowExecution::new(token.workflow_id.clone(), token.run_id.clone());
        let buffer_cap = self.config.maximum_buffered_events;

        self.update_workflow_execution(&domain_id, &execution, false, true, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let schedule_id = Self::resolve_activity_schedule_id(&token, ms)?;
            let ai = Self::check_activity_responding(&token, ms, schedule_id)?;
            ms.add_activity_task_canceled_event(
                schedule_id,
                ai.started_id,
                ai.cancel_requested_event_id.unwrap_or(0),
                request.details.clone(),
                request.identity.clone(),
                buffer_cap,
            )?;
            Ok(Vec::new())
        })
        .await
    }

    pub async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse, EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let token = crate::TaskToken::deserialize(&request.task_token)?;
        let execution = WorkflowExecution::new(token.workflow_id.clone(), token.run_id.clone());
        let mut cancel_requested = false;

        self.update_workflow_execution(&domain_id, &execution, false, false, |ms, tb| {
            if !ms.is_workflow_running() {
                debug!("heartbeat for completed workflow");
                return Err(EngineError::WorkflowCompleted);
            }
            let schedule_id = Self::resolve_activity_schedule_id(&token, ms)?;
            let ai = Self::check_activity_responding(&token, ms, schedule_id)?;
            cancel_requested = ai.cancel_requested;
            ms.update_activity_progress(schedule_id, request.details.clone(), tb.now_ms());
            Ok(Vec::new())
        })
        .await?;

        Ok(RecordActivityTaskHeartbeatResponse { cancel_requested })
    }

    // ------------------------------------------------------------------
    // Signals / cancel / terminate
    // ------------------------------------------------------------------

    pub async fn signal_workflow_execution(
        &self,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let max_signals = self.config.maximum_signals_per_execution;
        let buffer_cap = self.config.maximum_buffered_events;

        self.update_workflow_execution_with_action(&domain_id, &request.execution, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            // a cron run that has not fired yet must not get a decision early
            let create_decision = !(!ms.execution_info.cron_schedule.is_empty()
                && !ms.has_processed_or_pending_decision_task());
            let post = UpdateWorkflowAction {
                create_decision,
                ..Default::default()
            };
            if max_signals > 0 && ms.execution_info.signal_count >= max_signals as i64 {
                info!(
                    workflow_id = %ms.execution_info.workflow_id,
                    run_id = %ms.execution_info.run_id,
                    signal_count = ms.execution_info.signal_count,
                    "execution limit reached for maximum signals"
                );
                return Err(EngineError::SignalsLimitExceeded);
            }
            if request.child_workflow_only {
                let parent_matches = match (&request.external_execution, &ms.execution_info.parent)
                {
                    (Some(external), Some(parent)) => {
                        external.workflow_id == parent.execution.workflow_id
                            && external.run_id == parent.execution.run_id
                    }
                    _ => false,
                };
                if !parent_matches {
                    return Err(EngineError::WorkflowParentMismatch);
                }
            }
            if !request.request_id.is_empty() {
                if ms.is_signal_requested(&request.request_id) {
                    return Ok(post);
                }
                ms.add_signal_requested(request.request_id.clone());
            }
            ms.add_workflow_execution_signaled(
                request.signal_name.clone(),
                request.input.clone(),
                request.identity.clone(),
                buffer_cap,
            )?;
            Ok(post)
        })
        .await
    }

    pub async fn remove_signal_mutable_state(
        &self,
        request: RemoveSignalMutableStateRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        self.update_workflow_execution(&domain_id, &request.execution, false, false, |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            ms.delete_signal_requested(&request.request_id);
            Ok(Vec::new())
        })
        .await
    }

    pub async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let buffer_cap = self.config.maximum_buffered_events;

        self.update_workflow_execution(&domain_id, &request.execution, false, true, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            if request.child_workflow_only {
                let parent_matches = match (&request.external_execution, &ms.execution_info.parent)
                {
                    (Some(external), Some(parent)) => {
                        external.workflow_id == parent.execution.workflow_id
                            && external.run_id == parent.execution.run_id
                    }
                    _ => false,
                };
                if !parent_matches {
                    return Err(EngineError::WorkflowParentMismatch);
                }
            }
            let (already_requested, existing_request_id) = ms.is_cancel_requested();
            if already_requested {
                if let Some(request_id) = request.request_id.as_deref() {
                    if !request_id.is_empty() && existing_request_id.as_deref() == Some(request_id)
                    {
                        return Ok(Vec::new());
                    }
                }
                return Err(EngineError::CancellationAlreadyRequested);
            }
            ms.add_workflow_execution_cancel_requested_event(
                request.cause.clone(),
                request.identity.clone(),
                request.request_id.clone(),
                request.external_execution.clone(),
                buffer_cap,
            )?;
            Ok(Vec::new())
        })
        .await
    }

    pub async fn terminate_workflow_execution(
        &self,
        request: TerminateWorkflowExecutionRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        self.update_workflow_execution(&domain_id, &request.execution, true, false, |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            ms.add_workflow_execution_terminated_event(
                request.reason.clone(),
                request.details.clone(),
                request.identity.clone(),
            );
            Ok(Vec::new())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Decision scheduling / children
    // ------------------------------------------------------------------

    /// Transfer-queue entry point: schedule a decision when none is
    /// pending. The first decision of a backoff-delayed run re-arms the
    /// backoff timer instead.
    pub async fn schedule_decision_task(
        &self,
        request: ScheduleDecisionTaskRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        self.update_workflow_execution_with_action(&domain_id, &request.execution, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let mut post = UpdateWorkflowAction {
                create_decision: true,
                transfer_tasks: vec![TransferTask::new(TransferTaskKind::RecordWorkflowStarted)],
                ..Default::default()
            };
            let info = &ms.execution_info;
            let execution_timestamp_ms = info.start_timestamp_ms
                + info.first_decision_backoff_seconds as i64 * 1000;
            if request.is_first_decision && execution_timestamp_ms > crate::now_ms() {
                post.timer_tasks.push(TimerTask {
                    version: ms.current_version(),
                    fire_at_ms: execution_timestamp_ms,
                    kind: TimerTaskKind::WorkflowBackoff {
                        backoff: WorkflowBackoffKind::Cron,
                    },
                });
                post.create_decision = false;
            }
            Ok(post)
        })
        .await
    }

    /// Transfer-queue callback: record that the child named by the
    /// initiated event actually started.
    pub async fn record_child_execution_started(
        &self,
        request: RecordChildExecutionStartedRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let buffer_cap = self.config.maximum_buffered_events;
        self.update_workflow_execution(&domain_id, &request.execution, false, true, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let ci = match ms.get_child_execution_info(request.initiated_event_id) {
                None => {
                    return Err(EngineError::entity_not_exists(
                        "Pending child execution not found.",
                    ));
                }
                Some(ci) => ci.clone(),
            };
            if ci.started_event_id.is_some() {
                // duplicate transfer-task delivery
                return Ok(Vec::new());
            }
            ms.add_child_workflow_execution_started_event(
                request.initiated_event_id,
                request.child_domain.clone(),
                request.child_execution.clone(),
                request.child_workflow_type.clone(),
                buffer_cap,
            )?;
            Ok(Vec::new())
        })
        .await
    }

    /// Route a child's terminal event into the parent history.
    pub async fn record_child_execution_completed(
        &self,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<(), EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        let buffer_cap = self.config.maximum_buffered_events;
        self.update_workflow_execution(&domain_id, &request.execution, false, true, move |ms, _tb| {
            if !ms.is_workflow_running() {
                return Err(EngineError::WorkflowCompleted);
            }
            let initiated_event_id = request.initiated_event_id;
            let ci = match ms.get_child_execution_info(initiated_event_id) {
                None => {
                    return Err(EngineError::entity_not_exists(
                        "Pending child execution not found.",
                    ));
                }
                Some(ci) => ci.clone(),
            };
            let started_event_id = ci.started_event_id.ok_or_else(|| {
                EngineError::entity_not_exists("Pending child execution not found.")
            })?;
            let execution = request.completed_execution.clone();
            let attributes = match request.completion.clone() {
                ChildCompletion::Completed { result } => {
                    EventAttributes::ChildWorkflowExecutionCompleted {
                        initiated_event_id,
                        started_event_id,
                        execution,
                        result,
                    }
                }
                ChildCompletion::Failed { reason, details } => {
                    EventAttributes::ChildWorkflowExecutionFailed {
                        initiated_event_id,
                        started_event_id,
                        execution,
                        reason,
                        details,
                    }
                }
                ChildCompletion::Canceled { details } => {
                    EventAttributes::ChildWorkflowExecutionCanceled {
                        initiated_event_id,
                        started_event_id,
                        execution,
                        details,
                    }
                }
                ChildCompletion::Terminated => EventAttributes::ChildWorkflowExecutionTerminated {
                    initiated_event_id,
                    started_event_id,
                    execution,
                },
                ChildCompletion::TimedOut { timeout_kind } => {
                    EventAttributes::ChildWorkflowExecutionTimedOut {
                        initiated_event_id,
                        started_event_id,
                        execution,
                        timeout_kind,
                    }
                }
            };
            ms.add_child_workflow_terminal_event(initiated_event_id, attributes, buffer_cap)?;
            Ok(Vec::new())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Sticky task list
    // ------------------------------------------------------------------

    /// Clear the worker-affinity state so the next decision goes to the
    /// normal task list.
    pub async fn reset_sticky_task_list(
        &self,
        request: ResetStickyTaskListRequest,
    ) -> Result<(), EngineError> {
        validate_domain_uuid(&request.domain_id)?;
        self.update_workflow_execution(
            &request.domain_id,
            &request.execution,
            false,
            false,
            |ms, _tb| {
                if !ms.is_workflow_running() {
                    return Err(EngineError::WorkflowCompleted);
                }
                ms.clear_stickiness();
                Ok(Vec::new())
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    pub async fn reset_workflow_execution(
        &self,
        request: ResetWorkflowExecutionRequest,
    ) -> Result<ResetWorkflowExecutionResponse, EngineError> {
        let domain_entry = self.get_active_domain_entry(&request.domain_id).await?;
        let domain_id = domain_entry.info.id.clone();
        if request.execution.workflow_id.is_empty() || request.execution.run_id.is_empty() {
            return Err(EngineError::bad_request("Require workflowId and runId."));
        }
        if request.decision_finish_event_id <= FIRST_EVENT_ID {
            return Err(EngineError::bad_request("Decision finish ID must be > 1."));
        }

        let mut base_lease = self
            .cache
            .acquire(&domain_id, &request.execution, self.default_deadline())
            .await?;
        let result = self.reset_workflow_locked(&mut base_lease, &domain_id, &request).await;
        base_lease.release(&result);
        result
    }

    async fn reset_workflow_locked(
        &self,
        base_lease: &mut ExecutionLease,
        domain_id: &str,
        request: &ResetWorkflowExecutionRequest,
    ) -> Result<ResetWorkflowExecutionResponse, EngineError> {
        let base_state = base_lease.load().await?.clone();
        let current = self
            .execution_store
            .get_current_execution(domain_id, &request.execution.workflow_id)
            .await?;

        if current.run_id == request.execution.run_id {
            if base_state.execution_info.create_request_id == request.request_id {
                info!(
                    workflow_id = %request.execution.workflow_id,
                    run_id = %current.run_id,
                    "duplicated reset request"
                );
                return Ok(ResetWorkflowExecutionResponse {
                    run_id: current.run_id,
                });
            }
            let resetor = self
                .resetor
                .as_ref()
                .ok_or_else(|| EngineError::internal("workflow resetor not configured"))?;
            return resetor
                .reset_workflow_execution(request, base_state.clone(), base_state)
                .await;
        }

        let current_execution =
            WorkflowExecution::new(request.execution.workflow_id.clone(), current.run_id.clone());
        let mut current_lease = self
            .cache
            .acquire(domain_id, &current_execution, self.default_deadline())
            .await?;
        let result = async {
            let current_state = current_lease.load().await?.clone();
            if current_state.execution_info.create_request_id == request.request_id {
                return Ok(ResetWorkflowExecutionResponse {
                    run_id: current.run_id.clone(),
                });
            }
            let resetor = self
                .resetor
                .as_ref()
                .ok_or_else(|| EngineError::internal("workflow resetor not configured"))?;
            resetor
                .reset_workflow_execution(request, base_state.clone(), current_state)
                .await
        }
        .await;
        current_lease.release(&result);
        result
    }

    // ------------------------------------------------------------------
    // Retention / replication plumbing
    // ------------------------------------------------------------------

    /// Retention-timer callback: remove the closed run from visibility and
    /// hand it to archival when the domain opts in.
    pub async fn delete_execution_from_visibility(
        &self,
        task: &RetentionTask,
    ) -> Result<(), EngineError> {
        self.visibility_store
            .delete_workflow_execution(&task.domain_id, &task.workflow_id, &task.run_id, task.task_id)
            .await?;
        let archival_enabled = match self.domain_cache.get_domain_by_id(&task.domain_id).await {
            Ok(entry) => entry.config.archival_enabled,
            Err(_) => false,
        };
        if archival_enabled {
            if let Some(archival_client) = self.archival_client.as_ref() {
                if let Err(e) = archival_client
                    .archive(ArchiveRequest {
                        domain_id: task.domain_id.clone(),
                        workflow_id: task.workflow_id.clone(),
                        run_id: task.run_id.clone(),
                    })
                    .await
                {
                    warn!(
                        workflow_id = %task.workflow_id,
                        run_id = %task.run_id,
                        error = %e,
                        "archival hand-off failed"
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn replicate_events(&self, request: ReplicateEventsRequest) -> Result<(), EngineError> {
        self.replicator()?.apply_events(request).await
    }

    pub async fn replicate_raw_events(
        &self,
        request: ReplicateRawEventsRequest,
    ) -> Result<(), EngineError> {
        self.replicator()?.apply_raw_events(request).await
    }

    pub async fn sync_activity(&self, request: SyncActivityRequest) -> Result<(), EngineError> {
        self.replicator()?.sync_activity(request).await
    }

    fn replicator(&self) -> Result<&Arc<dyn Replicator>, EngineError> {
        self.replicator
            .as_ref()
            .ok_or_else(|| EngineError::internal("replication is not enabled on this engine"))
    }

    /// Remote shard heartbeat: advance the peer cluster's clock view and
    /// poke both processors (the timer gate in the standby timer processor
    /// cares; the transfer poke keeps the flow symmetric).
    pub async fn sync_shard_status(&self, request: SyncShardStatusRequest) -> Result<(), EngineError> {
        self.shard
            .set_current_time_ms(&request.source_cluster, request.timestamp_ms);
        self.transfer_processor.notify_new_task(&request.source_cluster, &[]);
        self.timer_processor
            .notify_new_timers(&request.source_cluster, request.timestamp_ms, &[]);
        Ok(())
    }
}

enum SignalWithStartOutcome {
    Signaled(String),
    StartNew(Option<PrevRunInfo>),
}

/// What the create path needs to know about a closed previous run.
#[derive(Debug, Clone)]
struct PrevRunInfo {
    run_id: String,
    state: WorkflowState,
    close_status: WorkflowCloseStatus,
    last_write_version: i64,
    start_request_id: String,
}

impl PrevRunInfo {
    fn from_state(ms: &MutableState) -> Self {
        PrevRunInfo {
            run_id: ms.execution_info.run_id.clone(),
            state: ms.execution_info.state,
            close_status: ms.execution_info.close_status,
            last_write_version: ms.last_write_version(),
            start_request_id: ms.execution_info.create_request_id.clone(),
        }
    }
}

fn start_params_from(request: &StartWorkflowExecutionRequest) -> WorkflowStartParams {
    WorkflowStartParams {
        workflow_type: request.workflow_type.clone(),
        task_list: request.task_list.clone(),
        input: request.input.clone(),
        execution_timeout_seconds: request.execution_timeout_seconds,
        decision_timeout_seconds: request.decision_timeout_seconds,
        identity: request.identity.clone(),
        request_id: request.request_id.clone(),
        parent: request.parent.clone(),
        retry_policy: request.retry_policy.clone(),
        cron_schedule: request.cron_schedule.clone(),
        first_decision_backoff_seconds: request.first_decision_backoff_seconds,
        ..Default::default()
    }
}

pub(crate) fn validate_domain_uuid(domain_id: &str) -> Result<(), EngineError> {
    if domain_id.is_empty() {
        return Err(EngineError::bad_request("Missing domain UUID."));
    }
    Uuid::parse_str(domain_id)
        .map(|_| ())
        .map_err(|_| EngineError::bad_request("Invalid domain UUID."))
}

fn validate_start_workflow_request(
    request: &StartWorkflowExecutionRequest,
    max_id_length: usize,
) -> Result<(), EngineError> {
    if request.request_id.is_empty() {
        return Err(EngineError::bad_request("Missing request ID."));
    }
    if request.workflow_id.is_empty() {
        return Err(EngineError::bad_request("Missing WorkflowId."));
    }
    if request.execution_timeout_seconds <= 0 {
        return Err(EngineError::bad_request(
            "Missing or invalid ExecutionStartToCloseTimeoutSeconds.",
        ));
    }
    if request.decision_timeout_seconds <= 0 {
        return Err(EngineError::bad_request(
            "Missing or invalid TaskStartToCloseTimeoutSeconds.",
        ));
    }
    if request.task_list.is_empty() {
        return Err(EngineError::bad_request("Missing Tasklist."));
    }
    if request.workflow_type.is_empty() {
        return Err(EngineError::bad_request("Missing WorkflowType."));
    }
    if request.workflow_id.len() > max_id_length {
        return Err(EngineError::bad_request("WorkflowId exceeds length limit."));
    }
    if request.task_list.len() > max_id_length {
        return Err(EngineError::bad_request("TaskList exceeds length limit."));
    }
    if request.workflow_type.len() > max_id_length {
        return Err(EngineError::bad_request("WorkflowType exceeds length limit."));
    }
    crate::cron::validate_schedule(&request.cron_schedule)?;
    crate::validate_retry_policy(request.retry_policy.as_ref())
}

/// Gate a start against the closed previous run per the workflow-ID reuse
/// policy.
fn apply_workflow_id_reuse_policy(
    prev_start_request_id: &str,
    prev_run_id: &str,
    prev_state: WorkflowState,
    prev_close_status: WorkflowCloseStatus,
    workflow_id: &str,
    policy: WorkflowIdReusePolicy,
) -> Result<(), EngineError> {
    use crate::error::WorkflowExecutionAlreadyStartedDetails;

    let already_started = |message: String| {
        EngineError::WorkflowExecutionAlreadyStarted(Box::new(
            WorkflowExecutionAlreadyStartedDetails {
                message,
                start_request_id: prev_start_request_id.to_string(),
                run_id: prev_run_id.to_string(),
                state: prev_state,
                close_status: prev_close_status,
                last_write_version: crate::EMPTY_VERSION,
            },
        ))
    };

    if prev_state != WorkflowState::Completed {
        return Err(already_started(format!(
            "Workflow execution is already running. WorkflowId: {workflow_id}, RunId: {prev_run_id}."
        )));
    }
    match policy {
        WorkflowIdReusePolicy::AllowDuplicate => Ok(()),
        WorkflowIdReusePolicy::AllowDuplicateFailedOnly => {
            if prev_close_status.is_failed_close() {
                Ok(())
            } else {
                Err(already_started(format!(
                    "Workflow execution already finished successfully. WorkflowId: {workflow_id}, \
                     RunId: {prev_run_id}. Workflow ID reuse policy: allow duplicate workflow ID \
                     if last run failed."
                )))
            }
        }
        WorkflowIdReusePolicy::RejectDuplicate => Err(already_started(format!(
            "Workflow execution already finished. WorkflowId: {workflow_id}, RunId: {prev_run_id}. \
             Workflow ID reuse policy: reject duplicate workflow ID."
        ))),
    }
}
