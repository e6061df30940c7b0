//! Execution cache: per-execution exclusive leases over cached mutable
//! state.
//!
//! Concurrency within one execution is serialized by the lease; concurrency
//! across executions is unbounded up to the cache capacity. An entry that is
//! leased (or waited on) is pinned and never evicted; idle entries are
//! evicted least-recently-used, which merely drops the cached state - the
//! identity is re-materializable from persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::DomainCache;
use crate::error::EngineError;
use crate::notifier::HistoryEventNotification;
use crate::shard::{
    AppendHistoryEventsRequest, CreateWorkflowExecutionRequest, CreateWorkflowMode, ExecutionStore,
    HistoryStore, ShardContext, UpdateWorkflowExecutionRequest,
};
use crate::state::{ContinueAsNewSuccessor, MutableState};
use crate::{
    stamp_task_info, ReplicationTask, TimerTask, TransferTask, WorkflowExecution,
    WorkflowIdentifier,
};

/// One cached execution: the lease mutex plus eviction bookkeeping.
pub struct ExecutionContext {
    identifier: WorkflowIdentifier,
    state: Arc<AsyncMutex<Option<MutableState>>>,
    pins: AtomicUsize,
    last_access: StdMutex<Instant>,
}

impl ExecutionContext {
    fn new(identifier: WorkflowIdentifier) -> Self {
        ExecutionContext {
            identifier,
            state: Arc::new(AsyncMutex::new(None)),
            pins: AtomicUsize::new(0),
            last_access: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_access.lock() {
            *at = Instant::now();
        }
    }
}

/// Bounded keyed cache of [`ExecutionContext`]s.
pub struct ExecutionCache {
    entries: StdMutex<HashMap<WorkflowIdentifier, Arc<ExecutionContext>>>,
    capacity: usize,
    shard: Arc<dyn ShardContext>,
    history_store: Arc<dyn HistoryStore>,
    execution_store: Arc<dyn ExecutionStore>,
    domain_cache: Arc<dyn DomainCache>,
    current_cluster_name: String,
}

impl ExecutionCache {
    pub fn new(
        capacity: usize,
        shard: Arc<dyn ShardContext>,
        history_store: Arc<dyn HistoryStore>,
        execution_store: Arc<dyn ExecutionStore>,
        domain_cache: Arc<dyn DomainCache>,
        current_cluster_name: impl Into<String>,
    ) -> Self {
        ExecutionCache {
            entries: StdMutex::new(HashMap::new()),
            capacity,
            shard,
            history_store,
            execution_store,
            domain_cache,
            current_cluster_name: current_cluster_name.into(),
        }
    }

    /// Acquire the exclusive lease for an execution, resolving an empty run
    /// ID to the current run. Fails with [`EngineError::Timeout`] when the
    /// lease is not granted by `deadline`.
    pub async fn acquire(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        deadline: Instant,
    ) -> Result<ExecutionLease, EngineError> {
        let run_id = if execution.run_id.is_empty() {
            self.execution_store
                .get_current_execution(domain_id, &execution.workflow_id)
                .await?
                .run_id
        } else {
            execution.run_id.clone()
        };
        let identifier = WorkflowIdentifier::new(domain_id, execution.workflow_id.clone(), run_id);

        let context = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| EngineError::internal("execution cache lock poisoned"))?;
            let context = entries
                .entry(identifier.clone())
                .or_insert_with(|| Arc::new(ExecutionContext::new(identifier.clone())))
                .clone();
            // pin before leaving the map lock so eviction cannot race us
            context.pins.fetch_add(1, Ordering::SeqCst);
            if entries.len() > self.capacity {
                Self::evict_one(&mut entries);
            }
            context
        };

        let guard = match tokio::time::timeout_at(deadline, context.state.clone().lock_owned()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                context.pins.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Timeout);
            }
        };
        context.touch();
        Ok(ExecutionLease {
            context,
            guard,
            shard: self.shard.clone(),
            history_store: self.history_store.clone(),
            domain_cache: self.domain_cache.clone(),
            current_cluster_name: self.current_cluster_name.clone(),
            released: false,
        })
    }

    /// Diagnostic dual view: the cached state (if any, and not leased) and
    /// a fresh load from persistence that bypasses the cache.
    pub async fn get_and_create(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<(Option<MutableState>, MutableState), EngineError> {
        let identifier = WorkflowIdentifier::new(
            domain_id,
            execution.workflow_id.clone(),
            execution.run_id.clone(),
        );
        let cached = {
            let entries = self
                .entries
                .lock()
                .map_err(|_| EngineError::internal("execution cache lock poisoned"))?;
            entries.get(&identifier).and_then(|context| {
                context
                    .state
                    .try_lock()
                    .ok()
                    .and_then(|guard| guard.clone())
            })
        };
        let fresh = self.shard.get_workflow_execution(domain_id, execution).await?;
        Ok((cached, fresh))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_one(entries: &mut HashMap<WorkflowIdentifier, Arc<ExecutionContext>>) {
        let candidate = entries
            .iter()
            .filter(|(_, c)| c.pins.load(Ordering::SeqCst) == 0)
            .min_by_key(|(_, c)| {
                c.last_access
                    .lock()
                    .map(|at| *at)
                    .unwrap_or_else(|_| Instant::now())
            })
            .map(|(k, _)| k.clone());
        if let Some(key) = candidate {
            debug!(workflow_id = %key.workflow_id, run_id = %key.run_id, "evicting idle execution from cache");
            entries.remove(&key);
        }
    }
}

/// Exclusive access to one execution's mutable state, held from acquire to
/// release. Dropping without an explicit release conservatively invalidates
/// the cached state so the next acquire reloads from persistence.
pub struct ExecutionLease {
    context: Arc<ExecutionContext>,
    guard: OwnedMutexGuard<Option<MutableState>>,
    shard: Arc<dyn ShardContext>,
    history_store: Arc<dyn HistoryStore>,
    domain_cache: Arc<dyn DomainCache>,
    current_cluster_name: String,
    released: bool,
}

impl ExecutionLease {
    pub fn identifier(&self) -> &WorkflowIdentifier {
        &self.context.identifier
    }

    pub fn execution(&self) -> WorkflowExecution {
        self.context.identifier.execution()
    }

    /// Load the mutable state, hitting persistence when the cache is cold.
    /// For global domains the write version is refreshed from the domain's
    /// failover version.
    pub async fn load(&mut self) -> Result<&mut MutableState, EngineError> {
        if self.guard.is_none() {
            let identifier = self.context.identifier.clone();
            let mut state = self
                .shard
                .get_workflow_execution(&identifier.domain_id, &identifier.execution())
                .await?;
            state.set_condition(state.next_event_id());
            if state.replication_state.is_some() {
                let domain_entry = self.domain_cache.get_domain_by_id(&identifier.domain_id).await?;
                state.update_replication_version(domain_entry.failover_version);
            }
            *self.guard = Some(state);
        }
        self.guard
            .as_mut()
            .ok_or_else(|| EngineError::internal("mutable state missing after load"))
    }

    pub fn state_mut(&mut self) -> Option<&mut MutableState> {
        self.guard.as_mut()
    }

    pub fn state(&self) -> Option<&MutableState> {
        self.guard.as_ref()
    }

    /// Drop the cached state; the next [`Self::load`] reloads from
    /// persistence.
    pub fn clear(&mut self) {
        *self.guard = None;
    }

    /// Persist the mutation cycle: flush and drain events, append them to
    /// the history store, then write the state snapshot plus tasks
    /// conditionally on the loaded condition. On [`EngineError::Conflict`]
    /// the cached state is dropped so the retry reloads.
    pub async fn update_workflow_execution(
        &mut self,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), EngineError> {
        self.persist_update(&mut transfer_tasks, &mut timer_tasks, transaction_id, None)
            .await
    }

    /// Persist the closing batch of this run together with its
    /// continue-as-new successor.
    pub async fn continue_as_new_workflow_execution(
        &mut self,
        successor: ContinueAsNewSuccessor,
        mut transfer_tasks: Vec<TransferTask>,
        mut timer_tasks: Vec<TimerTask>,
        transaction_id: i64,
    ) -> Result<(), EngineError> {
        self.persist_update(
            &mut transfer_tasks,
            &mut timer_tasks,
            transaction_id,
            Some(successor),
        )
        .await
    }

    async fn persist_update(
        &mut self,
        transfer_tasks: &mut Vec<TransferTask>,
        timer_tasks: &mut Vec<TimerTask>,
        transaction_id: i64,
        successor: Option<ContinueAsNewSuccessor>,
    ) -> Result<(), EngineError> {
        let identifier = self.context.identifier.clone();
        let replicate = match self.domain_cache.get_domain_by_id(&identifier.domain_id).await {
            Ok(entry) => entry.can_replicate_event(),
            Err(EngineError::EntityNotExists { .. }) => false,
            Err(e) => return Err(e),
        };
        let now_ms = self.shard.current_time_ms(&self.current_cluster_name);

        let state = self
            .guard
            .as_mut()
            .ok_or_else(|| EngineError::internal("update without loaded mutable state"))?;
        let version = state.current_version();
        stamp_task_info(version, now_ms, transfer_tasks, timer_tasks);
        let batch = state.close_transaction(&self.current_cluster_name)?;
        let condition = state.condition();
        let has_events = !batch.events.is_empty();
        if has_events {
            self.history_store
                .append_history_events(AppendHistoryEventsRequest {
                    domain_id: identifier.domain_id.clone(),
                    execution: identifier.execution(),
                    first_event_id: batch.first_event_id,
                    events: batch.events,
                    transaction_id,
                })
                .await?;
        }
        let mut replication_tasks = Vec::new();
        if replicate && has_events {
            replication_tasks.push(ReplicationTask {
                first_event_id: batch.first_event_id,
                next_event_id: state.next_event_id(),
                version,
            });
        }

        let continue_as_new = match successor {
            Some(mut successor) => Some(Box::new(
                self.build_successor_create(&identifier.domain_id, &mut successor, transaction_id, replicate)
                    .await?,
            )),
            None => None,
        };

        let state = self
            .guard
            .as_mut()
            .ok_or_else(|| EngineError::internal("update without loaded mutable state"))?;
        let snapshot = state.clone();
        let request = UpdateWorkflowExecutionRequest {
            domain_id: identifier.domain_id.clone(),
            execution: identifier.execution(),
            snapshot,
            condition,
            transaction_id,
            transfer_tasks: std::mem::take(transfer_tasks),
            timer_tasks: std::mem::take(timer_tasks),
            replication_tasks,
            continue_as_new,
        };
        match self.shard.update_workflow_execution(request).await {
            Ok(()) => {
                let state = self
                    .guard
                    .as_mut()
                    .ok_or_else(|| EngineError::internal("mutable state missing after update"))?;
                state.set_condition(state.next_event_id());
                if has_events {
                    self.shard.notify_new_history_event(&HistoryEventNotification {
                        identifier: identifier.clone(),
                        last_first_event_id: state.last_first_event_id(),
                        next_event_id: state.next_event_id(),
                        previous_started_event_id: state.previous_started_event_id(),
                        is_workflow_running: state.is_workflow_running(),
                        timestamp_ms: now_ms,
                    });
                }
                Ok(())
            }
            Err(e) => {
                if e == EngineError::Conflict {
                    warn!(
                        workflow_id = %identifier.workflow_id,
                        run_id = %identifier.run_id,
                        "conditional update failed, dropping cached state"
                    );
                }
                // any failed write leaves the cached state suspect
                self.clear();
                Err(e)
            }
        }
    }

    async fn build_successor_create(
        &self,
        domain_id: &str,
        successor: &mut ContinueAsNewSuccessor,
        transaction_id: i64,
        replicate: bool,
    ) -> Result<CreateWorkflowExecutionRequest, EngineError> {
        let now_ms = self.shard.current_time_ms(&self.current_cluster_name);
        let version = successor.state.current_version();
        stamp_task_info(
            version,
            now_ms,
            &mut successor.transfer_tasks,
            &mut successor.timer_tasks,
        );
        let batch = successor.state.close_transaction(&self.current_cluster_name)?;
        let new_execution = WorkflowExecution::new(
            successor.state.execution_info.workflow_id.clone(),
            successor.state.execution_info.run_id.clone(),
        );
        self.history_store
            .append_history_events(AppendHistoryEventsRequest {
                domain_id: domain_id.to_string(),
                execution: new_execution.clone(),
                first_event_id: batch.first_event_id,
                events: batch.events,
                transaction_id,
            })
            .await?;
        let mut replication_tasks = Vec::new();
        if replicate {
            replication_tasks.push(ReplicationTask {
                first_event_id: batch.first_event_id,
                next_event_id: successor.state.next_event_id(),
                version,
            });
        }
        Ok(CreateWorkflowExecutionRequest {
            domain_id: domain_id.to_string(),
            execution: new_execution,
            snapshot: successor.state.clone(),
            mode: CreateWorkflowMode::ContinueAsNew {
                prev_run_id: self.context.identifier.run_id.clone(),
            },
            transaction_id,
            transfer_tasks: std::mem::take(&mut successor.transfer_tasks),
            timer_tasks: std::mem::take(&mut successor.timer_tasks),
            replication_tasks,
        })
    }

    /// Return the lease. A failed operation invalidates the cached state so
    /// the next acquire reloads from persistence.
    pub fn release<T>(mut self, result: &Result<T, EngineError>) {
        if result.is_err() {
            *self.guard = None;
        }
        self.released = true;
        // Drop runs next and unpins.
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        if !self.released {
            // dropped on a panic or early return: do not trust the cache
            *self.guard = None;
        }
        self.context.touch();
        self.context.pins.fetch_sub(1, Ordering::SeqCst);
    }
}
