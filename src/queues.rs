//! Queue processor seams.
//!
//! The transfer and timer queue processors drain persisted tasks from the
//! shard; they live outside this crate. The engine needs three things from
//! them: lifecycle, best-effort notification of newly persisted tasks, and
//! the failover interlock - the domain-change callback takes the write side
//! of the task-processing lock so no task dispatch proceeds while failover
//! levels are recomputed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::{TimerTask, TransferTask};

#[async_trait]
pub trait TransferQueueProcessor: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Take the exclusive task-processing lock; held through
    /// [`Self::unlock_task_processing`].
    async fn lock_task_processing(&self);
    fn unlock_task_processing(&self);
    /// Recompute dispatch levels for domains failing over to this cluster.
    fn failover_domain(&self, domain_ids: &HashSet<String>);
    /// Best-effort hint that tasks were just persisted; processors also
    /// scan the store on a timer, so a lost notification delays work but
    /// never loses it.
    fn notify_new_task(&self, cluster_name: &str, tasks: &[TransferTask]);
}

#[async_trait]
pub trait TimerQueueProcessor: Send + Sync {
    fn start(&self);
    fn stop(&self);
    async fn lock_task_processing(&self);
    fn unlock_task_processing(&self);
    fn failover_domain(&self, domain_ids: &HashSet<String>);
    fn notify_new_timers(&self, cluster_name: &str, current_time_ms: i64, tasks: &[TimerTask]);
}

/// Replication task drain; notified whenever a write carries replication
/// tasks.
pub trait ReplicatorQueueProcessor: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn notify_new_task(&self);
}

/// Reader-writer interlock between task dispatch and domain failover.
///
/// Dispatch loops take a read lease per task; the failover callback takes
/// the write side briefly. The write guard is stored so the paired
/// lock/unlock calls can live on opposite sides of an async boundary.
pub struct TaskProcessingLock {
    lock: Arc<RwLock<()>>,
    held: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl Default for TaskProcessingLock {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskProcessingLock {
    pub fn new() -> Self {
        TaskProcessingLock {
            lock: Arc::new(RwLock::new(())),
            held: Mutex::new(None),
        }
    }

    /// Write side: blocks until all read leases are returned.
    pub async fn lock(&self) {
        let guard = self.lock.clone().write_owned().await;
        if let Ok(mut held) = self.held.lock() {
            *held = Some(guard);
        }
    }

    pub fn unlock(&self) {
        if let Ok(mut held) = self.held.lock() {
            held.take();
        }
    }

    /// Read side: one lease per dispatched task.
    pub async fn read_lease(&self) -> OwnedRwLockReadGuard<()> {
        self.lock.clone().read_owned().await
    }

    pub fn is_write_locked(&self) -> bool {
        self.held.lock().map(|h| h.is_some()).unwrap_or(false)
    }
}
