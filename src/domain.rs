//! Domain cache and cluster metadata.
//!
//! Domains are the multi-tenancy and replication unit: each global domain
//! has an active cluster, a failover version and a notification version that
//! advances on every metadata change. The engine registers a change callback
//! to coordinate failover with the queue processors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::EngineError;
use crate::EMPTY_VERSION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainConfiguration {
    pub retention_days: i32,
    /// Binary checksums marked as bad deployments; decisions reporting one
    /// are failed outright.
    pub bad_binaries: HashSet<String>,
    pub archival_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainReplicationConfig {
    pub active_cluster_name: String,
    pub clusters: Vec<String>,
}

/// One immutable snapshot of a domain's metadata. The cache hands out
/// shared snapshots and replaces them wholesale on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainCacheEntry {
    pub info: DomainInfo,
    pub config: DomainConfiguration,
    pub replication_config: DomainReplicationConfig,
    pub is_global: bool,
    pub failover_version: i64,
    pub failover_notification_version: i64,
    pub notification_version: i64,
}

impl DomainCacheEntry {
    /// A local-only domain: no replication state, empty-version writes.
    pub fn local(id: impl Into<String>, name: impl Into<String>, cluster: impl Into<String>) -> Self {
        DomainCacheEntry {
            info: DomainInfo {
                id: id.into(),
                name: name.into(),
            },
            config: DomainConfiguration::default(),
            replication_config: DomainReplicationConfig {
                active_cluster_name: cluster.into(),
                clusters: Vec::new(),
            },
            is_global: false,
            failover_version: EMPTY_VERSION,
            failover_notification_version: 0,
            notification_version: 0,
        }
    }

    pub fn is_active_in(&self, cluster_name: &str) -> bool {
        !self.is_global || self.replication_config.active_cluster_name == cluster_name
    }

    /// Whether writes in this domain produce replication tasks.
    pub fn can_replicate_event(&self) -> bool {
        self.is_global && self.replication_config.clusters.len() > 1
    }

    pub fn retention_days(&self, _workflow_id: &str) -> i32 {
        self.config.retention_days
    }

    /// Error to return when an active-cluster-only operation arrives while
    /// this cluster is standby.
    pub fn domain_not_active_error(&self, current_cluster: &str) -> Option<EngineError> {
        if self.is_active_in(current_cluster) {
            return None;
        }
        Some(EngineError::DomainNotActive {
            domain_name: self.info.name.clone(),
            current_cluster: current_cluster.to_string(),
            active_cluster: self.replication_config.active_cluster_name.clone(),
        })
    }
}

/// Invoked before domain changes become visible; the engine uses it to take
/// the task-processing locks.
pub type DomainChangePrepareFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with the changed domains, sorted by notification version.
pub type DomainChangeCallbackFn =
    Box<dyn Fn(Vec<Arc<DomainCacheEntry>>) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait DomainCache: Send + Sync {
    async fn get_domain_by_id(&self, domain_id: &str) -> Result<Arc<DomainCacheEntry>, EngineError>;
    async fn get_domain(&self, name: &str) -> Result<Arc<DomainCacheEntry>, EngineError>;
    fn register_domain_change_callback(
        &self,
        shard_id: i32,
        initial_notification_version: i64,
        prepare: DomainChangePrepareFn,
        callback: DomainChangeCallbackFn,
    );
    fn unregister_domain_change_callback(&self, shard_id: i32);
}

type CallbackPair = (DomainChangePrepareFn, DomainChangeCallbackFn);

/// In-memory domain cache: the registry for embedded runs and tests, with
/// explicit refresh to drive change callbacks.
#[derive(Default)]
pub struct InMemoryDomainCache {
    by_id: Mutex<HashMap<String, Arc<DomainCacheEntry>>>,
    by_name: Mutex<HashMap<String, String>>,
    callbacks: Mutex<HashMap<i32, CallbackPair>>,
}

impl InMemoryDomainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a domain without firing change callbacks.
    pub fn put_domain(&self, entry: DomainCacheEntry) {
        let entry = Arc::new(entry);
        if let Ok(mut by_name) = self.by_name.lock() {
            by_name.insert(entry.info.name.clone(), entry.info.id.clone());
        }
        if let Ok(mut by_id) = self.by_id.lock() {
            by_id.insert(entry.info.id.clone(), entry);
        }
    }

    /// Apply a batch of domain changes and drive registered callbacks the
    /// way a metadata refresh does: prepare on every registration, then the
    /// change callback with entries sorted by notification version.
    pub async fn refresh_domains(&self, entries: Vec<DomainCacheEntry>) {
        let mut next: Vec<Arc<DomainCacheEntry>> = entries.into_iter().map(Arc::new).collect();
        next.sort_by_key(|e| e.notification_version);
        for entry in &next {
            if let Ok(mut by_name) = self.by_name.lock() {
                by_name.insert(entry.info.name.clone(), entry.info.id.clone());
            }
            if let Ok(mut by_id) = self.by_id.lock() {
                by_id.insert(entry.info.id.clone(), entry.clone());
            }
        }
        // collect under the lock, await outside it
        let registrations: Vec<i32> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.keys().copied().collect(),
            Err(_) => return,
        };
        for shard_id in registrations {
            let prepare_fut = match self.callbacks.lock() {
                Ok(callbacks) => callbacks.get(&shard_id).map(|(prepare, _)| prepare()),
                Err(_) => None,
            };
            if let Some(fut) = prepare_fut {
                fut.await;
            }
            let callback_fut = match self.callbacks.lock() {
                Ok(callbacks) => callbacks
                    .get(&shard_id)
                    .map(|(_, callback)| callback(next.clone())),
                Err(_) => None,
            };
            if let Some(fut) = callback_fut {
                fut.await;
            }
            debug!(shard_id, domains = next.len(), "domain change callback delivered");
        }
    }
}

#[async_trait]
impl DomainCache for InMemoryDomainCache {
    async fn get_domain_by_id(&self, domain_id: &str) -> Result<Arc<DomainCacheEntry>, EngineError> {
        self.by_id
            .lock()
            .map_err(|_| EngineError::internal("domain cache lock poisoned"))?
            .get(domain_id)
            .cloned()
            .ok_or_else(|| EngineError::entity_not_exists(format!("domain {domain_id} not found")))
    }

    async fn get_domain(&self, name: &str) -> Result<Arc<DomainCacheEntry>, EngineError> {
        let id = self
            .by_name
            .lock()
            .map_err(|_| EngineError::internal("domain cache lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::entity_not_exists(format!("domain {name} not found")))?;
        self.get_domain_by_id(&id).await
    }

    fn register_domain_change_callback(
        &self,
        shard_id: i32,
        _initial_notification_version: i64,
        prepare: DomainChangePrepareFn,
        callback: DomainChangeCallbackFn,
    ) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(shard_id, (prepare, callback));
        }
    }

    fn unregister_domain_change_callback(&self, shard_id: i32) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.remove(&shard_id);
        }
    }
}

// ============================================================================
// Cluster metadata
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub initial_failover_version: i64,
}

/// Static description of the cluster topology this engine runs in. Failover
/// versions map back to the owning cluster modulo the increment.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    pub current_cluster_name: String,
    pub enable_global_domain: bool,
    pub failover_version_increment: i64,
    pub clusters: Vec<ClusterInfo>,
}

impl ClusterMetadata {
    pub fn single_cluster(name: impl Into<String>) -> Self {
        let name = name.into();
        ClusterMetadata {
            current_cluster_name: name.clone(),
            enable_global_domain: false,
            failover_version_increment: 10,
            clusters: vec![ClusterInfo {
                name,
                initial_failover_version: 0,
            }],
        }
    }

    pub fn current_cluster_name(&self) -> &str {
        &self.current_cluster_name
    }

    pub fn is_global_domain_enabled(&self) -> bool {
        self.enable_global_domain
    }

    /// The cluster that owns a failover version.
    pub fn cluster_name_for_failover_version(&self, version: i64) -> String {
        if version == EMPTY_VERSION || self.failover_version_increment <= 0 {
            return self.current_cluster_name.clone();
        }
        let initial = version % self.failover_version_increment;
        self.clusters
            .iter()
            .find(|c| c.initial_failover_version == initial)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| self.current_cluster_name.clone())
    }
}
