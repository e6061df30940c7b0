//! Engine error taxonomy.
//!
//! One enum covers the whole surface: validation failures, not-found
//! conditions, idempotency signals, the internal OCC control-flow errors
//! (`Conflict`, `StaleState`), limits, cross-cluster routing and
//! persistence-level failures. `Conflict` and `StaleState` are recovered
//! locally by the update loop and never reach a caller; everything else is
//! surfaced verbatim.

use crate::{WorkflowCloseStatus, WorkflowState};

/// Previous-run information carried by
/// [`EngineError::WorkflowExecutionAlreadyStarted`]. The create path uses it
/// to decide between idempotent success, `DomainNotActive` and the
/// workflow-ID reuse policy.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowExecutionAlreadyStartedDetails {
    pub message: String,
    pub start_request_id: String,
    pub run_id: String,
    pub state: WorkflowState,
    pub close_status: WorkflowCloseStatus,
    pub last_write_version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Validation failure; not retried, surfaced verbatim.
    BadRequest { message: String },

    /// Task token could not be deserialized.
    DeserializingToken,

    /// Generic entity-not-found, final for the caller.
    EntityNotExists { message: String },

    /// The target execution already completed.
    WorkflowCompleted,

    /// Activity task is not pending (duplicate or already completed).
    ActivityTaskNotFound,

    /// Parent execution given on the request does not match the record.
    WorkflowParentMismatch,

    /// Create hit an existing current run for the workflow ID. Whether this
    /// is success is decided by request-ID idempotency and the reuse policy.
    WorkflowExecutionAlreadyStarted(Box<WorkflowExecutionAlreadyStartedDetails>),

    /// A task start was recorded by a different request already.
    EventAlreadyStarted { message: String },

    /// Cancellation was already requested for the target execution.
    CancellationAlreadyRequested,

    /// OCC condition mismatch. Internal: the update loop clears the cached
    /// state and retries.
    Conflict,

    /// Cached mutable state is behind persistence. Internal: forces a cache
    /// clear and reload without touching persistence.
    StaleState,

    /// The OCC loop exhausted its retry budget.
    MaxAttemptsExceeded,

    /// Per-execution signal cap reached.
    SignalsLimitExceeded,

    /// Per-execution buffered-event cap reached.
    BufferedEventsLimitExceeded,

    /// The domain is active in another cluster; the caller must retry there.
    DomainNotActive {
        domain_name: String,
        current_cluster: String,
        active_cluster: String,
    },

    /// Persistence timed out. On the create path this is treated as success
    /// for idempotency purposes.
    ShardOperationTimeout,

    /// Lease acquisition or long-poll wait exceeded the caller's deadline.
    Timeout,

    /// The write was rejected for size; forces workflow termination with
    /// reason [`crate::FAILURE_REASON_TRANSACTION_SIZE_EXCEEDS_LIMIT`].
    TransactionSizeLimit { message: String },

    /// Catch-all; safe for the client to retry.
    Internal { message: String },
}

impl EngineError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        EngineError::BadRequest {
            message: message.into(),
        }
    }

    pub fn entity_not_exists(message: impl Into<String>) -> Self {
        EngineError::EntityNotExists {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller may safely retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict
                | EngineError::StaleState
                | EngineError::ShardOperationTimeout
                | EngineError::Timeout
                | EngineError::Internal { .. }
        )
    }

    /// Errors the OCC update loop recovers from without surfacing.
    pub(crate) fn is_recoverable_in_update_loop(&self) -> bool {
        matches!(self, EngineError::Conflict | EngineError::StaleState)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::BadRequest { message } => write!(f, "bad request: {message}"),
            EngineError::DeserializingToken => write!(f, "error deserializing task token"),
            EngineError::EntityNotExists { message } => write!(f, "entity not exists: {message}"),
            EngineError::WorkflowCompleted => {
                write!(f, "workflow execution already completed")
            }
            EngineError::ActivityTaskNotFound => write!(f, "activity task not found"),
            EngineError::WorkflowParentMismatch => {
                write!(f, "workflow parent does not match")
            }
            EngineError::WorkflowExecutionAlreadyStarted(details) => {
                write!(f, "{}", details.message)
            }
            EngineError::EventAlreadyStarted { message } => write!(f, "{message}"),
            EngineError::CancellationAlreadyRequested => {
                write!(f, "cancellation already requested for this workflow execution")
            }
            EngineError::Conflict => write!(f, "conditional update failed"),
            EngineError::StaleState => {
                write!(f, "cached mutable state could potentially be stale")
            }
            EngineError::MaxAttemptsExceeded => {
                write!(f, "maximum attempts exceeded to update history")
            }
            EngineError::SignalsLimitExceeded => {
                write!(f, "exceeded workflow execution limit for signal events")
            }
            EngineError::BufferedEventsLimitExceeded => {
                write!(f, "exceeded workflow execution limit for buffered events")
            }
            EngineError::DomainNotActive {
                domain_name,
                current_cluster,
                active_cluster,
            } => write!(
                f,
                "domain {domain_name} is active in cluster {active_cluster}, current cluster is {current_cluster}"
            ),
            EngineError::ShardOperationTimeout => write!(f, "shard operation timed out"),
            EngineError::Timeout => write!(f, "operation deadline exceeded"),
            EngineError::TransactionSizeLimit { message } => {
                write!(f, "transaction size exceeds limit: {message}")
            }
            EngineError::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(EngineError::Conflict.is_retryable());
        assert!(EngineError::ShardOperationTimeout.is_retryable());
        assert!(!EngineError::bad_request("nope").is_retryable());
        assert!(!EngineError::WorkflowCompleted.is_retryable());

        assert!(EngineError::Conflict.is_recoverable_in_update_loop());
        assert!(EngineError::StaleState.is_recoverable_in_update_loop());
        assert!(!EngineError::MaxAttemptsExceeded.is_recoverable_in_update_loop());
    }
}
