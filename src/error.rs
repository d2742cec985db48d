//! Runtime error taxonomy

use thiserror::Error;

use crate::objects::ObjectId;

/// Errors surfaced by the object runtime to the immediate caller
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Load of a missing or recycled id
    #[error("object #{0} not found")]
    NotFound(ObjectId),

    #[error("#{object} has no method '{method}'")]
    MethodNotFound { object: ObjectId, method: String },

    /// Malformed method source, detected at first invocation
    #[error("compile error in #{object}:{method}: {message}")]
    CompileError {
        object: ObjectId,
        method: String,
        message: String,
    },

    /// Uncaught error raised inside a method body
    #[error("error in #{object}:{method}: {message}")]
    Script {
        object: ObjectId,
        method: String,
        message: String,
    },

    #[error("alias '{0}' is not registered")]
    AliasNotRegistered(String),

    /// A direct reference named an object that is not resident in the cache
    #[error("object #{0} is not cached")]
    HandleNotCached(ObjectId),

    #[error("invalid alias name '{0}'")]
    InvalidAlias(String),

    #[error("object #{0} is protected and cannot be recycled")]
    Protected(ObjectId),

    #[error("inheritance cycle detected at #{0}")]
    InheritanceCycle(ObjectId),

    /// The record changed in the store since it was loaded
    #[error("write conflict on #{0}; reload and retry")]
    Conflict(ObjectId),

    #[error("call deadline exceeded")]
    DeadlineExceeded,

    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    #[error("object runtime has shut down")]
    ShutDown,

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl RuntimeError {
    /// True for the two failure kinds of a direct (cache-only) reference
    pub fn is_direct_access_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::AliasNotRegistered(_) | RuntimeError::HandleNotCached(_)
        )
    }
}

/// Runtime result type
pub type Result<T> = std::result::Result<T, RuntimeError>;
