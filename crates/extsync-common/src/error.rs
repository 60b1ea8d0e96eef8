//! Error types for kube-external-sync
//!
//! Errors carry the resource kind and `namespace/name` keys involved so a
//! single log line is enough to locate the failing object. Nothing here is
//! fatal to the controller: callers log and move on, and the next watch event
//! or periodic resync restores consistency.

use thiserror::Error;

/// Main error type for kube-external-sync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither not-found nor a conflict
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The addressed object does not exist
    #[error("{kind} {key} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the missing object
        key: String,
    },

    /// A concurrent writer changed the object first
    #[error("version conflict writing {kind} {key}: {message}")]
    VersionConflict {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the contested object
        key: String,
        /// Message returned by the API server
        message: String,
    },

    /// A `replicate-to-matching` value is not a valid label selector
    #[error("invalid label selector '{selector}': {message}")]
    InvalidSelector {
        /// The raw selector expression
        selector: String,
        /// What is wrong with it
        message: String,
    },

    /// One entry of a `replicate-to` list is not a valid regular expression
    #[error("invalid namespace pattern '{pattern}': {message}")]
    InvalidPattern {
        /// The anchored pattern that failed to compile
        pattern: String,
        /// Compiler error
        message: String,
    },

    /// A source was replicated to only some of its targets
    #[error("replicated {kind} {source_key} to {replicated} of {total} namespaces (failed: {})", .failed.join(", "))]
    PartialReplication {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the source
        source_key: String,
        /// Number of successful targets
        replicated: usize,
        /// Number of attempted targets
        total: usize,
        /// Namespaces that failed
        failed: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client")
        context: String,
    },
}

impl Error {
    /// Classify a kube-rs error raised while addressing `kind` `key`.
    ///
    /// HTTP 404 becomes [`Error::NotFound`], HTTP 409 becomes
    /// [`Error::VersionConflict`], everything else stays [`Error::Kube`].
    pub fn from_kube(kind: impl Into<String>, key: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: kind.into(),
                key: key.into(),
            },
            kube::Error::Api(ae) if ae.code == 409 => Self::VersionConflict {
                kind: kind.into(),
                key: key.into(),
                message: ae.message,
            },
            other => Self::Kube { source: other },
        }
    }

    /// Create an invalid selector error
    pub fn invalid_selector(selector: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for errors meaning "the object is already gone"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True when another writer won a race for the same object
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}
