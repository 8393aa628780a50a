//! Error types for keel reconcilers
//!
//! Besides ordinary failures, the [`Error`] enum carries three control-flow
//! signals that classify the outcome of a reconcile step:
//!
//! - [`Error::Stop`]: terminal but expected. The pipeline ends, nothing is
//!   retried and nothing is logged as a failure.
//! - [`Error::Temporary`]: an explicitly transient failure. It is retried like
//!   any other failure; the marker only documents intent and keeps the cause.
//! - [`Error::Reconcile`]: not a failure at all. State changed and another pass
//!   should run against fresh state.
//!
//! Classification walks the whole [`std::error::Error::source`] chain, so a
//! signal wrapped by another error type (or by [`Error::wrap`]) is still
//! recognised.

use std::error::Error as StdError;

use thiserror::Error;

use crate::work_item::WorkItemError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Boxed error used for causes of arbitrary type
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Terminal, expected condition; ends the pipeline without a failure
    #[error("stop: {message}")]
    Stop {
        /// Why processing stopped
        message: String,
    },

    /// Transient failure that is expected to resolve on retry
    #[error("temporary: {message}")]
    Temporary {
        /// Description of the failure
        message: String,
        /// Underlying cause (synthesized from the message when none was given)
        #[source]
        cause: BoxError,
    },

    /// State changed and another reconcile pass should run
    #[error("reconcile: {message}")]
    Reconcile {
        /// What changed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Object does not exist in the store
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespace of the missing object
        namespace: String,
        /// Name of the missing object
        name: String,
    },

    /// Optimistic status update gave up
    #[error("status update of {namespace}/{name} failed: retries exceeded after {attempts} attempts")]
    RetriesExceeded {
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Number of attempts made
        attempts: u32,
        /// Error of the last attempt
        #[source]
        last: Option<Box<Error>>,
    },

    /// A deadline elapsed before the operation finished
    #[error("deadline exceeded: {operation}")]
    DeadlineExceeded {
        /// Operation that timed out
        operation: String,
    },

    /// Shutdown was requested while the operation was in progress
    #[error("cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },

    /// Malformed work item
    #[error("invalid work item: {0}")]
    WorkItem(#[from] WorkItemError),

    /// Handler, informer or starter registration rejected
    #[error("registration error for {name}: {message}")]
    Registration {
        /// Name of the component being registered
        name: String,
        /// Why registration was rejected
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "worker", "informer")
        context: String,
    },

    /// Another error annotated with context; classification passes through
    #[error("{context}: {source}")]
    Wrapped {
        /// What was being done
        context: String,
        /// The wrapped error
        #[source]
        source: BoxError,
    },
}

/// Coarse classification of an error, used for log fields and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// [`Error::Stop`] somewhere in the chain
    Stop,
    /// [`Error::Reconcile`] somewhere in the chain
    Reconcile,
    /// [`Error::Temporary`] somewhere in the chain
    Temporary,
    /// Object not found
    NotFound,
    /// Timeout or cancellation
    Deadline,
    /// Anything else
    Failure,
}

impl ErrorKind {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Reconcile => "reconcile",
            Self::Temporary => "temporary",
            Self::NotFound => "not_found",
            Self::Deadline => "deadline",
            Self::Failure => "failure",
        }
    }
}

impl Error {
    /// Create a stop signal
    pub fn stop(msg: impl Into<String>) -> Self {
        Self::Stop {
            message: msg.into(),
        }
    }

    /// Create a reconcile-again signal
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile {
            message: msg.into(),
        }
    }

    /// Create a temporary failure
    ///
    /// When `cause` is `None` a cause is synthesized from the message, so
    /// [`Error::cause`] always returns something.
    pub fn temporary<E>(cause: Option<E>, msg: impl Into<String>) -> Self
    where
        E: Into<BoxError>,
    {
        let message = msg.into();
        let cause = match cause {
            Some(cause) => cause.into(),
            None => BoxError::from(message.clone()),
        };
        Self::Temporary { message, cause }
    }

    /// Create a not-found error
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a deadline-exceeded error
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a registration error
    pub fn registration(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Annotate an error with context, keeping its classification
    pub fn wrap<E>(context: impl Into<String>, err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Wrapped {
            context: context.into(),
            source: err.into(),
        }
    }

    /// Cause of a [`Error::Temporary`]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Temporary { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Whether a stop signal is anywhere in the chain
    pub fn is_stop(&self) -> bool {
        is_stop(self)
    }

    /// Whether a temporary marker is anywhere in the chain
    pub fn is_temporary(&self) -> bool {
        is_temporary(self)
    }

    /// Whether a reconcile-again signal is anywhere in the chain
    pub fn is_reconcile(&self) -> bool {
        is_reconcile(self)
    }

    /// Whether the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        is_not_found(self)
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        kind_of(self)
    }

    /// Whether the dispatch loop should retry the item with backoff
    ///
    /// Signals, not-found and malformed input are not retried.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Stop | ErrorKind::Reconcile | ErrorKind::NotFound => false,
            _ => !matches!(self, Self::WorkItem(_) | Self::Registration { .. }),
        }
    }
}

/// Walk an error and its sources, yielding every link that is a keel [`Error`]
fn keel_errors<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a Error> + 'a {
    std::iter::successors(Some(err), |e| (*e).source())
        .filter_map(|e| e.downcast_ref::<Error>())
}

/// Whether a stop signal is anywhere in the chain
pub fn is_stop(err: &(dyn StdError + 'static)) -> bool {
    keel_errors(err).any(|e| matches!(e, Error::Stop { .. }))
}

/// Whether a temporary marker is anywhere in the chain
pub fn is_temporary(err: &(dyn StdError + 'static)) -> bool {
    keel_errors(err).any(|e| matches!(e, Error::Temporary { .. }))
}

/// Whether a reconcile-again signal is anywhere in the chain
pub fn is_reconcile(err: &(dyn StdError + 'static)) -> bool {
    keel_errors(err).any(|e| matches!(e, Error::Reconcile { .. }))
}

/// Whether the chain contains a not-found error, from keel or from the API server
pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    std::iter::successors(Some(err), |e| (*e).source()).any(|e| {
        match e.downcast_ref::<Error>() {
            Some(Error::NotFound { .. }) => return true,
            Some(Error::Kube { source }) => return crate::kube_utils::is_kube_not_found(source),
            _ => {}
        }
        e.downcast_ref::<kube::Error>()
            .is_some_and(crate::kube_utils::is_kube_not_found)
    })
}

/// Classify an arbitrary error chain
pub fn kind_of(err: &(dyn StdError + 'static)) -> ErrorKind {
    if is_stop(err) {
        ErrorKind::Stop
    } else if is_reconcile(err) {
        ErrorKind::Reconcile
    } else if is_not_found(err) {
        ErrorKind::NotFound
    } else if is_temporary(err) {
        ErrorKind::Temporary
    } else if keel_errors(err)
        .any(|e| matches!(e, Error::DeadlineExceeded { .. } | Error::Cancelled { .. }))
    {
        ErrorKind::Deadline
    } else {
        ErrorKind::Failure
    }
}
