use cachestore_id::{ClassId, ObjectId};
use cachestore_lock::{LockConflict, LockConflictKind};
use std::fmt::Display;

/// The errors shared by the caching server, its nodes and the update queue between them.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("cache consistency violation: {0}")]
    CacheConsistency(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("class info not found for class id {0}")]
    ClassInfoNotFound(ClassId),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("node failed: {0}")]
    NodeFailed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The transaction may be retried as is.
    RetryableByCaller,
    /// The transaction must abort; retrying it later may succeed.
    AbortTransaction,
    /// The node can no longer serve requests.
    Fatal,
    /// Only the call failed; the transaction can carry on.
    Request,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) | Self::ResourceExhausted(_) => ErrorCategory::RetryableByCaller,
            Self::Conflict(_) | Self::Interrupted(_) | Self::ShuttingDown => {
                ErrorCategory::AbortTransaction
            }
            Self::Network(_)
            | Self::CacheConsistency(_)
            | Self::IllegalState(_)
            | Self::NodeFailed(_) => ErrorCategory::Fatal,
            Self::ObjectNotFound(_) | Self::ClassInfoNotFound(_) | Self::InvalidArgument(_) => {
                ErrorCategory::Request
            }
        }
    }

    /// Whether the same request may succeed if made again: lock timeouts, running out
    /// of retries, and deadlocks.
    pub fn should_retry(&self) -> bool {
        self.category() == ErrorCategory::RetryableByCaller || matches!(self, Self::Conflict(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// The name the error travels under when it is sent to the other side of a
    /// connection.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "Timeout",
            Self::ResourceExhausted(_) => "ResourceExhausted",
            Self::CacheConsistency(_) => "CacheConsistency",
            Self::Conflict(_) => "Conflict",
            Self::Interrupted(_) => "Interrupted",
            Self::Network(_) => "Network",
            Self::ObjectNotFound(_) => "ObjectNotFound",
            Self::ClassInfoNotFound(_) => "ClassInfoNotFound",
            Self::IllegalState(_) => "IllegalState",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::ShuttingDown => "ShuttingDown",
            Self::NodeFailed(_) => "NodeFailed",
        }
    }

    /// The detail that accompanies [`Self::kind_name`] on the wire.
    pub fn remote_message(&self) -> String {
        match self {
            Self::Timeout(m)
            | Self::ResourceExhausted(m)
            | Self::CacheConsistency(m)
            | Self::Conflict(m)
            | Self::Interrupted(m)
            | Self::Network(m)
            | Self::IllegalState(m)
            | Self::InvalidArgument(m)
            | Self::NodeFailed(m) => m.clone(),
            Self::ObjectNotFound(oid) => oid.to_string(),
            Self::ClassInfoNotFound(id) => id.to_string(),
            Self::ShuttingDown => String::new(),
        }
    }

    /// Rebuilds an error received from the other side of a connection. Kinds that are
    /// not recognized, or whose message cannot be parsed, come back as
    /// [`Error::Network`].
    pub fn from_remote(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "Timeout" => Self::Timeout(message),
            "ResourceExhausted" => Self::ResourceExhausted(message),
            "CacheConsistency" => Self::CacheConsistency(message),
            "Conflict" => Self::Conflict(message),
            "Interrupted" => Self::Interrupted(message),
            "Network" => Self::Network(message),
            "IllegalState" => Self::IllegalState(message),
            "InvalidArgument" => Self::InvalidArgument(message),
            "NodeFailed" => Self::NodeFailed(message),
            "ShuttingDown" => Self::ShuttingDown,
            "ObjectNotFound" => match message.parse::<u64>().ok().and_then(|v| ObjectId::new(v).ok()) {
                Some(oid) => Self::ObjectNotFound(oid),
                None => Self::Network(format!("malformed remote error {kind}: {message}")),
            },
            "ClassInfoNotFound" => match message.parse::<u32>() {
                Ok(id) => Self::ClassInfoNotFound(ClassId::new(id)),
                Err(_) => Self::Network(format!("malformed remote error {kind}: {message}")),
            },
            _ => Self::Network(format!("remote error {kind}: {message}")),
        }
    }

    /// Converts a refused lock request for `what` into the error reported to the
    /// requester.
    pub fn from_lock_conflict<L: Display>(conflict: &LockConflict<L>, what: impl Display) -> Self {
        let conflicting = &conflict.conflicting;
        match conflict.kind {
            LockConflictKind::Timeout => Self::Timeout(format!(
                "lock of {what} timed out, blocked by {conflicting}"
            )),
            LockConflictKind::Deadlock => Self::Conflict(format!(
                "lock of {what} chosen as deadlock victim, in a cycle with {conflicting}"
            )),
            LockConflictKind::Blocked => Self::Conflict(format!(
                "lock of {what} denied, held by {conflicting}"
            )),
            LockConflictKind::Interrupted => Self::Interrupted(format!(
                "interrupted while waiting to lock {what}, blocked by {conflicting}"
            )),
        }
    }
}

impl From<cachestore_lock::Error> for Error {
    fn from(e: cachestore_lock::Error) -> Self {
        match e {
            cachestore_lock::Error::MustAbort => Self::Conflict(e.to_string()),
            _ => Self::IllegalState(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachestore_id::NodeId;
    use pretty_assertions::assert_eq;

    #[test]
    fn categories() {
        assert_eq!(
            Error::Timeout("t".into()).category(),
            ErrorCategory::RetryableByCaller
        );
        assert_eq!(
            Error::Conflict("c".into()).category(),
            ErrorCategory::AbortTransaction
        );
        assert_eq!(Error::ShuttingDown.category(), ErrorCategory::AbortTransaction);
        assert_eq!(Error::Network("n".into()).category(), ErrorCategory::Fatal);
        assert_eq!(
            Error::CacheConsistency("c".into()).category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            Error::ObjectNotFound(ObjectId::MIN).category(),
            ErrorCategory::Request
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::Timeout("t".into()).should_retry());
        assert!(Error::ResourceExhausted("r".into()).should_retry());
        assert!(Error::Conflict("deadlock".into()).should_retry());
        assert!(!Error::Interrupted("i".into()).should_retry());
        assert!(!Error::ShuttingDown.should_retry());
        assert!(!Error::CacheConsistency("c".into()).should_retry());
    }

    #[test]
    fn remote_errors_keep_their_kind() {
        let errors = vec![
            Error::Timeout("lock timed out".into()),
            Error::CacheConsistency("node 3 does not own 7".into()),
            Error::ObjectNotFound(ObjectId::new(42).unwrap()),
            Error::ClassInfoNotFound(ClassId::new(9)),
            Error::ShuttingDown,
        ];
        for error in errors {
            let back = Error::from_remote(error.kind_name(), error.remote_message());
            assert_eq!(back, error);
        }
    }

    #[test]
    fn unknown_remote_errors_become_network_failures() {
        let error = Error::from_remote("NullPointer", "oops");
        assert!(error.is_network(), "{error}");
        let error = Error::from_remote("ObjectNotFound", "not a number");
        assert!(error.is_network(), "{error}");
    }

    #[test]
    fn lock_conflicts() {
        let node = NodeId::new(2);
        let timeout = LockConflict {
            kind: LockConflictKind::Timeout,
            conflicting: node,
        };
        assert!(matches!(
            Error::from_lock_conflict(&timeout, "object 1"),
            Error::Timeout(_)
        ));
        for kind in [LockConflictKind::Deadlock, LockConflictKind::Blocked] {
            let conflict = LockConflict {
                kind,
                conflicting: node,
            };
            assert!(matches!(
                Error::from_lock_conflict(&conflict, "object 1"),
                Error::Conflict(_)
            ));
        }
        let interrupted = LockConflict {
            kind: LockConflictKind::Interrupted,
            conflicting: node,
        };
        let error = Error::from_lock_conflict(&interrupted, "object 1");
        assert_eq!(
            error.to_string(),
            "interrupted: interrupted while waiting to lock object 1, blocked by 2"
        );
    }
}
