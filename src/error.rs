//! Crate-level error types for reservations, projections and command execution.

use crate::tag::TagValidationError;

/// Coarse classification of a [`DcbError`].
///
/// Callers use this to decide whether to retry with fresh state
/// ([`Conflict`](ErrorKind::Conflict)), retry as-is
/// ([`Transient`](ErrorKind::Transient)) or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Optimistic concurrency mismatch or an active reservation on a tag.
    Conflict,
    /// A requested record does not exist.
    NotFound,
    /// Malformed input rejected before any side effect.
    Validation,
    /// Store or blob I/O failure.
    Transient,
    /// State failed a structural sanity check.
    InvariantViolation,
}

/// One tag that could not be reserved, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagReservationFailure {
    /// The tag string (`group:content`).
    pub tag: String,
    /// Human-readable conflict reason.
    pub reason: String,
}

/// Error returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum DcbError {
    /// Another writer holds an unexpired reservation on the tag.
    #[error("Tag {tag} is currently reserved")]
    TagReserved {
        /// The reserved tag.
        tag: String,
    },

    /// The tag moved past the version the caller observed.
    #[error("Tag {tag} has been modified. Expected version: {expected}, Current version: {current}")]
    TagModified {
        /// The conflicting tag.
        tag: String,
        /// The version the caller expected.
        expected: String,
        /// The tag's actual latest version.
        current: String,
    },

    /// At least one tag of a command could not be reserved.
    ///
    /// All reservations that did succeed have already been cancelled
    /// by the time this error reaches the caller.
    #[error("Failed to reserve tags: {}", join_failures(.failures))]
    ReservationFailed {
        /// Every failing tag and its reason.
        failures: Vec<TagReservationFailure>,
    },

    /// One or more tags failed structural validation.
    #[error("tag validation failed with {} error(s): {}", .0.len(), join_validation(.0))]
    InvalidTags(Vec<TagValidationError>),

    /// A state update targeted a different tag or projector.
    #[error("state identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Identity owned by the receiving actor.
        expected: String,
        /// Identity carried by the supplied state.
        actual: String,
    },

    /// A string could not be parsed as a sortable unique id.
    #[error("invalid sortable unique id: {0:?}")]
    InvalidSortableUniqueId(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The event store reported a failure.
    #[error("event store error: {0}")]
    Store(String),

    /// The blob accessor reported a failure.
    #[error("blob storage error: {0}")]
    Blob(String),

    /// A concurrent writer updated the durable projection record first.
    #[error("write conflict on projection state {projector}/{version}")]
    WriteConflict {
        /// Projector name of the record.
        projector: String,
        /// Projector version of the record.
        version: String,
    },

    /// Persistence was refused because the state looks corrupt.
    #[error("snapshot persistence blocked: {0}")]
    PersistBlocked(String),

    /// A snapshot could not be restored.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Byte stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command rejected by the handler's business logic.
    #[error(transparent)]
    Domain(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl DcbError {
    /// Wrap a domain error produced by a command handler.
    pub fn domain<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Domain(Box::new(err))
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TagReserved { .. } | Self::TagModified { .. } | Self::ReservationFailed { .. } => {
                ErrorKind::Conflict
            }
            Self::WriteConflict { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidTags(_)
            | Self::IdentityMismatch { .. }
            | Self::InvalidSortableUniqueId(_)
            | Self::Domain(_) => ErrorKind::Validation,
            Self::Store(_) | Self::Blob(_) | Self::Io(_) => ErrorKind::Transient,
            Self::PersistBlocked(_) | Self::InvalidSnapshot(_) | Self::Serialization(_) => {
                ErrorKind::InvariantViolation
            }
        }
    }

    /// Returns `true` for optimistic concurrency failures.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

fn join_failures(failures: &[TagReservationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("Tag {}: {}", f.tag, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_validation(errors: &[TagValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("insufficient seats")]
    struct NoSeats;

    #[test]
    fn tag_reserved_display() {
        let err = DcbError::TagReserved {
            tag: "Student:s1".to_string(),
        };
        assert_eq!(err.to_string(), "Tag Student:s1 is currently reserved");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn tag_modified_names_both_versions() {
        let err = DcbError::TagModified {
            tag: "Student:s1".to_string(),
            expected: "111".to_string(),
            current: "222".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Tag Student:s1 has been modified. Expected version: 111, Current version: 222"
        );
    }

    #[test]
    fn reservation_failed_lists_every_tag() {
        let err = DcbError::ReservationFailed {
            failures: vec![
                TagReservationFailure {
                    tag: "A:1".to_string(),
                    reason: "Tag A:1 is currently reserved".to_string(),
                },
                TagReservationFailure {
                    tag: "B:2".to_string(),
                    reason: "stale".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Failed to reserve tags: Tag A:1: Tag A:1 is currently reserved; Tag B:2: stale"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn invalid_tags_counts_errors() {
        let err = DcbError::InvalidTags(vec![
            TagValidationError::EmptyGroup {
                tag: ":x".to_string(),
            },
            TagValidationError::EmptyContent {
                tag: "x:".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 error(s)"), "got: {msg}");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn domain_error_is_transparent() {
        let err = DcbError::domain(NoSeats);
        assert_eq!(err.to_string(), "insufficient seats");
    }

    #[test]
    fn store_errors_are_transient() {
        assert_eq!(
            DcbError::Store("down".to_string()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            DcbError::PersistBlocked("empty".to_string()).kind(),
            ErrorKind::InvariantViolation
        );
    }

    // Errors cross task boundaries through spawned futures and join handles.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<DcbError>();
        }
    };
}
