use crate::db::errors::DbError;
use crate::provisioner::ProvisionError;
use thiserror::Error as ThisError;

/// Crate-level error taxonomy.
///
/// Validation and conflict errors are user-facing (the API layer maps them to
/// 4xx responses with the structured message list from [`Error::user_messages`]);
/// provisioning and database failures stay internal and are only ever logged
/// or corrected by the reconciler.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Entity failed schema or business-rule constraints. Rejected before any
    /// persistence, never retried.
    #[error("Validation failed: {}", messages.join("; "))]
    Validation { messages: Vec<String> },

    /// Duplicate primary key, stale revision, or a mutation that would break a
    /// structural invariant (e.g. removing the last ADMIN). No mutation is
    /// applied.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The calling user lacks the required access level on the entity.
    #[error("Insufficient permissions: {message}")]
    Forbidden { message: String },

    /// Requested entity not found in the caller's (site, tenant) scope
    #[error("{resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },

    /// Orchestration API call failed. The caller runs best-effort teardown of
    /// partial resources; the entity is left in its pre-failure status for the
    /// reconciler to escalate.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            messages: vec![message.into()],
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict { message: message.into() }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Error::Forbidden { message: message.into() }
    }

    /// Whether retrying the identical operation may succeed without any other
    /// state change. Revision conflicts qualify; validation failures do not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Database(DbError::RevisionConflict { .. }))
    }

    /// User-safe messages for the API layer, without leaking internals.
    pub fn user_messages(&self) -> Vec<String> {
        match self {
            Error::Validation { messages } => messages.clone(),
            Error::Conflict { message } => vec![message.clone()],
            Error::Forbidden { message } => vec![message.clone()],
            Error::NotFound { resource, id } => vec![format!("{resource} '{id}' not found")],
            Error::Database(DbError::UniqueViolation { .. }) => vec!["Resource already exists".to_string()],
            Error::Database(DbError::RevisionConflict { .. }) => {
                vec!["Resource was modified concurrently, please retry".to_string()]
            }
            Error::Database(DbError::NotFound) => vec!["Resource not found".to_string()],
            // Everything else is internal
            _ => vec!["Internal server error".to_string()],
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_do_not_leak_details() {
        let err = Error::Other(anyhow::anyhow!("pool timed out talking to 10.0.0.3:5432"));
        assert_eq!(err.user_messages(), vec!["Internal server error".to_string()]);
    }

    #[test]
    fn validation_messages_pass_through() {
        let err = Error::Validation {
            messages: vec!["pod_id too short".to_string(), "too many ports".to_string()],
        };
        assert_eq!(err.user_messages().len(), 2);
        assert!(!err.is_retryable());
    }

    #[test]
    fn revision_conflicts_are_retryable() {
        let err = Error::Database(DbError::RevisionConflict {
            entity: "pod".to_string(),
            id: "p1".to_string(),
        });
        assert!(err.is_retryable());
    }
}
