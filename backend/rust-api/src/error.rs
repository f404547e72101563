use thiserror::Error;

use crate::services::grant_store::GrantDirection;

/// Errors produced by the file storage stack (key addressing, grant store,
/// blob stores and the authorization gate).
#[derive(Debug, Error)]
pub enum FileUploadError {
    /// Deployment misconfiguration: missing root directory, bucket or
    /// grant store binding. Never retried.
    #[error("file upload configuration error: {0}")]
    Configuration(String),

    #[error("file not found: {key}")]
    NotFound { key: String },

    /// The grant for this direction is absent or expired.
    #[error("{direction} access denied for key: {key}")]
    AccessDenied {
        direction: GrantDirection,
        key: String,
    },

    #[error("invalid file key: {0}")]
    InvalidKey(String),

    #[error("file storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("grant store error: {0}")]
    Cache(String),

    #[error("object storage error: {0}")]
    ObjectStorage(String),
}

impl FileUploadError {
    pub fn configuration(message: impl Into<String>) -> Self {
        FileUploadError::Configuration(message.into())
    }

    pub fn invalid_key(message: impl Into<String>) -> Self {
        FileUploadError::InvalidKey(message.into())
    }

    /// Expected, caller-recoverable outcomes (as opposed to infrastructure
    /// failures).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FileUploadError::NotFound { .. }
                | FileUploadError::AccessDenied { .. }
                | FileUploadError::InvalidKey(_)
        )
    }
}

/// Errors produced by the submission ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("student item not found: {0}")]
    StudentItemNotFound(String),

    #[error("submission {submission_id} does not belong to student item {student_item_id}")]
    SubmissionMismatch {
        submission_id: String,
        student_item_id: String,
    },

    #[error("ledger sequence unavailable: {0}")]
    Sequence(String),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_is_distinct_from_not_found() {
        let denied = FileUploadError::AccessDenied {
            direction: GrantDirection::Download,
            key: "abc".into(),
        };
        let missing = FileUploadError::NotFound { key: "abc".into() };

        assert_eq!(denied.to_string(), "download access denied for key: abc");
        assert_eq!(missing.to_string(), "file not found: abc");
        assert!(denied.is_client_error());
        assert!(missing.is_client_error());
    }

    #[test]
    fn test_infrastructure_errors_are_not_client_errors() {
        assert!(!FileUploadError::configuration("missing root").is_client_error());
        assert!(!FileUploadError::Cache("down".into()).is_client_error());
        let io = FileUploadError::from(std::io::Error::other("disk"));
        assert!(!io.is_client_error());
    }
}
