use std::collections::BTreeMap;

use crate::status::{Transition, WorkOrderStatus};

pub type FieldErrors = BTreeMap<String, String>;

/// Failures of the embedded record store
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error("failed to encode or decode a stored record: {0}")]
    Codec(String),
    #[error("uniqueness constraint violated: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("write aborted at {0}")]
    Aborted(String),
}

/// Failures talking to a platform endpoint. Never escapes the adapter; it is
/// folded into a failed `ExternalResult`.
#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform responded with http status {0}")]
    Status(u16),
    #[error("malformed platform response: {0}")]
    Decode(String),
}

/// Caller-facing error taxonomy of the lifecycle engine
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum WorkOrderError {
    #[error("{message}")]
    Validation { message: String, fields: FieldErrors },
    #[error("{0} not found")]
    NotFound(String),
    #[error("cannot {transition} a work order that is {status}")]
    InvalidState {
        status: WorkOrderStatus,
        transition: &'static str,
    },
    #[error("{0}")]
    Authorization(String),
    #[error("platform call failed: {message}")]
    ThirdParty { code: String, message: String },
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    System(String),
}

impl WorkOrderError {
    pub fn validation(message: impl Into<String>, fields: FieldErrors) -> Self {
        WorkOrderError::Validation {
            message: message.into(),
            fields,
        }
    }

    pub fn field(field: &str, problem: impl Into<String>) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(field.to_string(), problem.into());
        WorkOrderError::validation("Invalid field value", fields)
    }

    pub fn invalid_state(status: WorkOrderStatus, transition: Transition) -> Self {
        WorkOrderError::InvalidState {
            status,
            transition: transition.as_str(),
        }
    }

    pub fn system(detail: impl Into<String>) -> Self {
        WorkOrderError::System(detail.into())
    }

    /// Envelope code. An open set: platforms add their own numeric strings.
    pub fn code(&self) -> &'static str {
        match self {
            WorkOrderError::Validation { .. } => "VALIDATION_ERROR",
            WorkOrderError::NotFound(_) => "404",
            WorkOrderError::InvalidState { .. } => "InvalidStateError",
            WorkOrderError::Authorization(_) => "AUTH_ERROR",
            WorkOrderError::ThirdParty { .. } => "THIRD_PARTY_ERROR",
            WorkOrderError::Conflict(_) => "409",
            WorkOrderError::System(_) => "SYSTEM_ERROR",
        }
    }

    /// Message safe to show a caller. System details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            WorkOrderError::System(_) => "An internal error occurred, please try again later".into(),
            other => other.to_string(),
        }
    }

    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            WorkOrderError::Validation { fields, .. } if !fields.is_empty() => Some(fields),
            _ => None,
        }
    }
}

impl From<StoreError> for WorkOrderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => WorkOrderError::Conflict(msg),
            StoreError::NotFound(what) => WorkOrderError::NotFound(what),
            other => {
                tracing::error!(error = %other, "store failure");
                WorkOrderError::System(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_errors_hide_details() {
        let err = WorkOrderError::system("sled: io error at /var/lib/db");
        assert_eq!(err.code(), "SYSTEM_ERROR");
        assert!(!err.client_message().contains("/var/lib"));
    }

    #[test]
    fn invalid_state_names_the_blocking_status() {
        let err = WorkOrderError::invalid_state(WorkOrderStatus::Failed, Transition::Approve);
        assert_eq!(err.code(), "InvalidStateError");
        assert_eq!(err.client_message(), "cannot approve a work order that is FAILED");
    }

    #[test]
    fn store_conflicts_surface_as_conflicts() {
        let err: WorkOrderError = StoreError::Conflict("external task id".into()).into();
        assert_eq!(err.code(), "409");
    }
}
