//! Uniform result envelope returned by every public engine operation
use serde::Serialize;

use crate::error::{FieldErrors, WorkOrderError};

pub const SUCCESS_CODE: &str = "0";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<FieldErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T, trace_id: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(SUCCESS_CODE.into()),
            message: None,
            data: Some(data),
            field_errors: None,
            trace_id: Some(trace_id.into()),
        }
    }

    pub fn error(err: &WorkOrderError, trace_id: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(err.code().into()),
            message: Some(err.client_message()),
            data: None,
            field_errors: err.field_errors().cloned(),
            trace_id: Some(trace_id.into()),
        }
    }

    /// Failure that still carries a payload, e.g. a work order persisted as FAILED
    pub fn error_with(err: &WorkOrderError, data: T, trace_id: impl Into<String>) -> Self {
        Self {
            data: Some(data),
            ..Self::error(err, trace_id)
        }
    }

    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_envelope_shape() {
        let env = Envelope::ok(json!({"id": "wo_1"}), "abc");
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(
            value,
            json!({"success": true, "code": "0", "data": {"id": "wo_1"}, "traceId": "abc"})
        );
    }

    #[test]
    fn validation_envelope_carries_field_errors() {
        let err = WorkOrderError::field("amount", "must be greater than zero");
        let env: Envelope<()> = Envelope::error(&err, "abc");
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["code"], "VALIDATION_ERROR");
        assert_eq!(value["fieldErrors"]["amount"], "must be greater than zero");
        assert!(value.get("data").is_none());
    }
}
