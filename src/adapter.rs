//! Platform adapter: dispatches (platform, operation) pairs to handlers that
//! talk to the advertising platforms.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::AdapterError;
use crate::types::Platform;
use crate::utils::json_str;

pub const TRACE_HEADER: &str = "Trace-Id";
pub const UNSUPPORTED_CODE: &str = "UNSUPPORTED";
pub const TIMEOUT_CODE: &str = "TIMEOUT";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Apply,
    Deposit,
    Withdrawal,
    Transfer,
    BindAccount,
    UnbindAccount,
    BindEmail,
    UnbindEmail,
    BindPixel,
    UnbindPixel,
    Zeroing,
    Rename,
    Update,
    QueryStatus,
    QueryTasks,
}

impl OperationKind {
    pub const ALL: [OperationKind; 15] = [
        OperationKind::Apply,
        OperationKind::Deposit,
        OperationKind::Withdrawal,
        OperationKind::Transfer,
        OperationKind::BindAccount,
        OperationKind::UnbindAccount,
        OperationKind::BindEmail,
        OperationKind::UnbindEmail,
        OperationKind::BindPixel,
        OperationKind::UnbindPixel,
        OperationKind::Zeroing,
        OperationKind::Rename,
        OperationKind::Update,
        OperationKind::QueryStatus,
        OperationKind::QueryTasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Apply => "apply",
            OperationKind::Deposit => "deposit",
            OperationKind::Withdrawal => "withdrawal",
            OperationKind::Transfer => "transfer",
            OperationKind::BindAccount => "bind_account",
            OperationKind::UnbindAccount => "unbind_account",
            OperationKind::BindEmail => "bind_email",
            OperationKind::UnbindEmail => "unbind_email",
            OperationKind::BindPixel => "bind_pixel",
            OperationKind::UnbindPixel => "unbind_pixel",
            OperationKind::Zeroing => "zeroing",
            OperationKind::Rename => "rename",
            OperationKind::Update => "update",
            OperationKind::QueryStatus => "query_status",
            OperationKind::QueryTasks => "query_tasks",
        }
    }
}

/// Request sent to a platform handler
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRequest {
    pub operation: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub trace_id: String,
    pub platform_specific_fields: Value,
}

impl PlatformRequest {
    pub fn new(operation: OperationKind, trace_id: &str, fields: Value) -> Self {
        Self {
            operation,
            media_account_id: None,
            task_id: None,
            trace_id: trace_id.to_string(),
            platform_specific_fields: fields,
        }
    }

    pub fn for_account(mut self, media_account_id: Option<&str>) -> Self {
        self.media_account_id = media_account_id.map(str::to_string);
        self
    }

    pub fn for_task(mut self, task_id: Option<&str>) -> Self {
        self.task_id = task_id.map(str::to_string);
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Wire envelope every platform answers with. `code` arrives as either a
/// string or a number depending on the platform.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PlatformEnvelope {
    #[serde(deserialize_with = "code_as_string")]
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

pub(crate) fn code_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number code, got {other}"
        ))),
    }
}

impl PlatformEnvelope {
    pub fn success(data: Value) -> Self {
        Self {
            code: "0".into(),
            message: None,
            data: Some(data),
        }
    }

    pub fn failure(code: &str, message: &str) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Normalized outcome of one platform call
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalResult {
    pub success: bool,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ExternalResult {
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.into(),
            operation_id: None,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn failure_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("platform returned code {}", self.code))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<PlatformEnvelope> for ExternalResult {
    fn from(envelope: PlatformEnvelope) -> Self {
        let operation_id = envelope
            .data
            .as_ref()
            .and_then(|data| json_str(data, "taskId").or_else(|| json_str(data, "id")));
        Self {
            success: envelope.code == "0",
            code: envelope.code,
            operation_id,
            message: envelope.message,
            data: envelope.data,
        }
    }
}

/// One concrete platform integration. Implementations own retries and
/// idempotency; the adapter never retries.
#[async_trait]
pub trait PlatformHandler: Send + Sync {
    async fn call(
        &self,
        platform: Platform,
        request: &PlatformRequest,
    ) -> Result<PlatformEnvelope, AdapterError>;
}

/// Registry of handlers keyed by (platform, operation)
#[derive(Default, Clone)]
pub struct PlatformAdapter {
    handlers: HashMap<(Platform, OperationKind), Arc<dyn PlatformHandler>>,
}

impl PlatformAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        platform: Platform,
        operation: OperationKind,
        handler: Arc<dyn PlatformHandler>,
    ) -> &mut Self {
        self.handlers.insert((platform, operation), handler);
        self
    }

    /// Route every operation of `platform` to one handler
    pub fn register_platform(
        &mut self,
        platform: Platform,
        handler: Arc<dyn PlatformHandler>,
    ) -> &mut Self {
        for operation in OperationKind::ALL {
            self.handlers.insert((platform, operation), handler.clone());
        }
        self
    }

    pub fn supports(&self, platform: Platform, operation: OperationKind) -> bool {
        self.handlers.contains_key(&(platform, operation))
    }

    /// Dispatch a request. Missing handlers and handler errors come back as
    /// failed results, never as errors.
    pub async fn invoke(&self, platform: Platform, request: &PlatformRequest) -> ExternalResult {
        let Some(handler) = self.handlers.get(&(platform, request.operation)) else {
            tracing::warn!(
                %platform,
                operation = request.operation.as_str(),
                trace_id = %request.trace_id,
                "no handler registered"
            );
            return ExternalResult::failure(
                UNSUPPORTED_CODE,
                format!(
                    "operation {} is not supported on {}",
                    request.operation.as_str(),
                    platform
                ),
            );
        };

        tracing::debug!(
            %platform,
            operation = request.operation.as_str(),
            trace_id = %request.trace_id,
            "invoking platform"
        );
        match handler.call(platform, request).await {
            Ok(envelope) => ExternalResult::from(envelope),
            Err(err) => {
                tracing::error!(
                    %platform,
                    operation = request.operation.as_str(),
                    trace_id = %request.trace_id,
                    error = %err,
                    "platform call failed"
                );
                ExternalResult::failure("TRANSPORT_ERROR", "platform is unreachable")
            }
        }
    }

    /// `invoke` bounded by `limit`
    pub async fn invoke_with_timeout(
        &self,
        platform: Platform,
        request: &PlatformRequest,
        limit: Duration,
    ) -> ExternalResult {
        match tokio::time::timeout(limit, self.invoke(platform, request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    %platform,
                    operation = request.operation.as_str(),
                    trace_id = %request.trace_id,
                    timeout_ms = limit.as_millis() as u64,
                    "platform call timed out"
                );
                ExternalResult::failure(TIMEOUT_CODE, "platform call timed out")
            }
        }
    }
}

/// JSON-over-HTTP handler: `POST {base_url}/{operation}` with a bearer token
/// and the trace id header.
pub struct HttpPlatformHandler {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPlatformHandler {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn endpoint(&self, operation: OperationKind) -> String {
        format!("{}/{}", self.base_url, operation.as_str())
    }
}

#[async_trait]
impl PlatformHandler for HttpPlatformHandler {
    async fn call(
        &self,
        _platform: Platform,
        request: &PlatformRequest,
    ) -> Result<PlatformEnvelope, AdapterError> {
        let mut builder = self
            .client
            .post(self.endpoint(request.operation))
            .header("accept", "application/json")
            .header(TRACE_HEADER, &request.trace_id)
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| AdapterError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl PlatformHandler for Echo {
        async fn call(
            &self,
            _platform: Platform,
            request: &PlatformRequest,
        ) -> Result<PlatformEnvelope, AdapterError> {
            Ok(PlatformEnvelope::success(
                json!({"taskId": format!("ext-{}", request.operation.as_str())}),
            ))
        }
    }

    struct Broken;

    #[async_trait]
    impl PlatformHandler for Broken {
        async fn call(
            &self,
            _platform: Platform,
            _request: &PlatformRequest,
        ) -> Result<PlatformEnvelope, AdapterError> {
            Err(AdapterError::Status(502))
        }
    }

    struct Stuck;

    #[async_trait]
    impl PlatformHandler for Stuck {
        async fn call(
            &self,
            _platform: Platform,
            _request: &PlatformRequest,
        ) -> Result<PlatformEnvelope, AdapterError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(PlatformEnvelope::success(json!({})))
        }
    }

    fn request(operation: OperationKind) -> PlatformRequest {
        PlatformRequest::new(operation, "trace", json!({}))
    }

    #[tokio::test]
    async fn unsupported_pairs_fail_softly() {
        let mut adapter = PlatformAdapter::new();
        adapter.register(Platform::Google, OperationKind::Deposit, Arc::new(Echo));

        let ok = adapter.invoke(Platform::Google, &request(OperationKind::Deposit)).await;
        assert!(ok.success);
        assert_eq!(ok.operation_id.as_deref(), Some("ext-deposit"));

        let missing = adapter.invoke(Platform::TikTok, &request(OperationKind::Deposit)).await;
        assert!(!missing.success);
        assert_eq!(missing.code, UNSUPPORTED_CODE);
    }

    #[tokio::test]
    async fn handler_errors_become_failed_results() {
        let mut adapter = PlatformAdapter::new();
        adapter.register_platform(Platform::Facebook, Arc::new(Broken));

        let result = adapter.invoke(Platform::Facebook, &request(OperationKind::Rename)).await;
        assert!(!result.success);
        assert_eq!(result.failure_message(), "platform is unreachable");
    }

    #[tokio::test]
    async fn stuck_calls_time_out() {
        let mut adapter = PlatformAdapter::new();
        adapter.register_platform(Platform::TikTok, Arc::new(Stuck));

        let result = adapter
            .invoke_with_timeout(
                Platform::TikTok,
                &request(OperationKind::Apply),
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(result.code, TIMEOUT_CODE);
    }

    #[test]
    fn envelope_code_accepts_numbers() {
        let env: PlatformEnvelope =
            serde_json::from_value(json!({"code": 0, "message": null, "data": {"taskId": 77}}))
                .unwrap();
        let result = ExternalResult::from(env);
        assert!(result.success);
        assert_eq!(result.operation_id.as_deref(), Some("77"));

        let env: PlatformEnvelope =
            serde_json::from_value(json!({"code": "1", "message": "insufficient funds"})).unwrap();
        let result = ExternalResult::from(env);
        assert!(!result.success);
        assert_eq!(result.failure_message(), "insufficient funds");
    }

    #[test]
    fn request_serializes_camel_case() {
        let req = PlatformRequest::new(OperationKind::BindPixel, "t-1", json!({"value": "px1"}))
            .for_account(Some("acc-9"));
        assert_eq!(
            req.to_json(),
            json!({
                "operation": "bind_pixel",
                "mediaAccountId": "acc-9",
                "traceId": "t-1",
                "platformSpecificFields": {"value": "px1"}
            })
        );
    }
}
