//! Persisted entities: the work order ledger row, its business data, the raw
//! exchange log, and the identities that act on them.
use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::BusinessPayload;
use crate::status::WorkOrderStatus;
use crate::types::{Platform, TimeStamp, WorkOrderSubtype, WorkOrderType};
use crate::utils::{merge_json, parse_snapshot};

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMetadata {
    #[n(0)]
    pub platform: Platform,
    #[n(1)]
    pub trace_id: String,
    // unstructured context only; typed fields belong in the business payload
    #[n(2)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub task_id: String, // local correlation key, `task_` bech32
    #[n(2)]
    pub task_number: String, // human readable, immutable
    #[n(3)]
    pub work_order_type: WorkOrderType,
    #[n(4)]
    pub work_order_subtype: WorkOrderSubtype,
    #[n(5)]
    pub status: WorkOrderStatus,
    #[n(6)]
    pub user_id: String,
    #[n(7)]
    pub media_account_id: Option<String>,
    #[n(8)]
    pub third_party_task_id: Option<String>,
    #[n(9)]
    pub metadata: OrderMetadata,
    #[n(10)]
    pub remark: Option<String>,
    #[n(11)]
    pub priority: u8,
    #[n(12)]
    pub is_deleted: bool,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
    #[n(14)]
    pub updated_at: TimeStamp<Utc>,
}

impl WorkOrder {
    pub fn platform(&self) -> Platform {
        self.metadata.platform
    }

    pub fn trace_id(&self) -> &str {
        &self.metadata.trace_id
    }

    pub fn set_status(&mut self, status: WorkOrderStatus) {
        self.status = status;
        self.updated_at = TimeStamp::new();
    }
}

/// Operation-specific record attached 1:1 to a work order
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessRecord {
    #[n(0)]
    pub work_order_id: String,
    #[n(1)]
    pub status: WorkOrderStatus,
    #[n(2)]
    pub failure_reason: Option<String>,
    #[n(3)]
    pub external_task_id: Option<String>,
    #[n(4)]
    pub payload: BusinessPayload,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub updated_at: TimeStamp<Utc>,
}

impl BusinessRecord {
    pub fn new(work_order_id: &str, status: WorkOrderStatus, payload: BusinessPayload) -> Self {
        let now = TimeStamp::new();
        Self {
            work_order_id: work_order_id.to_string(),
            status,
            failure_reason: None,
            external_task_id: None,
            payload,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Mirror the order's status; the failure reason only survives in FAILED
    pub fn mirror(&mut self, status: WorkOrderStatus, failure_reason: Option<String>) {
        self.status = status;
        self.failure_reason = match status {
            WorkOrderStatus::Failed => failure_reason,
            _ => None,
        };
        self.updated_at = TimeStamp::new();
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Synced,
    #[n(2)]
    Failed,
}

/// Verbatim request/response history of one work order. Both blobs are JSON
/// objects that only ever grow: later exchanges are merged in under their own
/// keys.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExchangeLog {
    #[n(0)]
    pub work_order_id: String,
    #[n(1)]
    pub request_data: String,
    #[n(2)]
    pub response_data: String,
    #[n(3)]
    pub sync_status: SyncStatus,
    #[n(4)]
    pub sync_attempts: u32,
    #[n(5)]
    pub last_sync_time: Option<TimeStamp<Utc>>,
}

impl RawExchangeLog {
    /// Log for the first exchange. `response` is `None` when nothing was sent yet.
    pub fn new(work_order_id: &str, request: &Value, response: Option<&Value>, success: bool) -> Self {
        let (response_data, sync_status, attempts, last_sync_time) = match response {
            Some(response) => (
                response.to_string(),
                if success { SyncStatus::Synced } else { SyncStatus::Failed },
                1,
                Some(TimeStamp::new()),
            ),
            None => ("{}".to_string(), SyncStatus::Pending, 0, None),
        };
        Self {
            work_order_id: work_order_id.to_string(),
            request_data: request.to_string(),
            response_data,
            sync_status,
            sync_attempts: attempts,
            last_sync_time,
        }
    }

    /// Merge another exchange in, keeping every earlier key intact
    pub fn record_exchange(
        &mut self,
        request_key: Option<(&str, &Value)>,
        response_key: Option<(&str, &Value)>,
        success: bool,
    ) {
        if let Some((key, request)) = request_key {
            let mut blob = parse_snapshot(&self.request_data);
            merge_json(&mut blob, serde_json::json!({ key: request }));
            self.request_data = blob.to_string();
        }
        if let Some((key, response)) = response_key {
            let mut blob = parse_snapshot(&self.response_data);
            merge_json(&mut blob, serde_json::json!({ key: response }));
            self.response_data = blob.to_string();
        }
        self.sync_attempts = self.sync_attempts.saturating_add(1);
        self.sync_status = if success { SyncStatus::Synced } else { SyncStatus::Failed };
        self.last_sync_time = Some(TimeStamp::new());
    }

    /// Keep a request that was not sent anywhere, e.g. an edit made while
    /// the order waits for review
    pub fn record_request(&mut self, key: &str, request: &Value) {
        let mut blob = parse_snapshot(&self.request_data);
        merge_json(&mut blob, serde_json::json!({ key: request }));
        self.request_data = blob.to_string();
    }

    /// Store remote state pulled by a status query or pushed by a callback,
    /// under `key` and as `latestResponse`
    pub fn record_remote_state(&mut self, key: &str, response: &Value) {
        let mut blob = parse_snapshot(&self.response_data);
        merge_json(
            &mut blob,
            serde_json::json!({ key: response, "latestResponse": response }),
        );
        self.response_data = blob.to_string();
        self.sync_attempts = self.sync_attempts.saturating_add(1);
        self.sync_status = SyncStatus::Synced;
        self.last_sync_time = Some(TimeStamp::new());
    }

    pub fn request_json(&self) -> Value {
        parse_snapshot(&self.request_data)
    }

    pub fn response_json(&self) -> Value {
        parse_snapshot(&self.response_data)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[n(0)]
    Operator,
    #[n(1)]
    Reviewer,
    #[n(2)]
    Admin,
}

/// Durable identity known to the store
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub roles: Vec<Role>,
}

/// The identity an operation is performed as, handed in by the caller's
/// authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub roles: Vec<Role>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
        }
    }

    pub fn operator(user_id: impl Into<String>) -> Self {
        Self::new(user_id, vec![Role::Operator])
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self::new(user_id, vec![Role::Admin])
    }

    /// Reviewers and admins may approve and reject
    pub fn is_elevated(&self) -> bool {
        self.roles
            .iter()
            .any(|role| matches!(role, Role::Reviewer | Role::Admin))
    }
}

/// A work order with everything persisted alongside it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBundle {
    pub order: WorkOrder,
    pub business: Option<BusinessRecord>,
    pub exchange: Option<RawExchangeLog>,
}
