//! Append-only audit trail and error log. Both live outside the work order
//! transaction: a failed append is logged and dropped, never surfaced.
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::types::TimeStamp;
use crate::utils::parse_snapshot;

pub const WORK_ORDER_ENTITY: &str = "work_order";

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[n(0)]
    pub entity_type: String,
    #[n(1)]
    pub entity_id: String,
    #[n(2)]
    pub action: String, // free text: "creation", "approval", "rejection", ...
    #[n(3)]
    pub performed_by: String,
    #[n(4)]
    pub previous_value: Option<String>,
    #[n(5)]
    pub new_value: Option<String>,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

impl AuditEntry {
    pub fn new(entity_id: &str, action: &str, performed_by: &str) -> Self {
        Self {
            entity_type: WORK_ORDER_ENTITY.into(),
            entity_id: entity_id.into(),
            action: action.into(),
            performed_by: performed_by.into(),
            previous_value: None,
            new_value: None,
            created_at: TimeStamp::new(),
        }
    }

    pub fn with_values(mut self, previous: Option<Value>, new: Option<Value>) -> Self {
        self.previous_value = previous.map(|v| v.to_string());
        self.new_value = new.map(|v| v.to_string());
        self
    }

    pub fn previous_json(&self) -> Option<Value> {
        self.previous_value.as_deref().map(parse_snapshot)
    }

    pub fn new_json(&self) -> Option<Value> {
        self.new_value.as_deref().map(parse_snapshot)
    }

    /// Encoded entry and the hash it is stored under
    pub fn build(&self) -> Result<(String, Vec<u8>), StoreError> {
        let cbor = minicbor::to_vec(self).map_err(|e| StoreError::Codec(e.to_string()))?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    #[n(0)]
    pub entity_id: Option<String>,
    #[n(1)]
    pub operation: String,
    #[n(2)]
    pub trace_id: String,
    #[n(3)]
    pub message: String,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
}

impl ErrorLogEntry {
    pub fn new(entity_id: Option<&str>, operation: &str, trace_id: &str, message: &str) -> Self {
        Self {
            entity_id: entity_id.map(str::to_string),
            operation: operation.into(),
            trace_id: trace_id.into(),
            message: message.into(),
            created_at: TimeStamp::new(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    fn append_error(&self, entry: &ErrorLogEntry) -> Result<(), StoreError>;

    /// Entries for one entity, oldest first
    fn history(&self, entity_id: &str) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Record an audit entry, swallowing sink failures
pub fn record(sink: &dyn AuditSink, entry: &AuditEntry) {
    if let Err(err) = sink.append(entry) {
        tracing::error!(
            entity_id = %entry.entity_id,
            action = %entry.action,
            error = %err,
            "failed to append audit entry"
        );
    }
}

pub fn record_error(sink: &dyn AuditSink, entry: &ErrorLogEntry) {
    if let Err(err) = sink.append_error(entry) {
        tracing::error!(
            trace_id = %entry.trace_id,
            operation = %entry.operation,
            error = %err,
            "failed to append error log entry"
        );
    }
}

/// sled backed sink. Audit keys sort by entity then time:
/// `<entityId>/<createdAtNanos>/<hash>`.
pub struct SledAuditLog {
    audit: sled::Tree,
    errors: sled::Tree,
}

impl SledAuditLog {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, StoreError> {
        Ok(Self {
            audit: instance.open_tree("audit_log")?,
            errors: instance.open_tree("error_log")?,
        })
    }

    pub fn error_entries(&self) -> Result<Vec<ErrorLogEntry>, StoreError> {
        self.errors
            .iter()
            .map(|entry| -> Result<ErrorLogEntry, StoreError> {
                let (_, bytes) = entry?;
                minicbor::decode(&bytes).map_err(|e| StoreError::Codec(e.to_string()))
            })
            .collect()
    }
}

impl AuditSink for SledAuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let (hash, cbor) = entry.build()?;
        let key = format!(
            "{}/{:020}/{}",
            entry.entity_id,
            entry.created_at.nanos(),
            hash
        );
        // content addressed: appending the same entry twice is a no-op
        self.audit.insert(key.as_bytes(), cbor)?;
        Ok(())
    }

    fn append_error(&self, entry: &ErrorLogEntry) -> Result<(), StoreError> {
        let cbor = minicbor::to_vec(entry).map_err(|e| StoreError::Codec(e.to_string()))?;
        let key = format!("{:020}/{}", entry.created_at.nanos(), sha256::digest(&cbor));
        self.errors.insert(key.as_bytes(), cbor)?;
        Ok(())
    }

    fn history(&self, entity_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        self.audit
            .scan_prefix(format!("{entity_id}/").as_bytes())
            .map(|entry| -> Result<AuditEntry, StoreError> {
                let (_, bytes) = entry?;
                minicbor::decode(&bytes).map_err(|e| StoreError::Codec(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn audit_log() -> (tempfile::TempDir, SledAuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sled::open(dir.path().join("db")).unwrap());
        (dir, SledAuditLog::new(db).unwrap())
    }

    #[test]
    fn history_is_per_entity_and_ordered() {
        let (_dir, log) = audit_log();
        let first = AuditEntry::new("wo1", "creation", "u1");
        let mut second = AuditEntry::new("wo1", "rejection", "admin")
            .with_values(Some(json!({"status": "PENDING"})), Some(json!({"status": "CANCELLED"})));
        second.created_at =
            TimeStamp::from(first.created_at.to_datetime_utc() + chrono::TimeDelta::seconds(1));
        log.append(&second).unwrap();
        log.append(&first).unwrap();
        log.append(&AuditEntry::new("wo10", "creation", "u2")).unwrap();

        let history = log.history("wo1").unwrap();
        assert_eq!(history, vec![first, second]);
        assert_eq!(history[1].previous_json(), Some(json!({"status": "PENDING"})));
    }

    #[test]
    fn identical_entries_collapse() {
        let (_dir, log) = audit_log();
        let entry = AuditEntry::new("wo1", "creation", "u1");
        log.append(&entry).unwrap();
        log.append(&entry).unwrap();

        assert_eq!(log.history("wo1").unwrap().len(), 1);
    }

    #[test]
    fn error_log_keeps_entries() {
        let (_dir, log) = audit_log();
        log.append_error(&ErrorLogEntry::new(Some("wo1"), "create", "abc", "disk full"))
            .unwrap();

        let entries = log.error_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "disk full");
    }
}
