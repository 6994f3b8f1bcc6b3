#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ad_work_orders::adapter::{OperationKind, PlatformAdapter, PlatformEnvelope, PlatformHandler, PlatformRequest};
use ad_work_orders::audit::{AuditSink, SledAuditLog};
use ad_work_orders::config::EngineConfig;
use ad_work_orders::engine::LifecycleEngine;
use ad_work_orders::error::{AdapterError, StoreError};
use ad_work_orders::model::{Actor, Role, UserRecord};
use ad_work_orders::operation::{
    ApplicationData, BindingAction, BindingData, BindingKind, BusinessPayload, FundsData,
    NewWorkOrder, TransferData, ZeroingData,
};
use ad_work_orders::status::WorkOrderStatus;
use ad_work_orders::store::WorkOrderStore;
use ad_work_orders::types::Platform;
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

pub const OPERATOR: &str = "u1";
pub const OTHER_OPERATOR: &str = "u2";
pub const REVIEWER: &str = "rev";

/// Platform double: answers each operation from a queue of canned envelopes
/// (plain success once the queue is empty) and keeps every request it saw.
#[derive(Default)]
pub struct ScriptedHandler {
    scripted: Mutex<HashMap<OperationKind, VecDeque<PlatformEnvelope>>>,
    requests: Mutex<Vec<PlatformRequest>>,
}

impl ScriptedHandler {
    pub fn respond(&self, operation: OperationKind, envelope: PlatformEnvelope) {
        self.scripted
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(envelope);
    }

    pub fn requests(&self) -> Vec<PlatformRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self, operation: OperationKind) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.operation == operation)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PlatformHandler for ScriptedHandler {
    async fn call(
        &self,
        _platform: Platform,
        request: &PlatformRequest,
    ) -> Result<PlatformEnvelope, AdapterError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.operation)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| PlatformEnvelope::success(json!({}))))
    }
}

/// Never answers in time
pub struct StuckHandler;

#[async_trait]
impl PlatformHandler for StuckHandler {
    async fn call(
        &self,
        _platform: Platform,
        _request: &PlatformRequest,
    ) -> Result<PlatformEnvelope, AdapterError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(PlatformEnvelope::success(json!({})))
    }
}

/// Audit sink whose every write fails
pub struct BrokenAudit;

impl AuditSink for BrokenAudit {
    fn append(&self, _entry: &ad_work_orders::audit::AuditEntry) -> Result<(), StoreError> {
        Err(StoreError::Aborted("audit disk full".into()))
    }

    fn append_error(&self, _entry: &ad_work_orders::audit::ErrorLogEntry) -> Result<(), StoreError> {
        Err(StoreError::Aborted("audit disk full".into()))
    }

    fn history(&self, _entity_id: &str) -> Result<Vec<ad_work_orders::audit::AuditEntry>, StoreError> {
        Err(StoreError::Aborted("audit disk full".into()))
    }
}

pub struct Harness {
    // keeps the database directory alive
    _dir: TempDir,
    pub engine: LifecycleEngine,
    pub handler: Arc<ScriptedHandler>,
    pub audit: Arc<SledAuditLog>,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(WorkOrderStore::open(dir.path().join("work-orders.db")).unwrap());
    register_users(&store);
    let audit = Arc::new(SledAuditLog::new(store.db()).unwrap());
    let handler = Arc::new(ScriptedHandler::default());

    let mut adapter = PlatformAdapter::new();
    for platform in Platform::ALL {
        adapter.register_platform(platform, handler.clone());
    }
    let engine = LifecycleEngine::new(store, Arc::new(adapter), audit.clone(), config);

    Harness {
        _dir: dir,
        engine,
        handler,
        audit,
    }
}

/// Engine over an arbitrary adapter and audit sink
pub fn engine_with(
    adapter: PlatformAdapter,
    audit: Option<Arc<dyn AuditSink>>,
    config: EngineConfig,
) -> (TempDir, LifecycleEngine) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(WorkOrderStore::open(dir.path().join("work-orders.db")).unwrap());
    register_users(&store);
    let audit: Arc<dyn AuditSink> = match audit {
        Some(audit) => audit,
        None => Arc::new(SledAuditLog::new(store.db()).unwrap()),
    };
    let engine = LifecycleEngine::new(store, Arc::new(adapter), audit, config);
    (dir, engine)
}

fn register_users(store: &WorkOrderStore) {
    let users = [
        (OPERATOR, "Operator One", vec![Role::Operator]),
        (OTHER_OPERATOR, "Operator Two", vec![Role::Operator]),
        (REVIEWER, "Reviewer", vec![Role::Reviewer]),
    ];
    for (id, name, roles) in users {
        store
            .put_user(&UserRecord {
                id: id.into(),
                name: name.into(),
                roles,
            })
            .unwrap();
    }
}

pub fn operator() -> Actor {
    Actor::operator(OPERATOR)
}

pub fn reviewer() -> Actor {
    Actor::new(REVIEWER, vec![Role::Reviewer])
}

pub fn deposit(account: &str, amount: &str) -> NewWorkOrder {
    NewWorkOrder::new(
        Platform::Google,
        Some(account),
        BusinessPayload::Deposit(FundsData {
            amount: amount.into(),
            currency: "USD".into(),
        }),
    )
}

/// Reviewed operation: nothing is sent until approval
pub fn withdrawal(account: &str, amount: &str) -> NewWorkOrder {
    NewWorkOrder::new(
        Platform::Google,
        Some(account),
        BusinessPayload::Withdrawal(FundsData {
            amount: amount.into(),
            currency: "USD".into(),
        }),
    )
}

pub fn application(account_name: &str, company_name: &str) -> NewWorkOrder {
    NewWorkOrder::new(
        Platform::Google,
        None,
        BusinessPayload::Application(ApplicationData {
            account_name: account_name.into(),
            company_name: company_name.into(),
            license_number: Some("LIC-42".into()),
            timezone: "Europe/Berlin".into(),
            currency: "EUR".into(),
            promotion_links: vec!["https://acme.example/shoes".into()],
            daily_budget: Some("50".into()),
        }),
    )
}

pub fn email_binding(account: &str, email: &str) -> NewWorkOrder {
    NewWorkOrder::new(
        Platform::Google,
        Some(account),
        BusinessPayload::Binding(BindingData {
            kind: BindingKind::Email,
            action: BindingAction::Bind,
            value: email.into(),
            role: Some("STANDARD".into()),
        }),
    )
}

pub fn transfer(source: &str, target: &str, amount: &str) -> NewWorkOrder {
    NewWorkOrder::new(
        Platform::Google,
        Some(source),
        BusinessPayload::Transfer(TransferData {
            source_account_id: source.into(),
            target_account_id: target.into(),
            amount: amount.into(),
            currency: "USD".into(),
        }),
    )
}

pub fn zeroing(account: &str) -> NewWorkOrder {
    NewWorkOrder::new(
        Platform::Google,
        Some(account),
        BusinessPayload::Zeroing(ZeroingData {
            reason: Some("account closing".into()),
        }),
    )
}

pub fn accepted(task_id: &str) -> PlatformEnvelope {
    PlatformEnvelope::success(json!({ "taskId": task_id }))
}

/// Overwrite a stored status, bypassing the lifecycle gates
pub fn force_status(engine: &LifecycleEngine, work_order_id: &str, status: WorkOrderStatus) {
    engine
        .store()
        .update_bundle(work_order_id, |bundle| {
            bundle.order.set_status(status);
            if let Some(business) = bundle.business.as_mut() {
                business.status = status;
            }
            Ok::<(), StoreError>(())
        })
        .unwrap();
}
