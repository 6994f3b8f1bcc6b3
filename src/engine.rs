//! Work order lifecycle engine. Every public operation returns an
//! [`Envelope`]; nothing is thrown across this boundary.
//!
//! Platform calls happen outside store transactions and are bounded by the
//! configured adapter timeout. Each state change is then committed in one
//! transaction that re-checks the status gate, so concurrent transitions of
//! the same order serialize and at most one of them wins.
use std::cell::Cell;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::adapter::{ExternalResult, OperationKind, PlatformAdapter, PlatformRequest};
use crate::audit::{self, AuditEntry, AuditSink, ErrorLogEntry};
use crate::config::{ActorFallback, EngineConfig};
use crate::error::WorkOrderError;
use crate::model::{Actor, BusinessRecord, OrderBundle, OrderMetadata, RawExchangeLog, WorkOrder};
use crate::operation::{NewWorkOrder, Submission};
use crate::response::Envelope;
use crate::status::{ExternalStatus, Transition, WorkOrderStatus, map_external_status};
use crate::store::WorkOrderStore;
use crate::types::{Platform, TimeStamp, WorkOrderSubtype};
use crate::utils::{json_str, new_trace_id, new_uuid_to_bech32, task_number};

const LISTING_CHANNEL_CAPACITY: usize = 256;

/// Published whenever a change makes cached work order listings stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEvent {
    pub user_id: String,
    pub work_order_id: String,
    pub action: &'static str,
}

/// Status push from a platform. Orders are looked up by third-party task id
/// first, then by local task id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(default)]
    pub external_task_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(deserialize_with = "crate::adapter::code_as_string")]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Order, business data, exchange log and audit history
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderDetail {
    #[serde(flatten)]
    pub bundle: OrderBundle,
    pub history: Vec<AuditEntry>,
}

/// A committed result that may still carry a platform failure for the caller
pub(crate) struct Outcome<T> {
    data: T,
    platform_error: Option<WorkOrderError>,
}

impl<T> Outcome<T> {
    pub(crate) fn done(data: T) -> Self {
        Self {
            data,
            platform_error: None,
        }
    }

    fn partial(data: T, error: WorkOrderError) -> Self {
        Self {
            data,
            platform_error: Some(error),
        }
    }
}

/// A status observed on the platform side
struct RemoteState<'a> {
    code: &'a str,
    exchange_key: &'a str,
    raw: &'a Value,
    reason: Option<&'a str>,
    performed_by: &'a str,
}

pub struct LifecycleEngine {
    pub(crate) store: Arc<WorkOrderStore>,
    pub(crate) adapter: Arc<PlatformAdapter>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) config: EngineConfig,
    listing: broadcast::Sender<ListingEvent>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<WorkOrderStore>,
        adapter: Arc<PlatformAdapter>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        let (listing, _) = broadcast::channel(LISTING_CHANNEL_CAPACITY);
        Self {
            store,
            adapter,
            audit,
            config,
            listing,
        }
    }

    pub fn store(&self) -> &WorkOrderStore {
        &self.store
    }

    pub fn subscribe_listing(&self) -> broadcast::Receiver<ListingEvent> {
        self.listing.subscribe()
    }

    /// Validate, optionally submit to the platform, then persist the order,
    /// its business record and the exchange log in one transaction. A
    /// platform refusal is persisted as FAILED and reported as a
    /// THIRD_PARTY_ERROR that still carries the stored order.
    pub async fn create(&self, input: NewWorkOrder, actor: &Actor) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_create(input, actor, &trace_id).await;
        self.respond("create", None, &trace_id, result)
    }

    async fn try_create(
        &self,
        input: NewWorkOrder,
        actor: &Actor,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        let platform = input.platform;
        let media_account_id = input
            .media_account_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let payload = input.payload.validate(platform, media_account_id.as_deref())?;
        let user_id = self.resolve_actor(actor)?;

        let kind = payload.work_order_type();
        let subtype = payload.subtype(platform);
        let now = TimeStamp::new();
        let number = task_number(kind, subtype, &now, self.store.next_sequence()?);
        let id = new_id("wo_")?;
        let task_id = new_id("task_")?;

        let request = PlatformRequest::new(payload.operation(), trace_id, payload.platform_fields())
            .for_account(media_account_id.as_deref())
            .for_task(Some(task_id.as_str()));

        let (status, exchange, external) = match payload.submission() {
            Submission::Immediate => {
                let result = self.call_platform(platform, &request).await;
                let status = if result.success {
                    WorkOrderStatus::Pending
                } else {
                    WorkOrderStatus::Failed
                };
                let exchange = RawExchangeLog::new(
                    &id,
                    &request.to_json(),
                    Some(&result.to_json()),
                    result.success,
                );
                (status, exchange, Some(result))
            }
            Submission::Reviewed => (
                WorkOrderStatus::Pending,
                RawExchangeLog::new(&id, &request.to_json(), None, false),
                None,
            ),
        };
        let operation_id = external
            .as_ref()
            .filter(|result| result.success)
            .and_then(|result| result.operation_id.clone());

        let mut business = BusinessRecord::new(&id, status, payload);
        business.external_task_id = operation_id.clone();
        business.mirror(status, external.as_ref().map(ExternalResult::failure_message));

        let bundle = OrderBundle {
            order: WorkOrder {
                id: id.clone(),
                task_id,
                task_number: number,
                work_order_type: kind,
                work_order_subtype: subtype,
                status,
                user_id,
                media_account_id,
                third_party_task_id: operation_id,
                metadata: OrderMetadata {
                    platform,
                    trace_id: trace_id.to_string(),
                    extra: input.extra,
                },
                remark: input.remark,
                priority: input.priority,
                is_deleted: false,
                created_at: now.clone(),
                updated_at: now,
            },
            business: Some(business),
            exchange: Some(exchange),
        };
        self.store.insert_bundle(&bundle)?;

        tracing::info!(
            trace_id,
            work_order_id = %id,
            task_number = %bundle.order.task_number,
            subtype = %subtype,
            status = %status,
            "work order created"
        );
        self.audit(
            AuditEntry::new(&id, "creation", &actor.user_id).with_values(
                None,
                Some(json!({
                    "status": status.as_str(),
                    "taskNumber": bundle.order.task_number,
                })),
            ),
        );
        self.notify(&bundle.order, "creation");

        match external {
            Some(result) if !result.success => {
                Ok(Outcome::partial(bundle, platform_failure(&result)))
            }
            _ => Ok(Outcome::done(bundle)),
        }
    }

    /// Patch an order that is still modifiable and, if it has already been
    /// sent, push the change to the platform.
    pub async fn update(&self, task_id: &str, patch: Value, actor: &Actor) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_update(task_id, patch, actor, &trace_id).await;
        self.respond("update", None, &trace_id, result)
    }

    async fn try_update(
        &self,
        task_id: &str,
        patch: Value,
        actor: &Actor,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        let order = self
            .store
            .find_by_task_id(task_id)?
            .filter(|order| !order.is_deleted)
            .ok_or_else(|| WorkOrderError::NotFound(format!("task {task_id}")))?;
        ensure_access(&order, actor)?;
        if !order.status.permits(Transition::Update) {
            return Err(WorkOrderError::invalid_state(order.status, Transition::Update));
        }

        let business = self.business_of(&order)?;
        let payload = business
            .payload
            .patched(&patch)?
            .validate(order.platform(), order.media_account_id.as_deref())?;

        let sent = self
            .store
            .get_exchange(&order.id)?
            .is_some_and(|exchange| exchange.sync_attempts > 0);
        let request = PlatformRequest::new(OperationKind::Update, trace_id, payload.platform_fields())
            .for_account(order.media_account_id.as_deref())
            .for_task(order.third_party_task_id.as_deref().or(Some(order.task_id.as_str())));
        // orders waiting for review have nothing on the platform side to update
        let result = if sent {
            Some(self.call_platform(order.platform(), &request).await)
        } else {
            None
        };
        let new_status = match &result {
            Some(result) if !result.success => WorkOrderStatus::Failed,
            _ => WorkOrderStatus::Pending,
        };

        let previous = Cell::new(order.status);
        let request_json = request.to_json();
        let bundle = self.store.update_bundle(&order.id, |bundle| {
            let current = bundle.order.status;
            if bundle.order.is_deleted {
                return Err(WorkOrderError::NotFound(format!("task {task_id}")));
            }
            if !current.permits(Transition::Update) {
                return Err(WorkOrderError::invalid_state(current, Transition::Update));
            }
            previous.set(current);
            bundle.order.set_status(new_status);
            if let Some(business) = bundle.business.as_mut() {
                business.payload = payload.clone();
                business.mirror(new_status, result.as_ref().map(ExternalResult::failure_message));
            }
            match &result {
                Some(result) => {
                    exchange_of(bundle).record_exchange(
                        Some(("updateRequest", &request_json)),
                        Some(("updateResponse", &result.to_json())),
                        result.success,
                    );
                    adopt_external_id(bundle, result);
                }
                None => exchange_of(bundle).record_request("updateRequest", &request_json),
            }
            Ok(())
        })?;

        tracing::info!(
            trace_id,
            work_order_id = %bundle.order.id,
            from = %previous.get(),
            status = %new_status,
            "work order updated"
        );
        self.audit(
            AuditEntry::new(&bundle.order.id, "update", &actor.user_id).with_values(
                Some(json!({"status": previous.get().as_str()})),
                Some(json!({"status": new_status.as_str(), "patch": patch})),
            ),
        );
        self.notify(&bundle.order, "update");

        match result {
            Some(result) if !result.success => {
                Ok(Outcome::partial(bundle, platform_failure(&result)))
            }
            _ => Ok(Outcome::done(bundle)),
        }
    }

    /// Move a reviewed order to PROCESSING and submit it. The approval is
    /// committed before the platform call; if the call fails the order stays
    /// PROCESSING and the caller gets a THIRD_PARTY_ERROR. Orders that were
    /// sent on creation cannot be approved.
    pub async fn approve(
        &self,
        work_order_id: &str,
        expected: WorkOrderSubtype,
        actor: &Actor,
        remarks: Option<String>,
    ) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self
            .try_approve(work_order_id, expected, actor, remarks, &trace_id)
            .await;
        self.respond("approve", Some(work_order_id), &trace_id, result)
    }

    async fn try_approve(
        &self,
        work_order_id: &str,
        expected: WorkOrderSubtype,
        actor: &Actor,
        remarks: Option<String>,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        ensure_elevated(actor, "approve")?;
        let order = self.load_live(work_order_id)?;
        if !order.status.permits(Transition::Approve) {
            return Err(WorkOrderError::invalid_state(order.status, Transition::Approve));
        }
        if order.work_order_subtype != expected {
            return Err(WorkOrderError::field(
                "workOrderSubtype",
                format!("expected {expected}, work order is {}", order.work_order_subtype),
            ));
        }
        let payload = self.business_of(&order)?.payload;
        if payload.submission() == Submission::Immediate {
            return Err(WorkOrderError::field(
                "workOrderSubtype",
                format!("{expected} orders are submitted on creation and need no approval"),
            ));
        }

        let approved = self.store.update_bundle(work_order_id, |bundle| {
            let current = bundle.order.status;
            if !current.permits(Transition::Approve) {
                return Err(WorkOrderError::invalid_state(current, Transition::Approve));
            }
            bundle.order.set_status(WorkOrderStatus::Processing);
            if let Some(remarks) = &remarks {
                bundle.order.remark = Some(remarks.clone());
            }
            if let Some(business) = bundle.business.as_mut() {
                business.mirror(WorkOrderStatus::Processing, None);
            }
            Ok(())
        })?;
        tracing::info!(trace_id, work_order_id, approver = %actor.user_id, "work order approved");
        self.audit(
            AuditEntry::new(work_order_id, "approval", &actor.user_id).with_values(
                Some(json!({"status": WorkOrderStatus::Pending.as_str()})),
                Some(json!({
                    "status": WorkOrderStatus::Processing.as_str(),
                    "remarks": remarks,
                })),
            ),
        );
        self.notify(&approved.order, "approval");

        let request = PlatformRequest::new(payload.operation(), trace_id, payload.platform_fields())
            .for_account(approved.order.media_account_id.as_deref())
            .for_task(Some(approved.order.task_id.as_str()));
        let result = self.call_platform(approved.order.platform(), &request).await;

        let request_json = request.to_json();
        let submitted = self.store.update_bundle(work_order_id, |bundle| {
            exchange_of(bundle).record_exchange(
                Some(("submitRequest", &request_json)),
                Some(("submitResponse", &result.to_json())),
                result.success,
            );
            adopt_external_id(bundle, &result);
            Ok::<(), WorkOrderError>(())
        })?;

        if result.success {
            Ok(Outcome::done(submitted))
        } else {
            tracing::warn!(
                trace_id,
                work_order_id,
                code = %result.code,
                "approved work order was not accepted by the platform"
            );
            let err = WorkOrderError::ThirdParty {
                code: result.code.clone(),
                message: format!(
                    "approved, but submission to the platform failed: {}",
                    result.failure_message()
                ),
            };
            Ok(Outcome::partial(submitted, err))
        }
    }

    /// Cancel a pending order. Purely local.
    pub async fn reject(&self, work_order_id: &str, actor: &Actor, reason: &str) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_reject(work_order_id, actor, reason, &trace_id);
        self.respond("reject", Some(work_order_id), &trace_id, result)
    }

    fn try_reject(
        &self,
        work_order_id: &str,
        actor: &Actor,
        reason: &str,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        ensure_elevated(actor, "reject")?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WorkOrderError::field("reason", "is required"));
        }
        let order = self.load_live(work_order_id)?;
        if !order.status.permits(Transition::Reject) {
            return Err(WorkOrderError::invalid_state(order.status, Transition::Reject));
        }

        let bundle = self.store.update_bundle(work_order_id, |bundle| {
            let current = bundle.order.status;
            if !current.permits(Transition::Reject) {
                return Err(WorkOrderError::invalid_state(current, Transition::Reject));
            }
            bundle.order.set_status(WorkOrderStatus::Cancelled);
            bundle.order.remark = Some(reason.to_string());
            if let Some(business) = bundle.business.as_mut() {
                business.mirror(WorkOrderStatus::Cancelled, None);
            }
            Ok(())
        })?;

        tracing::info!(trace_id, work_order_id, reviewer = %actor.user_id, "work order rejected");
        self.audit(
            AuditEntry::new(work_order_id, "rejection", &actor.user_id).with_values(
                Some(json!({"status": WorkOrderStatus::Pending.as_str()})),
                Some(json!({"status": WorkOrderStatus::Cancelled.as_str(), "reason": reason})),
            ),
        );
        self.notify(&bundle.order, "rejection");
        Ok(Outcome::done(bundle))
    }

    /// Send a FAILED or RETURNED order again, optionally patched first.
    /// Reviewed operations go back to PENDING and wait for approval.
    pub async fn resubmit(
        &self,
        work_order_id: &str,
        patch: Option<Value>,
        actor: &Actor,
    ) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_resubmit(work_order_id, patch, actor, &trace_id).await;
        self.respond("resubmit", Some(work_order_id), &trace_id, result)
    }

    async fn try_resubmit(
        &self,
        work_order_id: &str,
        patch: Option<Value>,
        actor: &Actor,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        let order = self.load_live(work_order_id)?;
        ensure_access(&order, actor)?;
        if !order.status.permits(Transition::Resubmit) {
            return Err(WorkOrderError::invalid_state(order.status, Transition::Resubmit));
        }

        let mut payload = self.business_of(&order)?.payload;
        if let Some(patch) = &patch {
            payload = payload.patched(patch)?;
        }
        let payload = payload.validate(order.platform(), order.media_account_id.as_deref())?;

        let request = PlatformRequest::new(payload.operation(), trace_id, payload.platform_fields())
            .for_account(order.media_account_id.as_deref())
            .for_task(Some(order.task_id.as_str()));
        let result = match payload.submission() {
            Submission::Immediate => Some(self.call_platform(order.platform(), &request).await),
            Submission::Reviewed => None,
        };
        let new_status = match &result {
            Some(result) if !result.success => WorkOrderStatus::Failed,
            _ => WorkOrderStatus::Pending,
        };

        let previous = Cell::new(order.status);
        let request_json = request.to_json();
        let bundle = self.store.update_bundle(work_order_id, |bundle| {
            let current = bundle.order.status;
            if !current.permits(Transition::Resubmit) {
                return Err(WorkOrderError::invalid_state(current, Transition::Resubmit));
            }
            previous.set(current);
            bundle.order.set_status(new_status);
            if let Some(business) = bundle.business.as_mut() {
                business.payload = payload.clone();
                business.mirror(new_status, result.as_ref().map(ExternalResult::failure_message));
            }
            match &result {
                Some(result) => {
                    exchange_of(bundle).record_exchange(
                        Some(("resubmitRequest", &request_json)),
                        Some(("resubmitResponse", &result.to_json())),
                        result.success,
                    );
                    adopt_external_id(bundle, result);
                }
                None => exchange_of(bundle).record_request("resubmitRequest", &request_json),
            }
            Ok(())
        })?;

        tracing::info!(
            trace_id,
            work_order_id,
            from = %previous.get(),
            status = %new_status,
            "work order resubmitted"
        );
        self.audit(
            AuditEntry::new(work_order_id, "resubmission", &actor.user_id).with_values(
                Some(json!({"status": previous.get().as_str()})),
                Some(json!({"status": new_status.as_str()})),
            ),
        );
        self.notify(&bundle.order, "resubmission");

        match result {
            Some(result) if !result.success => {
                Ok(Outcome::partial(bundle, platform_failure(&result)))
            }
            _ => Ok(Outcome::done(bundle)),
        }
    }

    /// Pull the current remote state of one order and reconcile it
    pub async fn query_status(&self, work_order_id: &str, actor: &Actor) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_query_status(work_order_id, actor, &trace_id).await;
        self.respond("query_status", Some(work_order_id), &trace_id, result)
    }

    async fn try_query_status(
        &self,
        work_order_id: &str,
        actor: &Actor,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        let order = self.load_live(work_order_id)?;
        ensure_access(&order, actor)?;

        let request = PlatformRequest::new(OperationKind::QueryStatus, trace_id, json!({}))
            .for_account(order.media_account_id.as_deref())
            .for_task(order.third_party_task_id.as_deref().or(Some(order.task_id.as_str())));
        let result = self.call_platform(order.platform(), &request).await;
        if !result.success {
            return Err(platform_failure(&result));
        }
        let Some(code) = result.data.as_ref().and_then(|data| json_str(data, "status")) else {
            return Err(WorkOrderError::ThirdParty {
                code: result.code.clone(),
                message: "platform response carries no status".into(),
            });
        };

        let raw = result.to_json();
        let reason = result.data.as_ref().and_then(|data| json_str(data, "reason"));
        let bundle = self.apply_remote_state(
            &order.id,
            RemoteState {
                code: &code,
                exchange_key: "statusQuery",
                raw: &raw,
                reason: reason.as_deref(),
                performed_by: &actor.user_id,
            },
            trace_id,
        )?;
        Ok(Outcome::done(bundle))
    }

    /// Apply a status pushed by a platform. Repeating a callback is a no-op
    /// apart from refreshing the exchange log.
    pub async fn handle_callback(&self, platform: Platform, payload: CallbackPayload) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_handle_callback(platform, &payload, &trace_id);
        self.respond("callback", None, &trace_id, result)
    }

    fn try_handle_callback(
        &self,
        platform: Platform,
        payload: &CallbackPayload,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        if payload.external_task_id.is_none() && payload.task_id.is_none() {
            return Err(WorkOrderError::field(
                "externalTaskId",
                "a task id or external task id is required",
            ));
        }
        let mut order = match payload.external_task_id.as_deref() {
            Some(external_id) => self.store.find_by_external_id(external_id)?,
            None => None,
        };
        if order.is_none() {
            if let Some(task_id) = payload.task_id.as_deref() {
                order = self.store.find_by_task_id(task_id)?;
            }
        }
        let order = order
            .filter(|order| !order.is_deleted && order.platform() == platform)
            .ok_or_else(|| WorkOrderError::NotFound("work order for callback".into()))?;

        let raw = serde_json::to_value(payload)
            .map_err(|e| WorkOrderError::system(format!("callback serialization: {e}")))?;
        let performed_by = format!("platform:{platform}");
        let bundle = self.apply_remote_state(
            &order.id,
            RemoteState {
                code: &payload.status,
                exchange_key: "callback",
                raw: &raw,
                reason: payload.message.as_deref(),
                performed_by: &performed_by,
            },
            trace_id,
        )?;
        Ok(Outcome::done(bundle))
    }

    fn apply_remote_state(
        &self,
        work_order_id: &str,
        remote: RemoteState<'_>,
        trace_id: &str,
    ) -> Result<OrderBundle, WorkOrderError> {
        let mapped = map_external_status(remote.code);
        if mapped == ExternalStatus::Unknown {
            tracing::warn!(
                trace_id,
                work_order_id,
                code = remote.code,
                "unknown external status, treating as PENDING"
            );
        }
        let target = mapped.status();

        let changed_from = Cell::new(None);
        let bundle = self.store.update_bundle(work_order_id, |bundle| {
            changed_from.set(None);
            let current = bundle.order.status;
            exchange_of(bundle).record_remote_state(remote.exchange_key, remote.raw);
            if current == target {
                return Ok(());
            }
            if !current.permits(Transition::Reconcile) {
                return Err(WorkOrderError::invalid_state(current, Transition::Reconcile));
            }
            bundle.order.set_status(target);
            if let Some(business) = bundle.business.as_mut() {
                business.mirror(target, remote.reason.map(str::to_string));
            }
            changed_from.set(Some(current));
            Ok(())
        })?;

        match changed_from.get() {
            Some(previous) => {
                tracing::info!(
                    trace_id,
                    work_order_id,
                    from = %previous,
                    status = %target,
                    "work order reconciled"
                );
                self.audit(
                    AuditEntry::new(work_order_id, "status_sync", remote.performed_by).with_values(
                        Some(json!({"status": previous.as_str()})),
                        Some(json!({"status": target.as_str(), "externalStatus": remote.code})),
                    ),
                );
                self.notify(&bundle.order, "status_sync");
            }
            None => tracing::debug!(trace_id, work_order_id, status = %target, "status unchanged"),
        }
        Ok(bundle)
    }

    /// Bind a third-party task id. An id bound to another live order is a
    /// conflict and leaves both orders untouched.
    pub async fn bind_external_task_id(
        &self,
        work_order_id: &str,
        external_id: &str,
        actor: &Actor,
    ) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_bind(work_order_id, external_id, actor, &trace_id);
        self.respond("bind_external_task_id", Some(work_order_id), &trace_id, result)
    }

    fn try_bind(
        &self,
        work_order_id: &str,
        external_id: &str,
        actor: &Actor,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(WorkOrderError::field("externalTaskId", "is required"));
        }
        let order = self.load_live(work_order_id)?;
        ensure_access(&order, actor)?;
        if order.third_party_task_id.as_deref() == Some(external_id) {
            return Ok(Outcome::done(self.bundle_of(&order.id)?));
        }

        let bundle = self.store.update_bundle(work_order_id, |bundle| {
            bundle.order.third_party_task_id = Some(external_id.to_string());
            bundle.order.updated_at = TimeStamp::new();
            if let Some(business) = bundle.business.as_mut() {
                business.external_task_id = Some(external_id.to_string());
            }
            Ok::<(), WorkOrderError>(())
        })?;

        tracing::info!(trace_id, work_order_id, external_id, "external task id bound");
        self.audit(
            AuditEntry::new(work_order_id, "external_binding", &actor.user_id).with_values(
                Some(json!({"thirdPartyTaskId": order.third_party_task_id})),
                Some(json!({"thirdPartyTaskId": external_id})),
            ),
        );
        self.notify(&bundle.order, "external_binding");
        Ok(Outcome::done(bundle))
    }

    /// Hide an order from listings and lookups. The row stays for audit and
    /// its external task id becomes free again.
    pub async fn soft_delete(&self, work_order_id: &str, actor: &Actor) -> Envelope<OrderBundle> {
        let trace_id = new_trace_id();
        let result = self.try_soft_delete(work_order_id, actor, &trace_id);
        self.respond("soft_delete", Some(work_order_id), &trace_id, result)
    }

    fn try_soft_delete(
        &self,
        work_order_id: &str,
        actor: &Actor,
        trace_id: &str,
    ) -> Result<Outcome<OrderBundle>, WorkOrderError> {
        let order = self.load_live(work_order_id)?;
        ensure_access(&order, actor)?;

        let bundle = self.store.update_bundle(work_order_id, |bundle| {
            if bundle.order.is_deleted {
                return Err(WorkOrderError::NotFound(format!("work order {work_order_id}")));
            }
            bundle.order.is_deleted = true;
            bundle.order.updated_at = TimeStamp::new();
            Ok(())
        })?;

        tracing::info!(trace_id, work_order_id, "work order deleted");
        self.audit(
            AuditEntry::new(work_order_id, "deletion", &actor.user_id).with_values(
                Some(json!({"isDeleted": false})),
                Some(json!({"isDeleted": true})),
            ),
        );
        self.notify(&bundle.order, "deletion");
        Ok(Outcome::done(bundle))
    }

    pub async fn get_detail(&self, work_order_id: &str, actor: &Actor) -> Envelope<WorkOrderDetail> {
        let trace_id = new_trace_id();
        let result = self.try_get_detail(work_order_id, actor);
        self.respond("get_detail", Some(work_order_id), &trace_id, result)
    }

    fn try_get_detail(
        &self,
        work_order_id: &str,
        actor: &Actor,
    ) -> Result<Outcome<WorkOrderDetail>, WorkOrderError> {
        let order = self.load_live(work_order_id)?;
        ensure_access(&order, actor)?;
        let bundle = self.bundle_of(&order.id)?;
        let history = self.audit.history(&order.id).unwrap_or_else(|err| {
            tracing::error!(work_order_id, error = %err, "failed to read audit history");
            Vec::new()
        });
        Ok(Outcome::done(WorkOrderDetail { bundle, history }))
    }

    /// Durable identity for `actor`, or the system user when the actor is
    /// unknown and the fallback is enabled
    fn resolve_actor(&self, actor: &Actor) -> Result<String, WorkOrderError> {
        if self.store.get_user(&actor.user_id)?.is_some() {
            return Ok(actor.user_id.clone());
        }
        match self.config.actor_fallback {
            ActorFallback::System => {
                tracing::warn!(
                    user_id = %actor.user_id,
                    system_user_id = %self.config.system_user_id,
                    "unknown actor, acting as system user"
                );
                Ok(self.config.system_user_id.clone())
            }
            ActorFallback::Reject => Err(WorkOrderError::Authorization(format!(
                "unknown user {}",
                actor.user_id
            ))),
        }
    }

    pub(crate) fn load_live(&self, work_order_id: &str) -> Result<WorkOrder, WorkOrderError> {
        match self.store.get_order(work_order_id)? {
            Some(order) if !order.is_deleted => Ok(order),
            _ => Err(WorkOrderError::NotFound(format!("work order {work_order_id}"))),
        }
    }

    fn bundle_of(&self, work_order_id: &str) -> Result<OrderBundle, WorkOrderError> {
        self.store
            .get_bundle(work_order_id)?
            .ok_or_else(|| WorkOrderError::NotFound(format!("work order {work_order_id}")))
    }

    fn business_of(&self, order: &WorkOrder) -> Result<BusinessRecord, WorkOrderError> {
        self.store
            .get_business(&order.id)?
            .ok_or_else(|| WorkOrderError::system(format!("business record missing for {}", order.id)))
    }

    pub(crate) async fn call_platform(
        &self,
        platform: Platform,
        request: &PlatformRequest,
    ) -> ExternalResult {
        self.adapter
            .invoke_with_timeout(platform, request, self.config.adapter_timeout)
            .await
    }

    fn audit(&self, entry: AuditEntry) {
        audit::record(self.audit.as_ref(), &entry);
    }

    pub(crate) fn notify(&self, order: &WorkOrder, action: &'static str) {
        let event = ListingEvent {
            user_id: order.user_id.clone(),
            work_order_id: order.id.clone(),
            action,
        };
        // no subscribers is fine
        let _ = self.listing.send(event);
    }

    /// Map an operation result onto the envelope. System faults also go to
    /// the error log.
    pub(crate) fn respond<T>(
        &self,
        operation: &str,
        work_order_id: Option<&str>,
        trace_id: &str,
        result: Result<Outcome<T>, WorkOrderError>,
    ) -> Envelope<T> {
        match result {
            Ok(Outcome {
                data,
                platform_error: None,
            }) => Envelope::ok(data, trace_id),
            Ok(Outcome {
                data,
                platform_error: Some(err),
            }) => Envelope::error_with(&err, data, trace_id),
            Err(err) => {
                match &err {
                    WorkOrderError::System(detail) => {
                        tracing::error!(trace_id, operation, error = %detail, "operation failed");
                        audit::record_error(
                            self.audit.as_ref(),
                            &ErrorLogEntry::new(work_order_id, operation, trace_id, detail),
                        );
                    }
                    other => tracing::warn!(
                        trace_id,
                        operation,
                        code = other.code(),
                        error = %other,
                        "operation refused"
                    ),
                }
                Envelope::error(&err, trace_id)
            }
        }
    }
}

pub(crate) fn ensure_access(order: &WorkOrder, actor: &Actor) -> Result<(), WorkOrderError> {
    if actor.is_elevated() || order.user_id == actor.user_id {
        Ok(())
    } else {
        Err(WorkOrderError::Authorization(
            "not permitted to act on this work order".into(),
        ))
    }
}

fn ensure_elevated(actor: &Actor, action: &str) -> Result<(), WorkOrderError> {
    if actor.is_elevated() {
        Ok(())
    } else {
        Err(WorkOrderError::Authorization(format!(
            "a reviewer or admin role is required to {action}"
        )))
    }
}

fn new_id(hrp: &str) -> Result<String, WorkOrderError> {
    new_uuid_to_bech32(hrp).map_err(|e| WorkOrderError::system(format!("id generation: {e}")))
}

fn platform_failure(result: &ExternalResult) -> WorkOrderError {
    WorkOrderError::ThirdParty {
        code: result.code.clone(),
        message: result.failure_message(),
    }
}

fn exchange_of(bundle: &mut OrderBundle) -> &mut RawExchangeLog {
    let id = bundle.order.id.clone();
    bundle
        .exchange
        .get_or_insert_with(|| RawExchangeLog::new(&id, &json!({}), None, false))
}

/// Take the platform's task id unless the order is already bound
fn adopt_external_id(bundle: &mut OrderBundle, result: &ExternalResult) {
    let Some(operation_id) = result.operation_id.as_ref().filter(|_| result.success) else {
        return;
    };
    if bundle.order.third_party_task_id.is_none() {
        bundle.order.third_party_task_id = Some(operation_id.clone());
        if let Some(business) = bundle.business.as_mut() {
            business.external_task_id = Some(operation_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, UserRecord};
    use crate::audit::SledAuditLog;
    use crate::operation::{BusinessPayload, FundsData, ZeroingData};

    fn engine(fallback: ActorFallback) -> (tempfile::TempDir, LifecycleEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkOrderStore::open(dir.path().join("db")).unwrap());
        let audit = Arc::new(SledAuditLog::new(store.db()).unwrap());
        let config = EngineConfig {
            actor_fallback: fallback,
            ..EngineConfig::default()
        };
        let engine = LifecycleEngine::new(store, Arc::new(PlatformAdapter::new()), audit, config);
        (dir, engine)
    }

    fn zeroing() -> NewWorkOrder {
        NewWorkOrder::new(
            Platform::TikTok,
            Some("acc-1"),
            BusinessPayload::Zeroing(ZeroingData { reason: None }),
        )
    }

    #[tokio::test]
    async fn unknown_actor_falls_back_to_system_user() {
        let (_dir, engine) = engine(ActorFallback::System);
        let outcome = engine
            .try_create(zeroing(), &Actor::operator("ghost"), "trace")
            .await
            .unwrap();

        assert_eq!(outcome.data.order.user_id, "system");
        assert_eq!(outcome.data.order.status, WorkOrderStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_actor_rejected_when_configured() {
        let (_dir, engine) = engine(ActorFallback::Reject);
        let env = engine.create(zeroing(), &Actor::operator("ghost")).await;
        assert_eq!(env.code(), "AUTH_ERROR");
        assert_eq!(engine.store().count_orders(), 0);

        engine
            .store()
            .put_user(&UserRecord {
                id: "u1".into(),
                name: "Operator One".into(),
                roles: vec![Role::Operator],
            })
            .unwrap();
        let env = engine.create(zeroing(), &Actor::operator("u1")).await;
        assert!(env.success);
        assert_eq!(env.data.unwrap().order.user_id, "u1");
    }

    #[tokio::test]
    async fn immediate_submission_without_handler_is_persisted_failed() {
        let (_dir, engine) = engine(ActorFallback::System);
        let deposit = NewWorkOrder::new(
            Platform::Google,
            Some("acc-1"),
            BusinessPayload::Deposit(FundsData {
                amount: "10".into(),
                currency: "USD".into(),
            }),
        );
        let env = engine.create(deposit, &Actor::operator("u1")).await;

        assert!(!env.success);
        assert_eq!(env.code(), "THIRD_PARTY_ERROR");
        let bundle = env.data.unwrap();
        assert_eq!(bundle.order.status, WorkOrderStatus::Failed);
        assert!(bundle.business.unwrap().failure_reason.unwrap().contains("not supported"));
    }

    #[test]
    fn access_requires_owner_or_elevated_role() {
        let order_owner = Actor::operator("u1");
        let mut order = WorkOrder {
            id: "wo1".into(),
            task_id: "t1".into(),
            task_number: "n1".into(),
            work_order_type: crate::types::WorkOrderType::AccountManagement,
            work_order_subtype: WorkOrderSubtype::Zeroing,
            status: WorkOrderStatus::Pending,
            user_id: "u1".into(),
            media_account_id: None,
            third_party_task_id: None,
            metadata: OrderMetadata {
                platform: Platform::TikTok,
                trace_id: "t".into(),
                extra: Default::default(),
            },
            remark: None,
            priority: 0,
            is_deleted: false,
            created_at: TimeStamp::new(),
            updated_at: TimeStamp::new(),
        };
        assert!(ensure_access(&order, &order_owner).is_ok());
        assert!(ensure_access(&order, &Actor::admin("boss")).is_ok());
        order.user_id = "u2".into();
        assert_eq!(
            ensure_access(&order, &order_owner).unwrap_err().code(),
            "AUTH_ERROR"
        );
    }
}
