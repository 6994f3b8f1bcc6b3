//! Actor listings joined with the platforms' view of the same tasks
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::adapter::{OperationKind, PlatformRequest};
use crate::engine::{LifecycleEngine, Outcome};
use crate::error::WorkOrderError;
use crate::model::{Actor, WorkOrder};
use crate::operation::BusinessPayload;
use crate::response::Envelope;
use crate::status::{ExternalStatus, WorkOrderStatus, map_external_status};
use crate::types::{Platform, WorkOrderSubtype};
use crate::utils::new_trace_id;

/// Remote status of a work order the platform returned nothing for
pub const UNKNOWN_REMOTE_STATUS: &str = "-1";

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ListFilter {
    /// 1-based
    pub page: usize,
    pub page_size: Option<usize>,
    pub platform: Option<Platform>,
    pub subtype: Option<WorkOrderSubtype>,
    pub status: Option<WorkOrderStatus>,
    pub include_failed: bool,
    // applied after the remote join
    pub company_name: Option<String>,
    pub license_number: Option<String>,
    pub account_ids: Option<Vec<String>>,
    pub promotion_link: Option<String>,
}

/// One task as reported by a platform's batched task query
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteTask {
    pub task_id: String,
    pub status: Value,
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub company_name: Option<String>,
    pub license_number: Option<String>,
    pub promotion_links: Vec<String>,
}

impl RemoteTask {
    fn status_code(&self) -> Option<String> {
        match &self.status {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchKind {
    ExternalId,
    AccountNames,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListedWorkOrder {
    #[serde(flatten)]
    pub order: WorkOrder,
    pub payload: Option<BusinessPayload>,
    /// Raw remote status, or [`UNKNOWN_REMOTE_STATUS`]
    pub remote_status: String,
    pub mapped_remote_status: Option<WorkOrderStatus>,
    pub matched_by: Option<MatchKind>,
    pub remote: Option<RemoteTask>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingPage {
    pub items: Vec<ListedWorkOrder>,
    pub page: usize,
    pub page_size: usize,
    /// local orders matching the pre-join filters
    pub total: usize,
}

impl LifecycleEngine {
    /// Page of the actor's work orders, each joined with the platform's
    /// current record for it
    pub async fn list_for_actor(&self, actor: &Actor, filter: ListFilter) -> Envelope<ListingPage> {
        let trace_id = new_trace_id();
        let result = self.try_list(actor, &filter, &trace_id).await;
        self.respond("list", None, &trace_id, result)
    }

    async fn try_list(
        &self,
        actor: &Actor,
        filter: &ListFilter,
        trace_id: &str,
    ) -> Result<Outcome<ListingPage>, WorkOrderError> {
        let page = filter.page.max(1);
        let page_size = filter
            .page_size
            .unwrap_or(self.config.page_size)
            .clamp(1, self.config.max_page_size.max(1));

        let local: Vec<WorkOrder> = self
            .store
            .list_for_user(&actor.user_id)?
            .into_iter()
            .filter(|order| local_filter(order, filter))
            .collect();
        let total = local.len();
        let page_orders: Vec<WorkOrder> = local
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        let mut payloads = BTreeMap::new();
        for order in &page_orders {
            if let Some(business) = self.store.get_business(&order.id)? {
                payloads.insert(order.id.clone(), business.payload);
            }
        }

        let mut by_platform: BTreeMap<Platform, Vec<&WorkOrder>> = BTreeMap::new();
        for order in &page_orders {
            by_platform.entry(order.platform()).or_default().push(order);
        }
        let mut remote_by_platform = BTreeMap::new();
        for (platform, orders) in by_platform {
            let tasks = self.query_remote_tasks(platform, &orders, trace_id).await;
            remote_by_platform.insert(platform, tasks);
        }

        let mut items = Vec::with_capacity(page_orders.len());
        let mut claimed: HashSet<(Platform, String)> = HashSet::new();
        // exact matches first so a fuzzy match never steals a correlated record
        for order in &page_orders {
            if let Some(ext) = &order.third_party_task_id {
                claimed.insert((order.platform(), ext.clone()));
            }
        }

        for mut order in page_orders {
            let payload = payloads.remove(&order.id);
            let remote_tasks = remote_by_platform
                .get(&order.platform())
                .map(Vec::as_slice)
                .unwrap_or_default();

            let mut matched = order.third_party_task_id.as_ref().and_then(|ext| {
                remote_tasks
                    .iter()
                    .find(|task| &task.task_id == ext)
                    .map(|task| (task.clone(), MatchKind::ExternalId))
            });
            if matched.is_none() && order.third_party_task_id.is_none() {
                let names = payload.as_ref().and_then(BusinessPayload::application_names);
                if let Some((account_name, company_name)) = names {
                    let mut candidate = None;
                    for task in remote_tasks {
                        if claimed.contains(&(order.platform(), task.task_id.clone()))
                            || !contains_ci(task.account_name.as_deref(), account_name)
                            || !contains_ci(task.company_name.as_deref(), company_name)
                        {
                            continue;
                        }
                        // bound to an order outside this page
                        if self.store.find_by_external_id(&task.task_id)?.is_some() {
                            claimed.insert((order.platform(), task.task_id.clone()));
                            continue;
                        }
                        candidate = Some(task);
                        break;
                    }
                    if let Some(task) = candidate {
                        claimed.insert((order.platform(), task.task_id.clone()));
                        if let Some(account_id) = &task.account_id {
                            order = self.backfill_account(order, account_id, trace_id)?;
                        }
                        matched = Some((task.clone(), MatchKind::AccountNames));
                    }
                }
            }

            let item = match matched {
                Some((task, kind)) => {
                    let code = task.status_code();
                    let mapped = code.as_deref().map(map_external_status).and_then(|m| match m {
                        ExternalStatus::Known(status) => Some(status),
                        ExternalStatus::Unknown => None,
                    });
                    ListedWorkOrder {
                        order,
                        payload,
                        remote_status: code.unwrap_or_else(|| UNKNOWN_REMOTE_STATUS.into()),
                        mapped_remote_status: mapped,
                        matched_by: Some(kind),
                        remote: Some(task),
                    }
                }
                None => ListedWorkOrder {
                    order,
                    payload,
                    remote_status: UNKNOWN_REMOTE_STATUS.into(),
                    mapped_remote_status: None,
                    matched_by: None,
                    remote: None,
                },
            };
            if joined_filter(&item, filter) {
                items.push(item);
            }
        }

        tracing::debug!(
            trace_id,
            user_id = %actor.user_id,
            total,
            returned = items.len(),
            "listed work orders"
        );
        Ok(Outcome::done(ListingPage {
            items,
            page,
            page_size,
            total,
        }))
    }

    /// One batched task query per platform. Failures degrade to "no remote
    /// data" rather than failing the listing.
    async fn query_remote_tasks(
        &self,
        platform: Platform,
        orders: &[&WorkOrder],
        trace_id: &str,
    ) -> Vec<RemoteTask> {
        let task_ids: Vec<&str> = orders
            .iter()
            .filter_map(|order| order.third_party_task_id.as_deref())
            .collect();
        let account_ids: Vec<&str> = orders
            .iter()
            .filter_map(|order| order.media_account_id.as_deref())
            .collect();
        let request = PlatformRequest::new(
            OperationKind::QueryTasks,
            trace_id,
            json!({"taskIds": task_ids, "accountIds": account_ids}),
        );

        let result = self.call_platform(platform, &request).await;
        if !result.success {
            tracing::warn!(
                trace_id,
                %platform,
                code = %result.code,
                "task query failed, listing local data only"
            );
            return Vec::new();
        }
        let tasks = result
            .data
            .as_ref()
            .and_then(|data| data.get("tasks"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tasks).unwrap_or_else(|err| {
            tracing::warn!(trace_id, %platform, error = %err, "malformed task query response");
            Vec::new()
        })
    }

    /// Fill in the media account id learned from a fuzzy match. Only writes
    /// when the order has none yet.
    fn backfill_account(
        &self,
        order: WorkOrder,
        account_id: &str,
        trace_id: &str,
    ) -> Result<WorkOrder, WorkOrderError> {
        if order.media_account_id.is_some() {
            return Ok(order);
        }
        let bundle = self.store.update_bundle(&order.id, |bundle| {
            if bundle.order.media_account_id.is_none() {
                bundle.order.media_account_id = Some(account_id.to_string());
            }
            Ok::<(), WorkOrderError>(())
        })?;
        tracing::info!(
            trace_id,
            work_order_id = %bundle.order.id,
            account_id,
            "backfilled media account id from platform record"
        );
        self.notify(&bundle.order, "account_backfill");
        Ok(bundle.order)
    }
}

fn local_filter(order: &WorkOrder, filter: &ListFilter) -> bool {
    if order.is_deleted {
        return false;
    }
    if order.status == WorkOrderStatus::Failed
        && !filter.include_failed
        && filter.status != Some(WorkOrderStatus::Failed)
    {
        return false;
    }
    filter.platform.is_none_or(|p| order.platform() == p)
        && filter.subtype.is_none_or(|s| order.work_order_subtype == s)
        && filter.status.is_none_or(|s| order.status == s)
}

fn joined_filter(item: &ListedWorkOrder, filter: &ListFilter) -> bool {
    let application = match &item.payload {
        Some(BusinessPayload::Application(app)) => Some(app),
        _ => None,
    };
    let remote = item.remote.as_ref();

    if let Some(company) = filter.company_name.as_deref() {
        let local = application.map(|app| app.company_name.as_str());
        let remote = remote.and_then(|task| task.company_name.as_deref());
        if !contains_ci(local, company) && !contains_ci(remote, company) {
            return false;
        }
    }
    if let Some(license) = filter.license_number.as_deref() {
        let local = application.and_then(|app| app.license_number.as_deref());
        let remote = remote.and_then(|task| task.license_number.as_deref());
        if !contains_ci(local, license) && !contains_ci(remote, license) {
            return false;
        }
    }
    if let Some(allowed) = &filter.account_ids {
        let ids = [
            item.order.media_account_id.as_deref(),
            remote.and_then(|task| task.account_id.as_deref()),
        ];
        if !ids
            .into_iter()
            .flatten()
            .any(|id| allowed.iter().any(|a| a == id))
        {
            return false;
        }
    }
    if let Some(link) = filter.promotion_link.as_deref() {
        let local = application.map(|app| app.promotion_links.as_slice()).unwrap_or_default();
        let remote = remote.map(|task| task.promotion_links.as_slice()).unwrap_or_default();
        if !local.iter().chain(remote).any(|l| l == link) {
            return false;
        }
    }
    true
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_task_accepts_numeric_status() {
        let task: RemoteTask = serde_json::from_value(json!({
            "taskId": "ext-1",
            "status": 20,
            "accountName": "Shoes EU"
        }))
        .unwrap();
        assert_eq!(task.status_code().as_deref(), Some("20"));
        assert!(task.promotion_links.is_empty());
    }

    #[test]
    fn substring_match_ignores_case() {
        assert!(contains_ci(Some("Acme Holdings Ltd"), "acme"));
        assert!(!contains_ci(None, "acme"));
        assert!(!contains_ci(Some("Globex"), "acme"));
    }

    #[test]
    fn filter_defaults_deserialize() {
        let filter: ListFilter = serde_json::from_value(json!({"includeFailed": true})).unwrap();
        assert!(filter.include_failed);
        assert_eq!(filter.page, 0);
        assert!(filter.company_name.is_none());
    }
}
