//! Per-subtype operation definitions: business payload shapes, validation and the
//! platform request each one builds.
use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::OperationKind;
use crate::error::{FieldErrors, WorkOrderError};
use crate::types::{Platform, WorkOrderSubtype, WorkOrderType};

/// Whether creating the order sends it to the platform straight away, or
/// waits for an operator to approve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Immediate,
    Reviewed,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationData {
    #[n(0)]
    pub account_name: String,
    #[n(1)]
    pub company_name: String,
    #[n(2)]
    #[serde(default)]
    pub license_number: Option<String>,
    #[n(3)]
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[n(4)]
    pub currency: String,
    #[n(5)]
    #[serde(default)]
    pub promotion_links: Vec<String>,
    #[n(6)]
    #[serde(default)]
    pub daily_budget: Option<String>,
}

fn default_timezone() -> String {
    "UTC".into()
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FundsData {
    #[n(0)]
    pub amount: String,
    #[n(1)]
    pub currency: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferData {
    #[n(0)]
    pub source_account_id: String,
    #[n(1)]
    pub target_account_id: String,
    #[n(2)]
    pub amount: String,
    #[n(3)]
    pub currency: String,
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingKind {
    /// Manager (MCC) account
    #[n(0)]
    Account,
    #[n(1)]
    Email,
    #[n(2)]
    Pixel,
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingAction {
    #[n(0)]
    Bind,
    #[n(1)]
    Unbind,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingData {
    #[n(0)]
    pub kind: BindingKind,
    #[n(1)]
    pub action: BindingAction,
    #[n(2)]
    pub value: String,
    #[n(3)]
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZeroingData {
    #[n(0)]
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenameData {
    #[n(0)]
    pub new_name: String,
}

/// Operation-specific fields of a work order, one variant per operation kind
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum BusinessPayload {
    #[n(0)]
    Application(#[n(0)] ApplicationData),
    #[n(1)]
    Deposit(#[n(0)] FundsData),
    #[n(2)]
    Withdrawal(#[n(0)] FundsData),
    #[n(3)]
    Transfer(#[n(0)] TransferData),
    #[n(4)]
    Binding(#[n(0)] BindingData),
    #[n(5)]
    Zeroing(#[n(0)] ZeroingData),
    #[n(6)]
    Rename(#[n(0)] RenameData),
}

/// Caller input for a new work order
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkOrder {
    pub platform: Platform,
    #[serde(default)]
    pub media_account_id: Option<String>,
    pub payload: BusinessPayload,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl NewWorkOrder {
    pub fn new(platform: Platform, media_account_id: Option<&str>, payload: BusinessPayload) -> Self {
        Self {
            platform,
            media_account_id: media_account_id.map(str::to_string),
            payload,
            remark: None,
            priority: 0,
            extra: BTreeMap::new(),
        }
    }
}

impl BusinessPayload {
    pub fn work_order_type(&self) -> WorkOrderType {
        match self {
            BusinessPayload::Application(_) => WorkOrderType::AccountApplication,
            BusinessPayload::Deposit(_)
            | BusinessPayload::Withdrawal(_)
            | BusinessPayload::Transfer(_) => WorkOrderType::Payment,
            BusinessPayload::Binding(_) => WorkOrderType::AttachmentManagement,
            BusinessPayload::Zeroing(_) | BusinessPayload::Rename(_) => {
                WorkOrderType::AccountManagement
            }
        }
    }

    pub fn subtype(&self, platform: Platform) -> WorkOrderSubtype {
        match self {
            BusinessPayload::Application(_) => match platform {
                Platform::Facebook => WorkOrderSubtype::FacebookAccount,
                Platform::Google => WorkOrderSubtype::GoogleAccount,
                Platform::TikTok => WorkOrderSubtype::TiktokAccount,
            },
            BusinessPayload::Deposit(_) => WorkOrderSubtype::Deposit,
            BusinessPayload::Withdrawal(_) => WorkOrderSubtype::Withdrawal,
            BusinessPayload::Transfer(_) => WorkOrderSubtype::Transfer,
            BusinessPayload::Binding(b) => match (b.kind, b.action) {
                (BindingKind::Account, BindingAction::Bind) => WorkOrderSubtype::BindAccount,
                (BindingKind::Account, BindingAction::Unbind) => WorkOrderSubtype::UnbindAccount,
                (BindingKind::Email, BindingAction::Bind) => WorkOrderSubtype::BindEmail,
                (BindingKind::Email, BindingAction::Unbind) => WorkOrderSubtype::UnbindEmail,
                (BindingKind::Pixel, BindingAction::Bind) => WorkOrderSubtype::BindPixel,
                (BindingKind::Pixel, BindingAction::Unbind) => WorkOrderSubtype::UnbindPixel,
            },
            BusinessPayload::Zeroing(_) => WorkOrderSubtype::Zeroing,
            BusinessPayload::Rename(_) => WorkOrderSubtype::AccountNameUpdate,
        }
    }

    /// Platform operation that submits this payload
    pub fn operation(&self) -> OperationKind {
        match self {
            BusinessPayload::Application(_) => OperationKind::Apply,
            BusinessPayload::Deposit(_) => OperationKind::Deposit,
            BusinessPayload::Withdrawal(_) => OperationKind::Withdrawal,
            BusinessPayload::Transfer(_) => OperationKind::Transfer,
            BusinessPayload::Binding(b) => match (b.kind, b.action) {
                (BindingKind::Account, BindingAction::Bind) => OperationKind::BindAccount,
                (BindingKind::Account, BindingAction::Unbind) => OperationKind::UnbindAccount,
                (BindingKind::Email, BindingAction::Bind) => OperationKind::BindEmail,
                (BindingKind::Email, BindingAction::Unbind) => OperationKind::UnbindEmail,
                (BindingKind::Pixel, BindingAction::Bind) => OperationKind::BindPixel,
                (BindingKind::Pixel, BindingAction::Unbind) => OperationKind::UnbindPixel,
            },
            BusinessPayload::Zeroing(_) => OperationKind::Zeroing,
            BusinessPayload::Rename(_) => OperationKind::Rename,
        }
    }

    pub fn submission(&self) -> Submission {
        match self {
            BusinessPayload::Withdrawal(_)
            | BusinessPayload::Transfer(_)
            | BusinessPayload::Zeroing(_) => Submission::Reviewed,
            _ => Submission::Immediate,
        }
    }

    /// Check and normalize the payload. All field problems are reported
    /// together rather than stopping at the first one.
    pub fn validate(
        &self,
        platform: Platform,
        media_account_id: Option<&str>,
    ) -> Result<BusinessPayload, WorkOrderError> {
        let mut errors = FieldErrors::new();

        let needs_account = !matches!(self, BusinessPayload::Application(_));
        if needs_account && media_account_id.is_none_or(|id| id.trim().is_empty()) {
            errors.insert("mediaAccountId".into(), "is required".into());
        }

        let normalized = match self {
            BusinessPayload::Application(app) => {
                let mut app = app.clone();
                require_text(&mut errors, "accountName", &app.account_name, 100);
                require_text(&mut errors, "companyName", &app.company_name, 200);
                app.currency = check_currency(&mut errors, "currency", &app.currency);
                if app.promotion_links.is_empty() {
                    errors.insert("promotionLinks".into(), "at least one link is required".into());
                }
                if let Some(bad) = app
                    .promotion_links
                    .iter()
                    .find(|link| !(link.starts_with("https://") || link.starts_with("http://")))
                {
                    errors.insert("promotionLinks".into(), format!("'{bad}' is not an http(s) url"));
                }
                if let Some(budget) = app.daily_budget.take() {
                    app.daily_budget = Some(check_amount(&mut errors, "dailyBudget", &budget));
                }
                if app.timezone.trim().is_empty() {
                    app.timezone = default_timezone();
                }
                BusinessPayload::Application(app)
            }
            BusinessPayload::Deposit(funds) => BusinessPayload::Deposit(check_funds(&mut errors, funds)),
            BusinessPayload::Withdrawal(funds) => {
                BusinessPayload::Withdrawal(check_funds(&mut errors, funds))
            }
            BusinessPayload::Transfer(transfer) => {
                let mut transfer = transfer.clone();
                require_text(&mut errors, "sourceAccountId", &transfer.source_account_id, 64);
                require_text(&mut errors, "targetAccountId", &transfer.target_account_id, 64);
                if !transfer.source_account_id.is_empty()
                    && transfer.source_account_id.trim() == transfer.target_account_id.trim()
                {
                    errors.insert(
                        "targetAccountId".into(),
                        "must differ from the source account".into(),
                    );
                }
                transfer.amount = check_amount(&mut errors, "amount", &transfer.amount);
                transfer.currency = check_currency(&mut errors, "currency", &transfer.currency);
                BusinessPayload::Transfer(transfer)
            }
            BusinessPayload::Binding(binding) => {
                let mut binding = binding.clone();
                binding.value = binding.value.trim().to_string();
                check_binding(&mut errors, platform, &binding);
                BusinessPayload::Binding(binding)
            }
            BusinessPayload::Zeroing(zeroing) => BusinessPayload::Zeroing(zeroing.clone()),
            BusinessPayload::Rename(rename) => {
                require_text(&mut errors, "newName", &rename.new_name, 100);
                BusinessPayload::Rename(RenameData {
                    new_name: rename.new_name.trim().to_string(),
                })
            }
        };

        if errors.is_empty() {
            Ok(normalized)
        } else {
            Err(WorkOrderError::validation("Input failed validation", errors))
        }
    }

    /// Fields sent to the platform, without the local `operation` tag
    pub fn platform_fields(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("operation");
        }
        value
    }

    /// Apply a partial JSON patch and return the patched payload. The
    /// operation kind cannot be changed by a patch.
    pub fn patched(&self, patch: &Value) -> Result<BusinessPayload, WorkOrderError> {
        let Value::Object(fields) = patch else {
            return Err(WorkOrderError::field("patch", "must be a JSON object"));
        };
        if fields.contains_key("operation") {
            return Err(WorkOrderError::field("operation", "cannot be changed"));
        }
        let mut value = serde_json::to_value(self)
            .map_err(|e| WorkOrderError::system(format!("payload serialization: {e}")))?;
        crate::utils::merge_json(&mut value, patch.clone());
        serde_json::from_value(value).map_err(|e| WorkOrderError::field("patch", e.to_string()))
    }

    /// (account name, company name) used to match remote records that have
    /// not been correlated by task id yet
    pub fn application_names(&self) -> Option<(&str, &str)> {
        match self {
            BusinessPayload::Application(app) => {
                Some((app.account_name.as_str(), app.company_name.as_str()))
            }
            _ => None,
        }
    }
}

fn require_text(errors: &mut FieldErrors, field: &str, value: &str, max_len: usize) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        errors.insert(field.into(), "is required".into());
    } else if trimmed.chars().count() > max_len {
        errors.insert(field.into(), format!("must be at most {max_len} characters"));
    }
}

fn check_amount(errors: &mut FieldErrors, field: &str, raw: &str) -> String {
    match Decimal::from_str(raw.trim()) {
        Ok(amount) if amount <= Decimal::ZERO => {
            errors.insert(field.into(), "must be greater than zero".into());
            raw.to_string()
        }
        Ok(amount) if amount.normalize().scale() > 2 => {
            errors.insert(field.into(), "must have at most two decimal places".into());
            raw.to_string()
        }
        Ok(amount) => amount.normalize().to_string(),
        Err(_) => {
            errors.insert(field.into(), format!("'{raw}' is not a decimal amount"));
            raw.to_string()
        }
    }
}

fn check_currency(errors: &mut FieldErrors, field: &str, raw: &str) -> String {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        errors.insert(field.into(), "must be a three letter currency code".into());
    }
    code
}

fn check_funds(errors: &mut FieldErrors, funds: &FundsData) -> FundsData {
    FundsData {
        amount: check_amount(errors, "amount", &funds.amount),
        currency: check_currency(errors, "currency", &funds.currency),
    }
}

fn check_binding(errors: &mut FieldErrors, platform: Platform, binding: &BindingData) {
    let value = binding.value.as_str();
    if value.is_empty() {
        errors.insert("value".into(), "is required".into());
        return;
    }
    match binding.kind {
        BindingKind::Account => {
            if platform != Platform::Google {
                errors.insert("kind".into(), "manager accounts exist on google only".into());
            }
            let digits: String = value.chars().filter(|c| *c != '-').collect();
            if digits.len() != 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
                errors.insert("value".into(), "must be a 10 digit manager account id".into());
            }
        }
        BindingKind::Email => {
            let valid = value
                .split_once('@')
                .is_some_and(|(user, domain)| !user.is_empty() && domain.contains('.'));
            if !valid {
                errors.insert("value".into(), "must be an email address".into());
            }
        }
        BindingKind::Pixel => {
            if platform == Platform::Google {
                errors.insert("kind".into(), "pixels are not supported on google".into());
            }
            if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
                errors.insert("value".into(), "must be an alphanumeric pixel id".into());
            }
        }
    }
    if binding.role.as_deref().is_some_and(|role| role.trim().is_empty()) {
        errors.insert("role".into(), "must not be blank".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deposit(amount: &str) -> BusinessPayload {
        BusinessPayload::Deposit(FundsData {
            amount: amount.into(),
            currency: "usd".into(),
        })
    }

    #[test]
    fn deposit_amount_is_normalized() {
        let validated = deposit("100.00").validate(Platform::Facebook, Some("acc-1")).unwrap();
        assert_eq!(
            validated,
            BusinessPayload::Deposit(FundsData {
                amount: "100".into(),
                currency: "USD".into()
            })
        );
    }

    #[test]
    fn invalid_amounts_are_reported_per_field() {
        for bad in ["0", "-5", "abc", "1.234"] {
            let err = deposit(bad).validate(Platform::Google, Some("acc-1")).unwrap_err();
            let fields = err.field_errors().expect("field errors");
            assert!(fields.contains_key("amount"), "amount {bad} accepted");
        }
    }

    #[test]
    fn account_is_required_outside_applications() {
        let err = deposit("10").validate(Platform::TikTok, None).unwrap_err();
        assert!(err.field_errors().unwrap().contains_key("mediaAccountId"));
    }

    #[test]
    fn transfer_rejects_same_account() {
        let payload = BusinessPayload::Transfer(TransferData {
            source_account_id: "acc-1".into(),
            target_account_id: "acc-1".into(),
            amount: "5".into(),
            currency: "USD".into(),
        });
        let err = payload.validate(Platform::Facebook, Some("acc-1")).unwrap_err();
        assert!(err.field_errors().unwrap().contains_key("targetAccountId"));
    }

    #[test]
    fn bindings_are_platform_aware() {
        let mcc = BusinessPayload::Binding(BindingData {
            kind: BindingKind::Account,
            action: BindingAction::Bind,
            value: "123-456-7890".into(),
            role: None,
        });
        assert!(mcc.validate(Platform::Google, Some("acc-1")).is_ok());
        assert!(mcc.validate(Platform::Facebook, Some("acc-1")).is_err());
        assert_eq!(mcc.subtype(Platform::Google), WorkOrderSubtype::BindAccount);

        let email = BusinessPayload::Binding(BindingData {
            kind: BindingKind::Email,
            action: BindingAction::Unbind,
            value: "not-an-email".into(),
            role: Some("ADMIN".into()),
        });
        assert!(email.validate(Platform::Facebook, Some("acc-1")).is_err());
        assert_eq!(email.subtype(Platform::Facebook), WorkOrderSubtype::UnbindEmail);
    }

    #[test]
    fn application_subtype_follows_platform() {
        let app = BusinessPayload::Application(ApplicationData {
            account_name: "Shoes EU".into(),
            company_name: "Acme Ltd".into(),
            license_number: Some("LIC-1".into()),
            timezone: String::new(),
            currency: "eur".into(),
            promotion_links: vec!["https://acme.example".into()],
            daily_budget: Some("50".into()),
        });
        assert_eq!(app.subtype(Platform::TikTok), WorkOrderSubtype::TiktokAccount);
        let BusinessPayload::Application(validated) = app.validate(Platform::TikTok, None).unwrap()
        else {
            panic!("variant changed");
        };
        assert_eq!(validated.timezone, "UTC");
        assert_eq!(validated.currency, "EUR");
    }

    #[test]
    fn reviewed_operations() {
        assert_eq!(deposit("1").submission(), Submission::Immediate);
        let zeroing = BusinessPayload::Zeroing(ZeroingData { reason: None });
        assert_eq!(zeroing.submission(), Submission::Reviewed);
    }

    #[test]
    fn patch_merges_fields_and_keeps_operation() {
        let patched = deposit("10").patched(&json!({"amount": "25"})).unwrap();
        assert_eq!(
            patched,
            BusinessPayload::Deposit(FundsData {
                amount: "25".into(),
                currency: "usd".into()
            })
        );
        assert!(deposit("10").patched(&json!({"operation": "withdrawal"})).is_err());
        assert!(deposit("10").patched(&json!(["amount"])).is_err());
    }

    #[test]
    fn platform_fields_drop_the_tag() {
        let fields = deposit("10").platform_fields();
        assert_eq!(fields, json!({"amount": "10", "currency": "usd"}));
    }

    #[test]
    fn payload_json_is_tagged() {
        let parsed: BusinessPayload =
            serde_json::from_value(json!({"operation": "rename", "newName": "Brand X"})).unwrap();
        assert_eq!(
            parsed,
            BusinessPayload::Rename(RenameData {
                new_name: "Brand X".into()
            })
        );
    }

    fn every_variant() -> Vec<BusinessPayload> {
        vec![
            BusinessPayload::Application(ApplicationData {
                account_name: "Shoes EU".into(),
                company_name: "Acme Ltd".into(),
                license_number: None,
                timezone: "UTC".into(),
                currency: "EUR".into(),
                promotion_links: vec![],
                daily_budget: None,
            }),
            deposit("10"),
            BusinessPayload::Withdrawal(FundsData {
                amount: "3".into(),
                currency: "USD".into(),
            }),
            BusinessPayload::Transfer(TransferData {
                source_account_id: "acc-1".into(),
                target_account_id: "acc-2".into(),
                amount: "5".into(),
                currency: "USD".into(),
            }),
            BusinessPayload::Binding(BindingData {
                kind: BindingKind::Email,
                action: BindingAction::Bind,
                value: "ops@acme.example".into(),
                role: Some("ADMIN".into()),
            }),
            BusinessPayload::Zeroing(ZeroingData {
                reason: Some("closing".into()),
            }),
            BusinessPayload::Rename(RenameData {
                new_name: "Brand X".into(),
            }),
        ]
    }

    #[test]
    fn every_variant_reads_back_its_own_json() {
        for payload in every_variant() {
            let value = serde_json::to_value(&payload).unwrap();
            let parsed: BusinessPayload = serde_json::from_value(value.clone())
                .unwrap_or_else(|e| panic!("{value} did not parse: {e}"));
            assert_eq!(parsed, payload);

            let input = NewWorkOrder::new(Platform::Facebook, Some("acc-1"), payload);
            let text = serde_json::to_string(&input).unwrap();
            assert_eq!(serde_json::from_str::<NewWorkOrder>(&text).unwrap(), input);
        }
    }

    #[test]
    fn binding_json_keeps_operation_and_kind_apart() {
        let parsed: BusinessPayload = serde_json::from_value(json!({
            "operation": "binding",
            "kind": "PIXEL",
            "action": "UNBIND",
            "value": "px-1"
        }))
        .unwrap();
        assert_eq!(parsed.subtype(Platform::TikTok), WorkOrderSubtype::UnbindPixel);

        let fields = parsed.platform_fields();
        assert_eq!(fields["kind"], "PIXEL");
        assert!(fields.get("operation").is_none());

        let patched = parsed.patched(&json!({"value": "px-2"})).unwrap();
        let BusinessPayload::Binding(binding) = patched else {
            panic!("variant changed");
        };
        assert_eq!(binding.kind, BindingKind::Pixel);
        assert_eq!(binding.value, "px-2");
    }
}
