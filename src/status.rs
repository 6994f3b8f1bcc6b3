//! Work order status, transition gates and the external status lookup table
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderStatus {
    #[n(0)]
    Init,
    #[n(1)]
    Pending,
    #[n(2)]
    Processing,
    #[n(3)]
    Completed,
    #[n(4)]
    Failed,
    #[n(5)]
    Cancelled,
    #[n(6)]
    Returned,
}

/// Status-gated operations of the lifecycle engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Update,
    Approve,
    Reject,
    Resubmit,
    Reconcile,
}

impl WorkOrderStatus {
    pub const ALL: [WorkOrderStatus; 7] = [
        WorkOrderStatus::Init,
        WorkOrderStatus::Pending,
        WorkOrderStatus::Processing,
        WorkOrderStatus::Completed,
        WorkOrderStatus::Failed,
        WorkOrderStatus::Cancelled,
        WorkOrderStatus::Returned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderStatus::Init => "INIT",
            WorkOrderStatus::Pending => "PENDING",
            WorkOrderStatus::Processing => "PROCESSING",
            WorkOrderStatus::Completed => "COMPLETED",
            WorkOrderStatus::Failed => "FAILED",
            WorkOrderStatus::Cancelled => "CANCELLED",
            WorkOrderStatus::Returned => "RETURNED",
        }
    }

    /// States in which the request can still be edited
    pub fn is_modifiable(&self) -> bool {
        matches!(
            self,
            WorkOrderStatus::Init | WorkOrderStatus::Pending | WorkOrderStatus::Returned
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkOrderStatus::Completed | WorkOrderStatus::Failed | WorkOrderStatus::Cancelled
        )
    }

    /// Whether `transition` may start from this status
    pub fn permits(&self, transition: Transition) -> bool {
        match transition {
            Transition::Update => self.is_modifiable(),
            Transition::Approve | Transition::Reject => *self == WorkOrderStatus::Pending,
            Transition::Resubmit => {
                matches!(self, WorkOrderStatus::Failed | WorkOrderStatus::Returned)
            }
            Transition::Reconcile => !self.is_terminal(),
        }
    }
}

impl Transition {
    pub const ALL: [Transition; 5] = [
        Transition::Update,
        Transition::Approve,
        Transition::Reject,
        Transition::Resubmit,
        Transition::Reconcile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Update => "update",
            Transition::Approve => "approve",
            Transition::Reject => "reject",
            Transition::Resubmit => "resubmit",
            Transition::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkOrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkOrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown work order status '{s}'"))
    }
}

/// Result of looking an external status up in the mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStatus {
    Known(WorkOrderStatus),
    /// Code absent from the table, mapped to the safe default
    Unknown,
}

impl ExternalStatus {
    pub fn status(&self) -> WorkOrderStatus {
        match self {
            ExternalStatus::Known(status) => *status,
            ExternalStatus::Unknown => WorkOrderStatus::Pending,
        }
    }
}

// Numeric codes come from the application review flow, labels from task queries.
// Lookups are exact; codes are never interpreted by range or sign.
const EXTERNAL_STATUS_TABLE: &[(&str, WorkOrderStatus)] = &[
    ("10", WorkOrderStatus::Pending),
    ("20", WorkOrderStatus::Completed),
    ("30", WorkOrderStatus::Failed),
    ("40", WorkOrderStatus::Returned),
    ("INIT", WorkOrderStatus::Init),
    ("PENDING", WorkOrderStatus::Pending),
    ("AUDITING", WorkOrderStatus::Pending),
    ("PROCESSING", WorkOrderStatus::Processing),
    ("SUCCESS", WorkOrderStatus::Completed),
    ("COMPLETED", WorkOrderStatus::Completed),
    ("APPROVED", WorkOrderStatus::Completed),
    ("FAILED", WorkOrderStatus::Failed),
    ("REJECTED", WorkOrderStatus::Failed),
    ("CANCELLED", WorkOrderStatus::Cancelled),
    ("RETURNED", WorkOrderStatus::Returned),
];

pub fn map_external_status(code: &str) -> ExternalStatus {
    let code = code.trim();
    EXTERNAL_STATUS_TABLE
        .iter()
        .find(|(external, _)| external.eq_ignore_ascii_case(code))
        .map(|(_, status)| ExternalStatus::Known(*status))
        .unwrap_or(ExternalStatus::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_codes_map_exactly() {
        assert_eq!(map_external_status("10").status(), WorkOrderStatus::Pending);
        assert_eq!(map_external_status("20").status(), WorkOrderStatus::Completed);
        assert_eq!(map_external_status("30").status(), WorkOrderStatus::Failed);
        assert_eq!(map_external_status("40").status(), WorkOrderStatus::Returned);
        // neighbours of known codes are not guessed
        assert_eq!(map_external_status("25"), ExternalStatus::Unknown);
        assert_eq!(map_external_status("-1"), ExternalStatus::Unknown);
    }

    #[test]
    fn labels_are_case_insensitive() {
        assert_eq!(
            map_external_status(" success "),
            ExternalStatus::Known(WorkOrderStatus::Completed)
        );
        assert_eq!(
            map_external_status("Rejected"),
            ExternalStatus::Known(WorkOrderStatus::Failed)
        );
    }

    #[test]
    fn unknown_code_falls_back_to_pending() {
        let mapped = map_external_status("SOMETHING_NEW");
        assert_eq!(mapped, ExternalStatus::Unknown);
        assert_eq!(mapped.status(), WorkOrderStatus::Pending);
    }

    #[test]
    fn modifiable_states() {
        let modifiable: Vec<_> = WorkOrderStatus::ALL
            .into_iter()
            .filter(|s| s.permits(Transition::Update))
            .collect();
        assert_eq!(
            modifiable,
            vec![
                WorkOrderStatus::Init,
                WorkOrderStatus::Pending,
                WorkOrderStatus::Returned
            ]
        );
    }

    #[test]
    fn status_round_trips_through_wire_name() {
        for status in WorkOrderStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkOrderStatus>(), Ok(status));
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::json!(status.as_str()));
        }
    }
}
