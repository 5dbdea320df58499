use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::authority::ResolvedAuthority;
use crate::domain::delegation::UserId;
use crate::domain::purchase::{PurchaseRequestId, PurchaseStatus};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PurchaseEvent {
    Approve { actor_id: UserId, at: DateTime<Utc> },
    Reject { actor_id: UserId, at: DateTime<Utc>, reason: Option<String> },
    Expire { at: DateTime<Utc> },
    Cancel { at: DateTime<Utc> },
}

impl PurchaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Expire { .. } => "expire",
            Self::Cancel { .. } => "cancel",
        }
    }

    pub fn target(&self) -> PurchaseStatus {
        match self {
            Self::Approve { .. } => PurchaseStatus::Approved,
            Self::Reject { .. } => PurchaseStatus::Rejected,
            Self::Expire { .. } => PurchaseStatus::Expired,
            Self::Cancel { .. } => PurchaseStatus::Cancelled,
        }
    }

    pub fn actor(&self) -> Option<&UserId> {
        match self {
            Self::Approve { actor_id, .. } | Self::Reject { actor_id, .. } => Some(actor_id),
            Self::Expire { .. } | Self::Cancel { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub request_id: PurchaseRequestId,
    pub from: PurchaseStatus,
    pub to: PurchaseStatus,
    pub authority: Option<ResolvedAuthority>,
    pub at: DateTime<Utc>,
}
