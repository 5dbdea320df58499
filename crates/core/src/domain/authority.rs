use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::delegation::{DelegationId, UserId};

/// The authority under which a decision on a purchase request was taken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedAuthority {
    Own,
    Delegated { delegator_id: UserId, delegation_id: DelegationId, ceiling: Option<Decimal> },
}

impl ResolvedAuthority {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Own => "own",
            Self::Delegated { .. } => "delegated",
        }
    }

    pub fn on_behalf_of(&self) -> Option<&UserId> {
        match self {
            Self::Own => None,
            Self::Delegated { delegator_id, .. } => Some(delegator_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedAuthority {
    pub delegator_id: UserId,
    pub delegation_id: DelegationId,
    pub ceiling: Option<Decimal>,
    pub valid_until: DateTime<Utc>,
}

/// Approval rights a user holds at one instant. Derived on demand and never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveAuthority {
    pub user_id: UserId,
    pub as_of: DateTime<Utc>,
    pub delegated: Vec<DelegatedAuthority>,
}

impl EffectiveAuthority {
    /// Returns the delegated entry that lets this user act for `approver` on `amount`.
    pub fn delegated_for(&self, approver: &UserId, amount: Decimal) -> Option<&DelegatedAuthority> {
        self.delegated.iter().find(|entry| {
            &entry.delegator_id == approver && entry.ceiling.map_or(true, |ceiling| ceiling >= amount)
        })
    }

    pub fn can_act_for(&self, approver: &UserId, amount: Decimal) -> bool {
        &self.user_id == approver || self.delegated_for(approver, amount).is_some()
    }
}
