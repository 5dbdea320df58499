use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DelegationId(pub String);

impl std::fmt::Display for DelegationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    PendingActivation,
    Active,
    Expired,
    Revoked,
}

impl DelegationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingActivation => "pending_activation",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }

    /// Edges of the delegation lifecycle graph. Self-loops are handled by callers as no-ops.
    pub fn can_transition_to(&self, next: DelegationState) -> bool {
        matches!(
            (self, next),
            (Self::PendingActivation, Self::Active)
                | (Self::PendingActivation, Self::Revoked)
                | (Self::Active, Self::Expired)
                | (Self::Active, Self::Revoked)
        )
    }
}

/// A delegation creation request as received from the web layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    pub id: DelegationId,
    pub delegator_id: UserId,
    pub delegate_id: UserId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub max_amount: Option<Decimal>,
    pub reason: String,
}

impl DelegationGrant {
    pub fn has_same_terms(&self, record: &Delegation) -> bool {
        self.delegator_id == record.delegator_id
            && self.delegate_id == record.delegate_id
            && self.starts_at == record.starts_at
            && self.ends_at == record.ends_at
            && self.max_amount == record.max_amount
            && self.reason == record.reason
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    /// Monotonic creation order, used to break ties deterministically.
    pub sequence: u64,
    pub delegator_id: UserId,
    pub delegate_id: UserId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub max_amount: Option<Decimal>,
    pub reason: String,
    pub state: DelegationState,
    pub revoked_by: Option<UserId>,
    pub revocation_reason: Option<String>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delegation {
    /// Half-open validity window `[starts_at, ends_at)`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at < self.ends_at
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.state == DelegationState::Active && self.covers(at)
    }

    pub fn allows_amount(&self, amount: Decimal) -> bool {
        self.max_amount.map_or(true, |ceiling| ceiling >= amount)
    }

    pub fn overlaps(&self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> bool {
        self.starts_at < ends_at && starts_at < self.ends_at
    }
}
