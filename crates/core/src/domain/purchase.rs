use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::authority::ResolvedAuthority;
use crate::domain::delegation::UserId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PurchaseRequestId(pub String);

impl std::fmt::Display for PurchaseRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    PendingApproval,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingApproval)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub url: Option<String>,
    pub amount: Decimal,
}

/// Submission payload for a purchase request. The total is derived, never supplied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseRequest {
    pub id: PurchaseRequestId,
    pub requester_id: UserId,
    pub delivery_office: String,
    pub line_items: Vec<LineItem>,
    pub justification: String,
    pub assigned_approver_id: UserId,
}

/// Recorded once, when the request reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    pub status: PurchaseStatus,
    pub actor_id: Option<UserId>,
    pub authority: Option<ResolvedAuthority>,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub id: PurchaseRequestId,
    pub requester_id: UserId,
    pub delivery_office: String,
    pub line_items: Vec<LineItem>,
    pub total_amount: Decimal,
    pub justification: String,
    pub assigned_approver_id: UserId,
    pub status: PurchaseStatus,
    pub disposition: Option<Disposition>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PurchaseRequest {
    pub fn submit(
        input: NewPurchaseRequest,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if input.id.0.trim().is_empty() {
            return Err(DomainError::InvalidRequest("request id must not be blank".to_owned()));
        }
        if input.requester_id.0.trim().is_empty() || input.assigned_approver_id.0.trim().is_empty()
        {
            return Err(DomainError::InvalidRequest(
                "requester and assigned approver are required".to_owned(),
            ));
        }
        if input.line_items.is_empty() {
            return Err(DomainError::InvalidRequest(
                "a purchase request needs at least one line item".to_owned(),
            ));
        }
        if let Some(item) = input.line_items.iter().find(|item| item.amount < Decimal::ZERO) {
            return Err(DomainError::InvalidRequest(format!(
                "line item `{}` has a negative amount {}",
                item.description, item.amount
            )));
        }
        if expires_at <= created_at {
            return Err(DomainError::InvalidRequest(
                "approval deadline must be after submission".to_owned(),
            ));
        }

        let total_amount = line_total(&input.line_items);
        Ok(Self {
            id: input.id,
            requester_id: input.requester_id,
            delivery_office: input.delivery_office,
            line_items: input.line_items,
            total_amount,
            justification: input.justification,
            assigned_approver_id: input.assigned_approver_id,
            status: PurchaseStatus::PendingApproval,
            disposition: None,
            created_at,
            expires_at,
            updated_at: created_at,
        })
    }
}

fn line_total(items: &[LineItem]) -> Decimal {
    items.iter().map(|item| item.amount).sum()
}
