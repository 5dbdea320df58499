//! Read models for the delegation and approval screens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delegation::{DelegationResolver, DelegationStore};
use crate::domain::authority::ResolvedAuthority;
use crate::domain::delegation::{Delegation, UserId};
use crate::domain::purchase::PurchaseRequest;
use crate::flows::engine::is_actionable;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationView {
    #[serde(flatten)]
    pub delegation: Delegation,
    /// Whether the delegation grants authority at the instant the view was taken.
    pub active_now: bool,
}

impl DelegationView {
    fn at(delegation: Delegation, at: DateTime<Utc>) -> Self {
        let active_now = delegation.is_active_at(at);
        Self { delegation, active_now }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionableRequest {
    pub request: PurchaseRequest,
    pub authority: ResolvedAuthority,
}

pub fn delegations_created_by(
    store: &DelegationStore,
    delegator_id: &UserId,
    at: DateTime<Utc>,
) -> Vec<DelegationView> {
    store.created_by(delegator_id).into_iter().map(|delegation| DelegationView::at(delegation, at)).collect()
}

pub fn delegations_received_by(
    store: &DelegationStore,
    delegate_id: &UserId,
    at: DateTime<Utc>,
) -> Vec<DelegationView> {
    store.received_by(delegate_id).into_iter().map(|delegation| DelegationView::at(delegation, at)).collect()
}

/// Pending requests `user_id` could decide at `at`, oldest first.
pub fn actionable_requests(
    resolver: &DelegationResolver,
    requests: impl IntoIterator<Item = PurchaseRequest>,
    user_id: &UserId,
    at: DateTime<Utc>,
) -> Vec<ActionableRequest> {
    let mut actionable: Vec<ActionableRequest> = requests
        .into_iter()
        .filter(|request| is_actionable(request) && at < request.expires_at)
        .filter_map(|request| {
            resolver
                .resolve_authority(user_id, &request, at)
                .ok()
                .map(|authority| ActionableRequest { request, authority })
        })
        .collect();

    actionable.sort_by(|left, right| {
        left.request
            .created_at
            .cmp(&right.request.created_at)
            .then_with(|| left.request.id.0.cmp(&right.request.id.0))
    });
    actionable
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{actionable_requests, delegations_created_by, delegations_received_by};
    use crate::delegation::{DelegationResolver, DelegationStore};
    use crate::domain::authority::ResolvedAuthority;
    use crate::domain::delegation::{DelegationGrant, DelegationId, DelegationState, UserId};
    use crate::domain::purchase::{
        LineItem, NewPurchaseRequest, PurchaseRequest, PurchaseRequestId, PurchaseStatus,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).single().expect("valid t0")
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_owned())
    }

    fn request(id: &str, approver: &str, total: i64, created_at: DateTime<Utc>) -> PurchaseRequest {
        PurchaseRequest::submit(
            NewPurchaseRequest {
                id: PurchaseRequestId(id.to_owned()),
                requester_id: user("employee"),
                delivery_office: "Paris".to_owned(),
                line_items: vec![LineItem {
                    description: "desk".to_owned(),
                    url: None,
                    amount: Decimal::new(total, 0),
                }],
                justification: "team growth".to_owned(),
                assigned_approver_id: user(approver),
            },
            created_at,
            created_at + Duration::days(7),
        )
        .expect("valid request")
    }

    fn store_with_delegation() -> DelegationStore {
        let store = DelegationStore::new();
        store
            .create(
                DelegationGrant {
                    id: DelegationId("DLG-1".to_owned()),
                    delegator_id: user("manager"),
                    delegate_id: user("deputy"),
                    starts_at: t0(),
                    ends_at: t0() + Duration::days(2),
                    max_amount: Some(Decimal::new(500, 0)),
                    reason: "training".to_owned(),
                },
                t0(),
            )
            .expect("create");
        store
            .transition(&DelegationId("DLG-1".to_owned()), DelegationState::Active, t0())
            .expect("activate");
        store
    }

    #[test]
    fn delegation_views_annotate_current_activity() {
        let store = store_with_delegation();

        let created = delegations_created_by(&store, &user("manager"), t0() + Duration::hours(1));
        assert_eq!(created.len(), 1);
        assert!(created[0].active_now);

        let received = delegations_received_by(&store, &user("deputy"), t0() + Duration::days(3));
        assert_eq!(received.len(), 1);
        assert!(!received[0].active_now, "window has ended even though no timer ran yet");

        assert!(delegations_received_by(&store, &user("manager"), t0()).is_empty());
    }

    #[test]
    fn actionable_requests_combine_own_and_delegated_authority() {
        let resolver = DelegationResolver::new(store_with_delegation());
        let mut decided = request("PR-4", "deputy", 10, t0());
        decided.status = PurchaseStatus::Approved;
        let requests = vec![
            request("PR-3", "manager", 900, t0()),
            request("PR-2", "manager", 400, t0() + Duration::minutes(5)),
            request("PR-1", "deputy", 50, t0() + Duration::minutes(5)),
            request("PR-5", "ceo", 5, t0()),
            decided,
        ];

        let actionable =
            actionable_requests(&resolver, requests, &user("deputy"), t0() + Duration::hours(1));

        let ids: Vec<&str> = actionable.iter().map(|item| item.request.id.0.as_str()).collect();
        assert_eq!(ids, vec!["PR-1", "PR-2"]);
        assert_eq!(actionable[0].authority, ResolvedAuthority::Own);
        assert_eq!(actionable[1].authority.on_behalf_of(), Some(&user("manager")));
    }
}
