use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::delegation::store::DelegationStore;
use crate::domain::authority::{DelegatedAuthority, EffectiveAuthority, ResolvedAuthority};
use crate::domain::delegation::{Delegation, UserId};
use crate::domain::purchase::PurchaseRequest;
use crate::errors::DomainError;

/// Answers "may this user act on this request right now".
///
/// Only single-hop delegation is honoured: a delegate acts for the request's assigned approver
/// and never for someone who delegated to that approver.
#[derive(Clone, Debug)]
pub struct DelegationResolver {
    store: DelegationStore,
}

impl DelegationResolver {
    pub fn new(store: DelegationStore) -> Self {
        Self { store }
    }

    pub fn resolve_authority(
        &self,
        acting_user_id: &UserId,
        request: &PurchaseRequest,
        at: DateTime<Utc>,
    ) -> Result<ResolvedAuthority, DomainError> {
        if acting_user_id == &request.assigned_approver_id {
            return Ok(ResolvedAuthority::Own);
        }

        let received = self.store.received_by(acting_user_id);
        let chosen = select_from_delegator(&received, &request.assigned_approver_id, at);

        match chosen {
            Some(delegation) if delegation.allows_amount(request.total_amount) => {
                Ok(ResolvedAuthority::Delegated {
                    delegator_id: delegation.delegator_id.clone(),
                    delegation_id: delegation.id.clone(),
                    ceiling: delegation.max_amount,
                })
            }
            _ => Err(DomainError::Unauthorized {
                user_id: acting_user_id.0.clone(),
                subject: format!("purchase request `{}`", request.id),
            }),
        }
    }

    pub fn effective_authority(&self, user_id: &UserId, at: DateTime<Utc>) -> EffectiveAuthority {
        let received = self.store.received_by(user_id);

        let delegators: BTreeSet<&UserId> = received
            .iter()
            .filter(|delegation| delegation.is_active_at(at))
            .map(|delegation| &delegation.delegator_id)
            .collect();

        let delegated = delegators
            .into_iter()
            .filter_map(|delegator_id| select_from_delegator(&received, delegator_id, at))
            .map(|delegation| DelegatedAuthority {
                delegator_id: delegation.delegator_id.clone(),
                delegation_id: delegation.id.clone(),
                ceiling: delegation.max_amount,
                valid_until: delegation.ends_at,
            })
            .collect();

        EffectiveAuthority { user_id: user_id.clone(), as_of: at, delegated }
    }
}

/// Picks the active delegation from `delegator_id` with the lowest creation sequence.
/// `received` is already ordered by sequence.
fn select_from_delegator<'a>(
    received: &'a [Delegation],
    delegator_id: &UserId,
    at: DateTime<Utc>,
) -> Option<&'a Delegation> {
    let mut candidates = received
        .iter()
        .filter(|delegation| &delegation.delegator_id == delegator_id && delegation.is_active_at(at));

    let chosen = candidates.next()?;
    let ignored: Vec<&str> = candidates.map(|delegation| delegation.id.0.as_str()).collect();
    if !ignored.is_empty() {
        warn!(
            event_name = "delegation.resolver.inconsistent_state",
            delegator_id = %delegator_id,
            delegate_id = %chosen.delegate_id,
            chosen_delegation_id = %chosen.id,
            ignored_delegation_ids = ?ignored,
            "multiple active delegations from the same delegator; using the earliest"
        );
    }
    Some(chosen)
}
