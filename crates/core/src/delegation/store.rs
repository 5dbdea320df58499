use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::delegation::{
    Delegation, DelegationGrant, DelegationId, DelegationState, UserId,
};
use crate::errors::DomainError;

/// Result of a store mutation. `changed` is false when the call was a duplicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOutcome {
    pub delegation: Delegation,
    pub changed: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<DelegationId, Delegation>,
    next_sequence: u64,
}

/// Shared record of every delegation grant.
///
/// Lifecycle workflows are the only writers; resolvers read cloned snapshots taken under a
/// single read lock, so a check never observes a transition half-applied.
#[derive(Clone, Debug, Default)]
pub struct DelegationStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl DelegationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        grant: DelegationGrant,
        at: DateTime<Utc>,
    ) -> Result<StoreOutcome, DomainError> {
        validate_grant(&grant)?;

        let mut inner = self.write();
        if let Some(existing) = inner.records.get(&grant.id) {
            if grant.has_same_terms(existing) {
                return Ok(StoreOutcome { delegation: existing.clone(), changed: false });
            }
            return Err(DomainError::InvalidDelegation(format!(
                "delegation `{}` already exists with different terms",
                grant.id
            )));
        }

        if let Some(conflicting) = find_overlap(
            &inner.records,
            &grant.delegator_id,
            &grant.delegate_id,
            grant.starts_at,
            grant.ends_at,
            None,
        ) {
            return Err(DomainError::InvalidDelegation(format!(
                "window overlaps open delegation `{}` between the same users",
                conflicting.id
            )));
        }

        inner.next_sequence += 1;
        let delegation = Delegation {
            id: grant.id,
            sequence: inner.next_sequence,
            delegator_id: grant.delegator_id,
            delegate_id: grant.delegate_id,
            starts_at: grant.starts_at,
            ends_at: grant.ends_at,
            max_amount: grant.max_amount,
            reason: grant.reason,
            state: DelegationState::PendingActivation,
            revoked_by: None,
            revocation_reason: None,
            state_version: 1,
            created_at: at,
            updated_at: at,
        };
        inner.records.insert(delegation.id.clone(), delegation.clone());

        Ok(StoreOutcome { delegation, changed: true })
    }

    /// Moves a delegation along the lifecycle graph. Re-applying the current state is a no-op.
    pub fn transition(
        &self,
        id: &DelegationId,
        to: DelegationState,
        at: DateTime<Utc>,
    ) -> Result<StoreOutcome, DomainError> {
        self.mutate(id, at, |record, _| {
            if record.state == to {
                return Ok(false);
            }
            if !record.state.can_transition_to(to) {
                return Err(illegal(record, to));
            }
            match to {
                DelegationState::Active if !record.covers(at) => {
                    return Err(DomainError::IllegalTransition {
                        subject: format!("delegation `{}`", record.id),
                        from: record.state.as_str().to_owned(),
                        to: format!("{} outside its validity window at {at}", to.as_str()),
                    });
                }
                DelegationState::Expired if at < record.ends_at => {
                    return Err(DomainError::IllegalTransition {
                        subject: format!("delegation `{}`", record.id),
                        from: record.state.as_str().to_owned(),
                        to: format!("{} before its end at {at}", to.as_str()),
                    });
                }
                _ => {}
            }
            record.state = to;
            Ok(true)
        })
    }

    pub fn revoke(
        &self,
        id: &DelegationId,
        revoked_by: &UserId,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<StoreOutcome, DomainError> {
        self.mutate(id, at, |record, _| {
            if record.state == DelegationState::Revoked {
                return Ok(false);
            }
            if !record.state.can_transition_to(DelegationState::Revoked) {
                return Err(illegal(record, DelegationState::Revoked));
            }
            record.state = DelegationState::Revoked;
            record.revoked_by = Some(revoked_by.clone());
            record.revocation_reason = reason;
            Ok(true)
        })
    }

    pub fn extend(
        &self,
        id: &DelegationId,
        ends_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<StoreOutcome, DomainError> {
        self.mutate(id, at, |record, records| {
            ensure_open(record)?;
            if record.ends_at == ends_at {
                return Ok(false);
            }
            if ends_at <= record.starts_at {
                return Err(DomainError::InvalidDelegation(
                    "validity end must be after its start".to_owned(),
                ));
            }
            if ends_at <= at {
                return Err(DomainError::InvalidDelegation(
                    "validity end must be in the future".to_owned(),
                ));
            }
            if let Some(conflicting) = find_overlap(
                records,
                &record.delegator_id,
                &record.delegate_id,
                record.starts_at,
                ends_at,
                Some(&record.id),
            ) {
                return Err(DomainError::InvalidDelegation(format!(
                    "extended window overlaps open delegation `{}` between the same users",
                    conflicting.id
                )));
            }
            record.ends_at = ends_at;
            Ok(true)
        })
    }

    pub fn set_max_amount(
        &self,
        id: &DelegationId,
        max_amount: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<StoreOutcome, DomainError> {
        self.mutate(id, at, |record, _| {
            ensure_open(record)?;
            if record.max_amount == max_amount {
                return Ok(false);
            }
            if max_amount.is_some_and(|amount| amount < Decimal::ZERO) {
                return Err(DomainError::InvalidDelegation(
                    "maximum approvable amount must not be negative".to_owned(),
                ));
            }
            record.max_amount = max_amount;
            Ok(true)
        })
    }

    pub fn get(&self, id: &DelegationId) -> Result<Delegation, DomainError> {
        self.read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("delegation", id.0.clone()))
    }

    pub fn created_by(&self, delegator_id: &UserId) -> Vec<Delegation> {
        self.filtered(|record| &record.delegator_id == delegator_id)
    }

    pub fn received_by(&self, delegate_id: &UserId) -> Vec<Delegation> {
        self.filtered(|record| &record.delegate_id == delegate_id)
    }

    pub fn all(&self) -> Vec<Delegation> {
        self.filtered(|_| true)
    }

    /// Reinstates a journaled record. A newer `state_version` already in memory wins.
    pub fn restore(&self, record: Delegation) {
        let mut inner = self.write();
        inner.next_sequence = inner.next_sequence.max(record.sequence);
        match inner.records.get(&record.id) {
            Some(current) if current.state_version >= record.state_version => {}
            _ => {
                inner.records.insert(record.id.clone(), record);
            }
        }
    }

    /// Drops a record whose creating step was never journaled.
    pub fn discard(&self, id: &DelegationId) -> Option<Delegation> {
        self.write().records.remove(id)
    }

    /// Puts back the last journaled version of a record, replacing newer unjournaled edits.
    pub fn reinstate(&self, record: Delegation) {
        self.write().records.insert(record.id.clone(), record);
    }

    fn filtered(&self, predicate: impl Fn(&Delegation) -> bool) -> Vec<Delegation> {
        let inner = self.read();
        let mut records: Vec<Delegation> =
            inner.records.values().filter(|record| predicate(record)).cloned().collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    fn mutate(
        &self,
        id: &DelegationId,
        at: DateTime<Utc>,
        apply: impl FnOnce(&mut Delegation, &BTreeMap<DelegationId, Delegation>) -> Result<bool, DomainError>,
    ) -> Result<StoreOutcome, DomainError> {
        let mut inner = self.write();
        let mut candidate = inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("delegation", id.0.clone()))?;

        let changed = apply(&mut candidate, &inner.records)?;
        if changed {
            candidate.state_version += 1;
            candidate.updated_at = at;
            inner.records.insert(candidate.id.clone(), candidate.clone());
        }

        Ok(StoreOutcome { delegation: candidate, changed })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn validate_grant(grant: &DelegationGrant) -> Result<(), DomainError> {
    if grant.id.0.trim().is_empty() {
        return Err(DomainError::InvalidDelegation("delegation id must not be blank".to_owned()));
    }
    if grant.starts_at >= grant.ends_at {
        return Err(DomainError::InvalidDelegation(
            "validity start must be before validity end".to_owned(),
        ));
    }
    if grant.max_amount.is_some_and(|amount| amount < Decimal::ZERO) {
        return Err(DomainError::InvalidDelegation(
            "maximum approvable amount must not be negative".to_owned(),
        ));
    }
    if grant.delegator_id == grant.delegate_id {
        return Err(DomainError::InvalidDelegation("cannot delegate to yourself".to_owned()));
    }
    Ok(())
}

fn find_overlap<'a>(
    records: &'a BTreeMap<DelegationId, Delegation>,
    delegator_id: &UserId,
    delegate_id: &UserId,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    skip: Option<&DelegationId>,
) -> Option<&'a Delegation> {
    records.values().find(|record| {
        Some(&record.id) != skip
            && !record.state.is_terminal()
            && &record.delegator_id == delegator_id
            && &record.delegate_id == delegate_id
            && record.overlaps(starts_at, ends_at)
    })
}

fn ensure_open(record: &Delegation) -> Result<(), DomainError> {
    if record.state.is_terminal() {
        return Err(DomainError::AlreadyFinal {
            subject: format!("delegation `{}`", record.id),
            state: record.state.as_str().to_owned(),
        });
    }
    Ok(())
}

fn illegal(record: &Delegation, to: DelegationState) -> DomainError {
    DomainError::IllegalTransition {
        subject: format!("delegation `{}`", record.id),
        from: record.state.as_str().to_owned(),
        to: to.as_str().to_owned(),
    }
}
