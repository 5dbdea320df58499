use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome};
use crate::delegation::StoreOutcome;
use crate::domain::delegation::{Delegation, DelegationGrant, DelegationState, UserId};
use crate::errors::DomainError;
use crate::workflow::{DurableWorkflow, InstanceId, Step, WorkflowContext};

/// Requests a delegator may send to one of their delegations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelegationSignal {
    Revoke { requested_by: UserId, reason: Option<String> },
    Extend { requested_by: UserId, ends_at: DateTime<Utc> },
    AdjustCeiling { requested_by: UserId, max_amount: Option<Decimal> },
}

impl DelegationSignal {
    pub fn requested_by(&self) -> &UserId {
        match self {
            Self::Revoke { requested_by, .. }
            | Self::Extend { requested_by, .. }
            | Self::AdjustCeiling { requested_by, .. } => requested_by,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Revoke { .. } => "revoke",
            Self::Extend { .. } => "extend",
            Self::AdjustCeiling { .. } => "adjust_ceiling",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelegationReply {
    Applied(Delegation),
    Unchanged(Delegation),
}

impl DelegationReply {
    pub fn delegation(&self) -> &Delegation {
        match self {
            Self::Applied(delegation) | Self::Unchanged(delegation) => delegation,
        }
    }
}

/// Walks one delegation through activation and expiry, or stops early on revocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationLifecycle {
    pub delegation: Delegation,
}

impl DelegationLifecycle {
    fn step(&self) -> Step {
        match self.delegation.state {
            DelegationState::PendingActivation => Step::until(self.delegation.starts_at),
            DelegationState::Active => Step::until(self.delegation.ends_at),
            DelegationState::Expired | DelegationState::Revoked => Step::Complete,
        }
    }

    /// Applies every scheduled transition that is due at `at`, each at its own instant.
    fn advance(&mut self, ctx: &WorkflowContext, at: DateTime<Utc>) {
        if self.delegation.state == DelegationState::PendingActivation
            && at >= self.delegation.starts_at
        {
            self.scheduled_transition(ctx, DelegationState::Active, self.delegation.starts_at);
        }
        if self.delegation.state == DelegationState::Active && at >= self.delegation.ends_at {
            self.scheduled_transition(ctx, DelegationState::Expired, self.delegation.ends_at);
        }
    }

    fn scheduled_transition(&mut self, ctx: &WorkflowContext, to: DelegationState, at: DateTime<Utc>) {
        match ctx.delegations.transition(&self.delegation.id, to, at) {
            Ok(outcome) => {
                let event_type = match to {
                    DelegationState::Active => "delegation.activated",
                    _ => "delegation.expired",
                };
                self.record(ctx, outcome, event_type, "system");
            }
            Err(error) => {
                warn!(
                    event_name = "delegation.lifecycle.transition_failed",
                    delegation_id = %self.delegation.id,
                    from = self.delegation.state.as_str(),
                    to = to.as_str(),
                    error = %error,
                    "scheduled transition failed; reloading stored record"
                );
                if let Ok(current) = ctx.delegations.get(&self.delegation.id) {
                    self.delegation = current;
                }
            }
        }
    }

    fn record(
        &mut self,
        ctx: &WorkflowContext,
        outcome: StoreOutcome,
        event_type: &str,
        actor: &str,
    ) -> DelegationReply {
        self.delegation = outcome.delegation;
        if !outcome.changed {
            return DelegationReply::Unchanged(self.delegation.clone());
        }

        info!(
            event_name = event_type,
            delegation_id = %self.delegation.id,
            delegator_id = %self.delegation.delegator_id,
            delegate_id = %self.delegation.delegate_id,
            state = self.delegation.state.as_str(),
            state_version = self.delegation.state_version,
            "delegation updated"
        );
        ctx.audit.emit(
            AuditEvent::new(
                &AuditContext::new(
                    Some(self.delegation.id.0.clone()),
                    self.delegation.id.0.clone(),
                    actor,
                ),
                event_type,
                AuditCategory::Delegation,
                AuditOutcome::Success,
            )
            .with_metadata("delegator_id", self.delegation.delegator_id.0.clone())
            .with_metadata("delegate_id", self.delegation.delegate_id.0.clone())
            .with_metadata("state", self.delegation.state.as_str())
            .with_metadata("ends_at", self.delegation.ends_at.to_rfc3339())
            .with_metadata(
                "max_amount",
                self.delegation.max_amount.map_or_else(|| "unlimited".to_owned(), |amount| amount.to_string()),
            ),
        );
        DelegationReply::Applied(self.delegation.clone())
    }

    fn handle(
        &mut self,
        ctx: &WorkflowContext,
        signal: DelegationSignal,
        received_at: DateTime<Utc>,
    ) -> Result<DelegationReply, DomainError> {
        if signal.requested_by() != &self.delegation.delegator_id {
            return Err(DomainError::Unauthorized {
                user_id: signal.requested_by().0.clone(),
                subject: format!("delegation `{}`", self.delegation.id),
            });
        }

        let id = self.delegation.id.clone();
        match signal {
            DelegationSignal::Revoke { requested_by, reason } => {
                if self.delegation.state.is_terminal() {
                    return Ok(DelegationReply::Unchanged(self.delegation.clone()));
                }
                let outcome = ctx.delegations.revoke(&id, &requested_by, reason, received_at)?;
                Ok(self.record(ctx, outcome, "delegation.revoked", &requested_by.0))
            }
            DelegationSignal::Extend { requested_by, ends_at } => {
                if ends_at - self.delegation.starts_at > ctx.settings.max_delegation_length() {
                    return Err(DomainError::InvalidDelegation(format!(
                        "delegations may last at most {} days",
                        ctx.settings.max_delegation_days
                    )));
                }
                let outcome = ctx.delegations.extend(&id, ends_at, received_at)?;
                Ok(self.record(ctx, outcome, "delegation.extended", &requested_by.0))
            }
            DelegationSignal::AdjustCeiling { requested_by, max_amount } => {
                let outcome = ctx.delegations.set_max_amount(&id, max_amount, received_at)?;
                Ok(self.record(ctx, outcome, "delegation.ceiling_adjusted", &requested_by.0))
            }
        }
    }
}

impl DurableWorkflow for DelegationLifecycle {
    const KIND: &'static str = "delegation_lifecycle";

    type Input = DelegationGrant;
    type Signal = DelegationSignal;
    type Reply = DelegationReply;

    fn instance_id_of(input: &Self::Input) -> InstanceId {
        InstanceId(input.id.0.clone())
    }

    fn instance_id(&self) -> InstanceId {
        InstanceId(self.delegation.id.0.clone())
    }

    fn start(
        ctx: &WorkflowContext,
        input: Self::Input,
        at: DateTime<Utc>,
    ) -> Result<(Self, Step), DomainError> {
        if input.ends_at <= at {
            return Err(DomainError::InvalidDelegation(
                "validity end must be in the future".to_owned(),
            ));
        }
        if input.ends_at - input.starts_at > ctx.settings.max_delegation_length() {
            return Err(DomainError::InvalidDelegation(format!(
                "delegations may last at most {} days",
                ctx.settings.max_delegation_days
            )));
        }

        let actor = input.delegator_id.0.clone();
        let outcome = ctx.delegations.create(input, at)?;
        let mut workflow = Self { delegation: outcome.delegation.clone() };
        workflow.record(ctx, outcome, "delegation.created", &actor);
        workflow.advance(ctx, at);

        let step = workflow.step();
        Ok((workflow, step))
    }

    fn on_signal(
        &mut self,
        ctx: &WorkflowContext,
        signal: Self::Signal,
        received_at: DateTime<Utc>,
    ) -> (Result<Self::Reply, DomainError>, Step) {
        self.advance(ctx, received_at);
        let name = signal.name();
        let result = self.handle(ctx, signal, received_at);
        if let Err(error) = &result {
            warn!(
                event_name = "delegation.lifecycle.signal_rejected",
                delegation_id = %self.delegation.id,
                signal = name,
                error_class = error.class(),
                error = %error,
                "delegation signal rejected"
            );
        }
        (result, self.step())
    }

    fn on_timer(&mut self, ctx: &WorkflowContext, due_at: DateTime<Utc>) -> Step {
        self.advance(ctx, due_at);
        self.step()
    }

    fn on_resume(&self, ctx: &WorkflowContext) -> Step {
        ctx.delegations.restore(self.delegation.clone());
        self.step()
    }

    fn on_discard(&self, ctx: &WorkflowContext, committed: Option<&Self>) {
        match committed {
            Some(committed) => ctx.delegations.reinstate(committed.delegation.clone()),
            None => {
                ctx.delegations.discard(&self.delegation.id);
            }
        }
        warn!(
            event_name = "delegation.lifecycle.step_discarded",
            delegation_id = %self.delegation.id,
            restored_state = committed.map_or("none", |committed| committed.delegation.state.as_str()),
            "unjournaled delegation change rolled back in the store"
        );
    }
}
