use chrono::{DateTime, Utc};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::delegation::DelegationResolver;
use crate::domain::authority::ResolvedAuthority;
use crate::domain::delegation::UserId;
use crate::domain::purchase::{Disposition, PurchaseRequest, PurchaseStatus};
use crate::errors::DomainError;
use crate::flows::states::{PurchaseEvent, TransitionOutcome};

/// Drives a purchase request from `pending_approval` to exactly one terminal state.
#[derive(Clone, Debug)]
pub struct PurchaseFlow {
    resolver: DelegationResolver,
}

impl PurchaseFlow {
    pub fn new(resolver: DelegationResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &DelegationResolver {
        &self.resolver
    }

    pub fn approve(
        &self,
        request: &mut PurchaseRequest,
        actor_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        self.apply(request, &PurchaseEvent::Approve { actor_id: actor_id.clone(), at })
    }

    pub fn reject(
        &self,
        request: &mut PurchaseRequest,
        actor_id: &UserId,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, DomainError> {
        self.apply(request, &PurchaseEvent::Reject { actor_id: actor_id.clone(), at, reason })
    }

    pub fn expire(
        &self,
        request: &mut PurchaseRequest,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        self.apply(request, &PurchaseEvent::Expire { at })
    }

    pub fn cancel(
        &self,
        request: &mut PurchaseRequest,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        self.apply(request, &PurchaseEvent::Cancel { at })
    }

    pub fn apply(
        &self,
        request: &mut PurchaseRequest,
        event: &PurchaseEvent,
    ) -> Result<TransitionOutcome, DomainError> {
        if request.status.is_terminal() {
            return Err(DomainError::AlreadyFinal {
                subject: format!("purchase request `{}`", request.id),
                state: request.status.as_str().to_owned(),
            });
        }

        let (at, reason) = match event {
            PurchaseEvent::Approve { at, .. } => (*at, None),
            PurchaseEvent::Reject { at, reason, .. } => (*at, reason.clone()),
            PurchaseEvent::Expire { at } | PurchaseEvent::Cancel { at } => (*at, None),
        };

        let authority: Option<ResolvedAuthority> = match event.actor() {
            Some(actor_id) => Some(self.resolver.resolve_authority(actor_id, request, at)?),
            None => None,
        };

        let from = request.status;
        let to = event.target();
        request.status = to;
        request.updated_at = at;
        request.disposition = Some(Disposition {
            status: to,
            actor_id: event.actor().cloned(),
            authority: authority.clone(),
            reason,
            decided_at: at,
        });

        Ok(TransitionOutcome { request_id: request.id.clone(), from, to, authority, at })
    }

    pub fn apply_with_audit<S>(
        &self,
        request: &mut PurchaseRequest,
        event: &PurchaseEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let from = request.status;
        let result = self.apply(request, event);
        match &result {
            Ok(outcome) => {
                let mut audit_event = AuditEvent::new(
                    audit,
                    "approval.transition_applied",
                    AuditCategory::Approval,
                    AuditOutcome::Success,
                )
                .with_metadata("request_id", outcome.request_id.0.clone())
                .with_metadata("event", event.name())
                .with_metadata("from", outcome.from.as_str())
                .with_metadata("to", outcome.to.as_str())
                .with_metadata("total_amount", request.total_amount.to_string());

                if let Some(authority) = &outcome.authority {
                    audit_event = audit_event.with_metadata("authority", authority.kind());
                    if let ResolvedAuthority::Delegated { delegator_id, delegation_id, .. } =
                        authority
                    {
                        audit_event = audit_event
                            .with_metadata("on_behalf_of", delegator_id.0.clone())
                            .with_metadata("delegation_id", delegation_id.0.clone());
                    }
                }
                sink.emit(audit_event);
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "approval.transition_rejected",
                        AuditCategory::Approval,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("request_id", request.id.0.clone())
                    .with_metadata("event", event.name())
                    .with_metadata("from", from.as_str())
                    .with_metadata("error_class", error.class())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

/// Convenience for callers that only need to know whether a request still awaits a decision.
pub fn is_actionable(request: &PurchaseRequest) -> bool {
    request.status == PurchaseStatus::PendingApproval
}
