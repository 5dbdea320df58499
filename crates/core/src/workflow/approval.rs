use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome};
use crate::domain::delegation::UserId;
use crate::domain::purchase::{NewPurchaseRequest, PurchaseRequest, PurchaseRequestId, PurchaseStatus};
use crate::errors::DomainError;
use crate::flows::{PurchaseEvent, TransitionOutcome};
use crate::workflow::{DurableWorkflow, InstanceId, Step, WorkflowContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// An approve or reject decision as delivered by the calling layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSignal {
    pub acting_user_id: UserId,
    pub purchase_request_id: PurchaseRequestId,
    pub decision: Decision,
    pub reason: Option<String>,
    /// Caller-side timestamp. Kept for audit only; authority is checked at receipt.
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalSignal {
    Decide(DecisionSignal),
    Cancel { requested_by: UserId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalReply {
    Transitioned(TransitionOutcome),
    /// The request was already terminal and the signal had nothing to do.
    Unchanged { status: PurchaseStatus },
}

/// One purchase request waiting for a decision or its deadline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub request: PurchaseRequest,
}

impl ApprovalWorkflow {
    fn step(&self) -> Step {
        if self.request.status.is_terminal() {
            Step::Complete
        } else {
            Step::until(self.request.expires_at)
        }
    }

    fn audit_context(&self, actor: &str) -> AuditContext {
        AuditContext::new(Some(self.request.id.0.clone()), self.request.id.0.clone(), actor)
    }

    /// Applies the deadline before anything else observed at or after it.
    fn expire_if_due(&mut self, ctx: &WorkflowContext, at: DateTime<Utc>) {
        if self.request.status != PurchaseStatus::PendingApproval || at < self.request.expires_at {
            return;
        }

        let event = PurchaseEvent::Expire { at: self.request.expires_at };
        let audit = self.audit_context("system");
        match ctx.flow.apply_with_audit(&mut self.request, &event, ctx.audit.as_ref(), &audit) {
            Ok(_) => info!(
                event_name = "approval.request.expired",
                request_id = %self.request.id,
                expires_at = %self.request.expires_at,
                "purchase request expired without a decision"
            ),
            Err(error) => warn!(
                event_name = "approval.request.expire_failed",
                request_id = %self.request.id,
                error = %error,
                "could not expire purchase request"
            ),
        }
    }

    fn decide(
        &mut self,
        ctx: &WorkflowContext,
        signal: DecisionSignal,
        received_at: DateTime<Utc>,
    ) -> Result<ApprovalReply, DomainError> {
        if signal.purchase_request_id != self.request.id {
            return Err(DomainError::not_found("purchase request", signal.purchase_request_id.0));
        }

        let event = match signal.decision {
            Decision::Approve => {
                PurchaseEvent::Approve { actor_id: signal.acting_user_id.clone(), at: received_at }
            }
            Decision::Reject => PurchaseEvent::Reject {
                actor_id: signal.acting_user_id.clone(),
                at: received_at,
                reason: signal.reason.clone(),
            },
        };

        let audit = self.audit_context(&signal.acting_user_id.0);
        let outcome =
            ctx.flow.apply_with_audit(&mut self.request, &event, ctx.audit.as_ref(), &audit)?;

        info!(
            event_name = "approval.request.decided",
            request_id = %self.request.id,
            acting_user_id = %signal.acting_user_id,
            decision = event.name(),
            authority = outcome.authority.as_ref().map(|authority| authority.kind()).unwrap_or("none"),
            submitted_at = %signal.submitted_at,
            received_at = %received_at,
            "decision applied"
        );
        Ok(ApprovalReply::Transitioned(outcome))
    }

    fn cancel(
        &mut self,
        ctx: &WorkflowContext,
        requested_by: &UserId,
        received_at: DateTime<Utc>,
    ) -> Result<ApprovalReply, DomainError> {
        if requested_by != &self.request.requester_id {
            return Err(DomainError::Unauthorized {
                user_id: requested_by.0.clone(),
                subject: format!("cancellation of purchase request `{}`", self.request.id),
            });
        }
        if self.request.status.is_terminal() {
            return Ok(ApprovalReply::Unchanged { status: self.request.status });
        }

        let audit = self.audit_context(&requested_by.0);
        let outcome = ctx.flow.apply_with_audit(
            &mut self.request,
            &PurchaseEvent::Cancel { at: received_at },
            ctx.audit.as_ref(),
            &audit,
        )?;
        info!(
            event_name = "approval.request.cancelled",
            request_id = %self.request.id,
            "purchase request withdrawn by its requester"
        );
        Ok(ApprovalReply::Transitioned(outcome))
    }
}

impl DurableWorkflow for ApprovalWorkflow {
    const KIND: &'static str = "purchase_approval";

    type Input = NewPurchaseRequest;
    type Signal = ApprovalSignal;
    type Reply = ApprovalReply;

    fn instance_id_of(input: &Self::Input) -> InstanceId {
        InstanceId(input.id.0.clone())
    }

    fn instance_id(&self) -> InstanceId {
        InstanceId(self.request.id.0.clone())
    }

    fn start(
        ctx: &WorkflowContext,
        input: Self::Input,
        at: DateTime<Utc>,
    ) -> Result<(Self, Step), DomainError> {
        let expires_at = at + ctx.settings.approval_timeout();
        let request = PurchaseRequest::submit(input, at, expires_at)?;

        ctx.audit.emit(
            AuditEvent::new(
                &AuditContext::new(
                    Some(request.id.0.clone()),
                    request.id.0.clone(),
                    request.requester_id.0.clone(),
                ),
                "approval.request_submitted",
                AuditCategory::Workflow,
                AuditOutcome::Success,
            )
            .with_metadata("assigned_approver_id", request.assigned_approver_id.0.clone())
            .with_metadata("total_amount", request.total_amount.to_string())
            .with_metadata("expires_at", expires_at.to_rfc3339()),
        );

        let workflow = Self { request };
        let step = workflow.step();
        Ok((workflow, step))
    }

    fn on_signal(
        &mut self,
        ctx: &WorkflowContext,
        signal: Self::Signal,
        received_at: DateTime<Utc>,
    ) -> (Result<Self::Reply, DomainError>, Step) {
        self.expire_if_due(ctx, received_at);
        let result = match signal {
            ApprovalSignal::Decide(decision) => self.decide(ctx, decision, received_at),
            ApprovalSignal::Cancel { requested_by } => {
                self.cancel(ctx, &requested_by, received_at)
            }
        };
        (result, self.step())
    }

    fn on_timer(&mut self, ctx: &WorkflowContext, due_at: DateTime<Utc>) -> Step {
        self.expire_if_due(ctx, due_at);
        self.step()
    }

    fn on_resume(&self, _ctx: &WorkflowContext) -> Step {
        self.step()
    }
}
