use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditSink;
use crate::config::WorkflowConfig;
use crate::delegation::DelegationStore;
use crate::domain::authority::EffectiveAuthority;
use crate::domain::delegation::{Delegation, DelegationGrant, DelegationId, UserId};
use crate::domain::purchase::{NewPurchaseRequest, PurchaseRequest, PurchaseRequestId};
use crate::errors::ApplicationError;
use crate::queries::{self, ActionableRequest, DelegationView};
use crate::workflow::{
    ApprovalReply, ApprovalSignal, ApprovalWorkflow, Clock, DecisionSignal, DelegationLifecycle,
    DelegationReply, DelegationSignal, InstanceId, InstanceJournal, RetryPolicy, WorkflowContext,
    WorkflowHost,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSummary {
    pub delegations: usize,
    pub approvals: usize,
}

/// Entry point for callers: owns both workflow hosts and the shared delegation store.
#[derive(Clone)]
pub struct ProcurementEngine {
    ctx: WorkflowContext,
    clock: Arc<dyn Clock>,
    delegations: WorkflowHost<DelegationLifecycle>,
    approvals: WorkflowHost<ApprovalWorkflow>,
}

impl ProcurementEngine {
    pub fn new(
        settings: WorkflowConfig,
        journal: Arc<dyn InstanceJournal>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&settings);
        let ctx = WorkflowContext::new(DelegationStore::new(), audit, settings);
        let delegations =
            WorkflowHost::new(ctx.clone(), Arc::clone(&journal), Arc::clone(&clock), retry);
        let approvals = WorkflowHost::new(ctx.clone(), journal, Arc::clone(&clock), retry);
        Self { ctx, clock, delegations, approvals }
    }

    /// Rehydrates journaled instances. Delegations go first so the store is complete before any
    /// approval can resolve authority against it.
    pub async fn resume(&self) -> Result<ResumeSummary, ApplicationError> {
        let delegations = self.delegations.resume().await?;
        let approvals = self.approvals.resume().await?;
        info!(
            event_name = "engine.resumed",
            delegations,
            approvals,
            "procurement engine resumed"
        );
        Ok(ResumeSummary { delegations, approvals })
    }

    pub async fn shutdown(&self) {
        self.approvals.shutdown().await;
        self.delegations.shutdown().await;
    }

    pub async fn create_delegation(
        &self,
        grant: DelegationGrant,
    ) -> Result<Delegation, ApplicationError> {
        Ok(self.delegations.start(grant).await?.delegation)
    }

    pub async fn revoke_delegation(
        &self,
        id: &DelegationId,
        requested_by: UserId,
        reason: Option<String>,
    ) -> Result<DelegationReply, ApplicationError> {
        self.delegations
            .signal(&delegation_instance(id), DelegationSignal::Revoke { requested_by, reason })
            .await
    }

    pub async fn extend_delegation(
        &self,
        id: &DelegationId,
        requested_by: UserId,
        ends_at: DateTime<Utc>,
    ) -> Result<DelegationReply, ApplicationError> {
        self.delegations
            .signal(&delegation_instance(id), DelegationSignal::Extend { requested_by, ends_at })
            .await
    }

    pub async fn adjust_delegation_ceiling(
        &self,
        id: &DelegationId,
        requested_by: UserId,
        max_amount: Option<Decimal>,
    ) -> Result<DelegationReply, ApplicationError> {
        self.delegations
            .signal(
                &delegation_instance(id),
                DelegationSignal::AdjustCeiling { requested_by, max_amount },
            )
            .await
    }

    pub async fn submit_purchase_request(
        &self,
        input: NewPurchaseRequest,
    ) -> Result<PurchaseRequest, ApplicationError> {
        Ok(self.approvals.start(input).await?.request)
    }

    pub async fn decide(&self, signal: DecisionSignal) -> Result<ApprovalReply, ApplicationError> {
        let instance_id = request_instance(&signal.purchase_request_id);
        self.approvals.signal(&instance_id, ApprovalSignal::Decide(signal)).await
    }

    pub async fn cancel_purchase_request(
        &self,
        id: &PurchaseRequestId,
        requested_by: UserId,
    ) -> Result<ApprovalReply, ApplicationError> {
        self.approvals
            .signal(&request_instance(id), ApprovalSignal::Cancel { requested_by })
            .await
    }

    pub fn delegation(&self, id: &DelegationId) -> Result<Delegation, ApplicationError> {
        Ok(self.ctx.delegations.get(id)?)
    }

    pub async fn purchase_request(
        &self,
        id: &PurchaseRequestId,
    ) -> Result<PurchaseRequest, ApplicationError> {
        Ok(self.approvals.snapshot(&request_instance(id)).await?.request)
    }

    pub async fn purchase_requests(&self) -> Vec<PurchaseRequest> {
        self.approvals.snapshots().await.into_iter().map(|workflow| workflow.request).collect()
    }

    pub fn delegations_created_by(&self, delegator_id: &UserId) -> Vec<DelegationView> {
        queries::delegations_created_by(&self.ctx.delegations, delegator_id, self.clock.now())
    }

    pub fn delegations_received_by(&self, delegate_id: &UserId) -> Vec<DelegationView> {
        queries::delegations_received_by(&self.ctx.delegations, delegate_id, self.clock.now())
    }

    pub async fn actionable_requests(&self, user_id: &UserId) -> Vec<ActionableRequest> {
        let requests = self.purchase_requests().await;
        queries::actionable_requests(self.ctx.flow.resolver(), requests, user_id, self.clock.now())
    }

    pub fn effective_authority(&self, user_id: &UserId) -> EffectiveAuthority {
        self.ctx.flow.resolver().effective_authority(user_id, self.clock.now())
    }

    /// Instances with a live task. Completed ones are answered from the journal instead.
    pub async fn instance_count(&self) -> usize {
        self.delegations.len().await + self.approvals.len().await
    }
}

fn delegation_instance(id: &DelegationId) -> InstanceId {
    InstanceId(id.0.clone())
}

fn request_instance(id: &PurchaseRequestId) -> InstanceId {
    InstanceId(id.0.clone())
}
