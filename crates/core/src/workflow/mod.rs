//! Durable per-instance workflows.
//!
//! Each purchase request and each delegation runs as an independent instance. An instance only
//! changes state inside `start`, `on_signal` and `on_timer`; the host serializes those calls per
//! instance and journals the resulting state before any caller sees the outcome. Audit events
//! raised by a step are held back until that step is journaled.

pub mod approval;
pub mod delegation;
pub mod host;
pub mod journal;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::audit::AuditSink;
use crate::config::WorkflowConfig;
use crate::delegation::{DelegationResolver, DelegationStore};
use crate::errors::DomainError;
use crate::flows::PurchaseFlow;

pub use approval::{ApprovalReply, ApprovalSignal, ApprovalWorkflow, Decision, DecisionSignal};
pub use delegation::{DelegationLifecycle, DelegationReply, DelegationSignal};
pub use host::WorkflowHost;
pub use journal::{
    InMemoryInstanceJournal, InstanceJournal, InstanceRecord, InstanceStatus, JournalError,
    RetryPolicy,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an instance waits for after handling an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Suspended until a signal arrives or, if set, until `wake_at`.
    Await { wake_at: Option<DateTime<Utc>> },
    /// Terminal. The instance still answers signals but never wakes again.
    Complete,
}

impl Step {
    pub fn until(wake_at: DateTime<Utc>) -> Self {
        Self::Await { wake_at: Some(wake_at) }
    }

    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Await { wake_at } => *wake_at,
            Self::Complete => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Collaborators shared by every instance on a host.
#[derive(Clone)]
pub struct WorkflowContext {
    pub delegations: DelegationStore,
    pub flow: PurchaseFlow,
    pub audit: Arc<dyn AuditSink>,
    pub settings: WorkflowConfig,
}

impl WorkflowContext {
    pub fn new(
        delegations: DelegationStore,
        audit: Arc<dyn AuditSink>,
        settings: WorkflowConfig,
    ) -> Self {
        let flow = PurchaseFlow::new(DelegationResolver::new(delegations.clone()));
        Self { delegations, flow, audit, settings }
    }

    /// Same collaborators, with audit events routed to `audit` instead.
    pub fn with_audit(&self, audit: Arc<dyn AuditSink>) -> Self {
        Self { audit, ..self.clone() }
    }
}

/// A long-running state machine whose progress survives restarts.
///
/// Implementations must be deterministic for a given input history and must tolerate a
/// redelivered signal or a timer firing late or twice.
pub trait DurableWorkflow: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    type Input: Send + 'static;
    type Signal: Send + std::fmt::Debug + 'static;
    type Reply: Send + 'static;

    fn instance_id_of(input: &Self::Input) -> InstanceId;

    fn instance_id(&self) -> InstanceId;

    fn start(
        ctx: &WorkflowContext,
        input: Self::Input,
        at: DateTime<Utc>,
    ) -> Result<(Self, Step), DomainError>;

    fn on_signal(
        &mut self,
        ctx: &WorkflowContext,
        signal: Self::Signal,
        received_at: DateTime<Utc>,
    ) -> (Result<Self::Reply, DomainError>, Step);

    fn on_timer(&mut self, ctx: &WorkflowContext, due_at: DateTime<Utc>) -> Step;

    /// Called once after the instance is rehydrated from the journal.
    fn on_resume(&self, ctx: &WorkflowContext) -> Step;

    /// Called on a state that could not be journaled, before it is thrown away. `committed` is
    /// the last journaled state, or `None` when the start itself was never written.
    fn on_discard(&self, _ctx: &WorkflowContext, _committed: Option<&Self>) {}
}
