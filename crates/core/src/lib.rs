pub mod audit;
pub mod config;
pub mod delegation;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod flows;
pub mod queries;
pub mod workflow;

pub use audit::{AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use delegation::{DelegationResolver, DelegationStore};
pub use domain::authority::{DelegatedAuthority, EffectiveAuthority, ResolvedAuthority};
pub use domain::delegation::{
    Delegation, DelegationGrant, DelegationId, DelegationState, UserId,
};
pub use domain::purchase::{
    LineItem, NewPurchaseRequest, PurchaseRequest, PurchaseRequestId, PurchaseStatus,
};
pub use engine::{ProcurementEngine, ResumeSummary};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::PurchaseFlow;
pub use queries::{ActionableRequest, DelegationView};
pub use workflow::{
    ApprovalReply, Decision, DecisionSignal, DelegationReply, InstanceJournal, SystemClock,
};
