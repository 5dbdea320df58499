use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use procura_core::config::WorkflowConfig;
use procura_core::workflow::{
    ApprovalWorkflow, Clock, DelegationLifecycle, DurableWorkflow, InMemoryInstanceJournal,
    InstanceId, InstanceJournal, InstanceRecord, InstanceStatus, JournalError,
};
use procura_core::{
    ApplicationError, ApprovalReply, Decision, DecisionSignal, DelegationGrant, DelegationId,
    DelegationReply, DelegationState, DomainError, InMemoryAuditSink, LineItem,
    NewPurchaseRequest, ProcurementEngine, PurchaseRequestId, PurchaseStatus, ResumeSummary,
    UserId,
};
use rust_decimal::Decimal;

struct PausedClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

/// Journal whose writes fail until `failures` is exhausted.
#[derive(Default)]
struct FlakyJournal {
    inner: InMemoryInstanceJournal,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

#[async_trait]
impl InstanceJournal for FlakyJournal {
    async fn save(&self, record: &InstanceRecord) -> Result<(), JournalError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(JournalError::Storage("disk unavailable".to_owned()));
        }
        self.inner.save(record).await
    }

    async fn load(
        &self,
        kind: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, JournalError> {
        self.inner.load(kind, instance_id).await
    }

    async fn list(
        &self,
        kind: Option<&str>,
        include_completed: bool,
    ) -> Result<Vec<InstanceRecord>, JournalError> {
        self.inner.list(kind, include_completed).await
    }
}

/// Journal that refuses writes for one instance at a time and serves everything else.
#[derive(Default)]
struct PartitionedJournal {
    inner: InMemoryInstanceJournal,
    unavailable: Mutex<Option<InstanceId>>,
    refused: AtomicUsize,
}

impl PartitionedJournal {
    fn refuse(&self, instance_id: &str) {
        *self.unavailable.lock().expect("journal lock") = Some(InstanceId(instance_id.to_owned()));
    }

    fn heal(&self) {
        *self.unavailable.lock().expect("journal lock") = None;
    }
}

#[async_trait]
impl InstanceJournal for PartitionedJournal {
    async fn save(&self, record: &InstanceRecord) -> Result<(), JournalError> {
        let refused =
            self.unavailable.lock().expect("journal lock").as_ref() == Some(&record.instance_id);
        if refused {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(JournalError::Storage("partition unavailable".to_owned()));
        }
        self.inner.save(record).await
    }

    async fn load(
        &self,
        kind: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, JournalError> {
        self.inner.load(kind, instance_id).await
    }

    async fn list(
        &self,
        kind: Option<&str>,
        include_completed: bool,
    ) -> Result<Vec<InstanceRecord>, JournalError> {
        self.inner.list(kind, include_completed).await
    }
}

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 11, 2, 12, 0, 0).single().expect("valid origin")
}

fn user(id: &str) -> UserId {
    UserId(id.to_owned())
}

fn settings() -> WorkflowConfig {
    WorkflowConfig {
        journal_max_retries: 2,
        journal_retry_base_delay_ms: 10,
        journal_retry_max_delay_ms: 40,
        ..WorkflowConfig::default()
    }
}

fn engine_with(
    journal: Arc<dyn InstanceJournal>,
    started: tokio::time::Instant,
    settings: WorkflowConfig,
) -> (ProcurementEngine, InMemoryAuditSink) {
    let sink = InMemoryAuditSink::default();
    let engine = ProcurementEngine::new(
        settings,
        journal,
        Arc::new(sink.clone()),
        Arc::new(PausedClock { origin: origin(), started }),
    );
    (engine, sink)
}

fn engine_on(journal: Arc<dyn InstanceJournal>, started: tokio::time::Instant) -> ProcurementEngine {
    engine_with(journal, started, settings()).0
}

fn grant(start: Duration, end: Duration) -> DelegationGrant {
    DelegationGrant {
        id: DelegationId("DLG-9".to_owned()),
        delegator_id: user("director"),
        delegate_id: user("lead"),
        starts_at: origin() + start,
        ends_at: origin() + end,
        max_amount: None,
        reason: "sabbatical".to_owned(),
    }
}

fn purchase(id: &str) -> NewPurchaseRequest {
    NewPurchaseRequest {
        id: PurchaseRequestId(id.to_owned()),
        requester_id: user("analyst"),
        delivery_office: "Dublin".to_owned(),
        line_items: vec![LineItem {
            description: "licence".to_owned(),
            url: None,
            amount: Decimal::new(1_250, 0),
        }],
        justification: "tooling".to_owned(),
        assigned_approver_id: user("director"),
    }
}

fn approve(request_id: &str) -> DecisionSignal {
    DecisionSignal {
        acting_user_id: user("director"),
        purchase_request_id: PurchaseRequestId(request_id.to_owned()),
        decision: Decision::Approve,
        reason: None,
        submitted_at: origin(),
    }
}

async fn advance(by: Duration) {
    tokio::time::sleep(by.to_std().unwrap_or(StdDuration::ZERO)).await;
}

#[tokio::test(start_paused = true)]
async fn resumed_engine_rebuilds_delegations_before_approvals() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(InMemoryInstanceJournal::new());

    let first = engine_on(journal.clone(), started);
    first.create_delegation(grant(Duration::zero(), Duration::days(4))).await.expect("create");
    first.submit_purchase_request(purchase("PR-1")).await.expect("submit");
    first.shutdown().await;

    let second = engine_on(journal.clone(), started);
    let summary = second.resume().await.expect("resume");
    assert_eq!(summary, ResumeSummary { delegations: 1, approvals: 1 });
    assert_eq!(second.instance_count().await, 2);

    let reply = second
        .decide(DecisionSignal {
            acting_user_id: user("lead"),
            purchase_request_id: PurchaseRequestId("PR-1".to_owned()),
            decision: Decision::Reject,
            reason: Some("use the site licence".to_owned()),
            submitted_at: origin(),
        })
        .await
        .expect("delegated rejection after restart");
    assert!(matches!(reply, ApprovalReply::Transitioned(ref outcome) if outcome.to == PurchaseStatus::Rejected));

    let record = journal
        .load(ApprovalWorkflow::KIND, &InstanceId("PR-1".to_owned()))
        .await
        .expect("load")
        .expect("journaled");
    assert_eq!(record.status, InstanceStatus::Completed);
    assert_eq!(record.wake_at, None);
}

#[tokio::test(start_paused = true)]
async fn overdue_timers_catch_up_at_their_scheduled_instants() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(InMemoryInstanceJournal::new());

    let first = engine_on(journal.clone(), started);
    first.create_delegation(grant(Duration::days(1), Duration::days(2))).await.expect("create");
    first.shutdown().await;

    advance(Duration::days(3)).await;

    let second = engine_on(journal.clone(), started);
    second.resume().await.expect("resume");
    advance(Duration::milliseconds(10)).await;

    let delegation = second.delegation(&DelegationId("DLG-9".to_owned())).expect("delegation");
    assert_eq!(delegation.state, DelegationState::Expired);
    assert_eq!(delegation.updated_at, origin() + Duration::days(2));

    let record = journal
        .load(DelegationLifecycle::KIND, &InstanceId("DLG-9".to_owned()))
        .await
        .expect("load")
        .expect("journaled");
    assert_eq!(record.status, InstanceStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn undecodable_records_are_skipped_on_resume() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(InMemoryInstanceJournal::new());
    journal
        .save(&InstanceRecord {
            kind: ApprovalWorkflow::KIND.to_owned(),
            instance_id: InstanceId("PR-broken".to_owned()),
            status: InstanceStatus::Running,
            state_json: "{\"request\":".to_owned(),
            wake_at: None,
            revision: 1,
            updated_at: origin(),
        })
        .await
        .expect("save");

    let first = engine_on(journal.clone(), started);
    first.submit_purchase_request(purchase("PR-2")).await.expect("submit");
    first.shutdown().await;

    let second = engine_on(journal, started);
    let summary = second.resume().await.expect("resume");
    assert_eq!(summary, ResumeSummary { delegations: 0, approvals: 1 });
    let missing = second.purchase_request(&PurchaseRequestId("PR-broken".to_owned())).await;
    assert!(matches!(missing, Err(ApplicationError::Domain(_))));
}

#[tokio::test(start_paused = true)]
async fn journal_writes_are_retried_then_surface_as_persistence_errors() {
    let started = tokio::time::Instant::now();

    let recovering = Arc::new(FlakyJournal { failures: AtomicUsize::new(2), ..FlakyJournal::default() });
    let engine = engine_on(recovering.clone(), started);
    engine.submit_purchase_request(purchase("PR-3")).await.expect("submit after retries");
    assert_eq!(recovering.attempts.load(Ordering::SeqCst), 3);

    let broken = Arc::new(FlakyJournal { failures: AtomicUsize::new(usize::MAX), ..FlakyJournal::default() });
    let engine = engine_on(broken.clone(), started);
    let result = engine.submit_purchase_request(purchase("PR-4")).await;
    assert!(matches!(result, Err(ApplicationError::Persistence(_))));
    assert_eq!(broken.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(engine.instance_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn retrying_start_does_not_hold_up_other_requests() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(PartitionedJournal::default());
    let slow = WorkflowConfig {
        journal_max_retries: 3,
        journal_retry_base_delay_ms: 60_000,
        journal_retry_max_delay_ms: 60_000,
        ..WorkflowConfig::default()
    };
    let (engine, _) = engine_with(journal.clone(), started, slow);
    engine.submit_purchase_request(purchase("PR-5")).await.expect("submit");

    journal.refuse("PR-6");
    let stalled = tokio::spawn({
        let engine = engine.clone();
        async move { engine.submit_purchase_request(purchase("PR-6")).await }
    });
    tokio::task::yield_now().await;
    assert_eq!(journal.refused.load(Ordering::SeqCst), 1, "PR-6 is backing off");

    let duplicate = engine.submit_purchase_request(purchase("PR-6")).await;
    assert!(matches!(duplicate, Err(ApplicationError::Runtime(_))));

    let reply = tokio::time::timeout(StdDuration::from_secs(1), engine.decide(approve("PR-5")))
        .await
        .expect("decision is not queued behind PR-6")
        .expect("decide");
    assert!(matches!(reply, ApprovalReply::Transitioned(ref outcome) if outcome.to == PurchaseStatus::Approved));
    assert!(!stalled.is_finished());

    let outcome = stalled.await.expect("join");
    assert!(matches!(outcome, Err(ApplicationError::Persistence(_))));
    let missing = engine.purchase_request(&PurchaseRequestId("PR-6".to_owned())).await;
    assert!(matches!(missing, Err(ApplicationError::Domain(DomainError::NotFound { .. }))));
}

#[tokio::test(start_paused = true)]
async fn unjournaled_delegation_start_leaves_nothing_behind() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(PartitionedJournal::default());
    let (engine, sink) = engine_with(journal.clone(), started, settings());

    journal.refuse("DLG-9");
    let failed = engine.create_delegation(grant(Duration::zero(), Duration::days(4))).await;
    assert!(matches!(failed, Err(ApplicationError::Persistence(_))));
    assert!(engine.delegation(&DelegationId("DLG-9".to_owned())).is_err());
    assert!(engine.delegations_created_by(&user("director")).is_empty());
    assert!(sink.events_of_type("delegation.created").is_empty());
    assert_eq!(engine.instance_count().await, 0);

    journal.heal();
    let mut replacement = grant(Duration::zero(), Duration::days(4));
    replacement.id = DelegationId("DLG-10".to_owned());
    let created = engine.create_delegation(replacement).await.expect("same window is free again");
    assert_eq!(created.state, DelegationState::Active);
    assert_eq!(sink.events_of_type("delegation.created").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unjournaled_decision_is_not_applied_and_can_be_retried_once() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(PartitionedJournal::default());
    let (engine, sink) = engine_with(journal.clone(), started, settings());
    let id = PurchaseRequestId("PR-7".to_owned());
    engine.submit_purchase_request(purchase("PR-7")).await.expect("submit");

    journal.refuse("PR-7");
    let failed = engine.decide(approve("PR-7")).await;
    assert!(matches!(failed, Err(ApplicationError::Persistence(_))));
    assert_eq!(
        engine.purchase_request(&id).await.map(|request| request.status),
        Ok(PurchaseStatus::PendingApproval)
    );
    assert!(sink.events_of_type("approval.transition_applied").is_empty());

    journal.heal();
    let reply = engine.decide(approve("PR-7")).await.expect("retried decision");
    assert!(matches!(reply, ApprovalReply::Transitioned(ref outcome) if outcome.to == PurchaseStatus::Approved));
    let again = engine.decide(approve("PR-7")).await;
    assert!(matches!(again, Err(ApplicationError::Domain(DomainError::AlreadyFinal { .. }))));
    assert_eq!(sink.events_of_type("approval.transition_applied").len(), 1);

    let record = journal
        .load(ApprovalWorkflow::KIND, &InstanceId("PR-7".to_owned()))
        .await
        .expect("load")
        .expect("journaled");
    assert_eq!(record.status, InstanceStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn unjournaled_revocation_keeps_the_delegation_usable() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(PartitionedJournal::default());
    let (engine, sink) = engine_with(journal.clone(), started, settings());
    let id = DelegationId("DLG-9".to_owned());
    engine.create_delegation(grant(Duration::zero(), Duration::days(4))).await.expect("create");

    journal.refuse("DLG-9");
    let failed = engine.revoke_delegation(&id, user("director"), None).await;
    assert!(matches!(failed, Err(ApplicationError::Persistence(_))));
    assert_eq!(engine.delegation(&id).map(|delegation| delegation.state), Ok(DelegationState::Active));
    assert!(sink.events_of_type("delegation.revoked").is_empty());

    journal.heal();
    let revoked = engine.revoke_delegation(&id, user("director"), None).await.expect("revoke");
    assert!(matches!(revoked, DelegationReply::Applied(_)));
    assert_eq!(engine.delegation(&id).map(|delegation| delegation.state), Ok(DelegationState::Revoked));
}

#[tokio::test(start_paused = true)]
async fn completed_instances_leave_the_host_and_answer_from_the_journal() {
    let started = tokio::time::Instant::now();
    let journal = Arc::new(InMemoryInstanceJournal::new());
    let (engine, sink) = engine_with(journal.clone(), started, settings());
    let id = PurchaseRequestId("PR-8".to_owned());

    engine.submit_purchase_request(purchase("PR-8")).await.expect("submit");
    assert_eq!(engine.instance_count().await, 1);
    engine.decide(approve("PR-8")).await.expect("approve");
    tokio::task::yield_now().await;
    assert_eq!(engine.instance_count().await, 0);

    let late = engine.decide(approve("PR-8")).await;
    assert!(matches!(late, Err(ApplicationError::Domain(DomainError::AlreadyFinal { .. }))));
    assert_eq!(sink.events_of_type("approval.transition_rejected").len(), 1);
    let cancelled = engine.cancel_purchase_request(&id, user("analyst")).await;
    assert_eq!(cancelled, Ok(ApprovalReply::Unchanged { status: PurchaseStatus::Approved }));

    let resubmitted = engine.submit_purchase_request(purchase("PR-8")).await.expect("resubmit");
    assert_eq!(resubmitted.status, PurchaseStatus::Approved);
    let listed: Vec<PurchaseRequestId> =
        engine.purchase_requests().await.into_iter().map(|request| request.id).collect();
    assert_eq!(listed, vec![id.clone()]);

    tokio::task::yield_now().await;
    assert_eq!(engine.instance_count().await, 0);
    let record = journal.load(ApprovalWorkflow::KIND, &InstanceId("PR-8".to_owned())).await.expect("load");
    assert_eq!(record.map(|record| record.revision), Some(2));
}
