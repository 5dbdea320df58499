use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audit::InMemoryAuditSink;
use crate::errors::{ApplicationError, DomainError};
use crate::workflow::journal::{InstanceJournal, InstanceRecord, InstanceStatus, RetryPolicy};
use crate::workflow::{Clock, DurableWorkflow, InstanceId, Step, WorkflowContext};

const MAILBOX_CAPACITY: usize = 64;
const DELIVERY_ATTEMPTS: usize = 2;

enum Command<W: DurableWorkflow> {
    Signal { signal: W::Signal, reply: oneshot::Sender<Result<W::Reply, ApplicationError>> },
    Snapshot { reply: oneshot::Sender<W> },
}

enum Slot<W: DurableWorkflow> {
    /// Claimed by a `start` whose first journal write has not finished.
    Starting,
    Running(mpsc::Sender<Command<W>>),
}

#[derive(Default)]
struct JournalState {
    revision: u64,
    last_saved: Option<(String, Option<chrono::DateTime<chrono::Utc>>, InstanceStatus)>,
}

impl JournalState {
    fn resumed(record: &InstanceRecord) -> Self {
        Self {
            revision: record.revision,
            last_saved: Some((record.state_json.clone(), record.wake_at, record.status)),
        }
    }
}

struct HostInner<W: DurableWorkflow> {
    ctx: WorkflowContext,
    journal: Arc<dyn InstanceJournal>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    slots: Mutex<HashMap<InstanceId, Slot<W>>>,
}

impl<W: DurableWorkflow> HostInner<W> {
    fn slots(&self) -> MutexGuard<'_, HashMap<InstanceId, Slot<W>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases a `Starting` slot unless the start got far enough to host the instance.
struct Reservation<'a, W: DurableWorkflow> {
    inner: &'a HostInner<W>,
    instance_id: InstanceId,
    hosted: bool,
}

impl<W: DurableWorkflow> Reservation<'_, W> {
    fn host(mut self, mailbox: mpsc::Sender<Command<W>>) {
        self.inner.slots().insert(self.instance_id.clone(), Slot::Running(mailbox));
        self.hosted = true;
    }
}

impl<W: DurableWorkflow> Drop for Reservation<'_, W> {
    fn drop(&mut self) {
        if self.hosted {
            return;
        }
        let mut slots = self.inner.slots();
        if matches!(slots.get(&self.instance_id), Some(Slot::Starting)) {
            slots.remove(&self.instance_id);
        }
    }
}

/// Runs every live instance of one workflow kind as its own task.
///
/// Inputs for one instance flow through that instance's mailbox and are handled one at a time
/// in arrival order. Different instances never block each other. A step's new state replaces the
/// old one only after the journal accepted it. Completed instances leave the host and are
/// brought back from the journal when a late signal or lookup names them.
pub struct WorkflowHost<W: DurableWorkflow> {
    inner: Arc<HostInner<W>>,
}

impl<W: DurableWorkflow> Clone for WorkflowHost<W> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<W: DurableWorkflow> WorkflowHost<W> {
    pub fn new(
        ctx: WorkflowContext,
        journal: Arc<dyn InstanceJournal>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                ctx,
                journal,
                clock,
                retry,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts an instance. Starting an id that is already hosted or journaled returns its
    /// current state.
    pub async fn start(&self, input: W::Input) -> Result<W, ApplicationError> {
        let instance_id = W::instance_id_of(&input);
        let hosted = {
            let mut slots = self.inner.slots();
            match slots.get(&instance_id) {
                Some(Slot::Running(_)) => true,
                Some(Slot::Starting) => {
                    return Err(ApplicationError::Runtime(format!(
                        "{} instance `{instance_id}` is already starting",
                        W::KIND
                    )));
                }
                None => {
                    slots.insert(instance_id.clone(), Slot::Starting);
                    false
                }
            }
        };
        if hosted {
            debug!(
                event_name = "workflow.instance.start_deduplicated",
                kind = W::KIND,
                instance_id = %instance_id,
                "instance already hosted"
            );
            return self.snapshot(&instance_id).await;
        }
        let reservation =
            Reservation { inner: self.inner.as_ref(), instance_id: instance_id.clone(), hosted: false };

        if let Some(record) = self.load(&instance_id).await? {
            debug!(
                event_name = "workflow.instance.start_deduplicated",
                kind = W::KIND,
                instance_id = %instance_id,
                status = record.status.as_str(),
                "instance already journaled"
            );
            return decode(&record);
        }

        let started_at = self.inner.clock.now();
        let audit = InMemoryAuditSink::default();
        let ctx = self.inner.ctx.with_audit(Arc::new(audit.clone()));
        let (instance, step) = W::start(&ctx, input, started_at)?;
        let mut journal_state = JournalState::default();
        if let Err(error) = persist(&self.inner, &instance, step, &mut journal_state).await {
            instance.on_discard(&self.inner.ctx, None);
            return Err(error);
        }
        publish(&self.inner, &audit);

        reservation.host(self.spawn(instance.clone(), step, journal_state));
        info!(
            event_name = "workflow.instance.started",
            kind = W::KIND,
            instance_id = %instance_id,
            wake_at = ?step.wake_at(),
            "workflow instance started"
        );
        Ok(instance)
    }

    pub async fn signal(
        &self,
        instance_id: &InstanceId,
        signal: W::Signal,
    ) -> Result<W::Reply, ApplicationError> {
        let (reply, response) = oneshot::channel();
        self.deliver(instance_id, Command::Signal { signal, reply }).await?;
        response.await.map_err(|_| instance_stopped::<W>(instance_id))?
    }

    pub async fn snapshot(&self, instance_id: &InstanceId) -> Result<W, ApplicationError> {
        let (reply, response) = oneshot::channel();
        self.deliver(instance_id, Command::Snapshot { reply }).await?;
        response.await.map_err(|_| instance_stopped::<W>(instance_id))
    }

    /// Journaled state of every instance of this kind, running or completed, ordered by id.
    pub async fn snapshots(&self) -> Vec<W> {
        let records = match self.inner.journal.list(Some(W::KIND), true).await {
            Ok(records) => records,
            Err(error) => {
                error!(
                    event_name = "workflow.instance.list_failed",
                    kind = W::KIND,
                    error = %error,
                    "could not list journaled instances"
                );
                return Vec::new();
            }
        };

        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            match decode::<W>(&record) {
                Ok(instance) => snapshots.push(instance),
                Err(error) => warn!(
                    event_name = "workflow.instance.snapshot_failed",
                    kind = W::KIND,
                    instance_id = %record.instance_id,
                    error = %error,
                    "skipping instance in listing"
                ),
            }
        }
        snapshots
    }

    /// Number of instances with a live task.
    pub async fn len(&self) -> usize {
        self.inner.slots().values().filter(|slot| matches!(slot, Slot::Running(_))).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rehydrates every journaled instance of this kind that still has work to do.
    ///
    /// Completed records only get `on_resume` so shared state can be rebuilt from them. A record
    /// that fails to decode is logged and skipped so it cannot block the others.
    pub async fn resume(&self) -> Result<usize, ApplicationError> {
        let records = self
            .inner
            .journal
            .list(Some(W::KIND), true)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        let mut resumed = 0;
        for record in records {
            if self.inner.slots().contains_key(&record.instance_id) {
                continue;
            }

            let instance: W = match decode(&record) {
                Ok(instance) => instance,
                Err(error) => {
                    error!(
                        event_name = "workflow.instance.resume_failed",
                        kind = W::KIND,
                        instance_id = %record.instance_id,
                        error = %error,
                        "journaled state could not be decoded"
                    );
                    continue;
                }
            };

            let step = instance.on_resume(&self.inner.ctx);
            if step.is_complete() {
                continue;
            }

            let mut slots = self.inner.slots();
            if slots.contains_key(&record.instance_id) {
                continue;
            }
            let mailbox = self.spawn(instance, step, JournalState::resumed(&record));
            slots.insert(record.instance_id, Slot::Running(mailbox));
            resumed += 1;
        }

        info!(
            event_name = "workflow.instance.resumed",
            kind = W::KIND,
            resumed,
            "journaled instances resumed"
        );
        Ok(resumed)
    }

    /// Closes every mailbox; instance tasks exit once their queued inputs are drained.
    pub async fn shutdown(&self) {
        self.inner.slots().clear();
    }

    fn spawn(&self, instance: W, step: Step, journal_state: JournalState) -> mpsc::Sender<Command<W>> {
        let (mailbox, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(run_instance(Arc::clone(&self.inner), instance, step, journal_state, inbox));
        mailbox
    }

    /// Hands a command to the instance's task. A mailbox that closed in between belongs to an
    /// instance that just completed, so the second attempt reaches its journaled state.
    async fn deliver(
        &self,
        instance_id: &InstanceId,
        mut command: Command<W>,
    ) -> Result<(), ApplicationError> {
        for _ in 0..DELIVERY_ATTEMPTS {
            let mailbox = self.mailbox(instance_id).await?;
            match mailbox.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => command = returned,
            }
        }
        Err(instance_stopped::<W>(instance_id))
    }

    async fn mailbox(
        &self,
        instance_id: &InstanceId,
    ) -> Result<mpsc::Sender<Command<W>>, ApplicationError> {
        let hosted = match self.inner.slots().get(instance_id) {
            Some(Slot::Running(mailbox)) => Some(mailbox.clone()),
            Some(Slot::Starting) => return Err(not_found::<W>(instance_id)),
            None => None,
        };
        if let Some(mailbox) = hosted {
            return Ok(mailbox);
        }

        let record = self
            .load(instance_id)
            .await?
            .filter(|record| record.status == InstanceStatus::Completed)
            .ok_or_else(|| not_found::<W>(instance_id))?;
        let instance: W = decode(&record)?;
        let step = instance.on_resume(&self.inner.ctx);

        let mut slots = self.inner.slots();
        if let Some(Slot::Running(mailbox)) = slots.get(instance_id) {
            return Ok(mailbox.clone());
        }
        let mailbox = self.spawn(instance, step, JournalState::resumed(&record));
        slots.insert(instance_id.clone(), Slot::Running(mailbox.clone()));
        debug!(
            event_name = "workflow.instance.rehydrated",
            kind = W::KIND,
            instance_id = %instance_id,
            revision = record.revision,
            "completed instance loaded from the journal"
        );
        Ok(mailbox)
    }

    async fn load(&self, instance_id: &InstanceId) -> Result<Option<InstanceRecord>, ApplicationError> {
        self.inner
            .journal
            .load(W::KIND, instance_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))
    }
}

fn decode<W: DurableWorkflow>(record: &InstanceRecord) -> Result<W, ApplicationError> {
    serde_json::from_str(&record.state_json).map_err(|error| {
        ApplicationError::Persistence(format!(
            "journaled {} instance `{}` could not be decoded: {error}",
            W::KIND,
            record.instance_id
        ))
    })
}

fn not_found<W: DurableWorkflow>(instance_id: &InstanceId) -> ApplicationError {
    DomainError::not_found(W::KIND, instance_id.0.clone()).into()
}

fn instance_stopped<W: DurableWorkflow>(instance_id: &InstanceId) -> ApplicationError {
    ApplicationError::Runtime(format!("{} instance `{instance_id}` is not running", W::KIND))
}

fn publish<W: DurableWorkflow>(inner: &HostInner<W>, audit: &InMemoryAuditSink) {
    for event in audit.take() {
        inner.ctx.audit.emit(event);
    }
}

async fn run_instance<W: DurableWorkflow>(
    inner: Arc<HostInner<W>>,
    mut instance: W,
    mut step: Step,
    mut journal_state: JournalState,
    mut inbox: mpsc::Receiver<Command<W>>,
) {
    let instance_id = instance.instance_id();
    let mut retry_at: Option<Instant> = None;

    loop {
        let wake_at = step.wake_at();
        let delay = wake_at.map(|due_at| {
            let until_due = (due_at - inner.clock.now()).to_std().unwrap_or(StdDuration::ZERO);
            let until_retry =
                retry_at.map_or(StdDuration::ZERO, |at| at.saturating_duration_since(Instant::now()));
            until_due.max(until_retry)
        });

        tokio::select! {
            command = inbox.recv() => {
                let Some(command) = command else {
                    break;
                };
                handle(&inner, &mut instance, &mut step, &mut journal_state, command).await;
            }
            _ = tokio::time::sleep(delay.unwrap_or(StdDuration::ZERO)), if delay.is_some() => {
                if let Some(due_at) = wake_at {
                    debug!(
                        event_name = "workflow.timer.fired",
                        kind = W::KIND,
                        instance_id = %instance_id,
                        due_at = %due_at,
                        "timer fired"
                    );
                    let fired = commit_step(&inner, &mut instance, &mut step, &mut journal_state, |candidate, ctx| {
                        ((), candidate.on_timer(ctx, due_at))
                    })
                    .await;
                    match fired {
                        Ok(()) => retry_at = None,
                        Err(error) => {
                            error!(
                                event_name = "workflow.timer.persist_failed",
                                kind = W::KIND,
                                instance_id = %instance_id,
                                error = %error,
                                "timer outcome not journaled; it will fire again"
                            );
                            retry_at = Some(Instant::now() + inner.retry.backoff(inner.retry.max_retries));
                        }
                    }
                }
            }
        }

        if step.is_complete() {
            evict(&inner, &instance_id);
            inbox.close();
            while let Some(command) = inbox.recv().await {
                handle(&inner, &mut instance, &mut step, &mut journal_state, command).await;
            }
            break;
        }
    }

    debug!(
        event_name = "workflow.instance.stopped",
        kind = W::KIND,
        instance_id = %instance_id,
        "instance task exited"
    );
}

fn evict<W: DurableWorkflow>(inner: &HostInner<W>, instance_id: &InstanceId) {
    let mut slots = inner.slots();
    if matches!(slots.get(instance_id), Some(Slot::Running(_))) {
        slots.remove(instance_id);
    }
    debug!(
        event_name = "workflow.instance.evicted",
        kind = W::KIND,
        instance_id = %instance_id,
        "completed instance left the host"
    );
}

async fn handle<W: DurableWorkflow>(
    inner: &HostInner<W>,
    instance: &mut W,
    step: &mut Step,
    journal_state: &mut JournalState,
    command: Command<W>,
) {
    match command {
        Command::Signal { signal, reply } => {
            let received_at = inner.clock.now();
            debug!(
                event_name = "workflow.signal.received",
                kind = W::KIND,
                instance_id = %instance.instance_id(),
                signal = ?signal,
                "handling signal"
            );
            let outcome = commit_step(inner, instance, step, journal_state, |candidate, ctx| {
                candidate.on_signal(ctx, signal, received_at)
            })
            .await
            .and_then(|result| result.map_err(ApplicationError::from));
            let _ = reply.send(outcome);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(instance.clone());
        }
    }
}

/// Applies one step to a copy of the instance and keeps it only once the journal has it.
///
/// Audit events raised by the step are published after the write; on failure they are dropped
/// together with the copy.
async fn commit_step<W, R>(
    inner: &HostInner<W>,
    instance: &mut W,
    step: &mut Step,
    journal_state: &mut JournalState,
    apply: impl FnOnce(&mut W, &WorkflowContext) -> (R, Step),
) -> Result<R, ApplicationError>
where
    W: DurableWorkflow,
{
    let audit = InMemoryAuditSink::default();
    let ctx = inner.ctx.with_audit(Arc::new(audit.clone()));
    let mut candidate = instance.clone();
    let (output, next) = apply(&mut candidate, &ctx);

    if let Err(error) = persist(inner, &candidate, next, journal_state).await {
        candidate.on_discard(&inner.ctx, Some(&*instance));
        return Err(error);
    }

    *instance = candidate;
    *step = next;
    publish(inner, &audit);
    Ok(output)
}

async fn persist<W: DurableWorkflow>(
    inner: &HostInner<W>,
    instance: &W,
    step: Step,
    journal_state: &mut JournalState,
) -> Result<(), ApplicationError> {
    let state_json = serde_json::to_string(instance).map_err(|error| {
        ApplicationError::Runtime(format!("could not serialize {} instance: {error}", W::KIND))
    })?;
    let status = if step.is_complete() { InstanceStatus::Completed } else { InstanceStatus::Running };
    let fingerprint = (state_json, step.wake_at(), status);
    if journal_state.last_saved.as_ref() == Some(&fingerprint) {
        return Ok(());
    }

    let record = InstanceRecord {
        kind: W::KIND.to_owned(),
        instance_id: instance.instance_id(),
        status,
        state_json: fingerprint.0.clone(),
        wake_at: fingerprint.1,
        revision: journal_state.revision + 1,
        updated_at: inner.clock.now(),
    };

    let mut attempt = 0;
    loop {
        match inner.journal.save(&record).await {
            Ok(()) => {
                journal_state.revision = record.revision;
                journal_state.last_saved = Some(fingerprint);
                return Ok(());
            }
            Err(error) if attempt < inner.retry.max_retries => {
                warn!(
                    event_name = "workflow.journal.retry",
                    kind = W::KIND,
                    instance_id = %record.instance_id,
                    attempt,
                    max_retries = inner.retry.max_retries,
                    error = %error,
                    "journal write failed; retrying"
                );
                tokio::time::sleep(inner.retry.backoff(attempt)).await;
                attempt += 1;
            }
            Err(error) => {
                error!(
                    event_name = "workflow.journal.failed",
                    kind = W::KIND,
                    instance_id = %record.instance_id,
                    error = %error,
                    "journal write failed after retries"
                );
                return Err(ApplicationError::Persistence(error.to_string()));
            }
        }
    }
}
