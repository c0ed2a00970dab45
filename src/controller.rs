//! Job admission controller.
//!
//! Owns the lifecycle of every document between enqueue and a terminal state.
//! Two independent background loops drive the work, both reading their
//! worklists from the [`Ledger`]:
//!
//! - the submission loop walks `Pending` records oldest first, acquires a
//!   concurrency slot and then a start-rate token, and hands the submit call to
//!   a worker task;
//! - the polling loop walks `Submitted`/`Polling` records, acquires a
//!   poll-rate token per due record and hands the status check to a worker
//!   task.
//!
//! Every provider call is bounded by `call_timeout_ms` and by the document's
//! own deadline, so a call that never returns cannot hold a slot or a claim
//! past the document timeout.
//!
//! # Key Invariants
//!
//! - A record is written to the ledger before the in-memory effect of its
//!   transition becomes visible: slots are released only after the terminal
//!   (or retry) state is durable.
//! - A slot is held from the accepted submit call until the record leaves
//!   `Submitted`/`Polling`, and is released exactly once (slots live in a map
//!   keyed by document id; releasing removes the entry).
//! - At most one task works on a document at a time (claim set).
//! - Throttled and transient errors never reach the caller. They narrow the
//!   limiter and schedule a retry; only `Abandoned` surfaces as a failure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slatedb::object_store::ObjectStore;
use thiserror::Error;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffPolicy, NoRetryReason, RetryDecision};
use crate::classify::{ErrorClass, ServiceError};
use crate::clock::Clock;
use crate::concurrency::{ConcurrencyGate, Slot, SlotError};
use crate::job::{
    DocumentRef, ExtractionMode, FailureKind, InvalidTransition, JobRecord, JobState, RetryRecord,
    generate_document_id,
};
use crate::ledger::{Ledger, LedgerError};
use crate::metrics::Metrics;
use crate::service::{ExtractionService, PollStatus, SubmitRequest, output_key};
use crate::settings::{AppConfig, QuotaSettings, SettingsError};
use crate::storage::put_object;
use crate::token_bucket::{InvalidLimiter, OperationLimiters, TokenBucket};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Limiter(#[from] InvalidLimiter),
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("document {0} not found")]
    NotFound(String),
    #[error("document {document_id} is {state}; only abandoned documents can be requeued")]
    NotRequeueable {
        document_id: String,
        state: JobState,
    },
    #[error("timed out with {unsettled} document(s) still in progress")]
    SettleTimeout { unsettled: usize },
    #[error("controller is shut down")]
    ShutDown,
}

/// A lifecycle transition, broadcast after it has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub document_id: String,
    pub state: JobState,
    pub attempt: u32,
    pub error: Option<ServiceError>,
    pub failure: Option<FailureKind>,
}

/// One document to process.
#[derive(Debug, Clone)]
pub struct DocumentRequest {
    pub document_id: String,
    pub document: DocumentRef,
    pub mode: ExtractionMode,
}

impl DocumentRequest {
    pub fn new(document_id: impl Into<String>, document: DocumentRef, mode: ExtractionMode) -> Self {
        Self {
            document_id: document_id.into(),
            document,
            mode,
        }
    }

    /// A request with a generated document id.
    pub fn generated(document: DocumentRef, mode: ExtractionMode) -> Self {
        Self::new(generate_document_id(), document, mode)
    }
}

/// Terminal outcome of a set of documents.
#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub succeeded: Vec<JobRecord>,
    pub abandoned: Vec<JobRecord>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// What [`AdmissionController::recover`] found in the ledger.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub pending: usize,
    pub in_flight: usize,
    /// In-flight documents that did not fit under the current concurrency limit
    pub over_capacity: Vec<String>,
    /// `Failed` records whose retry decision had not been persisted
    pub resolved_failed: usize,
}

/// Where output of succeeded jobs is written.
#[derive(Clone)]
pub struct OutputSink {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

/// Removes the document from the claim set when dropped.
struct Claim {
    document_id: String,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.lock().unwrap().remove(&self.document_id);
    }
}

/// How long [`Inner::persist_with`] keeps retrying a failed ledger write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteRetry {
    /// Give up once shutdown has started.
    UntilShutdown,
    /// Keep retrying through shutdown.
    UntilDurable,
}

enum SweepEnd {
    Finished,
    Blocked,
    Stopped,
}

struct Inner {
    service: Arc<dyn ExtractionService>,
    ledger: Arc<dyn Ledger>,
    output: Option<OutputSink>,
    gate: ConcurrencyGate,
    limiters: OperationLimiters,
    backoff: BackoffPolicy,
    quota: QuotaSettings,
    clock: Clock,
    metrics: Metrics,
    slots: Mutex<HashMap<String, Slot>>,
    claims: Arc<Mutex<HashSet<String>>>,
    enqueue_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<JobEvent>,
    wake_submit: Notify,
    wake_poll: Notify,
    settled: Notify,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

pub struct ControllerBuilder {
    config: AppConfig,
    service: Arc<dyn ExtractionService>,
    ledger: Arc<dyn Ledger>,
    output: Option<OutputSink>,
    clock: Option<Clock>,
}

impl ControllerBuilder {
    pub fn output_store(mut self, store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        self.output = Some(OutputSink {
            store,
            bucket: bucket.into(),
        });
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<AdmissionController, ControllerError> {
        self.config.validate()?;
        let quota = self.config.quota.clone();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let inner = Inner {
            service: self.service,
            ledger: self.ledger,
            output: self.output,
            gate: ConcurrencyGate::new(quota.max_in_flight()),
            limiters: OperationLimiters::from_settings(&quota)?,
            backoff: BackoffPolicy::from_settings(&self.config.backoff),
            clock: self.clock.unwrap_or_default(),
            metrics: Metrics::new()?,
            quota,
            slots: Mutex::new(HashMap::new()),
            claims: Arc::new(Mutex::new(HashSet::new())),
            enqueue_lock: tokio::sync::Mutex::new(()),
            events,
            wake_submit: Notify::new(),
            wake_poll: Notify::new(),
            settled: Notify::new(),
            shutdown,
            running: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        };
        Ok(AdmissionController {
            inner: Arc::new(inner),
        })
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn builder(
        config: AppConfig,
        service: Arc<dyn ExtractionService>,
        ledger: Arc<dyn Ledger>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            config,
            service,
            ledger,
            output: None,
            clock: None,
        }
    }

    /// Add a document in `Pending`. Idempotent per document id: an existing
    /// record is returned unchanged, whatever its state.
    pub async fn enqueue(&self, request: DocumentRequest) -> Result<JobRecord, ControllerError> {
        let inner = &self.inner;
        let _guard = inner.enqueue_lock.lock().await;
        if let Some(existing) = inner.ledger.get(&request.document_id).await? {
            debug!(document_id = %request.document_id, state = %existing.state, "document already known");
            return Ok(existing);
        }
        let record = JobRecord::new(
            request.document_id,
            request.document,
            request.mode,
            inner.clock.now_ms(),
        );
        inner.ledger.put(&record).await?;
        info!(document_id = %record.document_id, document = %record.document, "enqueued document");
        inner.emit(&record);
        inner.wake_submit.notify_one();
        Ok(record)
    }

    pub async fn enqueue_batch<I>(&self, requests: I) -> Result<Vec<JobRecord>, ControllerError>
    where
        I: IntoIterator<Item = DocumentRequest>,
    {
        let mut records = Vec::new();
        for request in requests {
            records.push(self.enqueue(request).await?);
        }
        Ok(records)
    }

    /// Give an abandoned document a fresh lifecycle and attempt budget.
    pub async fn requeue(&self, document_id: &str) -> Result<JobRecord, ControllerError> {
        let inner = &self.inner;
        let _guard = inner.enqueue_lock.lock().await;
        let _claim = inner.claim(document_id);
        let record = inner
            .ledger
            .get(document_id)
            .await?
            .ok_or_else(|| ControllerError::NotFound(document_id.to_string()))?;
        if record.state != JobState::Abandoned {
            return Err(ControllerError::NotRequeueable {
                document_id: document_id.to_string(),
                state: record.state,
            });
        }
        let fresh = record.requeued(inner.clock.now_ms());
        inner.ledger.put(&fresh).await?;
        info!(document_id = %document_id, generation = fresh.generation, "requeued abandoned document");
        inner.emit(&fresh);
        inner.wake_submit.notify_one();
        Ok(fresh)
    }

    /// Rebuild in-memory state from the ledger: re-reserve slots for jobs that
    /// are already running and settle `Failed` records left mid-decision.
    pub async fn recover(&self) -> Result<RecoveryReport, ControllerError> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        for record in inner.ledger.list_by_state(JobState::Failed).await? {
            inner.resolve_failed(record).await?;
            report.resolved_failed += 1;
        }

        let mut holders = Vec::new();
        for state in [JobState::Submitted, JobState::Polling] {
            for record in inner.ledger.list_by_state(state).await? {
                holders.push(record.document_id);
            }
        }
        report.in_flight = holders.len();
        let outcome = inner.gate.hydrate(holders);
        {
            let mut slots = inner.slots.lock().unwrap();
            for slot in outcome.restored {
                slots.insert(slot.holder().to_string(), slot);
            }
        }
        report.over_capacity = outcome.over_capacity;
        report.pending = inner.ledger.list_by_state(JobState::Pending).await?.len();
        inner.update_in_flight_gauge();

        info!(
            pending = report.pending,
            in_flight = report.in_flight,
            over_capacity = report.over_capacity.len(),
            resolved_failed = report.resolved_failed,
            "recovered controller state from ledger"
        );
        Ok(report)
    }

    /// Recover from the ledger and spawn the submission and polling loops.
    pub async fn start(&self) -> Result<RecoveryReport, ControllerError> {
        if self.inner.is_shutting_down() {
            return Err(ControllerError::ShutDown);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(RecoveryReport::default());
        }
        let report = self.recover().await?;
        let submit = tokio::spawn(Arc::clone(&self.inner).submission_loop());
        let poll = tokio::spawn(Arc::clone(&self.inner).polling_loop());
        self.inner.loops.lock().unwrap().extend([submit, poll]);
        Ok(report)
    }

    /// Stop both loops and wait for in-progress submit calls to be recorded.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.gate.close();
        let handles: Vec<_> = self.inner.loops.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "controller loop ended abnormally");
            }
        }
        info!("admission controller stopped");
    }

    /// Wait until every listed document is `Succeeded` or `Abandoned`.
    pub async fn wait_settled(
        &self,
        document_ids: &[String],
        timeout: Duration,
    ) -> Result<BatchReport, ControllerError> {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut report = BatchReport::default();
            let mut unsettled = 0;
            for id in document_ids {
                match inner.ledger.get(id).await? {
                    Some(r) if r.state == JobState::Succeeded => report.succeeded.push(r),
                    Some(r) if r.state == JobState::Abandoned => report.abandoned.push(r),
                    Some(_) => unsettled += 1,
                    None => return Err(ControllerError::NotFound(id.clone())),
                }
            }
            if unsettled == 0 {
                return Ok(report);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ControllerError::SettleTimeout { unsettled });
            }
            let recheck = (now + inner.quota.poll_sweep()).min(deadline);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(recheck) => {}
            }
        }
    }

    /// Enqueue every request and wait for all of them to settle.
    pub async fn process_batch<I>(
        &self,
        requests: I,
        timeout: Duration,
    ) -> Result<BatchReport, ControllerError>
    where
        I: IntoIterator<Item = DocumentRequest>,
    {
        let records = self.enqueue_batch(requests).await?;
        let ids: Vec<String> = records.into_iter().map(|r| r.document_id).collect();
        self.wait_settled(&ids, timeout).await
    }

    pub async fn get(&self, document_id: &str) -> Result<Option<JobRecord>, ControllerError> {
        Ok(self.inner.ledger.get(document_id).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// `(in_flight, max_in_flight)` of the concurrency gate.
    pub fn current_load(&self) -> (usize, usize) {
        self.inner.gate.current_load()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    pub fn start_limiter(&self) -> &TokenBucket {
        &self.inner.limiters.start
    }

    pub fn poll_limiter(&self) -> &TokenBucket {
        &self.inner.limiters.poll
    }

    /// Limiter for synchronous detect calls made outside the controller.
    pub fn detect_limiter(&self) -> &TokenBucket {
        &self.inner.limiters.detect
    }
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn claim(&self, document_id: &str) -> Option<Claim> {
        if !self.claims.lock().unwrap().insert(document_id.to_string()) {
            return None;
        }
        Some(Claim {
            document_id: document_id.to_string(),
            claims: Arc::clone(&self.claims),
        })
    }

    fn emit(&self, record: &JobRecord) {
        // No subscribers is fine
        let _ = self.events.send(JobEvent {
            document_id: record.document_id.clone(),
            state: record.state,
            attempt: record.attempt,
            error: record.last_error.clone(),
            failure: record.failure,
        });
    }

    fn update_in_flight_gauge(&self) {
        self.metrics.set_in_flight(self.gate.current_load().0);
    }

    fn release_slot(&self, document_id: &str) {
        let slot = self.slots.lock().unwrap().remove(document_id);
        if let Some(slot) = slot {
            self.gate.release_slot(slot);
            self.update_in_flight_gauge();
            self.wake_submit.notify_one();
        }
    }

    fn timed_out(&self, record: &JobRecord, now_ms: i64) -> bool {
        record.age_ms(now_ms) >= self.quota.document_timeout_ms as i64
    }

    /// Latest instant a provider call for `record` may run until.
    fn call_deadline(&self, record: &JobRecord) -> Instant {
        let now = Instant::now();
        let age_ms = record.age_ms(self.clock.now_ms());
        let remaining_ms = (self.quota.document_timeout_ms as i64 - age_ms).max(0) as u64;
        (now + self.quota.call_timeout()).min(now + Duration::from_millis(remaining_ms))
    }

    /// Write `record`, retrying while the ledger is unavailable. Progress on a
    /// document waits for its record to be durable.
    async fn persist(&self, record: &JobRecord) -> Result<(), ControllerError> {
        self.persist_with(record, WriteRetry::UntilShutdown).await
    }

    async fn persist_with(&self, record: &JobRecord, mode: WriteRetry) -> Result<(), ControllerError> {
        let mut failures = 0u32;
        loop {
            match self.ledger.put(record).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    failures += 1;
                    if mode == WriteRetry::UntilShutdown && self.is_shutting_down() {
                        return Err(err.into());
                    }
                    let delay = self.backoff.transient.jittered(failures);
                    warn!(
                        document_id = %record.document_id,
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "ledger write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Transition, persist, then announce.
    async fn commit(&self, record: &mut JobRecord, next: JobState) -> Result<(), ControllerError> {
        self.commit_with(record, next, WriteRetry::UntilShutdown).await
    }

    async fn commit_with(
        &self,
        record: &mut JobRecord,
        next: JobState,
        mode: WriteRetry,
    ) -> Result<(), ControllerError> {
        let from = record.state;
        record.transition(next, self.clock.now_ms())?;
        self.persist_with(record, mode).await?;
        debug!(
            document_id = %record.document_id,
            from = %from,
            to = %next,
            attempt = record.attempt,
            "job transition"
        );
        self.emit(record);
        Ok(())
    }

    async fn abandon(&self, mut record: JobRecord, kind: FailureKind) -> Result<(), ControllerError> {
        record.failure = Some(kind);
        self.commit(&mut record, JobState::Abandoned).await?;
        warn!(
            document_id = %record.document_id,
            failure = ?kind,
            attempt = record.attempt,
            error = ?record.last_error,
            "abandoned document"
        );
        self.release_slot(&record.document_id);
        self.metrics.record_terminal(JobState::Abandoned.as_str());
        self.settled.notify_waiters();
        Ok(())
    }

    fn record_retry(&self, record: &mut JobRecord, class: ErrorClass, n: u32, delay: Duration) {
        let now = self.clock.now_ms();
        let ceiling = self.backoff.ceiling(class, n).unwrap_or_default();
        record.not_before_ms = now + delay.as_millis() as i64;
        record.updated_at_ms = now;
        record.retries.push(RetryRecord {
            class,
            delay_ms: delay.as_millis() as u64,
            ceiling_ms: ceiling.as_millis() as u64,
            at_ms: now,
        });
        self.metrics.record_retry(class.as_str());
        info!(
            document_id = %record.document_id,
            class = %class,
            failures = n,
            delay_ms = delay.as_millis() as u64,
            "scheduled retry"
        );
    }

    fn note_throttled(&self, limiter: &TokenBucket, err: &ServiceError) {
        if err.class == ErrorClass::Throttled {
            limiter.on_throttled();
            self.metrics.record_throttled(limiter.name());
        }
    }

    async fn submission_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut workers: JoinSet<Result<(), ControllerError>> = JoinSet::new();
        debug!("submission loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.submission_sweep(&mut shutdown, &mut workers).await {
                Ok(SweepEnd::Stopped) => break,
                Ok(SweepEnd::Finished) | Ok(SweepEnd::Blocked) => {}
                Err(err) => error!(error = %err, "submission sweep failed"),
            }
            while let Some(res) = workers.try_join_next() {
                log_worker_result("submit", res);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.quota.submit_sweep()) => {}
                _ = self.wake_submit.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
        // Let submit calls already on the wire record their outcome
        while let Some(res) = workers.join_next().await {
            log_worker_result("submit", res);
        }
        debug!("submission loop stopped");
    }

    async fn submission_sweep(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
        workers: &mut JoinSet<Result<(), ControllerError>>,
    ) -> Result<SweepEnd, ControllerError> {
        let pending = self.ledger.list_by_state(JobState::Pending).await?;
        for listed in pending {
            if *shutdown.borrow() {
                return Ok(SweepEnd::Stopped);
            }
            let now = self.clock.now_ms();
            if !self.timed_out(&listed, now) && !listed.is_due(now) {
                continue;
            }
            let Some(claim) = self.claim(&listed.document_id) else {
                continue;
            };
            // The listing may be stale by the time the claim is taken
            let Some(record) = self.ledger.get(&listed.document_id).await? else {
                continue;
            };
            if record.state != JobState::Pending {
                continue;
            }
            if self.timed_out(&record, now) {
                self.abandon(record, FailureKind::TimedOut).await?;
                continue;
            }
            if !record.is_due(now) {
                continue;
            }

            let slot_deadline = Instant::now() + self.quota.slot_wait();
            let slot = tokio::select! {
                res = self.gate.acquire_slot(&record.document_id, slot_deadline) => res,
                _ = shutdown.changed() => return Ok(SweepEnd::Stopped),
            };
            let slot = match slot {
                Ok(slot) => slot,
                Err(SlotError::TimedOut) => {
                    debug!(document_id = %record.document_id, "no concurrency slot before deadline; deferring");
                    return Ok(SweepEnd::Blocked);
                }
                Err(SlotError::Closed) => return Ok(SweepEnd::Stopped),
                Err(err @ SlotError::AlreadyHeld(_)) => {
                    warn!(document_id = %record.document_id, error = %err, "skipping document");
                    continue;
                }
            };
            self.update_in_flight_gauge();

            let waited_from = Instant::now();
            let token_deadline = waited_from + self.quota.token_wait();
            let token = tokio::select! {
                res = self.limiters.start.acquire(1, token_deadline) => res,
                _ = shutdown.changed() => {
                    self.gate.release_slot(slot);
                    self.update_in_flight_gauge();
                    return Ok(SweepEnd::Stopped);
                }
            };
            match token {
                Ok(granted_at) => {
                    self.metrics
                        .observe_rate_limit_wait("start", granted_at - waited_from);
                }
                Err(err) => {
                    debug!(document_id = %record.document_id, error = %err, "no start token before deadline; deferring");
                    self.gate.release_slot(slot);
                    self.update_in_flight_gauge();
                    return Ok(SweepEnd::Blocked);
                }
            }

            workers.spawn(Arc::clone(self).submit_call(record, slot, claim));
        }
        Ok(SweepEnd::Finished)
    }

    /// Issue the submit call for an admitted document holding `slot`.
    async fn submit_call(
        self: Arc<Self>,
        mut record: JobRecord,
        slot: Slot,
        _claim: Claim,
    ) -> Result<(), ControllerError> {
        let request = SubmitRequest {
            document_id: record.document_id.clone(),
            document: record.document.clone(),
            mode: record.mode.clone(),
            client_token: format!(
                "{}-{}-{}",
                record.document_id, record.generation, record.attempt
            ),
        };
        self.metrics.record_submit_call();
        let deadline = self.call_deadline(&record);
        let result = match tokio::time::timeout_at(deadline, self.service.submit_job(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::transient("submit call timed out")),
        };
        match result {
            Ok(job_id) => {
                let now = self.clock.now_ms();
                record.job_id = Some(job_id);
                record.submitted_at_ms = Some(now);
                record.poll_failures = 0;
                record.not_before_ms = now + self.quota.min_poll_interval().as_millis() as i64;
                // The provider accepted the job; losing this write would resubmit it
                self.commit_with(&mut record, JobState::Submitted, WriteRetry::UntilDurable)
                    .await?;
                info!(
                    document_id = %record.document_id,
                    document = record.document.name(),
                    job_id = record.job_id.as_deref().unwrap_or_default(),
                    attempt = record.attempt,
                    "submitted extraction job"
                );
                self.slots
                    .lock()
                    .unwrap()
                    .insert(record.document_id.clone(), slot);
                self.commit(&mut record, JobState::Polling).await?;
                self.wake_poll.notify_one();
                Ok(())
            }
            Err(err) => {
                self.gate.release_slot(slot);
                self.update_in_flight_gauge();
                self.note_throttled(&self.limiters.start, &err);
                record.attempt += 1;
                let class = err.class;
                debug!(
                    document_id = %record.document_id,
                    error = %err,
                    retryable = class.is_retryable(),
                    "submit call failed"
                );
                record.last_error = Some(err);
                if self.timed_out(&record, self.clock.now_ms()) {
                    return self.abandon(record, FailureKind::TimedOut).await;
                }
                match self.backoff.next_delay(class, record.attempt) {
                    RetryDecision::RetryAfter(delay) => {
                        let n = record.attempt;
                        self.record_retry(&mut record, class, n, delay);
                        self.persist(&record).await
                    }
                    RetryDecision::NoRetry(reason) => {
                        self.abandon(record, failure_kind(reason)).await
                    }
                }
            }
        }
    }

    async fn polling_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut workers: JoinSet<Result<(), ControllerError>> = JoinSet::new();
        debug!("polling loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.polling_sweep(&mut shutdown, &mut workers).await {
                Ok(SweepEnd::Stopped) => break,
                Ok(SweepEnd::Finished) | Ok(SweepEnd::Blocked) => {}
                Err(err) => error!(error = %err, "polling sweep failed"),
            }
            while let Some(res) = workers.try_join_next() {
                log_worker_result("poll", res);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.quota.poll_sweep()) => {}
                _ = self.wake_poll.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
        while let Some(res) = workers.join_next().await {
            log_worker_result("poll", res);
        }
        debug!("polling loop stopped");
    }

    async fn polling_sweep(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
        workers: &mut JoinSet<Result<(), ControllerError>>,
    ) -> Result<SweepEnd, ControllerError> {
        let mut active = self.ledger.list_by_state(JobState::Submitted).await?;
        active.extend(self.ledger.list_by_state(JobState::Polling).await?);
        active.sort_by_key(|r| r.not_before_ms);

        for listed in active {
            if *shutdown.borrow() {
                return Ok(SweepEnd::Stopped);
            }
            let now = self.clock.now_ms();
            if !self.timed_out(&listed, now) && !listed.is_due(now) {
                continue;
            }
            // A document whose status check is still running stays claimed
            let Some(claim) = self.claim(&listed.document_id) else {
                continue;
            };
            let Some(mut record) = self.ledger.get(&listed.document_id).await? else {
                continue;
            };
            if !record.state.holds_slot() {
                continue;
            }
            if self.timed_out(&record, now) {
                self.abandon(record, FailureKind::TimedOut).await?;
                continue;
            }
            if !record.is_due(now) {
                continue;
            }
            if record.state == JobState::Submitted {
                self.commit(&mut record, JobState::Polling).await?;
            }

            let waited_from = Instant::now();
            let token_deadline = waited_from + self.quota.token_wait();
            let token = tokio::select! {
                res = self.limiters.poll.acquire(1, token_deadline) => res,
                _ = shutdown.changed() => return Ok(SweepEnd::Stopped),
            };
            match token {
                Ok(granted_at) => {
                    self.metrics
                        .observe_rate_limit_wait("poll", granted_at - waited_from);
                }
                Err(err) => {
                    debug!(error = %err, "no poll token before deadline; ending sweep");
                    return Ok(SweepEnd::Blocked);
                }
            }
            workers.spawn(Arc::clone(self).poll_worker(record, claim));
        }
        Ok(SweepEnd::Finished)
    }

    async fn poll_worker(
        self: Arc<Self>,
        record: JobRecord,
        _claim: Claim,
    ) -> Result<(), ControllerError> {
        self.poll_once(record).await
    }

    async fn poll_once(&self, mut record: JobRecord) -> Result<(), ControllerError> {
        let Some(job_id) = record.job_id.clone() else {
            record.last_error = Some(ServiceError::permanent(
                "MissingJobId",
                "record is in flight without a job handle",
            ));
            return self.abandon(record, FailureKind::Permanent).await;
        };
        self.metrics.record_poll_call();
        record.last_polled_at_ms = Some(self.clock.now_ms());

        let deadline = self.call_deadline(&record);
        let result = match tokio::time::timeout_at(deadline, self.service.poll_job(&job_id)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::transient("status call timed out")),
        };
        match result {
            Ok(PollStatus::InProgress) => {
                let now = self.clock.now_ms();
                record.poll_failures = 0;
                record.not_before_ms = now + self.quota.min_poll_interval().as_millis() as i64;
                record.updated_at_ms = now;
                self.persist(&record).await
            }
            Ok(PollStatus::Succeeded(output)) => {
                if let Some(sink) = &self.output {
                    let key = output_key(&record.document_id);
                    if let Err(err) =
                        put_object(sink.store.as_ref(), &sink.bucket, &key, output.body).await
                    {
                        let err = ServiceError::transient(format!("output write failed: {err}"));
                        return self.poll_call_failed(record, err).await;
                    }
                    record.output_key = Some(key);
                }
                record.poll_failures = 0;
                self.commit(&mut record, JobState::Succeeded).await?;
                info!(document_id = %record.document_id, job_id = %job_id, "extraction job succeeded");
                self.release_slot(&record.document_id);
                self.metrics.record_terminal(JobState::Succeeded.as_str());
                self.settled.notify_waiters();
                Ok(())
            }
            Ok(PollStatus::Failed(err)) => {
                warn!(document_id = %record.document_id, job_id = %job_id, error = %err, "extraction job failed");
                self.note_throttled(&self.limiters.start, &err);
                record.last_error = Some(err);
                self.commit(&mut record, JobState::Failed).await?;
                self.release_slot(&record.document_id);
                self.resolve_failed(record).await
            }
            Err(err) => self.poll_call_failed(record, err).await,
        }
    }

    /// The status call itself failed; the job keeps running at the provider.
    async fn poll_call_failed(
        &self,
        mut record: JobRecord,
        err: ServiceError,
    ) -> Result<(), ControllerError> {
        self.note_throttled(&self.limiters.poll, &err);
        record.poll_failures += 1;
        let class = err.class;
        record.last_error = Some(err);
        if self.timed_out(&record, self.clock.now_ms()) {
            return self.abandon(record, FailureKind::TimedOut).await;
        }
        match self.backoff.next_delay(class, record.poll_failures) {
            RetryDecision::RetryAfter(delay) => {
                let n = record.poll_failures;
                self.record_retry(&mut record, class, n, delay);
                self.persist(&record).await
            }
            RetryDecision::NoRetry(reason) => self.abandon(record, failure_kind(reason)).await,
        }
    }

    /// Decide what follows a persisted `Failed`: back to `Pending` after a
    /// delay, or `Abandoned`.
    async fn resolve_failed(&self, mut record: JobRecord) -> Result<(), ControllerError> {
        let class = record
            .last_error
            .as_ref()
            .map(|e| e.class)
            .unwrap_or(ErrorClass::Transient);
        record.attempt += 1;
        match self.backoff.next_delay(class, record.attempt) {
            RetryDecision::RetryAfter(delay) => {
                let n = record.attempt;
                self.record_retry(&mut record, class, n, delay);
                record.job_id = None;
                record.submitted_at_ms = None;
                record.poll_failures = 0;
                self.commit(&mut record, JobState::Pending).await?;
                self.wake_submit.notify_one();
                Ok(())
            }
            RetryDecision::NoRetry(reason) => self.abandon(record, failure_kind(reason)).await,
        }
    }
}

fn failure_kind(reason: NoRetryReason) -> FailureKind {
    match reason {
        NoRetryReason::Permanent => FailureKind::Permanent,
        NoRetryReason::Exhausted => FailureKind::Exhausted,
    }
}

fn log_worker_result(kind: &str, res: Result<Result<(), ControllerError>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(worker = kind, error = %err, "worker failed"),
        Err(err) => error!(worker = kind, error = %err, "worker panicked"),
    }
}
