#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use textract_quota::classify::ServiceError;
use textract_quota::controller::{AdmissionController, DocumentRequest};
use textract_quota::job::{DocumentRef, ExtractionMode, JobRecord, JobState};
use textract_quota::ledger::Ledger;
use textract_quota::service::{ExtractionService, JobOutput, PollStatus, SubmitRequest};
use textract_quota::settings::AppConfig;
use tokio::time::Instant;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

/// One scripted answer to a status check.
#[derive(Debug, Clone)]
pub enum PollStep {
    InProgress,
    Succeeded,
    /// The job itself failed at the provider
    JobFailed(ServiceError),
    /// The status call failed
    CallFailed(ServiceError),
}

#[derive(Debug, Default)]
struct DocScript {
    submits: VecDeque<Result<(), ServiceError>>,
    polls: VecDeque<PollStep>,
}

#[derive(Debug)]
struct ProviderJob {
    document_id: String,
    started: Instant,
    done: bool,
}

#[derive(Debug, Default)]
struct ServiceState {
    scripts: HashMap<String, DocScript>,
    jobs: HashMap<String, ProviderJob>,
    submit_calls: Vec<(String, Instant)>,
    poll_calls: Vec<(String, Instant)>,
    active: usize,
    max_active: usize,
    next_job: u64,
    hung_submits: HashSet<String>,
    hung_polls: HashSet<String>,
    submit_delays: HashMap<String, Duration>,
}

/// How long a call stalls before answering.
enum Stall {
    None,
    For(Duration),
    Forever,
}

impl Stall {
    async fn wait(self) {
        match self {
            Stall::None => {}
            Stall::For(delay) => tokio::time::sleep(delay).await,
            Stall::Forever => std::future::pending::<()>().await,
        }
    }
}

/// Fake extraction service.
///
/// Each document may carry a script of submit and poll outcomes. Once a
/// document's poll script is used up, its job reports `InProgress` until
/// `job_duration` has passed since submission and `Succeeded` after that.
pub struct ScriptedService {
    state: Mutex<ServiceState>,
    job_duration: Duration,
}

impl ScriptedService {
    pub fn new(job_duration: Duration) -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            job_duration,
        }
    }

    pub fn new_arc(job_duration: Duration) -> Arc<Self> {
        Arc::new(Self::new(job_duration))
    }

    pub fn script_submits(&self, document_id: &str, steps: Vec<Result<(), ServiceError>>) {
        let mut st = self.state.lock().unwrap();
        st.scripts
            .entry(document_id.to_string())
            .or_default()
            .submits
            .extend(steps);
    }

    pub fn script_polls(&self, document_id: &str, steps: Vec<PollStep>) {
        let mut st = self.state.lock().unwrap();
        st.scripts
            .entry(document_id.to_string())
            .or_default()
            .polls
            .extend(steps);
    }

    /// Submit calls for `document_id` never return.
    pub fn hang_submits(&self, document_id: &str) {
        let mut st = self.state.lock().unwrap();
        st.hung_submits.insert(document_id.to_string());
    }

    /// Status calls for jobs of `document_id` never return.
    pub fn hang_polls(&self, document_id: &str) {
        let mut st = self.state.lock().unwrap();
        st.hung_polls.insert(document_id.to_string());
    }

    /// Submit calls for `document_id` answer after `delay`; the job is
    /// created when the answer is sent.
    pub fn delay_submits(&self, document_id: &str, delay: Duration) {
        let mut st = self.state.lock().unwrap();
        st.submit_delays.insert(document_id.to_string(), delay);
    }

    /// Register a job that was started before the controller under test existed.
    pub fn register_running_job(&self, job_id: &str, document_id: &str) {
        let mut st = self.state.lock().unwrap();
        st.jobs.insert(
            job_id.to_string(),
            ProviderJob {
                document_id: document_id.to_string(),
                started: Instant::now(),
                done: false,
            },
        );
        st.active += 1;
        st.max_active = st.max_active.max(st.active);
    }

    pub fn submit_count(&self, document_id: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.submit_calls
            .iter()
            .filter(|(id, _)| id == document_id)
            .count()
    }

    pub fn total_submits(&self) -> usize {
        self.state.lock().unwrap().submit_calls.len()
    }

    pub fn poll_count(&self, document_id: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.poll_calls
            .iter()
            .filter(|(id, _)| id == document_id)
            .count()
    }

    pub fn submit_instants(&self) -> Vec<Instant> {
        let st = self.state.lock().unwrap();
        st.submit_calls.iter().map(|(_, at)| *at).collect()
    }

    pub fn poll_instants(&self) -> Vec<Instant> {
        let st = self.state.lock().unwrap();
        st.poll_calls.iter().map(|(_, at)| *at).collect()
    }

    /// Highest number of jobs simultaneously running at the provider.
    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    pub fn output_for(document_id: &str) -> Bytes {
        Bytes::from(format!(r#"{{"document":"{}","blocks":[]}}"#, document_id))
    }
}

impl ScriptedService {
    fn begin_submit(&self, document_id: &str) -> Stall {
        let mut st = self.state.lock().unwrap();
        st.submit_calls.push((document_id.to_string(), Instant::now()));
        if st.hung_submits.contains(document_id) {
            Stall::Forever
        } else if let Some(delay) = st.submit_delays.get(document_id) {
            Stall::For(*delay)
        } else {
            Stall::None
        }
    }

    fn finish_submit(&self, request: &SubmitRequest) -> Result<String, ServiceError> {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let step = st
            .scripts
            .get_mut(&request.document_id)
            .and_then(|s| s.submits.pop_front());
        if let Some(Err(err)) = step {
            return Err(err);
        }
        st.next_job += 1;
        let job_id = format!("job-{}", st.next_job);
        st.jobs.insert(
            job_id.clone(),
            ProviderJob {
                document_id: request.document_id.clone(),
                started: Instant::now(),
                done: false,
            },
        );
        st.active += 1;
        st.max_active = st.max_active.max(st.active);
        Ok(job_id)
    }

    /// Record the status call; `None` when the job is unknown.
    fn begin_poll(&self, job_id: &str) -> Option<Stall> {
        let mut st = self.state.lock().unwrap();
        let document_id = st.jobs.get(job_id)?.document_id.clone();
        st.poll_calls.push((document_id.clone(), Instant::now()));
        if st.hung_polls.contains(&document_id) {
            Some(Stall::Forever)
        } else {
            Some(Stall::None)
        }
    }

    fn finish_poll(&self, job_id: &str) -> Result<PollStatus, ServiceError> {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let Some(job) = st.jobs.get(job_id) else {
            return Err(unknown_job(job_id));
        };
        let document_id = job.document_id.clone();
        let started = job.started;

        let step = st
            .scripts
            .get_mut(&document_id)
            .and_then(|s| s.polls.pop_front())
            .unwrap_or_else(|| {
                if started.elapsed() >= self.job_duration {
                    PollStep::Succeeded
                } else {
                    PollStep::InProgress
                }
            });

        let finished = matches!(step, PollStep::Succeeded | PollStep::JobFailed(_));
        if finished {
            if let Some(job) = st.jobs.get_mut(job_id) {
                if !job.done {
                    job.done = true;
                    st.active -= 1;
                }
            }
        }

        match step {
            PollStep::InProgress => Ok(PollStatus::InProgress),
            PollStep::Succeeded => Ok(PollStatus::Succeeded(JobOutput {
                body: Self::output_for(&document_id),
            })),
            PollStep::JobFailed(err) => Ok(PollStatus::Failed(err)),
            PollStep::CallFailed(err) => Err(err),
        }
    }
}

fn unknown_job(job_id: &str) -> ServiceError {
    ServiceError::from_code("InvalidJobIdException", format!("unknown job {job_id}"))
}

#[async_trait]
impl ExtractionService for ScriptedService {
    async fn submit_job(&self, request: &SubmitRequest) -> Result<String, ServiceError> {
        self.begin_submit(&request.document_id).wait().await;
        self.finish_submit(request)
    }

    async fn poll_job(&self, job_id: &str) -> Result<PollStatus, ServiceError> {
        let Some(stall) = self.begin_poll(job_id) else {
            return Err(unknown_job(job_id));
        };
        stall.wait().await;
        self.finish_poll(job_id)
    }
}

/// Deployment profile with a one-second minimum poll interval so tests on a
/// paused clock finish in few iterations.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::deployment_default();
    cfg.quota.min_poll_interval_ms = 1_000;
    cfg.quota.poll_sweep_ms = 500;
    cfg
}

pub fn doc(id: &str) -> DocumentRequest {
    DocumentRequest::new(
        id,
        DocumentRef::new("input-bucket", format!("uploads/{id}.pdf")),
        ExtractionMode::Text,
    )
}

pub fn doc_ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}-{i:03}")).collect()
}

pub async fn start_controller(
    cfg: AppConfig,
    service: Arc<ScriptedService>,
    ledger: Arc<dyn Ledger>,
) -> AdmissionController {
    let controller = AdmissionController::builder(cfg, service, ledger)
        .build()
        .expect("build controller");
    controller.start().await.expect("start controller");
    controller
}

/// A record already in flight (Polling with a job handle), as a previous
/// controller would have left it.
pub fn polling_record(document_id: &str, job_id: &str, now_ms: i64) -> JobRecord {
    let request = doc(document_id);
    let mut record = JobRecord::new(document_id, request.document, request.mode, now_ms);
    record.transition(JobState::Submitted, now_ms).unwrap();
    record.job_id = Some(job_id.to_string());
    record.submitted_at_ms = Some(now_ms);
    record.transition(JobState::Polling, now_ms).unwrap();
    record
}

/// Assert that every consecutive pair of states is an edge of the state machine.
pub fn assert_valid_path(document_id: &str, states: &[JobState]) {
    assert_eq!(
        states.first(),
        Some(&JobState::Pending),
        "{document_id} must start Pending: {states:?}"
    );
    for pair in states.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "{document_id}: invalid transition {} -> {} in {states:?}",
            pair[0],
            pair[1]
        );
    }
}
