use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::{ErrorClass, ServiceError};

/// Lifecycle state of a document's extraction job.
///
/// `Succeeded` and `Abandoned` are terminal for the document. `Failed` records
/// that the provider job failed; it is always followed by either a retry
/// (`Pending`) or `Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Submitted,
    Polling,
    Succeeded,
    Failed,
    Abandoned,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Submitted,
        JobState::Polling,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Abandoned,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Abandoned)
    }

    /// States in which the document holds a concurrency slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, JobState::Submitted | JobState::Polling)
    }

    /// Edges of the job state machine. `Failed -> Pending` is the only edge
    /// that moves backwards.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Abandoned)
                | (Submitted, Polling)
                | (Submitted, Abandoned)
                | (Polling, Succeeded)
                | (Polling, Failed)
                | (Polling, Abandoned)
                | (Failed, Pending)
                | (Failed, Abandoned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Submitted => "submitted",
            JobState::Polling => "polling",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// Why a document was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The provider rejected the document or job outright
    Permanent,
    /// A retryable error kept recurring until the attempt budget ran out
    Exhausted,
    /// The document exceeded its wall-clock processing ceiling
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for document {document_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub document_id: String,
    pub from: JobState,
    pub to: JobState,
}

/// Location of the source document in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub bucket: String,
    pub key: String,
}

impl DocumentRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureType {
    Tables,
    Forms,
    Layout,
}

impl FeatureType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TABLES" => Some(FeatureType::Tables),
            "FORMS" => Some(FeatureType::Forms),
            "LAYOUT" => Some(FeatureType::Layout),
            _ => None,
        }
    }
}

/// Which asynchronous operation is started for a document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExtractionMode {
    /// Plain text detection
    #[default]
    Text,
    /// Document analysis with optional feature types
    Analyze { features: Vec<FeatureType> },
}

impl ExtractionMode {
    /// Parse a mode name (`TEXT` or `ANALYZE`) and a comma-separated feature
    /// list. Unknown features are dropped; anything but `ANALYZE` means text.
    pub fn parse(mode: &str, features: &str) -> Self {
        if !mode.trim().eq_ignore_ascii_case("ANALYZE") {
            return ExtractionMode::Text;
        }
        let mut parsed = Vec::new();
        let normalized = features.to_uppercase().replace(' ', "");
        for name in normalized.split(',').filter(|s| !s.is_empty()) {
            match FeatureType::parse(name) {
                Some(ft) if !parsed.contains(&ft) => parsed.push(ft),
                Some(_) => {}
                None => tracing::warn!(feature = %name, "ignoring unknown analysis feature"),
            }
        }
        ExtractionMode::Analyze { features: parsed }
    }
}

/// One scheduled retry, kept for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub class: ErrorClass,
    /// The delay actually chosen (after jitter)
    pub delay_ms: u64,
    /// The un-jittered upper bound the delay was drawn from
    pub ceiling_ms: u64,
    pub at_ms: i64,
}

/// Durable record of one document's progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub document_id: String,
    pub document: DocumentRef,
    #[serde(default)]
    pub mode: ExtractionMode,
    pub state: JobState,
    /// Provider job handle, present from Submitted on
    pub job_id: Option<String>,
    /// Submission-side failures so far (failed submit calls and failed jobs)
    pub attempt: u32,
    /// Consecutive failed status checks for the current job
    pub poll_failures: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub submitted_at_ms: Option<i64>,
    pub last_polled_at_ms: Option<i64>,
    /// Earliest time the next submit or poll may happen
    pub not_before_ms: i64,
    pub last_error: Option<ServiceError>,
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub retries: Vec<RetryRecord>,
    /// Incremented each time an abandoned document is requeued
    #[serde(default)]
    pub generation: u32,
    /// Object-store key of the extraction output once Succeeded
    #[serde(default)]
    pub output_key: Option<String>,
}

impl JobRecord {
    pub fn new(
        document_id: impl Into<String>,
        document: DocumentRef,
        mode: ExtractionMode,
        now_ms: i64,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            document,
            mode,
            state: JobState::Pending,
            job_id: None,
            attempt: 0,
            poll_failures: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            submitted_at_ms: None,
            last_polled_at_ms: None,
            not_before_ms: now_ms,
            last_error: None,
            failure: None,
            retries: Vec::new(),
            generation: 0,
            output_key: None,
        }
    }

    /// Move to `next`, rejecting edges outside the state machine.
    pub fn transition(&mut self, next: JobState, now_ms: i64) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                document_id: self.document_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.not_before_ms <= now_ms
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at_ms
    }

    /// Fresh Pending lifecycle for an abandoned document, keeping its identity.
    pub fn requeued(&self, now_ms: i64) -> Self {
        let mut fresh = JobRecord::new(
            self.document_id.clone(),
            self.document.clone(),
            self.mode.clone(),
            now_ms,
        );
        fresh.generation = self.generation + 1;
        fresh
    }
}

/// Generate a document id of the form `YYYYMMDDTHHMMSS-ffffff-xxxxxxxx`:
/// the current UTC time plus eight random hex characters.
pub fn generate_document_id() -> String {
    let now = chrono::Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S-%6f"), &suffix[..8])
}
