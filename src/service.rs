//! Client trait for the external asynchronous extraction service.
//!
//! Implementations wrap the provider SDK and map every failure to a classified
//! [`ServiceError`] (see [`crate::classify::classify_error_code`]). The admission
//! controller never calls the provider directly.

use async_trait::async_trait;
use bytes::Bytes;

use crate::classify::ServiceError;
use crate::job::{DocumentRef, ExtractionMode};

/// Arguments for one start-job call.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub document_id: String,
    pub document: DocumentRef,
    pub mode: ExtractionMode,
    /// Unique per logical attempt (`<document_id>-<generation>-<attempt>`), so
    /// a provider that deduplicates on client tokens starts one job per attempt
    pub client_token: String,
}

/// Raw result of a finished extraction job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    InProgress,
    Succeeded(JobOutput),
    /// The job ran and failed at the provider
    Failed(ServiceError),
}

#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Start an asynchronous job and return the provider's job handle.
    async fn submit_job(&self, request: &SubmitRequest) -> Result<String, ServiceError>;

    /// Check a job. `Err` means the status call itself failed, not the job.
    async fn poll_job(&self, job_id: &str) -> Result<PollStatus, ServiceError>;
}

/// Key under which the output of a succeeded job is stored.
pub fn output_key(document_id: &str) -> String {
    format!("{}/textract_output_blocks.json", document_id)
}
