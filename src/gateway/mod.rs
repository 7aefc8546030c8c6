//! Backend gateway abstraction.
//!
//! Every provider exposes the same capability set through [`Gateway`]:
//! submit field-level tasks, submit an aggregate document, fetch task updates
//! and fetch the document. Providers differ in wire contracts and in which
//! document modes they support; [`Gateway::check_modes`] rejects unsupported
//! combinations before any network call.
//!
//! Exactly one gateway is built per client, from [`Config::provider`].

pub mod handl;
pub mod toloka;

pub use handl::HandlGateway;
pub use toloka::TolokaGateway;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError, Provider};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::task::{DocumentStructure, ImagePayload, Task};
use crate::transport::{HttpTransport, Transport};

/// Per-batch submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub document_type: Option<String>,
    pub document_id: Option<String>,
    /// Wire `type` for every item (None = each task's own `task_type`)
    pub task_type: Option<String>,
    /// Ask the backend to answer with mock results
    pub mock: bool,
    pub processing_type: Option<String>,
    /// Attached to the first item of the batch only
    pub document_structure: Option<DocumentStructure>,
}

/// Processing modes for an aggregate document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentModes {
    pub only_classify: bool,
    pub only_ocr: bool,
    pub integrity_check: bool,
}

impl DocumentModes {
    pub fn ocr_only() -> Self {
        Self {
            only_ocr: true,
            ..Self::default()
        }
    }

    /// Names of the enabled flags, for error messages and query params.
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            ("only_classify", self.only_classify),
            ("only_ocr", self.only_ocr),
            ("integrity_check", self.integrity_check),
        ]
        .into_iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| name)
        .collect()
    }
}

/// Options for [`Gateway::submit_document`].
#[derive(Debug, Clone, Default)]
pub struct DocumentRequest {
    pub document_type: Option<String>,
    pub document_id: Option<String>,
    pub modes: DocumentModes,
    pub mock: bool,
    pub processing_type: Option<String>,
    pub deadline_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    fn provider(&self) -> Provider;

    /// Reject document mode combinations this backend cannot serve.
    fn check_modes(&self, modes: &DocumentModes) -> std::result::Result<(), ConfigError>;

    /// Submit every task with image data whose prediction is not already
    /// confident enough (see [`submittable`]). Returns the submitted tasks as
    /// the backend now sees them, ids assigned. Skipped tasks are not returned.
    async fn submit_tasks(&self, tasks: Vec<Task>, options: &SubmitOptions) -> Result<Vec<Task>>;

    /// Create the aggregate document task.
    async fn submit_document(&self, images: &[ImagePayload], request: &DocumentRequest) -> Result<Task>;

    /// Current server view of the given backend ids. Unresolved ids are absent.
    async fn fetch_updates(&self, pending_ids: &[String]) -> Result<Vec<Task>>;

    /// Current server view of the document, with resolved sub-tasks.
    async fn fetch_document(&self, document_id: &str) -> Result<Task>;
}

/// Drop tasks without image data and tasks whose prediction confidence
/// reaches `threshold`. Skipped tasks are logged and never sent.
pub fn submittable(tasks: Vec<Task>, threshold: Option<f64>) -> Vec<Task> {
    let (batch, skipped): (Vec<Task>, Vec<Task>) = tasks
        .into_iter()
        .partition(|task| task.is_submittable(threshold));

    for task in &skipped {
        tracing::debug!(
            field_name = ?task.field_name,
            confidence = ?task.predict_confidence,
            "Skipping task: no image or confident prediction"
        );
    }
    if !skipped.is_empty() {
        tracing::info!(skipped = skipped.len(), "Tasks not sent to HITL");
    }
    batch
}

/// Build the gateway selected by `config.provider` over the default HTTP transport.
pub fn connect(config: &Config, cancel: CancellationToken) -> Result<Arc<dyn Gateway>> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        config.request_timeout,
        config.accept_invalid_certs,
    )?);
    Ok(with_transport(config, transport, cancel))
}

/// Build the gateway selected by `config.provider` over a caller-supplied transport.
pub fn with_transport(
    config: &Config,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) -> Arc<dyn Gateway> {
    let retry = RetryPolicy::new(config.retry_schedule.clone());
    tracing::info!(provider = %config.provider, "Using HITL backend");
    match config.provider {
        Provider::Toloka => Arc::new(TolokaGateway::new(config, transport, retry, cancel)),
        Provider::Handl => Arc::new(HandlGateway::new(config, transport, retry, cancel)),
    }
}
