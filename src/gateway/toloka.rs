//! Gateway for the Toloka-style HITL API.
//!
//! Tasks are submitted as one JSON batch to `POST tasks` and polled with
//! `GET tasks`; the aggregate document lives under `document`. Every request
//! carries the optional `Token` header and the `license_id` / `system_info`
//! query parameters.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{submittable, DocumentModes, DocumentRequest, Gateway, SubmitOptions};
use crate::config::{Config, ConfigError, Provider};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::task::{DocumentStructure, ImagePayload, Task, TaskValue};
use crate::transport::{join_url, ApiRequest, Transport};

/// One element of the `POST tasks` body.
#[derive(Debug, Serialize)]
struct SubmitItem<'a> {
    images: &'a [ImagePayload],
    uncut_images: &'a [ImagePayload],
    predict: Option<&'a TaskValue>,
    predict_confidence: Option<f64>,
    #[serde(rename = "type")]
    task_type: &'a str,
    field_name: Option<&'a str>,
    document_type: Option<&'a str>,
    code: Option<&'a str>,
    document_id: Option<&'a str>,
    pipeline: Option<&'a [String]>,
    field_type: Option<&'a str>,
    suggestions_gateway: Option<&'a str>,
    deadline_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_structure: Option<&'a DocumentStructure>,
}

pub struct TolokaGateway {
    host: String,
    token: Option<String>,
    license_id: Option<String>,
    system_info_token: Option<String>,
    suggestions_gateway: Option<String>,
    confidence_threshold: Option<f64>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl TolokaGateway {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host: config.host.clone(),
            token: config.token.clone(),
            license_id: config.license_id.clone(),
            system_info_token: config.system_info_token.clone(),
            suggestions_gateway: config.suggestions_gateway.clone(),
            confidence_threshold: config.confidence_threshold,
            transport,
            retry,
            cancel,
        }
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> ApiRequest {
        let mut request = ApiRequest::new(method, join_url(&self.host, endpoint))
            .authorization(self.token.as_ref().map(|t| format!("Token {}", t)));
        if let Some(license_id) = &self.license_id {
            request = request.query("license_id", license_id.clone());
        }
        if let Some(system_info) = &self.system_info_token {
            request = request.query("system_info", system_info.clone());
        }
        request
    }

    async fn call(&self, operation: &str, request: ApiRequest) -> Result<Value> {
        self.retry
            .run(&self.cancel, operation, || self.transport.request(request.clone()))
            .await
    }

    fn submit_item<'a>(&'a self, task: &'a Task, options: &'a SubmitOptions) -> SubmitItem<'a> {
        SubmitItem {
            images: &task.images,
            uncut_images: &task.uncut_images,
            predict: task.predict.as_ref(),
            predict_confidence: task.predict_confidence,
            task_type: options.task_type.as_deref().unwrap_or(&task.task_type),
            field_name: task.field_name.as_deref(),
            document_type: options
                .document_type
                .as_deref()
                .or(task.document_type.as_deref()),
            code: task.code.as_deref(),
            document_id: options
                .document_id
                .as_deref()
                .or(task.document_id.as_deref()),
            pipeline: task.pipeline.as_deref(),
            field_type: task.wire_field_type(),
            suggestions_gateway: task
                .suggestions_gateway
                .as_deref()
                .or(self.suggestions_gateway.as_deref()),
            deadline_at: task.deadline_at.map(|d| d.to_rfc3339()),
            document_structure: None,
        }
    }
}

fn with_flag(request: ApiRequest, name: &str, enabled: bool) -> ApiRequest {
    if enabled {
        request.query(name, "true")
    } else {
        request
    }
}

fn with_processing_type(request: ApiRequest, processing_type: Option<&str>) -> ApiRequest {
    match processing_type {
        Some(value) if !value.is_empty() => request.query("processing_type", value),
        _ => request,
    }
}

#[async_trait]
impl Gateway for TolokaGateway {
    fn provider(&self) -> Provider {
        Provider::Toloka
    }

    fn check_modes(&self, _modes: &DocumentModes) -> std::result::Result<(), ConfigError> {
        Ok(())
    }

    async fn submit_tasks(&self, tasks: Vec<Task>, options: &SubmitOptions) -> Result<Vec<Task>> {
        let tasks = submittable(tasks, self.confidence_threshold);
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut items: Vec<SubmitItem<'_>> = tasks
            .iter()
            .map(|task| self.submit_item(task, options))
            .collect();
        if let Some(first) = items.first_mut() {
            first.document_structure = options.document_structure.as_ref();
        }
        let body = serde_json::to_value(&items)?;

        let mut request = self.request(reqwest::Method::POST, "tasks").json(body);
        request = with_flag(request, "mock", options.mock);
        request = with_processing_type(request, options.processing_type.as_deref());

        tracing::info!(count = tasks.len(), "Submitting tasks to HITL");
        let response = self.call("toloka.submit_tasks", request).await?;
        let created: Vec<Task> = serde_json::from_value(response)?;

        // Keep local hints (prediction, images) when the backend echoes the batch in order.
        if created.len() == tasks.len() {
            Ok(tasks
                .into_iter()
                .zip(created)
                .map(|(mut local, remote)| {
                    local.absorb(remote);
                    local
                })
                .collect())
        } else {
            Ok(created)
        }
    }

    async fn submit_document(&self, images: &[ImagePayload], request: &DocumentRequest) -> Result<Task> {
        let body = json!({
            "images": images,
            "document_type": request.document_type,
            "document_id": request.document_id,
            "suggestions_gateway": self.suggestions_gateway,
            "deadline_at": request.deadline_at.map(|d| d.to_rfc3339()),
        });

        let mut api_request = self.request(reqwest::Method::POST, "document").json(body);
        api_request = with_flag(api_request, "only_classify", request.modes.only_classify);
        api_request = with_flag(api_request, "only_ocr", request.modes.only_ocr);
        api_request = with_flag(api_request, "integrity_check", request.modes.integrity_check);
        api_request = with_flag(api_request, "mock", request.mock);
        api_request = with_processing_type(api_request, request.processing_type.as_deref());

        tracing::info!(
            images = images.len(),
            document_type = ?request.document_type,
            "Submitting document to HITL"
        );
        let response = self.call("toloka.submit_document", api_request).await?;
        let mut document: Task = serde_json::from_value(response)?;
        if document.deadline_at.is_none() {
            document.deadline_at = request.deadline_at;
        }
        Ok(document)
    }

    async fn fetch_updates(&self, pending_ids: &[String]) -> Result<Vec<Task>> {
        if pending_ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .request(reqwest::Method::GET, "tasks")
            .json(json!({ "ids": pending_ids }));
        let response = self.call("toloka.fetch_updates", request).await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn fetch_document(&self, document_id: &str) -> Result<Task> {
        let request = self
            .request(reqwest::Method::GET, "document")
            .query("id", document_id);
        let response = self.call("toloka.fetch_document", request).await?;
        Ok(serde_json::from_value(response)?)
    }
}
