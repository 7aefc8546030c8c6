//! Gateway for the Handl labeling platform.
//!
//! Handl only does OCR. Each task becomes one image in a project named
//! `{prefix}_{version}__ocr`: the task's images are stacked into a single JPEG,
//! uploaded through a pre-signed URL, and registered in the project dataset
//! together with the predicted text. Results are read back from the project
//! result list.
//!
//! Requests are authorized with a JWT obtained from `login`, cached for
//! ten minutes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{submittable, DocumentModes, DocumentRequest, Gateway, SubmitOptions};
use crate::codec;
use crate::config::{Config, ConfigError, Provider};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::task::{ImagePayload, Task, TaskValue};
use crate::transport::{join_url, ApiRequest, Transport};

const TOKEN_TTL: Duration = Duration::from_secs(600);
const LOGIN_ATTEMPTS: usize = 30;
const INCORRECT_CAPTCHA: &str = "Incorrect CAPTCHA";
const ONLINE_STATE: &str = "online";

#[derive(Debug, Default)]
struct Session {
    token: Option<(String, Instant)>,
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectSummary {
    id: Value,
    #[serde(default)]
    title: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct LabelResult {
    id: Value,
    #[serde(default)]
    payload: ResultPayload,
}

#[derive(Debug, Default, Deserialize)]
struct ResultPayload {
    #[serde(default)]
    text: Option<TaskValue>,
}

/// Handl ids come back as strings or numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `{prefix}_{version}__ocr`, with today's `YYYYMMDD` as the default version.
pub fn project_title(prefix: &str, version: Option<&str>) -> String {
    let version = version
        .map(str::to_string)
        .unwrap_or_else(|| Local::now().format("%Y%m%d").to_string());
    format!("{}_{}__ocr", prefix, version)
}

fn image_name(parts: &[Option<&str>]) -> String {
    let mut name = parts
        .iter()
        .map(|part| part.unwrap_or("None"))
        .collect::<Vec<_>>()
        .join("__");
    name.push_str("__");
    name.push_str(&Uuid::new_v4().to_string());
    name.push_str(".jpg");
    name
}

pub struct HandlGateway {
    url: String,
    username: String,
    password: String,
    title: String,
    confidence_threshold: Option<f64>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    session: Mutex<Session>,
}

impl HandlGateway {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let handl = &config.handl;
        Self {
            url: handl.url.clone(),
            username: handl.username.clone(),
            password: handl.password.clone(),
            title: project_title(&handl.prefix, handl.version.as_deref()),
            confidence_threshold: config.confidence_threshold,
            transport,
            retry,
            cancel,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn project_title(&self) -> &str {
        &self.title
    }

    /// Cached JWT, logging in again once it is older than [`TOKEN_TTL`].
    async fn token(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        if let Some((token, issued)) = &session.token {
            if issued.elapsed() < TOKEN_TTL {
                return Ok(token.clone());
            }
        }

        let token = self.login().await?;
        session.token = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    async fn login(&self) -> Result<String> {
        let request = ApiRequest::post(join_url(&self.url, "login"))
            .query("captcha_id", "")
            .query("solution", "")
            .json(json!({
                "username": self.username,
                "password": self.password,
            }));

        for attempt in 1..=LOGIN_ATTEMPTS {
            let response = self
                .retry
                .run(&self.cancel, "handl.login", || self.transport.request(request.clone()))
                .await;

            let data = match response {
                Ok(data) => data,
                Err(Error::Application { message, .. }) if message.contains(INCORRECT_CAPTCHA) => {
                    tracing::info!(attempt, "Handl rejected CAPTCHA, retrying login");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if data.get("error").and_then(Value::as_str) == Some(INCORRECT_CAPTCHA) {
                tracing::info!(attempt, "Handl rejected CAPTCHA, retrying login");
                continue;
            }

            return match data.get("token").and_then(Value::as_str) {
                Some(token) => {
                    tracing::debug!("Handl login succeeded");
                    Ok(token.to_string())
                }
                None => Err(Error::application(None, format!("Handl login rejected: {}", data))),
            };
        }

        Err(Error::application(
            None,
            format!("Handl login failed after {} CAPTCHA rejections", LOGIN_ATTEMPTS),
        ))
    }

    async fn call(&self, operation: &str, request: ApiRequest) -> Result<Value> {
        let token = self.token().await?;
        let request = request.authorization(Some(format!("Bearer {}", token)));
        let result = self
            .retry
            .run(&self.cancel, operation, || self.transport.request(request.clone()))
            .await;

        if let Err(Error::Application { status: Some(401), .. }) = &result {
            self.session.lock().await.token = None;
        }
        result
    }

    /// Id of the online OCR project, looked up once.
    async fn project_id(&self) -> Result<String> {
        if let Some(id) = self.session.lock().await.project_id.clone() {
            return Ok(id);
        }

        let response = self
            .call("handl.list_projects", ApiRequest::get(join_url(&self.url, "projects")))
            .await?;
        let projects: Vec<ProjectSummary> = serde_json::from_value(response)?;

        let id = projects
            .iter()
            .find(|p| p.title == self.title && p.state == ONLINE_STATE)
            .and_then(|p| id_string(&p.id))
            .ok_or_else(|| {
                Error::application(
                    None,
                    format!("Handl project {} does not exist or is not online", self.title),
                )
            })?;

        tracing::info!(project_id = %id, title = %self.title, "Resolved Handl project");
        self.session.lock().await.project_id = Some(id.clone());
        Ok(id)
    }

    /// Upload one stacked image and register it in the dataset. Returns the Handl id.
    async fn create_item(&self, project_id: &str, name: &str, content: Vec<u8>, text: &str) -> Result<String> {
        let descriptor = self
            .call(
                "handl.upload_url",
                ApiRequest::get(join_url(&self.url, &format!("projects/{}/url", project_id)))
                    .query("file", name),
            )
            .await?;

        let uri = descriptor
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::application(None, format!("Handl upload descriptor has no uri: {}", descriptor)))?
            .to_string();

        tracing::debug!(name = %name, "Uploading image to Handl");
        self.retry
            .run(&self.cancel, "handl.upload", || self.transport.upload(&uri, content.clone()))
            .await?;

        let mut item = descriptor;
        if let Value::Object(fields) = &mut item {
            fields.insert("text".to_string(), Value::String(text.to_string()));
        }

        let response = self
            .call(
                "handl.create_item",
                ApiRequest::post(join_url(&self.url, &format!("projects/{}/dataset", project_id))).json(item),
            )
            .await?;

        response
            .get(0)
            .and_then(|created| created.get("id"))
            .and_then(id_string)
            .ok_or_else(|| Error::application(None, format!("Handl dataset response has no id: {}", response)))
    }

    async fn results(&self) -> Result<Vec<LabelResult>> {
        let project_id = self.project_id().await?;
        let response = self
            .call(
                "handl.results",
                ApiRequest::get(join_url(&self.url, &format!("projects/{}/result", project_id))),
            )
            .await?;
        if response.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(response)?)
    }
}

/// Completed update for `pending_id`.
///
/// A result with exactly that id wins; otherwise the first result whose id
/// is contained in `pending_id` is used.
fn match_result(results: &[LabelResult], pending_id: &str) -> Option<Task> {
    let ids: Vec<Option<String>> = results.iter().map(|r| id_string(&r.id)).collect();
    let position = ids
        .iter()
        .position(|id| id.as_deref() == Some(pending_id))
        .or_else(|| {
            ids.iter()
                .position(|id| id.as_deref().is_some_and(|id| pending_id.contains(id)))
        })?;

    let mut update = Task::new();
    update.id = Some(pending_id.to_string());
    update.result = Some(
        results[position]
            .payload
            .text
            .clone()
            .unwrap_or_else(TaskValue::empty),
    );
    update.completed_at = Some(Utc::now());
    Some(update)
}

#[async_trait]
impl Gateway for HandlGateway {
    fn provider(&self) -> Provider {
        Provider::Handl
    }

    fn check_modes(&self, modes: &DocumentModes) -> std::result::Result<(), ConfigError> {
        if modes.only_ocr && !modes.only_classify && !modes.integrity_check {
            return Ok(());
        }
        let enabled = modes.enabled();
        Err(ConfigError::UnsupportedMode {
            provider: Provider::Handl,
            requested: if enabled.is_empty() {
                "documents without only_ocr".to_string()
            } else {
                enabled.join(" + ")
            },
        })
    }

    async fn submit_tasks(&self, tasks: Vec<Task>, options: &SubmitOptions) -> Result<Vec<Task>> {
        let tasks = submittable(tasks, self.confidence_threshold);
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let project_id = self.project_id().await?;

        let mut submitted = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let content = codec::concat_vertical(&task.images)?;
            let name = image_name(&[
                options.document_type.as_deref().or(task.document_type.as_deref()),
                options.document_id.as_deref().or(task.document_id.as_deref()),
                task.field_name.as_deref(),
            ]);
            let text = task
                .predict
                .as_ref()
                .and_then(TaskValue::as_text)
                .unwrap_or_default()
                .to_string();

            let id = self.create_item(&project_id, &name, content, &text).await?;
            tracing::info!(id = %id, field_name = ?task.field_name, "Created Handl task");

            task.id = Some(id);
            task.created_at = Some(Utc::now());
            if task.document_type.is_none() {
                task.document_type = options.document_type.clone();
            }
            if task.document_id.is_none() {
                task.document_id = options.document_id.clone();
            }
            submitted.push(task);
        }
        Ok(submitted)
    }

    async fn submit_document(&self, images: &[ImagePayload], request: &DocumentRequest) -> Result<Task> {
        self.check_modes(&request.modes)?;
        let project_id = self.project_id().await?;

        let content = codec::concat_vertical(images)?;
        let name = image_name(&[request.document_type.as_deref(), request.document_id.as_deref()]);
        let id = self.create_item(&project_id, &name, content, "").await?;
        tracing::info!(id = %id, "Created Handl document task");

        let mut document = Task::new();
        document.id = Some(id);
        document.document_type = request.document_type.clone();
        document.document_id = request.document_id.clone();
        document.deadline_at = request.deadline_at;
        document.created_at = Some(Utc::now());
        document.images = images.to_vec();
        Ok(document)
    }

    async fn fetch_updates(&self, pending_ids: &[String]) -> Result<Vec<Task>> {
        if pending_ids.is_empty() {
            return Ok(Vec::new());
        }
        let results = self.results().await?;
        Ok(pending_ids
            .iter()
            .filter_map(|id| match_result(&results, id))
            .collect())
    }

    async fn fetch_document(&self, document_id: &str) -> Result<Task> {
        let results = self.results().await?;
        Ok(match_result(&results, document_id).unwrap_or_else(|| {
            let mut unchanged = Task::new();
            unchanged.id = Some(document_id.to_string());
            unchanged
        }))
    }
}
