//! In-memory fakes for driving gateways and the reconciliation loop in tests.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::{ConfigError, Provider};
use crate::error::{Error, Result};
use crate::gateway::{DocumentModes, DocumentRequest, Gateway, SubmitOptions};
use crate::task::{ImagePayload, Task};
use crate::transport::{status_error, ApiRequest, Transport};

/// Formatted log output collected by [`capture_logs`].
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's `warn` and above into a buffer until the guard drops.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}

/// Small solid-color PNG.
pub fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode fixture");
    out.into_inner()
}

/// Scripted outcome of one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Status(u16),
    Refused,
}

impl Reply {
    fn into_result(self) -> Result<Value> {
        match self {
            Reply::Json(value) => Ok(value),
            Reply::Status(code) => Err(status_error(
                StatusCode::from_u16(code).expect("valid status"),
                "scripted failure",
            )),
            Reply::Refused => Err(Error::Connection("connection refused".to_string())),
        }
    }
}

struct Route {
    method: Method,
    path: String,
    replies: VecDeque<Reply>,
}

/// Transport answering from per-route reply queues.
///
/// A route is matched by method and URL suffix. Replies are consumed in
/// order; the last one keeps answering.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<ApiRequest>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, method: Method, path: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        match routes
            .iter_mut()
            .find(|r| r.method == method && r.path == path)
        {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                method,
                path: path.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .find(|r| r.method == request.method && request.url.ends_with(&r.path));
        let reply = match route {
            Some(route) if route.replies.len() > 1 => route.replies.pop_front(),
            Some(route) => route.replies.front().cloned(),
            None => None,
        };
        match reply {
            Some(reply) => reply.into_result(),
            None => Err(Error::application(
                Some(404),
                format!("no scripted route for {} {}", request.method, request.url),
            )),
        }
    }

    async fn upload(&self, url: &str, content: Vec<u8>) -> Result<()> {
        self.uploads.lock().unwrap().push((url.to_string(), content));
        Ok(())
    }
}

/// What the fake gateway has been asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SubmitTasks(usize),
    SubmitDocument,
    FetchUpdates(Vec<String>),
    FetchDocument(String),
}

#[derive(Default)]
struct GatewayState {
    next_id: usize,
    updates: VecDeque<Result<Vec<Task>>>,
    documents: VecDeque<Result<Task>>,
    calls: Vec<Call>,
}

/// Gateway that assigns ids `t1`, `t2`, ... on submission and answers polls
/// from scripted queues. An empty queue means "nothing new yet".
pub struct ScriptedGateway {
    provider: Provider,
    state: Mutex<GatewayState>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            provider: Provider::Toloka,
            state: Mutex::new(GatewayState::default()),
        }
    }

    pub fn push_updates(&self, updates: Result<Vec<Task>>) {
        self.state.lock().unwrap().updates.push_back(updates);
    }

    pub fn push_document(&self, document: Result<Task>) {
        self.state.lock().unwrap().documents.push_back(document);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::FetchUpdates(_) | Call::FetchDocument(_)))
            .count()
    }
}

/// Completed server view of `id`.
pub fn completed(id: &str, result: &str) -> Task {
    let mut task = Task::new();
    task.id = Some(id.to_string());
    task.state = Some("completed".to_string());
    task.result = Some(result.into());
    task.completed_at = Some(Utc::now());
    task
}

#[async_trait]
impl Gateway for ScriptedGateway {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn check_modes(&self, _modes: &DocumentModes) -> std::result::Result<(), ConfigError> {
        Ok(())
    }

    async fn submit_tasks(&self, tasks: Vec<Task>, _options: &SubmitOptions) -> Result<Vec<Task>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::SubmitTasks(tasks.len()));
        Ok(tasks
            .into_iter()
            .map(|mut task| {
                state.next_id += 1;
                task.id = Some(format!("t{}", state.next_id));
                task.created_at = Some(Utc::now());
                task
            })
            .collect())
    }

    async fn submit_document(&self, images: &[ImagePayload], request: &DocumentRequest) -> Result<Task> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::SubmitDocument);
        let mut document = Task::new();
        document.id = Some("doc-1".to_string());
        document.document_type = request.document_type.clone();
        document.deadline_at = request.deadline_at;
        document.created_at = Some(Utc::now());
        document.images = images.to_vec();
        Ok(document)
    }

    async fn fetch_updates(&self, pending_ids: &[String]) -> Result<Vec<Task>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::FetchUpdates(pending_ids.to_vec()));
        state.updates.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_document(&self, document_id: &str) -> Result<Task> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::FetchDocument(document_id.to_string()));
        state.documents.pop_front().unwrap_or_else(|| {
            let mut unchanged = Task::new();
            unchanged.id = Some(document_id.to_string());
            Ok(unchanged)
        })
    }
}
