//! Task entity: the unit of annotation work and its state transitions.
//!
//! A task is created locally without an id, gains an id and `created_at` when
//! a backend accepts it, absorbs server state on every reconciliation merge and
//! becomes terminal once `completed_at` is set. Completion can come from the
//! server, from the task timeout or from the client-side deadline.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// State written when a task is completed because its `deadline_at` passed.
pub const DEADLINE_TIMEOUT_STATE: &str = "deadline:timeout";

/// State written when a task stayed pending longer than the task timeout.
pub const TASK_TIMEOUT_STATE: &str = "timeout";

/// Task type used when none is given.
pub const STANDARD_TASK_TYPE: &str = "standard";

/// Wire value of `field_type` for checkbox-array tasks.
pub const CHECKBOX_ARRAY_FIELD_TYPE: &str = "bool_array";

// ─────────────────────────────────────────────────────────────────────────────
// Values
// ─────────────────────────────────────────────────────────────────────────────

/// Annotation output: a single string or an ordered list (e.g. per-checkbox results).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TaskValue {
    Text(String),
    List(Vec<String>),
}

impl TaskValue {
    pub fn empty() -> Self {
        TaskValue::Text(String::new())
    }

    /// Empty strings and empty lists count as "no value" for result fallbacks.
    pub fn is_empty(&self) -> bool {
        match self {
            TaskValue::Text(s) => s.is_empty(),
            TaskValue::List(items) => items.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskValue::Text(s) => Some(s),
            TaskValue::List(_) => None,
        }
    }

    /// Build a value from arbitrary JSON. Non-string scalars (checkbox booleans,
    /// numbers) are kept in their JSON text form.
    pub fn from_json(value: serde_json::Value) -> Self {
        fn scalar(value: serde_json::Value) -> String {
            match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }
        }

        match value {
            serde_json::Value::Array(items) => TaskValue::List(items.into_iter().map(scalar).collect()),
            other => TaskValue::Text(scalar(other)),
        }
    }
}

impl<'de> Deserialize<'de> for TaskValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(TaskValue::from_json)
    }
}

impl From<&str> for TaskValue {
    fn from(value: &str) -> Self {
        TaskValue::Text(value.to_string())
    }
}

impl From<String> for TaskValue {
    fn from(value: String) -> Self {
        TaskValue::Text(value)
    }
}

impl From<Vec<String>> for TaskValue {
    fn from(value: Vec<String>) -> Self {
        TaskValue::List(value)
    }
}

/// Python-style truthiness used by the result fallbacks.
fn present(value: &Option<TaskValue>) -> Option<&TaskValue> {
    value.as_ref().filter(|v| !v.is_empty())
}

/// An image backing a task: raw bytes, or a pre-encoded string (base64 or URL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    Bytes(Vec<u8>),
    Encoded(String),
}

impl ImagePayload {
    /// Wire form: bytes are base64-encoded, strings pass through untouched.
    pub fn to_wire(&self) -> String {
        match self {
            ImagePayload::Bytes(bytes) => STANDARD.encode(bytes),
            ImagePayload::Encoded(s) => s.clone(),
        }
    }

    /// Raw image bytes, decoding base64 when needed.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            ImagePayload::Bytes(bytes) => Ok(bytes.clone()),
            ImagePayload::Encoded(s) => STANDARD
                .decode(s.trim())
                .map_err(|e| Error::Codec(format!("image is not valid base64: {}", e))),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ImagePayload::Bytes(bytes) => bytes.is_empty(),
            ImagePayload::Encoded(s) => s.is_empty(),
        }
    }
}

impl From<Vec<u8>> for ImagePayload {
    fn from(value: Vec<u8>) -> Self {
        ImagePayload::Bytes(value)
    }
}

impl From<String> for ImagePayload {
    fn from(value: String) -> Self {
        ImagePayload::Encoded(value)
    }
}

impl Serialize for ImagePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for ImagePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(ImagePayload::Encoded)
    }
}

/// Expected document layout, forwarded once per submission batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStructure {
    pub document_type: String,
    #[serde(default)]
    pub fields: Vec<serde_json::Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────────────────

/// One unit of annotation work, or the aggregate document task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    /// Backend identifier (None until submitted)
    #[serde(deserialize_with = "lenient_id")]
    pub id: Option<String>,
    /// Free-form backend status; contains "timeout" after client-side expiry
    pub state: Option<String>,

    pub document_type: Option<String>,
    pub document_id: Option<String>,
    pub field_type: Option<String>,
    pub field_name: Option<String>,
    pub suggestions_gateway: Option<String>,
    pub document_structure: Option<DocumentStructure>,

    #[serde(deserialize_with = "timestamp::deserialize")]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<TaskValue>,
    /// Sub-tasks (document task only)
    #[serde(deserialize_with = "null_default")]
    pub tasks: Vec<Task>,

    #[serde(deserialize_with = "null_default")]
    pub images: Vec<ImagePayload>,
    #[serde(deserialize_with = "null_default")]
    pub uncut_images: Vec<ImagePayload>,
    pub predict: Option<TaskValue>,
    pub predict_confidence: Option<f64>,
    #[serde(rename = "type", deserialize_with = "task_type_or_standard")]
    pub task_type: String,
    /// Processing stages (None = backend default)
    pub pipeline: Option<Vec<String>>,
    #[serde(deserialize_with = "null_default")]
    pub is_checkbox_array: bool,
    pub code: Option<String>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: None,
            state: None,
            document_type: None,
            document_id: None,
            field_type: None,
            field_name: None,
            suggestions_gateway: None,
            document_structure: None,
            deadline_at: None,
            created_at: None,
            completed_at: None,
            result: None,
            tasks: Vec::new(),
            images: Vec::new(),
            uncut_images: Vec::new(),
            predict: None,
            predict_confidence: None,
            task_type: STANDARD_TASK_TYPE.to_string(),
            pipeline: None,
            is_checkbox_array: false,
            code: None,
        }
    }
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: impl Into<ImagePayload>) -> Self {
        self.images.push(image.into());
        self
    }

    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    pub fn with_predict(mut self, predict: impl Into<TaskValue>, confidence: Option<f64>) -> Self {
        self.predict = Some(predict.into());
        self.predict_confidence = confidence;
        self
    }

    pub fn with_deadline_at(mut self, deadline_at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    pub fn with_pipeline<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipeline = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Registry key: `id`, or `id:field_name` so several field-level tasks can
    /// share one backend id.
    pub fn key(&self) -> Option<String> {
        let id = self.id.as_deref()?;
        Some(match self.field_name.as_deref() {
            Some(field) if !field.is_empty() => format!("{}:{}", id, field),
            _ => id.to_string(),
        })
    }

    /// Best-effort result.
    ///
    /// Once completed this is exactly `result`. Before that it is always
    /// `Some`: the result so far, else the prediction, else an empty value.
    pub fn get_result(&self) -> Option<TaskValue> {
        if self.is_completed() {
            return self.result.clone();
        }
        Some(self.fallback_result())
    }

    fn fallback_result(&self) -> TaskValue {
        present(&self.result)
            .or_else(|| present(&self.predict))
            .cloned()
            .unwrap_or_else(TaskValue::empty)
    }

    pub fn is_timeout(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|state| state.contains("timeout"))
    }

    /// Force-complete the task once its deadline has passed.
    ///
    /// No-op when already completed, so a real server result is never replaced
    /// by a synthesized one. Returns whether the task was completed by this call.
    pub fn autocomplete_by_deadline(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        match self.deadline_at {
            Some(deadline) if now >= deadline => {
                self.complete_without_server(DEADLINE_TIMEOUT_STATE, now);
                true
            }
            _ => false,
        }
    }

    /// Give up on a task that stayed pending for longer than `timeout`.
    pub fn mark_timed_out(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.complete_without_server(TASK_TIMEOUT_STATE, now);
        true
    }

    fn complete_without_server(&mut self, state: &str, now: DateTime<Utc>) {
        self.result = Some(self.fallback_result());
        self.state = Some(state.to_string());
        self.completed_at = Some(now);
    }

    /// Whether the task should go on the wire: it has image data and its
    /// prediction is not already confident enough.
    pub fn is_submittable(&self, confidence_threshold: Option<f64>) -> bool {
        if !self.images.iter().any(|image| !image.is_empty()) {
            return false;
        }
        match (self.predict_confidence, confidence_threshold) {
            (Some(confidence), Some(threshold)) => confidence < threshold,
            _ => true,
        }
    }

    /// Wire `field_type`: checkbox arrays override whatever the caller set.
    pub fn wire_field_type(&self) -> Option<&str> {
        if self.is_checkbox_array {
            Some(CHECKBOX_ARRAY_FIELD_TYPE)
        } else {
            self.field_type.as_deref()
        }
    }

    /// Merge a server view of this task. Fields the server reports win; local
    /// hints (images, prediction, pipeline) stay when the server is silent.
    pub fn absorb(&mut self, update: Task) {
        fn take<T>(local: &mut Option<T>, remote: Option<T>) {
            if remote.is_some() {
                *local = remote;
            }
        }

        take(&mut self.id, update.id);
        take(&mut self.state, update.state);
        take(&mut self.document_type, update.document_type);
        take(&mut self.document_id, update.document_id);
        take(&mut self.field_type, update.field_type);
        take(&mut self.field_name, update.field_name);
        take(&mut self.deadline_at, update.deadline_at);
        take(&mut self.created_at, update.created_at);
        take(&mut self.completed_at, update.completed_at);
        take(&mut self.result, update.result);
        take(&mut self.predict, update.predict);
        take(&mut self.predict_confidence, update.predict_confidence);
        take(&mut self.pipeline, update.pipeline);
        take(&mut self.code, update.code);
        if !update.tasks.is_empty() {
            self.tasks = update.tasks;
        }
        if !update.images.is_empty() {
            self.images = update.images;
        }
        if !update.uncut_images.is_empty() {
            self.uncut_images = update.uncut_images;
        }
    }
}

/// Some backends hand out numeric ids; they are tracked as strings.
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Backends send `null` for empty collections and flags.
fn null_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn task_type_or_standard<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(|| STANDARD_TASK_TYPE.to_string()))
}

/// Timestamps arrive either with an offset or as naive UTC values.
mod timestamp {
    use super::*;

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(dt.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s))),
        }
    }
}
