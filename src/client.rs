//! HITL client: submission plus the reconciliation loop.
//!
//! The client owns one gateway and one [`TaskRegistry`]. [`HitlClient::wait_until_complete`]
//! polls until both pools (the document and the field-level tasks) are empty:
//!
//! 1. sleep `poll_interval`
//! 2. force-complete anything whose `deadline_at` passed (no network)
//! 3. sync the document while it is pending, otherwise sync the tasks
//!
//! A failed poll is logged and retried on the next cycle. Only cancellation
//! ends the loop early.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::{self, DocumentRequest, Gateway, SubmitOptions};
use crate::registry::{InWork, TaskRegistry};
use crate::retry;
use crate::task::{ImagePayload, Task};

/// Result of one reconciliation step.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The poll went through; `completed` entries finished during it.
    Updated { completed: usize },
    /// Nothing to poll.
    Unchanged,
    /// The poll failed and will be repeated next cycle.
    Deferred(Error),
}

impl SyncOutcome {
    pub fn completed(&self) -> usize {
        match self {
            SyncOutcome::Updated { completed } => *completed,
            _ => 0,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, SyncOutcome::Deferred(_))
    }
}

/// Turn a poll failure into a deferred outcome, letting cancellation through.
fn defer(pool: &str, error: Error) -> Result<SyncOutcome> {
    if error.is_cancelled() {
        return Err(error);
    }
    tracing::warn!(pool, error = %error, "HITL sync failed, will retry next cycle");
    Ok(SyncOutcome::Deferred(error))
}

pub struct HitlClient {
    config: Config,
    gateway: Arc<dyn Gateway>,
    registry: TaskRegistry,
    cancel: CancellationToken,
}

impl HitlClient {
    /// Build a client with the gateway selected by `config.provider`.
    pub fn from_config(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();
        let gateway = gateway::connect(&config, cancel.clone())?;
        Ok(Self::new(config, gateway, cancel))
    }

    /// Load configuration from the environment and build a client.
    pub fn from_env() -> Result<Self> {
        Self::from_config(Config::from_env()?)
    }

    pub fn new(config: Config, gateway: Arc<dyn Gateway>, cancel: CancellationToken) -> Self {
        Self {
            config,
            gateway,
            registry: TaskRegistry::new(),
            cancel,
        }
    }

    /// Handle for cancelling in-flight submissions and the wait loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn document(&self) -> Option<&Task> {
        self.registry.document()
    }

    pub fn in_work_count(&self) -> InWork {
        self.registry.in_work_count()
    }

    /// Submit tasks and return every tracked task.
    ///
    /// Tasks without image data, and tasks whose prediction confidence
    /// reaches the configured threshold, are left out of the batch and are
    /// never registered. When nothing is left the backend is not called.
    pub async fn create_tasks(&mut self, tasks: Vec<Task>, options: &SubmitOptions) -> Result<Vec<Task>> {
        let batch = gateway::submittable(tasks, self.config.confidence_threshold);
        if !batch.is_empty() {
            let submitted = self.gateway.submit_tasks(batch, options).await?;
            let registered = self.registry.register(submitted);
            tracing::info!(registered, provider = %self.gateway.provider(), "Tasks submitted");
        }
        Ok(self.registry.all_tasks())
    }

    /// Create the aggregate document task. Mode combinations the backend
    /// cannot serve fail before any network call.
    ///
    /// Only one document is tracked. A document still in work is replaced
    /// with a warning and is no longer polled.
    pub async fn create_document(&mut self, images: Vec<ImagePayload>, request: DocumentRequest) -> Result<Task> {
        self.gateway.check_modes(&request.modes)?;

        let document = self.gateway.submit_document(&images, &request).await?;
        tracing::info!(id = ?document.id, "Document submitted");
        if let Some(previous) = self.registry.document().filter(|d| !d.is_completed()) {
            tracing::warn!(
                previous_id = ?previous.id,
                id = ?document.id,
                "Replacing a document still in work; its sub-tasks will not be tracked"
            );
        }
        self.registry.set_document(document.clone());
        Ok(document)
    }

    /// Refresh the document and register its resolved sub-tasks.
    pub async fn sync_document(&mut self) -> Result<SyncOutcome> {
        let Some(document_id) = self
            .registry
            .document()
            .filter(|d| !d.is_completed())
            .and_then(|d| d.id.clone())
        else {
            return Ok(SyncOutcome::Unchanged);
        };

        let update = match self.gateway.fetch_document(&document_id).await {
            Ok(update) => update,
            Err(e) => return defer("document", e),
        };

        let mut completed = 0;
        let sub_tasks = update.tasks.clone();
        if let Some(document) = self.registry.document_mut() {
            document.absorb(update);
            if document.is_completed() {
                completed += 1;
            }
        }
        completed += sub_tasks.iter().filter(|t| t.is_completed()).count();
        self.registry.register(sub_tasks);
        Ok(SyncOutcome::Updated { completed })
    }

    /// Apply the task timeout, then merge the server view of pending tasks.
    pub async fn sync_tasks(&mut self) -> Result<SyncOutcome> {
        let mut completed = 0;
        if let Some(timeout) = self.config.task_timeout {
            completed += self.registry.apply_task_timeout(timeout, Utc::now());
        }

        let pending = self.registry.pending_ids();
        if pending.is_empty() {
            return Ok(if completed > 0 {
                SyncOutcome::Updated { completed }
            } else {
                SyncOutcome::Unchanged
            });
        }

        match self.gateway.fetch_updates(&pending).await {
            Ok(updates) => {
                completed += self.registry.merge_updates(updates);
                Ok(SyncOutcome::Updated { completed })
            }
            Err(e) => defer("tasks", e),
        }
    }

    /// One poll cycle after the sleep: deadline sweep, then one pool.
    async fn reconcile_once(&mut self) -> Result<SyncOutcome> {
        let expired = self.registry.apply_deadlines(Utc::now());

        let outcome = if self.registry.document_pending() {
            tracing::info!("HITL: in work 1 document. Sync...");
            self.sync_document().await?
        } else {
            let in_work = self.registry.in_work_count();
            if in_work.tasks == 0 {
                return Ok(SyncOutcome::Updated { completed: expired });
            }
            tracing::info!(tasks = in_work.tasks, "HITL: in work tasks. Sync...");
            self.sync_tasks().await?
        };

        Ok(match outcome {
            SyncOutcome::Updated { completed } => SyncOutcome::Updated {
                completed: completed + expired,
            },
            SyncOutcome::Unchanged if expired > 0 => SyncOutcome::Updated { completed: expired },
            other => other,
        })
    }

    /// Poll until nothing is in work and return every tracked task.
    pub async fn wait_until_complete(&mut self) -> Result<Vec<Task>> {
        self.wait_with_interval(self.config.poll_interval).await
    }

    pub async fn wait_with_interval(&mut self, poll_interval: Duration) -> Result<Vec<Task>> {
        loop {
            let in_work = self.registry.in_work_count();
            if in_work.is_idle() {
                return Ok(self.registry.all_tasks());
            }

            retry::sleep(&self.cancel, poll_interval).await?;

            let outcome = self.reconcile_once().await?;
            tracing::debug!(?outcome, "HITL reconciliation cycle finished");
        }
    }

    /// Submit tasks, then wait for all of them.
    pub async fn create_and_wait(&mut self, tasks: Vec<Task>, options: &SubmitOptions) -> Result<Vec<Task>> {
        self.create_tasks(tasks, options).await?;
        self.wait_until_complete().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Provider, DEFAULT_POLL_INTERVAL};
    use crate::gateway::{DocumentModes, HandlGateway};
    use crate::retry::RetryPolicy;
    use crate::task::{TaskValue, DEADLINE_TIMEOUT_STATE, TASK_TIMEOUT_STATE};
    use crate::testing::{capture_logs, completed, Call, ScriptedGateway, ScriptedTransport};
    use tokio::time::Instant;

    fn client_with(gateway: Arc<ScriptedGateway>, configure: impl FnOnce(&mut Config)) -> HitlClient {
        let mut config = Config::new(Provider::Toloka, "https://hitl.local");
        configure(&mut config);
        HitlClient::new(config, gateway, CancellationToken::new())
    }

    fn image_task(field: &str) -> Task {
        Task::new().with_image(vec![1u8, 2, 3]).with_field_name(field)
    }

    #[tokio::test]
    async fn confident_and_imageless_tasks_are_not_sent() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |c| c.confidence_threshold = Some(0.9));

        let confident = image_task("name").with_predict("Ivan", Some(0.95));
        let imageless = Task::new().with_field_name("inn");
        let all = client
            .create_tasks(vec![confident, imageless], &SubmitOptions::default())
            .await
            .expect("nothing to submit");

        assert!(all.is_empty());
        assert!(client.registry().is_empty());
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn only_uncertain_tasks_reach_the_gateway() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |c| c.confidence_threshold = Some(0.9));

        let all = client
            .create_tasks(
                vec![
                    image_task("name").with_predict("Ivan", Some(0.95)),
                    image_task("surname").with_predict("Ivanov", Some(0.5)),
                ],
                &SubmitOptions::default(),
            )
            .await
            .expect("submitted");

        assert_eq!(gateway.calls(), vec![Call::SubmitTasks(1)]);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key().as_deref(), Some("t1:surname"));
        assert_eq!(client.in_work_count().as_pair(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_tasks_complete() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});
        client
            .create_tasks(vec![image_task("name"), image_task("inn")], &SubmitOptions::default())
            .await
            .expect("submitted");

        gateway.push_updates(Ok(vec![completed("t1", "Ivan")]));
        gateway.push_updates(Err(Error::Connection("reset".to_string())));
        gateway.push_updates(Ok(vec![completed("t2", "7701")]));

        let start = Instant::now();
        let tasks = client.wait_until_complete().await.expect("completes");

        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(Task::is_completed));
        assert_eq!(start.elapsed(), DEFAULT_POLL_INTERVAL * 3);
        assert_eq!(
            gateway.calls()[1..],
            [
                Call::FetchUpdates(vec!["t1".to_string(), "t2".to_string()]),
                Call::FetchUpdates(vec!["t2".to_string()]),
                Call::FetchUpdates(vec!["t2".to_string()]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_update_completes_every_field() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});

        let mut a = image_task("fieldA");
        a.id = Some("7".to_string());
        let mut b = image_task("fieldB");
        b.id = Some("7".to_string());
        client.registry.register([a, b]);

        gateway.push_updates(Ok(vec![completed("7", "shared")]));
        let tasks = client.wait_until_complete().await.expect("completes");

        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            assert_eq!(task.result, Some(TaskValue::from("shared")));
        }
        assert_eq!(gateway.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_document_completes_without_fetch() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});

        let request = DocumentRequest {
            deadline_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ..DocumentRequest::default()
        };
        client
            .create_document(vec![ImagePayload::Bytes(vec![1])], request)
            .await
            .expect("document submitted");

        let tasks = client.wait_until_complete().await.expect("completes");

        assert!(tasks.is_empty());
        let document = client.document().expect("document tracked");
        assert!(document.is_completed());
        assert_eq!(document.state.as_deref(), Some(DEADLINE_TIMEOUT_STATE));
        assert_eq!(gateway.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn document_is_synced_before_tasks() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});

        client
            .create_tasks(vec![image_task("name")], &SubmitOptions::default())
            .await
            .expect("submitted");
        client
            .create_document(vec![ImagePayload::Bytes(vec![1])], DocumentRequest::default())
            .await
            .expect("document submitted");

        let mut document = completed("doc-1", "");
        let mut sub_task = completed("s1", "Ivanov");
        sub_task.field_name = Some("surname".to_string());
        document.tasks = vec![sub_task];
        gateway.push_document(Err(Error::Connection("timeout".to_string())));
        gateway.push_document(Ok(document));
        gateway.push_updates(Ok(vec![completed("t1", "Ivan")]));

        let tasks = client.wait_until_complete().await.expect("completes");

        assert_eq!(
            gateway.calls()[2..],
            [
                Call::FetchDocument("doc-1".to_string()),
                Call::FetchDocument("doc-1".to_string()),
                Call::FetchUpdates(vec!["t1".to_string()]),
            ]
        );
        assert_eq!(tasks.len(), 2);
        assert!(client.registry().get("s1:surname").is_some());
    }

    #[tokio::test]
    async fn sync_outcomes_are_typed() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});
        assert!(matches!(client.sync_tasks().await, Ok(SyncOutcome::Unchanged)));
        assert!(matches!(client.sync_document().await, Ok(SyncOutcome::Unchanged)));

        client
            .create_tasks(vec![image_task("name")], &SubmitOptions::default())
            .await
            .expect("submitted");

        gateway.push_updates(Err(Error::application(Some(400), "bad ids")));
        let outcome = client.sync_tasks().await.expect("failure is deferred");
        assert!(outcome.is_deferred());

        gateway.push_updates(Ok(vec![completed("t1", "Ivan")]));
        let outcome = client.sync_tasks().await.expect("synced");
        assert_eq!(outcome.completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_timeout_ends_the_wait() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |c| c.task_timeout = Some(Duration::from_secs(60)));

        let mut stale = image_task("name").with_predict("Ivan", None);
        stale.id = Some("old".to_string());
        stale.created_at = Some(Utc::now() - chrono::Duration::seconds(120));
        client.registry.register([stale]);

        let tasks = client.wait_until_complete().await.expect("completes");

        assert_eq!(tasks[0].state.as_deref(), Some(TASK_TIMEOUT_STATE));
        assert_eq!(tasks[0].get_result(), Some(TaskValue::from("Ivan")));
        assert_eq!(gateway.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_wait() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});
        client
            .create_tasks(vec![image_task("name")], &SubmitOptions::default())
            .await
            .expect("submitted");

        let cancel = client.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            cancel.cancel();
        });

        let err = client.wait_until_complete().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(gateway.fetch_count(), 2);
        assert_eq!(client.in_work_count().as_pair(), (1, 0));
    }

    #[tokio::test]
    async fn cancelled_poll_is_not_deferred() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});
        client
            .create_tasks(vec![image_task("name")], &SubmitOptions::default())
            .await
            .expect("submitted");

        gateway.push_updates(Err(Error::Cancelled));
        assert!(client.sync_tasks().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn handl_rejects_document_modes_before_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut config = Config::new(Provider::Handl, "");
        config.handl.url = "https://handl.local".to_string();
        let cancel = CancellationToken::new();
        let gateway = Arc::new(HandlGateway::new(
            &config,
            transport.clone(),
            RetryPolicy::none(),
            cancel.clone(),
        ));
        let mut client = HitlClient::new(config, gateway, cancel);

        let request = DocumentRequest {
            modes: DocumentModes {
                only_classify: true,
                ..DocumentModes::default()
            },
            ..DocumentRequest::default()
        };
        let err = client
            .create_document(vec![ImagePayload::Bytes(vec![1])], request)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(transport.requests().is_empty());
        assert!(client.document().is_none());
    }

    #[tokio::test]
    async fn replacing_pending_document_warns() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});
        let (logs, _guard) = capture_logs();

        client
            .create_document(vec![ImagePayload::Bytes(vec![1])], DocumentRequest::default())
            .await
            .expect("first document");
        assert!(!logs.contents().contains("Replacing a document"));

        let request = DocumentRequest {
            document_type: Some("passport".to_string()),
            ..DocumentRequest::default()
        };
        client
            .create_document(vec![ImagePayload::Bytes(vec![2])], request)
            .await
            .expect("second document");

        assert!(logs.contents().contains("Replacing a document still in work"));
        assert_eq!(
            client.document().and_then(|d| d.document_type.as_deref()),
            Some("passport")
        );
        assert_eq!(client.in_work_count().as_pair(), (0, 1));
    }

    #[tokio::test]
    async fn replacing_completed_document_is_silent() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut client = client_with(gateway.clone(), |_| {});
        let (logs, _guard) = capture_logs();

        client
            .create_document(vec![ImagePayload::Bytes(vec![1])], DocumentRequest::default())
            .await
            .expect("first document");
        gateway.push_document(Ok(completed("doc-1", "")));
        client.sync_document().await.expect("synced");

        client
            .create_document(vec![ImagePayload::Bytes(vec![2])], DocumentRequest::default())
            .await
            .expect("second document");

        assert!(!logs.contents().contains("Replacing a document"));
    }
}
