//! In-memory registry of submitted tasks plus the optional document task.
//!
//! Tasks are keyed by `id`, or `id:field_name` when one backend id fans out
//! to several field-level tasks. Nothing is ever removed: the registry only
//! accumulates for the lifetime of the client that owns it.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::task::Task;

/// Outstanding work, split by pool. The pools are synced through different
/// backend calls, so the two counts are never summed here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InWork {
    /// Keyed tasks without `completed_at`
    pub tasks: usize,
    /// 1 while the document task is outstanding, else 0
    pub documents: usize,
}

impl InWork {
    pub fn is_idle(&self) -> bool {
        self.tasks == 0 && self.documents == 0
    }

    pub fn as_pair(&self) -> (usize, usize) {
        (self.tasks, self.documents)
    }
}

/// Base backend id of a registry key (the part before the first `:`).
pub fn base_id(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

/// Whether an update for backend id `id` applies to registry entry `key`.
///
/// Matches the key itself or any `id:<field>` composite key. Ids that contain
/// `:` themselves are not supported by this rule.
pub fn key_matches(key: &str, id: &str) -> bool {
    key == id
        || key
            .strip_prefix(id)
            .is_some_and(|rest| rest.starts_with(':'))
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
    document: Option<Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite tasks by composite key. The newest view wins.
    pub fn register<I>(&mut self, tasks: I) -> usize
    where
        I: IntoIterator<Item = Task>,
    {
        let mut registered = 0;
        for task in tasks {
            match task.key() {
                Some(key) => {
                    self.tasks.insert(key, task);
                    registered += 1;
                }
                None => {
                    tracing::warn!(
                        field_name = ?task.field_name,
                        "Ignoring task without backend id"
                    );
                }
            }
        }
        registered
    }

    pub fn set_document(&mut self, document: Task) {
        self.document = Some(document);
    }

    pub fn document(&self) -> Option<&Task> {
        self.document.as_ref()
    }

    pub fn document_mut(&mut self) -> Option<&mut Task> {
        self.document.as_mut()
    }

    pub fn get(&self, key: &str) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn in_work_count(&self) -> InWork {
        InWork {
            tasks: self.tasks.values().filter(|t| !t.is_completed()).count(),
            documents: usize::from(self.document_pending()),
        }
    }

    pub fn document_pending(&self) -> bool {
        self.document.as_ref().is_some_and(|d| !d.is_completed())
    }

    /// Distinct backend ids of tasks that are not completed yet.
    pub fn pending_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, task)| !task.is_completed())
            .map(|(key, _)| base_id(key).to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Merge server views into the registry.
    ///
    /// An update carrying a `field_name` targets exactly `id:field_name`. One
    /// without targets every entry whose key is `id` or starts with `id:`, so a
    /// single backend task can complete several field-level tasks. Updates that
    /// match nothing are registered as new entries.
    ///
    /// Returns how many entries went from pending to completed.
    pub fn merge_updates<I>(&mut self, updates: I) -> usize
    where
        I: IntoIterator<Item = Task>,
    {
        let mut completed = 0;
        for update in updates {
            let Some(id) = update.id.clone() else {
                tracing::warn!("Ignoring update without backend id");
                continue;
            };

            let targets: Vec<String> = match update.key() {
                Some(key) if update.field_name.is_some() => vec![key],
                _ => self
                    .tasks
                    .keys()
                    .filter(|key| key_matches(key, &id))
                    .cloned()
                    .collect(),
            };

            let mut matched = false;
            for key in targets {
                if let Some(task) = self.tasks.get_mut(&key) {
                    let was_pending = !task.is_completed();
                    task.absorb(update.clone());
                    if was_pending && task.is_completed() {
                        completed += 1;
                    }
                    matched = true;
                }
            }

            if !matched {
                if update.is_completed() {
                    completed += 1;
                }
                self.register([update]);
            }
        }
        completed
    }

    /// Force-complete every pending task (and the document) whose deadline passed.
    pub fn apply_deadlines(&mut self, now: DateTime<Utc>) -> usize {
        let mut completed = 0;
        for task in self.tasks.values_mut().chain(self.document.iter_mut()) {
            if task.autocomplete_by_deadline(now) {
                tracing::info!(id = ?task.id, "Task deadline reached, completing with best-effort result");
                completed += 1;
            }
        }
        completed
    }

    /// Give up on pending tasks created more than `timeout` ago.
    pub fn apply_task_timeout(&mut self, timeout: Duration, now: DateTime<Utc>) -> usize {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };
        let mut completed = 0;
        for task in self.tasks.values_mut() {
            let expired = !task.is_completed()
                && task
                    .created_at
                    .is_some_and(|created| now - created > timeout);
            if expired && task.mark_timed_out(now) {
                tracing::warn!(id = ?task.id, "Task timed out waiting for the backend");
                completed += 1;
            }
        }
        completed
    }

    /// Every tracked task, completed ones included.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Task)> {
        self.tasks.iter()
    }
}
