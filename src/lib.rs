//! # HITL SDK
//!
//! Client for human-in-the-loop annotation backends.
//!
//! This library provides:
//! - Submission of field-level annotation tasks and aggregate documents
//! - A reconciliation loop that polls the backend until all work is done
//! - Two interchangeable backends behind one gateway trait (`toloka`, `handl`)
//!
//! ## Architecture
//!
//! The client follows a "submit, then reconcile" pattern:
//! 1. Filter tasks (no image, confident prediction) and submit the rest
//! 2. Track them in a registry keyed by `id` or `id:field_name`
//! 3. Poll on a fixed interval, document first, tasks second
//! 4. Complete expired tasks locally, merge server views, stop when idle
//!
//! Every network call goes through a bounded retry schedule and honours a
//! shared cancellation token.
//!
//! ## Example
//!
//! ```rust,ignore
//! use hitl_sdk::{HitlClient, Task, gateway::SubmitOptions};
//!
//! let mut client = HitlClient::from_env()?;
//! let task = Task::new().with_image(jpeg_bytes).with_field_name("surname");
//! let tasks = client.create_and_wait(vec![task], &SubmitOptions::default()).await?;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod retry;
pub mod task;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{HitlClient, SyncOutcome};
pub use config::{Config, ConfigError, Provider};
pub use error::{Error, Result};
pub use registry::{InWork, TaskRegistry};
pub use retry::RetryPolicy;
pub use task::{ImagePayload, Task, TaskValue};
