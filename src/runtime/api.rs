//! API-facing request/response models and the async service surface.

use serde::{Deserialize, Serialize};

use crate::core::descriptor::TaskSpec;
use crate::core::registry::AddReport;
use crate::core::LoaderError;
use crate::runtime::Scheduler;

/// Batch of task descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBatch {
    /// Task descriptions.
    pub tasks: Vec<TaskSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchWire {
    Wrapped { tasks: Vec<TaskSpec> },
    Bare(Vec<TaskSpec>),
}

impl TaskBatch {
    /// Parse `{"tasks": [...]}` or a bare list.
    ///
    /// # Errors
    ///
    /// Returns the parse error for anything else.
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        let tasks = match serde_json::from_str(input)? {
            BatchWire::Wrapped { tasks } | BatchWire::Bare(tasks) => tasks,
        };
        Ok(Self { tasks })
    }
}

/// Binary upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryUpload {
    /// Name tasks refer to.
    pub name: String,
    /// Image bytes.
    pub image: Vec<u8>,
}

/// Health response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Tasks in the registry.
    pub tasks: usize,
    /// Tasks with a running instance.
    pub running: usize,
    /// Events buffered in the log.
    pub events: usize,
}

/// Build a health payload for `scheduler`.
pub fn health(scheduler: &Scheduler) -> Health {
    let stats = scheduler.stats();
    Health {
        ok: true,
        tasks: stats.tasks,
        running: stats.running,
        events: stats.events,
    }
}

/// Async surface for transports running on an async runtime.
#[async_trait::async_trait]
pub trait SchedulerService: Send + Sync {
    /// Add task descriptions.
    async fn add_tasks(&self, batch: TaskBatch) -> Result<AddReport, LoaderError>;
    /// Stop and remove every task.
    async fn clear_tasks(&self) -> Result<usize, LoaderError>;
    /// Register or replace a binary.
    async fn register_binary(&self, upload: BinaryUpload) -> Result<(), LoaderError>;
    /// Arm every schedulable task via the start worker.
    async fn start(&self) -> Result<(), LoaderError>;
    /// Stop every task.
    async fn stop(&self) -> Result<(), LoaderError>;
    /// Drain the event log as JSON.
    async fn profile_data(&self) -> Result<String, LoaderError>;
    /// Health summary.
    async fn health(&self) -> Health;
}

#[cfg(feature = "tokio-runtime")]
mod tokio_service {
    use std::sync::Arc;

    use super::{health, BinaryUpload, Health, SchedulerService, TaskBatch};
    use crate::core::registry::AddReport;
    use crate::core::LoaderError;
    use crate::runtime::Scheduler;

    async fn blocking<T, F>(f: F) -> Result<T, LoaderError>
    where
        F: FnOnce() -> Result<T, LoaderError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| LoaderError::Internal(format!("blocking task failed: {e}")))?
    }

    #[async_trait::async_trait]
    impl SchedulerService for Arc<Scheduler> {
        async fn add_tasks(&self, batch: TaskBatch) -> Result<AddReport, LoaderError> {
            self.registry().add_tasks(batch.tasks)
        }

        async fn clear_tasks(&self) -> Result<usize, LoaderError> {
            let scheduler = Arc::clone(self);
            blocking(move || Scheduler::clear_tasks(&scheduler)).await
        }

        async fn register_binary(&self, upload: BinaryUpload) -> Result<(), LoaderError> {
            self.registry().register_binary(&upload.name, upload.image)
        }

        async fn start(&self) -> Result<(), LoaderError> {
            self.registry().request_start()
        }

        async fn stop(&self) -> Result<(), LoaderError> {
            let scheduler = Arc::clone(self);
            blocking(move || {
                Scheduler::stop(&scheduler);
                Ok(())
            })
            .await
        }

        async fn profile_data(&self) -> Result<String, LoaderError> {
            self.registry().profile_data()
        }

        async fn health(&self) -> Health {
            health(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_accepts_wrapped_and_bare_lists() {
        let wrapped = TaskBatch::from_json(r#"{"tasks":[{"id":1,"binary_name":"a"}]}"#).unwrap();
        let bare = TaskBatch::from_json(r#"[{"id":1,"binary_name":"a"}]"#).unwrap();
        assert_eq!(wrapped, bare);
        assert_eq!(bare.tasks[0].id, 1);
        assert!(TaskBatch::from_json(r#"{"id":1}"#).is_err());
    }
}
