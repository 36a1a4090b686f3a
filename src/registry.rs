//! Process-wide task registry.
//!
//! Tasks are registered once at startup and the registry is then shared
//! immutably behind an `Arc`, so concurrent lookups need no locking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::types::{SchedulerError, TaskParams};

/// Boxed future returned by a task handler.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<serde_json::Value>>;

/// An invocable task handler: named JSON parameters in, JSON value out.
pub type TaskHandler = Arc<dyn Fn(TaskParams) -> TaskFuture + Send + Sync>;

/// Task metadata exposed through the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A registered task: metadata plus its handler.
#[derive(Clone)]
pub struct RegisteredTask {
    pub meta: Task,
    pub handler: TaskHandler,
}

/// Name → task mapping, populated at startup.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under `name`. Names are unique within a process.
    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        title: &str,
        description: Option<&str>,
        handler: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(TaskParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        if self.tasks.contains_key(name) {
            return Err(SchedulerError::InvalidJob(format!(
                "task '{name}' already registered"
            )));
        }
        let meta = Task {
            name: name.to_string(),
            title: title.to_string(),
            description: description.map(str::to_string),
        };
        let handler: TaskHandler = Arc::new(move |params| -> TaskFuture {
            Box::pin(handler(params))
        });
        self.tasks
            .insert(name.to_string(), RegisteredTask { meta, handler });
        Ok(())
    }

    /// Look up a task, failing with `TaskNotFound` when absent.
    pub fn lookup(&self, name: &str) -> Result<&RegisteredTask, SchedulerError> {
        self.tasks
            .get(name)
            .ok_or_else(|| SchedulerError::TaskNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Catalog of registered tasks, sorted by name.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().map(|t| t.meta.clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
