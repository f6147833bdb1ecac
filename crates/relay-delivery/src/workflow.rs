//! Task handler for workflow tasks.

use std::sync::Arc;

use async_trait::async_trait;
use relay_queue::{TaskEnvelope, TaskError, TaskHandler, TaskPayload};
use serde_json::Value;
use tracing::info;

/// Executes a named workflow.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Runs the workflow to completion.
    ///
    /// # Errors
    ///
    /// Returns `TaskError` with a transient/permanent classification.
    async fn run(&self, workflow: &str, input: &Value) -> Result<(), TaskError>;
}

/// Runner that records the invocation and succeeds.
///
/// Stands in until concrete workflows are wired up; keeps the workflow
/// queue drained in deployments without them.
pub struct LoggingWorkflowRunner;

#[async_trait]
impl WorkflowRunner for LoggingWorkflowRunner {
    async fn run(&self, workflow: &str, _input: &Value) -> Result<(), TaskError> {
        info!(workflow, "workflow executed");
        Ok(())
    }
}

/// Handles `workflow` tasks by delegating to a [`WorkflowRunner`].
pub struct WorkflowTaskHandler {
    runner: Arc<dyn WorkflowRunner>,
}

impl WorkflowTaskHandler {
    /// Creates a handler over the given runner.
    pub fn new(runner: Arc<dyn WorkflowRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TaskHandler for WorkflowTaskHandler {
    async fn handle(&self, envelope: TaskEnvelope) -> Result<(), TaskError> {
        let TaskPayload::Workflow(task) = envelope.payload else {
            return Err(TaskError::permanent("workflow handler received non-workflow payload"));
        };

        self.runner.run(&task.workflow, &task.input).await
    }
}
