//! Background task contract
//!
//! The stream driver treats the unit of work it relays as opaque: it is
//! run once with the prompt and cleaned up once, whatever happens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Long-running work whose log output is streamed to a client
#[async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Run the task to completion. Called at most once.
    async fn run(&self, prompt: &str) -> anyhow::Result<String>;

    /// Release resources. Called exactly once per connection, including
    /// after `run` failed, panicked or was aborted.
    async fn cleanup(&self);
}

/// Creates one background task per connection
pub trait TaskFactory: Send + Sync {
    /// Create a fresh task
    fn create(&self) -> Arc<dyn BackgroundTask>;
}

impl<F> TaskFactory for F
where
    F: Fn() -> Arc<dyn BackgroundTask> + Send + Sync,
{
    fn create(&self) -> Arc<dyn BackgroundTask> {
        self()
    }
}

/// Settings for [`ScriptedTask`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedTaskConfig {
    /// Lines logged one by one while running
    pub steps: Vec<String>,
    /// Pause before each step, in milliseconds
    pub step_delay_ms: u64,
    /// When set, `run` fails with this message after the steps
    pub fail_with: Option<String>,
}

impl Default for ScriptedTaskConfig {
    fn default() -> Self {
        Self {
            steps: vec![
                "Analyzing the request".to_string(),
                "Gathering data".to_string(),
                "Composing the answer".to_string(),
            ],
            step_delay_ms: 250,
            fail_with: None,
        }
    }
}

/// Task that logs a fixed script, standing in for a real agent
#[derive(Debug, Clone)]
pub struct ScriptedTask {
    config: ScriptedTaskConfig,
}

impl ScriptedTask {
    /// Create a task following `config`
    pub fn new(config: ScriptedTaskConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackgroundTask for ScriptedTask {
    async fn run(&self, prompt: &str) -> anyhow::Result<String> {
        let delay = Duration::from_millis(self.config.step_delay_ms);
        for step in &self.config.steps {
            tokio::time::sleep(delay).await;
            info!("{}", step);
        }
        if let Some(reason) = &self.config.fail_with {
            anyhow::bail!("{}", reason);
        }
        Ok(format!("Finished: {}", prompt.trim()))
    }

    async fn cleanup(&self) {
        debug!("Scripted task released");
    }
}

/// Factory producing [`ScriptedTask`]s
#[derive(Debug, Clone, Default)]
pub struct ScriptedTaskFactory {
    config: ScriptedTaskConfig,
}

impl ScriptedTaskFactory {
    /// Create a factory sharing one script
    pub fn new(config: ScriptedTaskConfig) -> Self {
        Self { config }
    }
}

impl TaskFactory for ScriptedTaskFactory {
    fn create(&self) -> Arc<dyn BackgroundTask> {
        Arc::new(ScriptedTask::new(self.config.clone()))
    }
}
