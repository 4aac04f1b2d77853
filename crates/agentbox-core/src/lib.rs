//! Agentbox Core - execution façade and agent dispatch
//!
//! Frontends (the CLI, a future API server) hold one [`SandboxRunner`] and
//! call it for every agent execution.

pub mod completion;
pub mod runner;

pub use completion::{CompletionConfig, HttpCompletionService};
pub use runner::{AgentDefinition, AgentKind, ExecutionOptions, RunnerStats, SandboxRunner};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Sandbox(#[from] agentbox_sandbox::SandboxError),

    #[error("Invalid settings: {0}")]
    Settings(String),
}

/// Parse runner settings from JSON. Missing fields keep their defaults.
pub fn settings_from_json(text: &str) -> Result<agentbox_sandbox::SandboxSettings, CoreError> {
    serde_json::from_str(text).map_err(|e| CoreError::Settings(e.to_string()))
}
