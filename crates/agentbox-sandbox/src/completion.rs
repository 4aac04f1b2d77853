//! Text-completion service contract
//!
//! "ai" steps and no-code agents talk to an opaque completion provider.
//! The sandbox only sees this trait; providers live outside the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A finished completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub text: String,
    pub tokens_used: u64,
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Request(String),

    #[error("Completion provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed completion response: {0}")]
    Response(String),
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<Completion, CompletionError>;
}
