//! Agentbox Sandbox: running untrusted agent code under hard limits
//!
//! This crate holds everything below the runner façade:
//! - Resource tiers and per-call configuration
//! - V8 isolates for scripts and a wasmtime runtime for modules
//! - Static fuel estimation, the content-addressed module cache and the
//!   warm pool of engine workers
//! - Two execution backends behind the [`SandboxBackend`] trait
//! - The low-code step interpreter and the completion service contract

pub mod backend;
pub mod cache;
pub mod capabilities;
pub mod completion;
pub mod config;
pub mod fuel;
pub mod js;
pub mod module;
pub mod no_code;
pub mod pool;
pub mod result;
pub mod steps;
pub mod tiers;
pub mod wasm;
pub mod worker;

pub use backend::{resolve_backend, BackendKind, InterpretedBackend, MeteredModuleBackend, SandboxBackend};
pub use cache::ModuleCache;
pub use config::{ConfigOverrides, SandboxConfig, SandboxSettings};
pub use fuel::{FuelMeter, FuelMeteringResult};
pub use pool::WarmPool;
pub use result::ExecutionResult;
pub use tiers::ResourceTier;

use thiserror::Error;

/// Broad failure classes, used for logging and by callers that branch on them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    BudgetExceeded,
    EngineFault,
    Configuration,
    DependencyUnavailable,
    Internal,
}

/// Sandbox errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("Code size {size} bytes exceeds maximum of {max} bytes")]
    CodeTooLarge { size: usize, max: usize },

    #[error("Input size {size} bytes exceeds maximum of {max} bytes")]
    InputTooLarge { size: usize, max: usize },

    #[error("Fuel limit exceeded: consumed {consumed} fuel, limit {limit}")]
    FuelLimitExceeded { consumed: u64, limit: u64 },

    #[error("Memory limit exceeded: used {used} bytes, limit {limit} bytes")]
    MemoryLimitExceeded { used: u64, limit: u64 },

    #[error("Execution timed out after {limit_ms}ms")]
    TimeLimitExceeded { limit_ms: u64 },

    #[error("{0}")]
    EngineFault(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CodeTooLarge { .. } | Self::InputTooLarge { .. } => ErrorKind::Validation,
            Self::FuelLimitExceeded { .. } | Self::MemoryLimitExceeded { .. } | Self::TimeLimitExceeded { .. } => {
                ErrorKind::BudgetExceeded
            }
            Self::EngineFault(_) => ErrorKind::EngineFault,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::DependencyUnavailable(_) => ErrorKind::DependencyUnavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        let err = SandboxError::CodeTooLarge { size: 600_000, max: 524_288 };
        assert_eq!(err.to_string(), "Code size 600000 bytes exceeds maximum of 524288 bytes");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_budget_errors() {
        let err = SandboxError::FuelLimitExceeded { consumed: 12, limit: 10 };
        assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
        assert_eq!(err.to_string(), "Fuel limit exceeded: consumed 12 fuel, limit 10");

        let err = SandboxError::TimeLimitExceeded { limit_ms: 200 };
        assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
        assert_eq!(SandboxError::EngineFault("Uncaught Error: nope".into()).to_string(), "Uncaught Error: nope");
    }
}
