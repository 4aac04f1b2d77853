//! Sandbox runner façade
//!
//! Owns the module cache and the warm pool, builds both backends around
//! them and routes every call. Full code goes to the selected backend; low
//! and no code go to the default backend's step interpreter and passthrough.

use crate::CoreError;
use agentbox_sandbox::backend::{worker_pool, BuiltinEngine, Engine, RunOptions};
use agentbox_sandbox::cache::CacheStats;
use agentbox_sandbox::completion::CompletionService;
use agentbox_sandbox::pool::PoolStats;
use agentbox_sandbox::result::ExecutionResult;
use agentbox_sandbox::wasm::WasmRunner;
use agentbox_sandbox::worker::EngineWorker;
use agentbox_sandbox::{
    resolve_backend, BackendKind, ConfigOverrides, InterpretedBackend, MeteredModuleBackend, ModuleCache,
    SandboxBackend, SandboxError, SandboxSettings, WarmPool,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// How an agent is implemented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    FullCode,
    LowCode,
    NoCode,
}

/// A submitted agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub kind: AgentKind,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl AgentDefinition {
    pub fn full_code(code: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::FullCode,
            code: Some(code.into()),
            config: None,
            prompt: None,
        }
    }

    pub fn low_code(config: Value) -> Self {
        Self {
            kind: AgentKind::LowCode,
            code: None,
            config: Some(config),
            prompt: None,
        }
    }

    pub fn no_code(prompt: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::NoCode,
            code: None,
            config: None,
            prompt: Some(prompt.into()),
        }
    }
}

/// Per-call options for full-code execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionOptions {
    pub tier: Option<String>,
    pub overrides: ConfigOverrides,
    /// Wins over the process-wide backend flag
    pub backend: Option<BackendKind>,
}

impl ExecutionOptions {
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStats {
    pub default_backend: BackendKind,
    pub cache: CacheStats,
    pub pool: PoolStats,
}

pub struct SandboxRunner {
    settings: SandboxSettings,
    cache: Arc<ModuleCache>,
    pool: Arc<WarmPool<EngineWorker>>,
    interpreted: InterpretedBackend,
    metered: MeteredModuleBackend,
}

impl SandboxRunner {
    pub fn new(settings: SandboxSettings, completion: Option<Arc<dyn CompletionService>>) -> Result<Self, CoreError> {
        let runner = WasmRunner::new()?;
        let metered_engine: Arc<dyn Engine> = Arc::new(BuiltinEngine::with_wasm(runner.clone()));
        let interpreted_engine: Arc<dyn Engine> = Arc::new(BuiltinEngine::script_only());
        Ok(Self::assemble(settings, completion, interpreted_engine, metered_engine))
    }

    /// Route both backends through one engine
    pub fn with_engine(
        settings: SandboxSettings,
        completion: Option<Arc<dyn CompletionService>>,
        engine: Arc<dyn Engine>,
    ) -> Result<Self, CoreError> {
        Ok(Self::assemble(settings, completion, Arc::clone(&engine), engine))
    }

    fn assemble(
        settings: SandboxSettings,
        completion: Option<Arc<dyn CompletionService>>,
        interpreted_engine: Arc<dyn Engine>,
        metered_engine: Arc<dyn Engine>,
    ) -> Self {
        let cache = Arc::new(ModuleCache::new(settings.cache_max_entries, settings.cache_max_size_bytes));
        let pool = Arc::new(worker_pool());
        let interpreted = InterpretedBackend::with_engine(interpreted_engine, settings.clone(), completion.clone());
        let metered = MeteredModuleBackend::new(
            metered_engine,
            Arc::clone(&cache),
            Arc::clone(&pool),
            settings.clone(),
            completion,
        );
        Self {
            settings,
            cache,
            pool,
            interpreted,
            metered,
        }
    }

    /// Warm the pool and schedule its cleanup
    pub fn start(&self) {
        self.pool.start(self.settings.pool_max_size, self.settings.pool_instance_ttl_ms);
        info!(
            default_backend = %self.default_backend(),
            pool_size = self.settings.pool_max_size,
            "Sandbox runner started"
        );
    }

    /// Stop the pool and drop every cached module
    pub fn shutdown(&self) {
        self.pool.stop();
        self.cache.clear();
        info!("Sandbox runner shut down");
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn default_backend(&self) -> BackendKind {
        resolve_backend(None, self.settings.use_metered_backend)
    }

    pub fn backend(&self, kind: BackendKind) -> &dyn SandboxBackend {
        match kind {
            BackendKind::Interpreted => &self.interpreted,
            BackendKind::Metered => &self.metered,
        }
    }

    /// Dispatch on the agent's kind
    pub async fn execute(
        &self,
        agent: &AgentDefinition,
        input: Option<&Value>,
        options: &ExecutionOptions,
    ) -> ExecutionResult {
        debug!(kind = ?agent.kind, "Executing agent");
        match agent.kind {
            AgentKind::FullCode => match &agent.code {
                Some(code) => self.execute_code(code, input, options).await,
                None => ExecutionResult::failure(
                    SandboxError::Configuration("full_code agent has no code".to_string()),
                    Vec::new(),
                    0,
                ),
            },
            AgentKind::LowCode => {
                let config = agent.config.clone().unwrap_or(Value::Null);
                self.execute_low_code(&config, input).await
            }
            AgentKind::NoCode => self.execute_no_code(agent.prompt.as_deref().unwrap_or(""), input).await,
        }
    }

    pub async fn execute_code(&self, code: &str, input: Option<&Value>, options: &ExecutionOptions) -> ExecutionResult {
        let kind = resolve_backend(options.backend, self.settings.use_metered_backend);
        debug!(backend = %kind, size = code.len(), "Dispatching full-code execution");
        let run = RunOptions {
            tier: options.tier.clone(),
            overrides: options.overrides.clone(),
        };
        self.backend(kind).execute_code(code, input, &run).await
    }

    /// Input is size-checked before any step runs
    pub async fn execute_low_code(&self, config: &Value, input: Option<&Value>) -> ExecutionResult {
        self.backend(self.default_backend()).execute_low_code(config, input).await
    }

    pub async fn execute_no_code(&self, prompt: &str, context: Option<&Value>) -> ExecutionResult {
        self.backend(self.default_backend()).execute_no_code(prompt, context).await
    }

    pub async fn test_sandbox(&self, backend: Option<BackendKind>) -> ExecutionResult {
        let kind = resolve_backend(backend, self.settings.use_metered_backend);
        self.backend(kind).test_sandbox().await
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            default_backend: self.default_backend(),
            cache: self.cache.stats(),
            pool: self.pool.stats(),
        }
    }
}
