//! Interpreted backend: a fresh V8 isolate under a wall-clock deadline and a
//! heap ceiling. Fuel is neither estimated nor enforced here.

use super::{finish, validate, BackendKind, BuiltinEngine, Engine, EngineLimits, EngineRequest, RunOptions, SandboxBackend};
use crate::capabilities::CapabilitySet;
use crate::completion::CompletionService;
use crate::config::{SandboxConfig, SandboxSettings};
use crate::result::{ExecutionLog, ExecutionResult};
use crate::steps::StepInterpreter;
use crate::worker::EngineGate;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct InterpretedBackend {
    engine: Arc<dyn Engine>,
    gate: EngineGate,
    settings: SandboxSettings,
    steps: StepInterpreter,
}

impl InterpretedBackend {
    pub fn new(settings: SandboxSettings, completion: Option<Arc<dyn CompletionService>>) -> Self {
        Self::with_engine(Arc::new(BuiltinEngine::script_only()), settings, completion)
    }

    pub fn with_engine(
        engine: Arc<dyn Engine>,
        settings: SandboxSettings,
        completion: Option<Arc<dyn CompletionService>>,
    ) -> Self {
        Self {
            engine,
            gate: EngineGate::new(settings.max_concurrent_executions),
            settings,
            steps: StepInterpreter::new(completion),
        }
    }
}

#[async_trait]
impl SandboxBackend for InterpretedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreted
    }

    fn step_interpreter(&self) -> &StepInterpreter {
        &self.steps
    }

    fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    async fn execute_code(&self, code: &str, input: Option<&Json>, options: &RunOptions) -> ExecutionResult {
        let mut log = ExecutionLog::start();
        if let Err(e) = validate(code, input, &self.settings) {
            warn!(error = %e, "Rejected code before execution");
            return log.fail(e).with_backend(self.kind().as_str());
        }

        let tier = options.tier.as_deref().unwrap_or(&self.settings.default_tier);
        let config = SandboxConfig::resolve(tier, &options.overrides);
        let capabilities = CapabilitySet::from_config(&config);
        for line in capabilities.describe() {
            log.log(line);
        }

        let request = EngineRequest {
            input: input.cloned().unwrap_or(Json::Null),
            env: capabilities.env_vars(),
            limits: EngineLimits {
                timeout_ms: self.settings.interpreter_timeout_ms,
                fuel_limit: config.fuel_limit,
                enable_fuel_metering: false,
                memory_limit_bytes: self.settings.interpreter_memory_limit_bytes,
            },
        };

        let engine = Arc::clone(&self.engine);
        let source = code.to_string();
        let outcome = self
            .gate
            .run(move || async move {
                let module = engine.compile(&source)?;
                Ok(engine.execute(&module, &request).await)
            })
            .await
            .and_then(|compiled| compiled);

        let result = match outcome {
            Ok(outcome) => finish(log, outcome),
            Err(e) => log.fail(e),
        };
        debug!(
            success = result.success,
            elapsed_ms = result.execution_time_ms,
            free_engines = self.gate.available(),
            "Interpreted execution finished"
        );
        result.with_backend(self.kind().as_str())
    }
}
