//! Metered module backend
//!
//! Resolves limits from the caller's tier, rejects scripts whose estimated
//! fuel is over budget, compiles through the module cache and runs on a warm
//! engine worker when the pool has one free. Each run still gets a fresh
//! isolate sized to the tier. Wasm fuel is counted by wasmtime while it runs.

use super::{
    finish, validate, BackendKind, BuiltinEngine, Engine, EngineLimits, EngineOutcome, EngineRequest, RunOptions,
    SandboxBackend,
};
use crate::cache::ModuleCache;
use crate::capabilities::CapabilitySet;
use crate::completion::CompletionService;
use crate::config::{SandboxConfig, SandboxSettings};
use crate::fuel::{FuelMeter, FuelMeteringResult};
use crate::pool::WarmPool;
use crate::result::{ExecutionLog, ExecutionResult};
use crate::steps::StepInterpreter;
use crate::wasm::{self, WasmRunner};
use crate::worker::{EngineGate, EngineWorker};
use crate::{ErrorKind, Result, SandboxError};
use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct MeteredModuleBackend {
    engine: Arc<dyn Engine>,
    cache: Arc<ModuleCache>,
    pool: Arc<WarmPool<EngineWorker>>,
    gate: EngineGate,
    meter: FuelMeter,
    settings: SandboxSettings,
    steps: StepInterpreter,
}

impl MeteredModuleBackend {
    pub fn new(
        engine: Arc<dyn Engine>,
        cache: Arc<ModuleCache>,
        pool: Arc<WarmPool<EngineWorker>>,
        settings: SandboxSettings,
        completion: Option<Arc<dyn CompletionService>>,
    ) -> Self {
        Self {
            engine,
            cache,
            pool,
            gate: EngineGate::new(settings.max_concurrent_executions),
            meter: FuelMeter::new(),
            settings,
            steps: StepInterpreter::new(completion),
        }
    }

    /// Built-in engine with wasm support, plus a fresh cache and an
    /// unstarted pool
    pub fn standalone(settings: SandboxSettings, completion: Option<Arc<dyn CompletionService>>) -> Result<Self> {
        let runner = WasmRunner::new()?;
        let cache = Arc::new(ModuleCache::new(settings.cache_max_entries, settings.cache_max_size_bytes));
        let pool = Arc::new(worker_pool());
        let engine = Arc::new(BuiltinEngine::with_wasm(runner));
        Ok(Self::new(engine, cache, pool, settings, completion))
    }

    pub fn with_meter(mut self, meter: FuelMeter) -> Self {
        self.meter = meter;
        self
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<WarmPool<EngineWorker>> {
        &self.pool
    }

    async fn run(
        &self,
        code: &str,
        input: Option<&Json>,
        options: &RunOptions,
        log: &mut ExecutionLog,
        fuel: &mut Option<FuelMeteringResult>,
    ) -> Result<EngineOutcome> {
        validate(code, input, &self.settings)?;

        let tier = options.tier.as_deref().unwrap_or(&self.settings.default_tier);
        let config = SandboxConfig::resolve(tier, &options.overrides);
        let capabilities = CapabilitySet::from_config(&config);
        for line in capabilities.describe() {
            log.log(line);
        }

        if !wasm::is_wat(code) {
            let estimate = self.meter.estimate(code, config.fuel_limit, config.enable_fuel_metering);
            debug!(
                tier = %config.tier_name,
                estimated = estimate.fuel_consumed,
                limit = config.fuel_limit,
                "Pre-flight fuel estimate"
            );
            let exceeded = estimate.fuel_limit_exceeded;
            let consumed = estimate.fuel_consumed;
            *fuel = Some(estimate);
            if exceeded {
                warn!(tier = %config.tier_name, consumed, "Rejected code over fuel budget");
                return Err(SandboxError::FuelLimitExceeded {
                    consumed,
                    limit: config.fuel_limit,
                });
            }
        }

        let cached = self.cache.get(code);
        if cached.is_some() {
            log.log("Using cached module");
        }

        let request = EngineRequest {
            input: input.cloned().unwrap_or(Json::Null),
            env: capabilities.env_vars(),
            limits: EngineLimits {
                timeout_ms: config.cpu_time_limit_ms,
                fuel_limit: config.fuel_limit,
                enable_fuel_metering: config.enable_fuel_metering,
                memory_limit_bytes: config.memory_limit_bytes,
            },
        };

        let engine = Arc::clone(&self.engine);
        let source = code.to_string();
        let work = move || async move {
            let (module, compiled) = match cached {
                Some(module) => (module, false),
                None => (Arc::new(engine.compile(&source)?), true),
            };
            let outcome = engine.execute(&module, &request).await;
            Ok::<_, SandboxError>((module, compiled, outcome))
        };

        let lease = self.pool.acquire();
        let ran = match &lease {
            Some(lease) => {
                log.log(format!("Using pooled execution context {}", lease.id()));
                let _permit = self.gate.enter().await?;
                lease.context().run(work).await
            }
            None => {
                log.log("Creating new execution context");
                self.gate.run(work).await
            }
        };
        drop(lease);
        let (module, compiled, mut outcome) = ran??;

        if compiled {
            self.cache.set(code, Arc::clone(&module));
        }

        if let Some(measured) = outcome.fuel.take() {
            *fuel = Some(measured);
        }
        let Some(report) = fuel.as_ref() else {
            return Ok(outcome);
        };
        log.log(format!(
            "Fuel consumed: {}/{} ({} instructions)",
            report.fuel_consumed, config.fuel_limit, report.instructions_executed
        ));
        info!(
            tier = %config.tier_name,
            kind = module.kind(),
            fuel = report.fuel_consumed,
            instructions = report.instructions_executed,
            "Metered execution finished"
        );

        if report.fuel_limit_exceeded && outcome.output.is_ok() {
            outcome.output = Err(SandboxError::FuelLimitExceeded {
                consumed: report.fuel_consumed,
                limit: config.fuel_limit,
            });
        }
        Ok(outcome)
    }
}

/// Warm pool of engine worker threads
pub fn worker_pool() -> WarmPool<EngineWorker> {
    WarmPool::new(EngineWorker::spawn)
}

#[async_trait]
impl SandboxBackend for MeteredModuleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Metered
    }

    fn step_interpreter(&self) -> &StepInterpreter {
        &self.steps
    }

    fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    async fn execute_code(&self, code: &str, input: Option<&Json>, options: &RunOptions) -> ExecutionResult {
        let mut log = ExecutionLog::start();
        let mut fuel = None;
        let result = match self.run(code, input, options, &mut log, &mut fuel).await {
            Ok(outcome) => finish(log, outcome),
            Err(e) => {
                if e.kind() == ErrorKind::Validation {
                    warn!(error = %e, "Rejected code before execution");
                }
                log.fail(e)
            }
        };
        let result = match fuel {
            Some(fuel) => result.with_fuel(fuel),
            None => result,
        };
        result.with_backend(self.kind().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::CountingEngine;
    use crate::config::ConfigOverrides;
    use serde_json::json;

    const NESTED_LOOPS: &str = r#"
        let total = 0;
        for (let i = 0; i < 100; i++) {
            for (let j = 0; j < 100; j++) {
                total += i * j;
            }
        }
        return total;
    "#;

    fn backend() -> MeteredModuleBackend {
        MeteredModuleBackend::standalone(SandboxSettings::default(), None).unwrap()
    }

    #[tokio::test]
    async fn test_success_reports_fuel_and_memory() {
        let result = backend()
            .execute_code("const xs = [1, 2, 3]; return xs.map(x => x * input);", Some(&json!(10)), &RunOptions::default())
            .await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.output, json!([10, 20, 30]));
        assert!(result.memory_used_bytes.unwrap() > 0);
        let fuel = result.fuel.unwrap();
        assert!(fuel.fuel_consumed > 0);
        assert!(!fuel.fuel_limit_exceeded);
        assert!(result.logs.iter().any(|l| l.starts_with("Fuel consumed:")));
        assert_eq!(result.backend.as_deref(), Some("metered"));
    }

    #[tokio::test]
    async fn test_basic_tier_fuel_override_rejects_nested_loops() {
        let options = RunOptions::tier("basic").with_overrides(ConfigOverrides::default().with_fuel_limit(10));
        let result = backend().execute_code(NESTED_LOOPS, None, &options).await;

        assert!(!result.success);
        assert!(result.errors[0].contains("Fuel limit exceeded"));
        let fuel = result.fuel.unwrap();
        assert!(fuel.fuel_limit_exceeded);
        assert!(fuel.fuel_consumed > 10);
    }

    #[tokio::test]
    async fn test_metering_disabled_never_exceeds() {
        let mut overrides = ConfigOverrides::default().with_fuel_limit(10);
        overrides.enable_fuel_metering = Some(false);
        let result = backend().execute_code(NESTED_LOOPS, None, &RunOptions::default().with_overrides(overrides)).await;

        assert!(result.success, "{:?}", result.errors);
        let fuel = result.fuel.unwrap();
        assert!(!fuel.fuel_limit_exceeded);
        assert!(fuel.instructions_executed > 0);
    }

    #[tokio::test]
    async fn test_memory_limit_is_enforced() {
        let options =
            RunOptions::default().with_overrides(ConfigOverrides::default().with_memory_limit(10 * 1024 * 1024));
        let code = "const rows = []; while (true) { rows.push(new Array(100000).fill('x')); }";
        let result = backend().execute_code(code, None, &options).await;

        assert!(!result.success);
        assert!(!result.errors[0].contains("timed out"), "{:?}", result.errors);
    }

    #[tokio::test]
    async fn test_script_fuel_is_the_estimate() {
        let backend = backend();
        let code = "let s = 0; for (let i = 0; i < 50; i++) { s += i; } return s;";
        let expected = FuelMeter::new().estimate(code, 100_000_000, true);
        let result = backend.execute_code(code, None, &RunOptions::default()).await;

        assert_eq!(result.output, json!(1225));
        assert_eq!(result.fuel.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_second_run_hits_cache() {
        let backend = backend();
        let first = backend.execute_code("return 1 + 1;", None, &RunOptions::default()).await;
        let second = backend.execute_code("return 1 + 1;", None, &RunOptions::default()).await;

        assert!(first.success && second.success);
        assert!(!first.logs.iter().any(|l| l == "Using cached module"));
        assert!(second.logs.iter().any(|l| l == "Using cached module"));
        let stats = backend.cache().stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_pooled_context_is_used_and_released() {
        let backend = backend();
        let cold = backend.execute_code("return 1;", None, &RunOptions::default()).await;
        assert!(cold.logs.iter().any(|l| l == "Creating new execution context"));

        backend.pool().start(2, 60_000);
        let warm = backend.execute_code("return 1;", None, &RunOptions::default()).await;
        assert!(warm.logs.iter().any(|l| l.starts_with("Using pooled execution context")));
        assert_eq!(backend.pool().stats().in_use, 0);
        backend.pool().stop();
    }

    #[tokio::test]
    async fn test_oversized_code_never_reaches_engine() {
        let engine = Arc::new(CountingEngine::new());
        let backend = MeteredModuleBackend::new(
            engine.clone(),
            Arc::new(ModuleCache::default()),
            Arc::new(worker_pool()),
            SandboxSettings::default(),
            None,
        );
        let code = "1;".repeat(300 * 1024);

        let result = backend.execute_code(&code, None, &RunOptions::default()).await;
        assert!(!result.success);
        assert!(result.errors[0].contains("Code size"));
        assert_eq!(engine.calls(), 0);
        assert_eq!(backend.cache().stats().misses, 0);
    }

    #[tokio::test]
    async fn test_wasm_module_runs() {
        let wat = r#"
            (module
              (func (export "run") (param i32) (result i32)
                local.get 0
                i32.const 2
                i32.mul))
        "#;
        let result = backend().execute_code(wat, Some(&json!(21)), &RunOptions::default()).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.output, json!(42));
        assert!(result.fuel.unwrap().fuel_consumed > 0);
    }

    #[tokio::test]
    async fn test_wasm_fuel_exhaustion() {
        let wat = r#"(module (func (export "run") (loop $spin (br $spin))))"#;
        let options = RunOptions::default().with_overrides(ConfigOverrides::default().with_fuel_limit(10_000));
        let result = backend().execute_code(wat, None, &options).await;

        assert!(!result.success);
        assert!(result.errors[0].contains("Fuel limit exceeded"));
    }

    #[tokio::test]
    async fn test_wasm_without_entry_point_fails() {
        let result = backend()
            .execute_code(r#"(module (func (export "start")))"#, None, &RunOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("`run` or `main`"));
    }

    #[tokio::test]
    async fn test_self_test_passes() {
        let result = backend().test_sandbox().await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.output["result"], 4);
        assert_eq!(result.output["test"], "passed");
    }

    #[tokio::test]
    async fn test_pooled_worker_keeps_runs_isolated() {
        let backend = backend();
        backend.pool().start(1, 60_000);
        let first = backend
            .execute_code("globalThis.leak = 'secret'; return 1;", None, &RunOptions::default())
            .await;
        let second = backend.execute_code("return typeof leak;", None, &RunOptions::default()).await;

        assert!(first.success && second.success);
        assert!(second.logs.iter().any(|l| l.starts_with("Using pooled execution context")));
        assert_eq!(second.output, json!("undefined"));
        backend.pool().stop();
    }

    #[tokio::test]
    async fn test_low_code_runs_steps() {
        let config = json!({
            "variables": {"name": "ada"},
            "steps": [{"type": "transform", "action": "uppercase", "params": {"field": "name"}}]
        });
        let result = backend().execute_low_code(&config, None).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.output["name"], "ADA");
        assert_eq!(result.backend.as_deref(), Some("metered"));
    }

    #[tokio::test]
    async fn test_no_code_passes_prompt_through() {
        let result = backend().execute_no_code("Classify the ticket", None).await;
        assert!(result.success);
        assert_eq!(result.output["mode"], "no_code");
        assert_eq!(result.backend.as_deref(), Some("metered"));
    }

    #[tokio::test]
    async fn test_oversized_low_and_no_code_input_is_rejected() {
        let settings = SandboxSettings {
            max_input_size_bytes: 32,
            ..SandboxSettings::default()
        };
        let backend = MeteredModuleBackend::standalone(settings, None).unwrap();
        let input = json!({"notes": "this context is longer than thirty-two bytes"});

        let low = backend.execute_low_code(&json!({"steps": []}), Some(&input)).await;
        assert!(!low.success);
        assert!(low.errors[0].contains("Input size"));

        let no = backend.execute_no_code("Summarize", Some(&input)).await;
        assert!(!no.success);
        assert!(no.errors[0].contains("Input size"));
        assert_eq!(no.backend.as_deref(), Some("metered"));
    }
}
