//! Execution backends
//!
//! Both backends run code through an [`Engine`] on an engine thread (see
//! [`crate::worker`]) and turn every outcome, including internal faults,
//! into an [`ExecutionResult`]. Which backend serves a call is decided by
//! [`resolve_backend`].

mod interpreted;
mod metered;

pub use interpreted::InterpretedBackend;
pub use metered::{worker_pool, MeteredModuleBackend};

use crate::config::{ConfigOverrides, SandboxSettings};
use crate::fuel::FuelMeteringResult;
use crate::js::{self, JsLimits};
use crate::module::CompiledModule;
use crate::no_code;
use crate::result::{ExecutionLog, ExecutionResult};
use crate::steps::StepInterpreter;
use crate::wasm::{WasmLimits, WasmRunner};
use crate::{Result, SandboxError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Snippet run by `test_sandbox`
pub const SELF_TEST_CODE: &str = r#"
const sum = 2 + 2;
return { result: sum, test: sum === 4 ? "passed" : "failed" };
"#;

/// Which backend serves a full-code call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Interpreted,
    Metered,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interpreted => "interpreted",
            Self::Metered => "metered",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpreted" | "interpreter" => Ok(Self::Interpreted),
            "metered" | "wasm" | "module" => Ok(Self::Metered),
            other => Err(SandboxError::Configuration(format!("unknown backend '{}'", other))),
        }
    }
}

/// An explicit per-call choice wins; otherwise the process-wide flag decides
pub fn resolve_backend(requested: Option<BackendKind>, use_metered_backend: bool) -> BackendKind {
    match requested {
        Some(kind) => kind,
        None if use_metered_backend => BackendKind::Metered,
        None => BackendKind::Interpreted,
    }
}

/// Tier and overrides for one full-code call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub tier: Option<String>,
    pub overrides: ConfigOverrides,
}

impl RunOptions {
    pub fn tier(tier: impl Into<String>) -> Self {
        Self {
            tier: Some(tier.into()),
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Uniform execution contract. Implementations never return errors: every
/// failure is a result with `success: false`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn step_interpreter(&self) -> &StepInterpreter;

    fn settings(&self) -> &SandboxSettings;

    async fn execute_code(&self, code: &str, input: Option<&Json>, options: &RunOptions) -> ExecutionResult;

    async fn execute_low_code(&self, config: &Json, input: Option<&Json>) -> ExecutionResult {
        if let Err(e) = validate_input(input, self.settings()) {
            warn!(error = %e, "Rejected low-code input");
            return ExecutionLog::start().fail(e).with_backend(self.kind().as_str());
        }
        self.step_interpreter()
            .execute(config, input)
            .await
            .with_backend(self.kind().as_str())
    }

    async fn execute_no_code(&self, prompt: &str, context: Option<&Json>) -> ExecutionResult {
        if let Err(e) = validate_input(context, self.settings()) {
            warn!(error = %e, "Rejected no-code context");
            return ExecutionLog::start().fail(e).with_backend(self.kind().as_str());
        }
        no_code::passthrough(prompt, context).with_backend(self.kind().as_str())
    }

    /// Run the 2 + 2 smoke test through the full code path
    async fn test_sandbox(&self) -> ExecutionResult {
        self.execute_code(SELF_TEST_CODE, None, &RunOptions::default()).await
    }
}

/// Limits handed to an engine for one execution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineLimits {
    pub timeout_ms: u64,
    pub fuel_limit: u64,
    pub enable_fuel_metering: bool,
    pub memory_limit_bytes: u64,
}

pub struct EngineRequest {
    pub input: Json,
    pub env: BTreeMap<String, String>,
    pub limits: EngineLimits,
}

#[derive(Debug)]
pub struct EngineOutcome {
    pub output: Result<Json>,
    pub logs: Vec<String>,
    /// Fuel the engine measured itself. Scripts leave this empty and are
    /// charged their pre-flight estimate instead.
    pub fuel: Option<FuelMeteringResult>,
    pub memory_used_bytes: u64,
}

/// Compiles and runs code units.
///
/// Execution futures are not `Send`: a V8 isolate is pinned to the engine
/// thread that created it.
#[async_trait(?Send)]
pub trait Engine: Send + Sync {
    fn compile(&self, source: &str) -> Result<CompiledModule>;

    async fn execute(&self, module: &CompiledModule, request: &EngineRequest) -> EngineOutcome;
}

/// The in-process engine: V8 for scripts, plus wasmtime when enabled
pub struct BuiltinEngine {
    wasm: Option<WasmRunner>,
}

impl BuiltinEngine {
    /// Scripts only; WAT sources are rejected
    pub fn script_only() -> Self {
        Self { wasm: None }
    }

    pub fn with_wasm(runner: WasmRunner) -> Self {
        Self { wasm: Some(runner) }
    }

    pub fn wasm_runner(&self) -> Option<&WasmRunner> {
        self.wasm.as_ref()
    }
}

#[async_trait(?Send)]
impl Engine for BuiltinEngine {
    fn compile(&self, source: &str) -> Result<CompiledModule> {
        CompiledModule::compile(source, self.wasm.as_ref())
    }

    async fn execute(&self, module: &CompiledModule, request: &EngineRequest) -> EngineOutcome {
        let limits = request.limits;
        match module {
            CompiledModule::Script { prepared, .. } => {
                let js_limits = JsLimits {
                    timeout_ms: limits.timeout_ms,
                    heap_limit_bytes: limits.memory_limit_bytes,
                };
                let outcome = js::run(prepared, &request.input, &request.env, js_limits).await;
                EngineOutcome {
                    output: outcome.output,
                    logs: outcome.logs,
                    fuel: None,
                    memory_used_bytes: outcome.heap_used_bytes,
                }
            }
            CompiledModule::Wasm { module, .. } => {
                let Some(runner) = &self.wasm else {
                    return EngineOutcome {
                        output: Err(SandboxError::EngineFault(
                            "WebAssembly modules are not supported by this engine".to_string(),
                        )),
                        logs: Vec::new(),
                        fuel: None,
                        memory_used_bytes: 0,
                    };
                };
                let wasm_limits = WasmLimits {
                    fuel_limit: limits.fuel_limit,
                    enable_fuel_metering: limits.enable_fuel_metering,
                    memory_limit_bytes: limits.memory_limit_bytes,
                    cpu_time_limit_ms: limits.timeout_ms,
                };
                let outcome = runner.execute(module, &request.input, wasm_limits);
                EngineOutcome {
                    output: outcome.output,
                    logs: Vec::new(),
                    fuel: Some(outcome.fuel),
                    memory_used_bytes: outcome.memory_used_bytes,
                }
            }
        }
    }
}

/// Size checks shared by both backends. Nothing else runs when these fail.
pub(crate) fn validate(code: &str, input: Option<&Json>, settings: &SandboxSettings) -> Result<()> {
    if code.len() > settings.max_code_size_bytes {
        return Err(SandboxError::CodeTooLarge {
            size: code.len(),
            max: settings.max_code_size_bytes,
        });
    }
    validate_input(input, settings)
}

/// Serialized size check applied to every kind of agent input
pub(crate) fn validate_input(input: Option<&Json>, settings: &SandboxSettings) -> Result<()> {
    if let Some(input) = input {
        let size = serde_json::to_vec(input)
            .map_err(|e| SandboxError::Internal(format!("failed to serialize input: {}", e)))?
            .len();
        if size > settings.max_input_size_bytes {
            return Err(SandboxError::InputTooLarge {
                size,
                max: settings.max_input_size_bytes,
            });
        }
    }
    Ok(())
}

/// Fold an engine outcome into the call's log and seal it
pub(crate) fn finish(mut log: ExecutionLog, outcome: EngineOutcome) -> ExecutionResult {
    log.extend_logs(outcome.logs);
    match outcome.output {
        Ok(output) => log.succeed(output).with_memory_used(outcome.memory_used_bytes.max(1)),
        Err(e) => log.fail(e),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_backend_override_wins() {
        assert_eq!(resolve_backend(Some(BackendKind::Interpreted), true), BackendKind::Interpreted);
        assert_eq!(resolve_backend(Some(BackendKind::Metered), false), BackendKind::Metered);
        assert_eq!(resolve_backend(None, true), BackendKind::Metered);
        assert_eq!(resolve_backend(None, false), BackendKind::Interpreted);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Metered".parse::<BackendKind>().unwrap(), BackendKind::Metered);
        assert_eq!("interpreted".parse::<BackendKind>().unwrap(), BackendKind::Interpreted);
        assert!("quantum".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_validate_limits() {
        let settings = SandboxSettings {
            max_code_size_bytes: 8,
            max_input_size_bytes: 8,
            ..SandboxSettings::default()
        };
        assert!(validate("1 + 1;", None, &settings).is_ok());

        let err = validate("return 100000;", None, &settings).unwrap_err();
        assert!(err.to_string().contains("Code size"));
        assert!(err.to_string().contains("exceeds maximum"));

        let err = validate("1;", Some(&json!({"long": "value"})), &settings).unwrap_err();
        assert!(matches!(err, SandboxError::InputTooLarge { .. }));
    }

    #[test]
    fn test_validate_input_alone() {
        let settings = SandboxSettings {
            max_input_size_bytes: 8,
            ..SandboxSettings::default()
        };
        assert!(validate_input(None, &settings).is_ok());
        assert!(validate_input(Some(&json!([1, 2])), &settings).is_ok());
        let err = validate_input(Some(&json!("a long string")), &settings).unwrap_err();
        assert_eq!(err, SandboxError::InputTooLarge { size: 15, max: 8 });
    }

    fn request(input: Json) -> EngineRequest {
        EngineRequest {
            input,
            env: BTreeMap::new(),
            limits: EngineLimits {
                timeout_ms: 5_000,
                fuel_limit: 1_000_000,
                enable_fuel_metering: true,
                memory_limit_bytes: 64 << 20,
            },
        }
    }

    #[tokio::test]
    async fn test_builtin_engine_runs_script() {
        let engine = BuiltinEngine::script_only();
        let module = engine.compile("return input * 2;").unwrap();
        let outcome = engine.execute(&module, &request(json!(21))).await;
        assert_eq!(outcome.output.unwrap(), json!(42));
        assert!(outcome.fuel.is_none());
        assert!(outcome.memory_used_bytes > 0);
    }

    #[tokio::test]
    async fn test_builtin_engine_reports_wasm_fuel() {
        let engine = BuiltinEngine::with_wasm(WasmRunner::new().unwrap());
        let module = engine
            .compile(r#"(module (func (export "run") (param i32) (result i32) local.get 0 i32.const 1 i32.add))"#)
            .unwrap();
        let outcome = engine.execute(&module, &request(json!(41))).await;
        assert_eq!(outcome.output.unwrap(), json!(42));
        assert!(outcome.fuel.unwrap().fuel_consumed > 0);
    }
}
