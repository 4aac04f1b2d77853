//! End-to-end behavior of the sandbox runner

use agentbox_core::{AgentDefinition, ExecutionOptions, SandboxRunner};
use agentbox_sandbox::backend::{BuiltinEngine, Engine, EngineOutcome, EngineRequest};
use agentbox_sandbox::completion::{Completion, CompletionError, CompletionService};
use agentbox_sandbox::fuel::FuelMeter;
use agentbox_sandbox::module::CompiledModule;
use agentbox_sandbox::wasm::WasmRunner;
use agentbox_sandbox::{tiers, BackendKind, ConfigOverrides, ModuleCache, SandboxSettings, WarmPool};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingEngine {
    inner: BuiltinEngine,
    calls: AtomicUsize,
}

impl CountingEngine {
    fn new() -> Self {
        Self {
            inner: BuiltinEngine::with_wasm(WasmRunner::new().unwrap()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait(?Send)]
impl Engine for CountingEngine {
    fn compile(&self, source: &str) -> agentbox_sandbox::Result<CompiledModule> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(source)
    }

    async fn execute(&self, module: &CompiledModule, request: &EngineRequest) -> EngineOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(module, request).await
    }
}

struct CountingCompletion {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionService for CountingCompletion {
    async fn complete(&self, _system: &str, user: &str) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: format!("echo: {}", user),
            tokens_used: 5,
        })
    }
}

fn runner() -> SandboxRunner {
    SandboxRunner::new(SandboxSettings::default(), None).unwrap()
}

const NESTED_LOOPS: &str = r#"
    let count = 0;
    for (let i = 0; i < 100; i++) {
        for (let j = 0; j < 100; j++) {
            if (i % 2 === 0) { count++; }
        }
    }
    return count;
"#;

#[test]
fn test_tiers_strictly_increase() {
    let ordered: Vec<_> = ["basic", "standard", "premium", "enterprise"]
        .iter()
        .map(|name| tiers::resolve_tier(name))
        .collect();
    for pair in ordered.windows(2) {
        assert!(pair[0].memory_limit_mb() < pair[1].memory_limit_mb());
        assert!(pair[0].cpu_time_limit_secs() < pair[1].cpu_time_limit_secs());
        assert!(pair[0].fuel_limit < pair[1].fuel_limit);
    }
    assert_eq!(tiers::resolve_tier("platinum").name, "standard");
}

#[test]
fn test_cache_identity_and_eviction() {
    let cache = ModuleCache::new(2, 1 << 20);
    let first = Arc::new(CompiledModule::compile("1;", None).unwrap());
    cache.set("1;", first.clone());
    assert!(Arc::ptr_eq(&first, &cache.get("1;").unwrap()));

    assert!(cache.get("never seen").is_none());
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().hit_rate, 0.5);

    cache.set("2;", Arc::new(CompiledModule::compile("2;", None).unwrap()));
    cache.get("1;");
    cache.set("3;", Arc::new(CompiledModule::compile("3;", None).unwrap()));
    assert_eq!(cache.stats().entries, 2);
    assert!(!cache.has("2;"));
}

#[tokio::test]
async fn test_pool_capacity_two() {
    let pool = WarmPool::new(|| ());
    pool.start(2, 60_000);
    let a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();
    assert!(pool.acquire().is_none());
    drop(a);
    assert!(pool.acquire().is_some());
    pool.stop();
}

#[test]
fn test_control_flow_costs_more_per_instruction() {
    let meter = FuelMeter::new();
    let arithmetic = meter.estimate("let x = 1 + 2 * 3 - 4 / 5;", 1_000_000, true);
    let control = meter.estimate("if (a) { } else { } while (b) { break; }", 1_000_000, true);
    let per = |r: &agentbox_sandbox::FuelMeteringResult| r.fuel_consumed as f64 / r.instructions_executed as f64;
    assert!(per(&arithmetic) < per(&control));
}

#[tokio::test]
async fn test_oversized_code_is_rejected_on_both_backends() {
    let engine = Arc::new(CountingEngine::new());
    let runner = SandboxRunner::with_engine(SandboxSettings::default(), None, engine.clone()).unwrap();
    let code = "a".repeat(512 * 1024 + 1);

    for backend in [BackendKind::Interpreted, BackendKind::Metered] {
        let options = ExecutionOptions::default().with_backend(backend);
        let result = runner.execute_code(&code, None, &options).await;
        assert!(!result.success);
        assert!(result.errors[0].contains("Code size"));
        assert!(result.errors[0].contains("exceeds maximum"));
    }
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_low_code_transform_then_output() {
    let config = json!({
        "steps": [
            {"type": "transform", "action": "map", "params": {"field": "result", "value": "done"}},
            {"type": "output", "action": "emit", "params": {}}
        ],
        "variables": {}
    });
    let result = runner()
        .execute(&AgentDefinition::low_code(config), None, &ExecutionOptions::default())
        .await;

    assert!(result.success);
    assert_eq!(result.output["result"], "done");
    let executing: Vec<_> = result.logs.iter().filter(|l| l.contains("Executing step")).collect();
    assert_eq!(executing.len(), 2);
    assert!(executing[0].contains("transform"));
    assert!(executing[1].contains("output"));
}

#[tokio::test]
async fn test_basic_tier_fuel_override() {
    let options = ExecutionOptions::default()
        .with_backend(BackendKind::Metered)
        .with_tier("basic")
        .with_overrides(ConfigOverrides::default().with_fuel_limit(10));
    let result = runner().execute_code(NESTED_LOOPS, None, &options).await;

    assert!(!result.success);
    assert!(result.errors[0].contains("Fuel limit exceeded"));
}

#[tokio::test]
async fn test_self_test_on_both_backends() {
    let runner = runner();
    runner.start();
    for backend in [BackendKind::Interpreted, BackendKind::Metered] {
        let result = runner.test_sandbox(Some(backend)).await;
        assert!(result.success, "{:?}: {:?}", backend, result.errors);
        assert_eq!(result.output["result"], 4);
        assert_eq!(result.output["test"], "passed");
        assert!(result.execution_time_ms < 60_000);
    }
    runner.shutdown();
}

#[tokio::test]
async fn test_metered_run_uses_pool_and_cache() {
    let runner = runner();
    runner.start();
    let options = ExecutionOptions::default().with_backend(BackendKind::Metered);

    let first = runner.execute_code("return input.a + input.b;", Some(&json!({"a": 2, "b": 3})), &options).await;
    let second = runner.execute_code("return input.a + input.b;", Some(&json!({"a": 4, "b": 5})), &options).await;

    assert_eq!(first.output, json!(5));
    assert_eq!(second.output, json!(9));
    assert!(second.logs.iter().any(|l| l.starts_with("Using pooled execution context")));
    let stats = runner.stats();
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.pool.in_use, 0);
    runner.shutdown();
}

#[tokio::test]
async fn test_ai_step_uses_completion_but_no_code_does_not() {
    let completion = Arc::new(CountingCompletion {
        calls: AtomicUsize::new(0),
    });
    let service: Arc<dyn CompletionService> = completion.clone();
    let runner = SandboxRunner::new(SandboxSettings::default(), Some(service)).unwrap();

    let no_code = runner
        .execute(&AgentDefinition::no_code("Write a haiku"), Some(&json!({"topic": "rust"})), &ExecutionOptions::default())
        .await;
    assert!(no_code.success);
    assert_eq!(no_code.output["prompt"], "Write a haiku");
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);

    let config = json!({
        "variables": {"topic": "ownership"},
        "steps": [{"type": "ai", "action": "explain", "params": {"prompt": "Explain {{topic}}"}}]
    });
    let low_code = runner.execute_low_code(&config, None).await;
    assert_eq!(low_code.output["aiResponse"], "echo: Explain ownership");
    assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oversized_input_is_rejected_for_low_and_no_code() {
    let completion = Arc::new(CountingCompletion {
        calls: AtomicUsize::new(0),
    });
    let service: Arc<dyn CompletionService> = completion.clone();
    let runner = SandboxRunner::new(SandboxSettings::default(), Some(service)).unwrap();
    let input = json!({"document": "x".repeat(2 * 1024 * 1024)});

    let config = json!({"steps": [{"type": "ai", "action": "summarize", "params": {"prompt": "Summarize"}}]});
    let low_code = runner.execute_low_code(&config, Some(&input)).await;
    assert!(!low_code.success);
    assert!(low_code.errors[0].contains("Input size"));
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);

    let no_code = runner
        .execute(&AgentDefinition::no_code("Summarize"), Some(&input), &ExecutionOptions::default())
        .await;
    assert!(!no_code.success);
    assert!(no_code.errors[0].contains("Input size"));
}

#[tokio::test]
async fn test_malformed_low_code_config_fails() {
    let result = runner().execute_low_code(&serde_json::Value::Null, None).await;
    assert!(!result.success);
    assert!(!result.errors.is_empty());
}

#[tokio::test]
async fn test_script_errors_become_failed_results() {
    let runner = runner();
    for backend in [BackendKind::Interpreted, BackendKind::Metered] {
        let options = ExecutionOptions::default().with_backend(backend);
        let result = runner
            .execute_code("console.warn('careful'); null.field;", None, &options)
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("TypeError"));
        assert!(result.logs.iter().any(|l| l == "[warn] careful"));
    }
}
