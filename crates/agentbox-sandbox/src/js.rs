//! JavaScript execution on V8
//!
//! Every call gets a brand new isolate, so no state survives between agents.
//! The isolate has a heap ceiling guarded by a near-heap-limit callback and
//! a watchdog thread that terminates execution once the deadline passes.
//! `Deno`, `eval` and the function constructors are removed before agent
//! code runs; the only host surface is `console`, `input` and `env`.
//!
//! Isolates are `!Send`: [`run`] must be driven on the thread that calls it,
//! inside a single-threaded tokio runtime.

use crate::{Result, SandboxError};
use deno_core::{op2, v8, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Smallest heap an isolate is created with. V8 cannot boot below this.
pub const MIN_HEAP_BYTES: usize = 8 * 1024 * 1024;

/// Console lines kept per execution
pub const MAX_LOG_LINES: usize = 1_000;

/// Grace granted past the heap limit so termination can unwind
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

/// Limits applied to one script run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsLimits {
    pub timeout_ms: u64,
    pub heap_limit_bytes: u64,
}

/// What one script run produced
#[derive(Debug)]
pub struct JsOutcome {
    pub output: Result<Json>,
    pub logs: Vec<String>,
    pub heap_used_bytes: u64,
}

#[derive(Default)]
struct ConsoleOutput {
    lines: Vec<String>,
    dropped: usize,
}

struct ScriptResult(String);

#[op2(fast)]
fn op_agentbox_log(state: &mut OpState, #[string] level: String, #[string] message: String) {
    let console = state.borrow_mut::<ConsoleOutput>();
    if console.lines.len() >= MAX_LOG_LINES {
        console.dropped += 1;
        return;
    }
    let line = match level.as_str() {
        "warn" | "error" => format!("[{}] {}", level, message),
        _ => message,
    };
    console.lines.push(line);
}

#[op2(fast)]
fn op_agentbox_set_result(state: &mut OpState, #[string] json: String) {
    state.put(ScriptResult(json));
}

deno_core::extension!(agentbox_js, ops = [op_agentbox_log, op_agentbox_set_result]);

const BOOTSTRAP: &str = r#"
((ops) => {
    const show = (value) => {
        if (typeof value === "string") return value;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            return String(value);
        }
    };
    const writer = (level) => (...args) => ops.op_agentbox_log(level, args.map(show).join(" "));
    globalThis.console = Object.freeze({
        log: writer("log"),
        info: writer("info"),
        debug: writer("log"),
        warn: writer("warn"),
        error: writer("error"),
    });
    Object.defineProperty(globalThis, "__agentbox", {
        value: Object.freeze({ settle: (json) => ops.op_agentbox_set_result(json) }),
        enumerable: false,
        writable: false,
        configurable: false,
    });
    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction]) {
        Object.defineProperty(ctor.prototype, "constructor", {
            value: undefined,
            configurable: false,
            writable: false,
        });
    }
})(Deno.core.ops);
"#;

/// Wrap agent source so a top-level `return` becomes the output and any
/// throw becomes a settled error instead of an unhandled rejection
pub fn prepare(source: &str) -> String {
    format!(
        r#"(async () => {{
    let settled;
    try {{
        const value = await (async () => {{
{source}
        }})();
        settled = {{ ok: value === undefined ? null : value }};
    }} catch (e) {{
        settled = {{ error: e instanceof Error ? `${{e.name}}: ${{e.message}}` : String(e) }};
    }}
    let json;
    try {{
        json = JSON.stringify(settled);
    }} catch (e) {{
        json = JSON.stringify({{ error: `TypeError: ${{e.message}}` }});
    }}
    __agentbox.settle(json);
}})();
"#
    )
}

/// State read by the near-heap-limit callback
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` is the boxed HeapLimitState created in `run`, which
    // outlives the isolate's event loop and unregisters this callback
    // before it is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + HEAP_GRACE_BYTES
}

fn create_runtime(heap_limit_bytes: u64) -> JsRuntime {
    let heap = usize::try_from(heap_limit_bytes).unwrap_or(usize::MAX).max(MIN_HEAP_BYTES);
    let create_params = v8::CreateParams::default().heap_limits(0, heap);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![agentbox_js::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(ConsoleOutput::default());
    runtime
}

fn globals_script(input: &Json, env: &BTreeMap<String, String>) -> Result<String> {
    let input = serde_json::to_string(input).map_err(|e| SandboxError::Internal(format!("failed to encode input: {}", e)))?;
    let env = serde_json::to_string(env).map_err(|e| SandboxError::Internal(format!("failed to encode env: {}", e)))?;
    Ok(format!(
        "globalThis.input = {};\nglobalThis.env = Object.freeze({});\n",
        input, env
    ))
}

/// Run prepared source in a fresh isolate.
///
/// Faults are folded into the outcome: the caller always gets the console
/// lines emitted before the failure.
pub async fn run(prepared: &str, input: &Json, env: &BTreeMap<String, String>, limits: JsLimits) -> JsOutcome {
    let mut runtime = create_runtime(limits.heap_limit_bytes);

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = Arc::clone(&timed_out);
    let timeout = Duration::from_millis(limits.timeout_ms);
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::Builder::new()
        .name("agentbox-watchdog".to_string())
        .spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                watchdog_timed_out.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
            }
        });
    let watchdog = match watchdog {
        Ok(handle) => handle,
        Err(e) => {
            runtime.v8_isolate().remove_near_heap_limit_callback(near_heap_limit_callback, 0);
            return JsOutcome {
                output: Err(SandboxError::Internal(format!("failed to spawn watchdog: {}", e))),
                logs: Vec::new(),
                heap_used_bytes: 0,
            };
        }
    };

    let exec_error = execute(&mut runtime, prepared, input, env, timeout).await;

    // The watchdog must be gone before the isolate handle is dropped
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    let mut stats = v8::HeapStatistics::default();
    runtime.v8_isolate().get_heap_statistics(&mut stats);
    let heap_used_bytes = stats.used_heap_size() as u64;
    runtime.v8_isolate().remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    let (logs, settled) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let console = state.try_take::<ConsoleOutput>().unwrap_or_default();
        let settled = state.try_take::<ScriptResult>().map(|r| r.0);
        let mut logs = console.lines;
        if console.dropped > 0 {
            logs.push(format!("[warn] {} console lines dropped", console.dropped));
        }
        (logs, settled)
    };

    let output = if heap_state.triggered.load(Ordering::SeqCst) {
        warn!(used = heap_used_bytes, limit = limits.heap_limit_bytes, "Script hit its heap limit");
        Err(SandboxError::MemoryLimitExceeded {
            used: heap_used_bytes,
            limit: limits.heap_limit_bytes,
        })
    } else if timed_out.load(Ordering::SeqCst) {
        Err(SandboxError::TimeLimitExceeded {
            limit_ms: limits.timeout_ms,
        })
    } else if let Some(message) = exec_error {
        Err(SandboxError::EngineFault(message))
    } else {
        settle(settled)
    };

    debug!(ok = output.is_ok(), heap_used_bytes, "Script run finished");
    JsOutcome {
        output,
        logs,
        heap_used_bytes,
    }
}

async fn execute(
    runtime: &mut JsRuntime,
    prepared: &str,
    input: &Json,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Option<String> {
    let globals = match globals_script(input, env) {
        Ok(script) => script,
        Err(e) => return Some(e.to_string()),
    };
    if let Err(e) = runtime.execute_script("[agentbox:bootstrap]", BOOTSTRAP) {
        return Some(e.to_string());
    }
    if let Err(e) = runtime.execute_script("[agentbox:globals]", globals) {
        return Some(e.to_string());
    }
    if let Err(e) = runtime.execute_script("[agentbox:agent]", prepared.to_string()) {
        return Some(e.to_string());
    }
    match tokio::time::timeout(timeout, runtime.run_event_loop(PollEventLoopOptions::default())).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("Execution timed out after {}ms", timeout.as_millis())),
    }
}

fn settle(settled: Option<String>) -> Result<Json> {
    let json = settled.ok_or_else(|| SandboxError::EngineFault("Agent code never settled a result".to_string()))?;
    let mut envelope: Json =
        serde_json::from_str(&json).map_err(|e| SandboxError::Internal(format!("malformed script result: {}", e)))?;
    if let Some(error) = envelope.get("error") {
        let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        return Err(SandboxError::EngineFault(format!("Uncaught {}", message)));
    }
    Ok(envelope.get_mut("ok").map(Json::take).unwrap_or(Json::Null))
}
