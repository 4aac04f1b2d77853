//! WebAssembly sandbox runtime
//!
//! Modules are written as WAT text and compiled by wasmtime. Stores get a
//! fuel budget and a memory ceiling; the linker provides no imports at all,
//! so a module cannot reach the filesystem, the network or the clock.

use crate::fuel::FuelMeteringResult;
use crate::{Result, SandboxError};
use serde_json::Value as Json;
use tracing::debug;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap, Val, ValType};

/// Exports tried, in order, as the entry point
pub const ENTRY_POINTS: [&str; 2] = ["run", "main"];

/// Fuel granted per millisecond of CPU budget when metering is disabled
const FUEL_PER_MS_UNMETERED: u64 = 1_000_000;

/// True when the source is WAT text rather than script
pub fn is_wat(source: &str) -> bool {
    source.trim_start().starts_with("(module")
}

/// Per-store state
pub struct StoreState {
    limits: StoreLimits,
}

/// Limits applied to one wasm call
#[derive(Debug, Clone, Copy)]
pub struct WasmLimits {
    pub fuel_limit: u64,
    pub enable_fuel_metering: bool,
    pub memory_limit_bytes: u64,
    pub cpu_time_limit_ms: u64,
}

/// Result of one wasm call
#[derive(Debug)]
pub struct WasmOutcome {
    pub output: Result<Json>,
    pub fuel: FuelMeteringResult,
    pub memory_used_bytes: u64,
}

/// A sandboxed wasm runtime with fuel metering
#[derive(Clone)]
pub struct WasmRunner {
    engine: Engine,
}

impl WasmRunner {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config)
            .map_err(|e| SandboxError::Internal(format!("failed to create wasm engine: {}", e)))?;
        Ok(Self { engine })
    }

    /// A linker with no host imports
    pub fn linker(&self) -> Linker<StoreState> {
        Linker::new(&self.engine)
    }

    pub fn compile(&self, wat: &str) -> Result<Module> {
        debug!(size = wat.len(), "Compiling wasm module");
        Module::new(&self.engine, wat).map_err(|e| SandboxError::EngineFault(format!("Failed to compile wasm module: {}", e)))
    }

    /// Instantiate and call the module's entry point.
    ///
    /// The entry point takes no arguments or numeric ones: a number input
    /// feeds a single parameter, an array input feeds several.
    pub fn execute(
        &self,
        module: &Module,
        input: &Json,
        limits: WasmLimits,
    ) -> WasmOutcome {
        let fuel_budget = if limits.enable_fuel_metering {
            limits.fuel_limit
        } else {
            limits.cpu_time_limit_ms.saturating_mul(FUEL_PER_MS_UNMETERED)
        };
        let memory_limit = usize::try_from(limits.memory_limit_bytes).unwrap_or(usize::MAX);
        let state = StoreState {
            limits: StoreLimitsBuilder::new().memory_size(memory_limit).instances(1).build(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        let report = |store: &Store<StoreState>| {
            let remaining = store.get_fuel().unwrap_or(0);
            let consumed = fuel_budget.saturating_sub(remaining);
            FuelMeteringResult::from_consumed(consumed, limits.fuel_limit, limits.enable_fuel_metering)
        };

        if let Err(e) = store.set_fuel(fuel_budget) {
            return WasmOutcome {
                output: Err(SandboxError::Internal(format!("failed to set fuel: {}", e))),
                fuel: FuelMeteringResult::from_consumed(0, limits.fuel_limit, limits.enable_fuel_metering),
                memory_used_bytes: 0,
            };
        }

        let linker = self.linker();
        let mut memory_used_bytes = 0;
        let output = Self::call_entry(&linker, &mut store, module, input, &mut memory_used_bytes);
        let fuel = report(&store);
        let output = output.map_err(|e| match e.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) if limits.enable_fuel_metering => SandboxError::FuelLimitExceeded {
                consumed: fuel.fuel_consumed,
                limit: limits.fuel_limit,
            },
            Some(Trap::OutOfFuel) => SandboxError::TimeLimitExceeded {
                limit_ms: limits.cpu_time_limit_ms,
            },
            _ => SandboxError::EngineFault(format!("{:#}", e)),
        });

        WasmOutcome {
            output,
            fuel,
            memory_used_bytes,
        }
    }

    fn call_entry(
        linker: &Linker<StoreState>,
        store: &mut Store<StoreState>,
        module: &Module,
        input: &Json,
        memory_used_bytes: &mut u64,
    ) -> anyhow::Result<Json> {
        let instance = linker.instantiate(&mut *store, module)?;
        let func = ENTRY_POINTS
            .iter()
            .find_map(|name| instance.get_func(&mut *store, name))
            .ok_or_else(|| anyhow::anyhow!("module must export a `run` or `main` function"))?;

        let ty = func.ty(&*store);
        let numbers: Vec<f64> = match input {
            Json::Number(n) => vec![n.as_f64().unwrap_or(0.0)],
            Json::Array(items) => items.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect(),
            _ => Vec::new(),
        };
        let mut params = Vec::new();
        for (i, param) in ty.params().enumerate() {
            let n = numbers.get(i).copied().unwrap_or(0.0);
            params.push(match param {
                ValType::I32 => Val::I32(n as i32),
                ValType::I64 => Val::I64(n as i64),
                ValType::F32 => Val::F32((n as f32).to_bits()),
                ValType::F64 => Val::F64(n.to_bits()),
                other => anyhow::bail!("unsupported parameter type {:?}", other),
            });
        }
        let mut results: Vec<Val> = ty.results().map(|_| Val::I32(0)).collect();
        let called = func.call(&mut *store, &params, &mut results);
        for export in module.exports().filter(|export| export.ty().memory().is_some()) {
            if let Some(memory) = instance.get_memory(&mut *store, export.name()) {
                *memory_used_bytes += memory.data_size(&*store) as u64;
            }
        }
        called?;

        let values: Vec<Json> = results.iter().map(val_to_json).collect();
        Ok(match values.len() {
            0 => Json::Null,
            1 => values.into_iter().next().unwrap_or(Json::Null),
            _ => Json::Array(values),
        })
    }
}

fn val_to_json(val: &Val) -> Json {
    match val {
        Val::I32(n) => Json::from(*n),
        Val::I64(n) => Json::from(*n),
        Val::F32(bits) => float_to_json(f64::from(f32::from_bits(*bits))),
        Val::F64(bits) => float_to_json(f64::from_bits(*bits)),
        _ => Json::Null,
    }
}

/// Integral floats become JSON integers; NaN and infinities become null
fn float_to_json(n: f64) -> Json {
    if n.is_finite() && n == n.trunc() && n.abs() < 9_007_199_254_740_992.0 {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
    }
}
