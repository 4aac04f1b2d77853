//! Compiled code units

use crate::js;
use crate::wasm::{self, WasmRunner};
use crate::{Result, SandboxError};
use std::sync::Arc;

/// A code unit ready to execute. Cheap to share behind an `Arc`.
pub enum CompiledModule {
    /// Agent source wrapped for a fresh isolate. V8 parses it per run.
    Script { prepared: Arc<str>, source_len: usize },
    Wasm { module: wasmtime::Module, source_len: usize },
}

impl CompiledModule {
    /// Compile source text. WAT needs a wasm runner; without one it is
    /// rejected rather than handed to V8.
    pub fn compile(source: &str, runner: Option<&WasmRunner>) -> Result<Self> {
        if wasm::is_wat(source) {
            let runner = runner.ok_or_else(|| {
                SandboxError::EngineFault("WebAssembly modules are not supported by this backend".to_string())
            })?;
            return Ok(Self::Wasm {
                module: runner.compile(source)?,
                source_len: source.len(),
            });
        }

        Ok(Self::Script {
            prepared: Arc::from(js::prepare(source)),
            source_len: source.len(),
        })
    }

    /// Bytes charged against the cache budget
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Script { source_len, .. } | Self::Wasm { source_len, .. } => *source_len as u64,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Script { .. } => "script",
            Self::Wasm { .. } => "wasm",
        }
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("kind", &self.kind())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}
