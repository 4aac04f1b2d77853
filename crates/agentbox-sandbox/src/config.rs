//! Sandbox configuration
//!
//! Two layers live here:
//! - [`SandboxConfig`]: the per-call limits, built from a tier plus overrides
//! - [`SandboxSettings`]: process-wide knobs read once at startup

use crate::tiers::{self, DEFAULT_TIER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Default maximum source size (512 KiB)
pub const MAX_CODE_SIZE_DEFAULT: usize = 512 * 1024;

/// Default maximum serialized input size (1 MiB)
pub const MAX_INPUT_SIZE_DEFAULT: usize = 1024 * 1024;

/// Default warm pool capacity
pub const POOL_SIZE_DEFAULT: usize = 10;

/// Default idle TTL for pooled contexts (5 minutes)
pub const POOL_TTL_MS_DEFAULT: u64 = 300_000;

/// Default module cache entry budget
pub const CACHE_MAX_ENTRIES_DEFAULT: usize = 100;

/// Default module cache byte budget (64 MiB)
pub const CACHE_MAX_BYTES_DEFAULT: u64 = 64 * 1024 * 1024;

/// Default wall-clock timeout of the interpreted backend
pub const INTERPRETER_TIMEOUT_MS_DEFAULT: u64 = 30_000;

/// Default heap ceiling of the interpreted backend (128 MiB)
pub const INTERPRETER_MEMORY_BYTES_DEFAULT: u64 = 128 * 1024 * 1024;

/// Default cap on engine threads running at once
pub const MAX_CONCURRENT_DEFAULT: usize = 8;

/// Resolved limits and permissions for one execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub memory_limit_bytes: u64,
    pub cpu_time_limit_ms: u64,
    pub fuel_limit: u64,
    pub enable_fuel_metering: bool,
    pub allow_network_access: bool,
    pub allow_filesystem_access: bool,
    pub environment_vars: BTreeMap<String, String>,
    pub tier_name: String,
}

impl SandboxConfig {
    /// Merge a tier's defaults with explicit overrides. Overrides always win.
    pub fn resolve(tier_name: &str, overrides: &ConfigOverrides) -> Self {
        let tier = tiers::resolve_tier(tier_name);
        Self {
            memory_limit_bytes: overrides.memory_limit_bytes.unwrap_or(tier.memory_limit_bytes),
            cpu_time_limit_ms: overrides.cpu_time_limit_ms.unwrap_or(tier.cpu_time_limit_ms),
            fuel_limit: overrides.fuel_limit.unwrap_or(tier.fuel_limit),
            enable_fuel_metering: overrides.enable_fuel_metering.unwrap_or(true),
            allow_network_access: overrides.allow_network_access.unwrap_or(false),
            allow_filesystem_access: overrides.allow_filesystem_access.unwrap_or(false),
            environment_vars: overrides.environment_vars.clone().unwrap_or_default(),
            tier_name: tier.name.to_string(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::resolve(DEFAULT_TIER, &ConfigOverrides::default())
    }
}

/// Per-call overrides on top of a tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverrides {
    pub memory_limit_bytes: Option<u64>,
    pub cpu_time_limit_ms: Option<u64>,
    pub fuel_limit: Option<u64>,
    pub enable_fuel_metering: Option<bool>,
    pub allow_network_access: Option<bool>,
    pub allow_filesystem_access: Option<bool>,
    pub environment_vars: Option<BTreeMap<String, String>>,
}

impl ConfigOverrides {
    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_cpu_time_limit(mut self, ms: u64) -> Self {
        self.cpu_time_limit_ms = Some(ms);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_vars
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Process-wide static configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    /// Route full-code executions to the metered backend by default
    pub use_metered_backend: bool,
    pub default_tier: String,
    pub max_code_size_bytes: usize,
    pub max_input_size_bytes: usize,
    pub pool_max_size: usize,
    pub pool_instance_ttl_ms: u64,
    pub cache_max_entries: usize,
    pub cache_max_size_bytes: u64,
    pub interpreter_timeout_ms: u64,
    pub interpreter_memory_limit_bytes: u64,
    pub max_concurrent_executions: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            use_metered_backend: false,
            default_tier: DEFAULT_TIER.to_string(),
            max_code_size_bytes: MAX_CODE_SIZE_DEFAULT,
            max_input_size_bytes: MAX_INPUT_SIZE_DEFAULT,
            pool_max_size: POOL_SIZE_DEFAULT,
            pool_instance_ttl_ms: POOL_TTL_MS_DEFAULT,
            cache_max_entries: CACHE_MAX_ENTRIES_DEFAULT,
            cache_max_size_bytes: CACHE_MAX_BYTES_DEFAULT,
            interpreter_timeout_ms: INTERPRETER_TIMEOUT_MS_DEFAULT,
            interpreter_memory_limit_bytes: INTERPRETER_MEMORY_BYTES_DEFAULT,
            max_concurrent_executions: MAX_CONCURRENT_DEFAULT,
        }
    }
}

impl SandboxSettings {
    /// Read settings from `AGENTBOX_*` environment variables.
    ///
    /// Missing variables keep their defaults; malformed ones are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Self::default();

        if let Some(raw) = lookup("AGENTBOX_METERED_BACKEND") {
            match parse_flag(&raw) {
                Some(flag) => s.use_metered_backend = flag,
                None => tracing::warn!(key = "AGENTBOX_METERED_BACKEND", value = %raw, "Ignoring malformed flag"),
            }
        }
        if let Some(tier) = lookup("AGENTBOX_DEFAULT_TIER") {
            if tiers::tier(&tier).is_none() {
                tracing::warn!(tier = %tier, "Unknown default tier, requests will fall back to standard");
            }
            s.default_tier = tier;
        }

        read_number(&lookup, "AGENTBOX_MAX_CODE_SIZE", &mut s.max_code_size_bytes);
        read_number(&lookup, "AGENTBOX_MAX_INPUT_SIZE", &mut s.max_input_size_bytes);
        read_number(&lookup, "AGENTBOX_POOL_SIZE", &mut s.pool_max_size);
        read_number(&lookup, "AGENTBOX_POOL_TTL_MS", &mut s.pool_instance_ttl_ms);
        read_number(&lookup, "AGENTBOX_CACHE_MAX_ENTRIES", &mut s.cache_max_entries);
        read_number(&lookup, "AGENTBOX_CACHE_MAX_BYTES", &mut s.cache_max_size_bytes);
        read_number(&lookup, "AGENTBOX_INTERPRETER_TIMEOUT_MS", &mut s.interpreter_timeout_ms);
        read_number(&lookup, "AGENTBOX_INTERPRETER_MEMORY_BYTES", &mut s.interpreter_memory_limit_bytes);
        read_number(&lookup, "AGENTBOX_MAX_CONCURRENT", &mut s.max_concurrent_executions);

        s
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn read_number<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring malformed setting"),
        }
    }
}
