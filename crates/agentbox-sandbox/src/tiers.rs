//! Resource tiers
//!
//! A tier is a named bundle of limits selected per execution request.
//! The catalog is static and strictly ordered: every tier grants more
//! memory, more CPU time and more fuel than the one before it.

use serde::Serialize;

/// Tier used when a request names no tier, or names one we don't know
pub const DEFAULT_TIER: &str = "standard";

const MIB: u64 = 1024 * 1024;

/// A named bundle of resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceTier {
    pub name: &'static str,
    pub memory_limit_bytes: u64,
    pub cpu_time_limit_ms: u64,
    pub fuel_limit: u64,
}

impl ResourceTier {
    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_bytes / MIB
    }

    pub fn cpu_time_limit_secs(&self) -> u64 {
        self.cpu_time_limit_ms / 1000
    }
}

/// The canonical tiers, lowest first
pub const TIERS: [ResourceTier; 4] = [
    ResourceTier {
        name: "basic",
        memory_limit_bytes: 64 * MIB,
        cpu_time_limit_ms: 5_000,
        fuel_limit: 10_000_000,
    },
    ResourceTier {
        name: "standard",
        memory_limit_bytes: 128 * MIB,
        cpu_time_limit_ms: 30_000,
        fuel_limit: 100_000_000,
    },
    ResourceTier {
        name: "premium",
        memory_limit_bytes: 256 * MIB,
        cpu_time_limit_ms: 60_000,
        fuel_limit: 500_000_000,
    },
    ResourceTier {
        name: "enterprise",
        memory_limit_bytes: 512 * MIB,
        cpu_time_limit_ms: 120_000,
        fuel_limit: 1_000_000_000,
    },
];

/// Strict lookup. Names are matched case-insensitively.
pub fn tier(name: &str) -> Option<&'static ResourceTier> {
    let wanted = name.trim();
    TIERS.iter().find(|t| t.name.eq_ignore_ascii_case(wanted))
}

/// Lenient lookup: unknown names resolve to the `standard` tier.
pub fn resolve_tier(name: &str) -> &'static ResourceTier {
    match tier(name) {
        Some(t) => t,
        None => {
            tracing::debug!(requested = name, fallback = DEFAULT_TIER, "Unknown tier, falling back");
            &TIERS[1]
        }
    }
}

/// Tier names in ascending order
pub fn names() -> impl Iterator<Item = &'static str> {
    TIERS.iter().map(|t| t.name)
}
