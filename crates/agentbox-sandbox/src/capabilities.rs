//! Capability-based permissions for sandboxed code

use crate::config::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A specific permission that can be granted to a sandboxed execution
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Outbound network access
    Network,
    /// Host filesystem access
    Filesystem,
    /// Read one environment variable (by name)
    EnvVar(String),
}

/// The capabilities granted to one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
    env: BTreeMap<String, String>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the grants from a resolved config. Every configured
    /// environment variable becomes an `EnvVar` grant.
    pub fn from_config(config: &SandboxConfig) -> Self {
        let mut set = Self::new();
        if config.allow_network_access {
            set.grant(Capability::Network);
        }
        if config.allow_filesystem_access {
            set.grant(Capability::Filesystem);
        }
        for (name, value) in &config.environment_vars {
            set.env.insert(name.clone(), value.clone());
            set.grant(Capability::EnvVar(name.clone()));
        }
        set
    }

    /// Grant a capability
    pub fn grant(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.insert(cap);
        self
    }

    /// Check if a capability is granted
    pub fn has(&self, cap: &Capability) -> bool {
        self.capabilities.contains(cap)
    }

    /// Environment variables visible to the code: granted names with a known value
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter(|(name, _)| self.has(&Capability::EnvVar((*name).clone())))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// One log line per host-facing grant. No host I/O is exposed either way.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.has(&Capability::Network) {
            lines.push("Network access granted (no network builtins are exposed)".to_string());
        }
        if self.has(&Capability::Filesystem) {
            lines.push("Filesystem access granted (no filesystem builtins are exposed)".to_string());
        }
        lines
    }
}
