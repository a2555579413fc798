//! Cache configuration.
//!
//! Lets deployments retune the policy presets via `icebreak.toml`:
//!
//! ```toml
//! [cache.policies.personal]
//! ttl_ms = 600000
//! stale_while_revalidate = true
//!
//! [cache.policies.static]
//! expires = false
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::policy::{CachePolicy, PolicyPreset};

/// Partial override of one preset. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    /// TTL in milliseconds.
    pub ttl_ms: Option<u64>,
    /// `false` makes the preset never expire (ignores `ttl_ms`).
    pub expires: Option<bool>,
    pub stale_while_revalidate: Option<bool>,
    pub on_demand_only: Option<bool>,
}

impl PolicyOverride {
    fn apply(&self, mut policy: CachePolicy) -> CachePolicy {
        if let Some(ttl_ms) = self.ttl_ms {
            policy.ttl = Some(Duration::from_millis(ttl_ms));
        }
        if self.expires == Some(false) {
            policy.ttl = None;
        }
        if let Some(enabled) = self.stale_while_revalidate {
            policy.stale_while_revalidate = enabled;
        }
        if let Some(enabled) = self.on_demand_only {
            policy.on_demand_only = enabled;
        }
        policy
    }
}

/// Cache configuration from `icebreak.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-preset overrides.
    pub policies: HashMap<PolicyPreset, PolicyOverride>,
}

impl CacheConfig {
    /// Effective policy for a preset after applying overrides.
    pub fn policy(&self, preset: PolicyPreset) -> CachePolicy {
        let builtin = preset.policy();
        match self.policies.get(&preset) {
            Some(overrides) => overrides.apply(builtin),
            None => builtin,
        }
    }

    /// Effective policies for every preset, in table order.
    pub fn policy_table(&self) -> Vec<(PolicyPreset, CachePolicy)> {
        PolicyPreset::ALL
            .into_iter()
            .map(|preset| (preset, self.policy(preset)))
            .collect()
    }
}
