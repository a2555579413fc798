//! Cache policies and the named presets callers pick from.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Freshness rules attached to an entry when it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachePolicy {
    /// Age after which the entry is stale. `None` never expires; zero is always stale.
    pub ttl: Option<Duration>,
    /// Serve a stale entry while a background refresh runs.
    pub stale_while_revalidate: bool,
    /// Never refetch automatically; only invalidation removes the entry.
    pub on_demand_only: bool,
}

impl CachePolicy {
    pub const fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            stale_while_revalidate: false,
            on_demand_only: false,
        }
    }

    pub const fn with_ttl(ttl: Duration) -> Self {
        Self::new(Some(ttl))
    }

    pub const fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    pub const fn on_demand_only(mut self, enabled: bool) -> Self {
        self.on_demand_only = enabled;
        self
    }

    /// TTL in whole milliseconds, if any.
    pub fn ttl_ms(&self) -> Option<u64> {
        self.ttl
            .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }
}

const PERSONAL_TTL: Duration = Duration::from_secs(5 * 60);
const EXTERNAL_TTL: Duration = Duration::from_secs(30);
const VOLATILE_TTL: Duration = Duration::from_secs(5);

/// Named policy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPreset {
    /// Aggressively cached personal data (own profile, own quiz).
    Personal,
    /// Briefly cached data owned by someone else.
    External,
    /// Frequently changing data (answer tallies, lobby state).
    Volatile,
    /// Static data, refreshed only through invalidation.
    Static,
    /// Not cached between reads unless explicitly kept.
    Uncached,
}

impl PolicyPreset {
    pub const ALL: [PolicyPreset; 5] = [
        Self::Personal,
        Self::External,
        Self::Volatile,
        Self::Static,
        Self::Uncached,
    ];

    /// Built-in policy for this preset.
    pub const fn policy(self) -> CachePolicy {
        match self {
            Self::Personal => CachePolicy::with_ttl(PERSONAL_TTL).stale_while_revalidate(true),
            Self::External => CachePolicy::with_ttl(EXTERNAL_TTL),
            Self::Volatile => CachePolicy::with_ttl(VOLATILE_TTL),
            Self::Static => CachePolicy::new(None).on_demand_only(true),
            Self::Uncached => CachePolicy::with_ttl(Duration::ZERO).on_demand_only(true),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::External => "external",
            Self::Volatile => "volatile",
            Self::Static => "static",
            Self::Uncached => "uncached",
        }
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyPreset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == value)
            .ok_or_else(|| format!("unknown policy preset `{value}`"))
    }
}

impl From<PolicyPreset> for CachePolicy {
    fn from(preset: PolicyPreset) -> Self {
        preset.policy()
    }
}
