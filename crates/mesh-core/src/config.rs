//! Configuration: typed tunables for engine init, populated from explicit
//! constructor args with environment-variable fallback (CLI/constructor
//! arg, then env var, then default). No config crate beyond `std::env` —
//! the handful of tunables here doesn't warrant one.

use std::time::Duration;

/// Engine init config: `(namespace, appId, guid, config, logger)`.
/// `logger` has no Rust analog — `tracing` spans are emitted directly by
/// every component against ambient subscriber state set up once at
/// process start.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub namespace: String,
    pub app_id: String,
    pub guid: String,
    /// Disables consumption but retains publishing.
    pub readonly: bool,
    pub reclaim: ReclaimConfig,
    pub tunables: Tunables,
}

impl EngineConfig {
    pub fn new(namespace: impl Into<String>, app_id: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            app_id: app_id.into(),
            guid: guid.into(),
            readonly: false,
            reclaim: ReclaimConfig::default(),
            tunables: Tunables::default(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReclaimConfig {
    pub delay: Duration,
    pub count: u32,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            count: 3,
        }
    }
}

/// Recognized tunables, each with a documented default.
#[derive(Clone, Copy, Debug)]
pub struct Tunables {
    /// `HMSH_ACTIVATION_MAX_RETRY`.
    pub activation_max_retry: u32,
    pub quorum_delay: Duration,
    pub rollcall_cycles: u32,
    /// Time-hook scout tick interval.
    pub fidelity: Duration,
    pub signal_ttl: Duration,
    pub expire_default: Duration,
    pub max_symbol_range_slots: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            activation_max_retry: 5,
            quorum_delay: Duration::from_millis(500),
            rollcall_cycles: 3,
            fidelity: Duration::from_secs(1),
            signal_ttl: Duration::from_secs(60 * 60 * 24),
            expire_default: Duration::from_secs(60 * 60),
            max_symbol_range_slots: crate::symbols::ACTIVITY_SCOPE_SLOTS,
        }
    }
}

/// Backend connection config, populated with env-var fallback the way
/// `parse_database_url` reads `DATABASE_URL` (CLI arg first, then env, then
/// `None`). Held by the binary that wires up a concrete `Store`/`Stream`/
/// `Sub`, not by `mesh-core` itself.
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL").ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tunables_match_spec_defaults() {
        let t = Tunables::default();
        assert_eq!(t.activation_max_retry, 5);
        assert!(t.quorum_delay.as_millis() > 0);
    }
}
