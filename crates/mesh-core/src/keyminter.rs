//! KeyMinter: pure construction of canonical backend keys from
//! `(namespace, appId, type, params)`. No I/O, no locking — callers own
//! concurrency.

use std::fmt;

/// Byte that separates the fixed key segments (`hmsh:<ns>:<type>:<params>`).
pub const TYPSEP: char = ':';
/// Byte that separates individual parameter values within the params segment.
pub const VALSEP: char = '-';

/// All canonical key families the backend must address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
    App,
    JobState,
    Streams,
    Quorum,
    Signals,
    Schemas,
    Subscriptions,
    SubscriptionPatterns,
    Hooks,
    /// Root namespace settings record.
    Settings,
    SymKeys,
    SymVals,
    WorkItems,
    TimeRange,
    ThrottleRate,
    JobStatsGeneral,
    JobStatsIndex,
    JobStatsMedian,
    JobDependents,
}

impl KeyType {
    fn short_code(self) -> &'static str {
        match self {
            KeyType::App => "app",
            KeyType::JobState => "state",
            KeyType::Streams => "streams",
            KeyType::Quorum => "quorum",
            KeyType::Signals => "sig",
            KeyType::Schemas => "schema",
            KeyType::Subscriptions => "sub",
            KeyType::SubscriptionPatterns => "psub",
            KeyType::Hooks => "hook",
            KeyType::Settings => "hotmesh",
            KeyType::SymKeys => "symkeys",
            KeyType::SymVals => "symvals",
            KeyType::WorkItems => "work",
            KeyType::TimeRange => "trange",
            KeyType::ThrottleRate => "throttle",
            KeyType::JobStatsGeneral => "stats-g",
            KeyType::JobStatsIndex => "stats-i",
            KeyType::JobStatsMedian => "stats-m",
            KeyType::JobDependents => "deps",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyMintError {
    #[error("key parameter {0:?} contains a reserved separator byte")]
    ReservedByte(String),
}

/// Constructs canonical keys. Holds only the namespace, so it's `Clone`+`Copy`-cheap
/// and safe to stash on every component that needs to address the backend.
#[derive(Clone, Debug)]
pub struct KeyMinter {
    namespace: String,
}

impl KeyMinter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `mint(type, params) -> string`. Deterministic: the same `(type, params)`
    /// always yields the same key; distinct `(type, params)` never collide
    /// because params never contain `TYPSEP`/`VALSEP` (checked here).
    pub fn mint(&self, kind: KeyType, params: &[&str]) -> Result<String, KeyMintError> {
        for p in params {
            if p.contains(TYPSEP) || p.contains(VALSEP) {
                return Err(KeyMintError::ReservedByte((*p).to_string()));
            }
        }
        let joined = params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(&VALSEP.to_string());
        Ok(if joined.is_empty() {
            format!("hmsh{TYPSEP}{}{TYPSEP}{}", self.namespace, kind.short_code())
        } else {
            format!(
                "hmsh{TYPSEP}{}{TYPSEP}{}{TYPSEP}{}",
                self.namespace,
                kind.short_code(),
                joined
            )
        })
    }
}

impl fmt::Display for KeyMinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMinter(ns={})", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_is_deterministic() {
        let km = KeyMinter::new("prod");
        let a = km.mint(KeyType::JobState, &["app1", "job42"]).unwrap();
        let b = km.mint(KeyType::JobState, &["app1", "job42"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "hmsh:prod:state:app1-job42");
    }

    #[test]
    fn distinct_params_never_collide() {
        let km = KeyMinter::new("prod");
        let a = km.mint(KeyType::JobState, &["app1", "job42"]).unwrap();
        let b = km.mint(KeyType::JobState, &["app1", "job43"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn distinct_types_never_collide_on_same_params() {
        let km = KeyMinter::new("prod");
        let a = km.mint(KeyType::JobState, &["app1"]).unwrap();
        let b = km.mint(KeyType::Schemas, &["app1"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn reserved_bytes_in_params_are_rejected() {
        let km = KeyMinter::new("prod");
        assert!(km.mint(KeyType::JobState, &["app:1"]).is_err());
        assert!(km.mint(KeyType::JobState, &["app-1"]).is_err());
    }
}
