//! Symbol tables backing `reserveSymbolRange`/`getSymbols`/`addSymbols`/
//! `getSymbolValues`/`addSymbolValues`.
//!
//! Two flavors:
//! - **Key-symbols**: one table per scope (`$<topic>` for the job root, or an
//!   activity id), mapping a full field path to a short token drawn from a
//!   reserved numeric range. 286 slots per activity scope (26 metadata + 260
//!   data).
//! - **Value-symbols**: one table per app, mapping frequent string literals
//!   (>=6 chars) to a 2-char token. Capacity 52² = 2704, append-only.
//!
//! Both tables are append-only: a path/literal once bound keeps its token
//! across redeploys.

use crate::error::{MeshError, MeshResult};
use std::collections::HashMap;

const KEY_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const VALUE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Per-activity-scope slot budget: 26 metadata fields + 260 data fields.
pub const METADATA_SLOTS: u32 = 26;
pub const DATA_SLOTS: u32 = 260;
pub const ACTIVITY_SCOPE_SLOTS: u32 = METADATA_SLOTS + DATA_SLOTS;

/// Value-symbol table capacity: 52² two-character tokens.
pub const VALUE_SYMBOL_CAPACITY: u32 = (VALUE_ALPHABET.len() as u32) * (VALUE_ALPHABET.len() as u32);

fn encode(mut index: u32, alphabet: &[u8], width: usize) -> String {
    let base = alphabet.len() as u32;
    let mut chars = vec![alphabet[0]; width];
    for slot in chars.iter_mut().rev() {
        *slot = alphabet[(index % base) as usize];
        index /= base;
    }
    // SAFETY: alphabet is ASCII-only.
    String::from_utf8(chars).unwrap_or_default()
}

/// A key-symbol table for exactly one scope (a job topic or an activity id).
#[derive(Clone, Debug, Default)]
pub struct KeySymbolTable {
    /// Inclusive reserved range for this scope, set once by `reserveSymbolRange`.
    pub range: Option<(u32, u32)>,
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
    next: u32,
}

impl KeySymbolTable {
    pub fn with_range(lo: u32, hi: u32) -> Self {
        Self {
            range: Some((lo, hi)),
            forward: HashMap::new(),
            reverse: HashMap::new(),
            next: lo,
        }
    }

    pub fn token_for(&self, path: &str) -> Option<&str> {
        self.forward.get(path).map(|s| s.as_str())
    }

    pub fn path_for(&self, token: &str) -> Option<&str> {
        self.reverse.get(token).map(|s| s.as_str())
    }

    /// Bind `path` to a fresh token, or return its existing token unchanged.
    /// Paths already mapped MUST retain their token across deploys.
    pub fn bind(&mut self, scope: &str, path: &str) -> MeshResult<String> {
        if let Some(tok) = self.forward.get(path) {
            return Ok(tok.clone());
        }
        let (_, hi) = self
            .range
            .ok_or_else(|| MeshError::SymbolRangeExhausted {
                scope: scope.to_string(),
                start: 0,
                max: 0,
            })?;
        if self.next > hi {
            return Err(MeshError::SymbolRangeExhausted {
                scope: scope.to_string(),
                start: self.next,
                max: hi,
            });
        }
        let token = encode(self.next, KEY_ALPHABET, 3);
        self.next += 1;
        self.forward.insert(path.to_string(), token.clone());
        self.reverse.insert(token.clone(), path.to_string());
        Ok(token)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, &str)> {
        self.forward.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The single value-symbol table for an app. Append-only; shared across all
/// scopes in that app.
#[derive(Clone, Debug, Default)]
pub struct ValueSymbolTable {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
    next: u32,
}

impl ValueSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token_for(&self, literal: &str) -> Option<&str> {
        self.forward.get(literal).map(|s| s.as_str())
    }

    pub fn literal_for(&self, token: &str) -> Option<&str> {
        self.reverse.get(token).map(|s| s.as_str())
    }

    /// `filterSymVals(start, max, existing, proposed) -> new`: allocate new
    /// tokens for every proposed literal not already bound, up to capacity.
    /// Returns only the newly-allocated `(literal, token)` pairs — the diff.
    pub fn filter_and_allocate(
        &mut self,
        proposed: &[String],
    ) -> MeshResult<Vec<(String, String)>> {
        let mut added = Vec::new();
        for literal in proposed {
            if self.forward.contains_key(literal) {
                continue;
            }
            if self.next >= VALUE_SYMBOL_CAPACITY {
                // At capacity: yields no additional symbols.
                break;
            }
            let token = encode(self.next, VALUE_ALPHABET, 2);
            self.next += 1;
            self.forward.insert(literal.clone(), token.clone());
            self.reverse.insert(token.clone(), literal.clone());
            added.push((literal.clone(), token));
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// True when `s` would collide with the 2-char value-symbol token space:
/// `/^:*[a-zA-Z]{2}$/`.
pub fn collides_with_value_symbol_space(s: &str) -> bool {
    let stripped = s.trim_start_matches(':');
    stripped.len() == 2 && stripped.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_is_stable_across_calls() {
        let mut t = KeySymbolTable::with_range(0, ACTIVITY_SCOPE_SLOTS - 1);
        let a = t.bind("t1", "output/data/x").unwrap();
        let b = t.bind("t1", "output/data/x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bind_exhausts_at_range_end() {
        let mut t = KeySymbolTable::with_range(0, 1);
        t.bind("t1", "a").unwrap();
        t.bind("t1", "b").unwrap();
        let err = t.bind("t1", "c").unwrap_err();
        assert!(matches!(err, MeshError::SymbolRangeExhausted { .. }));
    }

    #[test]
    fn value_symbols_stop_at_capacity() {
        let mut t = ValueSymbolTable::new();
        let many: Vec<String> = (0..(VALUE_SYMBOL_CAPACITY + 10))
            .map(|i| format!("literal_{i}"))
            .collect();
        let added = t.filter_and_allocate(&many).unwrap();
        assert_eq!(added.len() as u32, VALUE_SYMBOL_CAPACITY);
        // A further call with already-exhausted capacity and brand new
        // literals yields nothing new.
        let more = t.filter_and_allocate(&["yet_another".to_string()]).unwrap();
        assert!(more.is_empty());
    }

    #[test]
    fn collision_detection() {
        assert!(collides_with_value_symbol_space("ab"));
        assert!(collides_with_value_symbol_space(":ab"));
        assert!(!collides_with_value_symbol_space("abc"));
        assert!(!collides_with_value_symbol_space("a1"));
    }
}
