//! Option mappings and authority canonicalization (spec.md §6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, PoolError};

/// A single option value. `peer_fingerprint` may be a string or a list of
/// strings (spec.md §4.1), hence the `StrList` variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Str(String),
    Bool(bool),
    I64(i64),
    StrList(Vec<String>),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Vec<String> {
        match self {
            OptionValue::Str(s) => vec![s.clone()],
            OptionValue::StrList(v) => v.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Str(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Str(s)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

/// Recognized Encryptor option keys (spec.md §6), plus the synthetic
/// `sni_nb_hack` / `peer_certificate` fields that `enable` ignores when
/// comparing configurations (spec.md §4.1 step 4).
const CRYPTO_KEYS: &[&str] = &[
    "cafile",
    "ciphers",
    "crypto_method",
    "peer_name",
    "peer_fingerprint",
    "CN_match",
    "capture_peer_cert",
    "sni_nb_hack",
    "peer_certificate",
];

/// Free-form mapping of recognized TLS options attached to a socket's
/// context before handshake (spec.md §3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryptoOptionsMap {
    entries: HashMap<String, OptionValue>,
}

impl CryptoOptionsMap {
    pub fn new() -> Self {
        CryptoOptionsMap {
            entries: HashMap::new(),
        }
    }

    pub fn from_entries(
        entries: HashMap<String, OptionValue>,
    ) -> Result<Self, CryptoError> {
        for key in entries.keys() {
            if !CRYPTO_KEYS.contains(&key.as_str()) {
                return Err(CryptoError::UnknownOption(key.clone()));
            }
        }
        Ok(CryptoOptionsMap { entries })
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: &str, value: OptionValue) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.entries.remove(key)
    }

    /// Normalizes options per spec.md §4.1 step 3: injects the default CA
    /// file if unset, folds the `CN_match` legacy alias into `peer_name`,
    /// and forces `capture_peer_cert` in legacy (manual-verification) mode.
    pub fn normalized(mut self, default_cafile: &str, legacy_mode: bool) -> Self {
        if self.get("cafile").is_none() {
            self.set("cafile", OptionValue::from(default_cafile));
        }
        if let Some(cn) = self.remove("CN_match") {
            if self.get("peer_name").is_none() {
                self.set("peer_name", cn);
            }
        }
        if legacy_mode {
            self.set("capture_peer_cert", OptionValue::from(true));
        }
        self
    }

    /// Equality ignoring the synthetic fields spec.md §4.1 step 4 excludes
    /// from the "did the configuration change" comparison.
    pub fn matches_ignoring_synthetic(&self, other: &CryptoOptionsMap) -> bool {
        let strip = |m: &CryptoOptionsMap| {
            let mut e = m.entries.clone();
            e.remove("sni_nb_hack");
            e.remove("peer_certificate");
            e
        };
        strip(self) == strip(other)
    }
}

/// Options recognized by [`crate::pool::SocketPool`] (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Max concurrent sockets per authority; `<= 0` disables the limit.
    pub host_connection_limit: i64,
    /// Eviction delay (ms) after checkin; `<= 0` disables idle eviction.
    pub idle_timeout_ms: i64,
    /// Passed through to the `Connector`.
    pub connect_timeout_ms: u64,
    /// Local bind address; empty means any.
    pub bindto: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            host_connection_limit: 8,
            idle_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            bindto: String::new(),
        }
    }
}

impl PoolOptions {
    /// Merges a sparse per-call override mapping over `self` (the defaults),
    /// rejecting unrecognized keys.
    pub fn merge_overrides(
        &self,
        overrides: &HashMap<String, OptionValue>,
    ) -> Result<PoolOptions, PoolError> {
        let mut merged = self.clone();
        for (key, value) in overrides {
            match key.as_str() {
                "host_connection_limit" => {
                    if let OptionValue::I64(n) = value {
                        merged.host_connection_limit = *n;
                    }
                }
                "idle_timeout" => {
                    if let OptionValue::I64(n) = value {
                        merged.idle_timeout_ms = *n;
                    }
                }
                "connect_timeout" => {
                    if let OptionValue::I64(n) = value {
                        merged.connect_timeout_ms = (*n).max(0) as u64;
                    }
                }
                "bindto" => {
                    if let Some(s) = value.as_str() {
                        merged.bindto = s.to_string();
                    }
                }
                other => return Err(PoolError::UnknownOption(other.to_string())),
            }
        }
        Ok(merged)
    }
}

/// Canonicalizes an authority string per spec.md §6: `host:port` is
/// lowercased, `unix://path` keeps its case.
pub fn canonicalize_authority(uri: &str) -> String {
    if uri.starts_with("unix://") {
        uri.to_string()
    } else {
        uri.to_lowercase()
    }
}
