//! Environment resolution for supervised processes.
//!
//! Merge order is OS snapshot, then supervisor globals, then per-process
//! entries, with later keys overriding earlier ones. The OS snapshot is
//! captured once per process lifetime; resolvers are immutable values and
//! mutation returns a new resolver, so in-flight merges never observe a
//! change.
use std::{
    collections::HashMap,
    env,
    sync::{Arc, OnceLock},
};

use regex::Regex;

static OS_ENV: OnceLock<Vec<(String, String)>> = OnceLock::new();

fn os_snapshot() -> &'static [(String, String)] {
    OS_ENV.get_or_init(|| env::vars().collect())
}

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var pattern")
    })
}

/// Immutable environment resolver shared by a manager and its processes.
#[derive(Debug, Clone, Default)]
pub struct EnvResolver {
    globals: Arc<Vec<(String, String)>>,
}

impl EnvResolver {
    /// Creates a resolver with no global overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver seeded from `KEY=VALUE` entries.
    pub fn from_entries(entries: &[String]) -> Self {
        let mut resolver = Self::new();
        for entry in entries {
            if let Some((key, value)) = parse_entry(entry) {
                resolver = resolver.with_set(key, value);
            }
        }
        resolver
    }

    /// Returns a new resolver with `key` set to `value` in the globals.
    pub fn with_set(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        let mut globals: Vec<(String, String)> = self.globals.as_ref().clone();
        if let Some(slot) = globals.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            globals.push((key, value));
        }
        Self {
            globals: Arc::new(globals),
        }
    }

    /// Returns a new resolver with `key` removed from the globals.
    pub fn with_unset(&self, key: &str) -> Self {
        let globals: Vec<(String, String)> = self
            .globals
            .iter()
            .filter(|(k, _)| k != key)
            .cloned()
            .collect();
        Self {
            globals: Arc::new(globals),
        }
    }

    /// The current global overrides, in insertion order.
    pub fn globals(&self) -> &[(String, String)] {
        &self.globals
    }

    /// Produces a fresh `KEY=VALUE` list ordered OS snapshot, then globals,
    /// then `per_proc`, with later keys overriding earlier ones in place.
    /// One pass of `${VAR}` expansion is applied against the merged map;
    /// unknown variables expand to the empty string.
    pub fn merge(&self, per_proc: &[String]) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let mut values: HashMap<String, String> = HashMap::new();

        let mut put = |key: &str, value: &str| {
            if key.is_empty() {
                return;
            }
            if !values.contains_key(key) {
                order.push(key.to_string());
            }
            values.insert(key.to_string(), value.to_string());
        };

        for (key, value) in os_snapshot() {
            put(key, value);
        }
        for (key, value) in self.globals.iter() {
            put(key, value);
        }
        for entry in per_proc {
            if let Some((key, value)) = parse_entry(entry) {
                put(key, value);
            }
        }

        order
            .into_iter()
            .map(|key| {
                let raw = values.get(&key).map(String::as_str).unwrap_or("");
                let expanded = var_pattern().replace_all(raw, |caps: &regex::Captures| {
                    values
                        .get(&caps[1])
                        .cloned()
                        .unwrap_or_default()
                });
                format!("{key}={expanded}")
            })
            .collect()
    }
}

/// Splits a `KEY=VALUE` entry. Lines without `=`, with an empty key, or
/// with an empty value are ignored.
fn parse_entry(entry: &str) -> Option<(&str, &str)> {
    let (key, value) = entry.split_once('=')?;
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Splits an already-merged `KEY=VALUE` line for handing to `Command::envs`.
/// Merged lines always contain `=`; a malformed line yields an empty value.
pub(crate) fn split_merged(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}
