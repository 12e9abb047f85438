//! Key-value configuration store.
//!
//! Flat namespace of string records with unique keys: core keys are
//! bare (`interface`, `server`), module keys carry a dot-separated
//! prefix (`udp.port`, `pppd.ip`). Sources are ordered — the argv
//! source is read first and the INI file source skips any key that
//! already exists, so command-line values win.
//!
//! The store is read-mostly after startup; a generation counter is
//! bumped on every mutation so composite readers can detect churn.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};

#[derive(Default)]
struct Store {
    records: HashMap<String, String>,
    generation: u64,
}

/// Configuration instance. All methods are safe for concurrent callers.
#[derive(Default)]
pub struct Config {
    inner: Mutex<Store>,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Store a record, replacing any existing record with the same key.
    pub fn store(&self, key: &str, val: &str) {
        let mut store = self.inner.lock().unwrap();
        store.records.insert(key.to_string(), val.to_string());
        store.generation += 1;
    }

    /// Store a record only when the key is absent. Returns whether the
    /// record was inserted (lower-priority sources use this).
    pub fn store_if_absent(&self, key: &str, val: &str) -> bool {
        let mut store = self.inner.lock().unwrap();
        if store.records.contains_key(key) {
            return false;
        }
        store.records.insert(key.to_string(), val.to_string());
        store.generation += 1;
        true
    }

    /// Remove a record. A later lookup reports "not found".
    pub fn drop_key(&self, key: &str) {
        let mut store = self.inner.lock().unwrap();
        if store.records.remove(key).is_some() {
            store.generation += 1;
        }
    }

    /// Value-copied lookup.
    pub fn find_str(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().records.get(key).cloned()
    }

    /// Numeric lookup. Absent keys are an expected result; a value that
    /// is not an integer is a configuration error.
    pub fn find_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.find_str(key) {
            None => Ok(None),
            Some(val) => val
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::Config(format!("'{key}': '{val}' is not a number"))),
        }
    }

    /// Boolean lookup. False iff the key is absent or the value is one
    /// of `0`, `false`, `False`, `FALSE`; true otherwise.
    pub fn find_bool(&self, key: &str) -> bool {
        match self.find_str(key) {
            None => false,
            Some(val) => !matches!(val.as_str(), "0" | "false" | "False" | "FALSE"),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read an INI file into the store. Existing keys are kept — the
    /// file is a lower-priority source than argv.
    ///
    /// Lines: `[section]`, `key = value`, `# comment`, blank. Keys in
    /// the `core` section (or before any section header) are stored
    /// bare; other sections produce `section.key`.
    pub fn read_file(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        self.read_ini(&text)
    }

    fn read_ini(&self, text: &str) -> Result<()> {
        let mut section: Option<String> = None;
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = Some(name.trim().to_string());
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                return Err(Error::Config(format!(
                    "can't parse line {}: '{}'",
                    lineno + 1,
                    line
                )));
            };
            let key = full_key(section.as_deref(), key.trim());
            self.store_if_absent(&key, val.trim());
        }
        Ok(())
    }
}

/// Build the flat key for a section-local suffix. `core` (or no
/// section) stores keys without a prefix.
fn full_key(section: Option<&str>, suffix: &str) -> String {
    match section {
        None | Some("core") => suffix.to_string(),
        Some(section) => format!("{section}.{suffix}"),
    }
}
