//! Process-wide agent memory: a small `key -> value` scratchpad agents use
//! to carry state across tool calls (a login completed, a chosen plan tier)
//! without re-deriving it from the page. Best-effort persisted to disk so a
//! restarted server doesn't lose non-sensitive state; sensitive entries are
//! kept in memory only unless a caller explicitly opts into persisting them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::is_sensitive_key;
use crate::util::now_iso8601;

pub const DEFAULT_MAX_VALUE_BYTES: usize = 64 * 1024;
const KEY_MAX_LEN: usize = 128;

#[derive(Debug)]
pub enum MemoryError {
    InvalidKey(String),
    TooLarge { bytes: usize, max: usize },
    NotFound(String),
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey(k) => write!(f, "invalid memory key: {k}"),
            Self::TooLarge { bytes, max } => write!(f, "memory value too large: {bytes} bytes (max {max})"),
            Self::NotFound(k) => write!(f, "memory key not found: {k}"),
        }
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: Value,
    pub bytes: usize,
    pub sensitive: bool,
    pub created_at: String,
    pub updated_at: String,
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= KEY_MAX_LEN
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Process-wide memory map. A single instance lives on the session manager.
pub struct AgentMemory {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    max_value_bytes: usize,
    persist_path: Option<PathBuf>,
}

/// On-disk shape: only non-sensitive entries (or sensitive ones whose
/// caller explicitly opted in at export time) ever reach this file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedMemory {
    entries: HashMap<String, MemoryEntry>,
}

impl AgentMemory {
    #[must_use]
    pub fn new(max_value_bytes: Option<usize>, persist_path: Option<PathBuf>) -> Self {
        let mut entries = HashMap::new();
        if let Some(path) = &persist_path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                if let Ok(persisted) = serde_json::from_str::<PersistedMemory>(&contents) {
                    entries = persisted.entries;
                }
            }
        }
        Self {
            entries: Mutex::new(entries),
            max_value_bytes: max_value_bytes.unwrap_or(DEFAULT_MAX_VALUE_BYTES),
            persist_path,
        }
    }

    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidKey`] if `key` doesn't match
    /// `[A-Za-z0-9_.-]{1,128}`, or [`MemoryError::TooLarge`] if the
    /// serialized value exceeds the configured byte budget.
    pub fn set(&self, key: &str, value: Value) -> Result<MemoryEntry, MemoryError> {
        if !is_valid_key(key) {
            return Err(MemoryError::InvalidKey(key.to_string()));
        }
        let bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(usize::MAX);
        if bytes > self.max_value_bytes {
            return Err(MemoryError::TooLarge { bytes, max: self.max_value_bytes });
        }
        let now = now_iso8601();
        let sensitive = is_sensitive_key(key);
        let mut guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let created_at = guard.get(key).map_or_else(|| now.clone(), |e| e.created_at.clone());
        let entry = MemoryEntry { value, bytes, sensitive, created_at, updated_at: now };
        guard.insert(key.to_string(), entry.clone());
        drop(guard);
        self.persist_best_effort();
        Ok(entry)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(key).cloned()
    }

    /// # Errors
    ///
    /// Returns [`MemoryError::NotFound`] if `key` is unknown.
    pub fn delete(&self, key: &str) -> Result<(), MemoryError> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key)
            .is_some();
        if !removed {
            return Err(MemoryError::NotFound(key.to_string()));
        }
        self.persist_best_effort();
        Ok(())
    }

    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> =
            self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).keys().cloned().collect();
        keys.sort();
        keys
    }

    fn persist_best_effort(&self) {
        let Some(path) = &self.persist_path else { return };
        let guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let persisted = PersistedMemory {
            entries: guard
                .iter()
                .filter(|(_, e)| !e.sensitive)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect(),
        };
        drop(guard);
        let _ = write_atomic(path, &persisted);
    }
}

fn write_atomic(path: &Path, persisted: &PersistedMemory) -> std::io::Result<()> {
    let Some(parent) = path.parent() else { return Ok(()) };
    std::fs::create_dir_all(parent)?;
    let json = serde_json::to_string_pretty(persisted)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mem = AgentMemory::new(None, None);
        mem.set("plan_tier", serde_json::json!("pro")).unwrap();
        let entry = mem.get("plan_tier").unwrap();
        assert_eq!(entry.value, serde_json::json!("pro"));
        assert!(!entry.sensitive);
    }

    #[test]
    fn delete_then_get_returns_none() {
        let mem = AgentMemory::new(None, None);
        mem.set("k", serde_json::json!(1)).unwrap();
        mem.delete("k").unwrap();
        assert!(mem.get("k").is_none());
    }

    #[test]
    fn delete_unknown_key_errors() {
        let mem = AgentMemory::new(None, None);
        assert!(matches!(mem.delete("missing"), Err(MemoryError::NotFound(_))));
    }

    #[test]
    fn invalid_key_is_rejected() {
        let mem = AgentMemory::new(None, None);
        let err = mem.set("has space", serde_json::json!(1)).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidKey(_)));
    }

    #[test]
    fn oversized_value_is_rejected() {
        let mem = AgentMemory::new(Some(8), None);
        let err = mem.set("k", serde_json::json!("way too long for eight bytes")).unwrap_err();
        assert!(matches!(err, MemoryError::TooLarge { .. }));
    }

    #[test]
    fn sensitive_key_is_classified_but_still_stored() {
        let mem = AgentMemory::new(None, None);
        mem.set("session_token", serde_json::json!("abc")).unwrap();
        assert!(mem.get("session_token").unwrap().sensitive);
    }

    #[test]
    fn persistence_round_trips_and_excludes_sensitive_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_memory.json");

        let mem = AgentMemory::new(None, Some(path.clone()));
        mem.set("visible", serde_json::json!("ok")).unwrap();
        mem.set("password", serde_json::json!("hunter2")).unwrap();

        let reloaded = AgentMemory::new(None, Some(path));
        assert!(reloaded.get("visible").is_some());
        assert!(reloaded.get("password").is_none(), "sensitive entries must not be persisted");
    }

    #[test]
    fn list_returns_sorted_keys() {
        let mem = AgentMemory::new(None, None);
        mem.set("b", serde_json::json!(1)).unwrap();
        mem.set("a", serde_json::json!(1)).unwrap();
        assert_eq!(mem.list(), vec!["a".to_string(), "b".to_string()]);
    }
}
