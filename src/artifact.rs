//! Content-addressed, bounded artifact store.
//!
//! Tools hand the store text, JSON, base64 image bytes or whole files; it
//! assigns (or validates) an id, writes the payload to a per-session
//! directory, and evicts the oldest entries once the store's byte budget is
//! exceeded. Lookups never touch disk beyond the store root: `ArtifactRef`
//! carries enough metadata to serve slices and previews without re-reading
//! the whole file unless the caller asks for it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

const ID_MAX_LEN: usize = 128;
const DEFAULT_MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024;
const TEXT_PREVIEW_CHARS: usize = 4000;

#[derive(Debug)]
pub enum ArtifactError {
    InvalidId(String),
    NotFound(String),
    Io(std::io::Error),
    Encoding(String),
    AlreadyExists(String),
}

impl std::fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId(id) => write!(f, "invalid artifact id: {id}"),
            Self::NotFound(id) => write!(f, "artifact not found: {id}"),
            Self::Io(e) => write!(f, "artifact io error: {e}"),
            Self::Encoding(msg) => write!(f, "artifact encoding error: {msg}"),
            Self::AlreadyExists(path) => write!(f, "export destination already exists: {path}"),
        }
    }
}

impl std::error::Error for ArtifactError {}

impl From<std::io::Error> for ArtifactError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Json,
    Image,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub kind: ArtifactKind,
    pub mime_type: String,
    pub bytes: u64,
    pub created_at: String,
    pub path: PathBuf,
    pub truncated: bool,
    pub total_chars: Option<usize>,
    pub stored_chars: Option<usize>,
}

fn is_valid_id(id: &str) -> bool {
    if id.is_empty() || id.len() > ID_MAX_LEN {
        return false;
    }
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn sanitize_kind(kind: &str) -> String {
    let cleaned: String = kind.chars().filter(|c| c.is_ascii_alphanumeric()).map(|c| c.to_ascii_lowercase()).collect();
    if cleaned.is_empty() { "art".to_string() } else { cleaned }
}

/// Builds a fresh id as `<safe-kind>_<ms>_<pid>`. Two artifacts of the same
/// kind created in the same process within the same millisecond collide by
/// construction; `insert_meta` treats that as a normal overwrite, same as a
/// caller-supplied id reused on purpose.
fn make_id(kind: &str) -> String {
    let mut id = format!("{}_{}_{}", sanitize_kind(kind), crate::util::now_ms(), std::process::id());
    id.truncate(ID_MAX_LEN);
    id
}

fn sanitize_export_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(200)
        .collect();
    cleaned
}

struct Entry {
    meta: ArtifactRef,
}

/// Bounded, content-addressed artifact store rooted at one directory per
/// session. `max_total_bytes` is a soft cap: once the running total exceeds
/// it, the oldest entries are evicted (file and metadata both) until the
/// store is back under budget or only the newest entry remains.
pub struct ArtifactStore {
    root: PathBuf,
    max_total_bytes: u64,
    entries: Mutex<VecDeque<Entry>>,
}

impl ArtifactStore {
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] if `root` cannot be created.
    pub fn new(root: PathBuf, max_total_bytes: Option<u64>) -> Result<Self, ArtifactError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_total_bytes: max_total_bytes.unwrap_or(DEFAULT_MAX_TOTAL_BYTES),
            entries: Mutex::new(VecDeque::new()),
        })
    }

    fn resolve_id(&self, requested: Option<&str>, kind: &str) -> Result<String, ArtifactError> {
        match requested {
            Some(id) if is_valid_id(id) => Ok(id.to_string()),
            Some(id) => Err(ArtifactError::InvalidId(id.to_string())),
            None => Ok(make_id(kind)),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn insert_meta(&self, meta: ArtifactRef) {
        let mut entries = self.entries.lock().expect("artifact store lock poisoned");
        entries.retain(|e| e.meta.id != meta.id);
        entries.push_back(Entry { meta });
        self.evict_if_over_budget(&mut entries);
    }

    fn evict_if_over_budget(&self, entries: &mut VecDeque<Entry>) {
        let mut total: u64 = entries.iter().map(|e| e.meta.bytes).sum();
        while total > self.max_total_bytes && entries.len() > 1 {
            if let Some(oldest) = entries.pop_front() {
                total = total.saturating_sub(oldest.meta.bytes);
                let _ = std::fs::remove_file(&oldest.meta.path);
            }
        }
    }

    fn now_iso8601() -> String {
        crate::util::now_iso8601()
    }

    /// # Errors
    ///
    /// Returns [`ArtifactError::InvalidId`] for a malformed caller-supplied
    /// id, or [`ArtifactError::Io`] on write failure.
    pub fn put_text(&self, requested_id: Option<&str>, content: &str) -> Result<ArtifactRef, ArtifactError> {
        let id = self.resolve_id(requested_id, "txt")?;
        let path = self.path_for(&id);
        let total_chars = content.chars().count();
        let truncated = total_chars > TEXT_PREVIEW_CHARS * 50;
        std::fs::write(&path, content)?;
        let meta = ArtifactRef {
            id,
            kind: ArtifactKind::Text,
            mime_type: "text/plain".to_string(),
            bytes: content.len() as u64,
            created_at: Self::now_iso8601(),
            path,
            truncated,
            total_chars: Some(total_chars),
            stored_chars: Some(total_chars),
        };
        self.insert_meta(meta.clone());
        Ok(meta)
    }

    /// # Errors
    ///
    /// Returns [`ArtifactError::InvalidId`] or [`ArtifactError::Io`].
    pub fn put_json(&self, requested_id: Option<&str>, value: &serde_json::Value) -> Result<ArtifactRef, ArtifactError> {
        let content = serde_json::to_string(value)
            .map_err(|e| ArtifactError::Encoding(e.to_string()))?;
        let id = self.resolve_id(requested_id, "json")?;
        let path = self.path_for(&id);
        std::fs::write(&path, &content)?;
        let meta = ArtifactRef {
            id,
            kind: ArtifactKind::Json,
            mime_type: "application/json".to_string(),
            bytes: content.len() as u64,
            created_at: Self::now_iso8601(),
            path,
            truncated: false,
            total_chars: Some(content.chars().count()),
            stored_chars: Some(content.chars().count()),
        };
        self.insert_meta(meta.clone());
        Ok(meta)
    }

    /// # Errors
    ///
    /// Returns [`ArtifactError::Encoding`] if `b64` is not valid base64,
    /// [`ArtifactError::InvalidId`] for a malformed id, or
    /// [`ArtifactError::Io`] on write failure.
    pub fn put_image_b64(
        &self,
        requested_id: Option<&str>,
        mime_type: &str,
        b64: &str,
    ) -> Result<ArtifactRef, ArtifactError> {
        let bytes = BASE64
            .decode(b64)
            .map_err(|e| ArtifactError::Encoding(e.to_string()))?;
        let id = self.resolve_id(requested_id, "img")?;
        let path = self.path_for(&id);
        std::fs::write(&path, &bytes)?;
        let meta = ArtifactRef {
            id,
            kind: ArtifactKind::Image,
            mime_type: mime_type.to_string(),
            bytes: bytes.len() as u64,
            created_at: Self::now_iso8601(),
            path,
            truncated: false,
            total_chars: None,
            stored_chars: None,
        };
        self.insert_meta(meta.clone());
        Ok(meta)
    }

    /// Copies an existing file on disk into the store.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::InvalidId`] or [`ArtifactError::Io`].
    pub fn put_file(
        &self,
        requested_id: Option<&str>,
        source: &Path,
        mime_type: &str,
    ) -> Result<ArtifactRef, ArtifactError> {
        let id = self.resolve_id(requested_id, "file")?;
        let path = self.path_for(&id);
        std::fs::copy(source, &path)?;
        let bytes = std::fs::metadata(&path)?.len();
        let meta = ArtifactRef {
            id,
            kind: ArtifactKind::File,
            mime_type: mime_type.to_string(),
            bytes,
            created_at: Self::now_iso8601(),
            path,
            truncated: false,
            total_chars: None,
            stored_chars: None,
        };
        self.insert_meta(meta.clone());
        Ok(meta)
    }

    #[must_use]
    pub fn list(&self) -> Vec<ArtifactRef> {
        self.entries
            .lock()
            .expect("artifact store lock poisoned")
            .iter()
            .map(|e| e.meta.clone())
            .collect()
    }

    #[must_use]
    pub fn get_meta(&self, id: &str) -> Option<ArtifactRef> {
        self.entries
            .lock()
            .expect("artifact store lock poisoned")
            .iter()
            .find(|e| e.meta.id == id)
            .map(|e| e.meta.clone())
    }

    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] if `id` is unknown, or
    /// [`ArtifactError::Io`] if the backing file cannot be read.
    pub fn get_text_slice(&self, id: &str, offset: usize, limit: usize) -> Result<String, ArtifactError> {
        let meta = self
            .get_meta(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;
        let content = std::fs::read_to_string(&meta.path)?;
        let sliced: String = content.chars().skip(offset).take(limit).collect();
        Ok(sliced)
    }

    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] or [`ArtifactError::Io`].
    pub fn get_image_b64(&self, id: &str) -> Result<String, ArtifactError> {
        let meta = self
            .get_meta(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;
        let bytes = std::fs::read(&meta.path)?;
        Ok(BASE64.encode(bytes))
    }

    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] if `id` is unknown.
    pub fn delete(&self, id: &str) -> Result<(), ArtifactError> {
        let mut entries = self.entries.lock().expect("artifact store lock poisoned");
        let Some(idx) = entries.iter().position(|e| e.meta.id == id) else {
            return Err(ArtifactError::NotFound(id.to_string()));
        };
        let entry = entries.remove(idx).expect("index just located");
        let _ = std::fs::remove_file(&entry.meta.path);
        Ok(())
    }

    /// Copies the artifact's file out of the store into `out_dir` (default:
    /// an `exports` directory under the store root) under `name` (default:
    /// the artifact's own id), sanitized to `[A-Za-z0-9._-]` and capped at
    /// 200 characters. Refuses to clobber an existing file unless
    /// `overwrite` is set. Returns a path relative to the process's current
    /// directory when possible, never an absolute path leaking the store's
    /// on-disk layout.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::NotFound`] if `id` is unknown,
    /// [`ArtifactError::AlreadyExists`] if the destination exists and
    /// `overwrite` is false, or [`ArtifactError::Io`] on write failure.
    pub fn export(
        &self,
        id: &str,
        out_dir: Option<&Path>,
        name: Option<&str>,
        overwrite: bool,
    ) -> Result<PathBuf, ArtifactError> {
        let meta = self
            .get_meta(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;

        let dir = out_dir.map(Path::to_path_buf).unwrap_or_else(|| self.root.join("exports"));
        std::fs::create_dir_all(&dir)?;

        let sanitized = name.map(|n| sanitize_export_name(n)).filter(|n| !n.is_empty());
        let file_name = sanitized.unwrap_or_else(|| meta.id.clone());
        let dest = dir.join(&file_name);

        if dest.exists() && !overwrite {
            return Err(ArtifactError::AlreadyExists(dest.display().to_string()));
        }

        std::fs::copy(&meta.path, &dest)?;

        let relative = std::env::current_dir()
            .ok()
            .and_then(|cwd| dest.strip_prefix(&cwd).ok().map(Path::to_path_buf))
            .unwrap_or(dest);
        Ok(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ArtifactStore {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.keep();
        ArtifactStore::new(root, Some(1024)).unwrap()
    }

    #[test]
    fn put_and_get_text_round_trips() {
        let store = store();
        let meta = store.put_text(None, "hello world").unwrap();
        assert_eq!(meta.kind, ArtifactKind::Text);
        let slice = store.get_text_slice(&meta.id, 0, 5).unwrap();
        assert_eq!(slice, "hello");
    }

    #[test]
    fn rejects_invalid_caller_supplied_id() {
        let store = store();
        let err = store.put_text(Some("../etc/passwd"), "x").unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidId(_)));
    }

    #[test]
    fn accepts_valid_caller_supplied_id() {
        let store = store();
        let meta = store.put_text(Some("my-artifact_1"), "x").unwrap();
        assert_eq!(meta.id, "my-artifact_1");
    }

    #[test]
    fn put_image_b64_decodes_and_stores() {
        let store = store();
        let b64 = BASE64.encode(b"\x89PNG\r\n");
        let meta = store.put_image_b64(None, "image/png", &b64).unwrap();
        let round_trip = store.get_image_b64(&meta.id).unwrap();
        assert_eq!(round_trip, b64);
    }

    #[test]
    fn put_image_b64_rejects_malformed_base64() {
        let store = store();
        let err = store.put_image_b64(None, "image/png", "not base64!!").unwrap_err();
        assert!(matches!(err, ArtifactError::Encoding(_)));
    }

    #[test]
    fn delete_removes_entry_and_file() {
        let store = store();
        let meta = store.put_text(None, "temp").unwrap();
        assert!(meta.path.exists());
        store.delete(&meta.id).unwrap();
        assert!(!meta.path.exists());
        assert!(store.get_meta(&meta.id).is_none());
    }

    #[test]
    fn evicts_oldest_entries_once_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.keep(), Some(10)).unwrap();
        let first = store.put_text(Some("a"), "0123456789").unwrap();
        let _second = store.put_text(Some("b"), "0123456789").unwrap();
        assert!(store.get_meta(&first.id).is_none());
        assert!(!first.path.exists());
    }

    #[test]
    fn list_reflects_insertion_order() {
        let store = store();
        store.put_text(Some("a"), "1").unwrap();
        store.put_text(Some("b"), "2").unwrap();
        let ids: Vec<String> = store.list().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn auto_assigned_id_follows_kind_ms_pid_shape() {
        let store = store();
        let meta = store.put_text(None, "x").unwrap();
        let parts: Vec<&str> = meta.id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "txt");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
        assert!(is_valid_id(&meta.id));
    }

    #[test]
    fn export_copies_into_out_dir_under_sanitized_name() {
        let store = store();
        let meta = store.put_text(None, "payload").unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let exported = store.export(&meta.id, Some(out_dir.path()), Some("../weird name!.txt"), false).unwrap();
        let absolute = out_dir.path().join(exported.file_name().unwrap());
        assert!(absolute.exists());
        let contents = std::fs::read_to_string(&absolute).unwrap();
        assert_eq!(contents, "payload");
    }

    #[test]
    fn export_without_overwrite_refuses_to_clobber() {
        let store = store();
        let meta = store.put_text(None, "payload").unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        store.export(&meta.id, Some(out_dir.path()), Some("report.txt"), false).unwrap();
        let err = store.export(&meta.id, Some(out_dir.path()), Some("report.txt"), false).unwrap_err();
        assert!(matches!(err, ArtifactError::AlreadyExists(_)));
        store.export(&meta.id, Some(out_dir.path()), Some("report.txt"), true).unwrap();
    }

    #[test]
    fn export_unknown_id_errors() {
        let store = store();
        let out_dir = tempfile::tempdir().unwrap();
        let err = store.export("missing", Some(out_dir.path()), None, false).unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }
}
