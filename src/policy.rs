//! Access and sensitivity policy shared by telemetry redaction, the artifact
//! store, and the allow-listed HTTP fetch path.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Substrings that mark a header or JSON key as sensitive. Checked against a
/// lowercased key; `auth` additionally requires an exact match to avoid
/// flagging unrelated keys such as `author`.
const SENSITIVE_SUBSTRINGS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "pwd",
    "authorization",
    "cookie",
    "session",
    "jwt",
    "bearer",
    "api-key",
    "api_key",
    "apikey",
];

/// Header name prefixes that are always redacted regardless of value.
const SENSITIVE_HEADER_PREFIXES: &[&str] = &["cookie", "set-cookie", "authorization"];

#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    if lower == "auth" {
        return true;
    }
    SENSITIVE_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

#[must_use]
pub fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADER_PREFIXES
        .iter()
        .any(|p| lower.starts_with(p))
        || is_sensitive_key(&lower)
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Permissive = 0,
    Strict = 1,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permissive => write!(f, "permissive"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

impl PolicyMode {
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Self::Strict,
            _ => Self::Permissive,
        }
    }
}

/// Process-wide policy state. A single `SessionManager` owns one of these;
/// it is `Clone`-cheap (an `Arc`-free atomic) so gateway peers and telemetry
/// tasks can all consult it without taking a lock.
#[derive(Debug)]
pub struct Policy {
    mode: AtomicU8,
    allowed_hosts: Vec<String>,
}

impl Policy {
    #[must_use]
    pub fn new(mode: PolicyMode, allowed_hosts: Vec<String>) -> Self {
        Self {
            mode: AtomicU8::new(mode as u8),
            allowed_hosts,
        }
    }

    #[must_use]
    pub fn get(&self) -> PolicyMode {
        match self.mode.load(Ordering::Relaxed) {
            1 => PolicyMode::Strict,
            _ => PolicyMode::Permissive,
        }
    }

    pub fn set(&self, mode: PolicyMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Under `strict`, only hosts on the allow-list may be fetched or
    /// navigated to. Under `permissive`, everything is allowed; the
    /// allow-list is ignored but still recorded for introspection.
    #[must_use]
    pub fn is_host_allowed(&self, host: &str) -> bool {
        if self.get() == PolicyMode::Permissive {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&host))
    }

    #[must_use]
    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(PolicyMode::Permissive, Vec::new())
    }
}

/// Restricts broker/peer identifiers to a filesystem-safe subset before they
/// are interpolated into a socket or lock-file path.
#[must_use]
pub fn sanitize_broker_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.chars().take(64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_keys_match_known_substrings() {
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("x-api-key"));
        assert!(is_sensitive_key("sessionId"));
        assert!(is_sensitive_key("auth"));
        assert!(!is_sensitive_key("author"));
        assert!(!is_sensitive_key("status"));
    }

    #[test]
    fn sensitive_headers_match_prefixes() {
        assert!(is_sensitive_header("Set-Cookie"));
        assert!(is_sensitive_header("cookie"));
        assert!(is_sensitive_header("Authorization"));
        assert!(!is_sensitive_header("content-type"));
    }

    #[test]
    fn policy_mode_normalizes_unknown_to_permissive() {
        assert_eq!(PolicyMode::normalize("strict"), PolicyMode::Strict);
        assert_eq!(PolicyMode::normalize("STRICT"), PolicyMode::Strict);
        assert_eq!(PolicyMode::normalize("weird"), PolicyMode::Permissive);
    }

    #[test]
    fn strict_policy_enforces_allow_list() {
        let policy = Policy::new(PolicyMode::Strict, vec!["example.com".to_string()]);
        assert!(policy.is_host_allowed("example.com"));
        assert!(policy.is_host_allowed("EXAMPLE.com"));
        assert!(!policy.is_host_allowed("evil.example.net"));
    }

    #[test]
    fn permissive_policy_allows_everything() {
        let policy = Policy::new(PolicyMode::Permissive, Vec::new());
        assert!(policy.is_host_allowed("anything.example"));
    }

    #[test]
    fn set_changes_mode_at_runtime() {
        let policy = Policy::default();
        assert_eq!(policy.get(), PolicyMode::Permissive);
        policy.set(PolicyMode::Strict);
        assert_eq!(policy.get(), PolicyMode::Strict);
    }

    #[test]
    fn sanitize_broker_id_strips_unsafe_chars() {
        assert_eq!(sanitize_broker_id("peer/../etc"), "peer_.._etc");
        assert_eq!(sanitize_broker_id("///"), "default");
        assert_eq!(sanitize_broker_id("ok-id_1"), "ok-id_1");
    }
}
