//! Runtime-directory resolution and broker discovery.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::gateway::protocol::EXTENSION_BRIDGE_PROTOCOL_VERSION;

/// Resolve the directory native broker registrations live under.
///
/// Priority: explicit env override, then `$XDG_RUNTIME_DIR/browser-mcp`,
/// then an inferred `/run/user/<uid>/browser-mcp` if writable, then
/// `/tmp/browser-mcp-<uid>`.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    runtime_dir_with(std::env::var("MCP_NATIVE_BROKER_DIR").ok(), std::env::var("XDG_RUNTIME_DIR").ok(), current_uid())
}

fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: getuid takes no arguments and never fails.
        unsafe { libc::getuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

fn runtime_dir_with(explicit: Option<String>, xdg: Option<String>, uid: u32) -> PathBuf {
    if let Some(dir) = explicit {
        return PathBuf::from(dir);
    }
    if let Some(dir) = xdg {
        return PathBuf::from(dir).join("browser-mcp");
    }
    let run_user = PathBuf::from(format!("/run/user/{uid}"));
    if run_user.is_dir() {
        let candidate = run_user.join("browser-mcp");
        if std::fs::create_dir_all(&candidate).is_ok() {
            return candidate;
        }
    }
    PathBuf::from(format!("/tmp/browser-mcp-{uid}"))
}

/// The `broker-<id>.json` registry document written by a running broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerRegistration {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol_version: String,
    pub broker_id: String,
    pub broker_pid: u32,
    pub broker_started_at_ms: u64,
    pub socket_path: PathBuf,
    pub extension_connected: bool,
    pub peer_count: usize,
}

impl BrokerRegistration {
    #[must_use]
    pub fn new(broker_id: String, broker_pid: u32, started_at_ms: u64, socket_path: PathBuf) -> Self {
        Self {
            kind: "browserMcpNativeBroker".to_string(),
            protocol_version: EXTENSION_BRIDGE_PROTOCOL_VERSION.to_string(),
            broker_id,
            broker_pid,
            broker_started_at_ms: started_at_ms,
            socket_path,
            extension_connected: false,
            peer_count: 0,
        }
    }
}

/// Enumerate `runtime_dir()/broker-*.json`, filter to the expected protocol
/// version and a currently-connectable socket, and pick the newest.
///
/// Env overrides `MCP_NATIVE_BROKER_SOCKET` / `MCP_NATIVE_BROKER_ID` bypass
/// discovery entirely when present.
#[must_use]
pub fn discover_best_broker() -> Option<BrokerRegistration> {
    if let Ok(socket) = std::env::var("MCP_NATIVE_BROKER_SOCKET") {
        let id = std::env::var("MCP_NATIVE_BROKER_ID").unwrap_or_else(|_| "override".to_string());
        return Some(BrokerRegistration::new(id, 0, 0, PathBuf::from(socket)));
    }
    discover_in(&runtime_dir())
}

fn discover_in(dir: &std::path::Path) -> Option<BrokerRegistration> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<BrokerRegistration> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if !(name.starts_with("broker-") && name.ends_with(".json")) {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(&path) else { continue };
        let Ok(reg) = serde_json::from_str::<BrokerRegistration>(&contents) else { continue };
        if reg.protocol_version != EXTENSION_BRIDGE_PROTOCOL_VERSION {
            continue;
        }
        if !socket_connectable(&reg.socket_path) {
            continue;
        }
        if best.as_ref().is_none_or(|b| reg.broker_started_at_ms > b.broker_started_at_ms) {
            best = Some(reg);
        }
    }
    best
}

fn socket_connectable(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    {
        std::os::unix::net::UnixStream::connect(path).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_prefers_explicit_override() {
        let dir = runtime_dir_with(Some("/custom/dir".to_string()), Some("/run/xdg".to_string()), 1000);
        assert_eq!(dir, PathBuf::from("/custom/dir"));
    }

    #[test]
    fn runtime_dir_falls_back_to_xdg() {
        let dir = runtime_dir_with(None, Some("/run/xdg".to_string()), 1000);
        assert_eq!(dir, PathBuf::from("/run/xdg/browser-mcp"));
    }

    #[test]
    fn runtime_dir_falls_back_to_tmp_when_nothing_else_available() {
        let dir = runtime_dir_with(None, None, 4242);
        assert!(dir == PathBuf::from("/tmp/browser-mcp-4242") || dir.starts_with("/run/user/4242"));
    }

    #[test]
    fn discover_in_ignores_mismatched_protocol_version() {
        let dir = tempfile::tempdir().unwrap();
        let reg = serde_json::json!({
            "type": "browserMcpNativeBroker",
            "protocolVersion": "bogus/0",
            "brokerId": "x",
            "brokerPid": 1,
            "brokerStartedAtMs": 1,
            "socketPath": "/nonexistent.sock",
            "extensionConnected": false,
            "peerCount": 0,
        });
        std::fs::write(dir.path().join("broker-x.json"), reg.to_string()).unwrap();
        assert!(discover_in(dir.path()).is_none());
    }

    #[test]
    fn discover_in_empty_dir_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_in(dir.path()).is_none());
    }
}
