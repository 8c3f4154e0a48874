//! Wire shapes for the extension bridge protocol: server ↔ extension and
//! server ↔ peer, all JSON objects tagged by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque version string both sides must match exactly; no semver
/// compatibility windows are negotiated.
pub const EXTENSION_BRIDGE_PROTOCOL_VERSION: &str = "browser-mcp-bridge/1";

/// First message an extension client is expected to send.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    pub protocol_version: String,
    pub extension_id: String,
    #[serde(default)]
    pub extension_version: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub state: Option<ExtensionState>,
}

/// Extension-reported live state, used to decide session-tab adoption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionState {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub follow_active: bool,
    #[serde(default)]
    pub focused_tab_id: Option<String>,
}

/// First message a server peer is expected to send.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHelloMessage {
    pub protocol_version: String,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

/// A CDP event fanned out by the extension for a specific tab.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpEventMessage {
    pub tab_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// An extension's reply to a previously dispatched `rpc` request.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResultMessage {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Advertised extension capability flags, consulted before offering the
/// batch-shaped helpers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionCapabilities {
    pub debugger: bool,
    pub tabs: bool,
    pub cdp_send_many: bool,
    pub rpc_batch: bool,
}

impl ExtensionCapabilities {
    #[must_use]
    pub fn from_list(list: &[String]) -> Self {
        Self {
            debugger: list.iter().any(|c| c == "debugger"),
            tabs: list.iter().any(|c| c == "tabs"),
            cdp_send_many: list.iter().any(|c| c == "cdpSendMany"),
            rpc_batch: list.iter().any(|c| c == "rpcBatch"),
        }
    }
}

/// One connected extension, as tracked by the gateway.
#[derive(Debug, Clone)]
pub struct ExtensionClientInfo {
    pub extension_id: String,
    pub extension_version: Option<String>,
    pub user_agent: Option<String>,
    pub capabilities: ExtensionCapabilities,
    pub state: ExtensionState,
}

/// Status payload returned by `gateway.status` / the discovery endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub listening: bool,
    pub bind_error: Option<String>,
    pub attempted_port: Option<u16>,
    pub candidate_ports: Vec<u16>,
    pub extension_connected: bool,
    pub peer_count: usize,
    pub gateway_port: Option<u16>,
    pub server_started_at_ms: u64,
    pub pid: u32,
}

/// The `/.well-known/browser-mcp-gateway` discovery document.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDocument {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub protocol_version: &'static str,
    pub server_version: String,
    pub server_started_at_ms: u64,
    pub gateway_port: u16,
    pub pid: u32,
    pub extension_connected: bool,
    pub peer_count: usize,
    pub supports_peers: bool,
}

/// Expand `MCP_EXTENSION_PORT_RANGE` / `MCP_EXTENSION_PORT_SPAN` into the
/// ordered candidate port list the bind loop tries in sequence.
///
/// A `lo-hi` range is normalized (swapped if given backwards) and takes
/// priority over the base+span form. `span` is clamped to `[0, 250]`.
#[must_use]
pub fn expand_port_candidates(base: u16, span: u16, range: Option<(u16, u16)>) -> Vec<u16> {
    let span = span.min(250);
    if let Some((a, b)) = range {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        return (lo..=hi).collect();
    }
    let mut out = Vec::with_capacity(usize::from(span) + 1);
    for offset in 0..=span {
        if let Some(port) = base.checked_add(offset) {
            out.push(port);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_from_list_recognizes_each_flag() {
        let caps = ExtensionCapabilities::from_list(&[
            "debugger".to_string(),
            "cdpSendMany".to_string(),
        ]);
        assert!(caps.debugger);
        assert!(caps.cdp_send_many);
        assert!(!caps.tabs);
        assert!(!caps.rpc_batch);
    }

    #[test]
    fn expand_port_candidates_base_span() {
        let ports = expand_port_candidates(8765, 3, None);
        assert_eq!(ports, vec![8765, 8766, 8767, 8768]);
    }

    #[test]
    fn expand_port_candidates_normalizes_reversed_range() {
        let ports = expand_port_candidates(8765, 3, Some((8770, 8767)));
        assert_eq!(ports, vec![8767, 8768, 8769, 8770]);
    }

    #[test]
    fn expand_port_candidates_clamps_span() {
        let ports = expand_port_candidates(1000, 10_000, None);
        assert_eq!(ports.len(), 251);
    }
}
