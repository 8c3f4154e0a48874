//! The line-delimited JSON-RPC loop itself: read one JSON object per line
//! from stdin, dispatch it, write one JSON object per line to stdout.
//!
//! `initialize`, `ping`, `tools/list` and `tools/call` are the only methods
//! the core needs to understand; everything `tools/call` dispatches to is an
//! external collaborator reached through [`ToolRegistry`] — the tool
//! handlers themselves (navigate, click, type, ...) are explicitly out of
//! scope for this crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::protocol::{RequestId, RpcErrorBody, RpcRequest, RpcResponse, ToolDescriptor};
use crate::artifact::ArtifactStore;
use crate::error::{CoreError, ErrorKind};
use crate::session::SessionManager;

/// Everything a [`ToolRegistry`] implementation needs to act: the session
/// manager (connection/telemetry/recovery fabric) and the artifact store
/// (off-context payloads). This is the seam the out-of-scope tool-handler
/// layer plugs into.
pub struct ServerContext {
    pub session_manager: Arc<SessionManager>,
    pub artifacts: Arc<ArtifactStore>,
}

/// The dispatch table `tools/call` delegates to. A real deployment installs
/// one that knows about `navigate`/`click`/`type`/... ; this crate ships
/// only [`EmptyToolRegistry`], which answers `tools/list` with nothing and
/// `tools/call` with `NotConfigured`.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list(&self) -> Vec<ToolDescriptor>;

    async fn call(&self, ctx: &ServerContext, name: &str, arguments: Value) -> Result<Value, CoreError>;
}

/// Default registry: no tools installed. Lets the core JSON-RPC loop and
/// session fabric be exercised end to end without the handler layer.
pub struct EmptyToolRegistry;

#[async_trait]
impl ToolRegistry for EmptyToolRegistry {
    fn list(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }

    async fn call(&self, _ctx: &ServerContext, name: &str, _arguments: Value) -> Result<Value, CoreError> {
        Err(CoreError::new(
            ErrorKind::NotConfigured,
            format!("no tool handler registered for '{name}'"),
            "install a ToolRegistry that implements the tool layer",
        ))
    }
}

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Runs the read-dispatch-write loop until stdin is closed (EOF) or a fatal
/// I/O error occurs. Malformed lines produce a JSON-RPC parse-error response
/// rather than terminating the loop — one bad line from a misbehaving client
/// must not take the whole session down.
pub async fn serve<R, W>(reader: R, mut writer: W, ctx: Arc<ServerContext>, registry: Arc<dyn ToolRegistry>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed; shutting down the rpc loop");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = handle_line(trimmed, &ctx, registry.as_ref()).await;
        if let Some(response) = response {
            if write_response(&mut writer, &response).await.is_err() {
                break;
            }
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &RpcResponse) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"error":{"code":-32603,"message":"Internal error"}}"#.to_string()
    });
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Parses and dispatches one line, returning the response to write (`None`
/// only for notifications — requests with no `id` — per JSON-RPC convention,
/// though every method this core understands is request/response).
async fn handle_line(line: &str, ctx: &Arc<ServerContext>, registry: &dyn ToolRegistry) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => return Some(RpcResponse::failure(None, RpcErrorBody::parse_error(e.to_string()))),
    };
    let id = request.id.clone();
    Some(dispatch(request, ctx, registry).await.unwrap_or_else(|e| RpcResponse::failure(id, e)))
}

async fn dispatch(request: RpcRequest, ctx: &Arc<ServerContext>, registry: &dyn ToolRegistry) -> Result<RpcResponse, RpcErrorBody> {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => Ok(RpcResponse::success(id, initialize_result(ctx))),
        "ping" => Ok(RpcResponse::success(id, serde_json::json!({}))),
        "tools/list" => Ok(RpcResponse::success(id, serde_json::json!({ "tools": registry.list() }))),
        "tools/call" => handle_tools_call(id, request.params, ctx, registry).await,
        other => Err(RpcErrorBody::method_not_found(other)),
    }
}

fn initialize_result(ctx: &Arc<ServerContext>) -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverVersion": ctx.session_manager.config().server_version,
        "capabilities": { "tools": {} },
    })
}

async fn handle_tools_call(
    id: Option<RequestId>,
    params: Option<Value>,
    ctx: &Arc<ServerContext>,
    registry: &dyn ToolRegistry,
) -> Result<RpcResponse, RpcErrorBody> {
    let params = params.ok_or_else(|| RpcErrorBody::invalid_params("tools/call requires params"))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcErrorBody::invalid_params("params.name is required"))?;
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));

    match registry.call(ctx, name, arguments).await {
        Ok(result) => Ok(RpcResponse::success(id, result)),
        Err(core_err) => Ok(RpcResponse::success(
            id,
            serde_json::json!({
                "ok": false,
                "error": core_err.to_json(),
            }),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserConfig;
    use crate::memory::AgentMemory;
    use crate::session::Backend;

    fn test_ctx() -> Arc<ServerContext> {
        let dir = tempfile::tempdir().unwrap();
        let session_manager = Arc::new(SessionManager::new(
            BrowserConfig::default(),
            Backend::Direct { host: "127.0.0.1".into(), port: 9222 },
            Arc::new(AgentMemory::new(None, None)),
        ));
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts"), None).unwrap());
        Arc::new(ServerContext { session_manager, artifacts })
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let ctx = test_ctx();
        let registry: Arc<dyn ToolRegistry> = Arc::new(EmptyToolRegistry);
        let input = b"{\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut output = Vec::new();
        serve(input.as_slice(), &mut output, ctx, registry).await;
        let text = String::from_utf8(output).unwrap();
        let value: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let ctx = test_ctx();
        let registry: Arc<dyn ToolRegistry> = Arc::new(EmptyToolRegistry);
        let input = b"{\"id\":1,\"method\":\"bogus\"}\n".to_vec();
        let mut output = Vec::new();
        serve(input.as_slice(), &mut output, ctx, registry).await;
        let text = String::from_utf8(output).unwrap();
        let value: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn malformed_line_is_parse_error_and_loop_continues() {
        let ctx = test_ctx();
        let registry: Arc<dyn ToolRegistry> = Arc::new(EmptyToolRegistry);
        let input = b"not json\n{\"id\":2,\"method\":\"ping\"}\n".to_vec();
        let mut output = Vec::new();
        serve(input.as_slice(), &mut output, ctx, registry).await;
        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["error"]["code"], -32700);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn tools_call_with_no_registered_tool_returns_structured_not_ok() {
        let ctx = test_ctx();
        let registry: Arc<dyn ToolRegistry> = Arc::new(EmptyToolRegistry);
        let input = b"{\"id\":3,\"method\":\"tools/call\",\"params\":{\"name\":\"navigate\",\"arguments\":{}}}\n".to_vec();
        let mut output = Vec::new();
        serve(input.as_slice(), &mut output, ctx, registry).await;
        let text = String::from_utf8(output).unwrap();
        let value: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["result"]["ok"], false);
        assert_eq!(value["result"]["error"]["kind"], "not_configured");
    }

    #[tokio::test]
    async fn tools_call_without_name_is_invalid_params() {
        let ctx = test_ctx();
        let registry: Arc<dyn ToolRegistry> = Arc::new(EmptyToolRegistry);
        let input = b"{\"id\":4,\"method\":\"tools/call\",\"params\":{}}\n".to_vec();
        let mut output = Vec::new();
        serve(input.as_slice(), &mut output, ctx, registry).await;
        let text = String::from_utf8(output).unwrap();
        let value: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["error"]["code"], -32602);
    }
}
