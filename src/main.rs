//! Entry point: resolves configuration, stands up the configured backend
//! (direct CDP / extension gateway / native broker), and runs the
//! line-delimited JSON-RPC loop over stdio described in §6.
//!
//! Tool handlers (navigate, click, type, ...) are an external collaborator
//! and out of scope for this crate: `rpc::EmptyToolRegistry` is installed so
//! the transport, session and telemetry fabric can be exercised end to end
//! without them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use browser_mcp_core::artifact::ArtifactStore;
use browser_mcp_core::chrome;
use browser_mcp_core::config::{self, BrowserConfig, BrowserMode};
use browser_mcp_core::error::{AppError, ExitCode};
use browser_mcp_core::gateway::protocol::expand_port_candidates;
use browser_mcp_core::gateway::shared::{SharedExtensionGateway, SharedExtensionGatewayConfig};
use browser_mcp_core::memory::AgentMemory;
use browser_mcp_core::native::discovery::{discover_best_broker, runtime_dir};
use browser_mcp_core::native::peer::NativePeer;
use browser_mcp_core::rpc::{EmptyToolRegistry, ServerContext, serve};
use browser_mcp_core::session::{Backend, SessionManager};

/// Connect timeout used while probing for an already-running Chrome before
/// deciding whether `launch` mode needs to spawn one.
const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_millis(1_500);

#[derive(Parser, Debug)]
#[command(name = "browser-mcp-core", about = "Session, transport and telemetry fabric for a browser control-plane server")]
struct Args {
    /// Path to a TOML config file (overrides the usual discovery order).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        e.print_json_stderr();
        #[allow(clippy::cast_possible_truncation)]
        std::process::exit(e.code as i32);
    }
}

async fn run() -> Result<(), AppError> {
    let args = Args::parse();
    init_logging();

    let (config_path, config_file) = config::load_config(args.config.as_deref());
    let cfg = config::resolve_config(&config_file, config_path, None)?;

    // `AgentMemory::new` loads whatever is already on disk at `persist_path`
    // itself; there is no separate load step.
    let agent_memory = Arc::new(AgentMemory::new(
        Some(cfg.artifact_max_chars),
        cfg.agent_memory_dir.clone().map(|dir| dir.join("agent_memory.json")),
    ));

    let backend = build_backend(&cfg).await?;
    let session_manager = Arc::new(SessionManager::new(cfg.clone(), backend, agent_memory));

    let artifacts_root = PathBuf::from("data/artifacts");
    let artifacts = Arc::new(
        ArtifactStore::new(artifacts_root, None)
            .map_err(|e| AppError::new(ExitCode::GeneralError, e.to_string()))?,
    );

    let ctx = Arc::new(ServerContext { session_manager, artifacts });
    let registry = Arc::new(EmptyToolRegistry);

    tracing::info!(mode = ?cfg.mode, "browser-mcp-core ready; serving json-rpc on stdio");
    serve(tokio::io::stdin(), tokio::io::stdout(), ctx, registry).await;
    Ok(())
}

fn init_logging() {
    // stdout is reserved for the JSON-RPC stream; all diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();
}

/// Picks the backend the whole session manager runs on, per §4.8: `launch`
/// and `attach` both reach the browser over a direct CDP WebSocket (`launch`
/// may first spawn Chrome if nothing answers on the configured port);
/// `extension` mode prefers a native-messaging broker when one is
/// discoverable, falling back to the WebSocket extension gateway.
async fn build_backend(cfg: &BrowserConfig) -> Result<Backend, AppError> {
    match cfg.mode {
        BrowserMode::Launch | BrowserMode::Attach => {
            if chrome::query_version("127.0.0.1", cfg.port).await.is_err() {
                if cfg.mode == BrowserMode::Attach {
                    return Err(AppError::new(
                        ExitCode::ConnectionError,
                        format!("attach mode: no browser listening on port {}", cfg.port),
                    ));
                }
                launch_browser(cfg).await?;
            }
            Ok(Backend::Direct { host: "127.0.0.1".to_string(), port: cfg.port })
        }
        BrowserMode::Extension => Ok(build_extension_backend(cfg).await),
    }
}

async fn launch_browser(cfg: &BrowserConfig) -> Result<(), AppError> {
    let executable = match &cfg.binary {
        Some(path) => path.clone(),
        None => chrome::find_chrome_executable(chrome::Channel::Stable)
            .map_err(|e| AppError::new(ExitCode::ConnectionError, e.to_string()))?,
    };
    let launch_cfg = chrome::LaunchConfig {
        executable,
        port: cfg.port,
        headless: false,
        extra_args: Vec::new(),
        user_data_dir: cfg.profile.clone(),
    };
    chrome::launch_chrome(launch_cfg, STARTUP_PROBE_TIMEOUT.max(Duration::from_millis(cfg.http_timeout_ms)))
        .await
        .map_err(|e| AppError::new(ExitCode::ConnectionError, e.to_string()))?
        .detach();
    Ok(())
}

/// Tries the native broker first (portless, preferred when the extension
/// launched one), then falls back to the WebSocket extension gateway
/// (leader-or-peer, chosen by [`SharedExtensionGateway`]'s file-lock
/// election). Both paths degrade gracefully: if neither is reachable yet,
/// the gateway keeps retrying in the background and tool calls simply time
/// out with `NotConfigured` until an extension attaches.
async fn build_extension_backend(cfg: &BrowserConfig) -> Backend {
    if let Some(explicit_socket) = &cfg.native_broker_socket {
        if let Ok(peer) = NativePeer::connect(explicit_socket, None, Duration::from_millis(cfg.extension_connect_timeout_ms)).await {
            tracing::info!(socket = %explicit_socket.display(), "connected to native broker via explicit socket");
            return Backend::Native(Arc::new(peer));
        }
    } else if let Some(registration) = discover_best_broker() {
        if let Ok(peer) = NativePeer::connect(&registration.socket_path, None, Duration::from_millis(cfg.extension_connect_timeout_ms)).await {
            tracing::info!(broker_id = %registration.broker_id, "connected to discovered native broker");
            return Backend::Native(Arc::new(peer));
        }
    }
    let _ = runtime_dir(); // ensure the registry directory exists for future discovery

    let candidate_ports = expand_port_candidates(cfg.extension_port, cfg.extension_port_span, cfg.extension_port_range);
    let lock_path = agent_data_dir().join("gateway.lock");
    let gateway = SharedExtensionGateway::start(SharedExtensionGatewayConfig {
        host: cfg.extension_host.clone(),
        candidate_ports,
        expected_extension_id: cfg.extension_id.clone(),
        server_version: cfg.server_version.clone(),
        peer_id: None,
        lock_path,
    });
    Backend::Extension(Arc::new(gateway))
}

fn agent_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("browser-mcp")
}
