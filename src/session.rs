//! Session manager: the single facade every tool handler talks to. Owns the
//! one browser tab this server instance drives, picks the right
//! [`CdpLikeConnection`] backend for the configured mode, and composes the
//! bounded cross-cutting state (telemetry, affordances, nav graph, agent
//! memory, captcha cache, download/diagnostics readiness) that tool
//! handlers need without touching CDP directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::time::{Duration, Instant};

use crate::affordance::AffordanceMap;
use crate::auto_dialog::AutoDialogHandler;
use crate::cdp::error::CdpError;
use crate::cdp::types::CdpEvent;
use crate::chrome;
use crate::config::{BrowserConfig, BrowserMode};
use crate::conn::direct::DirectCdpConnection;
use crate::conn::extension::ExtensionCdpConnection;
use crate::conn::native::NativeCdpConnection;
use crate::conn::{BatchCommand, CdpLikeConnection};
use crate::error::{CoreError, ErrorKind};
use crate::gateway::ExtensionGatewayApi;
use crate::memory::AgentMemory;
use crate::native::NativePeerApi;
use crate::navgraph::NavGraph;
use crate::policy::{Policy, PolicyMode, sanitize_broker_id};
use crate::telemetry::Tier0Telemetry;
use crate::tier0::{IngestFn, Tier0Bus};
use crate::util::now_ms;

const DIAGNOSTICS_CACHE_MS: u64 = 10_000;
const DOWNLOADS_CACHE_MS: u64 = 30_000;
const DEFAULT_CAPTCHA_MAX_AGE_MS: u64 = 90_000;

/// Opaque placeholder for the in-page diagnostics bootstrap, a Tier-1
/// instrumentation script owned by a different part of the system and
/// treated here purely as a versioned string to inject and availability-check.
const DIAGNOSTICS_VERSION: &str = "1";
fn diagnostics_bootstrap_js() -> String {
    format!(
        "(function(){{ if (!globalThis.__mcpDiag) {{ globalThis.__mcpDiag = {{ __version: \"{DIAGNOSTICS_VERSION}\", snapshot: function(){{ return {{}}; }} }}; }} }})();"
    )
}
const DIAGNOSTICS_AVAILABILITY_PROBE: &str = concat!(
    "(globalThis.__mcpDiag && globalThis.__mcpDiag.__version === \"1\" && ",
    "typeof globalThis.__mcpDiag.snapshot === 'function') === true"
);

/// Domains a [`BrowserSession`] may enable. Enables are idempotent and
/// cached on the session so repeated tool calls don't re-send them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Page,
    Runtime,
    Dom,
    Network,
    Log,
    Performance,
}

impl Domain {
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::Page => "Page.enable",
            Self::Runtime => "Runtime.enable",
            Self::Dom => "DOM.enable",
            Self::Network => "Network.enable",
            Self::Log => "Log.enable",
            Self::Performance => "Performance.enable",
        }
    }
}

#[derive(Default)]
struct DomainFlags {
    page: bool,
    runtime: bool,
    dom: bool,
    network: bool,
    log: bool,
    performance: bool,
}

impl DomainFlags {
    fn get(&self, d: Domain) -> bool {
        match d {
            Domain::Page => self.page,
            Domain::Runtime => self.runtime,
            Domain::Dom => self.dom,
            Domain::Network => self.network,
            Domain::Log => self.log,
            Domain::Performance => self.performance,
        }
    }

    fn set(&mut self, d: Domain, v: bool) {
        match d {
            Domain::Page => self.page = v,
            Domain::Runtime => self.runtime = v,
            Domain::Dom => self.dom = v,
            Domain::Network => self.network = v,
            Domain::Log => self.log = v,
            Domain::Performance => self.performance = v,
        }
    }
}

fn timeout_error(e: CdpError) -> CoreError {
    match e {
        CdpError::CommandTimeout { method } => CoreError::timeout(format!("{method} timed out")),
        CdpError::ConnectionTimeout => CoreError::timeout("connection timed out"),
        CdpError::Protocol { code, message } => {
            CoreError::new(ErrorKind::ProtocolViolation, format!("cdp error {code}: {message}"), "check the call's arguments")
        }
        other => CoreError::transport(other.to_string()),
    }
}

/// Handle to one tab. Owns its `CdpLikeConnection` exclusively; never
/// shared outside a [`SharedSessionGuard`] scope without explicit cloning of
/// the `Arc`.
pub struct BrowserSession {
    pub conn: Arc<dyn CdpLikeConnection>,
    pub tab_id: String,
    /// Set only for direct-mode sessions, where Tier-0 needs a raw ws url.
    pub ws_url: Option<String>,
    last_url: Mutex<Option<String>>,
    domains: Mutex<DomainFlags>,
}

impl BrowserSession {
    #[must_use]
    pub fn new(conn: Arc<dyn CdpLikeConnection>, tab_id: impl Into<String>, ws_url: Option<String>) -> Self {
        Self {
            conn,
            tab_id: tab_id.into(),
            ws_url,
            last_url: Mutex::new(None),
            domains: Mutex::new(DomainFlags::default()),
        }
    }

    #[must_use]
    pub fn last_url(&self) -> Option<String> {
        self.last_url.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub fn set_last_url(&self, url: impl Into<String>) {
        *self.last_url.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(url.into());
    }

    /// Enables `domain` unless it was already enabled on this session.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError`] if the underlying `send` fails.
    pub async fn enable_domain(&self, domain: Domain, timeout: Duration) -> Result<(), CoreError> {
        {
            let flags = self.domains.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if flags.get(domain) {
                return Ok(());
            }
        }
        self.conn.send(domain.method(), None, timeout).await.map_err(timeout_error)?;
        self.domains.lock().unwrap_or_else(std::sync::PoisonError::into_inner).set(domain, true);
        Ok(())
    }

    /// Never hangs: delegates straight to `abort`, per the ban on graceful
    /// close for session teardown (a dialog-wedged connection may never
    /// complete a close handshake).
    pub async fn close(&self) {
        self.conn.abort().await;
    }
}

/// Chooses how the manager reaches the browser. One instance per process.
pub enum Backend {
    Direct { host: String, port: u16 },
    Extension(Arc<dyn ExtensionGatewayApi>),
    Native(Arc<dyn NativePeerApi>),
}

impl Backend {
    fn is_proxy(&self) -> bool {
        matches!(self, Self::Extension(g) if g.is_proxy())
    }
}

struct TabEntry {
    telemetry: Arc<Mutex<Tier0Telemetry>>,
    affordances: Arc<AffordanceMap>,
    navgraph: Arc<NavGraph>,
    captcha: Option<(u64, Value)>,
    diagnostics_checked_at: Option<Instant>,
    downloads_set_at: Option<Instant>,
}

impl TabEntry {
    fn new() -> Self {
        Self {
            telemetry: Arc::new(Mutex::new(Tier0Telemetry::new(
                crate::telemetry::DEFAULT_MAX_EVENTS,
                crate::telemetry::DEFAULT_MAX_REQUEST_MAP,
            ))),
            affordances: Arc::new(AffordanceMap::new()),
            navgraph: Arc::new(NavGraph::new()),
            captcha: None,
            diagnostics_checked_at: None,
            downloads_set_at: None,
        }
    }
}

struct SharedState {
    session: Arc<BrowserSession>,
    refcount: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoverResetResult {
    pub cleared_session_tab_id: Option<String>,
    pub shared_session_closed: bool,
    pub stopped_tier0_buses: usize,
}

/// Holds the shared session's `Arc` alive for the scope's lifetime and
/// releases it (or tears it down, once the last holder drops) on `Drop`.
pub struct SharedSessionGuard<'a> {
    manager: &'a SessionManager,
    pub session: Arc<BrowserSession>,
}

impl Drop for SharedSessionGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_shared();
    }
}

/// Singleton facade composing connection, telemetry, affordances, nav
/// graph, agent memory and recovery behind a minimal API for tool handlers.
pub struct SessionManager {
    config: BrowserConfig,
    backend: Backend,
    policy: Policy,
    session_tab_id: Mutex<Option<String>>,
    tabs: Mutex<HashMap<String, TabEntry>>,
    buses: Mutex<HashMap<String, Tier0Bus>>,
    shared: Mutex<Option<SharedState>>,
    agent_memory: Arc<AgentMemory>,
    auto_dialog: AutoDialogHandler,
    auto_dialog_mode: Mutex<HashMap<String, bool>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: BrowserConfig, backend: Backend, agent_memory: Arc<AgentMemory>) -> Self {
        let policy = Policy::new(config.policy_mode, config.allow_hosts.clone());
        Self {
            config,
            backend,
            policy,
            session_tab_id: Mutex::new(None),
            tabs: Mutex::new(HashMap::new()),
            buses: Mutex::new(HashMap::new()),
            shared: Mutex::new(None),
            agent_memory,
            auto_dialog: AutoDialogHandler::new(),
            auto_dialog_mode: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    // --- policy ------------------------------------------------------

    #[must_use]
    pub fn get_policy(&self) -> PolicyMode {
        self.policy.get()
    }

    pub fn set_policy(&self, mode: PolicyMode) {
        self.policy.set(mode);
    }

    #[must_use]
    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.policy.is_host_allowed(host)
    }

    // --- tab ownership -------------------------------------------------

    /// Mode-aware tab acquisition. Creates a fresh tab the first time it's
    /// called; otherwise returns the remembered id unchanged.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError`] if the backend cannot create or validate a
    /// tab (extension disconnected, browser unreachable, etc).
    pub async fn ensure_session_tab(&self, timeout: Duration) -> Result<String, CoreError> {
        if let Some(id) = self.session_tab_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() {
            return Ok(id);
        }
        let tab_id = self.create_tab(timeout).await?;
        *self.session_tab_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tab_id.clone());
        Ok(tab_id)
    }

    async fn create_tab(&self, timeout: Duration) -> Result<String, CoreError> {
        match &self.backend {
            Backend::Direct { host, port } => {
                let version = chrome::query_version(host, *port).await.map_err(|e| CoreError::transport(e.to_string()))?;
                let browser_conn = DirectCdpConnection::open(&version.ws_debugger_url, timeout).await.map_err(timeout_error)?;
                let result = browser_conn
                    .send("Target.createTarget", Some(serde_json::json!({ "url": "about:blank" })), timeout)
                    .await
                    .map_err(timeout_error);
                browser_conn.abort().await;
                let result = result?;
                result
                    .get("targetId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| CoreError::new(ErrorKind::ProtocolViolation, "Target.createTarget returned no targetId", "retry; the browser may be starting up"))
            }
            Backend::Extension(gateway) => {
                let result = gateway.rpc_call("tabs.create", serde_json::json!({ "url": "about:blank", "active": true }), timeout).await?;
                extract_tab_id(&result)
            }
            Backend::Native(peer) => {
                let result = peer.rpc_call("tabs.create", serde_json::json!({ "url": "about:blank", "active": true }), timeout).await?;
                extract_tab_id(&result)
            }
        }
    }

    /// Whether adopting the extension's already-focused tab is appropriate:
    /// never on a peer, never when the caller forced a new tab, never onto
    /// an internal `chrome://`/`chrome-extension://` page.
    #[must_use]
    pub fn should_adopt_active_tab(&self, focused_url: Option<&str>) -> bool {
        if self.backend.is_proxy() || self.config.extension_force_new_tab {
            return false;
        }
        match focused_url {
            Some(url) => !(url.starts_with("chrome://") || url.starts_with("chrome-extension://")),
            None => false,
        }
    }

    /// Builds a fresh [`BrowserSession`] over the configured backend,
    /// acquiring the session tab first.
    ///
    /// # Errors
    ///
    /// Propagates [`ensure_session_tab`](Self::ensure_session_tab)'s errors.
    pub async fn get_session(&self, timeout: Duration) -> Result<BrowserSession, CoreError> {
        let tab_id = self.ensure_session_tab(timeout).await?;
        self.connection_for(&tab_id, timeout).await
    }

    async fn connection_for(&self, tab_id: &str, timeout: Duration) -> Result<BrowserSession, CoreError> {
        match &self.backend {
            Backend::Direct { host, port } => {
                let targets = chrome::query_targets(host, *port).await.map_err(|e| CoreError::transport(e.to_string()))?;
                let target = targets.into_iter().find(|t| t.id == tab_id).ok_or_else(|| CoreError::not_found(format!("tab {tab_id} no longer exists")))?;
                let ws_url = target.ws_debugger_url.ok_or_else(|| CoreError::transport("target has no websocket debugger url"))?;
                let conn = DirectCdpConnection::open(&ws_url, timeout).await.map_err(timeout_error)?;
                Ok(BrowserSession::new(Arc::new(conn), tab_id, Some(ws_url)))
            }
            Backend::Extension(gateway) => Ok(BrowserSession::new(Arc::new(ExtensionCdpConnection::new(Arc::clone(gateway), tab_id)), tab_id, None)),
            Backend::Native(peer) => Ok(BrowserSession::new(Arc::new(NativeCdpConnection::new(Arc::clone(peer), tab_id)), tab_id, None)),
        }
    }

    // --- shared (reentrant) session ------------------------------------

    /// Reentrant scoped resource: the first caller opens the connection,
    /// enables `Page`, and ensures diagnostics are injected; nested callers
    /// within the same scope reuse the same connection via a refcount.
    ///
    /// # Errors
    ///
    /// Propagates [`get_session`](Self::get_session)'s errors.
    pub async fn shared_session(&self, timeout: Duration) -> Result<SharedSessionGuard<'_>, CoreError> {
        {
            let mut guard = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = guard.as_mut() {
                state.refcount += 1;
                return Ok(SharedSessionGuard { manager: self, session: Arc::clone(&state.session) });
            }
        }
        let session = Arc::new(self.get_session(timeout).await?);
        session.enable_domain(Domain::Page, timeout).await?;
        self.ensure_diagnostics(&session, timeout).await?;
        *self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(SharedState { session: Arc::clone(&session), refcount: 1 });
        Ok(SharedSessionGuard { manager: self, session })
    }

    fn release_shared(&self) {
        let mut guard = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let should_clear = guard.as_mut().is_some_and(|state| {
            state.refcount = state.refcount.saturating_sub(1);
            state.refcount == 0
        });
        if should_clear {
            *guard = None;
        }
    }

    // --- diagnostics / downloads / telemetry ---------------------------

    /// Ensures the Tier-1 in-page diagnostics bootstrap is present, caching
    /// a positive result for [`DIAGNOSTICS_CACHE_MS`]. The cached result is
    /// always re-probed with a strict `=== true` check rather than trusted
    /// blindly, since a full navigation can wipe page globals silently.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError`] if the underlying CDP calls fail.
    pub async fn ensure_diagnostics(&self, session: &BrowserSession, timeout: Duration) -> Result<(), CoreError> {
        if !self.config.diagnostics_enabled {
            return Ok(());
        }
        let fresh = {
            let tabs = self.tabs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            tabs.get(&session.tab_id).and_then(|t| t.diagnostics_checked_at).is_some_and(|at| at.elapsed() < Duration::from_millis(DIAGNOSTICS_CACHE_MS))
        };
        if fresh && self.probe_diagnostics(session, timeout).await {
            return Ok(());
        }
        let available = self.probe_diagnostics(session, timeout).await;
        if !available {
            session
                .conn
                .send("Page.addScriptToEvaluateOnNewDocument", Some(serde_json::json!({ "source": diagnostics_bootstrap_js() })), timeout)
                .await
                .map_err(timeout_error)?;
            session.conn.send("Runtime.evaluate", Some(serde_json::json!({ "expression": diagnostics_bootstrap_js() })), timeout).await.map_err(timeout_error)?;
        }
        self.tab_entry_mut(&session.tab_id, |t| t.diagnostics_checked_at = Some(Instant::now()));
        Ok(())
    }

    async fn probe_diagnostics(&self, session: &BrowserSession, timeout: Duration) -> bool {
        session
            .conn
            .send("Runtime.evaluate", Some(serde_json::json!({ "expression": DIAGNOSTICS_AVAILABILITY_PROBE })), timeout)
            .await
            .ok()
            .is_some_and(|v| v.get("result").and_then(|r| r.get("value")).and_then(Value::as_bool) == Some(true))
    }

    /// Starts (or reuses) this tab's telemetry sink. In direct mode, spawns
    /// a [`Tier0Bus`] keyed by `(tab_id, ws_url)`, replacing it if the url
    /// changed. In extension/native mode, registers an event sink on the
    /// connection instead, since events already arrive via gateway fan-out.
    pub fn ensure_telemetry(&self, session: &BrowserSession) -> Arc<Mutex<Tier0Telemetry>> {
        let telemetry = {
            let mut tabs = self.tabs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(&tabs.entry(session.tab_id.clone()).or_insert_with(TabEntry::new).telemetry)
        };

        if !self.config.tier0_enabled {
            return telemetry;
        }

        if let Some(ws_url) = &session.ws_url {
            let mut buses = self.buses.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let needs_replace = buses.get(&session.tab_id).is_none_or(|b| b.ws_url() != ws_url);
            if needs_replace {
                let ingest_telemetry = Arc::clone(&telemetry);
                let ingest: IngestFn = Box::new(move |method, params| {
                    ingest_telemetry.lock().unwrap_or_else(std::sync::PoisonError::into_inner).ingest(method, params);
                });
                buses.insert(session.tab_id.clone(), Tier0Bus::spawn(ws_url.clone(), session.tab_id.clone(), ingest));
            }
        } else {
            let ingest_telemetry = Arc::clone(&telemetry);
            session.conn.set_event_sink(Some(Box::new(move |event: &CdpEvent| {
                ingest_telemetry.lock().unwrap_or_else(std::sync::PoisonError::into_inner).ingest(&event.method, &event.params);
            })));
        }
        telemetry
    }

    /// Sets download behavior for this tab to `allow` at a per-tab
    /// directory, cached for [`DOWNLOADS_CACHE_MS`].
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError`] if creating the download directory fails.
    pub async fn ensure_downloads(&self, session: &BrowserSession, timeout: Duration) -> Result<PathBuf, CoreError> {
        let dir = self.download_dir_for(&session.tab_id);
        if !self.config.downloads_enabled {
            return Ok(dir);
        }
        let fresh = {
            let tabs = self.tabs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            tabs.get(&session.tab_id).and_then(|t| t.downloads_set_at).is_some_and(|at| at.elapsed() < Duration::from_millis(DOWNLOADS_CACHE_MS))
        };
        if fresh {
            return Ok(dir);
        }
        std::fs::create_dir_all(&dir).map_err(|e| CoreError::new(ErrorKind::TransportFailure, e.to_string(), "check filesystem permissions"))?;
        let params = serde_json::json!({ "behavior": "allow", "downloadPath": dir.to_string_lossy() });
        if session.conn.send("Page.setDownloadBehavior", Some(params.clone()), timeout).await.is_err() {
            // Fallback: some backends only expose the browser-level method.
            let _ = session.conn.send("Browser.setDownloadBehavior", Some(params), timeout).await;
        }
        self.tab_entry_mut(&session.tab_id, |t| t.downloads_set_at = Some(Instant::now()));
        Ok(dir)
    }

    fn download_dir_for(&self, tab_id: &str) -> PathBuf {
        let base = self.config.download_dir.clone().unwrap_or_else(|| PathBuf::from("data/downloads"));
        base.join(sanitize_broker_id(tab_id))
    }

    fn tab_entry_mut<R>(&self, tab_id: &str, f: impl FnOnce(&mut TabEntry) -> R) -> R {
        let mut tabs = self.tabs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(tabs.entry(tab_id.to_string()).or_insert_with(TabEntry::new))
    }

    // --- affordances / nav graph / agent memory / captcha --------------

    #[must_use]
    pub fn affordances(&self, tab_id: &str) -> Arc<AffordanceMap> {
        self.tab_entry_mut(tab_id, |t| Arc::clone(&t.affordances))
    }

    #[must_use]
    pub fn navgraph(&self, tab_id: &str) -> Arc<NavGraph> {
        self.tab_entry_mut(tab_id, |t| Arc::clone(&t.navgraph))
    }

    #[must_use]
    pub fn agent_memory(&self) -> &AgentMemory {
        &self.agent_memory
    }

    pub fn set_captcha_state(&self, tab_id: &str, state: Value) {
        self.tab_entry_mut(tab_id, |t| t.captcha = Some((now_ms(), state)));
    }

    #[must_use]
    pub fn get_captcha_state(&self, tab_id: &str, max_age_ms: Option<u64>) -> Option<Value> {
        let max_age = max_age_ms.unwrap_or(DEFAULT_CAPTCHA_MAX_AGE_MS);
        let mut tabs = self.tabs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = tabs.get_mut(tab_id)?;
        let (ts, value) = entry.captcha.clone()?;
        if now_ms().saturating_sub(ts) > max_age {
            entry.captcha = None;
            return None;
        }
        Some(value)
    }

    // --- auto-dialog coupling ------------------------------------------

    /// Sets or clears this tab's auto-dialog mode (`true` = accept, `false`
    /// = dismiss, absent = no auto-handling).
    pub fn set_auto_dialog_mode(&self, tab_id: &str, accept: Option<bool>) {
        let mut modes = self.auto_dialog_mode.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match accept {
            Some(a) => {
                modes.insert(tab_id.to_string(), a);
            }
            None => {
                modes.remove(tab_id);
            }
        }
    }

    #[must_use]
    pub fn auto_dialog_mode(&self, tab_id: &str) -> Option<bool> {
        self.auto_dialog_mode.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(tab_id).copied()
    }

    /// Called when telemetry observes `Page.javascriptDialogOpening` for a
    /// tab with an active auto-dialog mode. Best-effort; failures are
    /// swallowed by [`AutoDialogHandler::dismiss`] itself.
    pub async fn handle_auto_dialog(&self, tab_id: &str, ws_url: &str) {
        if let Some(accept) = self.auto_dialog_mode(tab_id) {
            let _ = self.auto_dialog.dismiss(tab_id, ws_url, accept, None).await;
        }
    }

    // --- recovery --------------------------------------------------------

    /// Clears all in-memory caches and stops every Tier-0 bus without
    /// issuing a single CDP call — safe even against a wedged browser.
    pub fn recover_reset(&self) -> RecoverResetResult {
        let cleared_session_tab_id = self.session_tab_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();

        let shared_session_closed = self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take().is_some();

        let mut buses = self.buses.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let stopped_tier0_buses = buses.len();
        for (_, bus) in buses.drain() {
            bus.stop();
        }
        drop(buses);

        self.tabs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        self.auto_dialog_mode.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();

        RecoverResetResult { cleared_session_tab_id, shared_session_closed, stopped_tier0_buses }
    }

    /// Rescue recovery: forgets the current tab (without restarting the
    /// browser) so the next [`ensure_session_tab`](Self::ensure_session_tab)
    /// call creates a fresh one; optionally closes the old tab best-effort
    /// first.
    ///
    /// # Errors
    ///
    /// Propagates [`ensure_session_tab`](Self::ensure_session_tab)'s errors
    /// from creating the replacement tab.
    pub async fn rescue(&self, old_session: Option<&BrowserSession>, timeout: Duration) -> Result<String, CoreError> {
        if let Some(session) = old_session {
            session.close().await;
        }
        *self.session_tab_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.ensure_session_tab(timeout).await
    }

    /// Hard recovery: relaunches the browser (only meaningful in `launch`
    /// mode) and then performs a rescue. In any other mode this degrades to
    /// a plain rescue, since the server never owns the browser process.
    ///
    /// # Errors
    ///
    /// Returns a [`CoreError`] if relaunching fails, or whatever
    /// [`rescue`](Self::rescue) returns.
    pub async fn hard_recover(&self, old_session: Option<&BrowserSession>, timeout: Duration) -> Result<String, CoreError> {
        self.recover_reset();
        if self.config.mode == BrowserMode::Launch {
            let executable = self
                .config
                .binary
                .clone()
                .or_else(|| chrome::find_chrome_executable(chrome::Channel::Stable).ok())
                .ok_or_else(|| CoreError::new(ErrorKind::NotConfigured, "no chrome binary configured or discoverable", "set MCP_BROWSER_BINARY"))?;
            let launch_cfg = chrome::LaunchConfig {
                executable,
                port: self.config.port,
                headless: false,
                extra_args: Vec::new(),
                user_data_dir: self.config.profile.clone(),
            };
            chrome::launch_chrome(launch_cfg, Duration::from_millis(self.config.http_timeout_ms.max(10_000)))
                .await
                .map_err(|e| CoreError::transport(e.to_string()))?
                .detach();
        }
        self.rescue(old_session, timeout).await
    }

    // --- §4.11 soft-heal --------------------------------------------------

    /// Smoke-probes the current connection and, if it fails, a fresh one;
    /// if both are bricked, performs the soft-heal sequence: reset caches,
    /// best-effort close the old tab, open a new one at the last observed
    /// URL (or `about:blank`).
    ///
    /// # Errors
    ///
    /// Propagates [`ensure_session_tab`](Self::ensure_session_tab)'s errors
    /// from opening the replacement tab.
    pub async fn soft_heal_if_bricked(&self, session: &BrowserSession, probe_timeout: Duration) -> Result<Option<RecoveredInfo>, CoreError> {
        if smoke_probe(session.conn.as_ref(), probe_timeout).await {
            return Ok(None);
        }
        let fresh = self.get_session(probe_timeout).await;
        let fresh_ok = match &fresh {
            Ok(s) => smoke_probe(s.conn.as_ref(), probe_timeout).await,
            Err(_) => false,
        };
        if fresh_ok {
            return Ok(None);
        }

        let restored_url = session.last_url();
        self.recover_reset();
        session.close().await;
        let restore_target = restored_url.unwrap_or_else(|| "about:blank".to_string());
        let new_tab_id = self.ensure_session_tab(probe_timeout).await?;
        Ok(Some(RecoveredInfo { mode: "soft".to_string(), ok: true, session_tab_id: new_tab_id, restored_url: Some(restore_target) }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredInfo {
    pub mode: String,
    pub ok: bool,
    pub session_tab_id: String,
    pub restored_url: Option<String>,
}

async fn smoke_probe(conn: &dyn CdpLikeConnection, timeout: Duration) -> bool {
    conn.send("Runtime.evaluate", Some(serde_json::json!({ "expression": "1" })), timeout).await.is_ok()
}

fn extract_tab_id(result: &Value) -> Result<String, CoreError> {
    result
        .get("id")
        .or_else(|| result.get("tabId"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| result.get("id").and_then(Value::as_i64).map(|n| n.to_string()))
        .ok_or_else(|| CoreError::new(ErrorKind::ProtocolViolation, "tabs.create returned no tab id", "check the extension's tabs.create response shape"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// Minimal stub connection for exercising session-manager logic without
    /// a real Chrome: `send` returns whatever's queued for the method, or a
    /// default success value.
    struct StubConnection {
        calls: AtomicUsize,
        evaluate_result: AsyncMutex<Option<Value>>,
    }

    impl StubConnection {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), evaluate_result: AsyncMutex::new(None) }
        }
    }

    #[async_trait]
    impl CdpLikeConnection for StubConnection {
        async fn send(&self, method: &str, _params: Option<Value>, _timeout: Duration) -> Result<Value, CdpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if method == "Runtime.evaluate" {
                if let Some(v) = self.evaluate_result.lock().await.clone() {
                    return Ok(v);
                }
            }
            Ok(Value::Object(serde_json::Map::new()))
        }

        async fn send_many(&self, commands: Vec<BatchCommand>, _stop_on_error: bool, timeout: Duration) -> Vec<Result<Value, CdpError>> {
            let mut out = Vec::new();
            for cmd in commands {
                out.push(self.send(&cmd.method, cmd.params, timeout).await);
            }
            out
        }

        async fn wait_for_event(&self, _name: Option<&str>, _timeout: Duration) -> Option<CdpEvent> {
            None
        }

        fn pop_event(&self, _name: Option<&str>) -> Option<CdpEvent> {
            None
        }

        fn drain_events(&self, _max: usize) -> usize {
            0
        }

        fn set_event_sink(&self, _sink: Option<Box<dyn Fn(&CdpEvent) + Send + Sync>>) {}

        async fn abort(&self) {}
    }

    fn manager() -> SessionManager {
        SessionManager::new(BrowserConfig::default(), Backend::Direct { host: "127.0.0.1".into(), port: 9222 }, Arc::new(AgentMemory::new(None, None)))
    }

    #[tokio::test]
    async fn enable_domain_is_idempotent() {
        let stub = Arc::new(StubConnection::new());
        let conn: Arc<dyn CdpLikeConnection> = Arc::clone(&stub) as Arc<dyn CdpLikeConnection>;
        let session = BrowserSession::new(conn, "tab-1", None);
        session.enable_domain(Domain::Page, Duration::from_secs(1)).await.unwrap();
        session.enable_domain(Domain::Page, Duration::from_secs(1)).await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1, "second enable_domain call must be a no-op");
    }

    #[test]
    fn should_adopt_active_tab_rejects_internal_urls() {
        let mgr = manager();
        assert!(!mgr.should_adopt_active_tab(Some("chrome://settings")));
        assert!(!mgr.should_adopt_active_tab(Some("chrome-extension://abc/popup.html")));
        assert!(mgr.should_adopt_active_tab(Some("https://example.com/")));
        assert!(!mgr.should_adopt_active_tab(None));
    }

    #[test]
    fn should_adopt_active_tab_respects_force_new_tab() {
        let cfg = BrowserConfig { extension_force_new_tab: true, ..BrowserConfig::default() };
        let mgr = SessionManager::new(cfg, Backend::Direct { host: "127.0.0.1".into(), port: 9222 }, Arc::new(AgentMemory::new(None, None)));
        assert!(!mgr.should_adopt_active_tab(Some("https://example.com/")));
    }

    #[test]
    fn policy_accessors_round_trip() {
        let mgr = manager();
        assert_eq!(mgr.get_policy(), PolicyMode::Permissive);
        mgr.set_policy(PolicyMode::Strict);
        assert_eq!(mgr.get_policy(), PolicyMode::Strict);
    }

    #[test]
    fn captcha_state_expires_after_max_age() {
        let mgr = manager();
        mgr.set_captcha_state("tab-1", serde_json::json!({"grid": [1, 2, 3]}));
        assert!(mgr.get_captcha_state("tab-1", Some(60_000)).is_some());
        assert!(mgr.get_captcha_state("tab-1", Some(0)).is_none(), "zero max age must treat any entry as stale");
    }

    #[test]
    fn affordances_and_navgraph_are_stable_per_tab() {
        let mgr = manager();
        let a1 = mgr.affordances("tab-1");
        let a2 = mgr.affordances("tab-1");
        assert!(Arc::ptr_eq(&a1, &a2));
        let n1 = mgr.navgraph("tab-1");
        let n2 = mgr.navgraph("tab-1");
        assert!(Arc::ptr_eq(&n1, &n2));
    }

    #[test]
    fn recover_reset_clears_tab_and_auto_dialog_state() {
        let mgr = manager();
        mgr.affordances("tab-1");
        mgr.set_auto_dialog_mode("tab-1", Some(true));
        *mgr.session_tab_id.lock().unwrap() = Some("tab-1".to_string());

        let result = mgr.recover_reset();
        assert_eq!(result.cleared_session_tab_id, Some("tab-1".to_string()));
        assert!(mgr.auto_dialog_mode("tab-1").is_none());
        assert!(mgr.session_tab_id.lock().unwrap().is_none());
    }

    #[test]
    fn auto_dialog_mode_round_trips_and_clears() {
        let mgr = manager();
        assert!(mgr.auto_dialog_mode("tab-1").is_none());
        mgr.set_auto_dialog_mode("tab-1", Some(false));
        assert_eq!(mgr.auto_dialog_mode("tab-1"), Some(false));
        mgr.set_auto_dialog_mode("tab-1", None);
        assert!(mgr.auto_dialog_mode("tab-1").is_none());
    }

    #[tokio::test]
    async fn soft_heal_is_a_noop_when_probe_succeeds() {
        let mgr = manager();
        let conn: Arc<dyn CdpLikeConnection> = Arc::new(StubConnection::new());
        let session = BrowserSession::new(conn, "tab-1", None);
        let outcome = mgr.soft_heal_if_bricked(&session, Duration::from_millis(50)).await.unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn extract_tab_id_reads_string_or_numeric_id() {
        assert_eq!(extract_tab_id(&serde_json::json!({"id": "42"})).unwrap(), "42");
        assert_eq!(extract_tab_id(&serde_json::json!({"tabId": "t9"})).unwrap(), "t9");
        assert!(extract_tab_id(&serde_json::json!({})).is_err());
    }
}
