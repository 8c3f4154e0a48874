//! Layered configuration for the browser control-plane server: built-in
//! defaults, then an optional TOML file, then environment variables, each
//! layer overriding the last — the same priority chain the teacher CLI used
//! for its own `ResolvedConfig`, generalized from one-shot flags to the
//! long-lived settings a daemon needs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, ExitCode};

/// Default config file template, used by `config init`-style bootstrapping
/// (kept for operators who want a starting point on disk).
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# browser-mcp-core configuration file

# [browser]
# mode = "launch"            # launch, attach, extension
# binary = "/path/to/chrome"
# profile = "/path/to/profile"
# port = 9222
# allow_hosts = ["example.com"]
# http_timeout_ms = 10000
# http_max_bytes = 2000000

# [extension]
# host = "127.0.0.1"
# port = 8765
# port_span = 10
# extension_id = ""
# connect_timeout_ms = 5000
# rpc_timeout_ms = 10000
# force_new_tab = false
# auto_launch = false

# [policy]
# mode = "permissive"         # permissive, strict
"#;

/// Chrome's conventional `--remote-debugging-port` default.
const DEFAULT_CDP_PORT: u16 = 9222;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    Launch,
    Attach,
    Extension,
}

impl Default for BrowserMode {
    fn default() -> Self {
        Self::Launch
    }
}

impl std::str::FromStr for BrowserMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "launch" => Ok(Self::Launch),
            "attach" => Ok(Self::Attach),
            "extension" => Ok(Self::Extension),
            other => Err(format!("unknown browser mode: {other}")),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub browser: BrowserFileConfig,
    pub extension: ExtensionFileConfig,
    pub policy: PolicyFileConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserFileConfig {
    pub mode: Option<String>,
    pub binary: Option<String>,
    pub profile: Option<String>,
    pub port: Option<u16>,
    pub allow_hosts: Option<Vec<String>>,
    pub http_timeout_ms: Option<u64>,
    pub http_max_bytes: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtensionFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub port_span: Option<u16>,
    pub port_range: Option<String>,
    pub extension_id: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub rpc_timeout_ms: Option<u64>,
    pub force_new_tab: Option<bool>,
    pub auto_launch: Option<bool>,
    pub profile: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyFileConfig {
    pub mode: Option<String>,
}

/// Fully resolved, immutable-for-the-life-of-the-server configuration.
///
/// Invariant: in `Extension` mode no direct CDP port is required; in
/// `Attach` mode the server never spawns or restarts the browser.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub config_path: Option<PathBuf>,
    pub mode: BrowserMode,
    pub binary: Option<PathBuf>,
    pub profile: Option<PathBuf>,
    pub port: u16,
    pub allow_hosts: Vec<String>,
    pub http_timeout_ms: u64,
    pub http_max_bytes: usize,

    pub extension_host: String,
    pub extension_port: u16,
    pub extension_port_span: u16,
    pub extension_port_range: Option<(u16, u16)>,
    pub extension_id: Option<String>,
    pub extension_connect_timeout_ms: u64,
    pub extension_rpc_timeout_ms: u64,
    pub extension_force_new_tab: bool,
    pub extension_auto_launch: bool,
    pub extension_profile: Option<PathBuf>,

    pub native_broker_dir: Option<PathBuf>,
    pub native_broker_id: Option<String>,
    pub native_broker_socket: Option<PathBuf>,
    pub native_host_debug: bool,

    pub policy_mode: crate::policy::PolicyMode,
    pub tier0_enabled: bool,
    pub diagnostics_enabled: bool,
    pub downloads_enabled: bool,
    pub download_dir: Option<PathBuf>,
    pub artifact_max_chars: usize,
    pub chrome_log_max_chars: usize,
    pub agent_memory_dir: Option<PathBuf>,
    pub server_version: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            mode: BrowserMode::Launch,
            binary: None,
            profile: None,
            port: DEFAULT_CDP_PORT,
            allow_hosts: Vec::new(),
            http_timeout_ms: 10_000,
            http_max_bytes: 2_000_000,

            extension_host: "127.0.0.1".to_string(),
            extension_port: 8765,
            extension_port_span: 10,
            extension_port_range: None,
            extension_id: None,
            extension_connect_timeout_ms: 5_000,
            extension_rpc_timeout_ms: 10_000,
            extension_force_new_tab: false,
            extension_auto_launch: false,
            extension_profile: None,

            native_broker_dir: None,
            native_broker_id: None,
            native_broker_socket: None,
            native_host_debug: false,

            policy_mode: crate::policy::PolicyMode::Permissive,
            tier0_enabled: true,
            diagnostics_enabled: true,
            downloads_enabled: true,
            download_dir: None,
            artifact_max_chars: 20_000,
            chrome_log_max_chars: 4_000,
            agent_memory_dir: None,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Looks up `key` in `env`, or in the process environment when `env` is
/// `None` — the same testable-indirection pattern the teacher used for
/// `find_config_file_with`.
fn env_lookup(env: Option<&[(&str, &str)]>, key: &str) -> Option<String> {
    match env {
        Some(pairs) => pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string()),
        None => std::env::var(key).ok(),
    }
}

fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (a, b) = s.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// # Errors
///
/// Returns [`AppError`] if an environment variable holds a value that
/// cannot be parsed into the field's type (e.g. a non-numeric port).
pub fn resolve_config(
    file: &ConfigFile,
    config_path: Option<PathBuf>,
    env: Option<&[(&str, &str)]>,
) -> Result<BrowserConfig, AppError> {
    let mut cfg = BrowserConfig {
        config_path,
        ..BrowserConfig::default()
    };

    if let Some(m) = &file.browser.mode {
        cfg.mode = m
            .parse()
            .map_err(|e| AppError::new(ExitCode::ConfigError, e))?;
    }
    cfg.binary = file.browser.binary.clone().map(PathBuf::from);
    cfg.profile = file.browser.profile.clone().map(PathBuf::from);
    if let Some(p) = file.browser.port {
        cfg.port = p;
    }
    if let Some(hosts) = &file.browser.allow_hosts {
        cfg.allow_hosts = hosts.clone();
    }
    if let Some(t) = file.browser.http_timeout_ms {
        cfg.http_timeout_ms = t;
    }
    if let Some(b) = file.browser.http_max_bytes {
        cfg.http_max_bytes = b;
    }

    if let Some(h) = &file.extension.host {
        cfg.extension_host = h.clone();
    }
    if let Some(p) = file.extension.port {
        cfg.extension_port = p;
    }
    if let Some(s) = file.extension.port_span {
        cfg.extension_port_span = s;
    }
    if let Some(r) = &file.extension.port_range {
        cfg.extension_port_range = parse_port_range(r);
    }
    cfg.extension_id = file.extension.extension_id.clone();
    if let Some(t) = file.extension.connect_timeout_ms {
        cfg.extension_connect_timeout_ms = t;
    }
    if let Some(t) = file.extension.rpc_timeout_ms {
        cfg.extension_rpc_timeout_ms = t;
    }
    if let Some(f) = file.extension.force_new_tab {
        cfg.extension_force_new_tab = f;
    }
    if let Some(a) = file.extension.auto_launch {
        cfg.extension_auto_launch = a;
    }
    cfg.extension_profile = file.extension.profile.clone().map(PathBuf::from);

    if let Some(m) = &file.policy.mode {
        cfg.policy_mode = crate::policy::PolicyMode::normalize(m);
    }

    apply_env(&mut cfg, env)?;
    Ok(cfg)
}

fn apply_env(cfg: &mut BrowserConfig, env: Option<&[(&str, &str)]>) -> Result<(), AppError> {
    macro_rules! env_str {
        ($key:literal) => {
            env_lookup(env, $key)
        };
    }
    macro_rules! env_parsed {
        ($key:literal, $ty:ty) => {
            match env_str!($key) {
                Some(v) => Some(
                    v.parse::<$ty>()
                        .map_err(|_| AppError::new(ExitCode::ConfigError, format!("invalid {}: {v}", $key)))?,
                ),
                None => None,
            }
        };
    }

    if let Some(v) = env_str!("MCP_BROWSER_MODE") {
        cfg.mode = v.parse().map_err(|e| AppError::new(ExitCode::ConfigError, e))?;
    }
    if let Some(v) = env_str!("MCP_BROWSER_BINARY") {
        cfg.binary = Some(PathBuf::from(v));
    }
    if let Some(v) = env_str!("MCP_BROWSER_PROFILE") {
        cfg.profile = Some(PathBuf::from(v));
    }
    if let Some(v) = env_parsed!("MCP_BROWSER_PORT", u16) {
        cfg.port = v;
    }
    if let Some(v) = env_str!("MCP_ALLOW_HOSTS") {
        cfg.allow_hosts = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = env_parsed!("MCP_HTTP_TIMEOUT", u64) {
        cfg.http_timeout_ms = v;
    }
    if let Some(v) = env_str!("MCP_EXTENSION_HOST") {
        cfg.extension_host = v;
    }
    if let Some(v) = env_parsed!("MCP_EXTENSION_PORT", u16) {
        cfg.extension_port = v;
    }
    if let Some(v) = env_parsed!("MCP_EXTENSION_PORT_SPAN", u16) {
        cfg.extension_port_span = v;
    }
    if let Some(v) = env_str!("MCP_EXTENSION_PORT_RANGE") {
        cfg.extension_port_range = parse_port_range(&v);
    }
    if let Some(v) = env_str!("MCP_EXTENSION_ID") {
        cfg.extension_id = Some(v);
    }
    if let Some(v) = env_parsed!("MCP_EXTENSION_CONNECT_TIMEOUT", u64) {
        cfg.extension_connect_timeout_ms = v;
    }
    if let Some(v) = env_parsed!("MCP_EXTENSION_RPC_TIMEOUT", u64) {
        cfg.extension_rpc_timeout_ms = v;
    }
    if let Some(v) = env_str!("MCP_EXTENSION_FORCE_NEW_TAB") {
        cfg.extension_force_new_tab = parse_bool_env(&v);
    }
    if let Some(v) = env_str!("MCP_EXTENSION_AUTO_LAUNCH") {
        cfg.extension_auto_launch = parse_bool_env(&v);
    }
    if let Some(v) = env_str!("MCP_EXTENSION_PROFILE") {
        cfg.extension_profile = Some(PathBuf::from(v));
    }
    if let Some(v) = env_str!("MCP_NATIVE_BROKER_DIR") {
        cfg.native_broker_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = env_str!("MCP_NATIVE_BROKER_ID") {
        cfg.native_broker_id = Some(v);
    }
    if let Some(v) = env_str!("MCP_NATIVE_BROKER_SOCKET") {
        cfg.native_broker_socket = Some(PathBuf::from(v));
    }
    if let Some(v) = env_str!("MCP_NATIVE_HOST_DEBUG") {
        cfg.native_host_debug = parse_bool_env(&v);
    }
    if let Some(v) = env_str!("MCP_POLICY") {
        cfg.policy_mode = crate::policy::PolicyMode::normalize(&v);
    }
    if let Some(v) = env_str!("MCP_TIER0") {
        cfg.tier0_enabled = parse_bool_env(&v);
    }
    if let Some(v) = env_str!("MCP_DIAGNOSTICS") {
        cfg.diagnostics_enabled = parse_bool_env(&v);
    }
    if let Some(v) = env_str!("MCP_DOWNLOADS") {
        cfg.downloads_enabled = parse_bool_env(&v);
    }
    if let Some(v) = env_str!("MCP_DOWNLOAD_DIR") {
        cfg.download_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = env_parsed!("MCP_ARTIFACT_MAX_CHARS", usize) {
        cfg.artifact_max_chars = v;
    }
    if let Some(v) = env_parsed!("MCP_CHROME_LOG_MAX_CHARS", usize) {
        cfg.chrome_log_max_chars = v;
    }
    if let Some(v) = env_str!("MCP_AGENT_MEMORY_DIR") {
        cfg.agent_memory_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = env_str!("MCP_SERVER_VERSION") {
        cfg.server_version = v;
    }
    Ok(())
}

fn parse_bool_env(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

// ---------------------------------------------------------------------------
// Config file discovery and loading
// ---------------------------------------------------------------------------

#[must_use]
pub fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
    find_config_file_with(explicit_path, std::env::var("MCP_CONFIG").ok())
}

/// Testable variant of [`find_config_file`] that accepts an explicit env value.
#[must_use]
pub fn find_config_file_with(explicit_path: Option<&Path>, env_config: Option<String>) -> Option<PathBuf> {
    if let Some(p) = explicit_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }
    if let Some(env_path) = env_config {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }
    let local = PathBuf::from(".browser-mcp.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("browser-mcp").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".browser-mcp.toml");
        if home_config.exists() {
            return Some(home_config);
        }
    }
    None
}

#[must_use]
pub fn load_config(explicit_path: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let path = find_config_file(explicit_path);
    match &path {
        Some(p) => (path.clone(), load_config_from(p)),
        None => (None, ConfigFile::default()),
    }
}

#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents, path),
        Err(e) => {
            eprintln!("warning: could not read config file {}: {e}", path.display());
            ConfigFile::default()
        }
    }
}

#[must_use]
pub fn parse_config(contents: &str, path: &Path) -> ConfigFile {
    match toml::from_str::<ConfigFile>(contents) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("warning: could not parse config file {}: {e}", path.display());
            ConfigFile::default()
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    AlreadyExists(PathBuf),
    Io(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExists(p) => write!(f, "config file already exists: {}", p.display()),
            Self::Io(e) => write!(f, "config io error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Writes the commented default template to `path`, refusing to overwrite.
///
/// # Errors
///
/// Returns [`ConfigError::AlreadyExists`] if `path` already exists, or
/// [`ConfigError::Io`] on write failure.
pub fn init_config_to(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_launch() {
        let cfg = BrowserConfig::default();
        assert_eq!(cfg.mode, BrowserMode::Launch);
    }

    #[test]
    fn resolve_config_applies_file_then_env_override() {
        let mut file = ConfigFile::default();
        file.browser.mode = Some("attach".to_string());
        file.browser.port = Some(9333);
        let env = [("MCP_BROWSER_PORT", "9444")];
        let cfg = resolve_config(&file, None, Some(&env)).unwrap();
        assert_eq!(cfg.mode, BrowserMode::Attach);
        assert_eq!(cfg.port, 9444, "env var must win over file value");
    }

    #[test]
    fn resolve_config_rejects_invalid_mode() {
        let env = [("MCP_BROWSER_MODE", "bogus")];
        let err = resolve_config(&ConfigFile::default(), None, Some(&env)).unwrap_err();
        assert!(matches!(err.code, ExitCode::ConfigError));
    }

    #[test]
    fn port_range_env_overrides_span() {
        let env = [("MCP_EXTENSION_PORT_RANGE", "8770-8767")];
        let cfg = resolve_config(&ConfigFile::default(), None, Some(&env)).unwrap();
        assert_eq!(cfg.extension_port_range, Some((8770, 8767)));
    }

    #[test]
    fn allow_hosts_env_splits_on_comma() {
        let env = [("MCP_ALLOW_HOSTS", "example.com, api.example.com")];
        let cfg = resolve_config(&ConfigFile::default(), None, Some(&env)).unwrap();
        assert_eq!(cfg.allow_hosts, vec!["example.com", "api.example.com"]);
    }

    #[test]
    fn bool_env_accepts_common_truthy_spellings() {
        assert!(parse_bool_env("true"));
        assert!(parse_bool_env("1"));
        assert!(parse_bool_env("yes"));
        assert!(!parse_bool_env("false"));
        assert!(!parse_bool_env(""));
    }

    #[test]
    fn init_config_to_writes_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        init_config_to(&path).unwrap();
        assert!(path.exists());
        let err = init_config_to(&path).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyExists(_)));
    }

    #[test]
    fn find_config_file_with_prefers_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.toml");
        std::fs::write(&explicit, "").unwrap();
        let found = find_config_file_with(Some(&explicit), None);
        assert_eq!(found, Some(explicit));
    }
}
