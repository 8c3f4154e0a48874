//! Tier-0 telemetry: per-tab bounded buffers fed by CDP events, and the
//! `snapshot()` view tool handlers poll for console/network/dialog state.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::{Value, json};

use crate::policy::{is_sensitive_header, is_sensitive_key};
use crate::util::{now_ms, redact_url, sha256_hex};

pub const DEFAULT_MAX_EVENTS: usize = 200;
pub const DEFAULT_MAX_REQUEST_MAP: usize = 800;
const CONSOLE_ARG_MAX_CHARS: usize = 500;
const DEFAULT_SNAPSHOT_LIMIT: usize = 50;

/// Parameters for [`Tier0Telemetry::snapshot`]: `since`/`offset`/`limit`
/// page the per-buffer slices, and `url`/`title`/`ready_state` are the
/// caller's own view of current page state, echoed back in the snapshot so
/// a tool handler doesn't need a second round-trip just to attach it.
#[derive(Debug, Clone)]
pub struct SnapshotQuery {
    pub since: Option<u64>,
    pub offset: usize,
    pub limit: usize,
    pub url: Option<String>,
    pub title: Option<String>,
    pub ready_state: Option<String>,
}

impl Default for SnapshotQuery {
    fn default() -> Self {
        Self {
            since: None,
            offset: 0,
            limit: DEFAULT_SNAPSHOT_LIMIT,
            url: None,
            title: None,
            ready_state: None,
        }
    }
}

/// A bounded FIFO ring: push evicts the oldest entry once at capacity.
#[derive(Debug, Clone, Default)]
struct Ring<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> Ring<T> {
    fn new(cap: usize) -> Self {
        Self { items: VecDeque::with_capacity(cap.min(256)), cap: cap.max(1) }
    }

    fn push(&mut self, item: T) {
        if self.items.len() >= self.cap {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleEntry {
    pub ts: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub stack_top: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub filename: Option<String>,
    pub lineno: Option<i64>,
    pub colno: Option<i64>,
    pub stack_top: Option<String>,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEntry {
    pub ts: u64,
    pub request_id: String,
    pub method: Option<String>,
    pub url: String,
    pub status: Option<i64>,
    pub ok: bool,
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarLiteEntry {
    pub ts: u64,
    pub request_id: String,
    pub url: String,
    pub method: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: Option<String>,
    pub status: Option<i64>,
    pub ok: bool,
    pub duration_ms: Option<u64>,
    pub encoded_data_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogEntry {
    pub ts: u64,
    pub event: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigationEntry {
    pub ts: u64,
    pub url: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RequestMeta {
    pub(crate) ts: u64,
    pub(crate) method: Option<String>,
    pub(crate) url: String,
    pub(crate) url_full: String,
    pub(crate) resource_type: Option<String>,
    pub(crate) req_headers: Value,
    pub(crate) initiator: Value,
    pub(crate) status: Option<i64>,
    pub(crate) mime_type: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) resp_headers: Value,
    pub(crate) end_ts: Option<u64>,
    pub(crate) ok: Option<bool>,
    pub(crate) duration_ms: Option<u64>,
    pub(crate) encoded_data_length: Option<u64>,
    pub(crate) error_text: Option<String>,
    pub(crate) blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySummary {
    pub console_errors: usize,
    pub console_warnings: usize,
    pub js_errors: usize,
    pub failed_requests: usize,
    pub last_error: Option<String>,
}

/// Per-tab Tier-0 telemetry buffers, fed by whichever bus (direct or
/// gateway-sourced) is active for this tab.
pub struct Tier0Telemetry {
    max_events: usize,
    max_request_map: usize,
    console: Ring<ConsoleEntry>,
    errors: Ring<ErrorEntry>,
    network: Ring<NetworkEntry>,
    har_lite: Ring<HarLiteEntry>,
    dialogs: Ring<DialogEntry>,
    navigation: Ring<NavigationEntry>,
    dialog_open: bool,
    dialog_last: Option<DialogEntry>,
    inflight: indexmap::IndexMap<String, RequestMeta>,
    completed: indexmap::IndexMap<String, RequestMeta>,
    cursor: u64,
    info_debug_console_count: usize,
}

impl Tier0Telemetry {
    #[must_use]
    pub fn new(max_events: usize, max_request_map: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            max_request_map: max_request_map.max(1),
            console: Ring::new(max_events),
            errors: Ring::new(max_events),
            network: Ring::new(max_events),
            har_lite: Ring::new(max_events),
            dialogs: Ring::new(max_events),
            navigation: Ring::new(max_events),
            dialog_open: false,
            dialog_last: None,
            inflight: indexmap::IndexMap::new(),
            completed: indexmap::IndexMap::new(),
            cursor: 0,
            info_debug_console_count: 0,
        }
    }

    #[must_use]
    pub fn dialog_open(&self) -> bool {
        self.dialog_open
    }

    #[must_use]
    pub fn completed_map(&self) -> &indexmap::IndexMap<String, RequestMeta> {
        &self.completed
    }

    fn bump_cursor(&mut self) {
        self.cursor = self.cursor.max(now_ms());
    }

    fn evict_inflight_if_needed(&mut self) {
        while self.inflight.len() > self.max_request_map {
            self.inflight.shift_remove_index(0);
        }
    }

    fn evict_completed_if_needed(&mut self) {
        while self.completed.len() > self.max_request_map {
            self.completed.shift_remove_index(0);
        }
    }

    /// Dispatch one CDP event into the right buffer(s). Returns `true` if a
    /// dialog just opened (callers couple this to the auto-dialog handler).
    pub fn ingest(&mut self, method: &str, params: &Value) -> bool {
        self.bump_cursor();
        match method {
            "Runtime.consoleAPICalled" => self.ingest_console(params),
            "Runtime.exceptionThrown" => self.ingest_exception(params),
            "Network.requestWillBeSent" => self.ingest_request_will_be_sent(params),
            "Network.responseReceived" => self.ingest_response_received(params),
            "Network.loadingFinished" => self.ingest_loading_finished(params),
            "Network.loadingFailed" => self.ingest_loading_failed(params),
            "Page.javascriptDialogOpening" => {
                self.ingest_dialog_opening(params);
                return true;
            }
            "Page.javascriptDialogClosed" => self.ingest_dialog_closed(),
            "Page.navigatedWithinDocument" => self.ingest_navigation(params, "withinDocument"),
            "Page.frameNavigated" => self.ingest_frame_navigated(params),
            _ => {}
        }
        false
    }

    fn ingest_console(&mut self, params: &Value) {
        let raw_type = params.get("type").and_then(Value::as_str).unwrap_or("log");
        let kind = match raw_type {
            "warning" => "warn",
            other => other,
        };
        let is_verbose = matches!(kind, "log" | "info" | "debug");
        if is_verbose && self.info_debug_console_count >= self.max_events / 10 {
            return;
        }
        let text = params
            .get("args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .map(stringify_console_arg)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let stack_top = params
            .get("stackTrace")
            .and_then(|st| st.get("callFrames"))
            .and_then(Value::as_array)
            .and_then(|frames| frames.first())
            .map(std::string::ToString::to_string);
        if is_verbose {
            self.info_debug_console_count += 1;
        }
        self.console.push(ConsoleEntry { ts: now_ms(), kind: kind.to_string(), text, stack_top });
    }

    fn ingest_exception(&mut self, params: &Value) {
        let details = params.get("exceptionDetails").unwrap_or(params);
        let message = details
            .get("exception")
            .and_then(|e| e.get("description"))
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("unknown error")
            .to_string();
        let filename = details.get("url").and_then(Value::as_str).map(redact_url);
        let stack_top = details
            .get("stackTrace")
            .and_then(|st| st.get("callFrames"))
            .and_then(Value::as_array)
            .and_then(|frames| frames.first())
            .map(std::string::ToString::to_string);
        self.errors.push(ErrorEntry {
            kind: "error".to_string(),
            message: message.clone(),
            filename,
            lineno: details.get("lineNumber").and_then(Value::as_i64),
            colno: details.get("columnNumber").and_then(Value::as_i64),
            stack_top,
            ts: now_ms(),
        });
    }

    fn ingest_request_will_be_sent(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else { return };
        let request = params.get("request").cloned().unwrap_or(Value::Null);
        let url_full = request.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
        let meta = RequestMeta {
            ts: now_ms(),
            method: request.get("method").and_then(Value::as_str).map(str::to_string),
            url: redact_url(&url_full),
            url_full,
            resource_type: params.get("type").and_then(Value::as_str).map(str::to_string),
            req_headers: redact_headers(request.get("headers")),
            initiator: params.get("initiator").cloned().unwrap_or(Value::Null),
            ..Default::default()
        };
        self.inflight.insert(request_id.to_string(), meta);
        self.evict_inflight_if_needed();
    }

    fn ingest_response_received(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else { return };
        let response = params.get("response").cloned().unwrap_or(Value::Null);
        let status = response.get("status").and_then(Value::as_i64);
        let url = response.get("url").and_then(Value::as_str).map(redact_url).unwrap_or_default();
        let method = self.inflight.get(request_id).and_then(|m| m.method.clone());
        if let Some(meta) = self.inflight.get_mut(request_id) {
            meta.status = status;
            meta.mime_type = response.get("mimeType").and_then(Value::as_str).map(str::to_string);
            meta.content_type = header_value(response.get("headers"), "content-type");
            meta.resp_headers = redact_headers(response.get("headers"));
        }
        if status.is_some_and(|s| s >= 400) {
            self.network.push(NetworkEntry {
                ts: now_ms(),
                request_id: request_id.to_string(),
                method,
                url,
                status,
                ok: false,
                error_text: None,
            });
        }
    }

    fn ingest_loading_finished(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else { return };
        let encoded_data_length = params.get("encodedDataLength").and_then(Value::as_f64).map(|n| n as u64);
        let Some(mut meta) = self.inflight.shift_remove(request_id) else { return };
        let now = now_ms();
        let duration_ms = Some(now.saturating_sub(meta.ts));
        meta.end_ts = Some(now);
        meta.ok = Some(true);
        meta.duration_ms = duration_ms;
        meta.encoded_data_length = encoded_data_length;

        let is_slow = duration_ms.is_some_and(|d| d >= 300);
        let is_large = encoded_data_length.is_some_and(|n| n >= 20_000);
        let is_primary = matches!(meta.resource_type.as_deref(), Some("Document" | "XHR" | "Fetch"));
        if is_slow || is_large || is_primary {
            self.har_lite.push(HarLiteEntry {
                ts: meta.ts,
                request_id: request_id.to_string(),
                url: meta.url.clone(),
                method: meta.method.clone(),
                resource_type: meta.resource_type.clone(),
                status: meta.status,
                ok: true,
                duration_ms,
                encoded_data_length,
            });
        }
        self.completed.insert(request_id.to_string(), meta);
        self.evict_completed_if_needed();
    }

    fn ingest_loading_failed(&mut self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else { return };
        let error_text = params.get("errorText").and_then(Value::as_str).map(str::to_string);
        let blocked_reason = params.get("blockedReason").and_then(Value::as_str).map(str::to_string);
        let mut meta = self.inflight.shift_remove(request_id).unwrap_or_default();
        let now = now_ms();
        meta.end_ts = Some(now);
        meta.ok = Some(false);
        meta.duration_ms = Some(now.saturating_sub(meta.ts));
        meta.error_text = error_text.clone();
        meta.blocked_reason = blocked_reason;

        self.network.push(NetworkEntry {
            ts: now,
            request_id: request_id.to_string(),
            method: meta.method.clone(),
            url: meta.url.clone(),
            status: None,
            ok: false,
            error_text: error_text.clone(),
        });
        self.har_lite.push(HarLiteEntry {
            ts: meta.ts,
            request_id: request_id.to_string(),
            url: meta.url.clone(),
            method: meta.method.clone(),
            resource_type: meta.resource_type.clone(),
            status: None,
            ok: false,
            duration_ms: meta.duration_ms,
            encoded_data_length: None,
        });
        self.completed.insert(request_id.to_string(), meta);
        self.evict_completed_if_needed();
    }

    fn ingest_dialog_opening(&mut self, params: &Value) {
        self.dialog_open = true;
        let entry = DialogEntry {
            ts: now_ms(),
            event: "opening".to_string(),
            kind: params.get("type").and_then(Value::as_str).map(str::to_string),
            message: params.get("message").and_then(Value::as_str).map(str::to_string),
            url: params.get("url").and_then(Value::as_str).map(redact_url),
        };
        self.dialog_last = Some(entry.clone());
        self.dialogs.push(entry);
    }

    fn ingest_dialog_closed(&mut self) {
        self.dialog_open = false;
        self.dialogs.push(DialogEntry {
            ts: now_ms(),
            event: "closed".to_string(),
            kind: None,
            message: None,
            url: None,
        });
    }

    fn ingest_navigation(&mut self, params: &Value, kind: &str) {
        let Some(url) = params.get("url").and_then(Value::as_str) else { return };
        self.navigation.push(NavigationEntry { ts: now_ms(), url: redact_url(url), kind: kind.to_string() });
    }

    fn ingest_frame_navigated(&mut self, params: &Value) {
        let Some(frame) = params.get("frame") else { return };
        if frame.get("parentId").is_some() {
            return;
        }
        let Some(url) = frame.get("url").and_then(Value::as_str) else { return };
        self.navigation.push(NavigationEntry { ts: now_ms(), url: redact_url(url), kind: "navigation".to_string() });
    }

    fn summary(&self) -> TelemetrySummary {
        let console_errors = self.console.iter().filter(|e| e.kind == "error").count();
        let console_warnings = self.console.iter().filter(|e| e.kind == "warn").count();
        let js_errors = self.errors.iter().count();
        let failed_requests = self.network.iter().filter(|e| !e.ok).count();
        let last_error = self.errors.iter().last().map(|e| e.message.clone());
        TelemetrySummary { console_errors, console_warnings, js_errors, failed_requests, last_error }
    }

    /// Bounded snapshot for tool consumption: per-buffer slices newer than
    /// `query.since`, paginated by `offset`/`limit`, plus a small rollup
    /// summary. `url`/`title`/`readyState` are not tracked by telemetry
    /// itself — the caller echoes its own view of current page state through
    /// so agents get it back in the same round-trip.
    #[must_use]
    pub fn snapshot(&self, query: &SnapshotQuery) -> Value {
        let since = query.since.unwrap_or(0);
        let offset = query.offset;
        let limit = query.limit.min(200);
        let page = |items: Vec<Value>| -> Vec<Value> { items.into_iter().skip(offset).take(limit).collect() };

        json!({
            "cursor": self.cursor,
            "url": query.url,
            "title": query.title,
            "readyState": query.ready_state,
            "dialogOpen": self.dialog_open,
            "dialogLast": self.dialog_last,
            "summary": self.summary(),
            "console": page(self.console.iter().filter(|e| e.ts > since).map(|e| serde_json::to_value(e).unwrap_or(Value::Null)).collect()),
            "errors": page(self.errors.iter().filter(|e| e.ts > since).map(|e| serde_json::to_value(e).unwrap_or(Value::Null)).collect()),
            "network": page(self.network.iter().filter(|e| e.ts > since).map(|e| serde_json::to_value(e).unwrap_or(Value::Null)).collect()),
            "harLite": page(self.har_lite.iter().filter(|e| e.ts > since).map(|e| serde_json::to_value(e).unwrap_or(Value::Null)).collect()),
            "dialogs": page(self.dialogs.iter().filter(|e| e.ts > since).map(|e| serde_json::to_value(e).unwrap_or(Value::Null)).collect()),
            "navigation": page(self.navigation.iter().filter(|e| e.ts > since).map(|e| serde_json::to_value(e).unwrap_or(Value::Null)).collect()),
        })
    }
}

fn stringify_console_arg(arg: &Value) -> String {
    let text = arg
        .get("value")
        .map(std::string::ToString::to_string)
        .or_else(|| arg.get("description").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| arg.to_string());
    if text.chars().count() > CONSOLE_ARG_MAX_CHARS {
        text.chars().take(CONSOLE_ARG_MAX_CHARS).collect()
    } else {
        text
    }
}

fn header_value(headers: Option<&Value>, name: &str) -> Option<String> {
    headers?.as_object()?.iter().find_map(|(k, v)| {
        if k.eq_ignore_ascii_case(name) {
            v.as_str().map(str::to_string)
        } else {
            None
        }
    })
}

/// Sensitive headers become `{redacted:true, len, sha256}`; everything else
/// passes through as a string preview.
fn redact_headers(headers: Option<&Value>) -> Value {
    let Some(map) = headers.and_then(Value::as_object) else { return Value::Null };
    let mut out = serde_json::Map::new();
    for (key, value) in map {
        let Some(s) = value.as_str() else { continue };
        if is_sensitive_header(key) || is_sensitive_key(key) {
            out.insert(key.clone(), json!({ "redacted": true, "len": s.len(), "sha256": sha256_hex(s) }));
        } else {
            out.insert(key.clone(), Value::String(s.to_string()));
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry() -> Tier0Telemetry {
        Tier0Telemetry::new(DEFAULT_MAX_EVENTS, DEFAULT_MAX_REQUEST_MAP)
    }

    #[test]
    fn console_warning_is_renamed_to_warn() {
        let mut t = telemetry();
        t.ingest("Runtime.consoleAPICalled", &json!({"type": "warning", "args": [{"value": "oops"}]}));
        let snap = t.snapshot(&SnapshotQuery::default());
        assert_eq!(snap["console"][0]["type"], "warn");
    }

    #[test]
    fn verbose_console_entries_are_capped_at_a_tenth_of_max_events() {
        let mut t = Tier0Telemetry::new(20, 800);
        for _ in 0..10 {
            t.ingest("Runtime.consoleAPICalled", &json!({"type": "log", "args": [{"value": "x"}]}));
        }
        let snap = t.snapshot(&SnapshotQuery::default());
        assert_eq!(snap["console"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn dialog_opening_sets_dialog_open_and_returns_true() {
        let mut t = telemetry();
        let opened = t.ingest("Page.javascriptDialogOpening", &json!({"type": "alert", "message": "hi"}));
        assert!(opened);
        assert!(t.dialog_open());
        t.ingest("Page.javascriptDialogClosed", &Value::Null);
        assert!(!t.dialog_open());
    }

    #[test]
    fn request_lifecycle_moves_from_inflight_to_completed() {
        let mut t = telemetry();
        t.ingest("Network.requestWillBeSent", &json!({
            "requestId": "r1",
            "type": "XHR",
            "request": {"method": "GET", "url": "https://example.com/api?x=1"},
        }));
        t.ingest("Network.loadingFinished", &json!({"requestId": "r1", "encodedDataLength": 10}));
        assert!(t.completed_map().contains_key("r1"));
    }

    #[test]
    fn failed_request_is_recorded_in_network_and_completed() {
        let mut t = telemetry();
        t.ingest("Network.requestWillBeSent", &json!({
            "requestId": "r2",
            "type": "Fetch",
            "request": {"method": "POST", "url": "https://example.com/x"},
        }));
        t.ingest("Network.loadingFailed", &json!({"requestId": "r2", "errorText": "net::ERR_FAILED"}));
        let snap = t.snapshot(&SnapshotQuery::default());
        assert_eq!(snap["network"][0]["ok"], false);
        assert!(t.completed_map().contains_key("r2"));
    }

    #[test]
    fn sensitive_request_headers_are_redacted() {
        let mut t = telemetry();
        t.ingest("Network.requestWillBeSent", &json!({
            "requestId": "r3",
            "type": "XHR",
            "request": {"method": "GET", "url": "https://example.com/", "headers": {"Authorization": "Bearer abc", "X-Trace": "1"}},
        }));
        // No public accessor for inflight; exercise indirectly via loadingFinished and completed_map.
        t.ingest("Network.loadingFinished", &json!({"requestId": "r3"}));
        let meta = t.completed_map().get("r3").unwrap();
        assert_eq!(meta.req_headers["Authorization"]["redacted"], true);
        assert_eq!(meta.req_headers["X-Trace"], "1");
    }

    #[test]
    fn url_redaction_strips_query_and_fragment() {
        let mut t = telemetry();
        t.ingest("Page.navigatedWithinDocument", &json!({"url": "https://example.com/path?x=1#frag"}));
        let snap = t.snapshot(&SnapshotQuery::default());
        assert_eq!(snap["navigation"][0]["url"], "https://example.com/path");
    }
}
