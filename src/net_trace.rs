//! Bounded, redacted request traces built from a tab's completed-request
//! cache, for bug-triage-style "what did the network do" answers — a
//! minimal subset of HAR tailored for diagnosis rather than replay.
//!
//! Two outputs: a small `preview` meant to ride along in a tool's direct
//! response, and (optionally, body-capture permitting) a fuller per-item
//! record meant to be written to the artifact store rather than returned
//! inline.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::conn::CdpLikeConnection;
use crate::telemetry::RequestMeta;

pub const DEFAULT_MAX_BODY_BYTES: usize = 80 * 1024;
pub const HARD_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 600 * 1024;
const PREVIEW_MAX_ITEMS: usize = 3;
const PREVIEW_MAX_CHARS: usize = 1800;
const MONEY_MAX_DEPTH: usize = 12;
const MONEY_MAX_VALUES: usize = 8;
const MONEY_MISMATCH_RATIO: f64 = 1.20;
const MAX_MISMATCHES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLevel {
    Meta,
    Request,
    Body,
    All,
}

impl CaptureLevel {
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "request" => Self::Request,
            "body" => Self::Body,
            "all" => Self::All,
            _ => Self::Meta,
        }
    }

    #[must_use]
    pub fn wants_request_body(self) -> bool {
        matches!(self, Self::Request | Self::All)
    }

    #[must_use]
    pub fn wants_response_body(self) -> bool {
        matches!(self, Self::Body | Self::All)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetTraceFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub resource_types: Vec<String>,
    pub since: Option<u64>,
}

impl NetTraceFilter {
    fn resource_types_or_default(&self) -> Vec<String> {
        if self.resource_types.is_empty() {
            vec!["XHR".to_string(), "Fetch".to_string()]
        } else {
            self.resource_types.clone()
        }
    }

    fn matches(&self, meta: &RequestMeta) -> bool {
        if meta.ts <= self.since.unwrap_or(0) {
            return false;
        }
        let types = self.resource_types_or_default();
        if !meta.resource_type.as_deref().is_some_and(|t| types.iter().any(|rt| rt == t)) {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|s| meta.url.contains(s.as_str())) {
            return false;
        }
        if self.exclude.iter().any(|s| meta.url.contains(s.as_str())) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetTraceItem {
    pub request_id: String,
    pub method: Option<String>,
    pub url: String,
    #[serde(rename = "type")]
    pub resource_type: Option<String>,
    pub status: Option<i64>,
    pub ok: Option<bool>,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub truncated: bool,
}

/// Builds the bounded item list (the thing that gets written to the
/// artifact store). Does not itself fetch bodies — call
/// [`capture_bodies`] afterward if `capture` requested them.
#[must_use]
pub fn build_trace(completed: &indexmap::IndexMap<String, RequestMeta>, filter: &NetTraceFilter, limit: usize) -> Vec<NetTraceItem> {
    completed
        .iter()
        .filter(|(_, meta)| filter.matches(meta))
        .rev() // most recent first
        .take(limit)
        .map(|(id, meta)| NetTraceItem {
            request_id: id.clone(),
            method: meta.method.clone(),
            url: meta.url.clone(),
            resource_type: meta.resource_type.clone(),
            status: meta.status,
            ok: meta.ok,
            duration_ms: meta.duration_ms,
            request_body: None,
            response_body: None,
            truncated: false,
        })
        .collect()
}

/// A small inline preview safe to return directly from a tool call: at most
/// [`PREVIEW_MAX_ITEMS`] items, each body-free and capped at
/// [`PREVIEW_MAX_CHARS`].
#[must_use]
pub fn build_preview(items: &[NetTraceItem]) -> Vec<Value> {
    items
        .iter()
        .take(PREVIEW_MAX_ITEMS)
        .map(|item| {
            let mut s = serde_json::to_string(item).unwrap_or_default();
            if s.chars().count() > PREVIEW_MAX_CHARS {
                s = s.chars().take(PREVIEW_MAX_CHARS).collect();
            }
            serde_json::from_str(&s).unwrap_or(Value::Null)
        })
        .collect()
}

/// Fetches request/response bodies for `items` over an active connection,
/// honoring `capture`, per-item `max_body_bytes` and a cumulative
/// `max_total_bytes` budget across the whole trace. Best-effort: a body
/// fetch failing for one item (evicted from Chrome's buffer, no body on a
/// redirect, etc.) just leaves that item's body fields `None`.
pub async fn capture_bodies(
    conn: &dyn CdpLikeConnection,
    items: &mut [NetTraceItem],
    capture: CaptureLevel,
    max_body_bytes: usize,
    max_total_bytes: usize,
    timeout: tokio::time::Duration,
) {
    if matches!(capture, CaptureLevel::Meta) {
        return;
    }
    let max_body_bytes = max_body_bytes.min(HARD_MAX_BODY_BYTES);
    let mut spent = 0usize;
    for item in items.iter_mut() {
        if spent >= max_total_bytes {
            break;
        }
        if capture.wants_response_body() {
            if let Ok(result) = conn
                .send("Network.getResponseBody", Some(serde_json::json!({ "requestId": item.request_id })), timeout)
                .await
            {
                if let Some(body) = result.get("body").and_then(Value::as_str) {
                    let (text, truncated) = bound_body(body, max_body_bytes, max_total_bytes.saturating_sub(spent));
                    spent += text.len();
                    item.truncated = item.truncated || truncated;
                    item.response_body = Some(text);
                }
            }
        }
    }
}

fn bound_body(body: &str, per_item_cap: usize, remaining_total: usize) -> (String, bool) {
    let cap = per_item_cap.min(remaining_total);
    if body.len() <= cap {
        (body.to_string(), false)
    } else {
        (body.chars().take(cap).collect(), true)
    }
}

// --- Money-insight extraction ---------------------------------------------

const MONEY_KEYS: &[&str] = &["amount", "price", "total", "subtotal", "tax", "vat"];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MoneyValue {
    pub path: String,
    pub key: String,
    pub value: f64,
}

/// Walks a JSON body looking for numeric fields whose key matches one of
/// [`MONEY_KEYS`] (case-insensitively), bounded to depth
/// [`MONEY_MAX_DEPTH`] and [`MONEY_MAX_VALUES`] results.
#[must_use]
pub fn extract_money_values(body: &Value) -> Vec<MoneyValue> {
    let mut out = Vec::new();
    walk_money(body, "$", 0, &mut out);
    out
}

fn walk_money(value: &Value, path: &str, depth: usize, out: &mut Vec<MoneyValue>) {
    if depth > MONEY_MAX_DEPTH || out.len() >= MONEY_MAX_VALUES {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if out.len() >= MONEY_MAX_VALUES {
                    return;
                }
                let child_path = format!("{path}.{key}");
                let lower = key.to_ascii_lowercase();
                if MONEY_KEYS.iter().any(|k| lower.contains(k)) {
                    if let Some(n) = v.as_f64() {
                        out.push(MoneyValue { path: child_path.clone(), key: key.clone(), value: n });
                        continue;
                    }
                }
                walk_money(v, &child_path, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                if out.len() >= MONEY_MAX_VALUES {
                    return;
                }
                walk_money(v, &format!("{path}[{i}]"), depth + 1, out);
            }
        }
        _ => {}
    }
}

/// ISO 4217 minor-unit exceptions; everything else defaults to 2 decimals.
#[must_use]
pub fn currency_decimals(code: Option<&str>) -> u32 {
    let zero_decimal = ["JPY", "KRW"];
    let three_decimal = ["BHD", "KWD", "OMR"];
    match code.map(str::to_ascii_uppercase).as_deref() {
        Some(c) if zero_decimal.contains(&c) => 0,
        Some(c) if three_decimal.contains(&c) => 3,
        _ => 2,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MoneyMismatch {
    pub cart_key: String,
    pub cart_value: f64,
    pub payment_key: String,
    pub payment_value: f64,
    pub ratio: f64,
}

/// Compares the largest value in `cart` against the largest in `payment`
/// (both already normalized to major units by the caller) and flags a
/// mismatch when their ratio is at or above [`MONEY_MISMATCH_RATIO`] in
/// either direction. Bounded to [`MAX_MISMATCHES`] results.
#[must_use]
pub fn detect_mismatches(cart: &[MoneyValue], payment: &[MoneyValue]) -> Vec<MoneyMismatch> {
    let mut out = Vec::new();
    for c in cart {
        for p in payment {
            if out.len() >= MAX_MISMATCHES {
                return out;
            }
            if c.value <= 0.0 || p.value <= 0.0 {
                continue;
            }
            let ratio = (c.value / p.value).max(p.value / c.value);
            if ratio >= MONEY_MISMATCH_RATIO {
                out.push(MoneyMismatch {
                    cart_key: c.path.clone(),
                    cart_value: c.value,
                    payment_key: p.path.clone(),
                    payment_value: p.value,
                    ratio,
                });
            }
        }
    }
    out
}

/// Converts a minor-unit integer amount (e.g. cents) into a major-unit
/// float given a currency code, defaulting unknown currencies to 2 decimals.
#[must_use]
pub fn minor_to_major(minor_units: i64, currency: Option<&str>) -> f64 {
    let decimals = currency_decimals(currency);
    minor_units as f64 / 10f64.powi(decimals as i32)
}

#[must_use]
pub fn header_preview_map(meta: &RequestMeta) -> HashMap<String, Value> {
    meta.req_headers.as_object().map_or_else(HashMap::new, |m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{DEFAULT_MAX_EVENTS, DEFAULT_MAX_REQUEST_MAP, Tier0Telemetry};

    fn telemetry_with_requests() -> Tier0Telemetry {
        let mut t = Tier0Telemetry::new(DEFAULT_MAX_EVENTS, DEFAULT_MAX_REQUEST_MAP);
        t.ingest(
            "Network.requestWillBeSent",
            &serde_json::json!({"requestId": "r1", "type": "XHR", "request": {"method": "GET", "url": "https://api.example.com/cart"}}),
        );
        t.ingest("Network.loadingFinished", &serde_json::json!({"requestId": "r1", "encodedDataLength": 10}));
        t.ingest(
            "Network.requestWillBeSent",
            &serde_json::json!({"requestId": "r2", "type": "Document", "request": {"method": "GET", "url": "https://example.com/page"}}),
        );
        t.ingest("Network.loadingFinished", &serde_json::json!({"requestId": "r2", "encodedDataLength": 10}));
        t
    }

    #[test]
    fn build_trace_defaults_to_xhr_and_fetch() {
        let telemetry = telemetry_with_requests();
        let items = build_trace(telemetry.completed_map(), &NetTraceFilter::default(), 50);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].request_id, "r1");
    }

    #[test]
    fn build_trace_honors_since_cursor() {
        let telemetry = telemetry_with_requests();
        let filter = NetTraceFilter { since: Some(u64::MAX), ..Default::default() };
        let items = build_trace(telemetry.completed_map(), &filter, 50);
        assert!(items.is_empty());
    }

    #[test]
    fn build_preview_bounds_item_count() {
        let telemetry = telemetry_with_requests();
        let filter = NetTraceFilter { resource_types: vec!["XHR".into(), "Document".into()], ..Default::default() };
        let items = build_trace(telemetry.completed_map(), &filter, 50);
        let preview = build_preview(&items);
        assert!(preview.len() <= PREVIEW_MAX_ITEMS);
    }

    #[test]
    fn extract_money_values_finds_nested_fields() {
        let body = serde_json::json!({"cart": {"subtotal": 10.5, "items": [{"price": 3.0}]}});
        let values = extract_money_values(&body);
        assert!(values.iter().any(|v| v.key == "subtotal" && v.value == 10.5));
        assert!(values.iter().any(|v| v.key == "price" && v.value == 3.0));
    }

    #[test]
    fn extract_money_values_is_bounded() {
        let mut map = serde_json::Map::new();
        for i in 0..20 {
            map.insert(format!("amount{i}"), serde_json::json!(i));
        }
        let values = extract_money_values(&Value::Object(map));
        assert_eq!(values.len(), MONEY_MAX_VALUES);
    }

    #[test]
    fn currency_decimals_has_zero_and_three_decimal_exceptions() {
        assert_eq!(currency_decimals(Some("JPY")), 0);
        assert_eq!(currency_decimals(Some("BHD")), 3);
        assert_eq!(currency_decimals(Some("USD")), 2);
        assert_eq!(currency_decimals(None), 2);
    }

    #[test]
    fn minor_to_major_uses_currency_decimals() {
        assert!((minor_to_major(1050, Some("USD")) - 10.50).abs() < f64::EPSILON);
        assert!((minor_to_major(1050, Some("JPY")) - 1050.0).abs() < f64::EPSILON);
    }

    #[test]
    fn detect_mismatches_flags_large_ratio() {
        let cart = vec![MoneyValue { path: "$.cart.total".into(), key: "total".into(), value: 100.0 }];
        let payment = vec![MoneyValue { path: "$.payment.amount".into(), key: "amount".into(), value: 1.0 }];
        let mismatches = detect_mismatches(&cart, &payment);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].ratio >= MONEY_MISMATCH_RATIO);
    }

    #[test]
    fn detect_mismatches_ignores_matching_totals() {
        let cart = vec![MoneyValue { path: "$.cart.total".into(), key: "total".into(), value: 100.0 }];
        let payment = vec![MoneyValue { path: "$.payment.amount".into(), key: "amount".into(), value: 100.0 }];
        assert!(detect_mismatches(&cart, &payment).is_empty());
    }
}
