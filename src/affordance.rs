//! Stable affordance refs: `aff:<10-hex>` identifiers an agent can act on
//! instead of a brittle CSS/XPath selector. Each observation (e.g. "here is
//! the page's interactive surface") replaces the whole map for that tab —
//! there is no incremental merge, since a page's DOM can change shape
//! between one observation and the next and stale refs should simply stop
//! resolving rather than point at the wrong element.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::util::short_hash10;

pub const MAX_AFFORDANCES: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Affordance {
    pub tool: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Per-tab affordance map. One instance lives per tab inside the session
/// manager, replaced on navigation.
#[derive(Default)]
pub struct AffordanceMap {
    inner: Mutex<HashMap<String, Affordance>>,
}

impl AffordanceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole map with a freshly observed set of affordances,
    /// deriving each ref from `(tool, a stable per-item seed)` so the same
    /// logical element gets the same ref across observations as long as its
    /// seed (typically a selector or accessible name) hasn't changed.
    ///
    /// Truncates to [`MAX_AFFORDANCES`], keeping the first `N` entries in
    /// the order supplied.
    pub fn replace(&self, items: Vec<(String, String, Value, Option<Value>)>) -> Vec<String> {
        let mut map = HashMap::new();
        let mut refs = Vec::new();
        for (seed, tool, args, meta) in items.into_iter().take(MAX_AFFORDANCES) {
            let aff_ref = format!("aff:{}", short_hash10(&seed));
            refs.push(aff_ref.clone());
            map.insert(aff_ref, Affordance { tool, args, meta });
        }
        *self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = map;
        refs
    }

    #[must_use]
    pub fn resolve(&self, aff_ref: &str) -> Option<Affordance> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(aff_ref)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }
}

#[must_use]
pub fn is_affordance_ref(s: &str) -> bool {
    s.strip_prefix("aff:").is_some_and(|rest| rest.len() == 10 && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_produces_well_formed_refs() {
        let map = AffordanceMap::new();
        let refs = map.replace(vec![(
            "button#submit".to_string(),
            "click".to_string(),
            serde_json::json!({"selector": "#submit"}),
            None,
        )]);
        assert_eq!(refs.len(), 1);
        assert!(is_affordance_ref(&refs[0]));
    }

    #[test]
    fn resolve_returns_the_stored_affordance() {
        let map = AffordanceMap::new();
        let refs = map.replace(vec![(
            "seed-1".to_string(),
            "type".to_string(),
            serde_json::json!({"text": "hello"}),
            Some(serde_json::json!({"label": "Search box"})),
        )]);
        let resolved = map.resolve(&refs[0]).unwrap();
        assert_eq!(resolved.tool, "type");
        assert_eq!(resolved.args["text"], "hello");
    }

    #[test]
    fn replace_wholesale_drops_stale_refs() {
        let map = AffordanceMap::new();
        let first = map.replace(vec![("a".to_string(), "click".to_string(), Value::Null, None)]);
        map.replace(vec![("b".to_string(), "click".to_string(), Value::Null, None)]);
        assert!(map.resolve(&first[0]).is_none());
    }

    #[test]
    fn replace_truncates_to_the_bound() {
        let map = AffordanceMap::new();
        let items: Vec<_> = (0..150)
            .map(|i| (format!("seed-{i}"), "click".to_string(), Value::Null, None))
            .collect();
        let refs = map.replace(items);
        assert_eq!(refs.len(), MAX_AFFORDANCES);
    }

    #[test]
    fn is_affordance_ref_rejects_wrong_shapes() {
        assert!(!is_affordance_ref("aff:short"));
        assert!(!is_affordance_ref("nav:0123456789"));
        assert!(is_affordance_ref(&format!("aff:{}", "a".repeat(10))));
    }
}
