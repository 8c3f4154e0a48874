//! Out-of-band JS dialog auto-handler: `window.alert`/`confirm`/`prompt`/
//! `beforeunload` stall a page's whole CDP connection until something calls
//! `Page.handleJavaScriptDialog`, and an agent observing the stall has no
//! open channel to send that call on — its own connection is the one
//! that's stuck. This opens a short-lived side connection purely to clear
//! the dialog, rate-limited so a flapping page (a script that reopens an
//! alert the instant the last one closes) can't turn this into a busy loop.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::Duration;

use crate::conn::direct::DirectCdpConnection;
use crate::util::now_ms;

/// Minimum time between two dismissal attempts for the same tab.
pub const MIN_INTERVAL_MS: u64 = 500;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissOutcome {
    Dismissed,
    RateLimited,
    ConnectFailed,
    CommandFailed,
}

/// Tracks last-attempt timestamps per tab so [`AutoDialogHandler::dismiss`]
/// can enforce [`MIN_INTERVAL_MS`] without a caller having to.
#[derive(Default)]
pub struct AutoDialogHandler {
    last_attempt_ms: Mutex<HashMap<String, u64>>,
}

impl AutoDialogHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to `ws_url` just long enough to enable `Page` and send
    /// `Page.handleJavaScriptDialog`, then drops the connection. `accept`
    /// chooses accept vs. dismiss; `prompt_text` is only meaningful for
    /// `window.prompt` dialogs.
    pub async fn dismiss(&self, tab_id: &str, ws_url: &str, accept: bool, prompt_text: Option<&str>) -> DismissOutcome {
        {
            let mut guard = self.last_attempt_ms.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = now_ms();
            if let Some(last) = guard.get(tab_id) {
                if now.saturating_sub(*last) < MIN_INTERVAL_MS {
                    return DismissOutcome::RateLimited;
                }
            }
            guard.insert(tab_id.to_string(), now);
        }

        let Ok(conn) = DirectCdpConnection::open(ws_url, CONNECT_TIMEOUT).await else {
            return DismissOutcome::ConnectFailed;
        };

        let _ = conn.send("Page.enable", None, COMMAND_TIMEOUT).await;

        let mut params = serde_json::json!({ "accept": accept });
        if let Some(text) = prompt_text {
            params["promptText"] = serde_json::Value::String(text.to_string());
        }
        let result = conn.send("Page.handleJavaScriptDialog", Some(params), COMMAND_TIMEOUT).await;
        conn.abort().await;

        if result.is_ok() {
            DismissOutcome::Dismissed
        } else {
            DismissOutcome::CommandFailed
        }
    }

    /// Clears the rate-limit history for a tab, e.g. once it's closed.
    pub fn forget(&self, tab_id: &str) {
        self.last_attempt_ms.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(tab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_attempt_within_window_is_rate_limited() {
        let handler = AutoDialogHandler::new();
        // First attempt fails fast against an unreachable port but still
        // records the timestamp before attempting to connect.
        let first = handler.dismiss("tab-1", "ws://127.0.0.1:1/devtools/page/x", true, None).await;
        assert_eq!(first, DismissOutcome::ConnectFailed);
        let second = handler.dismiss("tab-1", "ws://127.0.0.1:1/devtools/page/x", true, None).await;
        assert_eq!(second, DismissOutcome::RateLimited);
    }

    #[tokio::test]
    async fn forget_clears_rate_limit_state() {
        let handler = AutoDialogHandler::new();
        let _ = handler.dismiss("tab-1", "ws://127.0.0.1:1/devtools/page/x", true, None).await;
        handler.forget("tab-1");
        let second = handler.dismiss("tab-1", "ws://127.0.0.1:1/devtools/page/x", true, None).await;
        assert_ne!(second, DismissOutcome::RateLimited);
    }

    #[tokio::test]
    async fn different_tabs_do_not_share_rate_limit_state() {
        let handler = AutoDialogHandler::new();
        let a = handler.dismiss("tab-a", "ws://127.0.0.1:1/devtools/page/a", true, None).await;
        let b = handler.dismiss("tab-b", "ws://127.0.0.1:1/devtools/page/b", true, None).await;
        assert_eq!(a, DismissOutcome::ConnectFailed);
        assert_eq!(b, DismissOutcome::ConnectFailed);
    }
}
