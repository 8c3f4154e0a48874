//! Portless alternative to the extension gateway: a small broker process the
//! browser extension launches via Chrome Native Messaging, brokering between
//! the extension (length-prefixed JSON on stdio) and any number of server
//! peers (length-prefixed JSON over a Unix-domain socket). Message shapes are
//! shared with [`crate::gateway::protocol`]; only the framing differs.

pub mod broker;
pub mod discovery;
pub mod peer;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use crate::cdp::types::CdpEvent;
use crate::conn::BatchCommand;
use crate::error::CoreError;

pub use broker::NativeBroker;
pub use discovery::{BrokerRegistration, discover_best_broker, runtime_dir};
pub use peer::NativePeer;

/// Same outward shape as [`crate::gateway::ExtensionGatewayApi`], but backed
/// by an AF_UNIX connection to a native-messaging broker instead of a
/// WebSocket gateway.
#[async_trait]
pub trait NativePeerApi: Send + Sync {
    async fn rpc_call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, CoreError>;

    async fn cdp_send(&self, tab_id: &str, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, CoreError>;

    async fn cdp_send_many(
        &self,
        tab_id: &str,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CoreError>>;

    fn pop_event(&self, tab_id: &str, event_name: Option<&str>) -> Option<CdpEvent>;

    async fn wait_for_event(&self, tab_id: &str, event_name: Option<&str>, timeout: Duration) -> Option<CdpEvent>;

    async fn stop(&self);
}
