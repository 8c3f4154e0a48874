//! The local WebSocket gateway that multiplexes a single browser-extension
//! attachment across any number of in-process sessions and out-of-process
//! peer processes.
//!
//! [`ExtensionGateway`] binds a port and owns the one extension socket.
//! [`ExtensionGatewayPeer`] behaves identically to local callers but reaches
//! a *different* process's leader over the network instead of binding
//! anything itself. [`SharedExtensionGateway`] picks between the two at
//! startup via a best-effort leader lock and is the facade everything else
//! in the crate talks to.

pub mod leader;
pub mod peer;
pub mod protocol;
pub mod shared;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use crate::cdp::types::CdpEvent;
use crate::conn::BatchCommand;
use crate::error::CoreError;
pub use leader::ExtensionGateway;
pub use peer::ExtensionGatewayPeer;
pub use protocol::{ExtensionCapabilities, ExtensionClientInfo, GatewayStatus};
pub use shared::SharedExtensionGateway;

/// The public surface both the leader and the peer expose identically, so
/// that nothing above this layer needs to know which one it is holding.
#[async_trait]
pub trait ExtensionGatewayApi: Send + Sync {
    async fn status(&self) -> GatewayStatus;

    /// Blocks (bounded by `timeout`) until an extension is attached, for
    /// callers that need to wait through a reconnect window.
    async fn wait_for_connection(&self, timeout: Duration) -> bool;

    async fn rpc_call(&self, method: &str, params: Value, timeout: Duration)
    -> Result<Value, CoreError>;

    async fn cdp_send(
        &self,
        tab_id: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CoreError>;

    async fn cdp_send_many(
        &self,
        tab_id: &str,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CoreError>>;

    fn pop_event(&self, tab_id: &str, event_name: Option<&str>) -> Option<CdpEvent>;

    async fn wait_for_event(
        &self,
        tab_id: &str,
        event_name: Option<&str>,
        timeout: Duration,
    ) -> Option<CdpEvent>;

    /// True for [`ExtensionGatewayPeer`]; lets the session manager avoid
    /// adopting the user's active tab when this process is a follower.
    fn is_proxy(&self) -> bool;

    async fn stop(&self);
}
