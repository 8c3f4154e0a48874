//! Picks between [`ExtensionGateway`] and [`ExtensionGatewayPeer`] at startup
//! via a best-effort leader lock, and promotes a peer to leader if the lock
//! frees up while waiting for a connection.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use super::leader::{ExtensionGateway, ExtensionGatewayConfig};
use super::peer::{ExtensionGatewayPeer, ExtensionGatewayPeerConfig};
use super::protocol::GatewayStatus;
use super::ExtensionGatewayApi;
use crate::cdp::types::CdpEvent;
use crate::conn::BatchCommand;
use crate::error::CoreError;
use crate::util::FileLock;

pub struct SharedExtensionGatewayConfig {
    pub host: String,
    pub candidate_ports: Vec<u16>,
    pub expected_extension_id: Option<String>,
    pub server_version: String,
    pub peer_id: Option<String>,
    pub lock_path: PathBuf,
}

/// The params a fresh leader gateway needs if this process ever promotes
/// from peer to leader; kept around because the original config is consumed
/// by whichever backend `start` picks at construction time.
struct GatewayParams {
    host: String,
    candidate_ports: Vec<u16>,
    expected_extension_id: Option<String>,
    server_version: String,
}

/// Facade the rest of the crate talks to regardless of whether this process
/// ended up holding the leader lock. `backend` is swapped in place by
/// [`Self::promote_if_lock_is_free`], so callers never need to re-fetch a
/// new handle after a promotion.
pub struct SharedExtensionGateway {
    backend: RwLock<Arc<dyn ExtensionGatewayApi>>,
    lock: Mutex<FileLock>,
    lock_path: PathBuf,
    params: GatewayParams,
}

impl SharedExtensionGateway {
    #[must_use]
    pub fn start(config: SharedExtensionGatewayConfig) -> Self {
        let lock = FileLock::try_acquire(&config.lock_path);
        let params = GatewayParams {
            host: config.host.clone(),
            candidate_ports: config.candidate_ports.clone(),
            expected_extension_id: config.expected_extension_id.clone(),
            server_version: config.server_version.clone(),
        };
        let backend: Arc<dyn ExtensionGatewayApi> = if lock.is_held() {
            Arc::new(ExtensionGateway::start(ExtensionGatewayConfig {
                host: config.host,
                candidate_ports: config.candidate_ports,
                expected_extension_id: config.expected_extension_id,
                server_version: config.server_version,
            }))
        } else {
            Arc::new(ExtensionGatewayPeer::start(ExtensionGatewayPeerConfig {
                host: config.host,
                candidate_ports: config.candidate_ports,
                peer_id: config.peer_id,
            }))
        };
        Self {
            backend: RwLock::new(backend),
            lock: Mutex::new(lock),
            lock_path: config.lock_path,
            params,
        }
    }

    fn inner(&self) -> Arc<dyn ExtensionGatewayApi> {
        Arc::clone(&self.backend.read().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// If this process is currently a peer and the leader lock has become
    /// free, re-acquire it and swap a freshly-started leader gateway into
    /// `backend` in its place. Spec §4.4: "`wait_for_connection` promotes a
    /// peer to a leader when the lock becomes free."
    async fn promote_if_lock_is_free(&self) {
        if !self.inner().is_proxy() {
            return;
        }
        let new_lock = FileLock::try_acquire(&self.lock_path);
        if !new_lock.is_held() {
            return;
        }
        let old = {
            let mut guard = self.backend.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !guard.is_proxy() {
                // Another call already promoted between the check above and
                // here; let `new_lock` drop and release our redundant hold.
                return;
            }
            let leader: Arc<dyn ExtensionGatewayApi> = Arc::new(ExtensionGateway::start(ExtensionGatewayConfig {
                host: self.params.host.clone(),
                candidate_ports: self.params.candidate_ports.clone(),
                expected_extension_id: self.params.expected_extension_id.clone(),
                server_version: self.params.server_version.clone(),
            }));
            std::mem::replace(&mut *guard, leader)
        };
        *self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = new_lock;
        old.stop().await;
    }
}

#[async_trait]
impl ExtensionGatewayApi for SharedExtensionGateway {
    async fn status(&self) -> GatewayStatus {
        self.inner().status().await
    }

    async fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.promote_if_lock_is_free().await;
        self.inner().wait_for_connection(timeout).await
    }

    async fn rpc_call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, CoreError> {
        self.inner().rpc_call(method, params, timeout).await
    }

    async fn cdp_send(&self, tab_id: &str, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, CoreError> {
        self.inner().cdp_send(tab_id, method, params, timeout).await
    }

    async fn cdp_send_many(
        &self,
        tab_id: &str,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CoreError>> {
        self.inner().cdp_send_many(tab_id, commands, stop_on_error, timeout).await
    }

    fn pop_event(&self, tab_id: &str, event_name: Option<&str>) -> Option<CdpEvent> {
        self.inner().pop_event(tab_id, event_name)
    }

    async fn wait_for_event(&self, tab_id: &str, event_name: Option<&str>, timeout: Duration) -> Option<CdpEvent> {
        self.inner().wait_for_event(tab_id, event_name, timeout).await
    }

    fn is_proxy(&self) -> bool {
        self.inner().is_proxy()
    }

    async fn stop(&self) {
        self.inner().stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_starter_becomes_leader() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("gateway.lock");
        let gw = SharedExtensionGateway::start(SharedExtensionGatewayConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![0],
            expected_extension_id: None,
            server_version: "test".to_string(),
            peer_id: Some("p1".to_string()),
            lock_path,
        });
        assert!(!gw.is_proxy());
        gw.stop().await;
    }

    #[tokio::test]
    async fn second_starter_on_the_same_lock_becomes_a_peer() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("gateway.lock");
        let leader = SharedExtensionGateway::start(SharedExtensionGatewayConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![0],
            expected_extension_id: None,
            server_version: "test".to_string(),
            peer_id: Some("p1".to_string()),
            lock_path: lock_path.clone(),
        });
        let follower = SharedExtensionGateway::start(SharedExtensionGatewayConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![0],
            expected_extension_id: None,
            server_version: "test".to_string(),
            peer_id: Some("p2".to_string()),
            lock_path,
        });
        assert!(!leader.is_proxy());
        assert!(follower.is_proxy());
        leader.stop().await;
        follower.stop().await;
    }

    #[tokio::test]
    async fn peer_promotes_to_leader_once_the_lock_frees() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("gateway.lock");
        let leader = SharedExtensionGateway::start(SharedExtensionGatewayConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![0],
            expected_extension_id: None,
            server_version: "test".to_string(),
            peer_id: Some("p1".to_string()),
            lock_path: lock_path.clone(),
        });
        let follower = SharedExtensionGateway::start(SharedExtensionGatewayConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![0],
            expected_extension_id: None,
            server_version: "test".to_string(),
            peer_id: Some("p2".to_string()),
            lock_path,
        });
        assert!(follower.is_proxy());

        leader.stop().await;
        drop(leader);

        follower.wait_for_connection(Duration::from_millis(50)).await;
        assert!(!follower.is_proxy());

        follower.stop().await;
    }
}
