//! Session, transport and telemetry fabric for a local browser control-plane
//! server: the connection/session/multiplexing/telemetry core that the tool
//! layer (navigate, click, type, ...) is built on top of. See `SPEC_FULL.md`
//! for the full module map; this crate implements everything below the tool
//! boundary.
//!
//! The binary entry point (`main.rs`) hosts the line-delimited JSON-RPC loop
//! described in the external-interfaces section and wires a
//! [`session::SessionManager`] behind it. Tool handlers themselves are an
//! external collaborator and out of scope here; `main.rs` only carries the
//! small set of core RPC methods (`initialize`, `ping`, `tools/list`,
//! `tools/call` dispatch) needed to prove the transport end to end.

pub mod affordance;
pub mod artifact;
pub mod auto_dialog;
pub mod cdp;
pub mod chrome;
pub mod config;
pub mod conn;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod memory;
pub mod native;
pub mod navgraph;
pub mod net_trace;
pub mod policy;
pub mod rpc;
pub mod session;
pub mod telemetry;
pub mod tier0;
pub mod util;
