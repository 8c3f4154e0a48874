//! The JSON-RPC tool boundary described in §6: line-delimited JSON in on
//! stdin, line-delimited JSON out on stdout. `protocol` holds the wire
//! types; `server` runs the read-dispatch-write loop and defines the
//! [`ToolRegistry`](server::ToolRegistry) seam the (out-of-scope) tool
//! handler layer plugs into.

pub mod protocol;
pub mod server;

pub use protocol::{RequestId, RpcErrorBody, RpcRequest, RpcResponse, ToolDescriptor};
pub use server::{EmptyToolRegistry, ServerContext, ToolRegistry, serve};
