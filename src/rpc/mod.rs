//! Request/reply remote procedure calls over a command tree.
//!
//! A server exposes a [`CommandTree`] of dotted command names such as
//! `scope.stage.set_position`. Clients send `[command, args, kwargs]` as a
//! JSON frame and receive `{"retval": ..., "error": ...}`. The reserved
//! command [`DESCRIBE`] lists every command with its documentation and
//! parameter spec, which lets a client build a [`ProxyNamespace`] mirroring
//! the server's tree.
//!
//! A second socket carries out-of-band `interrupt` messages; see
//! [`Interrupter`]. A third publishes liveness beats; see [`heartbeat`].

pub mod client;
pub mod describe;
pub mod heartbeat;
pub mod namespace;
pub mod server;

pub use client::{InterruptHandle, ProxyFunction, ProxyNamespace, ProxyProperty, RpcClient};
pub use describe::{BoundArgs, CommandDescriptor, ParamSpec};
pub use heartbeat::{HeartbeatClient, HeartbeatMonitor, HeartbeatServer};
pub use namespace::{CallContext, CommandTree, CommandTreeBuilder};
pub use server::{Interrupter, RpcServer, ServerHandle};
pub use crate::messaging::InterruptFlag;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved command returning the descriptor list.
pub const DESCRIBE: &str = "__DESCRIBE__";

/// Payload sent on the interrupt socket.
pub const INTERRUPT_MESSAGE: &[u8] = b"interrupt";

type RequestTuple = (String, Vec<Value>, Map<String, Value>);

/// A call as it travels on the wire: `[command, args, kwargs]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RequestTuple", into = "RequestTuple")]
pub struct RpcRequest {
    /// Dotted command name.
    pub command: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

impl RpcRequest {
    /// Builds a request.
    pub fn new(command: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            args,
            kwargs,
        }
    }

    /// The request that asks a server to describe itself.
    pub fn describe() -> Self {
        Self::new(DESCRIBE, Vec::new(), Map::new())
    }
}

impl From<RequestTuple> for RpcRequest {
    fn from((command, args, kwargs): RequestTuple) -> Self {
        Self::new(command, args, kwargs)
    }
}

impl From<RpcRequest> for RequestTuple {
    fn from(request: RpcRequest) -> Self {
        (request.command, request.args, request.kwargs)
    }
}

/// The server's answer. Exactly one of the two fields is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    /// Return value on success.
    #[serde(default)]
    pub retval: Value,
    /// Error text on failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcReply {
    /// A successful reply.
    pub fn success(retval: Value) -> Self {
        Self {
            retval,
            error: None,
        }
    }

    /// A failed reply.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            retval: Value::Null,
            error: Some(error.into()),
        }
    }
}
