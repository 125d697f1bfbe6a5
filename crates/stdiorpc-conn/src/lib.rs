//! Correlated calls and notifications over one framed stdio stream.
//!
//! This is the layer a language-server client sits on. Wrap the stdout and
//! stdin of a running peer in a [`Connection`], then issue concurrent
//! [`Connection::call`]s and [`Connection::notify`]s. A single read loop
//! routes responses back to their callers through the [`PendingCalls`]
//! registry and hands peer-initiated traffic to an [`InboundHandler`].

pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;

pub use connection::{Connection, ConnectionConfig, ConnectionState, ReadLoop};
pub use error::{Result, RpcError};
pub use handler::{Dispatcher, InboundHandler, NullHandler};
pub use message::{
    Message, Notification, Request, RequestId, Response, ResponseError, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, METHOD_NOT_FOUND, PARSE_ERROR,
    REQUEST_CANCELLED,
};
pub use registry::{CallOutcome, PendingCalls};
