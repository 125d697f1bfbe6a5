use crate::message::{RequestId, ResponseError};

/// Errors that can occur on a connection or a single call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Frame-level error (malformed header, oversized payload, I/O).
    #[error("frame error: {0}")]
    Frame(#[from] stdiorpc_frame::FrameError),

    /// The peer sent a payload that is not a well-formed message.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connection is closed, or closed before the call was answered.
    #[error("connection closed")]
    ConnectionClosed,

    /// The call's deadline elapsed before a response arrived.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A request id was registered twice.
    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),

    /// Every mintable request id is already pending.
    #[error("no free request id: every id is pending")]
    IdSpaceExhausted,

    /// The peer answered with an error payload.
    #[error("peer error: {0}")]
    Peer(ResponseError),

    /// JSON serialization/deserialization error on the local side.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
