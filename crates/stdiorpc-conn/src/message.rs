use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};

/// Envelope version marker carried by every outgoing message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error code: the payload was not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Error code: the payload was not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// Error code: the method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Error code: invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Error code: internal error while handling the request.
pub const INTERNAL_ERROR: i64 = -32603;
/// Error code: the request was cancelled before completion.
pub const REQUEST_CANCELLED: i64 = -32800;

/// Correlation identifier linking a request to its response.
///
/// Locally minted ids are always numbers; peers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(id) => write!(f, "{id}"),
            RequestId::String(id) => write!(f, "{id:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Create an error payload without data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Method-not-found error for `method`.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// Invalid-params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// A call that expects a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A one-way message with no id and no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// The answer to a request.
///
/// `id` is `None` only when the peer reports an error for a request it
/// could not identify (a `null` id on the wire).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: std::result::Result<Value, ResponseError>,
}

impl Response {
    /// Successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    /// Failed response.
    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        Self {
            id: Some(id),
            outcome: Err(error),
        }
    }
}

/// A wire message: exactly one of request, response, or notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Option<&'a RequestId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ResponseError>,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Option<RequestId>>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

/// Distinguishes a field explicitly set to `null` from an absent one.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl Message {
    /// Build a request message.
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(note) => Some(&note.method),
            Message::Response(_) => None,
        }
    }

    /// Serialize to the JSON payload carried inside a frame.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let envelope = match self {
            Message::Request(req) => OutgoingEnvelope {
                jsonrpc: JSONRPC_VERSION,
                id: Some(Some(&req.id)),
                method: Some(&req.method),
                params: req.params.as_ref(),
                result: None,
                error: None,
            },
            Message::Notification(note) => OutgoingEnvelope {
                jsonrpc: JSONRPC_VERSION,
                id: None,
                method: Some(&note.method),
                params: note.params.as_ref(),
                result: None,
                error: None,
            },
            Message::Response(resp) => OutgoingEnvelope {
                jsonrpc: JSONRPC_VERSION,
                id: Some(resp.id.as_ref()),
                method: None,
                params: None,
                result: resp.outcome.as_ref().ok(),
                error: resp.outcome.as_ref().err(),
            },
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Parse and classify a frame payload.
    ///
    /// A message with an id and no method is a response; anything with a
    /// method is a request (with id) or notification (without). Unknown
    /// fields are ignored.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let env: IncomingEnvelope = serde_json::from_slice(payload)
            .map_err(|err| violation(format!("malformed message: {err}")))?;

        if let Some(version) = &env.jsonrpc {
            if version != JSONRPC_VERSION {
                return Err(violation(format!("unsupported jsonrpc version {version:?}")));
            }
        }

        match (env.id, env.method) {
            (Some(id), None) => {
                let outcome = match (env.result, env.error) {
                    (Some(result), None) => Ok(result),
                    (None, Some(error)) => Err(error),
                    (Some(_), Some(_)) => {
                        return Err(violation("response carries both result and error"));
                    }
                    (None, None) => {
                        return Err(violation("response carries neither result nor error"));
                    }
                };
                if id.is_none() && outcome.is_ok() {
                    return Err(violation("successful response has a null id"));
                }
                Ok(Message::Response(Response { id, outcome }))
            }
            (id, Some(method)) => {
                if env.result.is_some() || env.error.is_some() {
                    return Err(violation(format!(
                        "message for method {method:?} carries a result or error"
                    )));
                }
                match id {
                    Some(Some(id)) => Ok(Message::Request(Request {
                        id,
                        method,
                        params: env.params,
                    })),
                    Some(None) => Err(violation(format!("request {method:?} has a null id"))),
                    None => Ok(Message::Notification(Notification {
                        method,
                        params: env.params,
                    })),
                }
            }
            (None, None) => Err(violation("message has neither id nor method")),
        }
    }
}

fn violation(reason: impl Into<String>) -> RpcError {
    RpcError::ProtocolViolation(reason.into())
}
