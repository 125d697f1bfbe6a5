use std::collections::HashMap;

use serde_json::Value;

use crate::message::ResponseError;

/// Receives peer-initiated requests and notifications.
///
/// Called inline from the read loop: implementations must return promptly,
/// since no further frames are read until they do. Hand long work off to a
/// task and answer from there with a separate call if needed.
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle a request from the peer. The returned value or error is framed
    /// and written back with the request's id.
    fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, ResponseError>;

    /// Handle a notification from the peer.
    fn handle_notification(&self, method: &str, params: Option<Value>);
}

/// Answers every peer request with method-not-found and ignores
/// notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl InboundHandler for NullHandler {
    fn handle_request(&self, method: &str, _params: Option<Value>) -> Result<Value, ResponseError> {
        Err(ResponseError::method_not_found(method))
    }

    fn handle_notification(&self, method: &str, _params: Option<Value>) {
        tracing::debug!(method, "ignoring peer notification");
    }
}

type RequestFn = Box<dyn Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync>;
type NotificationFn = Box<dyn Fn(Option<Value>) + Send + Sync>;

/// Per-method dispatch table for peer-initiated traffic.
///
/// ```
/// use serde_json::json;
/// use stdiorpc_conn::Dispatcher;
///
/// let dispatcher = Dispatcher::new()
///     .on_request("workspace/configuration", |_params| Ok(json!([{}])))
///     .on_notification("window/logMessage", |params| {
///         eprintln!("server log: {params:?}");
///     });
/// # let _ = dispatcher;
/// ```
#[derive(Default)]
pub struct Dispatcher {
    requests: HashMap<String, RequestFn>,
    notifications: HashMap<String, NotificationFn>,
}

impl Dispatcher {
    /// Create an empty dispatch table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests for `method` to `handler`.
    pub fn on_request<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        self.requests.insert(method.into(), Box::new(handler));
        self
    }

    /// Route notifications for `method` to `handler`.
    pub fn on_notification<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.notifications.insert(method.into(), Box::new(handler));
        self
    }
}

impl InboundHandler for Dispatcher {
    fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, ResponseError> {
        match self.requests.get(method) {
            Some(handler) => handler(params),
            None => {
                tracing::debug!(method, "no handler for peer request");
                Err(ResponseError::method_not_found(method))
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match self.notifications.get(method) {
            Some(handler) => handler(params),
            None => tracing::debug!(method, "no handler for peer notification"),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut requests: Vec<_> = self.requests.keys().collect();
        let mut notifications: Vec<_> = self.notifications.keys().collect();
        requests.sort();
        notifications.sort();
        f.debug_struct("Dispatcher")
            .field("requests", &requests)
            .field("notifications", &notifications)
            .finish()
    }
}
