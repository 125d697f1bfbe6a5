use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stdiorpc_frame::{ContentLengthCodec, FrameConfig, FrameError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::handler::InboundHandler;
use crate::message::{Message, RequestId, Response, ResponseError};
use crate::registry::PendingCalls;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Read loop running, writes permitted.
    Open,
    /// `close` was called; new calls are refused while the read loop stops.
    Closing,
    /// Read loop exited and every pending call has been resolved.
    Closed,
}

/// Configuration for a [`Connection`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Frame size limits applied in both directions.
    pub frame: FrameConfig,
    /// Deadline applied to calls that don't pass their own. Default: none.
    pub default_timeout: Option<Duration>,
}

struct Shared {
    writer: Mutex<FramedWrite<BoxedWriter, ContentLengthCodec>>,
    pending: PendingCalls,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    config: ConnectionConfig,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Encode and write one message. Holds the write lock for exactly one
    /// frame so concurrent writers never interleave.
    ///
    /// Gives up with [`RpcError::ConnectionClosed`] as soon as the connection
    /// shuts down, even if the peer has stopped draining its input. A write
    /// abandoned mid-flush leaves the whole frame in the sink's buffer, so
    /// the next writer completes it before its own.
    async fn write(&self, message: &Message) -> Result<()> {
        let payload = Bytes::from(message.to_vec()?);
        let sent = async {
            let mut writer = self.writer.lock().await;
            writer.send(payload).await
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RpcError::ConnectionClosed),
            sent = sent => sent.map_err(|err| self.write_failed(err)),
        }
    }

    async fn dispatch(&self, handler: &dyn InboundHandler, message: Message) -> Result<()> {
        match message {
            Message::Response(response) => {
                self.route_response(response);
                Ok(())
            }
            Message::Notification(notification) => {
                tracing::debug!(method = %notification.method, "peer notification");
                handler.handle_notification(&notification.method, notification.params);
                Ok(())
            }
            Message::Request(request) => {
                tracing::debug!(id = %request.id, method = %request.method, "peer request");
                let outcome = handler.handle_request(&request.method, request.params);
                let reply = Message::Response(Response {
                    id: Some(request.id.clone()),
                    outcome,
                });
                match self.write(&reply).await {
                    Err(RpcError::Frame(err @ FrameError::PayloadTooLarge { .. })) => {
                        tracing::warn!(id = %request.id, error = %err, "reply too large, answering with internal error");
                        let fallback = Message::Response(Response::failure(
                            request.id,
                            ResponseError::internal(format!("response not sent: {err}")),
                        ));
                        self.write(&fallback).await
                    }
                    written => written,
                }
            }
        }
    }

    fn route_response(&self, response: Response) {
        let Some(id) = response.id else {
            if let Err(error) = &response.outcome {
                tracing::warn!(%error, "peer reported an error for an unidentified request");
            }
            return;
        };
        self.pending.resolve(&id, response.outcome.map_err(RpcError::Peer));
    }

    fn write_failed(&self, err: FrameError) -> RpcError {
        match err {
            FrameError::Io(_) | FrameError::ConnectionClosed => {
                tracing::debug!(error = %err, "write failed, tearing down connection");
                self.shutdown.cancel();
                RpcError::ConnectionClosed
            }
            other => RpcError::Frame(other),
        }
    }
}

/// One RPC connection to a peer over a read/write stream pair.
///
/// Cheap to clone; all clones share the same streams, registry, and read
/// loop. Any number of tasks may [`call`](Self::call) and
/// [`notify`](Self::notify) concurrently.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// The connection's single reader. Obtain it from [`Connection::new`] and
/// drive it with [`ReadLoop::run`], or let [`Connection::spawn`] do both.
pub struct ReadLoop {
    shared: Arc<Shared>,
    frames: FramedRead<BoxedReader, ContentLengthCodec>,
    handler: Arc<dyn InboundHandler>,
}

impl Connection {
    /// Wrap a stream pair without starting the read loop.
    ///
    /// Nothing is read until the returned [`ReadLoop`] is run; responses to
    /// calls made before then are simply delivered once it starts.
    pub fn new<R, W, H>(reader: R, writer: W, handler: H, config: ConnectionConfig) -> (Self, ReadLoop)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: InboundHandler,
    {
        let codec = ContentLengthCodec::with_config(config.frame.clone());
        let (state, _) = watch::channel(ConnectionState::Open);
        let shared = Arc::new(Shared {
            writer: Mutex::new(FramedWrite::new(Box::new(writer) as BoxedWriter, codec.clone())),
            pending: PendingCalls::new(),
            state,
            shutdown: CancellationToken::new(),
            config,
        });

        let read_loop = ReadLoop {
            shared: Arc::clone(&shared),
            frames: FramedRead::new(Box::new(reader) as BoxedReader, codec),
            handler: Arc::new(handler),
        };

        (Self { shared }, read_loop)
    }

    /// Wrap a stream pair and run the read loop on a new tokio task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W, H>(reader: R, writer: W, handler: H, config: ConnectionConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: InboundHandler,
    {
        let (conn, read_loop) = Self::new(reader, writer, handler, config);
        tokio::spawn(read_loop.run(CancellationToken::new()));
        conn
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` overrides the configured default deadline and covers both
    /// writing the request and waiting for the answer. On timeout the
    /// pending entry is evicted and a late response is dropped; no
    /// cancellation is sent to the peer. Dropping the returned future has the
    /// same effect.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        self.ensure_open()?;

        let limit = timeout.or(self.shared.config.default_timeout);
        let (id, completion) = self.shared.pending.register_next()?;
        let mut guard = PendingGuard::new(&self.shared.pending, id.clone());

        let request = Message::request(id.clone(), method, params);
        let exchange = async {
            self.shared.write(&request).await?;
            tracing::debug!(%id, method, "request sent");
            let received = completion.await;
            guard.disarm();
            received.unwrap_or(Err(RpcError::ConnectionClosed))
        };

        match limit {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(%id, method, ?limit, "request timed out");
                    Err(RpcError::Timeout(limit))
                }
            },
            None => exchange.await,
        }
    }

    /// Typed variant of [`call`](Self::call) using the default deadline.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(method, Some(params), None).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a notification. Returns once the frame is written; no reply is
    /// expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_open()?;

        let notification = Message::notification(method, params);
        self.shared.write(&notification).await?;
        tracing::debug!(method, "notification sent");
        Ok(())
    }

    /// Typed variant of [`notify`](Self::notify).
    pub async fn notify_with<P>(&self, method: &str, params: &P) -> Result<()>
    where
        P: Serialize + ?Sized,
    {
        let params = serde_json::to_value(params)?;
        self.notify(method, Some(params)).await
    }

    /// Stop the connection.
    ///
    /// New calls and notifications fail immediately with
    /// [`RpcError::ConnectionClosed`]. Waits until the read loop has exited
    /// and every pending call has been resolved, so the read loop must have
    /// been started.
    pub async fn close(&self) {
        let began = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if began {
            tracing::debug!(pending = self.shared.pending.len(), "closing connection");
        }
        self.shared.shutdown.cancel();
        self.closed().await;
    }

    /// Wait until the connection reaches [`ConnectionState::Closed`],
    /// without initiating shutdown.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.shared.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(RpcError::ConnectionClosed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl ReadLoop {
    /// Read and route frames until the peer closes the stream, the peer
    /// sends something malformed, `ctx` is cancelled, or the connection is
    /// closed.
    ///
    /// On exit every pending call is resolved with
    /// [`RpcError::ConnectionClosed`] and the connection becomes
    /// [`ConnectionState::Closed`]. Returns the transport error that ended
    /// the loop, if any; a clean end of stream or cancellation is `Ok`.
    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        let ReadLoop {
            shared,
            mut frames,
            handler,
        } = self;
        let shutdown = shared.shutdown.clone();

        let ended: Result<()> = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = ctx.cancelled() => break Ok(()),
                next = frames.next() => next,
            };

            let payload = match next {
                None | Some(Err(FrameError::ConnectionClosed)) => break Ok(()),
                Some(Err(err)) => break Err(RpcError::Frame(err)),
                Some(Ok(payload)) => payload,
            };

            let message = match Message::from_slice(&payload) {
                Ok(message) => message,
                Err(err) => break Err(err),
            };

            let dispatched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = ctx.cancelled() => break Ok(()),
                dispatched = shared.dispatch(handler.as_ref(), message) => dispatched,
            };
            if let Err(err) = dispatched {
                break Err(err);
            }
        };

        let result = match ended {
            Ok(()) | Err(RpcError::ConnectionClosed) => {
                tracing::debug!("read loop finished");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "read loop terminated by transport error");
                Err(err)
            }
        };

        let abandoned = shared.pending.abandon_all(|| RpcError::ConnectionClosed);
        if abandoned > 0 {
            tracing::debug!(abandoned, "resolved pending calls with connection closed");
        }
        shared.shutdown.cancel();
        shared.state.send_replace(ConnectionState::Closed);

        result
    }
}

impl fmt::Debug for ReadLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLoop")
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

/// Evicts a pending entry when the waiting call ends without a response
/// (timeout, write failure, or the call future being dropped).
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: Option<RequestId>,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a PendingCalls, id: RequestId) -> Self {
        Self {
            pending,
            id: Some(id),
        }
    }

    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.pending.remove(&id) {
                tracing::trace!(%id, "evicted abandoned call");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::handler::{Dispatcher, NullHandler};
    use crate::message::{ResponseError, INTERNAL_ERROR, METHOD_NOT_FOUND};

    /// The far end of the stream pair, driven by hand.
    struct ScriptedPeer {
        frames: FramedRead<ReadHalf<DuplexStream>, ContentLengthCodec>,
        sink: FramedWrite<WriteHalf<DuplexStream>, ContentLengthCodec>,
    }

    impl ScriptedPeer {
        async fn recv(&mut self) -> Value {
            let payload = self
                .frames
                .next()
                .await
                .expect("peer stream ended")
                .expect("peer read failed");
            serde_json::from_slice(&payload).expect("payload should be json")
        }

        async fn send(&mut self, value: Value) {
            let payload = serde_json::to_vec(&value).unwrap();
            self.sink.send(Bytes::from(payload)).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            let stream = self.sink.get_mut();
            stream.write_all(bytes).await.unwrap();
            stream.flush().await.unwrap();
        }
    }

    fn connect<H: InboundHandler>(handler: H, config: ConnectionConfig) -> (Connection, ScriptedPeer) {
        connect_with_capacity(handler, config, 64 * 1024)
    }

    /// A small `capacity` lets a peer that stops reading stall our writes.
    fn connect_with_capacity<H: InboundHandler>(
        handler: H,
        config: ConnectionConfig,
        capacity: usize,
    ) -> (Connection, ScriptedPeer) {
        let (local, remote) = tokio::io::duplex(capacity);
        let (read, write) = tokio::io::split(local);
        let conn = Connection::spawn(read, write, handler, config);

        let (peer_read, peer_write) = tokio::io::split(remote);
        let peer = ScriptedPeer {
            frames: FramedRead::new(peer_read, ContentLengthCodec::new()),
            sink: FramedWrite::new(peer_write, ContentLengthCodec::new()),
        };
        (conn, peer)
    }

    fn reply(id: &Value, result: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "result": result})
    }

    #[tokio::test]
    async fn call_resolves_with_peer_result() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("ping", Some(json!({})), None).await })
        };

        let request = peer.recv().await;
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "ping");
        assert_eq!(request["params"], json!({}));
        assert_eq!(request["id"], 1);

        peer.send(reply(&request["id"], json!({"pong": true}))).await;

        let result = caller.await.unwrap().unwrap();
        assert_eq!(result, json!({"pong": true}));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_answered_in_reverse_order() {
        const K: usize = 8;
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let callers: Vec<_> = (0..K)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let method = format!("method/{i}");
                    let result = conn.call(&method, None, None).await.unwrap();
                    (method, result)
                })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..K {
            requests.push(peer.recv().await);
        }
        for request in requests.iter().rev() {
            peer.send(reply(&request["id"], request["method"].clone())).await;
        }

        for caller in callers {
            let (method, result) = caller.await.unwrap();
            assert_eq!(result, json!(method));
        }
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn timed_out_call_drops_late_response() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let err = conn
            .call("slow", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(conn.pending_calls(), 0);

        let slow = peer.recv().await;

        let next = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("fast", None, None).await })
        };
        let fast = peer.recv().await;
        assert_ne!(slow["id"], fast["id"]);

        peer.send(reply(&slow["id"], json!("late"))).await;
        peer.send(reply(&fast["id"], json!("fresh"))).await;

        assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn default_timeout_applies_when_call_passes_none() {
        let config = ConnectionConfig {
            default_timeout: Some(Duration::from_millis(30)),
            ..ConnectionConfig::default()
        };
        let (conn, _peer) = connect(NullHandler, config);

        let err = conn.call("never", None, None).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
    }

    #[tokio::test]
    async fn dropped_call_future_evicts_entry() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let outer = tokio::time::timeout(Duration::from_millis(30), conn.call("abandon", None, None)).await;
        assert!(outer.is_err());
        assert_eq!(conn.pending_calls(), 0);

        let request = peer.recv().await;
        peer.send(reply(&request["id"], json!(1))).await;
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn notify_writes_frame_without_id() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        conn.notify("initialized", Some(json!({}))).await.unwrap();
        conn.notify_with("$/setTrace", &json!({"value": "off"}))
            .await
            .unwrap();

        let first = peer.recv().await;
        assert!(first.get("id").is_none());
        assert_eq!(first["method"], "initialized");
        assert_eq!(first["jsonrpc"], "2.0");

        let second = peer.recv().await;
        assert!(second.get("id").is_none());
        assert_eq!(second["params"], json!({"value": "off"}));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn close_fans_out_connection_closed() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let callers: Vec<_> = (0..3)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.call(&format!("pending/{i}"), None, None).await })
            })
            .collect();
        for _ in 0..3 {
            peer.recv().await;
        }
        assert_eq!(conn.pending_calls(), 3);

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        for caller in callers {
            let err = caller.await.unwrap().unwrap_err();
            assert!(matches!(err, RpcError::ConnectionClosed));
        }

        let err = conn.call("after", None, None).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        let err = conn.notify("after", None).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));

        // A second close is a no-op.
        conn.close().await;
    }

    #[tokio::test]
    async fn peer_eof_resolves_outstanding_calls() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("orphaned", None, None).await })
        };
        peer.recv().await;
        drop(peer);

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn malformed_header_tears_down_connection() {
        let (local, remote) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(local);
        let (conn, read_loop) = Connection::new(read, write, NullHandler, ConnectionConfig::default());
        let loop_task = tokio::spawn(read_loop.run(CancellationToken::new()));

        let (peer_read, peer_write) = tokio::io::split(remote);
        let mut peer = ScriptedPeer {
            frames: FramedRead::new(peer_read, ContentLengthCodec::new()),
            sink: FramedWrite::new(peer_write, ContentLengthCodec::new()),
        };

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("victim", None, None).await })
        };
        peer.recv().await;
        peer.send_raw(b"Content-Length: lots\r\n\r\n").await;

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));

        let loop_result = loop_task.await.unwrap();
        assert!(matches!(
            loop_result,
            Err(RpcError::Frame(FrameError::InvalidHeader(_)))
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn protocol_violation_tears_down_connection() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("victim", None, None).await })
        };
        let request = peer.recv().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": 1,
            "error": {"code": 1, "message": "both"}
        }))
        .await;

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        conn.closed().await;
    }

    #[tokio::test]
    async fn peer_error_is_surfaced_verbatim() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("unknown/method", None, None).await })
        };
        let request = peer.recv().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": METHOD_NOT_FOUND, "message": "unhandled", "data": {"hint": 1}}
        }))
        .await;

        let err = caller.await.unwrap().unwrap_err();
        match err {
            RpcError::Peer(error) => {
                assert_eq!(
                    error,
                    ResponseError::new(METHOD_NOT_FOUND, "unhandled").with_data(json!({"hint": 1}))
                );
            }
            other => panic!("expected peer error, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn unknown_response_id_is_ignored() {
        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());

        peer.send(reply(&json!(999), json!("stray"))).await;
        peer.send(json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "parse"}}))
            .await;

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("after-stray", None, None).await })
        };
        let request = peer.recv().await;
        peer.send(reply(&request["id"], json!("ok"))).await;

        assert_eq!(caller.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn peer_requests_are_answered_by_handler() {
        let dispatcher = Dispatcher::new().on_request("workspace/configuration", |params| {
            let items = params
                .as_ref()
                .and_then(|p| p["items"].as_array())
                .map(Vec::len)
                .unwrap_or(0);
            Ok(json!(vec![json!({"tabSize": 4}); items]))
        });
        let (_conn, mut peer) = connect(dispatcher, ConnectionConfig::default());

        peer.send(json!({
            "jsonrpc": "2.0",
            "id": "srv-1",
            "method": "workspace/configuration",
            "params": {"items": [{}, {}]}
        }))
        .await;
        let answer = peer.recv().await;
        assert_eq!(answer["id"], "srv-1");
        assert_eq!(answer["result"], json!([{"tabSize": 4}, {"tabSize": 4}]));
        assert!(answer.get("error").is_none());

        peer.send(json!({"jsonrpc": "2.0", "id": 5, "method": "unregistered"}))
            .await;
        let answer = peer.recv().await;
        assert_eq!(answer["id"], 5);
        assert_eq!(answer["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn peer_notifications_reach_handler() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::new()
            .on_notification("window/logMessage", move |params| {
                sink.lock().unwrap().push(params.unwrap_or(Value::Null));
            })
            .on_request("sync", |_| Ok(Value::Null));
        let (_conn, mut peer) = connect(dispatcher, ConnectionConfig::default());

        peer.send(json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"message": "hi"}}))
            .await;
        // Frames are handled in order, so the answer to this request means
        // the notification has been dispatched.
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "sync"})).await;
        peer.recv().await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"message": "hi"})]);
    }

    #[tokio::test]
    async fn typed_request_roundtrip() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Hover {
            contents: String,
        }

        let (conn, mut peer) = connect(NullHandler, ConnectionConfig::default());
        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request::<_, Hover>("textDocument/hover", &json!({"line": 1}))
                    .await
            })
        };

        let request = peer.recv().await;
        assert_eq!(request["params"], json!({"line": 1}));
        peer.send(reply(&request["id"], json!({"contents": "fn main()"})))
            .await;

        assert_eq!(
            caller.await.unwrap().unwrap(),
            Hover {
                contents: "fn main()".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cancelling_run_context_closes_connection() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(local);
        let (conn, read_loop) = Connection::new(read, write, NullHandler, ConnectionConfig::default());

        let ctx = CancellationToken::new();
        let loop_task = tokio::spawn(read_loop.run(ctx.clone()));

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("pending", None, None).await })
        };
        while conn.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        ctx.cancel();
        assert!(loop_task.await.unwrap().is_ok());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            caller.await.unwrap(),
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_call_is_rejected_locally() {
        let config = ConnectionConfig {
            frame: FrameConfig {
                max_payload_size: 64,
                ..FrameConfig::default()
            },
            ..ConnectionConfig::default()
        };
        let (conn, _peer) = connect(NullHandler, config);

        let err = conn
            .call("big", Some(json!("x".repeat(128))), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Frame(FrameError::PayloadTooLarge { .. })
        ));
        assert_eq!(conn.pending_calls(), 0);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn deadline_covers_stalled_write() {
        let (conn, _peer) = connect_with_capacity(NullHandler, ConnectionConfig::default(), 64);
        let limit = Duration::from_millis(100);

        let blocked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("big", Some(json!("x".repeat(4096))), Some(limit)).await })
        };
        // Queued behind the stalled writer's lock.
        let queued = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("small", None, Some(limit)).await })
        };

        for caller in [blocked, queued] {
            let outcome = tokio::time::timeout(Duration::from_secs(2), caller)
                .await
                .expect("deadline should fire while the write is stalled")
                .unwrap();
            assert!(matches!(outcome, Err(RpcError::Timeout(d)) if d == limit));
        }
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn close_releases_call_stalled_in_write() {
        let (conn, _peer) = connect_with_capacity(NullHandler, ConnectionConfig::default(), 64);

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call("big", Some(json!("x".repeat(4096))), None).await })
        };
        while conn.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(2), conn.close())
            .await
            .expect("close should not hang");
        let outcome = tokio::time::timeout(Duration::from_secs(2), caller)
            .await
            .expect("stalled caller should be released")
            .unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn close_interrupts_reply_to_unread_peer() {
        let dispatcher = Dispatcher::new().on_request("big", |_| Ok(json!("x".repeat(4096))));
        let (conn, mut peer) = connect_with_capacity(dispatcher, ConnectionConfig::default(), 64);

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "big"})).await;
        // Give the read loop time to start the stalled reply.
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), conn.close())
            .await
            .expect("close should not hang on a blocked reply");
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn oversized_reply_fails_only_that_request() {
        let config = ConnectionConfig {
            frame: FrameConfig {
                max_payload_size: 1024,
                ..FrameConfig::default()
            },
            ..ConnectionConfig::default()
        };
        let dispatcher = Dispatcher::new()
            .on_request("big", |_| Ok(json!("x".repeat(4096))))
            .on_request("small", |_| Ok(json!("ok")));
        let (conn, mut peer) = connect(dispatcher, config);

        peer.send(json!({"jsonrpc": "2.0", "id": 7, "method": "big"})).await;
        let answer = peer.recv().await;
        assert_eq!(answer["id"], 7);
        assert_eq!(answer["error"]["code"], INTERNAL_ERROR);
        assert!(answer.get("result").is_none());

        peer.send(json!({"jsonrpc": "2.0", "id": 8, "method": "small"})).await;
        let answer = peer.recv().await;
        assert_eq!(answer["id"], 8);
        assert_eq!(answer["result"], "ok");
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn failed_write_tears_down_connection() {
        let (local_read, _peer_write) = tokio::io::duplex(1024);
        let (local_write, peer_read) = tokio::io::duplex(1024);
        // The peer's stdin is gone.
        drop(peer_read);
        let conn = Connection::spawn(local_read, local_write, NullHandler, ConnectionConfig::default());

        let err = conn.call("ping", None, None).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));

        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("connection should close after a failed write");
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.notify("after", None).await,
            Err(RpcError::ConnectionClosed)
        ));
    }
}
