//! Bidirectional JSON-RPC 2.0 client over a child's stdio.
//!
//! Wire format: one JSON message per line on both directions. The client
//! multiplexes concurrent requests over the single pipe, correlating
//! responses by id; server-initiated notifications are routed to an optional
//! sink and otherwise logged and dropped.

use crate::error::RpcError;
use crate::ChildIo;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// MCP protocol revision spoken to children.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// A server-initiated notification (`method` + optional `params`).
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    /// Per-call deadline for high-level operations.
    pub call_timeout: Duration,
    pub client_name: String,
    pub client_version: String,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        RpcClientOptions {
            call_timeout: Duration::from_secs(30),
            client_name: "mcp-registry".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// JSON-RPC client bound to one child. Cheap to share behind an `Arc`;
/// callers may issue concurrent requests.
pub struct RpcClient {
    writer: SharedWriter,
    pending: PendingMap,
    next_id: AtomicI64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    notify_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>>,
    opts: RpcClientOptions,
}

impl RpcClient {
    /// Build a client over arbitrary stream halves (tests use in-memory
    /// pipes; production uses child stdio via [`RpcClient::for_child`]).
    pub fn new<R, W>(reader: R, writer: W, opts: RpcClientOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let notify_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>> =
            Arc::new(Mutex::new(None));
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));

        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            cancel.clone(),
            Arc::clone(&notify_tx),
            Arc::clone(&writer),
        ));

        RpcClient {
            writer,
            pending,
            next_id: AtomicI64::new(1),
            cancel,
            tasks: Mutex::new(vec![reader_task]),
            notify_tx,
            opts,
        }
    }

    /// Wrap a spawned child's stdio. Also drains the child's stderr to the
    /// log so a chatty child cannot fill the pipe and stall.
    #[must_use]
    pub fn for_child(io: ChildIo, opts: RpcClientOptions) -> Self {
        let client = RpcClient::new(io.stdout, io.stdin, opts);
        if let Some(stderr) = io.stderr {
            let cancel = client.cancel.clone();
            let drain = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => tracing::debug!(target: "child_stderr", "{line}"),
                            _ => break,
                        }
                    }
                }
            });
            client.tasks.lock().push(drain);
        }
        client
    }

    /// Take the notification stream. Before this is called, notifications
    /// are logged at debug and discarded.
    #[must_use]
    pub fn take_notifications(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.lock() = Some(tx);
        rx
    }

    /// Send a request and await its response with the default deadline.
    ///
    /// # Errors
    ///
    /// `Timeout` after the deadline (the pending slot is removed), `Remote`
    /// for a JSON-RPC error response, `ConnectionClosed` if the child's
    /// stdout ends first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, self.opts.call_timeout)
            .await
    }

    /// Send a request with an explicit per-call deadline.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::request`].
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // Removes the slot if this call times out or its future is dropped.
        let guard = PendingGuard {
            id,
            pending: Arc::clone(&self.pending),
            armed: true,
        };

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write_line(&message).await?;

        match tokio::time::timeout(timeout, rx).await {
            // The reader removed the slot when it delivered.
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(RpcError::ConnectionClosed)
            }
            Err(_) => {
                drop(guard);
                tracing::warn!(method = %method, timeout_secs = timeout.as_secs(), "rpc call timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a notification (no id, no reply expected).
    ///
    /// # Errors
    ///
    /// Returns an IO error if the child's stdin is gone.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&message).await
    }

    /// MCP handshake: `initialize`, then the `notifications/initialized`
    /// notification. Returns the server's capabilities object.
    ///
    /// # Errors
    ///
    /// Propagates request errors; a handshake failure leaves the client
    /// usable only for `close`.
    pub async fn initialize(&self) -> Result<Value, RpcError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.opts.client_name,
                "version": self.opts.client_version,
            },
        });
        let result = self.request("initialize", params).await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(result.get("capabilities").cloned().unwrap_or_else(|| json!({})))
    }

    /// `tools/list`; `method not found` means "no tools capability".
    ///
    /// # Errors
    ///
    /// Propagates transport/timeout errors.
    pub async fn list_tools(&self) -> Result<Vec<Value>, RpcError> {
        self.list("tools/list", "tools").await
    }

    /// `resources/list`; `method not found` maps to an empty list.
    ///
    /// # Errors
    ///
    /// Propagates transport/timeout errors.
    pub async fn list_resources(&self) -> Result<Vec<Value>, RpcError> {
        self.list("resources/list", "resources").await
    }

    /// `prompts/list`; `method not found` maps to an empty list.
    ///
    /// # Errors
    ///
    /// Propagates transport/timeout errors.
    pub async fn list_prompts(&self) -> Result<Vec<Value>, RpcError> {
        self.list("prompts/list", "prompts").await
    }

    async fn list(&self, method: &str, field: &str) -> Result<Vec<Value>, RpcError> {
        match self.request(method, json!({})).await {
            Ok(result) => Ok(result
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()),
            Err(e) if e.is_method_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// `tools/call`. Returns the result's `content` blocks as-is.
    ///
    /// # Errors
    ///
    /// `Remote` carries the child's JSON-RPC error verbatim.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(result.get("content").cloned().unwrap_or_else(|| json!([])))
    }

    /// Cancel the reader, close the child's stdin and fail anything still
    /// pending with `ConnectionClosed`.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        let _ = self.writer.lock().await.shutdown().await;
        fail_all_pending(&self.pending);
    }

    async fn write_line(&self, message: &Value) -> Result<(), RpcError> {
        write_framed(&self.writer, message).await
    }
}

struct PendingGuard {
    id: i64,
    pending: PendingMap,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending.lock().remove(&self.id);
        }
    }
}

async fn read_loop<R>(
    reader: R,
    pending: PendingMap,
    cancel: CancellationToken,
    notify_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>>,
    writer: SharedWriter,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => route_line(&line, &pending, &notify_tx, &writer).await,
            Ok(None) => {
                tracing::debug!("child stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading child stdout");
                break;
            }
        }
    }
    fail_all_pending(&pending);
}

async fn route_line(
    line: &str,
    pending: &PendingMap,
    notify_tx: &Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>>,
    writer: &SharedWriter,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let message: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed line from child");
            return;
        }
    };

    let id = message.get("id").and_then(Value::as_i64);
    let method = message.get("method").and_then(Value::as_str);
    let has_result = message.get("result").is_some();
    let has_error = message.get("error").is_some();

    if let Some(id) = id
        && (has_result || has_error)
    {
        let Some(slot) = pending.lock().remove(&id) else {
            tracing::debug!(id, "dropping late or unknown response");
            return;
        };
        let outcome = if has_error {
            let error = &message["error"];
            Err(RpcError::Remote {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(message["result"].clone())
        };
        // A cancelled caller dropped the receiver; that is fine.
        let _ = slot.send(outcome);
        return;
    }

    // Server-initiated request: answer pings, refuse anything else.
    if let (Some(id), Some(method)) = (message.get("id"), method) {
        let reply = if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            tracing::debug!(method = %method, "refusing server-initiated request");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" },
            })
        };
        if let Err(e) = write_framed(writer, &reply).await {
            tracing::warn!(error = %e, "failed to answer server-initiated request");
        }
        return;
    }

    if let Some(method) = method {
        let notification = Notification {
            method: method.to_string(),
            params: message.get("params").cloned(),
        };
        let sink = notify_tx.lock();
        match sink.as_ref() {
            Some(tx) if tx.send(notification.clone()).is_ok() => {}
            _ => tracing::debug!(method = %notification.method, "discarding server notification"),
        }
        return;
    }

    tracing::warn!("skipping message that is neither response nor notification");
}

async fn write_framed(writer: &SharedWriter, message: &Value) -> Result<(), RpcError> {
    let mut framed = serde_json::to_string(message)?;
    framed.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn fail_all_pending(pending: &PendingMap) {
    let slots: Vec<_> = {
        let mut map = pending.lock();
        map.drain().collect()
    };
    for (_, slot) in slots {
        let _ = slot.send(Err(RpcError::ConnectionClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct FakeServer {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.expect("read line");
            serde_json::from_str(&line).expect("valid json from client")
        }

        async fn send(&mut self, value: &Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.expect("write");
        }

        async fn reply_ok(&mut self, id: i64, result: Value) {
            self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
                .await;
        }

        async fn reply_err(&mut self, id: i64, code: i64, message: &str) {
            self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }))
            .await;
        }
    }

    fn pair(opts: RpcClientOptions) -> (RpcClient, FakeServer) {
        let (client_side, server_side) = tokio::io::duplex(16 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);
        let client = RpcClient::new(client_read, client_write, opts);
        let server = FakeServer {
            reader: BufReader::new(server_read),
            writer: server_write,
        };
        (client, server)
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_framed_one_per_line() {
        let (client, mut server) = pair(RpcClientOptions::default());

        let echo = tokio::spawn(async move {
            for _ in 0..2 {
                let req = server.recv().await;
                let id = req["id"].as_i64().unwrap();
                server.reply_ok(id, json!({"ok": id})).await;
            }
            server
        });

        let first = client.request("a", json!({})).await.unwrap();
        let second = client.request("b", json!({})).await.unwrap();
        assert_eq!(first["ok"], 1);
        assert_eq!(second["ok"], 2);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_the_right_waiters() {
        let (client, mut server) = pair(RpcClientOptions::default());
        let client = Arc::new(client);

        let server_task = tokio::spawn(async move {
            let first = server.recv().await;
            let second = server.recv().await;
            // Answer the second request first.
            let tools = json!({"tools": [{"name": "t"}]});
            let resources = json!({"resources": [{"uri": "r"}]});
            let (first_id, second_id) =
                (first["id"].as_i64().unwrap(), second["id"].as_i64().unwrap());
            assert_eq!(first["method"], "tools/list");
            assert_eq!(second["method"], "resources/list");
            server.reply_ok(second_id, resources).await;
            server.reply_ok(first_id, tools).await;
        });

        let c1 = Arc::clone(&client);
        let tools = tokio::spawn(async move { c1.list_tools().await });
        // Order the writes deterministically.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let resources = client.list_resources().await.unwrap();
        let tools = tools.await.unwrap().unwrap();

        assert_eq!(tools[0]["name"], "t");
        assert_eq!(resources[0]["uri"], "r");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_removes_the_pending_slot() {
        let (client, mut server) = pair(RpcClientOptions {
            call_timeout: Duration::from_millis(100),
            ..RpcClientOptions::default()
        });

        let err = client.request("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(client.pending.lock().is_empty());

        // A late reply is silently dropped and does not poison later calls.
        let req = server.recv().await;
        server.reply_ok(req["id"].as_i64().unwrap(), json!("late")).await;

        let answer = tokio::spawn(async move {
            let req = server.recv().await;
            server.reply_ok(req["id"].as_i64().unwrap(), json!("fresh")).await;
        });
        let fresh = client
            .request_with_timeout("fast", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fresh, json!("fresh"));
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_fails_all_pending_with_connection_closed() {
        let (client, server) = pair(RpcClientOptions::default());
        let client = Arc::new(client);

        let c1 = Arc::clone(&client);
        let in_flight = tokio::spawn(async move { c1.request("hang", json!({})).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(server); // both halves gone: EOF on the client's reader

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn method_not_found_yields_empty_lists() {
        let (client, mut server) = pair(RpcClientOptions::default());

        let server_task = tokio::spawn(async move {
            for _ in 0..2 {
                let req = server.recv().await;
                server
                    .reply_err(req["id"].as_i64().unwrap(), -32601, "method not found")
                    .await;
            }
            // But tools/call errors pass through verbatim.
            let req = server.recv().await;
            server
                .reply_err(req["id"].as_i64().unwrap(), -32000, "tool exploded")
                .await;
        });

        assert!(client.list_resources().await.unwrap().is_empty());
        assert!(client.list_prompts().await.unwrap().is_empty());

        let err = client.call_tool("x", json!({})).await.unwrap_err();
        match err {
            RpcError::Remote { code, message } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "tool exploded");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn initialize_handshake_and_initialized_notification() {
        let (client, mut server) = pair(RpcClientOptions::default());

        let server_task = tokio::spawn(async move {
            let init = server.recv().await;
            assert_eq!(init["method"], "initialize");
            assert_eq!(init["params"]["protocolVersion"], PROTOCOL_VERSION);
            assert_eq!(init["params"]["clientInfo"]["name"], "mcp-registry");
            server
                .reply_ok(
                    init["id"].as_i64().unwrap(),
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "fake", "version": "0"},
                    }),
                )
                .await;

            let initialized = server.recv().await;
            assert_eq!(initialized["method"], "notifications/initialized");
            assert!(initialized.get("id").is_none());
        });

        let capabilities = client.initialize().await.unwrap();
        assert!(capabilities.get("tools").is_some());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn notifications_route_to_the_sink() {
        let (client, mut server) = pair(RpcClientOptions::default());
        let mut notifications = client.take_notifications();

        server
            .send(&json!({
                "jsonrpc": "2.0",
                "method": "notifications/tools/list_changed",
            }))
            .await;

        let n = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.method, "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn server_initiated_ping_is_answered() {
        let (_client, mut server) = pair(RpcClientOptions::default());

        server
            .send(&json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}))
            .await;
        let reply = server.recv().await;
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["result"], json!({}));

        // Other server-initiated requests are refused, not ignored.
        server
            .send(&json!({"jsonrpc": "2.0", "id": 99, "method": "roots/list"}))
            .await;
        let reply = server.recv().await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (client, mut server) = pair(RpcClientOptions::default());

        server.writer.write_all(b"this is not json\n\n").await.unwrap();
        let server_task = tokio::spawn(async move {
            let req = server.recv().await;
            server.reply_ok(req["id"].as_i64().unwrap(), json!("still alive")).await;
        });

        let result = client.request("ping", json!({})).await.unwrap();
        assert_eq!(result, json!("still alive"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn close_fails_in_flight_calls() {
        let (client, _server) = pair(RpcClientOptions::default());
        let client = Arc::new(client);

        let c1 = Arc::clone(&client);
        let in_flight = tokio::spawn(async move { c1.request("hang", json!({})).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.close().await;
        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn concurrent_callers_each_get_their_own_answer() {
        let (client, mut server) = pair(RpcClientOptions::default());
        let client = Arc::new(client);

        let server_task = tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..8 {
                got.push(server.recv().await);
            }
            // Shuffle replies: evens first, then odds.
            for req in got.iter().filter(|r| r["id"].as_i64().unwrap() % 2 == 0) {
                let id = req["id"].as_i64().unwrap();
                server.reply_ok(id, json!(id)).await;
            }
            for req in got.iter().filter(|r| r["id"].as_i64().unwrap() % 2 == 1) {
                let id = req["id"].as_i64().unwrap();
                server.reply_ok(id, json!(id)).await;
            }
        });

        let mut calls = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&client);
            calls.push(tokio::spawn(async move {
                c.request("echo-id", json!({})).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for call in calls {
            ids.push(call.await.unwrap().as_i64().unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<i64>>());
        server_task.await.unwrap();
    }
}
