//! Message plumbing shared by the stdio and SSE transports.
//!
//! A transport runs a reader task that feeds every incoming message to
//! [`Shared::dispatch`], and a writer task that drains the outbound queue.
//! Responses are routed to the waiting caller by request id.

mod sse;
mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{
    Incoming, McpNotification, McpRequest, McpResponse, METHOD_NOT_FOUND,
};

pub(crate) use sse::connect_sse;
pub(crate) use stdio::connect_stdio;

/// One serialized message waiting to be written.
pub(crate) struct Outbound {
    /// Set for requests, so a failed write can fail the caller right away.
    pub id: Option<u64>,
    pub body: String,
}

type Pending = HashMap<u64, oneshot::Sender<McpResponse>>;

pub(crate) struct Shared {
    pending: Mutex<Pending>,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Shared {
    fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            outbound,
        })
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handles one message from the server.
    pub fn dispatch(&self, text: &str) {
        let message = match Incoming::parse(text) {
            Ok(message) => message,
            Err(err) => {
                warn!("ignoring malformed message: {err}");
                return;
            }
        };
        match message {
            Incoming::Response(resp) => {
                let Some(id) = resp.id.as_u64() else {
                    warn!("response with an unexpected id: {}", resp.id);
                    return;
                };
                match self.pending().remove(&id) {
                    Some(tx) => {
                        tx.send(resp).ok();
                    }
                    None => debug!("response to unknown or abandoned request {id}"),
                }
            }
            Incoming::Request { id, method } => {
                let reply = if method == "ping" {
                    trace!("answering ping");
                    McpResponse::ok(id, json!({}))
                } else {
                    debug!("rejecting server request `{method}`");
                    McpResponse::err(
                        id,
                        METHOD_NOT_FOUND,
                        format!("method not supported: {method}"),
                    )
                };
                if let Err(err) = self.enqueue(None, &reply) {
                    debug!("failed to answer `{method}`: {err}");
                }
            }
            Incoming::Notification(notification) => {
                debug!("server notification: {}", notification.method);
            }
        }
    }

    /// Drops the waiter of `id`, its caller sees the connection as closed.
    pub fn abandon(&self, id: u64) {
        self.pending().remove(&id);
    }

    /// Marks the connection closed and fails every waiting caller.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("connection closed");
        }
        self.pending().clear();
    }

    fn enqueue<T: Serialize>(&self, id: Option<u64>, message: &T) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let body = serde_json::to_string(message)?;
        trace!("sending: {body}");
        self.outbound
            .send(Outbound { id, body })
            .map_err(|_| Error::Closed)
    }
}

struct Waiter<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.shared.abandon(self.id);
    }
}

/// A live connection to one server.
pub(crate) struct Connection {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
}

impl Connection {
    fn new(
        shared: Arc<Shared>,
        tasks: Vec<JoinHandle<()>>,
        child: Option<Child>,
    ) -> Self {
        Self {
            shared,
            next_id: AtomicU64::new(1),
            tasks,
            child: Mutex::new(child),
        }
    }

    /// Sends a request and waits for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = McpRequest::new(id, method);
        request.params = params;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        // Removes the waiter on every exit, including when the caller drops
        // this future.
        let _waiter = Waiter {
            shared: &self.shared,
            id,
        };
        self.shared.enqueue(Some(id), &request)?;

        match timeout(limit, rx).await {
            Ok(Ok(resp)) => resp.into_result(),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout {
                method: method.to_owned(),
                timeout: limit,
            }),
        }
    }

    /// Returns `true` once the connection can no longer be used.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Sends a notification.
    pub fn notify(&self, method: &str) -> Result<()> {
        self.shared.enqueue(None, &McpNotification::new(method))
    }

    /// Closes the connection, stopping the tasks and the server process.
    pub async fn shutdown(&self) {
        self.shared.close();
        for task in &self.tasks {
            task.abort();
        }
        let child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut child) = child {
            if let Err(err) = child.start_kill() {
                debug!("failed to kill server process: {err}");
            }
            match timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!("server process exited: {status}"),
                Ok(Err(err)) => warn!("failed to reap server process: {err}"),
                Err(_) => warn!("server process did not exit in time"),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close();
        for task in &self.tasks {
            task.abort();
        }
        // The child, if any, is killed on drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Shared::new(tx), rx)
    }

    #[test]
    fn test_routes_response() {
        let (shared, _rx) = shared();
        let (tx, mut rx) = oneshot::channel();
        shared.pending().insert(4, tx);
        shared.dispatch(r#"{"jsonrpc":"2.0","id":4,"result":{"ok":true}}"#);
        let resp = rx.try_recv().unwrap();
        assert_eq!(resp.result, Some(json!({ "ok": true })));
        assert!(shared.pending().is_empty());
    }

    #[test]
    fn test_answers_server_requests() {
        let (shared, mut rx) = shared();
        shared.dispatch(r#"{"jsonrpc":"2.0","id":"p","method":"ping"}"#);
        shared.dispatch(r#"{"jsonrpc":"2.0","id":9,"method":"sampling/createMessage"}"#);

        let pong: Value = serde_json::from_str(&rx.try_recv().unwrap().body).unwrap();
        assert_eq!(pong, json!({ "jsonrpc": "2.0", "id": "p", "result": {} }));
        let rejected: Value = serde_json::from_str(&rx.try_recv().unwrap().body).unwrap();
        assert_eq!(rejected["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn test_close_fails_waiters() {
        let (shared, _rx) = shared();
        let (tx, mut rx) = oneshot::channel();
        shared.pending().insert(1, tx);
        shared.close();
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            shared.enqueue(None, &McpNotification::new("x")),
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (shared, _rx) = shared();
        let connection = Connection::new(Arc::clone(&shared), vec![], None);
        let err = connection
            .request("tools/list", None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(shared.pending().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_requests_leave_no_waiters() {
        let (shared, mut rx) = shared();
        let connection = Connection::new(Arc::clone(&shared), vec![], None);
        for _ in 0..3 {
            let request =
                connection.request("tools/call", None, Duration::from_secs(60));
            assert!(timeout(Duration::from_millis(5), request).await.is_err());
        }
        assert!(shared.pending().is_empty());

        // A late reply to a cancelled request is dropped quietly.
        let sent: Value = serde_json::from_str(&rx.try_recv().unwrap().body).unwrap();
        let id = sent["id"].clone();
        shared.dispatch(&json!({ "jsonrpc": "2.0", "id": id, "result": {} }).to_string());
        assert!(shared.pending().is_empty());
    }

    #[tokio::test]
    async fn test_answered_request() {
        let (shared, mut rx) = shared();
        let connection = Connection::new(Arc::clone(&shared), vec![], None);
        let server = async {
            let outbound = rx.recv().await.unwrap();
            let id = outbound.id.unwrap();
            shared.dispatch(
                &json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": [] } })
                    .to_string(),
            );
        };
        let (result, ()) = tokio::join!(
            connection.request("tools/list", None, Duration::from_secs(5)),
            server
        );
        assert_eq!(result.unwrap(), json!({ "tools": [] }));
        assert!(shared.pending().is_empty());
    }
}
