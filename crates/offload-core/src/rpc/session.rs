//! Duplex RPC session with first-class callable references.
//!
//! A [`Session`] never touches a socket. Inbound raw messages are fed
//! through [`Session::handle`]; outbound raw messages appear on the
//! `requests` receiver returned by [`Session::new`], and the owner delivers
//! them. Both peers run the same code.
//!
//! Lifecycle:
//!
//! 1. [`Session::expose`] named capabilities.
//! 2. [`Session::start`] sends them to the peer in a `methods` handshake.
//! 3. When the peer's handshake arrives, the `remote` receiver yields a
//!    [`Remote`] with a proxy per peer capability.
//! 4. [`Session::close`] fails pending calls with [`CallError::Closed`] and
//!    drops the outbound sender so the writer can drain and finish.
//!
//! Handlers run on the thread that calls `handle`, up to their first await
//! point. The rest of each handler runs on a spawned task, so `handle` must
//! be called from within a tokio runtime.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CallError, Error, Result};
use crate::value::{CallResult, Callback, Value};

use super::codec::{Decoder, Encoded, Encoder};
use super::protocol::{Message, Target};
use super::transport::Frame;

/// Channels through which a session talks to its owner.
#[derive(Debug)]
pub struct SessionEvents {
    /// Outbound raw messages, in send order.
    pub requests: mpsc::UnboundedReceiver<serde_json::Value>,
    /// Fires once with the peer's capabilities.
    pub remote: oneshot::Receiver<Remote>,
}

/// Proxies for the capabilities the peer exposed.
#[derive(Debug, Clone, Default)]
pub struct Remote {
    capabilities: BTreeMap<String, Callback>,
}

impl Remote {
    pub fn get(&self, name: &str) -> Option<&Callback> {
        self.capabilities.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    /// Call a peer capability by name.
    ///
    /// The call message is queued before this returns.
    pub fn call(&self, name: &str, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        match self.capabilities.get(name) {
            Some(callback) => callback.call(args),
            None => {
                let reason = format!("peer does not expose '{}'", name);
                async move { Err(CallError::Protocol(reason)) }.boxed()
            }
        }
    }
}

#[derive(Default)]
struct State {
    exposed: FxHashMap<String, Callback>,
    references: FxHashMap<u64, Callback>,
    next_reference: u64,
    pending: FxHashMap<u64, oneshot::Sender<CallResult>>,
    next_call: u64,
    started: bool,
    closed: bool,
    remote: Option<Remote>,
    remote_tx: Option<oneshot::Sender<Remote>>,
    outbound: Option<mpsc::UnboundedSender<serde_json::Value>>,
}

impl State {
    /// Encode values for one message, registering any callables met on the way.
    fn encode<'v>(&mut self, values: impl IntoIterator<Item = &'v Value>) -> Result<Vec<Encoded>> {
        let State {
            references,
            next_reference,
            ..
        } = self;
        let mut register = |callback: &Callback| {
            let id = *next_reference;
            *next_reference += 1;
            references.insert(id, callback.clone());
            id
        };
        let mut encoder = Encoder::new(&mut register);
        values.into_iter().map(|v| encoder.encode(v)).collect()
    }

    fn encode_one(&mut self, value: &Value) -> Result<Encoded> {
        let mut encoded = self.encode([value])?;
        Ok(encoded.remove(0))
    }

    fn send(&mut self, message: &Message) -> bool {
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match serde_json::to_value(message) {
            Ok(raw) => outbound.send(raw).is_ok(),
            Err(e) => {
                tracing::error!("Failed to serialize {:?}: {}", message, e);
                false
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of an RPC session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Session")
            .field("started", &state.started)
            .field("closed", &state.closed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Session {
    pub fn new() -> (Self, SessionEvents) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (remote_tx, remote) = oneshot::channel();
        let state = State {
            remote_tx: Some(remote_tx),
            outbound: Some(requests_tx),
            ..State::default()
        };
        let session = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
        };
        (session, SessionEvents { requests, remote })
    }

    /// Make `callback` reachable by the peer under `name`.
    pub fn expose(&self, name: impl Into<String>, callback: Callback) -> Result<()> {
        let mut state = self.shared.lock();
        if state.started {
            return Err(Error::AlreadyStarted);
        }
        state.exposed.insert(name.into(), callback);
        Ok(())
    }

    /// Send the handshake. Allowed once.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.started {
            return Err(Error::AlreadyStarted);
        }
        state.started = true;

        let mut capabilities: Vec<String> = state.exposed.keys().cloned().collect();
        capabilities.sort();
        tracing::debug!("Session started, exposing {:?}", capabilities);
        if !state.send(&Message::Methods { capabilities }) {
            tracing::warn!("Session handshake could not be queued; session is closed");
        }
        Ok(())
    }

    /// The peer's capabilities, once its handshake has arrived.
    pub fn remote(&self) -> Option<Remote> {
        self.shared.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Interpret one inbound raw message.
    ///
    /// Malformed messages never end the session: an undecodable call is
    /// answered with a fault, and an undecodable response fails only the
    /// call it belongs to.
    pub fn handle(&self, raw: serde_json::Value) {
        let message = match serde_json::from_value::<Message>(raw.clone()) {
            Ok(message) => message,
            Err(e) => {
                self.handle_malformed(&raw, format!("malformed message: {}", e));
                return;
            }
        };

        if self.is_closed() {
            tracing::debug!("Ignoring {:?} on closed session", message.id());
            return;
        }

        match message {
            Message::Methods { capabilities } => self.on_methods(capabilities),
            Message::Call {
                id,
                capability,
                args,
            } => self.on_call(id, capability, args),
            Message::Return { id, result } => {
                let outcome = self.decode(result).map_err(protocol_error);
                self.settle(id, outcome);
            }
            Message::Error { id, error } => {
                let outcome = match self.decode(error) {
                    Ok(payload) => Err(CallError::Rejected(payload)),
                    Err(e) => Err(protocol_error(e)),
                };
                self.settle(id, outcome);
            }
            Message::Fault { id, reason } => self.settle(id, Err(CallError::Protocol(reason))),
        }
    }

    /// Interpret one inbound frame.
    ///
    /// An undecodable frame is treated like a malformed message when its
    /// header names a call: the call is faulted or failed instead of being
    /// left pending.
    pub fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Message(raw) => self.handle(raw),
            Frame::Undecodable { header, reason } => {
                if self.is_closed() {
                    return;
                }
                match header {
                    Some(header) => self.handle_malformed(&header, reason),
                    None => tracing::warn!("Dropping undecodable frame: {}", reason),
                }
            }
        }
    }

    /// End the session. Pending calls fail with [`CallError::Closed`].
    pub fn close(&self) {
        let (pending, exposed, references) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.outbound = None;
            state.remote_tx = None;
            state.remote = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.exposed),
                std::mem::take(&mut state.references),
            )
        };
        tracing::debug!("Session closed with {} pending call(s)", pending.len());
        for (_, slot) in pending {
            let _ = slot.send(Err(CallError::Closed));
        }
        // Handlers often capture the session; release them outside the lock.
        drop(exposed);
        drop(references);
    }

    fn on_methods(&self, names: Vec<String>) {
        let remote = Remote {
            capabilities: names
                .into_iter()
                .map(|name| {
                    let proxy = proxy(&self.shared, Target::Named(name.clone()));
                    (name, proxy)
                })
                .collect(),
        };

        let mut state = self.shared.lock();
        if state.remote.is_some() {
            tracing::warn!("Ignoring repeated handshake from peer");
            return;
        }
        state.remote = Some(remote.clone());
        if let Some(tx) = state.remote_tx.take() {
            let _ = tx.send(remote);
        }
    }

    fn on_call(&self, id: u64, target: Target, args: Vec<Encoded>) {
        let callback = {
            let state = self.shared.lock();
            match &target {
                Target::Named(name) => state.exposed.get(name).cloned(),
                Target::Reference(reference) => state.references.get(reference).cloned(),
            }
        };
        let Some(callback) = callback else {
            self.fault(id, format!("unknown capability {}", target));
            return;
        };

        let args = match self.decode_all(args) {
            Ok(args) => args,
            Err(e) => {
                self.fault(id, format!("undecodable arguments for {}: {}", target, e));
                return;
            }
        };

        tracing::trace!("Dispatching call {} to {}", id, target);
        let pending = callback.call(args);
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let outcome = pending.await;
            if let Some(shared) = weak.upgrade() {
                reply(&shared, id, outcome);
            }
        });
    }

    fn settle(&self, id: u64, outcome: CallResult) {
        let slot = self.shared.lock().pending.remove(&id);
        match slot {
            Some(slot) => {
                let _ = slot.send(outcome);
            }
            None => tracing::debug!("Dropping response for unknown call {}", id),
        }
    }

    fn fault(&self, id: u64, reason: String) {
        tracing::warn!("Call {} failed: {}", id, reason);
        self.shared.lock().send(&Message::Fault { id, reason });
    }

    fn handle_malformed(&self, raw: &serde_json::Value, reason: String) {
        let kind = raw.get("type").and_then(serde_json::Value::as_str);
        let id = raw.get("id").and_then(serde_json::Value::as_u64);
        match (kind, id) {
            (Some("call"), Some(id)) => self.fault(id, reason),
            (Some("return" | "error" | "fault"), Some(id)) => {
                self.settle(id, Err(CallError::Protocol(reason)));
            }
            _ => tracing::warn!("Dropping {}", reason),
        }
    }

    fn decode(&self, encoded: Encoded) -> Result<Value> {
        let shared = &self.shared;
        let make_proxy = |reference| proxy(shared, Target::Reference(reference));
        Decoder::new(&make_proxy).decode(encoded)
    }

    fn decode_all(&self, encoded: Vec<Encoded>) -> Result<Vec<Value>> {
        let shared = &self.shared;
        let make_proxy = |reference| proxy(shared, Target::Reference(reference));
        let mut decoder = Decoder::new(&make_proxy);
        encoded.into_iter().map(|e| decoder.decode(e)).collect()
    }
}

fn protocol_error(error: Error) -> CallError {
    CallError::Protocol(error.to_string())
}

/// Build a callable that forwards to `target` on the peer.
fn proxy(shared: &Arc<Shared>, target: Target) -> Callback {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    Callback::new(move |args| {
        let slot = match weak.upgrade() {
            Some(shared) => send_call(&shared, &target, &args),
            None => Err(CallError::Closed),
        };
        async move {
            match slot {
                Ok(rx) => rx.await.unwrap_or(Err(CallError::Closed)),
                Err(e) => Err(e),
            }
        }
    })
}

fn send_call(
    shared: &Shared,
    target: &Target,
    args: &[Value],
) -> std::result::Result<oneshot::Receiver<CallResult>, CallError> {
    let mut state = shared.lock();
    if state.closed {
        return Err(CallError::Closed);
    }

    let args = state
        .encode(args)
        .map_err(|e| CallError::Protocol(e.to_string()))?;
    let id = state.next_call;
    state.next_call += 1;
    let (tx, rx) = oneshot::channel();
    state.pending.insert(id, tx);

    let message = Message::Call {
        id,
        capability: target.clone(),
        args,
    };
    if !state.send(&message) {
        state.pending.remove(&id);
        return Err(CallError::Closed);
    }
    tracing::trace!("Sent call {} to {}", id, target);
    Ok(rx)
}

fn reply(shared: &Shared, id: u64, outcome: CallResult) {
    let mut state = shared.lock();
    let encoded = match outcome {
        Ok(value) => state.encode_one(&value).map(|result| Message::Return { id, result }),
        Err(CallError::Rejected(payload)) => state
            .encode_one(&payload)
            .map(|error| Message::Error { id, error }),
        Err(e) => Ok(Message::Fault {
            id,
            reason: e.to_string(),
        }),
    };
    let message = encoded.unwrap_or_else(|e| {
        tracing::warn!("Reply to call {} could not be encoded: {}", id, e);
        Message::Fault {
            id,
            reason: e.to_string(),
        }
    });
    if !state.send(&message) {
        tracing::debug!("Reply to call {} dropped; session is closed", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec;
    use crate::value::Node;
    use serde_json::json;

    /// Feed every request of `from` into `to`.
    fn pump(mut requests: mpsc::UnboundedReceiver<serde_json::Value>, to: Session) {
        tokio::spawn(async move {
            while let Some(raw) = requests.recv().await {
                to.handle(raw);
            }
        });
    }

    /// Two started sessions wired to each other, with their remotes.
    async fn connected(
        host: Session,
        host_events: SessionEvents,
        worker: Session,
        worker_events: SessionEvents,
    ) -> (Remote, Remote) {
        pump(host_events.requests, worker.clone());
        pump(worker_events.requests, host.clone());
        host.start().unwrap();
        worker.start().unwrap();
        let host_sees = host_events.remote.await.unwrap();
        let worker_sees = worker_events.remote.await.unwrap();
        (host_sees, worker_sees)
    }

    fn echo() -> Callback {
        Callback::new(|args| async move { Ok(Value::Array(args)) })
    }

    #[tokio::test]
    async fn test_handshake_exposes_peer_capabilities() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        host.expose("resolve", echo()).unwrap();
        host.expose("reject", echo()).unwrap();
        worker.expose("invoke", echo()).unwrap();

        let (host_sees, worker_sees) =
            connected(host.clone(), host_events, worker.clone(), worker_events).await;
        assert_eq!(host_sees.names().collect::<Vec<_>>(), vec!["invoke"]);
        assert_eq!(worker_sees.names().collect::<Vec<_>>(), vec!["reject", "resolve"]);
        assert!(worker.remote().is_some());
    }

    #[tokio::test]
    async fn test_call_returns_value() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        worker.expose("invoke", echo()).unwrap();
        let (remote, _) = connected(host, host_events, worker, worker_events).await;

        let result = remote
            .call("invoke", vec![Value::from(1), Value::from("two")])
            .await
            .unwrap();
        assert_eq!(result, Value::from(vec![Value::from(1), Value::from("two")]));
    }

    #[tokio::test]
    async fn test_rejection_carries_payload() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        worker
            .expose(
                "invoke",
                Callback::new(|_| async { Err(CallError::Rejected(Value::from("nope"))) }),
            )
            .unwrap();
        let (remote, _) = connected(host, host_events, worker, worker_events).await;

        match remote.call("invoke", vec![]).await {
            Err(CallError::Rejected(payload)) => assert_eq!(payload, Value::from("nope")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_callback_argument_round_trips() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        worker
            .expose(
                "invoke",
                Callback::new(|args| async move {
                    match args.first().and_then(Value::as_callback) {
                        Some(callback) => callback.call(vec![Value::from("DATA!")]).await,
                        None => Err(CallError::Rejected(Value::from("no callback"))),
                    }
                }),
            )
            .unwrap();
        let (remote, _) = connected(host, host_events, worker, worker_events).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let callback = Callback::new(move |args| {
            let _ = seen_tx.send(args);
            async { Ok(Value::from("ack")) }
        });

        let result = remote
            .call("invoke", vec![Value::Callback(callback)])
            .await
            .unwrap();
        assert_eq!(result, Value::from("ack"));
        assert_eq!(seen_rx.recv().await.unwrap(), vec![Value::from("DATA!")]);
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cyclic_argument_is_rebuilt() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        worker.expose("invoke", echo()).unwrap();
        let (remote, _) = connected(host, host_events, worker, worker_events).await;

        let node = Node::new(Value::Null);
        node.set(Value::object([
            ("a", Value::from(1)),
            ("b", Value::Shared(node.clone())),
        ]));
        let args = vec![Value::Shared(node.clone()), Value::Shared(node)];

        let result = remote.call("invoke", args.clone()).await.unwrap();
        assert_eq!(result, Value::from(args));

        let items = result.as_array().unwrap();
        let first = items[0].as_node().unwrap();
        assert!(first.ptr_eq(items[1].as_node().unwrap()));
        assert!(first.get().get("b").and_then(Value::as_node).unwrap().ptr_eq(first));
    }

    #[tokio::test]
    async fn test_unknown_capability_faults_the_call() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        let (_, worker_sees) = connected(host, host_events, worker.clone(), worker_events).await;

        // The host exposes nothing, so a hand-made proxy for a missing
        // reference must fail rather than hang.
        let stray = proxy(&worker.shared, Target::Reference(99));
        match stray.call(vec![]).await {
            Err(CallError::Protocol(reason)) => assert!(reason.contains("unknown capability")),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(matches!(
            worker_sees.call("missing", vec![]).await,
            Err(CallError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_response_fails_only_that_call() {
        let (session, mut events) = Session::new();
        session.handle(json!({"type": "methods", "capabilities": ["invoke"]}));
        let remote = events.remote.try_recv().unwrap();

        let first = remote.call("invoke", vec![]);
        let second = remote.call("invoke", vec![]);
        let sent: Vec<_> = (0..2).map(|_| events.requests.try_recv().unwrap()).collect();
        assert_eq!(sent[0]["id"], 0);
        assert_eq!(sent[1]["id"], 1);

        session.handle(json!({"type": "return", "id": 0, "result": {"bogus": true}}));
        session.handle(json!({"type": "return", "id": 1, "result": {"string": "fine"}}));

        assert!(matches!(first.await, Err(CallError::Protocol(_))));
        assert_eq!(second.await.unwrap(), Value::from("fine"));
    }

    #[tokio::test]
    async fn test_malformed_call_is_answered_with_fault() {
        let (session, mut events) = Session::new();
        session.handle(json!({"type": "call", "id": 5, "capability": "invoke", "args": "oops"}));
        session.handle(json!({"no": "type"}));

        let fault = events.requests.try_recv().unwrap();
        assert_eq!(fault["type"], "fault");
        assert_eq!(fault["id"], 5);
        assert!(events.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outstanding_calls_settle_independently() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate_rx)));
        worker
            .expose(
                "slow",
                Callback::new(move |_| {
                    let gate = gate.lock().unwrap().take();
                    async move {
                        if let Some(gate) = gate {
                            let _ = gate.await;
                        }
                        Ok(Value::from("slow"))
                    }
                }),
            )
            .unwrap();
        worker.expose("fast", echo()).unwrap();
        let (remote, _) = connected(host, host_events, worker, worker_events).await;

        let slow = tokio::spawn(remote.call("slow", vec![]));
        let fast = remote.call("fast", vec![Value::from(2)]).await.unwrap();
        assert_eq!(fast, Value::from(vec![Value::from(2)]));
        assert!(!slow.is_finished());

        gate_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), Value::from("slow"));
    }

    #[tokio::test]
    async fn test_start_twice_and_expose_after_start_fail() {
        let (session, _events) = Session::new();
        session.start().unwrap();
        assert!(matches!(session.start(), Err(Error::AlreadyStarted)));
        assert!(matches!(
            session.expose("late", echo()),
            Err(Error::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (session, mut events) = Session::new();
        session.handle(json!({"type": "methods", "capabilities": ["invoke"]}));
        let remote = events.remote.try_recv().unwrap();

        let pending = remote.call("invoke", vec![]);
        session.close();
        assert!(matches!(pending.await, Err(CallError::Closed)));
        assert!(matches!(remote.call("invoke", vec![]).await, Err(CallError::Closed)));

        // The call message was queued, then the sender was dropped.
        assert!(events.requests.recv().await.is_some());
        assert!(events.requests.recv().await.is_none());
    }

    fn nested(depth: usize) -> Value {
        (0..depth).fold(Value::Null, |inner, _| Value::from(vec![inner]))
    }

    #[tokio::test]
    async fn test_deep_values_cross_within_the_limit() {
        let (host, host_events) = Session::new();
        let (worker, worker_events) = Session::new();
        worker.expose("invoke", echo()).unwrap();
        let (remote, _) = connected(host, host_events, worker, worker_events).await;

        let deep = nested(200);
        let result = remote.call("invoke", vec![deep.clone()]).await.unwrap();
        assert_eq!(result, Value::from(vec![deep]));
    }

    #[tokio::test]
    async fn test_too_deep_argument_fails_the_call_locally() {
        let (session, mut events) = Session::new();
        session.handle(json!({"type": "methods", "capabilities": ["invoke"]}));
        let remote = events.remote.try_recv().unwrap();

        match remote.call("invoke", vec![nested(codec::MAX_DEPTH + 1)]).await {
            Err(CallError::Protocol(reason)) => assert!(reason.contains("nested deeper")),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(events.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_too_deep_result_is_faulted() {
        let (session, mut events) = Session::new();
        session
            .expose(
                "deep",
                Callback::new(|_| async { Ok(nested(codec::MAX_DEPTH + 1)) }),
            )
            .unwrap();
        session.handle(json!({"type": "call", "id": 9, "capability": "deep", "args": []}));

        let reply = events.requests.recv().await.unwrap();
        assert_eq!(reply["type"], "fault");
        assert_eq!(reply["id"], 9);
    }

    #[tokio::test]
    async fn test_undecodable_frames_settle_the_call_they_name() {
        let (session, mut events) = Session::new();
        session.handle(json!({"type": "methods", "capabilities": ["invoke"]}));
        let remote = events.remote.try_recv().unwrap();
        let pending = remote.call("invoke", vec![]);
        assert_eq!(events.requests.try_recv().unwrap()["id"], 0);

        session.handle_frame(Frame::Undecodable {
            header: Some(json!({"type": "return", "id": 0, "result": null})),
            reason: "too deep".to_string(),
        });
        match pending.await {
            Err(CallError::Protocol(reason)) => assert_eq!(reason, "too deep"),
            other => panic!("expected protocol error, got {:?}", other),
        }

        session.handle_frame(Frame::Undecodable {
            header: Some(json!({"type": "call", "id": 4, "capability": "invoke", "args": null})),
            reason: "too deep".to_string(),
        });
        session.handle_frame(Frame::Undecodable {
            header: None,
            reason: "garbage".to_string(),
        });
        let fault = events.requests.try_recv().unwrap();
        assert_eq!(fault, json!({"type": "fault", "id": 4, "reason": "too deep"}));
        assert!(events.requests.try_recv().is_err());
    }
}
