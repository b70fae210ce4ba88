//! Scripted in-memory transport shared by the integration tests.
//!
//! Each URL gets a queue of [`Dial`] outcomes; once the queue is empty the
//! URL's fallback applies (refuse unless set). Accepted dials hand the test a
//! [`MockServer`] through the receiver returned by [`MockConnector::accepted`].

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{future, stream, Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc as tokio_mpsc;

use chainrelay_core::TransportError;
use chainrelay_ws::{ConnectionConfig, Connector, Frame, Socket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Refuse,
    /// Handshake never completes; only the connect timeout ends it.
    Stall,
    Accept,
    /// Handshake succeeds but writes never drain and nothing is ever read.
    Wedged,
}

#[derive(Default)]
struct Script {
    queued: VecDeque<Dial>,
    fallback: Option<Dial>,
    dials: usize,
    accepted: Option<tokio_mpsc::UnboundedSender<MockServer>>,
}

#[derive(Default)]
pub struct MockConnector {
    scripts: Mutex<HashMap<String, Script>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue dial outcomes for `url`, in order.
    pub fn script(&self, url: &str, dials: impl IntoIterator<Item = Dial>) {
        self.with(url, |s| s.queued.extend(dials));
    }

    /// Outcome for every dial after the queue runs dry.
    pub fn otherwise(&self, url: &str, dial: Dial) {
        self.with(url, |s| s.fallback = Some(dial));
    }

    /// Server sides of every accepted dial on `url`.
    pub fn accepted(&self, url: &str) -> tokio_mpsc::UnboundedReceiver<MockServer> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        self.with(url, |s| s.accepted = Some(tx));
        rx
    }

    pub fn dials(&self, url: &str) -> usize {
        self.with(url, |s| s.dials)
    }

    fn with<R>(&self, url: &str, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut scripts = self.scripts.lock().unwrap();
        f(scripts.entry(url.to_string()).or_default())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let (dial, accepted) = self.with(url, |s| {
            s.dials += 1;
            let dial = s.queued.pop_front().or(s.fallback).unwrap_or(Dial::Refuse);
            (dial, s.accepted.clone())
        });
        match dial {
            Dial::Refuse => Err(TransportError::WebSocket(format!("connection refused: {url}"))),
            Dial::Stall => future::pending().await,
            Dial::Accept => {
                let (socket, server) = socket_pair();
                if let Some(tx) = accepted {
                    let _ = tx.send(server);
                }
                Ok(socket)
            }
            Dial::Wedged => {
                let silent = stream::pending::<Result<Frame, TransportError>>();
                Ok(Socket::new(Box::pin(WedgedSink), Box::pin(silent)))
            }
        }
    }
}

/// A write side whose buffer is permanently full.
struct WedgedSink;

impl Sink<Frame> for WedgedSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _: Frame) -> Result<(), Self::Error> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }
}

fn socket_pair() -> (Socket, MockServer) {
    let (to_server, from_client) = mpsc::unbounded::<Frame>();
    let (to_client, from_server) = mpsc::unbounded::<Result<Frame, TransportError>>();
    let sink = to_server.sink_map_err(|e| TransportError::WebSocket(e.to_string()));
    let socket = Socket::new(Box::pin(sink), Box::pin(from_server));
    let server = MockServer {
        incoming: from_client,
        outgoing: to_client,
        answer_pings: true,
        pings: 0,
    };
    (socket, server)
}

/// Server end of one accepted socket. Dropping it drops the connection.
pub struct MockServer {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    answer_pings: bool,
    pub pings: usize,
}

impl MockServer {
    /// Stop answering heartbeat pings.
    pub fn silence(&mut self) {
        self.answer_pings = false;
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.incoming.next().await
    }

    /// Next JSON-RPC request from the client, answering pings on the way.
    /// `None` once the client closes.
    pub async fn next_request(&mut self) -> Option<Value> {
        while let Some(frame) = self.incoming.next().await {
            match frame {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Ping(data) => {
                    self.pings += 1;
                    if self.answer_pings {
                        self.send(Frame::Pong(data));
                    }
                }
                Frame::Pong(_) => {}
                Frame::Close => return None,
            }
        }
        None
    }

    /// Expect an `eth_subscribe`, acknowledge it as `server_id` and return its
    /// params.
    pub async fn accept_subscribe(&mut self, server_id: &str) -> Value {
        let req = self.next_request().await.expect("client went away");
        assert_eq!(req["method"], "eth_subscribe");
        self.reply(&req["id"], json!(server_id));
        req["params"].clone()
    }

    /// Answer pings until the client closes. Returns the number of pings.
    pub async fn serve_until_closed(mut self) -> usize {
        while self.next_request().await.is_some() {}
        self.pings
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.outgoing.unbounded_send(Ok(frame));
    }

    pub fn reply(&self, id: &Value, result: Value) {
        self.send(Frame::Text(
            json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string(),
        ));
    }

    pub fn reply_error(&self, id: &Value, code: i64, message: &str) {
        self.send(Frame::Text(
            json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
                .to_string(),
        ));
    }

    pub fn notify(&self, subscription: &str, result: Value) {
        self.send(Frame::Text(
            json!({
                "jsonrpc": "2.0",
                "method": "eth_subscription",
                "params": { "subscription": subscription, "result": result }
            })
            .to_string(),
        ));
    }
}

/// Short timers so paused-clock tests read naturally.
pub fn fast_config(max_reconnect_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        max_reconnect_attempts,
        reconnect_delay: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(1),
        pong_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(1),
    }
}

/// Listener that forwards every push to a channel.
pub fn forwarding_listener() -> (chainrelay_ws::Listener, tokio_mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = tokio_mpsc::unbounded_channel();
    let listener: chainrelay_ws::Listener = Arc::new(move |v: Value| {
        let _ = tx.send(v);
    });
    (listener, rx)
}

/// Answer pings on every socket accepted for one URL, so those connections
/// stay open for the rest of the test.
pub fn keep_alive(mut servers: tokio_mpsc::UnboundedReceiver<MockServer>) {
    tokio::spawn(async move {
        while let Some(server) = servers.recv().await {
            tokio::spawn(server.serve_until_closed());
        }
    });
}
