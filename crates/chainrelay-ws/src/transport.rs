//! Framed socket abstraction and the tokio-tungstenite connector.
//!
//! The connection state machine only ever sees [`Frame`]s, which keeps it
//! independent of the WebSocket library and lets tests script a server.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use chainrelay_core::error::TransportError;

/// The subset of WebSocket messages the relay cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text.to_string())),
            Message::Ping(data) => Some(Self::Ping(data.to_vec())),
            Message::Pong(data) => Some(Self::Pong(data.to_vec())),
            Message::Close(_) => Some(Self::Close),
            // binary and raw frames are not part of JSON-RPC
            _ => None,
        }
    }

    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Ping(data) => Message::Ping(data.into()),
            Self::Pong(data) => Message::Pong(data.into()),
            Self::Close => Message::Close(None),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// One established socket, split into its two halves.
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Socket {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Dials an endpoint. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError>;
}

/// Production connector backed by `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (sink, stream) = ws.split();

        let sink = sink
            .with(|frame: Frame| future::ready(Ok::<_, WsError>(frame.into_message())))
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => Frame::from_message(msg).map(Ok),
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        Ok(Socket::new(Box::pin(sink), Box::pin(stream)))
    }
}
