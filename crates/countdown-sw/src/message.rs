//! Commands posted by pages and the replies sent back.
//!
//! Messages arrive as `{"type": "<TAG>", "data": ...}`. Commands that report
//! something answer over the [`ReplyPort`] supplied with the message. A port
//! is consumed by sending, so a reply can never go out twice.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{Result, ServiceWorkerError};

pub const SKIP_WAITING: &str = "SKIP_WAITING";
pub const CACHE_QUOTE: &str = "CACHE_QUOTE";
pub const GET_CACHE_SIZE: &str = "GET_CACHE_SIZE";
pub const CLEAR_CACHE: &str = "CLEAR_CACHE";

/// A parsed page command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Activate the waiting generation without waiting for pages to close.
    SkipWaiting,
    /// Store a quote object for offline use.
    CacheQuote(Option<Value>),
    /// Report the number of entries in the current bucket.
    GetCacheSize,
    /// Delete the current bucket.
    ClearCache,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

impl ClientMessage {
    /// Parse a message envelope.
    pub fn parse(value: &Value) -> Result<Self> {
        let envelope = Envelope::deserialize(value)
            .map_err(|e| ServiceWorkerError::Message(format!("malformed message: {e}")))?;

        match envelope.kind.as_str() {
            SKIP_WAITING => Ok(Self::SkipWaiting),
            CACHE_QUOTE => Ok(Self::CacheQuote(
                envelope
                    .data
                    .and_then(|data| data.get("quote").cloned())
                    .filter(|quote| !quote.is_null()),
            )),
            GET_CACHE_SIZE => Ok(Self::GetCacheSize),
            CLEAR_CACHE => Ok(Self::ClearCache),
            other => Err(ServiceWorkerError::Message(format!(
                "unknown message type: {other}"
            ))),
        }
    }

    /// Whether the sender should supply a reply port.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Self::GetCacheSize | Self::ClearCache)
    }
}

/// A reply sent back to the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    CacheSize { size: usize },
    CacheCleared,
}

/// Sending half of a reply channel.
#[derive(Debug)]
pub struct ReplyPort(oneshot::Sender<WorkerReply>);

/// Create a reply port and the receiver the page keeps.
pub fn reply_channel() -> (ReplyPort, oneshot::Receiver<WorkerReply>) {
    let (tx, rx) = oneshot::channel();
    (ReplyPort(tx), rx)
}

impl ReplyPort {
    /// Send the reply. Fails if the page stopped listening.
    pub fn post_message(self, reply: WorkerReply) -> Result<()> {
        self.0
            .send(reply)
            .map_err(|reply| ServiceWorkerError::Message(format!("reply dropped: {reply:?}")))
    }
}

/// A message event: the posted data plus any transferred ports.
#[derive(Debug)]
pub struct MessageEvent {
    pub data: Value,
    pub ports: Vec<ReplyPort>,
}

impl MessageEvent {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ports: Vec::new(),
        }
    }

    pub fn with_port(data: Value, port: ReplyPort) -> Self {
        Self {
            data,
            ports: vec![port],
        }
    }

    /// Take the first transferred port.
    pub fn take_port(&mut self) -> Option<ReplyPort> {
        if self.ports.is_empty() {
            None
        } else {
            Some(self.ports.remove(0))
        }
    }
}
