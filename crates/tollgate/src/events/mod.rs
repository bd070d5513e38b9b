//! Post-request accounting. The proxy publishes what it saw; consumer
//! workers estimate usage, update counters and persist the event.

pub mod bus;
pub mod consumer;
pub mod decorator;
pub mod handler;

use bytes::Bytes;
use common::models::{Event, Key, RouteConfig};

pub use bus::EventBus;
pub use consumer::{Consumer, MessageHandler};
pub use decorator::Decorator;
pub use handler::AccountingHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Events whose usage is already known.
    Event,
    /// Proxied requests with their captured bodies, still to be priced.
    RequestContent,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Event => "event",
            Topic::RequestContent => "request_content",
        }
    }
}

/// How to read usage out of a captured exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageKind {
    OpenAiChat,
    OpenAiEmbeddings,
    OpenAiSpeech,
    AzureChat,
    AzureEmbeddings,
    AnthropicComplete,
    Custom(RouteConfig),
    /// Nothing to price; the event is stored as-is.
    Opaque,
}

/// A proxied request as the consumer sees it. `event` carries everything
/// known on the request path; tokens and cost are filled in later.
#[derive(Debug, Clone)]
pub struct EventWithRequestAndContent {
    pub event: Event,
    pub key: Key,
    pub usage: UsageKind,
    /// Body sent upstream.
    pub request_body: Bytes,
    /// Response body, or the captured part of a stream.
    pub response_body: Bytes,
    pub streamed: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub enum Message {
    Event(Event),
    RequestContent(Box<EventWithRequestAndContent>),
}

impl Message {
    pub fn topic(&self) -> Topic {
        match self {
            Message::Event(_) => Topic::Event,
            Message::RequestContent(_) => Topic::RequestContent,
        }
    }
}
