//! Streaming relay: forwards the upstream body to the client while keeping a
//! bounded copy for token counting after the stream ends.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use common::consts::DEFAULT_STREAM_END_WORD;
use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn, Instrument};

use super::response::ProxyResponse;
use super::upstream::{build_response, Exchange};
use crate::events::EventBus;

/// Why a relayed stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    DoneSentinel,
    Eof,
    EmptyLimit,
    ClientGone,
    UpstreamError,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::DoneSentinel => "done_sentinel",
            Terminal::Eof => "eof",
            Terminal::EmptyLimit => "empty_limit",
            Terminal::ClientGone => "client_gone",
            Terminal::UpstreamError => "upstream_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub end_word: String,
    /// Consecutive empty `data:` messages tolerated; zero means unlimited.
    pub max_empty_messages: u32,
    pub capture_limit: usize,
}

impl StreamOptions {
    pub fn new(capture_limit: usize) -> Self {
        Self {
            end_word: DEFAULT_STREAM_END_WORD.to_string(),
            max_empty_messages: 0,
            capture_limit,
        }
    }
}

/// Line scanner over SSE chunks that may split lines anywhere.
#[derive(Debug)]
struct SseScanner {
    pending: Vec<u8>,
    empty_run: u32,
    end_word: String,
    max_empty: u32,
}

impl SseScanner {
    fn new(options: &StreamOptions) -> Self {
        Self {
            pending: Vec::new(),
            empty_run: 0,
            end_word: options.end_word.clone(),
            max_empty: options.max_empty_messages,
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Option<Terminal> {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(terminal) = self.line(&line) {
                self.pending.clear();
                return Some(terminal);
            }
        }
        None
    }

    fn line(&mut self, line: &[u8]) -> Option<Terminal> {
        let line = String::from_utf8_lossy(line);
        let payload = line.trim().strip_prefix("data:")?.trim();
        if payload.is_empty() {
            self.empty_run += 1;
            if self.max_empty > 0 && self.empty_run >= self.max_empty {
                return Some(Terminal::EmptyLimit);
            }
            return None;
        }
        self.empty_run = 0;
        (payload == self.end_word).then_some(Terminal::DoneSentinel)
    }
}

/// Bounded copy of the stream; keeps the first `limit` bytes.
#[derive(Debug)]
struct Capture {
    buf: BytesMut,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Relay a successful streaming upstream response. The exchange is published
/// once the stream reaches a terminal state.
pub fn relay_stream(
    upstream: reqwest::Response,
    exchange: Exchange,
    bus: Arc<EventBus>,
    options: StreamOptions,
) -> ProxyResponse {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let (tx, rx) = mpsc::channel::<Bytes>(16);

    tokio::spawn(
        async move {
            let mut chunks = upstream.bytes_stream();
            let mut scanner = SseScanner::new(&options);
            let mut capture = Capture::new(options.capture_limit);

            let terminal = loop {
                let chunk = match chunks.next().await {
                    None => break Terminal::Eof,
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream stream failed");
                        break Terminal::UpstreamError;
                    }
                    Some(Ok(chunk)) => chunk,
                };
                capture.push(&chunk);
                let seen = scanner.feed(&chunk);
                if tx.send(chunk).await.is_err() {
                    break Terminal::ClientGone;
                }
                if let Some(terminal) = seen {
                    break terminal;
                }
            };
            drop(chunks);

            metrics::counter!("forwarder.streams", "terminal" => terminal.as_str()).increment(1);
            debug!(
                terminal = terminal.as_str(),
                captured = capture.buf.len(),
                truncated = capture.truncated,
                "stream finished"
            );
            exchange.publish(
                &bus,
                status.as_u16(),
                capture.buf.freeze(),
                true,
                capture.truncated,
            );
        }
        .in_current_span(),
    );

    let body = BodyExt::boxed(StreamBody::new(
        ReceiverStream::new(rx).map(|chunk| Ok::<_, hyper::Error>(Frame::data(chunk))),
    ));
    build_response(status, &headers, body)
}
