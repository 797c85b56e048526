//! Line framing for bootstrap progress feeds.
//!
//! Backends speak one of two dialects of the `text/event-stream` format:
//!
//! - [`Framing::NamedEvents`]: proper event-stream records, dispatched on the
//!   blank line that ends them. `done` and `failed` are the terminal event
//!   names; `id:` and `retry:` fields feed reconnection.
//! - [`Framing::ErrorLine`]: every `data:` line is forwarded as soon as it is
//!   complete. An `event: error` (or `failed`) line marks the following data
//!   line as the failure reason, `event: done` marks success. A trailing
//!   `event: error` without a newline at the end of the stream is still fatal.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

use crate::log::*;

pub const DEFAULT_FAILURE: &str = "Bootstrap failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    NamedEvents,
    ErrorLine,
}

/// What a feed tells its consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEvent {
    Line(String),
    Done,
    Failed(String),
}

impl FeedEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FeedEvent::Line(_))
    }
}

/// Decoder output: events plus the reconnection bookkeeping fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedItem {
    Event(FeedEvent),
    LastEventId(String),
    Retry(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Terminal {
    Done,
    Failed,
}

impl Terminal {
    fn from_event_name(framing: Framing, name: &str) -> Option<Self> {
        match (framing, name) {
            (_, "done") => Some(Terminal::Done),
            (_, "failed") => Some(Terminal::Failed),
            (Framing::ErrorLine, "error") => Some(Terminal::Failed),
            _ => None,
        }
    }

    fn into_event(self, data: Option<String>) -> FeedEvent {
        match self {
            Terminal::Done => FeedEvent::Done,
            Terminal::Failed => FeedEvent::Failed(
                data.filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE.to_string()),
            ),
        }
    }
}

#[derive(Debug)]
pub struct EventStreamCodec {
    framing: Framing,
    // record under construction (named events)
    event: Option<String>,
    data: Option<String>,
    // terminal announced by an `event:` line, waiting for its data (error line)
    pending: Option<Terminal>,
    queue: VecDeque<FeedItem>,
    finished: bool,
}

impl EventStreamCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            event: None,
            data: None,
            pending: None,
            queue: VecDeque::new(),
            finished: false,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    fn emit(&mut self, event: FeedEvent) {
        if self.finished {
            return;
        }
        self.finished = event.is_terminal();
        self.queue.push_back(FeedItem::Event(event));
    }

    fn take_line(src: &mut BytesMut) -> Option<String> {
        let newline = src.iter().position(|b| *b == b'\n')?;
        let raw = src.split_to(newline + 1);
        Some(Self::to_text(&raw[..newline]))
    }

    fn to_text(raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        String::from_utf8_lossy(raw).into_owned()
    }

    /// Split `field: value`, dropping one space after the colon.
    fn split_field(line: &str) -> (&str, &str) {
        match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        }
    }

    fn push_line(&mut self, line: &str) {
        match self.framing {
            Framing::NamedEvents => self.push_named(line),
            Framing::ErrorLine => self.push_error_line(line),
        }
    }

    fn push_named(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch_record();
            return;
        }
        if line.starts_with(':') {
            return;
        }
        match Self::split_field(line) {
            ("event", value) => self.event = Some(value.to_string()),
            ("data", value) => match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            ("id", value) if !value.contains('\0') => {
                self.queue.push_back(FeedItem::LastEventId(value.to_string()))
            }
            ("retry", value) => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.queue
                        .push_back(FeedItem::Retry(Duration::from_millis(ms)));
                }
            }
            (field, _) => trace!("feed: ignoring field {:?}", field),
        }
    }

    fn dispatch_record(&mut self) {
        let event = self.event.take();
        let data = self.data.take();
        let name = event.as_deref().unwrap_or("message");
        if let Some(terminal) = Terminal::from_event_name(self.framing, name) {
            self.emit(terminal.into_event(data));
            return;
        }
        match (name, data) {
            ("message", Some(data)) => self.emit(FeedEvent::Line(data)),
            ("message", None) => {}
            (other, _) => debug!("feed: ignoring event {:?}", other),
        }
    }

    fn push_error_line(&mut self, line: &str) {
        if line.is_empty() {
            if let Some(terminal) = self.pending.take() {
                self.emit(terminal.into_event(None));
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        match Self::split_field(line) {
            ("data", value) => match self.pending.take() {
                Some(terminal) => self.emit(terminal.into_event(Some(value.to_string()))),
                None => self.emit(FeedEvent::Line(value.to_string())),
            },
            ("event", name) => {
                self.pending = Terminal::from_event_name(self.framing, name);
                if self.pending.is_none() {
                    debug!("feed: ignoring event {:?}", name);
                }
            }
            ("id", _) | ("retry", _) => {}
            _ => self.emit(FeedEvent::Line(line.to_string())),
        }
    }

    /// The stream is over: settle what is still pending.
    fn flush_eof(&mut self) {
        match self.framing {
            // incomplete records are dropped, as event-stream clients do
            Framing::NamedEvents => {
                self.event = None;
                self.data = None;
            }
            Framing::ErrorLine => {
                if let Some(terminal) = self.pending.take() {
                    self.emit(terminal.into_event(None));
                }
            }
        }
    }
}

impl Decoder for EventStreamCodec {
    type Item = FeedItem;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Ok(Some(item));
            }
            if self.finished {
                // nothing after a terminal event matters
                src.clear();
                return Ok(None);
            }
            match Self::take_line(src) {
                Some(line) => self.push_line(&line),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if !src.is_empty() {
            let rest = src.split();
            let line = Self::to_text(&rest);
            if !self.finished {
                self.push_line(&line);
            }
        }
        self.flush_eof();
        Ok(self.queue.pop_front())
    }
}
