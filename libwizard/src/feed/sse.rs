//! Reconnecting event-stream transport.
//!
//! A dropped connection is not an error: the reader waits for the retry delay
//! and reconnects with `Last-Event-ID`, so the server can resume where it left
//! off. Only a terminal event, an explicit refusal (any answer other than a
//! `200 text/event-stream`) or running out of reconnect attempts ends the feed.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use url::Url;

use super::{
    frame_response, FeedEvent, FeedItem, FeedReader, FrameStream, Framing, ProgressFeedStrategy,
};
use crate::api::{paths, InstallerApi, SshConnection};
use crate::config::FeedConfig;
use crate::error::Result;
use crate::log::*;

pub const CONNECTION_LOST: &str = "Connection lost";

const LAST_EVENT_ID: &str = "Last-Event-ID";

#[derive(Debug, Clone)]
pub struct SseFeed {
    api: InstallerApi,
    stream_url: Url,
    framing: Framing,
    reconnect_delay: Duration,
    max_reconnects: u32,
}

impl SseFeed {
    pub fn new(api: InstallerApi, stream_url: Url, framing: Framing) -> Self {
        let defaults = FeedConfig::default();
        Self {
            api,
            stream_url,
            framing,
            reconnect_delay: defaults.reconnect_delay(),
            max_reconnects: *defaults.max_reconnects(),
        }
    }

    pub fn from_config(api: InstallerApi, config: &FeedConfig) -> Result<Self> {
        let stream_url = api.endpoint(paths::LMN_BOOTSTRAP_STREAM)?;
        Ok(Self::new(api, stream_url, config.framing())
            .with_reconnects(config.reconnect_delay(), *config.max_reconnects()))
    }

    pub fn with_reconnects(mut self, delay: Duration, max_reconnects: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnects = max_reconnects;
        self
    }
}

#[async_trait]
impl ProgressFeedStrategy for SseFeed {
    #[tracing::instrument(skip(self))]
    async fn start(&self, ssh: &SshConnection) -> Result<Box<dyn FeedReader>> {
        // the ack body carries nothing we need
        drop(self.api.start_bootstrap(ssh).await?);
        Ok(Box::new(SseReader {
            client: self.api.client().clone(),
            url: self.stream_url.clone(),
            framing: self.framing,
            last_event_id: None,
            delay: self.reconnect_delay,
            reconnects_left: self.max_reconnects,
            max_reconnects: self.max_reconnects,
            frames: None,
        }))
    }
}

enum ConnectError {
    /// The server answered and said no. Do not retry.
    Refused(String),
    /// The network failed. Retry after the delay.
    Transient(String),
}

pub struct SseReader {
    client: reqwest::Client,
    url: Url,
    framing: Framing,
    last_event_id: Option<String>,
    delay: Duration,
    reconnects_left: u32,
    max_reconnects: u32,
    frames: Option<FrameStream>,
}

impl SseReader {
    /// The returned future owns everything it needs, so it stays `Send` while
    /// the reader itself holds a non-`Sync` frame stream.
    fn connect(
        &self,
    ) -> impl Future<Output = std::result::Result<FrameStream, ConnectError>> + Send + 'static {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = &self.last_event_id {
            request = request.header(LAST_EVENT_ID, id.as_str());
        }
        let framing = self.framing;
        async move {
            let response = request
                .send()
                .await
                .map_err(|e| ConnectError::Transient(e.to_string()))?;

            if response.status() != StatusCode::OK {
                return Err(ConnectError::Refused(format!(
                    "stream answered {}",
                    response.status()
                )));
            }
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if !content_type.starts_with("text/event-stream") {
                return Err(ConnectError::Refused(format!(
                    "stream has content type {content_type:?}"
                )));
            }
            Ok(frame_response(response, framing))
        }
    }

    /// Spend one reconnect attempt and sleep. `false` once the budget is
    /// used up.
    async fn back_off(&mut self, reason: &str) -> bool {
        if self.reconnects_left == 0 {
            warn!("feed: giving up after {} reconnects: {}", self.max_reconnects, reason);
            return false;
        }
        self.reconnects_left -= 1;
        debug!(
            "feed: stream interrupted ({}), reconnecting in {:?} ({} attempts left)",
            reason, self.delay, self.reconnects_left
        );
        tokio::time::sleep(self.delay).await;
        true
    }
}

#[async_trait]
impl FeedReader for SseReader {
    async fn next_event(&mut self) -> FeedEvent {
        loop {
            if self.frames.is_none() {
                match self.connect().await {
                    Ok(frames) => {
                        trace!("feed: stream connected, last event id {:?}", self.last_event_id);
                        self.frames = Some(frames);
                    }
                    Err(ConnectError::Refused(reason)) => {
                        warn!("feed: {}", reason);
                        return FeedEvent::Failed(CONNECTION_LOST.into());
                    }
                    Err(ConnectError::Transient(reason)) => {
                        if !self.back_off(&reason).await {
                            return FeedEvent::Failed(CONNECTION_LOST.into());
                        }
                        continue;
                    }
                }
            }
            let next = match self.frames.as_mut() {
                Some(frames) => frames.next().await,
                None => continue,
            };
            match next {
                Some(Ok(FeedItem::Event(event))) => {
                    self.reconnects_left = self.max_reconnects;
                    return event;
                }
                Some(Ok(FeedItem::LastEventId(id))) => {
                    self.last_event_id = Some(id).filter(|id| !id.is_empty());
                }
                Some(Ok(FeedItem::Retry(delay))) => self.delay = delay,
                Some(Err(err)) => {
                    self.frames = None;
                    if !self.back_off(&err.to_string()).await {
                        return FeedEvent::Failed(CONNECTION_LOST.into());
                    }
                }
                None => {
                    self.frames = None;
                    if !self.back_off("stream closed").await {
                        return FeedEvent::Failed(CONNECTION_LOST.into());
                    }
                }
            }
        }
    }
}
