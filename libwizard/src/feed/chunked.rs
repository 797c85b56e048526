//! Raw streamed-body transport: the bootstrap `POST` answers with the feed
//! itself. There is no resume, so the body ending before a terminal event is
//! a failure.

use async_trait::async_trait;
use futures::StreamExt;

use super::{
    frame_response, FeedEvent, FeedItem, FeedReader, FrameStream, Framing, ProgressFeedStrategy,
};
use crate::api::{InstallerApi, SshConnection};
use crate::error::Result;
use crate::log::*;

pub const ENDED_UNEXPECTEDLY: &str = "connection ended unexpectedly";

#[derive(Debug, Clone)]
pub struct ChunkedFeed {
    api: InstallerApi,
    framing: Framing,
}

impl ChunkedFeed {
    pub fn new(api: InstallerApi, framing: Framing) -> Self {
        Self { api, framing }
    }
}

#[async_trait]
impl ProgressFeedStrategy for ChunkedFeed {
    #[tracing::instrument(skip(self))]
    async fn start(&self, ssh: &SshConnection) -> Result<Box<dyn FeedReader>> {
        let response = self.api.start_bootstrap(ssh).await?;
        Ok(Box::new(ChunkedReader::new(frame_response(response, self.framing))))
    }
}

pub struct ChunkedReader {
    frames: FrameStream,
}

impl ChunkedReader {
    pub(crate) fn new(frames: FrameStream) -> Self {
        Self { frames }
    }
}

#[async_trait]
impl FeedReader for ChunkedReader {
    async fn next_event(&mut self) -> FeedEvent {
        loop {
            match self.frames.next().await {
                Some(Ok(FeedItem::Event(event))) => return event,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!("feed: body read failed: {}", err);
                    return FeedEvent::Failed(ENDED_UNEXPECTEDLY.into());
                }
                None => return FeedEvent::Failed(ENDED_UNEXPECTEDLY.into()),
            }
        }
    }
}
