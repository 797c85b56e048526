//! Bootstrap progress feed: start the remote action, then follow its output
//! until the server reports a terminal event.
//!
//! The transport is pluggable through [`ProgressFeedStrategy`]: a
//! reconnecting event stream ([`sse::SseFeed`]) or the raw streamed body of
//! the start request ([`chunked::ChunkedFeed`]). Both deliver the same three
//! callbacks, and [`FeedHandle::cancel`] silences them for good.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::api::{InstallerApi, SshConnection};
use crate::config::FeedConfig;
use crate::error::{ErrorKind, Result, WizardError};
use crate::log::*;
use crate::state::{JobKind, JobStatus, WizardStore};

pub mod chunked;
pub mod codec;
pub mod sse;

pub use codec::{EventStreamCodec, FeedEvent, FeedItem, Framing};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedStrategyKind {
    /// `POST` to start, then a separate reconnecting event stream.
    Sse,
    /// The `POST` response body is the feed; no reconnects.
    Chunked,
}

pub(crate) type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;
pub(crate) type FrameStream = FramedRead<StreamReader<ByteStream, Bytes>, EventStreamCodec>;

pub(crate) fn frame_bytes(body: ByteStream, framing: Framing) -> FrameStream {
    FramedRead::new(StreamReader::new(body), EventStreamCodec::new(framing))
}

pub(crate) fn frame_response(response: reqwest::Response, framing: Framing) -> FrameStream {
    let body: ByteStream = Box::pin(
        response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
    );
    frame_bytes(body, framing)
}

/// Pull side of an opened feed. Returns terminal events exactly once; a
/// reader is not polled again after that.
#[async_trait]
pub trait FeedReader: Send {
    async fn next_event(&mut self) -> FeedEvent;
}

/// How a bootstrap is started and its progress followed.
#[async_trait]
pub trait ProgressFeedStrategy: std::fmt::Debug + Send + Sync {
    /// Kick off the remote action. An error here means the feed is never
    /// opened.
    async fn start(&self, ssh: &SshConnection) -> Result<Box<dyn FeedReader>>;
}

pub fn strategy_for(
    api: &InstallerApi,
    config: &FeedConfig,
) -> Result<Arc<dyn ProgressFeedStrategy>> {
    Ok(match config.strategy() {
        FeedStrategyKind::Sse => Arc::new(sse::SseFeed::from_config(api.clone(), config)?),
        FeedStrategyKind::Chunked => {
            Arc::new(chunked::ChunkedFeed::new(api.clone(), config.framing()))
        }
    })
}

/// Receiver of feed events. At most one of `on_done`/`on_error` is called,
/// and nothing is called after it.
pub trait FeedCallbacks: Send + 'static {
    fn on_message(&mut self, line: String);
    fn on_done(&mut self);
    fn on_error(&mut self, reason: String);
}

/// Callbacks that record a bootstrap in the store: lines go to the output
/// log, the terminal event decides the job status.
#[derive(Debug, Clone)]
pub struct StoreFeedCallbacks {
    store: WizardStore,
    kind: JobKind,
}

impl StoreFeedCallbacks {
    pub fn new(store: WizardStore, kind: JobKind) -> Self {
        Self { store, kind }
    }
}

impl FeedCallbacks for StoreFeedCallbacks {
    fn on_message(&mut self, line: String) {
        self.store.append_lmn_output(line);
    }

    fn on_done(&mut self) {
        self.store.set_job_status(self.kind, JobStatus::Completed);
    }

    fn on_error(&mut self, reason: String) {
        self.store.append_lmn_output(format!("[ERROR] {reason}"));
        self.store.set_job_status(self.kind, JobStatus::Failed);
    }
}

type SharedCallbacks = Arc<Mutex<Option<Box<dyn FeedCallbacks>>>>;

/// Callback slot shared between the pump task and the handle. Emptying it is
/// what makes cancellation final: a callback in flight finishes before
/// `revoke` returns, and none start afterwards.
#[derive(Clone)]
struct CallbackSlot(SharedCallbacks);

impl CallbackSlot {
    fn new(callbacks: Box<dyn FeedCallbacks>) -> Self {
        Self(Arc::new(Mutex::new(Some(callbacks))))
    }

    fn deliver(&self, f: impl FnOnce(&mut dyn FeedCallbacks)) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(callbacks) => {
                f(callbacks.as_mut());
                true
            }
            None => false,
        }
    }

    fn finish(&self, f: impl FnOnce(&mut dyn FeedCallbacks)) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut callbacks) = slot.take() {
            f(callbacks.as_mut());
        }
    }

    fn revoke(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn is_live(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Handle to a running feed. Dropping it cancels the feed.
pub struct FeedHandle {
    token: CancellationToken,
    slot: CallbackSlot,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    fn settled(slot: CallbackSlot) -> Self {
        Self {
            token: CancellationToken::new(),
            slot,
            task: None,
        }
    }

    /// Close the feed. No callback fires once this returns. Safe to call
    /// any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
        self.slot.revoke();
    }

    /// Whether callbacks may still fire.
    pub fn is_active(&self) -> bool {
        self.slot.is_live()
    }

    /// Wait for the feed to reach a terminal event or be cancelled.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("feed: pump task ended abnormally: {}", err);
            }
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle")
            .field("cancelled", &self.token.is_cancelled())
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapClient {
    strategy: Arc<dyn ProgressFeedStrategy>,
}

impl BootstrapClient {
    pub fn new(strategy: Arc<dyn ProgressFeedStrategy>) -> Self {
        Self { strategy }
    }

    /// Start the bootstrap and follow its feed in a background task.
    #[tracing::instrument(skip(self, callbacks))]
    pub async fn start<C: FeedCallbacks>(&self, ssh: &SshConnection, callbacks: C) -> FeedHandle {
        let slot = CallbackSlot::new(Box::new(callbacks));
        let reader = match self.strategy.start(ssh).await {
            Ok(reader) => reader,
            Err(err) => {
                warn!("feed: starting bootstrap on {} failed: {}", ssh.host, err);
                let reason = start_failure_reason(&err);
                slot.finish(|callbacks| callbacks.on_error(reason));
                return FeedHandle::settled(slot);
            }
        };
        info!("feed: bootstrap started on {}:{}", ssh.host, ssh.port);

        let token = CancellationToken::new();
        let task = tokio::spawn(pump(reader, slot.clone(), token.clone()));
        FeedHandle {
            token,
            slot,
            task: Some(task),
        }
    }
}

fn start_failure_reason(err: &WizardError) -> String {
    match err.kind() {
        ErrorKind::Transport => "Network error".into(),
        _ => "Failed to start bootstrap".into(),
    }
}

async fn pump(mut reader: Box<dyn FeedReader>, slot: CallbackSlot, token: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("feed: cancelled");
                return;
            }
            event = reader.next_event() => event,
        };
        match event {
            FeedEvent::Line(line) => {
                if !slot.deliver(|callbacks| callbacks.on_message(line)) {
                    return;
                }
            }
            FeedEvent::Done => {
                info!("feed: bootstrap finished");
                slot.finish(|callbacks| callbacks.on_done());
                return;
            }
            FeedEvent::Failed(reason) => {
                warn!("feed: bootstrap failed: {}", reason);
                slot.finish(|callbacks| callbacks.on_error(reason));
                return;
            }
        }
    }
}
