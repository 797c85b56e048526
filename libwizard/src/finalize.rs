//! Handoff from the installer to the installed application.
//!
//! The backend gets no chance to tell us when it is back: it restarts, may
//! change its TLS identity on the way and the setup process exits. So the
//! finalizer commits and asks for shutdown while it polls the target URL
//! until it answers. A hard deadline redirects anyway, and a manual link shows
//! up after a grace period.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Fuse, FusedFuture};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::{interval_at, sleep_until, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::{paths, InstallerApi};
use crate::config::FinalizerConfig;
use crate::error::{Result, WizardError};
use crate::log::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalizerTimings {
    /// Between the commit call returning and the shutdown request.
    pub shutdown_delay: Duration,
    /// From start until the first reachability poll.
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    /// From start until the redirect happens regardless of polling.
    pub fallback_after: Duration,
    /// From start until the manual link is offered.
    pub manual_link_after: Duration,
}

impl Default for FinalizerTimings {
    fn default() -> Self {
        FinalizerConfig::default().timings()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FinalizerPhase {
    #[default]
    Idle,
    /// The commit call is in flight.
    Finalizing,
    /// Polling the target.
    Waiting,
    /// Redirected.
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RedirectReason {
    Reachable,
    Fallback,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizerStatus {
    pub phase: FinalizerPhase,
    pub manual_link_available: bool,
    pub redirect: Option<RedirectReason>,
}

/// The two backend calls of the handoff. Both are allowed to fail.
#[async_trait]
pub trait FinishBackend: Debug + Send + Sync {
    async fn commit(&self) -> Result<()>;
    async fn request_shutdown(&self) -> Result<()>;
}

#[async_trait]
impl FinishBackend for InstallerApi {
    async fn commit(&self) -> Result<()> {
        self.finish().await?.into_result(paths::FINISH)?;
        Ok(())
    }

    async fn request_shutdown(&self) -> Result<()> {
        self.shutdown_installer().await?.into_result(paths::SHUTDOWN)?;
        Ok(())
    }
}

#[async_trait]
pub trait ReachabilityProbe: Debug + Send + Sync {
    async fn is_reachable(&self, target: &Url) -> bool;
}

/// Plain `GET`; any 2xx counts. The body is never read.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| WizardError::Config(format!("building probe client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self, target: &Url) -> bool {
        match self.client.get(target.clone()).send().await {
            Ok(response) => {
                trace!("finalize: {} answered {}", target, response.status());
                response.status().is_success()
            }
            Err(err) => {
                trace!("finalize: {} not reachable yet: {}", target, err);
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Finalizer {
    backend: Arc<dyn FinishBackend>,
    probe: Arc<dyn ReachabilityProbe>,
    target: Url,
    timings: FinalizerTimings,
}

impl Finalizer {
    pub fn new(
        backend: Arc<dyn FinishBackend>,
        probe: Arc<dyn ReachabilityProbe>,
        target: Url,
        timings: FinalizerTimings,
    ) -> Self {
        Self {
            backend,
            probe,
            target,
            timings,
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Run the handoff in a background task. `redirect` is called at most
    /// once, with the reason it fired.
    #[tracing::instrument(skip(self, redirect), fields(target = %self.target))]
    pub fn finalize<F>(&self, redirect: F) -> FinalizerHandle
    where
        F: FnOnce(&Url, RedirectReason) + Send + 'static,
    {
        let (status_tx, status) = watch::channel(FinalizerStatus::default());
        let token = CancellationToken::new();
        let task = tokio::spawn(run(self.clone(), token.clone(), status_tx, redirect));
        FinalizerHandle {
            status,
            token,
            task: Some(task),
        }
    }
}

type InFlight = Option<BoxFuture<'static, bool>>;
type Committed = std::result::Result<Result<()>, Elapsed>;
type Shutdown = Fuse<BoxFuture<'static, ()>>;

async fn poll_result(in_flight: &mut InFlight) -> bool {
    match in_flight.as_mut() {
        Some(probe) => probe.await,
        None => futures::future::pending().await,
    }
}

/// Log the commit outcome and schedule the shutdown request. The commit may
/// already be applied server side even when it failed, so shutdown follows
/// either way.
fn after_commit(
    committed: Committed,
    backend: Arc<dyn FinishBackend>,
    delay: Duration,
    status: &watch::Sender<FinalizerStatus>,
) -> Shutdown {
    match committed {
        Ok(Ok(())) => info!("finalize: configuration committed"),
        Ok(Err(err)) => warn!("finalize: commit failed, continuing: {}", err),
        Err(_) => warn!("finalize: commit still pending at the fallback deadline"),
    }
    status.send_modify(|s| {
        if s.phase == FinalizerPhase::Finalizing {
            s.phase = FinalizerPhase::Waiting;
        }
    });
    let shutdown_at = Instant::now() + delay;
    async move {
        sleep_until(shutdown_at).await;
        match backend.request_shutdown().await {
            Ok(()) => debug!("finalize: shutdown requested"),
            Err(err) => debug!("finalize: shutdown request failed, ignoring: {}", err),
        }
    }
    .boxed()
    .fuse()
}

async fn run<F>(
    finalizer: Finalizer,
    token: CancellationToken,
    status: watch::Sender<FinalizerStatus>,
    redirect: F,
) where
    F: FnOnce(&Url, RedirectReason) + Send + 'static,
{
    let Finalizer {
        backend,
        probe,
        target,
        timings,
    } = finalizer;
    let started = Instant::now();

    // every timer counts from start, the commit runs alongside them
    let fallback = sleep_until(started + timings.fallback_after);
    let manual_link = sleep_until(started + timings.manual_link_after);
    let commit = timeout_at(started + timings.fallback_after, backend.commit()).fuse();
    let shutdown: Shutdown = Fuse::terminated();
    tokio::pin!(fallback, manual_link, commit, shutdown);
    let mut manual_link_done = false;
    let mut poll = interval_at(started + timings.initial_delay, timings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight: InFlight = None;

    status.send_modify(|s| s.phase = FinalizerPhase::Finalizing);

    let reason = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("finalize: cancelled");
                return;
            }
            _ = &mut fallback => break RedirectReason::Fallback,
            committed = &mut commit, if !commit.is_terminated() => {
                let delay = timings.shutdown_delay;
                shutdown.set(after_commit(committed, backend.clone(), delay, &status));
            }
            reachable = poll_result(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                if reachable {
                    break RedirectReason::Reachable;
                }
            }
            _ = &mut manual_link, if !manual_link_done => {
                manual_link_done = true;
                info!("finalize: offering manual link to {}", target);
                status.send_modify(|s| s.manual_link_available = true);
            }
            _ = &mut shutdown, if !shutdown.is_terminated() => {}
            _ = poll.tick(), if in_flight.is_none() => {
                let probe = probe.clone();
                let target = target.clone();
                let limit = timings.poll_interval;
                in_flight = Some(
                    async move {
                        timeout(limit, probe.is_reachable(&target))
                            .await
                            .unwrap_or(false)
                    }
                    .boxed(),
                );
            }
        }
    };

    info!("finalize: redirecting to {} ({:?})", target, reason);
    status.send_modify(|s| {
        s.phase = FinalizerPhase::Ready;
        s.redirect = Some(reason);
    });
    redirect(&target, reason);

    // a redirect can beat the commit; the shutdown request still follows it
    while !commit.is_terminated() || !shutdown.is_terminated() {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            committed = &mut commit, if !commit.is_terminated() => {
                let delay = timings.shutdown_delay;
                shutdown.set(after_commit(committed, backend.clone(), delay, &status));
            }
            _ = &mut shutdown, if !shutdown.is_terminated() => {}
        }
    }
}

/// Handle to a running handoff. Dropping it cancels every pending timer.
pub struct FinalizerHandle {
    status: watch::Receiver<FinalizerStatus>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FinalizerHandle {
    pub fn status(&self) -> FinalizerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FinalizerStatus> {
        self.status.clone()
    }

    /// Stop polling and drop all timers. No redirect fires afterwards.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("finalize: task ended abnormally: {}", err);
            }
        }
    }
}

impl Drop for FinalizerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Debug for FinalizerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerHandle")
            .field("status", &*self.status.borrow())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
