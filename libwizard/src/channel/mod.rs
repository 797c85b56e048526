//! Install job output channel.
//!
//! The playbook run is started with a plain request; its output arrives on a
//! separate push socket as JSON frames `{type, data}`. The socket is opened
//! before the job starts so no early output is missed.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::{InstallerApi, PlaybookStartResponse};
use crate::error::Result;
use crate::log::*;
use crate::state::{JobKind, JobStatus, WizardStore};

pub const LAUNCH_FAILED: &str = "[ERROR] Playbook could not be started";
pub const CLOSED_EARLY: &str = "[ERROR] Output channel closed before the job finished";

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// What a channel closing under a still-running job means. Depends on the
/// backend version: newer ones shut down right after the job ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClosePolicy {
    #[default]
    CompleteOnClose,
    FailOnClose,
}

/// One inbound frame. Both fields are optional on the wire; `data` is
/// usually a string but anything is accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobFrame {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl JobFrame {
    fn text(&self) -> String {
        match &self.data {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    Append(String),
    Status(JobStatus),
    Ignore,
}

/// Map a raw frame to what it does to the store. Frames that are not JSON
/// are kept as log lines.
pub fn demux(raw: &str) -> ChannelAction {
    let frame: JobFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(err) => {
            trace!("channel: non-json frame ({}), keeping verbatim", err);
            return ChannelAction::Append(raw.to_string());
        }
    };
    match frame.kind.as_deref() {
        Some("stdout") | Some("stderr") | Some("event") => ChannelAction::Append(frame.text()),
        Some("status") => match frame.data.as_str() {
            Some("successful") | Some("completed") => ChannelAction::Status(JobStatus::Completed),
            Some("failed") => ChannelAction::Status(JobStatus::Failed),
            other => {
                debug!("channel: ignoring status {:?}", other);
                ChannelAction::Ignore
            }
        },
        other => {
            debug!("channel: ignoring frame type {:?}", other);
            ChannelAction::Ignore
        }
    }
}

/// Inbound side of a push socket. `None` means the channel is closed.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<String>;

    async fn close(&mut self) {}
}

#[async_trait]
impl<S> FrameSource for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<String> {
        while let Some(message) = self.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8_lossy(&bytes).into_owned())
                }
                Ok(Message::Close(frame)) => {
                    debug!("channel: closed by server: {:?}", frame);
                    return None;
                }
                Ok(_) => continue,
                Err(err) => {
                    debug!("channel: socket error: {}", err);
                    return None;
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(err) = WebSocketStream::close(self, None).await {
            trace!("channel: close handshake failed: {}", err);
        }
    }
}

#[async_trait]
pub trait ChannelConnector: Debug + Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FrameSource>>;
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    #[tracing::instrument]
    async fn connect(&self) -> Result<Box<dyn FrameSource>> {
        let (stream, response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        debug!("channel: connected to {} ({})", self.url, response.status());
        Ok(Box::new(stream))
    }
}

#[async_trait]
pub trait PlaybookLauncher: Debug + Send + Sync {
    async fn launch(
        &self,
        playbook: &str,
        extra_vars: Map<String, Value>,
    ) -> Result<PlaybookStartResponse>;
}

#[async_trait]
impl PlaybookLauncher for InstallerApi {
    async fn launch(
        &self,
        playbook: &str,
        extra_vars: Map<String, Value>,
    ) -> Result<PlaybookStartResponse> {
        self.start_lmn_playbook(playbook, extra_vars).await
    }
}

/// Store access of one pump. A write in flight finishes before `close`
/// returns, and none start afterwards.
#[derive(Clone, Default)]
struct StoreGate(Arc<Mutex<bool>>);

impl StoreGate {
    fn write(&self, f: impl FnOnce()) -> bool {
        let closed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return false;
        }
        f();
        true
    }

    fn close(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

/// Handle to a followed install job. Dropping it closes the channel.
pub struct ChannelHandle {
    token: CancellationToken,
    gate: StoreGate,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    fn settled() -> Self {
        Self {
            token: CancellationToken::new(),
            gate: StoreGate::default(),
            task: None,
        }
    }

    /// Close the channel. The store is not written afterwards. Idempotent.
    pub fn cancel(&self) {
        self.gate.close();
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait until the channel closes or the handle is cancelled.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("channel: pump task ended abnormally: {}", err);
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct InstallJob {
    store: WizardStore,
    connector: Arc<dyn ChannelConnector>,
    launcher: Arc<dyn PlaybookLauncher>,
    close_policy: ClosePolicy,
}

impl InstallJob {
    pub fn new(
        store: WizardStore,
        connector: Arc<dyn ChannelConnector>,
        launcher: Arc<dyn PlaybookLauncher>,
        close_policy: ClosePolicy,
    ) -> Self {
        Self {
            store,
            connector,
            launcher,
            close_policy,
        }
    }

    /// Open the output channel, start the playbook and follow it in a
    /// background task. Every outcome ends in a terminal job status.
    #[tracing::instrument(skip(self, extra_vars))]
    pub async fn start(&self, playbook: &str, extra_vars: Map<String, Value>) -> ChannelHandle {
        self.store.begin_attempt(JobKind::Playbook);

        let source = match self.connector.connect().await {
            Ok(source) => source,
            Err(err) => {
                warn!("channel: could not open output channel: {}", err);
                self.fail(format!("[ERROR] Output channel could not be opened: {err}"));
                return ChannelHandle::settled();
            }
        };

        let token = CancellationToken::new();
        let gate = StoreGate::default();
        let task = tokio::spawn(pump(
            source,
            self.store.clone(),
            gate.clone(),
            token.clone(),
            self.close_policy,
        ));
        let handle = ChannelHandle {
            token,
            gate,
            task: Some(task),
        };

        match self.launcher.launch(playbook, extra_vars).await {
            Ok(started) => {
                info!(
                    "channel: playbook {} started as job {} ({})",
                    playbook, started.job_id, started.status
                );
            }
            Err(err) => {
                warn!("channel: starting playbook {} failed: {}", playbook, err);
                handle.cancel();
                self.fail(LAUNCH_FAILED.to_string());
            }
        }
        handle
    }

    fn fail(&self, line: String) {
        self.store.append_lmn_output(line);
        self.store.set_job_status(JobKind::Playbook, JobStatus::Failed);
    }
}

async fn pump(
    mut source: Box<dyn FrameSource>,
    store: WizardStore,
    gate: StoreGate,
    token: CancellationToken,
    policy: ClosePolicy,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("channel: cancelled");
                let _ = tokio::time::timeout(CLOSE_GRACE, source.close()).await;
                return;
            }
            frame = source.next_frame() => frame,
        };
        let Some(frame) = frame else {
            gate.write(|| on_closed(&store, policy));
            return;
        };
        match demux(&frame) {
            ChannelAction::Append(line) => {
                if !gate.write(|| store.append_lmn_output(line)) {
                    return;
                }
            }
            ChannelAction::Status(status) => {
                if !gate.write(|| {
                    store.set_job_status(JobKind::Playbook, status);
                }) {
                    return;
                }
                if status == JobStatus::Failed {
                    info!("channel: job reported failure, closing");
                    let _ = tokio::time::timeout(CLOSE_GRACE, source.close()).await;
                    return;
                }
            }
            ChannelAction::Ignore => {}
        }
    }
}

fn on_closed(store: &WizardStore, policy: ClosePolicy) {
    if store.job_status(JobKind::Playbook) != JobStatus::Running {
        debug!("channel: closed after job end");
        return;
    }
    match policy {
        ClosePolicy::CompleteOnClose => {
            warn!("channel: closed while job running, treating as completed (complete-on-close)");
            store.set_job_status(JobKind::Playbook, JobStatus::Completed);
        }
        ClosePolicy::FailOnClose => {
            warn!("channel: closed while job running, treating as failed (fail-on-close)");
            store.append_lmn_output(CLOSED_EARLY);
            store.set_job_status(JobKind::Playbook, JobStatus::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::WizardError;

    #[test]
    fn test_demux_frame_types() {
        assert_eq!(
            ChannelAction::Append("TASK [setup]".into()),
            demux(r#"{"type":"stdout","data":"TASK [setup]"}"#)
        );
        assert_eq!(
            ChannelAction::Append("warning".into()),
            demux(r#"{"type":"stderr","data":"warning"}"#)
        );
        assert_eq!(
            ChannelAction::Append("playbook_on_start".into()),
            demux(r#"{"type":"event","data":"playbook_on_start"}"#)
        );
        assert_eq!(
            ChannelAction::Status(JobStatus::Completed),
            demux(r#"{"type":"status","data":"completed"}"#)
        );
        assert_eq!(
            ChannelAction::Status(JobStatus::Completed),
            demux(r#"{"type":"status","data":"successful"}"#)
        );
        assert_eq!(
            ChannelAction::Status(JobStatus::Failed),
            demux(r#"{"type":"status","data":"failed"}"#)
        );
    }

    #[test]
    fn test_demux_ignores_unknown_and_keeps_garbage() {
        assert_eq!(ChannelAction::Ignore, demux(r#"{"type":"heartbeat","data":1}"#));
        assert_eq!(ChannelAction::Ignore, demux(r#"{"type":"status","data":"running"}"#));
        assert_eq!(ChannelAction::Ignore, demux(r#"{"data":"no type"}"#));
        assert_eq!(
            ChannelAction::Append("PLAY RECAP ****".into()),
            demux("PLAY RECAP ****")
        );
        assert_eq!(
            ChannelAction::Append(r#"{"changed":2}"#.into()),
            demux(r#"{"type":"event","data":{"changed":2}}"#)
        );
    }

    struct ScriptedSource(VecDeque<String>);

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Option<String> {
            self.0.pop_front()
        }
    }

    struct ChannelSource(mpsc::UnboundedReceiver<String>);

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn next_frame(&mut self) -> Option<String> {
            self.0.recv().await
        }
    }

    #[derive(Debug)]
    enum FakeConnector {
        Script(Vec<&'static str>),
        Channel(Mutex<Option<mpsc::UnboundedReceiver<String>>>),
        Refuse,
    }

    #[async_trait]
    impl ChannelConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn FrameSource>> {
            match self {
                FakeConnector::Script(frames) => Ok(Box::new(ScriptedSource(
                    frames.iter().map(|f| f.to_string()).collect(),
                ))),
                FakeConnector::Channel(rx) => {
                    let rx = rx.lock().unwrap().take().expect("connected twice");
                    Ok(Box::new(ChannelSource(rx)))
                }
                FakeConnector::Refuse => Err(WizardError::Config("refused".into())),
            }
        }
    }

    #[derive(Debug, Default)]
    struct FakeLauncher {
        fail: bool,
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    #[async_trait]
    impl PlaybookLauncher for FakeLauncher {
        async fn launch(
            &self,
            playbook: &str,
            extra_vars: Map<String, Value>,
        ) -> Result<PlaybookStartResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((playbook.to_string(), extra_vars));
            if self.fail {
                return Err(WizardError::Status {
                    endpoint: "/api/lmn/playbook/linuxmuster.yml/start".into(),
                    status: 500,
                });
            }
            Ok(PlaybookStartResponse {
                job_id: "job-1".into(),
                status: "started".into(),
                message: String::new(),
            })
        }
    }

    fn job(
        store: &WizardStore,
        connector: FakeConnector,
        launcher: Arc<FakeLauncher>,
        policy: ClosePolicy,
    ) -> InstallJob {
        InstallJob::new(store.clone(), Arc::new(connector), launcher, policy)
    }

    fn vars() -> Map<String, Value> {
        let mut vars = Map::new();
        vars.insert("lmn_server_ip".into(), json!("10.0.0.1"));
        vars
    }

    #[tokio::test]
    async fn test_frames_drive_store() {
        let store = WizardStore::new();
        let launcher = Arc::new(FakeLauncher::default());
        let install = job(
            &store,
            FakeConnector::Script(vec![
                r#"{"type":"stdout","data":"TASK [a]"}"#,
                r#"{"type":"unknown","data":"x"}"#,
                "not json",
                r#"{"type":"status","data":"completed"}"#,
            ]),
            launcher.clone(),
            ClosePolicy::FailOnClose,
        );
        let mut handle = install.start("linuxmuster.yml", vars()).await;
        handle.wait().await;

        let state = store.snapshot();
        assert_eq!(JobStatus::Completed, state.playbook_status);
        assert_eq!(vec!["TASK [a]", "not json"], state.lmn_output.texts());
        let calls = launcher.calls.lock().unwrap();
        assert_eq!("linuxmuster.yml", calls[0].0);
        assert_eq!(Some(&json!("10.0.0.1")), calls[0].1.get("lmn_server_ip"));
    }

    #[tokio::test]
    async fn test_failed_status_is_terminal() {
        let store = WizardStore::new();
        let install = job(
            &store,
            FakeConnector::Script(vec![
                r#"{"type":"status","data":"failed"}"#,
                r#"{"type":"stdout","data":"after failure"}"#,
            ]),
            Arc::new(FakeLauncher::default()),
            ClosePolicy::CompleteOnClose,
        );
        let mut handle = install.start("linuxmuster.yml", vars()).await;
        handle.wait().await;
        let state = store.snapshot();
        assert_eq!(JobStatus::Failed, state.playbook_status);
        assert!(state.lmn_output.is_empty());
    }

    #[tokio::test]
    async fn test_close_while_running_follows_policy() {
        let store = WizardStore::new();
        let install = job(
            &store,
            FakeConnector::Script(vec![r#"{"type":"stdout","data":"PLAY RECAP"}"#]),
            Arc::new(FakeLauncher::default()),
            ClosePolicy::CompleteOnClose,
        );
        install.start("linuxmuster.yml", vars()).await.wait().await;
        assert_eq!(JobStatus::Completed, store.job_status(JobKind::Playbook));

        let install = job(
            &store,
            FakeConnector::Script(vec![r#"{"type":"stdout","data":"PLAY RECAP"}"#]),
            Arc::new(FakeLauncher::default()),
            ClosePolicy::FailOnClose,
        );
        install.start("linuxmuster.yml", vars()).await.wait().await;
        let state = store.snapshot();
        assert_eq!(JobStatus::Failed, state.playbook_status);
        assert_eq!(vec!["PLAY RECAP", CLOSED_EARLY], state.lmn_output.texts());
    }

    #[tokio::test]
    async fn test_launch_failure_marks_failed() {
        let store = WizardStore::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let install = job(
            &store,
            FakeConnector::Channel(Mutex::new(Some(rx))),
            Arc::new(FakeLauncher {
                fail: true,
                ..Default::default()
            }),
            ClosePolicy::CompleteOnClose,
        );
        let mut handle = install.start("linuxmuster.yml", vars()).await;
        handle.wait().await;
        let state = store.snapshot();
        assert_eq!(JobStatus::Failed, state.playbook_status);
        assert_eq!(vec![LAUNCH_FAILED], state.lmn_output.texts());
    }

    #[tokio::test]
    async fn test_connect_failure_skips_launch() {
        let store = WizardStore::new();
        let launcher = Arc::new(FakeLauncher::default());
        let install = job(
            &store,
            FakeConnector::Refuse,
            launcher.clone(),
            ClosePolicy::CompleteOnClose,
        );
        let handle = install.start("linuxmuster.yml", vars()).await;
        assert!(!handle.is_active());
        assert_eq!(JobStatus::Failed, store.job_status(JobKind::Playbook));
        assert!(launcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_store_writes() {
        let store = WizardStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let install = job(
            &store,
            FakeConnector::Channel(Mutex::new(Some(rx))),
            Arc::new(FakeLauncher::default()),
            ClosePolicy::FailOnClose,
        );
        let mut handle = install.start("linuxmuster.yml", vars()).await;
        tx.send(r#"{"type":"stdout","data":"one"}"#.to_string()).unwrap();
        while store.read(|s| s.lmn_output.is_empty()) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.cancel();
        handle.cancel();
        let _ = tx.send(r#"{"type":"stdout","data":"two"}"#.to_string());
        drop(tx);
        handle.wait().await;

        let state = store.snapshot();
        assert_eq!(vec!["one"], state.lmn_output.texts());
        assert_eq!(JobStatus::Running, state.playbook_status);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_writes_after_cancel_returns() {
        let store = WizardStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let install = job(
            &store,
            FakeConnector::Channel(Mutex::new(Some(rx))),
            Arc::new(FakeLauncher::default()),
            ClosePolicy::FailOnClose,
        );
        let mut handle = install.start("linuxmuster.yml", vars()).await;
        let sender = tokio::spawn(async move {
            let mut n = 0u64;
            while tx.send(format!(r#"{{"type":"stdout","data":"line {n}"}}"#)).is_ok() {
                n += 1;
                tokio::task::yield_now().await;
            }
        });
        while store.read(|s| s.lmn_output.len()) < 50 {
            tokio::task::yield_now().await;
        }
        handle.cancel();
        let written = store.read(|s| s.lmn_output.len());
        handle.wait().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(written, store.read(|s| s.lmn_output.len()));
        assert_eq!(JobStatus::Running, store.job_status(JobKind::Playbook));
        sender.abort();
    }
}
