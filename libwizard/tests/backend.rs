//! Wizard steps against a local fake of the installer backend.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::Result;
use serde_json::{json, Value};
use tokio::sync::Notify;
use url::Url;

use libwizard::api::SshConnection;
use libwizard::config::WizardConfig;
use libwizard::session::LMN_PLAYBOOK;
use libwizard::state::{CheckKey, CheckResult, LmnConfig, CONNECTION_ERROR};
use libwizard::{JobKind, JobStatus, WizardSession};

fn serve(app: Router) -> Result<Url> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service());
    tokio::spawn(server);
    Ok(Url::parse(&format!("http://{addr}"))?)
}

fn wizard(base_url: &Url, extra: &str) -> Result<WizardSession> {
    let config = WizardConfig::from_yaml(&format!("base_url: {base_url}\n{extra}"))?;
    Ok(WizardSession::new(config)?)
}

fn event_stream(body: &'static str) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

fn ssh() -> SshConnection {
    SshConnection::new("10.0.0.1", 22, "root", "x")
}

#[tokio::test]
async fn test_bootstrap_end_to_end() -> Result<()> {
    let received = Arc::new(Mutex::new(None::<Value>));
    let app = Router::new()
        .route(
            "/api/lmn/bootstrap",
            post({
                let received = received.clone();
                move |Json(body): Json<Value>| async move {
                    *received.lock().unwrap() = Some(body);
                    Json(json!({"status": true, "message": "started"}))
                }
            }),
        )
        .route(
            "/api/lmn/bootstrap/stream",
            get(|| async {
                event_stream(
                    "data: Connecting to 10.0.0.1\n\n\
                     data: Installing ansible\n\n\
                     data: Bootstrap complete\n\n\
                     event: done\ndata: ok\n\n",
                )
            }),
        );
    let base = serve(app)?;
    let session = wizard(&base, "")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Completed, state.bootstrap_status);
    assert_eq!(
        vec!["Connecting to 10.0.0.1", "Installing ansible", "Bootstrap complete"],
        state.lmn_output.texts()
    );
    let ids: Vec<u64> = state.lmn_output.lines().iter().map(|l| l.id).collect();
    assert_eq!(vec![0, 1, 2], ids);

    let body = received.lock().unwrap().clone().unwrap();
    assert_eq!(
        json!({"host": "10.0.0.1", "port": 22, "user": "root", "password": "x"}),
        body
    );
    Ok(())
}

#[tokio::test]
async fn test_sse_resumes_with_last_event_id() -> Result<()> {
    let seen = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
    let app = Router::new()
        .route(
            "/api/lmn/bootstrap",
            post(|| async { Json(json!({"status": true})) }),
        )
        .route(
            "/api/lmn/bootstrap/stream",
            get({
                let seen = seen.clone();
                move |headers: HeaderMap| async move {
                    let last = headers
                        .get("last-event-id")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let resumed = last.is_some();
                    seen.lock().unwrap().push(last);
                    if resumed {
                        event_stream("id: 2\ndata: second\n\nevent: done\ndata: ok\n\n")
                    } else {
                        // connection drops before the job ends
                        event_stream("retry: 10\nid: 1\ndata: first\n\n")
                    }
                }
            }),
        );
    let base = serve(app)?;
    let session = wizard(&base, "feed:\n  reconnect_delay_ms: 10\n")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Completed, state.bootstrap_status);
    assert_eq!(vec!["first", "second"], state.lmn_output.texts());
    assert_eq!(vec![None, Some("1".to_string())], *seen.lock().unwrap());
    Ok(())
}

#[tokio::test]
async fn test_sse_refused_stream_is_definitive() -> Result<()> {
    let app = Router::new()
        .route(
            "/api/lmn/bootstrap",
            post(|| async { Json(json!({"status": true})) }),
        )
        .route(
            "/api/lmn/bootstrap/stream",
            get(|| async { (StatusCode::NOT_FOUND, "no bootstrap running") }),
        );
    let base = serve(app)?;
    let session = wizard(&base, "")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Failed, state.bootstrap_status);
    assert_eq!(vec!["[ERROR] Connection lost"], state.lmn_output.texts());
    Ok(())
}

/// Stream route answering an empty event stream, except for the hits listed
/// in `with_event`, which carry one line.
fn flaky_stream(hits: Arc<AtomicUsize>, with_event: &'static [usize]) -> Router {
    Router::new()
        .route(
            "/api/lmn/bootstrap",
            post(|| async { Json(json!({"status": true})) }),
        )
        .route(
            "/api/lmn/bootstrap/stream",
            get(move || async move {
                let hit = hits.fetch_add(1, Ordering::SeqCst) + 1;
                if with_event.contains(&hit) {
                    event_stream("data: still working\n\n")
                } else {
                    event_stream("")
                }
            }),
        )
}

#[tokio::test]
async fn test_sse_gives_up_after_reconnect_budget() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(flaky_stream(hits.clone(), &[]))?;
    let session = wizard(&base, "feed:\n  reconnect_delay_ms: 1\n  max_reconnects: 2\n")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Failed, state.bootstrap_status);
    assert_eq!(vec!["[ERROR] Connection lost"], state.lmn_output.texts());
    assert_eq!(3, hits.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_sse_event_restores_reconnect_budget() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(flaky_stream(hits.clone(), &[2]))?;
    let session = wizard(&base, "feed:\n  reconnect_delay_ms: 1\n  max_reconnects: 2\n")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Failed, state.bootstrap_status);
    assert_eq!(
        vec!["still working", "[ERROR] Connection lost"],
        state.lmn_output.texts()
    );
    // one empty answer before the event, two after it
    assert_eq!(4, hits.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_start_failure_never_opens_feed() -> Result<()> {
    let streams = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/api/lmn/bootstrap",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "ssh refused") }),
        )
        .route(
            "/api/lmn/bootstrap/stream",
            get({
                let streams = streams.clone();
                move || async move {
                    streams.fetch_add(1, Ordering::SeqCst);
                    event_stream("event: done\ndata: ok\n\n")
                }
            }),
        );
    let base = serve(app)?;
    let session = wizard(&base, "")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Failed, state.bootstrap_status);
    assert_eq!(vec!["[ERROR] Failed to start bootstrap"], state.lmn_output.texts());
    assert_eq!(0, streams.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_chunked_body_ending_early_fails() -> Result<()> {
    let app = Router::new().route(
        "/api/lmn/bootstrap",
        post(|| async { "data: one\ndata: two\n" }),
    );
    let base = serve(app)?;
    let session = wizard(&base, "feed:\n  strategy: chunked\n")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Failed, state.bootstrap_status);
    assert_eq!(
        vec!["one", "two", "[ERROR] connection ended unexpectedly"],
        state.lmn_output.texts()
    );
    Ok(())
}

#[tokio::test]
async fn test_chunked_error_line_reports_reason() -> Result<()> {
    let app = Router::new().route(
        "/api/lmn/bootstrap",
        post(|| async { "data: one\nevent: error\ndata: SSH authentication failed\n" }),
    );
    let base = serve(app)?;
    let session = wizard(&base, "feed:\n  strategy: chunked\n")?;

    let mut handle = session.bootstrap(ssh()).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Failed, state.bootstrap_status);
    assert_eq!(
        vec!["one", "[ERROR] SSH authentication failed"],
        state.lmn_output.texts()
    );
    Ok(())
}

fn install_backend(
    frames: &'static [&'static str],
    received: Arc<Mutex<Option<Value>>>,
) -> Router {
    let started = Arc::new(Notify::new());
    Router::new()
        .route(
            "/api/lmn/playbook/:playbook/start",
            post({
                let started = started.clone();
                move |Json(body): Json<Value>| async move {
                    *received.lock().unwrap() = Some(body);
                    started.notify_one();
                    Json(json!({"job_id": "42", "status": "running", "message": ""}))
                }
            }),
        )
        .route(
            "/ws/lmn/output",
            get(move |ws: WebSocketUpgrade| async move {
                ws.on_upgrade(move |mut socket| async move {
                    started.notified().await;
                    for frame in frames {
                        if socket.send(Message::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                    let _ = socket.close().await;
                })
            }),
        )
}

#[tokio::test]
async fn test_install_follows_push_socket() -> Result<()> {
    let received = Arc::new(Mutex::new(None));
    let app = install_backend(
        &[
            r#"{"type":"stdout","data":"PLAY [linuxmuster] ***"}"#,
            r#"{"type":"event","data":"runner_on_ok"}"#,
            r#"{"type":"heartbeat","data":"tick"}"#,
            "raw text frame",
            r#"{"type":"status","data":"successful"}"#,
        ],
        received.clone(),
    );
    let base = serve(app)?;
    let session = wizard(&base, "channel:\n  close_policy: fail-on-close\n")?;
    session.store().set_lmn_config(LmnConfig {
        server_ip: "10.0.0.1".into(),
        ..LmnConfig::default()
    });

    let mut handle = session.install(LMN_PLAYBOOK).await?;
    handle.wait().await;

    let state = session.store().snapshot();
    assert_eq!(JobStatus::Completed, state.playbook_status);
    assert_eq!(
        vec!["PLAY [linuxmuster] ***", "runner_on_ok", "raw text frame"],
        state.lmn_output.texts()
    );
    let body = received.lock().unwrap().clone().unwrap();
    let vars = &body["variables"]["extra_vars"];
    assert_eq!(json!("10.0.0.1"), vars["lmn_server_ip"]);
    assert_eq!(json!("server"), vars["lmn_servername"]);
    Ok(())
}

#[tokio::test]
async fn test_install_close_while_running_uses_policy() -> Result<()> {
    let app = install_backend(
        &[r#"{"type":"stdout","data":"PLAY RECAP"}"#],
        Arc::new(Mutex::new(None)),
    );
    let base = serve(app)?;

    let session = wizard(&base, "")?;
    session.install(LMN_PLAYBOOK).await?.wait().await;
    assert_eq!(JobStatus::Completed, session.store().job_status(JobKind::Playbook));

    let app = install_backend(
        &[r#"{"type":"stdout","data":"PLAY RECAP"}"#],
        Arc::new(Mutex::new(None)),
    );
    let base = serve(app)?;
    let session = wizard(&base, "channel:\n  close_policy: fail-on-close\n")?;
    session.install(LMN_PLAYBOOK).await?.wait().await;
    let state = session.store().snapshot();
    assert_eq!(JobStatus::Failed, state.playbook_status);
    assert_eq!(
        vec!["PLAY RECAP", "[ERROR] Output channel closed before the job finished"],
        state.lmn_output.texts()
    );
    Ok(())
}

#[tokio::test]
async fn test_health_checks_against_backend() -> Result<()> {
    let app = Router::new()
        .route(
            "/api/check-api-status",
            get(|| async { Json(json!({"status": true, "message": "API reachable"})) }),
        )
        .route(
            "/api/check-webdav-status",
            get(|| async { Json(json!({"status": false, "message": "WebDAV not reachable"})) }),
        )
        .route(
            "/api/check-ldap-status",
            get(|| async { StatusCode::BAD_GATEWAY }),
        )
        .route(
            "/api/check-ldap-access-status",
            get(|| async { Json(json!({"status": true, "message": "bind ok"})) }),
        );
    let base = serve(app)?;
    let session = wizard(&base, "")?;

    assert!(!session.run_checks().await);
    let checks = session.store().snapshot().checks;
    assert_eq!(Some(&CheckResult::passed("API reachable")), checks.result(CheckKey::Api));
    assert_eq!(
        Some(&CheckResult::failed("WebDAV not reachable")),
        checks.result(CheckKey::Webdav)
    );
    assert_eq!(
        Some(CONNECTION_ERROR),
        checks.result(CheckKey::Ldap).map(|r| r.message.as_str())
    );
    assert!(!checks.any_loading());
    Ok(())
}

#[tokio::test]
async fn test_hanging_check_is_reported_as_connection_error() -> Result<()> {
    let app = Router::new().route(
        "/api/check-api-status",
        get(|| async { std::future::pending::<Json<Value>>().await }),
    );
    let base = serve(app)?;
    let session = wizard(&base, "request_timeout_ms: 200\n")?;

    tokio::time::timeout(Duration::from_secs(5), session.rerun_check(CheckKey::Api)).await?;

    let checks = session.store().snapshot().checks;
    assert_eq!(
        Some(CONNECTION_ERROR),
        checks.result(CheckKey::Api).map(|r| r.message.as_str())
    );
    assert!(!checks.any_loading());
    Ok(())
}

#[tokio::test]
async fn test_derived_config_and_submit() -> Result<()> {
    let submitted = Arc::new(Mutex::new(None::<Value>));
    let app = Router::new()
        .route(
            "/api/lmn/edulution-config",
            get(|| async {
                Json(json!({
                    "binduser_dn": "CN=global-binduser,OU=Management,DC=linuxmuster,DC=lan",
                    "binduser_password": "generated"
                }))
            }),
        )
        .route(
            "/api/configure",
            post({
                let submitted = submitted.clone();
                move |Json(body): Json<Value>| async move {
                    *submitted.lock().unwrap() = Some(body);
                    Json(json!({"status": true, "message": "saved"}))
                }
            }),
        );
    let base = serve(app)?;
    let session = wizard(&base, "")?;
    session
        .store()
        .set_deployment_target(libwizard::api::DeploymentTarget::Linuxmuster);

    session.fetch_derived_config().await?;
    let response = session.submit_configuration().await?;
    assert_eq!("saved", response.message);

    let body = submitted.lock().unwrap().clone().unwrap();
    assert_eq!(json!("linuxmuster"), body["deploymentTarget"]);
    assert_eq!(
        json!("CN=global-binduser,OU=Management,DC=linuxmuster,DC=lan"),
        body["lmnBinduserDn"]
    );
    assert_eq!(json!("ldaps"), body["lmnLdapSchema"]);
    assert_eq!(json!(636), body["lmnLdapPort"]);
    Ok(())
}
