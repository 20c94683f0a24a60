//! Integration tests for the ask/answer bridge over real loopback sockets

use ask_continue::host::ReplyStatus;
use ask_continue::process::ProcessControl;
use ask_continue::protocol::{paths, ImagePayload};
use ask_continue::{
    AskDispatcher, AskKind, AskOutcome, AskResponse, BridgeConfig, BridgeError, CallbackListener,
    CorrelationTable, DialogSession, PortStore, Presenter, ReopenOutcome, Requester, ServiceState,
    Sweeper,
};
use pretty_assertions::assert_eq;
use std::future::Future;
use std::net::TcpListener as StdListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Keeps every presented session so the test can act on it later
#[derive(Default)]
struct Recorder {
    sessions: Mutex<Vec<DialogSession>>,
}

impl Presenter for Recorder {
    fn present(&self, session: DialogSession) -> anyhow::Result<()> {
        self.sessions.lock().unwrap().push(session);
        Ok(())
    }
}

impl Recorder {
    async fn nth(&self, n: usize) -> DialogSession {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(session) = self.sessions.lock().unwrap().get(n).cloned() {
                return session;
            }
            assert!(Instant::now() < deadline, "session {n} was never presented");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Sees no listeners; only the listed pids are alive
#[derive(Default)]
struct FakeProcesses {
    alive: Vec<u32>,
}

impl ProcessControl for FakeProcesses {
    fn is_alive(&self, pid: u32) -> impl Future<Output = bool> + Send {
        let alive = self.alive.contains(&pid);
        async move { alive }
    }

    async fn terminate(&self, _pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn listeners_on(&self, _port: u16) -> impl Future<Output = Vec<u32>> + Send {
        async { Vec::new() }
    }
}

fn test_config(dir: &TempDir) -> BridgeConfig {
    BridgeConfig::default()
        .with_host_port(0)
        .with_discovery_dir(dir.path().to_path_buf())
        .with_ask_timeout(Duration::from_secs(10))
}

fn answering(text: &'static str) -> Arc<dyn Presenter> {
    Arc::new(move |session: DialogSession| -> anyhow::Result<()> {
        tokio::spawn(async move {
            session.submit(text).await.unwrap();
        });
        Ok(())
    })
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// A port `p` where both `p` and `p + 1` were free a moment ago.
fn free_port_pair() -> u16 {
    for _ in 0..50 {
        let first = StdListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if StdListener::bind(("127.0.0.1", port + 1)).is_ok() {
            return port;
        }
    }
    panic!("no adjacent free ports");
}

async fn started(config: &BridgeConfig, presenter: Arc<dyn Presenter>) -> (AskDispatcher, u16) {
    let mut dispatcher = AskDispatcher::new(config.clone(), presenter);
    let port = dispatcher.start().await.unwrap();
    (dispatcher, port)
}

#[tokio::test]
async fn test_answered_ask_round_trip() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (dispatcher, port) = started(&config, answering("go ahead")).await;

    let requester = Requester::start(&config).await.unwrap().with_host_port(port);
    let outcome = requester.ask("finished the refactor").await;

    assert_eq!(
        outcome,
        AskOutcome::Answered {
            user_input: "go ahead".to_string()
        }
    );
    assert_eq!(outcome.tool_text(AskKind::Ask), "User replied: go ahead");
    assert_eq!(dispatcher.presented_count(), 1);
    assert!(requester.table().is_empty());
    requester.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_ask_times_out() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let recorder = Arc::new(Recorder::default());
    let (_dispatcher, port) = started(&config, recorder.clone()).await;

    let requester = Requester::start(&config)
        .await
        .unwrap()
        .with_host_port(port)
        .with_ask_timeout(Duration::from_millis(100));

    let started_at = Instant::now();
    let outcome = requester.ask("waiting").await;
    assert_eq!(outcome, AskOutcome::TimedOut);
    assert!(started_at.elapsed() >= Duration::from_millis(100));
    assert!(requester.table().is_empty());

    // A late answer finds nobody waiting.
    let late = recorder.nth(0).await;
    assert_eq!(late.submit("too late").await.unwrap(), ReplyStatus::Expired);
    requester.shutdown().await;
}

#[tokio::test]
async fn test_presentation_failure_cancels_promptly() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let failing: Arc<dyn Presenter> =
        Arc::new(|_session: DialogSession| -> anyhow::Result<()> {
            anyhow::bail!("no window available")
        });
    let (dispatcher, port) = started(&config, failing).await;

    let requester = Requester::start(&config).await.unwrap().with_host_port(port);
    let started_at = Instant::now();
    let outcome = requester.ask("done").await;

    assert_eq!(outcome, AskOutcome::Cancelled);
    assert!(started_at.elapsed() < Duration::from_secs(5));
    assert_eq!(dispatcher.presented_count(), 0);
    assert!(dispatcher.pending_request().is_none());
    requester.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_host_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let port = StdListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let requester = Requester::start(&test_config(&tmp))
        .await
        .unwrap()
        .with_host_port(port);

    let outcome = requester.ask("done").await;
    assert!(outcome.is_error());
    assert!(outcome.tool_text(AskKind::Ask).starts_with("Ask failed: Cannot reach UI host"));
    assert!(requester.table().is_empty());
    requester.shutdown().await;
}

#[tokio::test]
async fn test_callback_rejects_unknown_and_repeated_responses() {
    let table = CorrelationTable::new();
    let listener = CallbackListener::start(table.clone()).await.unwrap();
    let url = format!("http://127.0.0.1:{}{}", listener.port(), paths::RESPONSE);
    let client = client();

    let unknown = client
        .post(&url)
        .json(&AskResponse::answered("nobody", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status().as_u16(), 404);

    let handle = table
        .register_wait("req-1", Duration::from_secs(10))
        .unwrap();
    let first = client
        .post(&url)
        .json(&AskResponse::answered("req-1", "yes"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status().as_u16(), 200);
    let second = client
        .post(&url)
        .json(&AskResponse::cancelled("req-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 404);

    let response = handle.wait().await;
    assert_eq!(response.user_input, "yes");
    assert!(!response.cancelled);

    let garbage = client.post(&url).body("{not json").send().await.unwrap();
    assert_eq!(garbage.status().as_u16(), 400);
    listener.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_request_id_is_rejected() {
    let table = CorrelationTable::new();
    let _first = table.register_wait("same", Duration::from_secs(1)).unwrap();
    let err = table
        .register_wait("same", Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateRequest(id) if id == "same"));
}

#[tokio::test]
async fn test_ask_endpoint_rejects_bad_bodies() {
    let tmp = TempDir::new().unwrap();
    let (_dispatcher, port) = started(&test_config(&tmp), Arc::new(Recorder::default())).await;
    let url = format!("http://127.0.0.1:{}{}", port, paths::ASK);
    let client = client();

    let invalid = client.post(&url).body("not json").send().await.unwrap();
    assert_eq!(invalid.status().as_u16(), 400);
    let body: serde_json::Value = invalid.json().await.unwrap();
    assert_eq!(body["error"], "Invalid JSON");

    let unknown = client
        .post(&url)
        .json(&serde_json::json!({"type": "dance", "requestId": "x", "reason": "r"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status().as_u16(), 400);
    let body: serde_json::Value = unknown.json().await.unwrap();
    assert_eq!(body["error"], "Unknown request type");
}

#[tokio::test]
async fn test_cors_preflight_is_allowed() {
    let tmp = TempDir::new().unwrap();
    let (_dispatcher, port) = started(&test_config(&tmp), Arc::new(Recorder::default())).await;

    let response = client()
        .request(
            reqwest::Method::OPTIONS,
            format!("http://127.0.0.1:{}{}", port, paths::ASK),
        )
        .header("Origin", "http://localhost:3000")
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers()["access-control-allow-origin"]
            .to_str()
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_port_conflict_moves_to_next_port() {
    let tmp = TempDir::new().unwrap();
    let base = free_port_pair();
    let _occupant = StdListener::bind(("127.0.0.1", base)).unwrap();

    let config = test_config(&tmp).with_host_port(base);
    let (dispatcher, port) = started(&config, Arc::new(Recorder::default())).await;

    assert_eq!(port, base + 1);
    assert_eq!(dispatcher.status(), ServiceState::Running { port: base + 1 });

    let record = PortStore::new(tmp.path())
        .read(std::process::id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.port, base + 1);
}

#[tokio::test]
async fn test_exhausted_ports_leave_service_stopped() {
    let tmp = TempDir::new().unwrap();
    let occupant = StdListener::bind("127.0.0.1:0").unwrap();
    let base = occupant.local_addr().unwrap().port();

    let mut config = test_config(&tmp).with_host_port(base);
    config.max_port_retries = 0;
    let mut dispatcher = AskDispatcher::new(config, Arc::new(Recorder::default()));

    let err = dispatcher.start().await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::PortConflict { first, last } if first == base && last == base
    ));
    assert!(!dispatcher.status().is_running());
}

#[tokio::test]
async fn test_two_hosts_on_one_base_port_get_distinct_ports() {
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();
    let base = free_port_pair();

    let (first, first_port) = started(
        &test_config(&first_dir).with_host_port(base),
        answering("first"),
    )
    .await;
    let (second, second_port) = started(
        &test_config(&second_dir).with_host_port(base),
        answering("second"),
    )
    .await;
    assert_eq!(first_port, base);
    assert_eq!(second_port, base + 1);

    let config = test_config(&first_dir);
    let to_first = Requester::start(&config).await.unwrap().with_host_port(first_port);
    let to_second = Requester::start(&config).await.unwrap().with_host_port(second_port);
    let (a, b) = tokio::join!(to_first.ask("a"), to_second.ask("b"));

    assert_eq!(a, AskOutcome::Answered { user_input: "first".to_string() });
    assert_eq!(b, AskOutcome::Answered { user_input: "second".to_string() });
    assert_eq!(first.presented_count(), 1);
    assert_eq!(second.presented_count(), 1);
}

#[tokio::test]
async fn test_sweep_prunes_only_the_host_that_died() {
    let tmp = TempDir::new().unwrap();
    let base = free_port_pair();
    let config = test_config(&tmp)
        .with_host_port(base)
        .with_sweep_range(1..=2);
    let me = std::process::id();
    let gone = u32::MAX - 7;

    let mut survivor = AskDispatcher::new(config.clone(), Arc::new(Recorder::default()));
    let mut crashed =
        AskDispatcher::new(config.clone(), Arc::new(Recorder::default())).with_owner_pid(gone);
    let (a, b) = tokio::join!(survivor.start(), crashed.start());
    let (a, b) = (a.unwrap(), b.unwrap());

    let mut ports = vec![a, b];
    ports.sort();
    assert_eq!(ports, vec![base, base + 1]);

    let store = PortStore::new(tmp.path());
    assert_eq!(store.read(me).await.unwrap().map(|r| r.port), Some(a));
    assert_eq!(store.read(gone).await.unwrap().map(|r| r.port), Some(b));

    // Exit without cleanup: the record stays behind.
    drop(crashed);
    assert!(store.read(gone).await.unwrap().is_some());

    let sweeper = Sweeper::with_probe(&config, FakeProcesses { alive: vec![me] });
    let report = sweeper.run().await;

    assert_eq!(report.pruned, vec![store.record_path(gone)]);
    assert_eq!(store.read(gone).await.unwrap(), None);
    assert_eq!(store.read(me).await.unwrap().map(|r| r.port), Some(a));
    assert!(survivor.status().is_running());
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_without_touching_the_slot() {
    let tmp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (dispatcher, port) = started(&test_config(&tmp), recorder.clone()).await;

    let response = client()
        .post(format!("http://127.0.0.1:{}{}", port, paths::ASK))
        .json(&serde_json::json!({
            "type": "analyze-files",
            "requestId": "empty-files",
            "reason": "review",
            "callbackPort": 1,
            "payload": {"files": [], "question": "anything?"}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Malformed ask request");
    assert!(dispatcher.pending_request().is_none());
    assert_eq!(dispatcher.presented_count(), 0);
    assert!(recorder.sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_removes_discovery_record() {
    let tmp = TempDir::new().unwrap();
    let (mut dispatcher, port) = started(&test_config(&tmp), Arc::new(Recorder::default())).await;
    let store = PortStore::new(tmp.path());
    assert_eq!(
        store.read(std::process::id()).await.unwrap().map(|r| r.port),
        Some(port)
    );

    dispatcher.stop().await;
    assert!(!dispatcher.status().is_running());
    assert_eq!(store.read(std::process::id()).await.unwrap(), None);
}

#[tokio::test]
async fn test_dismissed_ask_can_be_reopened_and_answered_once() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let recorder = Arc::new(Recorder::default());
    let (dispatcher, port) = started(&config, recorder.clone()).await;

    let requester = Requester::start(&config).await.unwrap().with_host_port(port);
    let ask = tokio::spawn(async move {
        let outcome = requester.ask("review please").await;
        requester.shutdown().await;
        outcome
    });

    let first = recorder.nth(0).await;
    let request_id = first.request().request_id.clone();
    first.clone().dismiss();
    assert_eq!(
        dispatcher.pending_request().map(|r| r.request_id),
        Some(request_id.clone())
    );

    assert_eq!(
        dispatcher.reopen().await,
        ReopenOutcome::Reopened {
            request_id: request_id.clone()
        }
    );
    let reopened = recorder.nth(1).await;
    assert_eq!(reopened.request().request_id, request_id);

    assert_eq!(reopened.submit("lgtm").await.unwrap(), ReplyStatus::Delivered);
    // Both presentations share one terminal reply.
    assert_eq!(first.submit("again").await.unwrap(), ReplyStatus::AlreadyFinished);
    assert_eq!(first.close().await, ReplyStatus::AlreadyFinished);

    assert_eq!(
        ask.await.unwrap(),
        AskOutcome::Answered {
            user_input: "lgtm".to_string()
        }
    );
    assert_eq!(dispatcher.reopen().await, ReopenOutcome::NoPending);
}

#[tokio::test]
async fn test_stale_ask_cannot_be_reopened() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp).with_reopen_window(Duration::from_millis(1));
    let recorder = Arc::new(Recorder::default());
    let (dispatcher, port) = started(&config, recorder.clone()).await;

    let requester = Requester::start(&config).await.unwrap().with_host_port(port);
    let ask = tokio::spawn(async move { requester.ask("old news").await });

    let session = recorder.nth(0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(dispatcher.reopen().await, ReopenOutcome::Expired);
    assert_eq!(dispatcher.reopen().await, ReopenOutcome::NoPending);

    // The original dialog still works and closing it cancels the ask.
    assert_eq!(session.close().await, ReplyStatus::Delivered);
    let outcome = ask.await.unwrap();
    assert_eq!(outcome, AskOutcome::Cancelled);
    assert_eq!(
        outcome.tool_text(AskKind::Ask),
        "User cancelled the conversation"
    );
}

#[tokio::test]
async fn test_end_without_input_means_continue() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let recorder = Arc::new(Recorder::default());
    let (_dispatcher, port) = started(&config, recorder.clone()).await;

    let requester = Requester::start(&config).await.unwrap().with_host_port(port);
    let ask = tokio::spawn(async move { requester.ask("keep going?").await });

    let session = recorder.nth(0).await;
    assert_eq!(session.end().await.unwrap(), ReplyStatus::Delivered);
    assert!(session.is_finished());

    let outcome = ask.await.unwrap();
    assert_eq!(outcome.tool_text(AskKind::Ask), "User chose to continue");
}

#[tokio::test]
async fn test_image_analysis_carries_payload() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let recorder = Arc::new(Recorder::default());
    let (_dispatcher, port) = started(&config, recorder.clone()).await;

    let requester = Requester::start(&config).await.unwrap().with_host_port(port);
    let image = ImagePayload {
        file_name: "screen.png".to_string(),
        mime_type: "image/png".to_string(),
        size: 2048,
        data_uri: Some("data:image/png;base64,AAAA".to_string()),
        question: "What is on screen?".to_string(),
    };
    let ask = tokio::spawn(async move { requester.analyze_image("look", image).await });

    let session = recorder.nth(0).await;
    assert_eq!(session.request().kind, AskKind::AnalyzeImage);
    match &session.request().payload {
        Some(ask_continue::AskPayload::Image(image)) => {
            assert_eq!(image.file_name, "screen.png");
            assert_eq!(image.question, "What is on screen?");
        }
        other => panic!("Expected image payload, got {other:?}"),
    }
    session.submit("a login form").await.unwrap();

    let outcome = ask.await.unwrap();
    assert_eq!(outcome.tool_text(AskKind::AnalyzeImage), "a login form");
}

#[tokio::test]
async fn test_restart_rebinds_and_keeps_answering() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp)
        .with_restart_settle(Duration::from_millis(10))
        .with_sweep_range(1..=2);
    let (mut dispatcher, _) = started(&config, answering("after restart")).await;

    // A dead host's record is pruned by the sweep that runs during restart.
    let store = PortStore::new(tmp.path());
    store
        .write(&ask_continue::PortRecord::new(40000, u32::MAX - 1))
        .await
        .unwrap();

    let sweeper = Sweeper::with_probe(&config, FakeProcesses::default());
    let port = dispatcher.restart(&sweeper).await.unwrap();
    assert_eq!(dispatcher.status(), ServiceState::Running { port });
    assert_eq!(store.read(u32::MAX - 1).await.unwrap(), None);
    assert_eq!(
        store.read(std::process::id()).await.unwrap().map(|r| r.port),
        Some(port)
    );

    let requester = Requester::start(&config).await.unwrap().with_host_port(port);
    assert_eq!(
        requester.ask("still there?").await,
        AskOutcome::Answered {
            user_input: "after restart".to_string()
        }
    );
}
