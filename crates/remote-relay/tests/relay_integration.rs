use futures_util::{SinkExt, StreamExt};
use remote_core::Identity;
use remote_relay::{serve, Relay, RelayConfig};
use remote_storage::{IdentityStore, SqliteStore};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    url: String,
    relay: Arc<Relay>,
    store: Arc<SqliteStore>,
    data_dir: PathBuf,
    _shutdown: oneshot::Sender<()>,
    _temp: tempfile::TempDir,
}

async fn launch_relay(configure: impl FnOnce(&mut RelayConfig)) -> TestRelay {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let mut config = RelayConfig {
        addr: "127.0.0.1:0".to_string(),
        data_dir: data_dir.clone(),
        grace_period: Duration::from_secs(5),
        write_timeout: Duration::from_secs(2),
        probe_action: String::new(),
        ..RelayConfig::default()
    };
    configure(&mut config);

    let store = Arc::new(SqliteStore::open_in_memory().expect("open db"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let relay = Arc::new(Relay::new(config, store.clone()));
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(serve(listener, relay.clone(), async move {
        let _ = rx.await;
    }));

    TestRelay {
        url: format!("ws://{addr}/ws"),
        relay,
        store,
        data_dir,
        _shutdown: tx,
        _temp: temp,
    }
}

async fn connect(url: &str) -> Socket {
    let (ws, _) = connect_async(url).await.expect("connect");
    ws
}

async fn send(ws: &mut Socket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

async fn recv_timeout(ws: &mut Socket, timeout: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        match next.ok()? {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn recv(ws: &mut Socket) -> Value {
    recv_timeout(ws, Duration::from_secs(3))
        .await
        .expect("expected a frame")
}

async fn expect_closed(ws: &mut Socket) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => panic!("connection was not closed"),
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

async fn hello(ws: &mut Socket, identity: &str) {
    send(ws, json!({"type": "hello", "identity": identity})).await;
    let welcome = recv(ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["identity"], identity);
}

async fn new_agent(url: &str) -> (Socket, String) {
    let mut ws = connect(url).await;
    send(&mut ws, json!({"type": "setup"})).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "setup");
    let identity = reply["identity"].as_str().expect("identity").to_string();
    hello(&mut ws, &identity).await;
    (ws, identity)
}

async fn new_backend(url: &str) -> Socket {
    let mut ws = connect(url).await;
    hello(&mut ws, "backend").await;
    ws
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn setup_then_hello_lists_own_identity() {
    let relay = launch_relay(|_| {}).await;
    let (mut agent, identity) = new_agent(&relay.url).await;

    assert!(relay
        .store
        .get_host(&Identity::from(identity.as_str()))
        .expect("get host")
        .is_some());

    send(&mut agent, json!({"type": "hosts", "token": "tok-h"})).await;
    let hosts = recv(&mut agent).await;
    assert_eq!(hosts["type"], "hosts");
    assert_eq!(hosts["token"], "tok-h");
    assert_eq!(hosts["hosts"], json!([identity]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_round_trip_between_backend_and_agent() {
    let relay = launch_relay(|_| {}).await;
    let (mut agent, identity) = new_agent(&relay.url).await;
    let mut backend = new_backend(&relay.url).await;

    send(
        &mut backend,
        json!({
            "type": "cmd",
            "target": identity,
            "token": "tok-1",
            "action": "echo_back",
            "text": "ping"
        }),
    )
    .await;

    let request = recv(&mut agent).await;
    assert_eq!(request["type"], "echo_back");
    assert_eq!(request["token"], "tok-1");
    assert_eq!(request["text"], "ping");
    assert!(request.get("target").is_none());

    send(
        &mut agent,
        json!({"type": "echo_back", "token": "tok-1", "text": "ping"}),
    )
    .await;

    let reply = recv(&mut backend).await;
    assert_eq!(reply["type"], "echo_back");
    assert_eq!(reply["token"], "tok-1");
    assert_eq!(reply["from"], identity);
    assert_eq!(reply["text"], "ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_to_ghost_target_reports_offline() {
    let relay = launch_relay(|_| {}).await;
    let mut backend = new_backend(&relay.url).await;

    send(
        &mut backend,
        json!({"type": "cmd", "target": "ghost", "token": "tok-g", "action": "run"}),
    )
    .await;

    let failure = recv(&mut backend).await;
    assert_eq!(failure["type"], "error");
    assert_eq!(failure["code"], "target_offline");
    assert_eq!(failure["token"], "tok-g");
    assert_eq!(failure["target"], "ghost");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_identity_hello_closes_connection() {
    let relay = launch_relay(|_| {}).await;
    let mut ws = connect(&relay.url).await;

    send(&mut ws, json!({"type": "hello", "identity": "not-registered"})).await;
    expect_closed(&mut ws).await;
    assert_eq!(relay.relay.registry().len().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthenticated_traffic_dropped_then_closed_after_grace() {
    let relay = launch_relay(|config| {
        config.grace_period = Duration::from_millis(600);
    })
    .await;
    let mut ws = connect(&relay.url).await;

    send(&mut ws, json!({"type": "hosts"})).await;
    send(&mut ws, json!({"type": "heartbeat"})).await;
    send(&mut ws, json!({"broken": true})).await;
    assert!(recv_timeout(&mut ws, Duration::from_millis(200)).await.is_none());

    expect_closed(&mut ws).await;
    assert_eq!(relay.relay.registry().len().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_setups_never_collide() {
    let relay = launch_relay(|_| {}).await;

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let url = relay.url.clone();
            tokio::spawn(async move {
                let mut ws = connect(&url).await;
                send(&mut ws, json!({"type": "setup"})).await;
                let reply = recv(&mut ws).await;
                reply["identity"].as_str().expect("identity").to_string()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let identity = handle.await.expect("join");
        assert!(seen.insert(identity), "duplicate identity");
    }
    assert_eq!(relay.store.list_hosts().expect("list").len(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_hello_replaces_first_connection() {
    let relay = launch_relay(|_| {}).await;
    let (mut first, identity) = new_agent(&relay.url).await;
    let mut second = connect(&relay.url).await;
    hello(&mut second, &identity).await;

    expect_closed(&mut first).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        relay.relay.registry().list_identities().await,
        vec![Identity::from(identity.as_str())]
    );

    let mut backend = new_backend(&relay.url).await;
    send(
        &mut backend,
        json!({"type": "cmd", "target": identity, "token": "tok-r", "action": "run"}),
    )
    .await;
    let request = recv(&mut second).await;
    assert_eq!(request["token"], "tok-r");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_probe_reply_is_saved_and_not_forwarded() {
    let relay = launch_relay(|config| {
        config.probe_action = "snip".to_string();
    })
    .await;
    let (mut agent, identity) = new_agent(&relay.url).await;
    let mut backend = new_backend(&relay.url).await;

    send(&mut agent, json!({"type": "heartbeat"})).await;
    let probe = recv(&mut agent).await;
    assert_eq!(probe["type"], "snip");
    let token = probe["token"].as_str().expect("probe token").to_string();

    // "png!" in base64
    send(
        &mut agent,
        json!({"type": "snip", "token": token, "data": "cG5nIQ=="}),
    )
    .await;
    assert!(recv_timeout(&mut backend, Duration::from_millis(300))
        .await
        .is_none());

    let dir = relay.data_dir.join(&identity).join("snip");
    let mut saved: Vec<std::fs::DirEntry> = Vec::new();
    for _ in 0..50 {
        saved = std::fs::read_dir(&dir)
            .map(|entries| entries.filter_map(|entry| entry.ok()).collect())
            .unwrap_or_default();
        if !saved.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(saved.len(), 1);
    assert_eq!(std::fs::read(saved[0].path()).expect("read"), b"png!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loopback_backend_authenticates_and_gets_echo() {
    let relay = launch_relay(|config| {
        config.allow_remote_backend = false;
    })
    .await;
    let mut backend = new_backend(&relay.url).await;
    send(&mut backend, json!({"type": "echo", "message": "hi", "token": "t"})).await;
    let echo = recv(&mut backend).await;
    assert_eq!(echo, json!({"type": "echo", "message": "hi", "token": "t"}));
}
