//! End-to-end scenarios against a running gateway and store.
//!
//! These tests are ignored by default: they need a redis instance and a
//! gateway started with the matching environment, e.g.
//!
//!   STORE_URL=redis://127.0.0.1:6379 \
//!   SECRET_KEY=integration-test-secret-key \
//!   PING_INTERVAL_SECONDS=1 PONG_TIMEOUT_SECONDS=2 \
//!   cargo run
//!
//! then `cargo test -- --ignored`.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::Message as TungsteniteMessage,
};
use url::Url;
use uuid::Uuid;

mod unit;

const BASE_URL: &str = "http://127.0.0.1:8000";
const WS_URL: &str = "ws://127.0.0.1:8000/ws/connect";

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestAccount {
    username: String,
    token: String,
    session_id: String,
}

/// Register a fresh user and log in, returning the bearer token and the
/// session created by login.
async fn register_and_login(client: &reqwest::Client) -> TestAccount {
    let username = format!("it_{}", Uuid::new_v4().simple());
    let response = client
        .post(format!("{}/sessions/register", BASE_URL))
        .json(&json!({
            "username": username,
            "email": format!("{}@example.com", username),
            "password": "password123",
        }))
        .send()
        .await
        .expect("register request");
    assert!(response.status().is_success(), "register failed");

    let response = client
        .post(format!("{}/sessions/login", BASE_URL))
        .json(&json!({"username": username, "password": "password123"}))
        .send()
        .await
        .expect("login request");
    assert!(response.status().is_success(), "login failed");

    let body: Value = response.json().await.expect("login body");
    TestAccount {
        username,
        token: body["access_token"].as_str().expect("token").to_string(),
        session_id: body["session_id"].as_str().expect("session_id").to_string(),
    }
}

async fn connect_ws(account: &TestAccount) -> WsClient {
    let url = format!(
        "{}?session_id={}&token={}",
        WS_URL, account.session_id, account.token
    );
    let url = Url::parse(&url).expect("ws url");
    let (stream, _) = connect_async(url).await.expect("ws connect");
    stream
}

/// Read frames until one matches the predicate, answering server pings on
/// the way so heartbeats do not interfere with the wait.
async fn wait_for_frame<F>(ws: &mut WsClient, wait: Duration, mut predicate: F) -> Option<Value>
where
    F: FnMut(&Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let frame = match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(TungsteniteMessage::Text(text)))) => {
                serde_json::from_str::<Value>(&text).ok()?
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        };
        if frame["type"] == "ping" {
            let _ = ws
                .send(TungsteniteMessage::Text(
                    json!({"type": "pong", "ts": frame["ts"]}).to_string(),
                ))
                .await;
            continue;
        }
        if predicate(&frame) {
            return Some(frame);
        }
    }
}

#[tokio::test]
#[ignore = "requires redis and a running gateway"]
async fn register_login_connect_update() {
    let client = reqwest::Client::new();
    let account = register_and_login(&client).await;
    let mut ws = connect_ws(&account).await;

    let connected = wait_for_frame(&mut ws, Duration::from_secs(5), |f| f["type"] == "connected")
        .await
        .expect("connected frame");
    assert_eq!(connected["user_id"], account.username.as_str());
    assert_eq!(connected["session_id"], account.session_id.as_str());

    ws.send(TungsteniteMessage::Text(
        json!({"type": "update_api_key", "key": "K"}).to_string(),
    ))
    .await
    .expect("send update");

    let ack = wait_for_frame(&mut ws, Duration::from_secs(5), |f| f["type"] == "ack")
        .await
        .expect("ack frame");
    assert_eq!(ack["api_key"], "K");
    assert_eq!(ack["session_id"], account.session_id.as_str());

    // Allow one flush interval for the write-behind layer.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let session: Value = client
        .get(format!("{}/sessions/{}", BASE_URL, account.session_id))
        .bearer_auth(&account.token)
        .send()
        .await
        .expect("get session")
        .json()
        .await
        .expect("session body");
    assert_eq!(session["data"]["api_key"], "K");
}

#[tokio::test]
#[ignore = "requires redis and a running gateway"]
async fn logout_closes_all_of_the_users_sockets() {
    let client = reqwest::Client::new();
    let account = register_and_login(&client).await;

    // Two sockets for the same user; in production they would sit on
    // different replicas, with the logout fanning out over the store bus.
    let mut ws1 = connect_ws(&account).await;
    let mut ws2 = connect_ws(&account).await;
    wait_for_frame(&mut ws1, Duration::from_secs(5), |f| f["type"] == "connected").await;
    wait_for_frame(&mut ws2, Duration::from_secs(5), |f| f["type"] == "connected").await;

    let response = client
        .post(format!("{}/sessions/logout", BASE_URL))
        .bearer_auth(&account.token)
        .send()
        .await
        .expect("logout");
    assert!(response.status().is_success());

    for ws in [&mut ws1, &mut ws2] {
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(TungsteniteMessage::Close(_))) | None => break true,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break true,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(closed, "socket did not close within 2s of logout");
    }
}

#[tokio::test]
#[ignore = "requires redis and a gateway with PING_INTERVAL_SECONDS=1 PONG_TIMEOUT_SECONDS=2"]
async fn suppressed_pongs_close_the_socket() {
    let client = reqwest::Client::new();
    let account = register_and_login(&client).await;
    let mut ws = connect_ws(&account).await;

    // Never answer pings; the server must close after ping + pong timeout.
    let closed = timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(TungsteniteMessage::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                _ => break None,
            }
        }
    })
    .await
    .expect("socket should close after pong timeout");

    if let Some(frame) = closed {
        assert_eq!(u16::from(frame.code), 1000);
    }
}

#[tokio::test]
#[ignore = "requires redis and a running gateway"]
async fn user_role_cannot_run_admin_commands() {
    let client = reqwest::Client::new();
    let account = register_and_login(&client).await;
    let mut ws = connect_ws(&account).await;
    wait_for_frame(&mut ws, Duration::from_secs(5), |f| f["type"] == "connected").await;

    ws.send(TungsteniteMessage::Text(
        json!({"type": "admin_command", "command": "stats"}).to_string(),
    ))
    .await
    .expect("send admin command");

    let error = wait_for_frame(&mut ws, Duration::from_secs(5), |f| f["type"] == "error")
        .await
        .expect("error frame");
    assert_eq!(error["message"], "not permitted");

    // Socket stays open: a ping still round-trips.
    ws.send(TungsteniteMessage::Text(
        json!({"type": "ping", "ts": 42}).to_string(),
    ))
    .await
    .expect("send ping");
    let pong = wait_for_frame(&mut ws, Duration::from_secs(5), |f| f["type"] == "pong")
        .await
        .expect("pong frame");
    assert_eq!(pong["ts"], 42);
}

#[tokio::test]
#[ignore = "requires redis and a running gateway"]
async fn cross_user_session_read_is_forbidden() {
    let client = reqwest::Client::new();
    let alice = register_and_login(&client).await;
    let bob = register_and_login(&client).await;

    let response = client
        .get(format!("{}/sessions/{}", BASE_URL, bob.session_id))
        .bearer_auth(&alice.token)
        .send()
        .await
        .expect("cross-user get");
    assert_eq!(response.status().as_u16(), 403);

    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["detail"], "Session access denied");
}

#[tokio::test]
#[ignore = "requires redis and a running gateway"]
async fn rapid_updates_coalesce_to_the_last_value() {
    let client = reqwest::Client::new();
    let account = register_and_login(&client).await;
    let mut ws = connect_ws(&account).await;
    wait_for_frame(&mut ws, Duration::from_secs(5), |f| f["type"] == "connected").await;

    // 50 updates inside one flush window; the store should see one
    // coalesced write whose value is the last key.
    for i in 1..=50 {
        ws.send(TungsteniteMessage::Text(
            json!({"type": "update_api_key", "key": format!("K{}", i)}).to_string(),
        ))
        .await
        .expect("send update");
    }

    let mut acks = 0;
    while acks < 50 {
        let ack = wait_for_frame(&mut ws, Duration::from_secs(5), |f| f["type"] == "ack")
            .await
            .expect("ack frame");
        assert!(ack["api_key"].as_str().unwrap().starts_with('K'));
        acks += 1;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    let session: Value = client
        .get(format!("{}/sessions/{}", BASE_URL, account.session_id))
        .bearer_auth(&account.token)
        .send()
        .await
        .expect("get session")
        .json()
        .await
        .expect("session body");
    assert_eq!(session["data"]["api_key"], "K50");
}
