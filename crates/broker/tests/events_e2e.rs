// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios from spec.md §8, driven against a real Redis
//! instance (via testcontainers) and real bound TCP listeners rather than
//! an in-memory mock transport, since several scenarios depend on a
//! genuinely long-lived, progressively-read HTTP response body that
//! axum-test's buffered mock client cannot represent.
//!
//! Requires Docker to be available to run.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ssebroker::auth::mint_token;
use ssebroker::config::BrokerConfig;
use ssebroker::dispatcher::Dispatcher;
use ssebroker::instance::Instance;
use ssebroker::model::{InstanceAddress, Uid};
use ssebroker::redis_store::RedisStore;
use ssebroker::state::AppState;
use ssebroker::transport::build_router;

const JWT_SECRET: &str = "e2e-test-secret";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestBroker {
    addr: SocketAddr,
    state: Arc<AppState>,
    instance: Instance,
}

impl TestBroker {
    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn shutdown(&self) {
        self.instance.stop(&self.state).await;
        let _ = self.instance.dispose().await;
    }
}

/// Bring up one broker instance wired to `redis_url`, nominally addressed
/// as `nominal_address` for cluster routing (this need not match the real
/// bound TCP port: cross-instance delivery only ever goes through Redis
/// pub/sub topics named after it, never a direct connection to it).
async fn spawn_broker(redis_url: &str, nominal_address: &str, heartbeat_secs: u64) -> TestBroker {
    let config = BrokerConfig {
        config: None,
        host: "127.0.0.1".to_owned(),
        port: 0,
        instance_address: Some(nominal_address.to_owned()),
        redis_addrs: vec![redis_url.to_owned()],
        redis_password: None,
        redis_db: 0,
        redis_pool_size: 10,
        jwt_secret: JWT_SECRET.to_owned(),
        jwt_expire_secs: 3600,
        heartbeat_interval_secs: heartbeat_secs,
        device_frame_cache_size: 50,
        device_frame_cache_expire_secs: 3600,
        resolve_batch_size: 250,
    };

    let instance_address = InstanceAddress::from(nominal_address);
    let shutdown = CancellationToken::new();
    let store = RedisStore::connect(&config).await.expect("connect to redis");
    let state = Arc::new(AppState::new(config, instance_address.clone(), store.clone(), shutdown.clone()));

    let dispatcher = Dispatcher::new(store.clone());
    let instance = Instance::new(instance_address, store, dispatcher, shutdown);
    instance.clear().await.expect("clear stale instance record");
    instance.start(state.clone()).await.expect("start instance");

    let router = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    TestBroker { addr, state, instance }
}

async fn redis_url(container: &ContainerAsync<Redis>) -> String {
    let port = container.get_host_port_ipv4(6379).await.expect("mapped redis port");
    format!("redis://127.0.0.1:{port}")
}

/// Buffers a `reqwest` byte stream and yields one decoded SSE event (the
/// bytes up to and including each `\n\n` terminator) per call, since a
/// single TCP read can coalesce more than one logical write from the
/// broker and a naive per-call read would drop or misparse the remainder.
struct EventReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> EventReader<S>
where
    S: futures_util::Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self { stream, buf: Vec::new() }
    }

    async fn next_event(&mut self) -> String {
        loop {
            if let Some(pos) = find_double_newline(&self.buf) {
                let rest = self.buf.split_off(pos + 2);
                let event = std::mem::replace(&mut self.buf, rest);
                return String::from_utf8(event).expect("sse event is utf8");
            }
            match timeout(RECV_TIMEOUT, self.stream.next()).await {
                Ok(Some(Ok(chunk))) => self.buf.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => panic!("stream error: {e}"),
                Ok(None) => panic!("stream ended before a full event arrived"),
                Err(_) => panic!("timed out waiting for an sse event"),
            }
        }
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

async fn connect_sse(client: &reqwest::Client, broker: &TestBroker, uid: &str, device: &str, last_id: Option<u64>) -> reqwest::Response {
    let token = mint_token(JWT_SECRET, &Uid::from(uid), device, 3600).expect("mint token");
    let mut url = format!("{}/events?token={token}&device={device}", broker.base_url());
    if let Some(id) = last_id {
        url.push_str(&format!("&id={id}"));
    }
    client.get(&url).send().await.expect("events request")
}

#[tokio::test]
async fn connect_then_send_delivers_a_frame() {
    let container = Redis::default().start().await.expect("start redis container");
    let url = redis_url(&container).await;
    let broker = spawn_broker(&url, "node-s1:9001", 30).await;

    let client = reqwest::Client::new();
    let resp = connect_sse(&client, &broker, "alice", "laptop-1", None).await;
    assert!(resp.status().is_success());
    let mut stream = EventReader::new(resp.bytes_stream());

    let connected = stream.next_event().await;
    assert!(connected.starts_with("event: sys_connected\n"), "got: {connected:?}");

    let send_resp = client
        .post(format!("{}/send", broker.base_url()))
        .json(&serde_json::json!({"device": "laptop-1", "event": "ping", "data": "hello"}))
        .send()
        .await
        .expect("send request");
    let body: serde_json::Value = send_resp.json().await.expect("send response json");
    assert_eq!(body["result"], 1);

    let frame = stream.next_event().await;
    assert!(frame.starts_with("id: 1\n"), "got: {frame:?}");
    assert!(frame.contains("event: ping\n"));
    assert!(frame.contains("data: hello"));

    broker.shutdown().await;
}

#[tokio::test]
async fn reconnect_with_last_event_id_replays_only_newer_frames() {
    let container = Redis::default().start().await.expect("start redis container");
    let url = redis_url(&container).await;
    let broker = spawn_broker(&url, "node-s2:9001", 30).await;
    let client = reqwest::Client::new();

    let first = connect_sse(&client, &broker, "bob", "phone-1", None).await;
    let mut first_stream = EventReader::new(first.bytes_stream());
    let _ = first_stream.next_event().await; // sys_connected

    for data in ["f1", "f2", "f3"] {
        let resp = client
            .post(format!("{}/send", broker.base_url()))
            .json(&serde_json::json!({"device": "phone-1", "data": data}))
            .send()
            .await
            .expect("send request");
        let body: serde_json::Value = resp.json().await.expect("send response json");
        assert_eq!(body["result"], 1);
        let _ = first_stream.next_event().await;
    }
    drop(first_stream);

    // Reconnecting preempts the first session (delivered regardless of
    // whether the old connection's write actually reaches a live peer) and
    // replays only frames with id > 1.
    let second = connect_sse(&client, &broker, "bob", "phone-1", Some(1)).await;
    let mut second_stream = EventReader::new(second.bytes_stream());
    let connected = second_stream.next_event().await;
    assert!(connected.starts_with("event: sys_connected\n"));

    let replay_2 = second_stream.next_event().await;
    assert!(replay_2.starts_with("id: 2\n"), "got: {replay_2:?}");
    assert!(replay_2.contains("data: f2"));

    let replay_3 = second_stream.next_event().await;
    assert!(replay_3.starts_with("id: 3\n"), "got: {replay_3:?}");
    assert!(replay_3.contains("data: f3"));

    // The preempted first handler's own teardown races the reconnect's new
    // channel registration; give it a moment to run, then confirm the
    // reconnected session is still locally reachable — a send must still be
    // delivered (not dropped or forced onto a remote-dispatch path) and must
    // land on the second stream, not get silently eaten by the old
    // handler's finalize removing the new registration.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let resp = client
        .post(format!("{}/send", broker.base_url()))
        .json(&serde_json::json!({"device": "phone-1", "data": "f4"}))
        .send()
        .await
        .expect("send request");
    let body: serde_json::Value = resp.json().await.expect("send response json");
    assert_eq!(body["result"], 1, "reconnected device must still resolve to exactly one live channel");

    let replay_4 = second_stream.next_event().await;
    assert!(replay_4.starts_with("id: 4\n"), "got: {replay_4:?}");
    assert!(replay_4.contains("data: f4"));

    broker.shutdown().await;
}

#[tokio::test]
async fn broadcast_with_no_selector_reaches_every_device_across_instances() {
    let container = Redis::default().start().await.expect("start redis container");
    let url = redis_url(&container).await;
    let a = spawn_broker(&url, "node-s4-a:9001", 30).await;
    let b = spawn_broker(&url, "node-s4-b:9002", 30).await;
    let client = reqwest::Client::new();

    let r1 = connect_sse(&client, &a, "u1", "dev-a1", None).await;
    let r2 = connect_sse(&client, &a, "u2", "dev-a2", None).await;
    let r3 = connect_sse(&client, &b, "u3", "dev-b1", None).await;
    let mut s1 = EventReader::new(r1.bytes_stream());
    let mut s2 = EventReader::new(r2.bytes_stream());
    let mut s3 = EventReader::new(r3.bytes_stream());
    let _ = s1.next_event().await;
    let _ = s2.next_event().await;
    let _ = s3.next_event().await;

    let resp = client
        .post(format!("{}/send", a.base_url()))
        .json(&serde_json::json!({"data": "broadcast-1"}))
        .send()
        .await
        .expect("send request");
    let body: serde_json::Value = resp.json().await.expect("send response json");
    assert_eq!(body["result"], 3);

    for stream in [&mut s1, &mut s2, &mut s3] {
        let frame = stream.next_event().await;
        assert!(frame.contains("data: broadcast-1"), "got: {frame:?}");
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn user_online_offline_events_are_edge_triggered_across_devices() {
    let container = Redis::default().start().await.expect("start redis container");
    let url = redis_url(&container).await;
    // A short heartbeat so a dropped TCP connection is detected (and torn
    // down) quickly instead of only at the next frame send.
    let broker = spawn_broker(&url, "node-s5:9001", 1).await;
    let client = reqwest::Client::new();

    let mut pubsub = redis::Client::open(url.clone()).expect("open redis client").get_async_pubsub().await.expect("pubsub conn");
    pubsub.subscribe(ssebroker::redis_store::TOPIC_USER_ONLINE).await.expect("subscribe online");
    pubsub.subscribe(ssebroker::redis_store::TOPIC_USER_OFFLINE).await.expect("subscribe offline");
    let mut events = pubsub.on_message();

    let first = connect_sse(&client, &broker, "carol", "tablet-1", None).await;
    let mut first_stream = EventReader::new(first.bytes_stream());
    let _ = first_stream.next_event().await;

    let first_msg = timeout(RECV_TIMEOUT, events.next()).await.expect("online event timeout").expect("online event");
    assert_eq!(first_msg.get_channel_name(), ssebroker::redis_store::TOPIC_USER_ONLINE);

    // A second device for the same user must not fire a second online event.
    let second = connect_sse(&client, &broker, "carol", "tablet-2", None).await;
    let mut second_stream = EventReader::new(second.bytes_stream());
    let _ = second_stream.next_event().await;
    assert!(
        timeout(Duration::from_millis(500), events.next()).await.is_err(),
        "a second device for an already-online user must not re-announce online"
    );

    // Dropping the first device's connection, while the second is still
    // live, must not announce the user offline yet.
    drop(first_stream);
    assert!(
        timeout(Duration::from_secs(3), events.next()).await.is_err(),
        "user must stay online while at least one of their devices is connected"
    );

    // Dropping the last device announces the user offline.
    drop(second_stream);
    let last_msg = timeout(Duration::from_secs(3), events.next()).await.expect("offline event timeout").expect("offline event");
    assert_eq!(last_msg.get_channel_name(), ssebroker::redis_store::TOPIC_USER_OFFLINE);

    broker.shutdown().await;
}
