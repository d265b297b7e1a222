//! End-to-end tests against an in-process controller and edge router.
//!
//! The controller is a small axum app speaking the response envelope; the
//! router speaks the edge framing over plain `tcp://`. Services whose name
//! is not hosted are echoed by the router itself; hosted services are
//! forwarded between the two logical connections, which is what exercises
//! the end-to-end encryption (the router never sees plaintext).

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::time::Duration;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use bytes::BytesMut;
use codec::{ContentType, Message, header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{sleep, timeout},
};

use veil_sdk::{
    ConnState, Context, Error, Event, EventTypes, Options, RouterStatus, Service,
};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// fake edge router

enum RouterOut {
    Msg(Message),
    Shutdown,
}

struct Writer {
    tx: mpsc::UnboundedSender<RouterOut>,
    seq: Arc<AtomicU32>,
}

#[derive(Default)]
struct RouterState {
    next_tid: AtomicU32,
    writers: Mutex<HashMap<u32, Writer>>,
    /// service name -> (transport, bound conn id)
    hosts: Mutex<HashMap<String, (u32, u32)>>,
    /// forwarded dial seq -> (dialer transport, connect seq, dialer conn id)
    pending: Mutex<HashMap<u32, (u32, u32, u32)>>,
    /// (transport, conn) -> (peer transport, peer conn)
    routes: Mutex<HashMap<(u32, u32), (u32, u32)>>,
    echoes: Mutex<HashMap<(u32, u32), ()>>,
    /// Flip a ciphertext bit in the next forwarded payload.
    corrupt_next: AtomicBool,
}

#[derive(Clone)]
struct FakeRouter {
    state: Arc<RouterState>,
    url: String,
}

impl FakeRouter {
    async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("tcp://127.0.0.1:{}", listener.local_addr()?.port());
        let state = Arc::new(RouterState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tid = accept_state.next_tid.fetch_add(1, Ordering::Relaxed) + 1;
                tokio::spawn(router_conn(accept_state.clone(), tid, socket));
            }
        });

        Ok(Self { state, url })
    }

    /// Drops every client transport, as if the router restarted.
    fn disconnect_all(&self) {
        for (_, writer) in self.state.writers.lock().drain() {
            let _ = writer.tx.send(RouterOut::Shutdown);
        }
        self.state.hosts.lock().clear();
        self.state.routes.lock().clear();
        self.state.echoes.lock().clear();
    }
}

impl RouterState {
    /// Queues a frame on a transport; returns the wire sequence it will go
    /// out with.
    fn send_to(&self, tid: u32, mut msg: Message) -> Option<u32> {
        let writers = self.writers.lock();
        let writer = writers.get(&tid)?;

        let seq = writer.seq.fetch_add(1, Ordering::Relaxed) + 1;
        msg.seq = seq;
        writer.tx.send(RouterOut::Msg(msg)).ok()?;
        Some(seq)
    }
}

fn parse_token(token: &[u8]) -> Option<String> {
    let token = std::str::from_utf8(token).ok()?;
    let mut parts = token.split(':');
    if parts.next()? != "ns" {
        return None;
    }
    parts.next().map(str::to_string)
}

async fn router_conn(state: Arc<RouterState>, tid: u32, socket: TcpStream) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RouterOut>();

    state.writers.lock().insert(
        tid,
        Writer {
            tx,
            seq: Arc::new(AtomicU32::new(0)),
        },
    );

    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                RouterOut::Shutdown => break,
                RouterOut::Msg(msg) => {
                    let mut buf = BytesMut::new();
                    if msg.encode(&mut buf).is_err() || write_half.write_all(&buf).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut accum = BytesMut::new();
    loop {
        match read_half.read_buf(&mut accum).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        loop {
            let size = match Message::message_size(&accum) {
                Ok(Some(size)) if accum.len() >= size => size,
                Ok(_) => break,
                Err(_) => return,
            };

            let frame = accum.split_to(size);
            let Ok(msg) = Message::decode(&frame) else { return };
            handle_router_frame(&state, tid, msg);
        }
    }

    state.writers.lock().remove(&tid);
}

fn handle_router_frame(state: &Arc<RouterState>, tid: u32, msg: Message) {
    match msg.content {
        ContentType::Hello => {
            let reply = Message::new(ContentType::HelloReply)
                .with_u32(header::REPLY_FOR, msg.seq)
                .with_flag(header::RESULT_SUCCESS, true)
                .with_header(header::ROUTER_INFO, &b"test-router/0.1"[..]);
            state.send_to(tid, reply);
        }
        ContentType::Latency => {
            let reply =
                Message::new(ContentType::LatencyResponse).with_u32(header::REPLY_FOR, msg.seq);
            state.send_to(tid, reply);
        }
        ContentType::Ping => {
            let reply = Message::new(ContentType::PingReply).with_u32(header::REPLY_FOR, msg.seq);
            state.send_to(tid, reply);
        }
        ContentType::Bind => {
            let Some(service) = parse_token(&msg.body) else { return };
            let conn_id = msg.conn_id().unwrap_or(0);
            state.hosts.lock().insert(service, (tid, conn_id));

            let reply = Message::new(ContentType::StateConnected)
                .with_u32(header::REPLY_FOR, msg.seq)
                .with_u32(header::CONN_ID, conn_id)
                .with_flag(header::RESULT_SUCCESS, true);
            state.send_to(tid, reply);
        }
        ContentType::Unbind => {
            let Some(service) = parse_token(&msg.body) else { return };
            state.hosts.lock().remove(&service);
        }
        ContentType::Connect => {
            let Some(service) = parse_token(&msg.body) else { return };
            let conn_id = msg.conn_id().unwrap_or(0);

            if service == "blackhole" {
                return;
            }

            let host = state.hosts.lock().get(&service).copied();
            match host {
                Some((host_tid, host_conn)) => {
                    let mut dial = Message::new(ContentType::Dial)
                        .with_u32(header::CONN_ID, host_conn);
                    if let Some(pk) = msg.header(header::PUBLIC_KEY) {
                        dial = dial.with_header(header::PUBLIC_KEY, pk.to_vec());
                    }
                    if let Some(caller) = msg.header(header::CALLER_ID) {
                        dial = dial.with_header(header::CALLER_ID, caller.to_vec());
                    }

                    if let Some(dial_seq) = state.send_to(host_tid, dial) {
                        state
                            .pending
                            .lock()
                            .insert(dial_seq, (tid, msg.seq, conn_id));
                    }
                }
                None => {
                    // unhosted services are echoed by the router itself
                    state.echoes.lock().insert((tid, conn_id), ());
                    let reply = Message::new(ContentType::StateConnected)
                        .with_u32(header::REPLY_FOR, msg.seq)
                        .with_u32(header::CONN_ID, conn_id)
                        .with_flag(header::RESULT_SUCCESS, true);
                    state.send_to(tid, reply);
                }
            }
        }
        ContentType::StateConnected => {
            // a host answered a forwarded dial
            let Some(reply_for) = msg.reply_for() else { return };
            let Some((dialer_tid, connect_seq, dialer_conn)) =
                state.pending.lock().remove(&reply_for)
            else {
                return;
            };

            let child_conn = msg.conn_id().unwrap_or(0);
            {
                let mut routes = state.routes.lock();
                routes.insert((tid, child_conn), (dialer_tid, dialer_conn));
                routes.insert((dialer_tid, dialer_conn), (tid, child_conn));
            }

            let mut reply = Message::new(ContentType::StateConnected)
                .with_u32(header::REPLY_FOR, connect_seq)
                .with_u32(header::CONN_ID, dialer_conn)
                .with_flag(header::RESULT_SUCCESS, true);
            if let Some(pk) = msg.header(header::PUBLIC_KEY) {
                reply = reply.with_header(header::PUBLIC_KEY, pk.to_vec());
            }
            state.send_to(dialer_tid, reply);
        }
        ContentType::DialFailed => {
            let Some(reply_for) = msg.reply_for() else { return };
            let Some((dialer_tid, connect_seq, dialer_conn)) =
                state.pending.lock().remove(&reply_for)
            else {
                return;
            };

            let reply = Message::new(ContentType::DialFailed)
                .with_u32(header::REPLY_FOR, connect_seq)
                .with_u32(header::CONN_ID, dialer_conn)
                .with_flag(header::RESULT_SUCCESS, false);
            state.send_to(dialer_tid, reply);
        }
        ContentType::Data => {
            let Some(conn_id) = msg.conn_id() else { return };

            if state.echoes.lock().contains_key(&(tid, conn_id)) {
                let mut echo = Message::new(ContentType::Data)
                    .with_u32(header::CONN_ID, conn_id)
                    .with_body(msg.body.clone());
                if let Some(seq) = msg.edge_seq() {
                    echo = echo.with_u32(header::SEQ, seq);
                }
                if msg.is_fin() {
                    echo = echo.with_flag(header::FIN, true);
                }
                state.send_to(tid, echo);
                return;
            }

            let peer = state.routes.lock().get(&(tid, conn_id)).copied();
            if let Some((peer_tid, peer_conn)) = peer {
                let mut body = msg.body.to_vec();
                if !body.is_empty() && state.corrupt_next.swap(false, Ordering::Relaxed) {
                    body[0] ^= 0x80;
                }

                let mut fwd = Message::new(ContentType::Data)
                    .with_u32(header::CONN_ID, peer_conn)
                    .with_body(body);
                if let Some(seq) = msg.edge_seq() {
                    fwd = fwd.with_u32(header::SEQ, seq);
                }
                if msg.is_fin() {
                    fwd = fwd.with_flag(header::FIN, true);
                }
                state.send_to(peer_tid, fwd);
            }
        }
        ContentType::StateClosed => {
            let Some(conn_id) = msg.conn_id() else { return };
            state.echoes.lock().remove(&(tid, conn_id));

            let peer = state.routes.lock().remove(&(tid, conn_id));
            if let Some((peer_tid, peer_conn)) = peer {
                state.routes.lock().remove(&(peer_tid, peer_conn));
                let fwd =
                    Message::new(ContentType::StateClosed).with_u32(header::CONN_ID, peer_conn);
                state.send_to(peer_tid, fwd);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// fake controller

struct CtrlState {
    services: Mutex<Vec<Service>>,
    last_change: Mutex<String>,
    sessions_posted: AtomicU32,
    login_fail: AtomicBool,
    router_url: String,
}

#[derive(Clone)]
struct FakeController {
    state: Arc<CtrlState>,
    url: String,
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "meta": {}, "data": data }))
}

fn service(id: &str, name: &str, permissions: &[&str], encrypted: bool) -> Service {
    serde_json::from_value(json!({
        "id": id,
        "name": name,
        "permissions": permissions,
        "encryptionRequired": encrypted,
    }))
    .unwrap()
}

impl FakeController {
    async fn spawn(router_url: &str, services: Vec<Service>) -> Result<Self> {
        let state = Arc::new(CtrlState {
            services: Mutex::new(services),
            last_change: Mutex::new("v1".to_string()),
            sessions_posted: AtomicU32::new(0),
            login_fail: AtomicBool::new(false),
            router_url: router_url.to_string(),
        });

        let app = Router::new()
            .route("/version", get(version))
            .route("/authenticate", post(authenticate))
            .route("/current-api-session", get(current_session).delete(logout))
            .route("/current-identity", get(current_identity))
            .route("/current-api-session/service-updates", get(service_updates))
            .route("/current-api-session/edge-routers", get(edge_routers))
            .route("/services", get(self::services))
            .route("/sessions", post(create_session))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://127.0.0.1:{}", listener.local_addr()?.port());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { state, url })
    }

    fn set_services(&self, services: Vec<Service>, change: &str) {
        *self.state.services.lock() = services;
        *self.state.last_change.lock() = change.to_string();
    }

    fn sessions_posted(&self) -> u32 {
        self.state.sessions_posted.load(Ordering::Relaxed)
    }
}

fn session_json() -> Value {
    let expires = chrono::Utc::now() + chrono::Duration::hours(1);
    json!({
        "id": "as-1",
        "token": "session-token-1",
        "expiresAt": expires.to_rfc3339(),
        "updatedAt": chrono::Utc::now().to_rfc3339(),
        "identity": { "id": "id-1", "name": "test-client" },
    })
}

async fn version(State(_): State<Arc<CtrlState>>) -> Json<Value> {
    envelope(json!({ "version": "0.1.0", "revision": "test" }))
}

async fn authenticate(State(state): State<Arc<CtrlState>>) -> (StatusCode, Json<Value>) {
    if state.login_fail.load(Ordering::Relaxed) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "meta": {},
                "error": { "code": "UNAUTHORIZED", "message": "invalid client certificate" },
            })),
        );
    }

    (StatusCode::OK, envelope(session_json()))
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("zt-session")
        .is_some_and(|it| it == "session-token-1")
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "meta": {},
            "error": { "code": "UNAUTHORIZED", "message": "no session" },
        })),
    )
}

async fn current_session(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }

    (StatusCode::OK, envelope(session_json()))
}

async fn logout() -> Json<Value> {
    Json(json!({ "meta": {} }))
}

async fn current_identity(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }

    (
        StatusCode::OK,
        envelope(json!({ "id": "id-1", "name": "test-client" })),
    )
}

async fn service_updates(
    State(state): State<Arc<CtrlState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }

    let last = state.last_change.lock().clone();
    (StatusCode::OK, envelope(json!({ "lastChangeAt": last })))
}

async fn edge_routers(
    State(state): State<Arc<CtrlState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }

    (
        StatusCode::OK,
        envelope(json!([{
            "name": "er-test",
            "hostname": "127.0.0.1",
            "urls": { "tls": state.router_url },
        }])),
    )
}

async fn services(
    State(state): State<Arc<CtrlState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }

    let mut services = state.services.lock().clone();
    if let Some(filter) = params.get("filter") {
        // the SDK only ever sends name="..."
        let name = filter.split('"').nth(1).unwrap_or_default().to_string();
        services.retain(|svc| svc.name == name);
    }

    (
        StatusCode::OK,
        envelope(serde_json::to_value(services).unwrap()),
    )
}

async fn create_session(
    State(state): State<Arc<CtrlState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }

    // deliberate latency so concurrent dials pile onto one request
    sleep(Duration::from_millis(50)).await;
    state.sessions_posted.fetch_add(1, Ordering::Relaxed);

    let service_id = body["serviceId"].as_str().unwrap_or_default().to_string();
    let session_type = body["type"].as_str().unwrap_or("Dial").to_string();
    let name = state
        .services
        .lock()
        .iter()
        .find(|svc| svc.id == service_id)
        .map(|svc| svc.name.clone())
        .unwrap_or_default();

    (
        StatusCode::OK,
        envelope(json!({
            "id": format!("ns-{}-{}", name, session_type),
            "token": format!("ns:{}:{}", name, session_type),
            "type": session_type,
            "edgeRouters": [{
                "name": "er-test",
                "hostname": "127.0.0.1",
                "urls": { "tls": state.router_url },
            }],
        })),
    )
}

// ---------------------------------------------------------------------------
// harness

struct Fixture {
    router: FakeRouter,
    controller: FakeController,
    ctx: Context,
    events: tokio::sync::broadcast::Receiver<Event>,
}

fn default_services() -> Vec<Service> {
    vec![
        service("svc-echo", "echo", &["Dial"], false),
        service("svc-secure", "secure", &["Dial", "Bind"], true),
        service("svc-blackhole", "blackhole", &["Dial"], false),
    ]
}

async fn fixture_with(services: Vec<Service>, login_fail: bool) -> Result<Fixture> {
    let router = FakeRouter::spawn().await?;
    let controller = FakeController::spawn(&router.url, services).await?;
    controller.state.login_fail.store(login_fail, Ordering::Relaxed);

    let ctx = Context::init(Options {
        controller: Some(controller.url.clone()),
        refresh_interval: None,
        timeout: Duration::from_secs(3),
        latency_interval: Duration::from_secs(60),
        reconnect_initial: Duration::from_millis(100),
        reconnect_ceiling: Duration::from_secs(1),
        events: EventTypes::ALL,
        disabled: true,
        ..Options::default()
    })?;

    let events = ctx.subscribe();
    ctx.enable();

    Ok(Fixture {
        router,
        controller,
        ctx,
        events,
    })
}

async fn fixture() -> Result<Fixture> {
    fixture_with(default_services(), false).await
}

/// Waits for the next event matching the predicate, skipping others.
async fn wait_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    mut accept: F,
) -> Result<Event>
where
    F: FnMut(&Event) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await?;
            if accept(&event) {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    })
    .await?
}

async fn wait_catalog(fixture: &mut Fixture) -> Result<()> {
    wait_event(&mut fixture.events, |ev| {
        matches!(ev, Event::Service(sev) if !sev.added.is_empty())
    })
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// tests

#[tokio::test]
async fn login_loads_catalog_and_reports_status() -> Result<()> {
    let mut fx = fixture().await?;

    // the status transition comes first; catalog and fleet events land in
    // whatever order the controller answers
    let event = wait_event(&mut fx.events, |ev| matches!(ev, Event::Context(_))).await?;
    match event {
        Event::Context(ctx_event) => assert_eq!(ctx_event.status, Ok(())),
        _ => unreachable!(),
    }

    let mut saw_catalog = false;
    let mut saw_router = false;
    timeout(WAIT, async {
        while !(saw_catalog && saw_router) {
            match fx.events.recv().await? {
                Event::Service(sev) => {
                    let mut names: Vec<String> =
                        sev.added.iter().map(|s| s.name.clone()).collect();
                    names.sort_unstable();
                    assert_eq!(names, ["blackhole", "echo", "secure"]);
                    assert!(sev.changed.is_empty());
                    assert!(sev.removed.is_empty());
                    saw_catalog = true;
                }
                Event::Router(rev) if rev.status == RouterStatus::Connected => {
                    assert_eq!(rev.name, "er-test");
                    saw_router = true;
                }
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await??;

    Ok(())
}

#[tokio::test]
async fn rejected_login_emits_not_authorized_once() -> Result<()> {
    let mut fx = fixture_with(default_services(), true).await?;

    let event = wait_event(&mut fx.events, |ev| matches!(ev, Event::Context(_))).await?;
    match event {
        Event::Context(ctx_event) => {
            assert_eq!(ctx_event.status, Err(Error::NotAuthorized));
        }
        _ => unreachable!(),
    }

    // no retry timer was armed, so nothing further arrives
    let extra = timeout(Duration::from_millis(500), fx.events.recv()).await;
    assert!(extra.is_err(), "unexpected follow-up event: {:?}", extra);

    Ok(())
}

#[tokio::test]
async fn dial_echo_round_trip_in_order() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let conn = fx.ctx.dial("echo").await?;
    assert_eq!(conn.state(), ConnState::Connected);

    let mut expected = Vec::new();
    for i in 0..20 {
        let chunk = format!("chunk-{:02};", i);
        expected.extend_from_slice(chunk.as_bytes());
        conn.write(chunk.as_bytes()).await?;
    }

    let mut got = Vec::new();
    while got.len() < expected.len() {
        let chunk = timeout(WAIT, conn.recv()).await??.expect("eof before all data");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, expected);

    conn.close().await?;
    assert_eq!(conn.state(), ConnState::Closed);
    Ok(())
}

#[tokio::test]
async fn concurrent_dials_share_one_net_session() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let (a, b) = tokio::join!(fx.ctx.dial("echo"), fx.ctx.dial("echo"));
    let (a, b) = (a?, b?);

    assert_eq!(fx.controller.sessions_posted(), 1);
    assert_ne!(a.id(), b.id());

    a.write(b"one").await?;
    b.write(b"two").await?;
    assert_eq!(&timeout(WAIT, a.recv()).await??.unwrap()[..], b"one");
    assert_eq!(&timeout(WAIT, b.recv()).await??.unwrap()[..], b"two");

    Ok(())
}

#[tokio::test]
async fn removed_service_is_reported_and_session_evicted() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let conn = fx.ctx.dial("echo").await?;
    conn.close().await?;
    assert_eq!(fx.controller.sessions_posted(), 1);

    // drop the echo service from the catalog
    let remaining: Vec<Service> = default_services()
        .into_iter()
        .filter(|svc| svc.name != "echo")
        .collect();
    fx.controller.set_services(remaining, "v2");
    fx.ctx.refresh();

    let event = wait_event(&mut fx.events, |ev| {
        matches!(ev, Event::Service(sev) if !sev.removed.is_empty())
    })
    .await?;
    match event {
        Event::Service(sev) => {
            assert_eq!(sev.removed.len(), 1);
            assert_eq!(sev.removed[0].name, "echo");
        }
        _ => unreachable!(),
    }

    assert!(matches!(
        fx.ctx.dial("echo").await,
        Err(Error::ServiceUnavailable)
    ));

    // bring it back: the old net session must not be reused
    fx.controller.set_services(default_services(), "v3");
    fx.ctx.refresh();
    wait_catalog(&mut fx).await?;

    let conn = fx.ctx.dial("echo").await?;
    assert_eq!(fx.controller.sessions_posted(), 2);
    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn dial_times_out_when_router_ignores_connect() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let started = std::time::Instant::now();
    let result = fx.ctx.dial("blackhole").await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(2900));

    Ok(())
}

#[tokio::test]
async fn hosted_service_end_to_end_encrypted() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    // give the identity fetch a moment so caller id rides the dial
    sleep(Duration::from_millis(200)).await;

    let listener = fx.ctx.listen("secure").await?;
    assert_eq!(listener.state(), ConnState::Bound);

    let dialer_ctx = fx.ctx.clone();
    let dial_task = tokio::spawn(async move { dialer_ctx.dial("secure").await });

    let incoming = timeout(WAIT, listener.accept()).await?.expect("listener closed");
    assert_eq!(incoming.state(), ConnState::Accepting);
    assert_eq!(incoming.source_identity().as_deref(), Some("test-client"));
    incoming.accept().await?;

    let dialer = timeout(WAIT, dial_task).await???;
    assert_eq!(dialer.state(), ConnState::Connected);
    assert_eq!(incoming.state(), ConnState::Connected);

    dialer.write(b"ping over the overlay").await?;
    let got = timeout(WAIT, incoming.recv()).await??.unwrap();
    assert_eq!(&got[..], b"ping over the overlay");

    incoming.write(b"pong").await?;
    let got = timeout(WAIT, dialer.recv()).await??.unwrap();
    assert_eq!(&got[..], b"pong");

    // half-close in both directions
    dialer.close_write().await?;
    assert_eq!(dialer.state(), ConnState::CloseWrite);
    assert_eq!(timeout(WAIT, incoming.recv()).await??, None);

    incoming.close_write().await?;
    assert_eq!(timeout(WAIT, dialer.recv()).await??, None);

    // both FINs seen: the records wind down to Closed
    timeout(WAIT, async {
        while dialer.state() != ConnState::Closed || incoming.state() != ConnState::Closed {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn tampered_frame_kills_encrypted_connection() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let listener = fx.ctx.listen("secure").await?;
    let dialer_ctx = fx.ctx.clone();
    let dial_task = tokio::spawn(async move { dialer_ctx.dial("secure").await });

    let incoming = timeout(WAIT, listener.accept()).await?.expect("listener closed");
    incoming.accept().await?;
    let dialer = timeout(WAIT, dial_task).await???;

    dialer.write(b"intact").await?;
    assert_eq!(&timeout(WAIT, incoming.recv()).await??.unwrap()[..], b"intact");

    fx.router.state.corrupt_next.store(true, Ordering::Relaxed);
    dialer.write(b"mangled in flight").await?;

    let err = timeout(WAIT, incoming.recv()).await?;
    assert!(matches!(err, Err(Error::Crypto)));

    timeout(WAIT, async {
        while incoming.state() != ConnState::Closed {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    listener.close().await?;
    Ok(())
}

#[tokio::test]
async fn channel_reconnects_after_router_restart() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let conn = fx.ctx.dial("echo").await?;
    conn.write(b"before").await?;
    assert_eq!(&timeout(WAIT, conn.recv()).await??.unwrap()[..], b"before");

    fx.router.disconnect_all();

    // the dropped transport surfaces as ConnClosed on the live connection
    let err = timeout(WAIT, conn.recv()).await?;
    assert!(matches!(err, Err(Error::ConnClosed)));

    let event = wait_event(&mut fx.events, |ev| {
        matches!(ev, Event::Router(rev) if rev.status == RouterStatus::Disconnected)
    })
    .await?;
    drop(event);

    // backoff is 100ms in this fixture; the channel comes back on its own
    wait_event(&mut fx.events, |ev| {
        matches!(ev, Event::Router(rev) if rev.status == RouterStatus::Connected)
    })
    .await?;

    let conn = fx.ctx.dial("echo").await?;
    conn.write(b"after").await?;
    assert_eq!(&timeout(WAIT, conn.recv()).await??.unwrap()[..], b"after");

    Ok(())
}

#[tokio::test]
async fn disable_tears_everything_down() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    fx.ctx.disable();

    let event = wait_event(&mut fx.events, |ev| {
        matches!(ev, Event::Service(sev) if !sev.removed.is_empty())
    })
    .await?;
    match event {
        Event::Service(sev) => assert_eq!(sev.removed.len(), 3),
        _ => unreachable!(),
    }

    let event = wait_event(&mut fx.events, |ev| {
        matches!(ev, Event::Context(cev) if cev.status.is_err())
    })
    .await?;
    match event {
        Event::Context(cev) => assert_eq!(cev.status, Err(Error::Disabled)),
        _ => unreachable!(),
    }

    assert!(!fx.ctx.is_enabled());
    assert!(matches!(fx.ctx.dial("echo").await, Err(Error::Disabled)));

    Ok(())
}

#[tokio::test]
async fn service_available_uses_catalog_and_lookup() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let svc = fx.ctx.service_available("echo").await?;
    assert_eq!(svc.id, "svc-echo");
    assert!(svc.can_dial());

    assert!(matches!(
        fx.ctx.service_available("nonexistent").await,
        Err(Error::ServiceUnavailable)
    ));

    Ok(())
}

#[tokio::test]
async fn bridge_couples_connection_to_stream() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let conn = fx.ctx.dial("echo").await?;
    let (local, remote) = tokio::io::duplex(64 * 1024);

    let bridge_task = tokio::spawn(veil_sdk::bridge(conn, remote));

    let (mut read_half, mut write_half) = tokio::io::split(local);
    write_half.write_all(b"through the bridge").await?;

    let mut got = [0u8; 18];
    timeout(WAIT, read_half.read_exact(&mut got)).await??;
    assert_eq!(&got, b"through the bridge");

    // local EOF propagates: bridge half-closes, echo fins back, bridge ends
    write_half.shutdown().await?;
    let mut rest = Vec::new();
    timeout(WAIT, read_half.read_to_end(&mut rest)).await??;
    assert!(rest.is_empty());

    timeout(WAIT, bridge_task).await???;
    Ok(())
}

#[tokio::test]
async fn dump_reports_the_world() -> Result<()> {
    let mut fx = fixture().await?;
    wait_catalog(&mut fx).await?;

    let conn = fx.ctx.dial("echo").await?;
    let dump = fx.ctx.dump().await;

    assert!(dump.contains("echo"));
    assert!(dump.contains("er-test"));
    assert!(dump.contains(&format!("conn[{}]", conn.id())));

    conn.close().await?;
    Ok(())
}
