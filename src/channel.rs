//! Edge-router channels.
//!
//! A channel is one TLS (or plaintext, for lab setups) connection to one
//! edge router, multiplexing every logical connection that routes through
//! it. A driver task owns the socket: it runs the HELLO handshake, then
//! loops over outbound frames, inbound bytes, and the latency ticker.
//! Anything that goes wrong tears the transport down, synthesizes EOF to
//! every multiplexed connection, and schedules a reconnect with exponential
//! backoff while the context stays enabled.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};
use std::time::Duration;

use ahash::AHashMap;
use bytes::BytesMut;
use codec::{ContentType, Message, header};
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf, split},
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    time::{Instant, sleep, timeout},
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, pki_types::ServerName},
};
use url::Url;
use uuid::Uuid;

use crate::{
    Error,
    events::{Event, EventSink, RouterEvent, RouterStatus},
};

/// Messages delivered to a logical connection's receiver.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Msg(Message),
    /// The channel died underneath the connection.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initial,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

pub(crate) struct ChannelConfig {
    pub tls: Option<Arc<ClientConfig>>,
    /// Current API session token, refreshed by the control loop.
    pub session_token: Arc<RwLock<Option<String>>>,
    pub enabled: watch::Receiver<bool>,
    pub events: EventSink,
    pub connect_timeout: Duration,
    pub latency_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_ceiling: Duration,
}

enum Outbound {
    Send {
        msg: Message,
    },
    SendAwait {
        msg: Message,
        ack: oneshot::Sender<Result<(), Error>>,
    },
    SendForReply {
        msg: Message,
        reply: oneshot::Sender<Result<Message, Error>>,
        deadline: Instant,
    },
}

struct ChannelInner {
    name: String,
    url: String,
    host: String,
    port: u16,
    id: u32,
    token: Uuid,
    state: watch::Sender<ChannelState>,
    /// Smoothed probe round-trip in milliseconds; `u64::MAX` until measured.
    latency: AtomicU64,
    reconnects: AtomicU32,
    msg_seq: AtomicU32,
    version: Mutex<Option<String>>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
    receivers: Mutex<AHashMap<u32, mpsc::UnboundedSender<ConnEvent>>>,
}

#[derive(Clone)]
pub(crate) struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Spawns the driver for one edge router.
    pub fn connect(id: u32, name: &str, url: &str, config: ChannelConfig) -> Result<Self, Error> {
        let parsed = Url::parse(url).map_err(|_| Error::InvalidConfig)?;
        let scheme = parsed.scheme().to_string();
        if scheme != "tls" && scheme != "tcp" {
            return Err(Error::InvalidConfig);
        }
        if scheme == "tls" && config.tls.is_none() {
            return Err(Error::InvalidConfig);
        }

        let host = parsed.host_str().ok_or(Error::InvalidConfig)?.to_string();
        let port = parsed.port().unwrap_or(443);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            name: name.to_string(),
            url: url.to_string(),
            host,
            port,
            id,
            token: Uuid::new_v4(),
            state: watch::channel(ChannelState::Initial).0,
            latency: AtomicU64::new(u64::MAX),
            reconnects: AtomicU32::new(0),
            msg_seq: AtomicU32::new(0),
            version: Mutex::new(None),
            out_tx,
            closed: watch::channel(false).0,
            receivers: Mutex::new(AHashMap::new()),
        });

        tokio::spawn(drive(inner.clone(), scheme, config, out_rx));
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn token(&self) -> Uuid {
        self.inner.token
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn latency(&self) -> Option<u64> {
        match self.inner.latency.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(ms),
        }
    }

    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> Option<String> {
        self.inner.version.lock().clone()
    }

    /// Waits until the channel reaches `Connected`, or fails fast when it
    /// closes for good.
    pub async fn wait_connected(&self, deadline: Duration) -> Result<(), Error> {
        let mut state = self.inner.state.subscribe();

        let wait = async {
            loop {
                match *state.borrow_and_update() {
                    ChannelState::Connected => return Ok(()),
                    ChannelState::Closed => return Err(Error::GatewayUnavailable),
                    _ => {}
                }

                if state.changed().await.is_err() {
                    return Err(Error::GatewayUnavailable);
                }
            }
        };

        timeout(deadline, wait).await.map_err(|_| Error::Timeout)?
    }

    pub fn send(&self, msg: Message) -> Result<(), Error> {
        self.inner
            .out_tx
            .send(Outbound::Send { msg })
            .map_err(|_| Error::ConnClosed)
    }

    /// Writes a frame and waits for it to reach the transport.
    pub async fn send_await(&self, msg: Message) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.inner
            .out_tx
            .send(Outbound::SendAwait { msg, ack })
            .map_err(|_| Error::ConnClosed)?;

        done.await.map_err(|_| Error::ConnClosed)?
    }

    /// Writes a frame and waits for the frame that replies to it.
    ///
    /// Completes exactly once: with the reply, with `Timeout` at the
    /// deadline, or with `ConnClosed` when the channel dies first.
    pub async fn send_for_reply(&self, msg: Message, deadline: Duration) -> Result<Message, Error> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .out_tx
            .send(Outbound::SendForReply {
                msg,
                reply,
                deadline: Instant::now() + deadline,
            })
            .map_err(|_| Error::ConnClosed)?;

        match timeout(deadline, rx).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::ConnClosed),
            Ok(Ok(result)) => result,
        }
    }

    pub fn register_receiver(&self, conn_id: u32) -> mpsc::UnboundedReceiver<ConnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.receivers.lock().insert(conn_id, tx);
        rx
    }

    pub fn remove_receiver(&self, conn_id: u32) {
        self.inner.receivers.lock().remove(&conn_id);
    }

    /// Permanently closes the channel.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }
}

enum Reader {
    Tls(ReadHalf<TlsStream<TcpStream>>),
    Tcp(ReadHalf<TcpStream>),
}

impl Reader {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Self::Tls(it) => it.read_buf(buf).await,
            Self::Tcp(it) => it.read_buf(buf).await,
        }
    }
}

enum Writer {
    Tls(WriteHalf<TlsStream<TcpStream>>),
    Tcp(WriteHalf<TcpStream>),
}

impl Writer {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tls(it) => {
                it.write_all(buf).await?;
                it.flush().await
            }
            Self::Tcp(it) => it.write_all(buf).await,
        }
    }
}

async fn connect_transport(
    scheme: &str,
    inner: &ChannelInner,
    config: &ChannelConfig,
) -> Result<(Reader, Writer), Error> {
    let tcp = TcpStream::connect((inner.host.as_str(), inner.port))
        .await
        .map_err(|_| Error::GatewayUnavailable)?;

    if scheme == "tcp" {
        let (rx, tx) = split(tcp);
        return Ok((Reader::Tcp(rx), Writer::Tcp(tx)));
    }

    let tls = config.tls.clone().ok_or(Error::InvalidConfig)?;
    let server = ServerName::try_from(inner.host.clone()).map_err(|_| Error::InvalidConfig)?;
    let stream = TlsConnector::from(tls)
        .connect(server, tcp)
        .await
        .map_err(|_| Error::GatewayUnavailable)?;

    let (rx, tx) = split(stream);
    Ok((Reader::Tls(rx), Writer::Tls(tx)))
}

/// Why one transport attempt ended.
enum Ended {
    /// Explicit close or disable; no reconnect.
    Closed,
    /// Transport-level loss; reconnect if still enabled.
    Lost,
}

impl ChannelInner {
    fn set_state(&self, state: ChannelState) {
        if *self.state.borrow() != state {
            log::debug!("ch[{}]({}) -> {:?}", self.id, self.name, state);
            self.state.send_replace(state);
        }
    }

    fn next_seq(&self) -> u32 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Synthetic EOF to every multiplexed connection.
    fn flush_receivers(&self) {
        for (_, tx) in self.receivers.lock().drain() {
            let _ = tx.send(ConnEvent::Eof);
        }
    }
}

async fn drive(
    inner: Arc<ChannelInner>,
    scheme: String,
    mut config: ChannelConfig,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut closed = inner.closed.subscribe();
    let mut backoff = config.reconnect_initial;

    loop {
        if *closed.borrow() || !*config.enabled.borrow() {
            break;
        }

        inner.set_state(ChannelState::Connecting);
        let ended = run_transport(&inner, &scheme, &mut config, &mut out_rx, &mut closed).await;

        inner.set_state(ChannelState::Disconnected);
        inner.flush_receivers();
        drain_queue(&mut out_rx);

        config.events.emit(Event::Router(RouterEvent {
            name: inner.name.clone(),
            address: inner.url.clone(),
            version: inner.version.lock().clone(),
            status: RouterStatus::Disconnected,
        }));

        match ended {
            Ended::Closed => break,
            Ended::Lost => {
                if *closed.borrow() || !*config.enabled.borrow() {
                    break;
                }

                let count = inner.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                let delay = jitter(backoff);
                log::info!(
                    "ch[{}]({}) reconnect #{} in {:?}",
                    inner.id,
                    inner.name,
                    count,
                    delay
                );

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = closed.changed() => {}
                }

                backoff = (backoff * 2).min(config.reconnect_ceiling);
            }
        }
    }

    inner.set_state(ChannelState::Closed);
    inner.flush_receivers();
    drain_queue(&mut out_rx);
}

/// ±12.5% so a router restart does not get a thundering herd.
fn jitter(base: Duration) -> Duration {
    let base = base.as_millis() as u64;
    let spread = (base / 4).max(1);
    Duration::from_millis(base - base / 8 + rand::random::<u64>() % spread)
}

fn drain_queue(out_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    while let Ok(out) = out_rx.try_recv() {
        match out {
            Outbound::Send { .. } => {}
            Outbound::SendAwait { ack, .. } => {
                let _ = ack.send(Err(Error::ConnClosed));
            }
            Outbound::SendForReply { reply, .. } => {
                let _ = reply.send(Err(Error::ConnClosed));
            }
        }
    }
}

/// One connect / handshake / pump cycle.
async fn run_transport(
    inner: &Arc<ChannelInner>,
    scheme: &str,
    config: &mut ChannelConfig,
    out_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    closed: &mut watch::Receiver<bool>,
) -> Ended {
    let (mut reader, mut writer) =
        match timeout(config.connect_timeout, connect_transport(scheme, inner, config)).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(err)) => {
                log::warn!("ch[{}]({}) connect failed: {}", inner.id, inner.name, err);
                return Ended::Lost;
            }
            Err(_) => {
                log::warn!("ch[{}]({}) connect timed out", inner.id, inner.name);
                return Ended::Lost;
            }
        };

    let mut accum = BytesMut::with_capacity(codec::MAX_MESSAGE_SIZE);
    match hello(inner, config, &mut reader, &mut writer, &mut accum).await {
        Ok(()) => {}
        Err(err) => {
            log::warn!("ch[{}]({}) hello failed: {}", inner.id, inner.name, err);
            return Ended::Lost;
        }
    }

    inner.reconnects.store(0, Ordering::Relaxed);
    inner.set_state(ChannelState::Connected);
    config.events.emit(Event::Router(RouterEvent {
        name: inner.name.clone(),
        address: inner.url.clone(),
        version: inner.version.lock().clone(),
        status: RouterStatus::Connected,
    }));

    let mut waiters: AHashMap<u32, (oneshot::Sender<Result<Message, Error>>, Instant)> =
        AHashMap::new();
    let mut probes: AHashMap<u32, Instant> = AHashMap::new();
    let mut ticker = tokio::time::interval(config.latency_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();

    // frames that rode in on the same read as the hello reply
    if dispatch_frames(inner, &mut accum, &mut waiters, &mut probes, &mut writer)
        .await
        .is_err()
    {
        return Ended::Lost;
    }

    let ended = loop {
        tokio::select! {
            out = out_rx.recv() => {
                let Some(out) = out else { break Ended::Closed };

                let (mut msg, ack, reply) = match out {
                    Outbound::Send { msg } => (msg, None, None),
                    Outbound::SendAwait { msg, ack } => (msg, Some(ack), None),
                    Outbound::SendForReply { msg, reply, deadline } => {
                        (msg, None, Some((reply, deadline)))
                    }
                };

                msg.seq = inner.next_seq();
                if let Some((reply, deadline)) = reply {
                    waiters.insert(msg.seq, (reply, deadline));
                }

                let mut buf = BytesMut::new();
                let written = match msg.encode(&mut buf) {
                    Ok(()) => writer.write_all(&buf).await.is_ok(),
                    Err(err) => {
                        log::error!("ch[{}] encode failed: {}", inner.id, err);
                        false
                    }
                };

                if let Some(ack) = ack {
                    let _ = ack.send(if written { Ok(()) } else { Err(Error::ConnClosed) });
                }
                if !written {
                    break Ended::Lost;
                }
            }

            read = reader.read_buf(&mut accum) => {
                match read {
                    Ok(0) | Err(_) => break Ended::Lost,
                    Ok(_) => {}
                }

                match dispatch_frames(inner, &mut accum, &mut waiters, &mut probes, &mut writer).await {
                    Ok(()) => {}
                    Err(err) => {
                        log::warn!("ch[{}]({}) protocol error: {}", inner.id, inner.name, err);
                        break Ended::Lost;
                    }
                }
            }

            _ = ticker.tick() => {
                let now = Instant::now();
                let expired: Vec<u32> = waiters
                    .iter()
                    .filter(|(_, (tx, deadline))| *deadline <= now || tx.is_closed())
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in expired {
                    if let Some((tx, _)) = waiters.remove(&seq) {
                        let _ = tx.send(Err(Error::Timeout));
                    }
                }

                // two unanswered probes in a row and the router is presumed
                // gone even if TCP has not noticed
                if probes.len() >= 2 {
                    log::warn!("ch[{}]({}) latency probes unanswered", inner.id, inner.name);
                    break Ended::Lost;
                }

                let mut probe = Message::new(ContentType::Latency);
                probe.seq = inner.next_seq();
                probes.insert(probe.seq, now);

                let mut buf = BytesMut::new();
                let ok = probe.encode(&mut buf).is_ok() && writer.write_all(&buf).await.is_ok();
                if !ok {
                    break Ended::Lost;
                }
            }

            changed = config.enabled.changed() => {
                // a dropped sender means the context is gone
                if changed.is_err() || !*config.enabled.borrow() {
                    break Ended::Closed;
                }
            }

            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break Ended::Closed;
                }
            }
        }
    };

    for (_, (tx, _)) in waiters.drain() {
        let _ = tx.send(Err(Error::ConnClosed));
    }

    ended
}

async fn hello(
    inner: &Arc<ChannelInner>,
    config: &ChannelConfig,
    reader: &mut Reader,
    writer: &mut Writer,
    accum: &mut BytesMut,
) -> Result<(), Error> {
    let mut msg = Message::new(ContentType::Hello)
        .with_header(header::CALLER_ID, format!("veil-sdk-rs/{}", env!("CARGO_PKG_VERSION")))
        .with_body(inner.token.to_string());

    if let Some(token) = config.session_token.read().clone() {
        msg = msg.with_header(header::SESSION_TOKEN, token);
    }

    msg.seq = inner.next_seq();
    let hello_seq = msg.seq;

    let mut buf = BytesMut::new();
    msg.encode(&mut buf)?;
    writer
        .write_all(&buf)
        .await
        .map_err(|_| Error::GatewayUnavailable)?;

    let wait_reply = async {
        loop {
            if reader.read_buf(accum).await.unwrap_or(0) == 0 {
                return Err(Error::GatewayUnavailable);
            }

            while let Some(size) = Message::message_size(accum).map_err(|_| Error::Wtf)? {
                if accum.len() < size {
                    break;
                }

                let frame = accum.split_to(size);
                let msg = Message::decode(&frame).map_err(|_| Error::Wtf)?;
                if msg.content == ContentType::HelloReply && msg.reply_for() == Some(hello_seq) {
                    return Ok(msg);
                }

                log::trace!("ch[{}] dropping pre-hello frame {:?}", inner.id, msg.content);
            }
        }
    };

    let reply = timeout(config.connect_timeout, wait_reply)
        .await
        .map_err(|_| Error::Timeout)??;

    if !reply.is_success() {
        return Err(Error::GatewayUnavailable);
    }

    *inner.version.lock() = reply.str_header(header::ROUTER_INFO).map(str::to_string);
    Ok(())
}

async fn dispatch_frames(
    inner: &Arc<ChannelInner>,
    accum: &mut BytesMut,
    waiters: &mut AHashMap<u32, (oneshot::Sender<Result<Message, Error>>, Instant)>,
    probes: &mut AHashMap<u32, Instant>,
    writer: &mut Writer,
) -> Result<(), codec::Error> {
    while let Some(size) = Message::message_size(accum)? {
        if accum.len() < size {
            break;
        }

        let frame = accum.split_to(size);
        let msg = Message::decode(&frame)?;

        if let Some(reply_for) = msg.reply_for() {
            if let Some(sent) = probes.remove(&reply_for) {
                let ms = sent.elapsed().as_millis() as u64;
                inner.latency.store(ms, Ordering::Relaxed);
                log::trace!("ch[{}]({}) latency {}ms", inner.id, inner.name, ms);
                continue;
            }

            if let Some((tx, _)) = waiters.remove(&reply_for) {
                let _ = tx.send(Ok(msg));
            } else if let Some(conn_id) = msg.conn_id() {
                deliver(inner, conn_id, msg);
            } else {
                log::trace!("ch[{}] reply for unknown seq {}", inner.id, reply_for);
            }
            continue;
        }

        if msg.content == ContentType::Ping {
            let mut pong = Message::new(ContentType::PingReply).with_u32(header::REPLY_FOR, msg.seq);
            pong.seq = inner.next_seq();

            let mut buf = BytesMut::new();
            pong.encode(&mut buf)?;
            if writer.write_all(&buf).await.is_err() {
                return Err(codec::Error::InvalidInput);
            }
            continue;
        }

        match msg.conn_id() {
            Some(conn_id) => deliver(inner, conn_id, msg),
            None => log::debug!(
                "ch[{}]({}) unexpected channel frame {:?}",
                inner.id,
                inner.name,
                msg.content
            ),
        }
    }

    Ok(())
}

fn deliver(inner: &ChannelInner, conn_id: u32, msg: Message) {
    let mut receivers = inner.receivers.lock();
    if let Some(tx) = receivers.get(&conn_id) {
        if tx.send(ConnEvent::Msg(msg)).is_err() {
            receivers.remove(&conn_id);
        }
    } else {
        log::trace!("ch[{}] no receiver for conn[{}]", inner.id, conn_id);
    }
}
