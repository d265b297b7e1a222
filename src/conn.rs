//! Logical connections.
//!
//! A connection is one bidirectional byte stream multiplexed onto an
//! edge-router channel. Dialed connections go `Initial → Connecting →
//! Connected`; hosted ones go `Initial → Binding → Bound`, and every inbound
//! dial on a bound listener produces a child in `Accepting` that the
//! application accepts or rejects. Writes carry a per-connection sequence;
//! half-close travels as an empty DATA frame flagged FIN. When the service
//! requires encryption, frame bodies are sealed by the secret stream set up
//! during the connect handshake.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};
use std::time::Duration;

use bytes::Bytes;
use codec::{ContentType, Message, header};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::{
    Error,
    channel::{Channel, ConnEvent},
    crypto::{KeyExchange, Role, SecretStreamRx, SecretStreamTx},
    metrics::Rates,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Initial,
    Connecting,
    Connected,
    Binding,
    Bound,
    Accepting,
    Timedout,
    CloseWrite,
    Disconnected,
    Closed,
}

/// Options for hosting a service.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Terminator identity offered to the fabric, when distinct from the
    /// identity's own name.
    pub terminator_identity: Option<String>,
    pub cost: Option<u32>,
    pub precedence: Option<u32>,
}

struct StateCell {
    state: ConnState,
    fin_sent: bool,
    fin_recv: bool,
    source_identity: Option<String>,
}

/// Handshake leftovers a child connection needs when the app accepts it.
struct AcceptInfo {
    dial_seq: u32,
    peer_pk: Option<Bytes>,
}

enum RxState {
    AwaitHeader([u8; 32]),
    Ready(SecretStreamRx),
}

pub(crate) struct ConnShared {
    id: u32,
    service: String,
    channel: Channel,
    encrypted: bool,
    state: Mutex<StateCell>,
    edge_seq: AtomicU32,
    writes: AtomicUsize,
    writes_drained: Notify,
    crypto_tx: Mutex<Option<SecretStreamTx>>,
    /// Serializes writes so sealed frames hit the wire in nonce order.
    write_gate: tokio::sync::Mutex<()>,
    accept: Mutex<Option<AcceptInfo>>,
    /// Holds the inbound sender until the pump takes ownership of it.
    pending_data_tx: Mutex<Option<DataSender>>,
    rates: Rates,
}

impl ConnShared {
    fn set_state(&self, state: ConnState) {
        let mut cell = self.state.lock();
        if cell.state != state && cell.state != ConnState::Closed {
            log::debug!("conn[{}] {:?} -> {:?}", self.id, cell.state, state);
            cell.state = state;
        }
    }

    fn next_edge_seq(&self) -> u32 {
        self.edge_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Application handle for one logical connection. Cheap to clone; reads are
/// serialized across clones.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
    data_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes, Error>>>>,
}

type DataSender = mpsc::UnboundedSender<Result<Bytes, Error>>;

fn new_connection(
    id: u32,
    service: &str,
    channel: Channel,
    encrypted: bool,
    rates: Rates,
) -> Connection {
    let (data_tx, data_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(ConnShared {
        id,
        service: service.to_string(),
        channel,
        encrypted,
        state: Mutex::new(StateCell {
            state: ConnState::Initial,
            fin_sent: false,
            fin_recv: false,
            source_identity: None,
        }),
        edge_seq: AtomicU32::new(0),
        writes: AtomicUsize::new(0),
        writes_drained: Notify::new(),
        crypto_tx: Mutex::new(None),
        write_gate: tokio::sync::Mutex::new(()),
        accept: Mutex::new(None),
        pending_data_tx: Mutex::new(Some(data_tx)),
        rates,
    });

    Connection {
        shared,
        data_rx: Arc::new(tokio::sync::Mutex::new(data_rx)),
    }
}

impl Connection {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    pub fn state(&self) -> ConnState {
        self.shared.state.lock().state
    }

    /// Identity name of the dialing peer, for accepted connections whose
    /// dialer announced one.
    pub fn source_identity(&self) -> Option<String> {
        self.shared.state.lock().source_identity.clone()
    }

    /// Reads the next chunk of inbound payload.
    ///
    /// `Ok(None)` is EOF: the peer half-closed or closed. Errors are
    /// terminal; `Error::Crypto` means a frame failed authentication and the
    /// connection is gone.
    pub async fn recv(&self) -> Result<Option<Bytes>, Error> {
        let mut rx = self.data_rx.lock().await;
        match rx.recv().await {
            None => Ok(None),
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(err)) => Err(err),
        }
    }

    /// Writes one chunk of payload, in call order, waiting until the frame
    /// reaches the transport.
    pub async fn write(&self, data: &[u8]) -> Result<(), Error> {
        let _gate = self.shared.write_gate.lock().await;

        {
            let cell = self.shared.state.lock();
            if cell.state != ConnState::Connected || cell.fin_sent {
                return Err(Error::InvalidState);
            }
        }

        let payload: Vec<u8> = if self.shared.encrypted {
            let mut guard = self.shared.crypto_tx.lock();
            guard
                .as_mut()
                .ok_or(Error::InvalidState)?
                .seal(data)?
        } else {
            data.to_vec()
        };

        let msg = Message::new(ContentType::Data)
            .with_u32(header::CONN_ID, self.shared.id)
            .with_u32(header::SEQ, self.shared.next_edge_seq())
            .with_body(payload);

        self.shared.writes.fetch_add(1, Ordering::AcqRel);
        let result = self.shared.channel.send_await(msg).await;
        if self.shared.writes.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.writes_drained.notify_waiters();
        }

        if result.is_ok() {
            self.shared.rates.up.add(data.len());
        }
        result
    }

    /// Half-close: tells the peer no further data will be written. Reads
    /// stay open until the peer finishes.
    pub async fn close_write(&self) -> Result<(), Error> {
        let _gate = self.shared.write_gate.lock().await;

        let fin_recv = {
            let mut cell = self.shared.state.lock();
            if cell.fin_sent {
                return Ok(());
            }
            if cell.state != ConnState::Connected {
                return Err(Error::InvalidState);
            }

            cell.fin_sent = true;
            cell.fin_recv
        };

        let msg = Message::new(ContentType::Data)
            .with_u32(header::CONN_ID, self.shared.id)
            .with_u32(header::SEQ, self.shared.next_edge_seq())
            .with_flag(header::FIN, true);
        self.shared.channel.send_await(msg).await?;

        if fin_recv {
            // both directions done; nothing further can arrive
            self.shared.set_state(ConnState::Closed);
            self.shared.channel.remove_receiver(self.shared.id);
        } else {
            self.shared.set_state(ConnState::CloseWrite);
        }

        Ok(())
    }

    /// Full close. Outstanding writes drain first; the record becomes
    /// reap-eligible once this returns.
    pub async fn close(&self) -> Result<(), Error> {
        if self.state() == ConnState::Closed {
            return Ok(());
        }

        loop {
            let drained = self.shared.writes_drained.notified();
            if self.shared.writes.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }

        let msg = Message::new(ContentType::StateClosed).with_u32(header::CONN_ID, self.shared.id);
        let _ = self.shared.channel.send(msg);

        self.shared.set_state(ConnState::Closed);
        self.shared.channel.remove_receiver(self.shared.id);
        Ok(())
    }

    /// Completes the handshake of a connection sitting in `Accepting`.
    pub async fn accept(&self) -> Result<(), Error> {
        let info = self.shared.accept.lock().take().ok_or(Error::InvalidState)?;

        let rx = self.shared.channel.register_receiver(self.shared.id);

        let mut reply = Message::new(ContentType::StateConnected)
            .with_u32(header::REPLY_FOR, info.dial_seq)
            .with_u32(header::CONN_ID, self.shared.id)
            .with_flag(header::RESULT_SUCCESS, true);

        let mut crypto_rx = None;
        let mut stream_header = None;
        if self.shared.encrypted {
            let peer: [u8; 32] = info
                .peer_pk
                .as_deref()
                .and_then(|it| it.try_into().ok())
                .ok_or(Error::Crypto)?;

            let kx = KeyExchange::new();
            reply = reply.with_header(header::PUBLIC_KEY, kx.public_key().to_vec());

            let keys = kx.derive(&peer, Role::Responder)?;
            let (tx_stream, header_bytes) = SecretStreamTx::new(&keys.tx);
            *self.shared.crypto_tx.lock() = Some(tx_stream);
            crypto_rx = Some(RxState::AwaitHeader(keys.rx));
            stream_header = Some(header_bytes);
        }

        self.shared.channel.send_await(reply).await?;

        if let Some(header_bytes) = stream_header {
            let msg = Message::new(ContentType::Data)
                .with_u32(header::CONN_ID, self.shared.id)
                .with_u32(header::SEQ, self.shared.next_edge_seq())
                .with_body(header_bytes.to_vec());
            self.shared.channel.send_await(msg).await?;
        }

        let data_tx = self
            .shared
            .pending_data_tx
            .lock()
            .take()
            .ok_or(Error::InvalidState)?;

        self.shared.set_state(ConnState::Connected);
        spawn_pump(self.shared.clone(), rx, data_tx, crypto_rx);
        Ok(())
    }

    /// Declines a connection sitting in `Accepting`.
    pub async fn reject(&self) -> Result<(), Error> {
        let info = self.shared.accept.lock().take().ok_or(Error::InvalidState)?;

        let reply = Message::new(ContentType::DialFailed)
            .with_u32(header::REPLY_FOR, info.dial_seq)
            .with_u32(header::CONN_ID, self.shared.id)
            .with_flag(header::RESULT_SUCCESS, false);
        let _ = self.shared.channel.send(reply);

        self.shared.set_state(ConnState::Closed);
        Ok(())
    }

}

/// Everything a connection needs at creation.
pub(crate) struct ConnSetup {
    pub id: u32,
    pub channel: Channel,
    pub service: String,
    pub encrypted: bool,
    pub rates: Rates,
    /// Context-wide live-connection registry, for the reaper and `dump`.
    pub conns: Arc<Mutex<Vec<Connection>>>,
}

/// Dials a service over an established channel.
pub(crate) async fn dial(
    setup: ConnSetup,
    net_token: &str,
    caller_id: Option<&str>,
    deadline: Duration,
) -> Result<Connection, Error> {
    let registry = setup.conns.clone();
    let conn = new_connection(
        setup.id,
        &setup.service,
        setup.channel,
        setup.encrypted,
        setup.rates,
    );
    let shared = conn.shared.clone();
    registry.lock().push(conn.clone());

    shared.set_state(ConnState::Connecting);
    let rx = shared.channel.register_receiver(shared.id);

    let kx = shared.encrypted.then(KeyExchange::new);
    let mut msg = Message::new(ContentType::Connect)
        .with_u32(header::CONN_ID, shared.id)
        .with_body(net_token.as_bytes().to_vec());
    if let Some(kx) = &kx {
        msg = msg.with_header(header::PUBLIC_KEY, kx.public_key().to_vec());
    }
    if let Some(caller_id) = caller_id {
        msg = msg.with_header(header::CALLER_ID, caller_id.as_bytes().to_vec());
    }

    let reply = match shared.channel.send_for_reply(msg, deadline).await {
        Ok(reply) => reply,
        Err(err) => {
            shared.set_state(if err == Error::Timeout {
                ConnState::Timedout
            } else {
                ConnState::Closed
            });
            shared.channel.remove_receiver(shared.id);
            return Err(err);
        }
    };

    if reply.content != ContentType::StateConnected || !reply.is_success() {
        log::debug!(
            "conn[{}] dial refused: {:?}",
            shared.id,
            reply.str_header(header::ROUTER_INFO).unwrap_or("")
        );
        shared.set_state(ConnState::Closed);
        shared.channel.remove_receiver(shared.id);
        return Err(Error::ConnClosed);
    }

    let mut crypto_rx = None;
    if let Some(kx) = kx {
        match dial_crypto(&shared, kx, &reply).await {
            Ok(state) => crypto_rx = Some(state),
            Err(err) => {
                shared.set_state(ConnState::Closed);
                shared.channel.remove_receiver(shared.id);
                return Err(err);
            }
        }
    }

    let data_tx = shared
        .pending_data_tx
        .lock()
        .take()
        .ok_or(Error::InvalidState)?;

    shared.set_state(ConnState::Connected);
    spawn_pump(shared, rx, data_tx, crypto_rx);
    Ok(conn)
}

/// Finishes the dialing side of the key exchange: derives directional keys
/// from the reply's public key and ships our stream header as the first
/// payload frame.
async fn dial_crypto(
    shared: &Arc<ConnShared>,
    kx: KeyExchange,
    reply: &Message,
) -> Result<RxState, Error> {
    let peer: [u8; 32] = reply
        .header(header::PUBLIC_KEY)
        .and_then(|it| it.try_into().ok())
        .ok_or(Error::Crypto)?;

    let keys = kx.derive(&peer, Role::Initiator)?;
    let (tx_stream, header_bytes) = SecretStreamTx::new(&keys.tx);
    *shared.crypto_tx.lock() = Some(tx_stream);

    let msg = Message::new(ContentType::Data)
        .with_u32(header::CONN_ID, shared.id)
        .with_u32(header::SEQ, shared.next_edge_seq())
        .with_body(header_bytes.to_vec());
    shared.channel.send_await(msg).await?;

    Ok(RxState::AwaitHeader(keys.rx))
}

/// Hosted side of a service: accepted children arrive through here.
pub struct Listener {
    conn: Connection,
    incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>>,
}

impl Listener {
    /// Waits for the next inbound dial. The returned connection is in
    /// `Accepting` until the application accepts or rejects it. `None`
    /// means the listener is done (unbound or channel loss).
    pub async fn accept(&self) -> Option<Connection> {
        self.incoming.lock().await.recv().await
    }

    pub fn service(&self) -> &str {
        self.conn.service()
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    /// Unbinds from the fabric and closes the hosting connection.
    pub async fn close(&self) -> Result<(), Error> {
        let shared = &self.conn.shared;
        let msg = Message::new(ContentType::Unbind).with_u32(header::CONN_ID, shared.id);
        let _ = shared.channel.send(msg);

        shared.set_state(ConnState::Closed);
        shared.channel.remove_receiver(shared.id);
        Ok(())
    }
}

/// Binds a service and starts dispatching inbound dials.
pub(crate) async fn bind(
    setup: ConnSetup,
    net_token: &str,
    opts: &ListenOptions,
    deadline: Duration,
    conn_seq: Arc<AtomicU32>,
) -> Result<Listener, Error> {
    let registry = setup.conns.clone();
    let conn = new_connection(
        setup.id,
        &setup.service,
        setup.channel,
        setup.encrypted,
        setup.rates.clone(),
    );
    let shared = conn.shared.clone();
    registry.lock().push(conn.clone());

    // a listener carries no payload of its own
    shared.pending_data_tx.lock().take();

    shared.set_state(ConnState::Binding);
    let rx = shared.channel.register_receiver(shared.id);

    let mut msg = Message::new(ContentType::Bind)
        .with_u32(header::CONN_ID, shared.id)
        .with_body(net_token.as_bytes().to_vec());
    if let Some(identity) = &opts.terminator_identity {
        msg = msg.with_header(header::TERMINATOR_IDENTITY, identity.as_bytes().to_vec());
    }
    if let Some(cost) = opts.cost {
        msg = msg.with_u32(header::COST, cost);
    }
    if let Some(precedence) = opts.precedence {
        msg = msg.with_u32(header::PRECEDENCE, precedence);
    }

    let reply = match shared.channel.send_for_reply(msg, deadline).await {
        Ok(reply) => reply,
        Err(err) => {
            shared.set_state(if err == Error::Timeout {
                ConnState::Timedout
            } else {
                ConnState::Closed
            });
            shared.channel.remove_receiver(shared.id);
            return Err(err);
        }
    };

    if !reply.is_success() {
        shared.set_state(ConnState::Closed);
        shared.channel.remove_receiver(shared.id);
        return Err(Error::ServiceUnavailable);
    }

    shared.set_state(ConnState::Bound);

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    tokio::spawn(listen_pump(
        shared.clone(),
        rx,
        incoming_tx,
        setup.rates,
        conn_seq,
        registry,
    ));

    Ok(Listener {
        conn,
        incoming: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
    })
}

/// Consumes frames addressed to a bound listener: every DIAL becomes a
/// child connection in `Accepting`.
async fn listen_pump(
    shared: Arc<ConnShared>,
    mut rx: mpsc::UnboundedReceiver<ConnEvent>,
    incoming: mpsc::UnboundedSender<Connection>,
    rates: Rates,
    conn_seq: Arc<AtomicU32>,
    registry: Arc<Mutex<Vec<Connection>>>,
) {
    while let Some(event) = rx.recv().await {
        let msg = match event {
            ConnEvent::Msg(msg) => msg,
            ConnEvent::Eof => break,
        };

        match msg.content {
            ContentType::Dial => {
                let child_id = conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let peer_pk = msg
                    .header(header::PUBLIC_KEY)
                    .map(Bytes::copy_from_slice);

                let child = new_connection(
                    child_id,
                    &shared.service,
                    shared.channel.clone(),
                    shared.encrypted && peer_pk.is_some(),
                    rates.clone(),
                );

                {
                    let mut cell = child.shared.state.lock();
                    cell.state = ConnState::Accepting;
                    cell.source_identity =
                        msg.str_header(header::CALLER_ID).map(str::to_string);
                }
                *child.shared.accept.lock() = Some(AcceptInfo {
                    dial_seq: msg.seq,
                    peer_pk,
                });

                log::debug!(
                    "conn[{}] inbound dial -> child conn[{}]",
                    shared.id,
                    child_id
                );
                registry.lock().push(child.clone());
                if incoming.send(child).is_err() {
                    break;
                }
            }
            ContentType::StateClosed => break,
            other => log::trace!("listener conn[{}] ignoring {:?}", shared.id, other),
        }
    }

    shared.set_state(ConnState::Closed);
    shared.channel.remove_receiver(shared.id);
}

fn spawn_pump(
    shared: Arc<ConnShared>,
    rx: mpsc::UnboundedReceiver<ConnEvent>,
    data_tx: DataSender,
    crypto_rx: Option<RxState>,
) {
    tokio::spawn(pump(shared, rx, data_tx, crypto_rx));
}

/// Consumes inbound frames for one established connection.
async fn pump(
    shared: Arc<ConnShared>,
    mut rx: mpsc::UnboundedReceiver<ConnEvent>,
    data_tx: DataSender,
    mut crypto: Option<RxState>,
) {
    let mut data_tx = Some(data_tx);

    while let Some(event) = rx.recv().await {
        let msg = match event {
            ConnEvent::Msg(msg) => msg,
            ConnEvent::Eof => {
                if let Some(tx) = data_tx.take() {
                    let _ = tx.send(Err(Error::ConnClosed));
                }
                shared.set_state(ConnState::Closed);
                break;
            }
        };

        match msg.content {
            ContentType::Data => {
                if !msg.body.is_empty() {
                    match crypto.take() {
                        None => {
                            shared.rates.down.add(msg.body.len());
                            if let Some(tx) = &data_tx {
                                let _ = tx.send(Ok(msg.body.clone()));
                            }
                        }
                        Some(RxState::AwaitHeader(key)) => {
                            match SecretStreamRx::new(&key, &msg.body) {
                                Ok(stream) => crypto = Some(RxState::Ready(stream)),
                                Err(_) => {
                                    fatal_crypto(&shared, &mut data_tx);
                                    break;
                                }
                            }
                        }
                        Some(RxState::Ready(mut stream)) => match stream.open(&msg.body) {
                            Ok(plain) => {
                                crypto = Some(RxState::Ready(stream));
                                if !plain.is_empty() {
                                    shared.rates.down.add(plain.len());
                                    if let Some(tx) = &data_tx {
                                        let _ = tx.send(Ok(plain.into()));
                                    }
                                }
                            }
                            Err(_) => {
                                fatal_crypto(&shared, &mut data_tx);
                                break;
                            }
                        },
                    }
                }

                if msg.is_fin() {
                    // EOF for the application reader
                    data_tx.take();
                    let both = {
                        let mut cell = shared.state.lock();
                        cell.fin_recv = true;
                        cell.fin_sent
                    };
                    if both {
                        shared.set_state(ConnState::Disconnected);
                        shared.set_state(ConnState::Closed);
                        shared.channel.remove_receiver(shared.id);
                        break;
                    }
                }
            }
            ContentType::StateClosed => {
                data_tx.take();
                shared.set_state(ConnState::Disconnected);
                shared.set_state(ConnState::Closed);
                shared.channel.remove_receiver(shared.id);
                break;
            }
            other => log::trace!("conn[{}] ignoring {:?}", shared.id, other),
        }
    }
}

/// A frame failed authentication: the stream state is unrecoverable.
fn fatal_crypto(shared: &Arc<ConnShared>, data_tx: &mut Option<DataSender>) {
    log::error!("conn[{}] decryption failed, closing", shared.id);

    if let Some(tx) = data_tx.take() {
        let _ = tx.send(Err(Error::Crypto));
    }

    let msg = Message::new(ContentType::StateClosed).with_u32(header::CONN_ID, shared.id);
    let _ = shared.channel.send(msg);

    shared.set_state(ConnState::Closed);
    shared.channel.remove_receiver(shared.id);
}
