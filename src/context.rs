//! Context lifecycle and the control loop.
//!
//! A context owns one identity's view of the overlay: its API session, its
//! service catalog, its net sessions, and the fleet of edge-router channels.
//! All of that state lives inside a single actor task; the public
//! [`Context`] handle submits work items over an unbounded queue and awaits
//! replies. Controller calls never block the loop: each one runs in a
//! spawned task whose result comes back through the same queue, which keeps
//! the loop responsive while requests are in flight and makes request
//! coalescing (one `/sessions` POST per service, however many dials are
//! waiting) a map of pending work.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use model::{ApiSession, ApiVersion, EdgeRouter, Identity, NetSession, Service, ServiceUpdate, SessionType};
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinSet,
    time::{Instant, sleep_until},
};
use tokio_rustls::rustls::ClientConfig;

use crate::{
    Error, Options,
    channel::{Channel, ChannelConfig},
    config::{Config, TlsMaterial},
    conn::{self, ConnSetup, ConnState, Connection, ListenOptions, Listener},
    controller::{ControllerClient, CtrlFailure},
    events::{ContextEvent, Event, EventSink, RouterEvent, RouterStatus, ServiceEvent},
    metrics::Rates,
};

const RATES_INTERVAL: Duration = Duration::from_secs(5);
const POSTURE_INTERVAL: Duration = Duration::from_secs(20);
/// Retry delay after a transient authentication failure.
const AUTH_RETRY: Duration = Duration::from_secs(5);
/// Refresh this long before the session actually expires.
const SESSION_REFRESH_SLACK: i64 = 10;

pub(crate) enum Work {
    Enable,
    Disable,
    Shutdown(oneshot::Sender<()>),
    ForceRefresh,
    Dial {
        service: String,
        reply: oneshot::Sender<Result<Connection, Error>>,
    },
    Listen {
        service: String,
        opts: ListenOptions,
        reply: oneshot::Sender<Result<Listener, Error>>,
    },
    ServiceAvailable {
        name: String,
        reply: oneshot::Sender<Result<Service, Error>>,
    },
    Dump(oneshot::Sender<String>),

    // completions of spawned controller requests
    VersionResult(Result<ApiVersion, CtrlFailure>),
    SessionResult {
        result: Box<Result<ApiSession, CtrlFailure>>,
        from_login: bool,
    },
    IdentityResult(Result<Identity, CtrlFailure>),
    ServiceUpdateResult(Result<ServiceUpdate, CtrlFailure>),
    ServicesResult(Result<Vec<Service>, CtrlFailure>),
    ServiceLookupResult {
        name: String,
        result: Result<Option<Service>, CtrlFailure>,
    },
    NetSessionResult {
        key: (String, SessionType),
        result: Box<Result<NetSession, CtrlFailure>>,
    },
    EdgeRoutersResult(Result<Vec<EdgeRouter>, CtrlFailure>),
}

/// Operations parked on a net-session fetch.
enum Pending {
    Dial {
        service: Service,
        reply: oneshot::Sender<Result<Connection, Error>>,
    },
    Listen {
        service: Service,
        opts: ListenOptions,
        reply: oneshot::Sender<Result<Listener, Error>>,
    },
}

pub(crate) struct Shared {
    pub options: Options,
    pub enabled: AtomicBool,
    pub conn_seq: Arc<AtomicU32>,
    pub ch_seq: AtomicU32,
    pub rates: Rates,
    pub events: EventSink,
    pub session_token: Arc<RwLock<Option<String>>>,
    pub conns: Arc<Mutex<Vec<Connection>>>,
}

/// Handle to one identity's runtime. Cloneable and cheap; dropping the last
/// clone shuts the loop down.
#[derive(Clone)]
pub struct Context {
    tx: mpsc::UnboundedSender<Work>,
    shared: Arc<Shared>,
}

impl Context {
    /// Creates the context and spawns its control loop. Must run inside a
    /// tokio runtime. Unless `options.disabled` is set, authentication
    /// starts immediately.
    pub fn init(options: Options) -> Result<Self, Error> {
        let (controller_url, tls_material, config_types) = match &options.config {
            Some(path) => {
                let config = Config::load(path)?;
                let material = TlsMaterial::from_config(&config)?;
                let types = config
                    .config_types
                    .clone()
                    .unwrap_or_else(|| options.config_types.clone());
                (config.controller_url.clone(), Some(material), types)
            }
            None => (
                options
                    .controller
                    .clone()
                    .ok_or(Error::InvalidConfig)?,
                None,
                options.config_types.clone(),
            ),
        };

        let ctrl = ControllerClient::new(&controller_url, tls_material.as_ref())?;

        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(false),
            conn_seq: Arc::new(AtomicU32::new(0)),
            ch_seq: AtomicU32::new(0),
            rates: Rates::default(),
            events: EventSink::new(options.events),
            session_token: Arc::new(RwLock::new(None)),
            conns: Arc::new(Mutex::new(Vec::new())),
            options,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let start = !shared.options.disabled;

        let actor = Loop {
            shared: shared.clone(),
            ctrl,
            controller_url,
            tls_material,
            tls_cache: None,
            config_types,
            work_tx: tx.downgrade(),
            enabled_tx: watch::channel(false).0,
            session: None,
            session_received: None,
            identity: None,
            ctrl_status: Err(Error::Wtf),
            services: AHashMap::new(),
            net_sessions: AHashMap::new(),
            pending_sessions: AHashMap::new(),
            pending_lookups: AHashMap::new(),
            channels: AHashMap::new(),
            last_update: None,
            no_service_updates_api: false,
            no_edge_routers_api: false,
            auth_in_flight: false,
            session_refresh_at: None,
            services_refresh_at: None,
            posture_at: None,
            rates_at: Instant::now() + RATES_INTERVAL,
        };

        tokio::spawn(actor.run(rx));

        if start {
            let _ = tx.send(Work::Enable);
        }

        Ok(Self { tx, shared })
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        let _ = self.tx.send(Work::Enable);
    }

    pub fn disable(&self) {
        let _ = self.tx.send(Work::Disable);
    }

    /// Stops everything and waits for the loop to wind down.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Work::Shutdown(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Re-checks the service catalog ahead of the refresh interval.
    pub fn refresh(&self) {
        let _ = self.tx.send(Work::ForceRefresh);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Application-payload transfer rates, bytes per second `(up, down)`.
    pub fn transfer_rates(&self) -> (f64, f64) {
        (self.shared.rates.up.get(), self.shared.rates.down.get())
    }

    pub async fn dial(&self, service: &str) -> Result<Connection, Error> {
        let (reply, wait) = oneshot::channel();
        self.tx
            .send(Work::Dial {
                service: service.to_string(),
                reply,
            })
            .map_err(|_| Error::Disabled)?;

        wait.await.map_err(|_| Error::Disabled)?
    }

    pub async fn listen(&self, service: &str) -> Result<Listener, Error> {
        self.listen_with_options(service, ListenOptions::default())
            .await
    }

    pub async fn listen_with_options(
        &self,
        service: &str,
        opts: ListenOptions,
    ) -> Result<Listener, Error> {
        let (reply, wait) = oneshot::channel();
        self.tx
            .send(Work::Listen {
                service: service.to_string(),
                opts,
                reply,
            })
            .map_err(|_| Error::Disabled)?;

        wait.await.map_err(|_| Error::Disabled)?
    }

    /// Resolves a service from the catalog, falling back to a by-name
    /// controller lookup for services granted after the last refresh.
    pub async fn service_available(&self, name: &str) -> Result<Service, Error> {
        let (reply, wait) = oneshot::channel();
        self.tx
            .send(Work::ServiceAvailable {
                name: name.to_string(),
                reply,
            })
            .map_err(|_| Error::Disabled)?;

        wait.await.map_err(|_| Error::Disabled)?
    }

    /// Renders the context state for diagnostics.
    pub async fn dump(&self) -> String {
        let (reply, wait) = oneshot::channel();
        if self.tx.send(Work::Dump(reply)).is_err() {
            return String::from("context is shut down\n");
        }

        wait.await.unwrap_or_else(|_| String::from("context is shut down\n"))
    }
}

struct Loop {
    shared: Arc<Shared>,
    ctrl: ControllerClient,
    controller_url: String,
    tls_material: Option<TlsMaterial>,
    tls_cache: Option<Arc<ClientConfig>>,
    config_types: Vec<String>,
    /// Weak: completion tasks must not keep the loop alive once every
    /// context handle is gone.
    work_tx: mpsc::WeakUnboundedSender<Work>,
    enabled_tx: watch::Sender<bool>,

    session: Option<ApiSession>,
    session_received: Option<(Instant, DateTime<Utc>)>,
    identity: Option<Identity>,
    ctrl_status: Result<(), Error>,

    services: AHashMap<String, Service>,
    net_sessions: AHashMap<(String, SessionType), NetSession>,
    pending_sessions: AHashMap<(String, SessionType), Vec<Pending>>,
    pending_lookups: AHashMap<String, Vec<oneshot::Sender<Result<Service, Error>>>>,
    channels: AHashMap<String, Channel>,

    last_update: Option<String>,
    no_service_updates_api: bool,
    no_edge_routers_api: bool,
    auth_in_flight: bool,

    session_refresh_at: Option<Instant>,
    services_refresh_at: Option<Instant>,
    posture_at: Option<Instant>,
    rates_at: Instant,
}

impl Loop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Work>) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                work = rx.recv() => match work {
                    None => break,
                    Some(Work::Shutdown(done)) => {
                        self.disable();
                        let _ = done.send(());
                        break;
                    }
                    Some(work) => self.handle(work),
                },
                _ = sleep_until(deadline) => self.fire_timers(),
            }

            self.reap();
        }

        log::info!("context loop finished");
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.rates_at;
        for at in [
            self.session_refresh_at,
            self.services_refresh_at,
            self.posture_at,
        ]
        .into_iter()
        .flatten()
        {
            deadline = deadline.min(at);
        }

        deadline
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();

        if self.rates_at <= now {
            self.shared.rates.up.tick(RATES_INTERVAL);
            self.shared.rates.down.tick(RATES_INTERVAL);
            self.rates_at = now + RATES_INTERVAL;
        }

        if self.session_refresh_at.is_some_and(|at| at <= now) {
            self.session_refresh_at = None;
            self.session_refresh();
        }

        if self.services_refresh_at.is_some_and(|at| at <= now) {
            self.services_refresh_at = None;
            self.services_refresh();
        }

        if self.posture_at.is_some_and(|at| at <= now) {
            // posture reporting is summarized: the timer exists so session
            // state stays fresh for controllers that gate on it
            log::trace!("posture interval tick");
            self.posture_at = Some(now + POSTURE_INTERVAL);
        }
    }

    fn handle(&mut self, work: Work) {
        match work {
            Work::Enable => self.enable(),
            Work::Disable => self.disable(),
            Work::Shutdown(_) => unreachable!("shutdown handled by the run loop"),
            Work::ForceRefresh => self.services_refresh(),
            Work::Dial { service, reply } => self.on_dial(service, reply),
            Work::Listen {
                service,
                opts,
                reply,
            } => self.on_listen(service, opts, reply),
            Work::ServiceAvailable { name, reply } => self.on_service_available(name, reply),
            Work::Dump(reply) => {
                let _ = reply.send(self.dump());
            }
            Work::VersionResult(result) => match result {
                Ok(version) => log::info!(
                    "connected to controller {} version {}({})",
                    self.controller_url,
                    version.version,
                    version.revision.as_deref().unwrap_or("-")
                ),
                Err(err) => log::error!(
                    "failed to get controller version from {}: {}",
                    self.controller_url,
                    err
                ),
            },
            Work::SessionResult { result, from_login } => self.on_session(*result, from_login),
            Work::IdentityResult(result) => self.on_identity(result),
            Work::ServiceUpdateResult(result) => self.on_service_update(result),
            Work::ServicesResult(result) => self.on_services(result),
            Work::ServiceLookupResult { name, result } => self.on_service_lookup(name, result),
            Work::NetSessionResult { key, result } => self.on_net_session(key, *result),
            Work::EdgeRoutersResult(result) => self.on_edge_routers(result),
        }
    }

    /// Sweeps closed connection records, once per loop iteration.
    fn reap(&self) {
        let mut conns = self.shared.conns.lock();
        let before = conns.len();
        conns.retain(|conn| !matches!(conn.state(), ConnState::Closed | ConnState::Timedout));

        let reaped = before - conns.len();
        if reaped > 0 {
            log::debug!("reaped {} closed (out of {}) connections", reaped, before);
        }
    }

    fn enable(&mut self) {
        if self.shared.enabled.swap(true, Ordering::Relaxed) {
            return;
        }

        log::info!("enabling, controller[{}]", self.controller_url);
        self.enabled_tx.send_replace(true);

        let ctrl = self.ctrl.clone();
        let tx = self.work_tx.clone();
        tokio::spawn(async move {
            complete(&tx, Work::VersionResult(ctrl.get_version().await));
        });

        self.re_auth();
    }

    fn disable(&mut self) {
        if !self.shared.enabled.swap(false, Ordering::Relaxed) {
            return;
        }

        log::info!("disabling");
        self.enabled_tx.send_replace(false);

        self.session_refresh_at = None;
        self.services_refresh_at = None;
        self.posture_at = None;

        for (_, channel) in self.channels.drain() {
            channel.close();
        }

        let removed: Vec<Service> = self.services.drain().map(|(_, svc)| svc).collect();
        if !removed.is_empty() {
            self.shared.events.emit(Event::Service(ServiceEvent {
                added: Vec::new(),
                changed: Vec::new(),
                removed,
            }));
        }

        self.net_sessions.clear();
        self.last_update = None;
        self.session = None;
        self.identity = None;
        *self.shared.session_token.write() = None;

        for (_, waiters) in self.pending_sessions.drain() {
            for op in waiters {
                match op {
                    Pending::Dial { reply, .. } => {
                        let _ = reply.send(Err(Error::Disabled));
                    }
                    Pending::Listen { reply, .. } => {
                        let _ = reply.send(Err(Error::Disabled));
                    }
                }
            }
        }
        for (_, waiters) in self.pending_lookups.drain() {
            for reply in waiters {
                let _ = reply.send(Err(Error::Disabled));
            }
        }

        let ctrl = self.ctrl.clone();
        tokio::spawn(async move {
            if let Err(err) = ctrl.logout().await {
                log::debug!("logout failed: {}", err);
            }
        });

        self.update_ctrl_status(Err(Error::Disabled), None);
    }

    /// Drops the current session and starts a fresh certificate login.
    fn re_auth(&mut self) {
        if self.auth_in_flight {
            return;
        }
        self.auth_in_flight = true;

        log::warn!("(re)authenticating with controller[{}]", self.controller_url);
        self.session_refresh_at = None;
        self.services_refresh_at = None;
        self.session = None;
        self.session_received = None;
        self.last_update = None;
        self.net_sessions.clear();
        *self.shared.session_token.write() = None;
        self.ctrl.clear_session();

        let ctrl = self.ctrl.clone();
        let types = self.config_types.clone();
        let tx = self.work_tx.clone();
        tokio::spawn(async move {
            let result = ctrl.login(&types).await;
            complete(&tx, Work::SessionResult {
                result: Box::new(result),
                from_login: true,
            });
        });
    }

    fn on_session(&mut self, result: Result<ApiSession, CtrlFailure>, from_login: bool) {
        self.auth_in_flight = false;
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }

        let err = match result {
            Ok(session) => {
                log::debug!(
                    "{} => api session[{}]",
                    if from_login { "logged in" } else { "refreshed" },
                    session.id
                );

                *self.shared.session_token.write() = Some(session.token.clone());
                self.session_received = Some((Instant::now(), Utc::now()));
                self.session = Some(session);
                self.schedule_session_refresh();
                self.update_ctrl_status(Ok(()), None);

                let ctrl = self.ctrl.clone();
                let tx = self.work_tx.clone();
                tokio::spawn(async move {
                    complete(&tx, Work::IdentityResult(ctrl.current_identity().await));
                });

                self.services_refresh();
                self.refresh_edge_routers();
                self.posture_at = Some(Instant::now() + POSTURE_INTERVAL);
                return;
            }
            Err(err) => err,
        };

        log::warn!(
            "failed to get session from controller[{}]: {}",
            self.controller_url,
            err
        );

        if err.is_not_authorized() {
            if !from_login {
                // the session went stale underneath us; a fresh login may
                // still succeed with the certificate
                self.re_auth();
                return;
            }

            // the identity itself is rejected: report removal and stop
            let removed: Vec<Service> = self.services.drain().map(|(_, svc)| svc).collect();
            if !removed.is_empty() {
                self.shared.events.emit(Event::Service(ServiceEvent {
                    added: Vec::new(),
                    changed: Vec::new(),
                    removed,
                }));
            }

            self.session_refresh_at = None;
            self.services_refresh_at = None;
            self.posture_at = None;
            self.update_ctrl_status(Err(Error::NotAuthorized), Some(err.message));
        } else {
            self.session_refresh_at = Some(Instant::now() + AUTH_RETRY);
            self.update_ctrl_status(Err(err.kind), Some(err.message));
        }
    }

    /// Schedules the next session refresh, compensating for the skew between
    /// the local clock and the controller's.
    fn schedule_session_refresh(&mut self) {
        let Some(session) = &self.session else { return };
        let Some((received_at, received_utc)) = self.session_received else {
            return;
        };

        let controller_now = session
            .cached_last_activity_at
            .or(session.updated_at)
            .unwrap_or(received_utc);
        let skew = received_utc - controller_now;
        if skew.num_seconds().abs() > 10 {
            log::error!(
                "local clock is {}s {} the controller",
                skew.num_seconds().abs(),
                if skew.num_seconds() > 0 { "ahead of" } else { "behind" }
            );
        }

        let Some(expires_at) = session.expires_at else { return };
        let lifetime = (expires_at + skew - received_utc).num_seconds() - SESSION_REFRESH_SLACK;
        let delay = Duration::from_secs(lifetime.max(1) as u64);

        log::debug!("api session refresh in {:?}", delay);
        self.session_refresh_at = Some(received_at + delay);
    }

    fn session_refresh(&mut self) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }

        let expired = match &self.session {
            Some(session) => session.expires_at.is_some_and(|at| at < Utc::now()),
            None => true,
        };

        if expired {
            self.session = None;
            self.re_auth();
            return;
        }

        log::debug!("refreshing api session");
        let ctrl = self.ctrl.clone();
        let tx = self.work_tx.clone();
        tokio::spawn(async move {
            let result = ctrl.current_api_session().await;
            complete(&tx, Work::SessionResult {
                result: Box::new(result),
                from_login: false,
            });
        });
    }

    fn on_identity(&mut self, result: Result<Identity, CtrlFailure>) {
        match result {
            Ok(identity) => {
                log::debug!("identity: {}[{}]", identity.name, identity.id);
                self.identity = Some(identity);
            }
            Err(err) => {
                log::error!("failed to get current identity: {}", err);
                if err.is_not_authorized() {
                    self.re_auth();
                }
            }
        }
    }

    fn schedule_services_refresh(&mut self) {
        if let Some(interval) = self.shared.options.refresh_interval {
            self.services_refresh_at = Some(Instant::now() + interval);
        }
    }

    fn services_refresh(&mut self) {
        if !self.shared.enabled.load(Ordering::Relaxed) || self.session.is_none() {
            return;
        }

        let ctrl = self.ctrl.clone();
        let tx = self.work_tx.clone();

        if self.no_service_updates_api {
            tokio::spawn(async move {
                complete(&tx, Work::ServicesResult(ctrl.list_services().await));
            });
        } else {
            tokio::spawn(async move {
                complete(&tx, Work::ServiceUpdateResult(ctrl.services_update().await));
            });
        }
    }

    fn on_service_update(&mut self, result: Result<ServiceUpdate, CtrlFailure>) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }

        let fetch = match result {
            Ok(update) => {
                if self.last_update.as_deref() != Some(update.last_change.as_str()) {
                    log::debug!("catalog changed at {}", update.last_change);
                    self.last_update = Some(update.last_change);
                    true
                } else {
                    log::trace!("catalog unchanged");
                    self.schedule_services_refresh();
                    false
                }
            }
            Err(err) if err.is_unsupported() => {
                log::info!("controller does not support service-updates; polling full list");
                self.no_service_updates_api = true;
                true
            }
            Err(err) if err.is_not_authorized() => {
                self.re_auth();
                false
            }
            Err(err) => {
                self.schedule_services_refresh();
                self.update_ctrl_status(Err(Error::ControllerUnavailable), Some(err.message));
                false
            }
        };

        if fetch {
            let ctrl = self.ctrl.clone();
            let tx = self.work_tx.clone();
            tokio::spawn(async move {
                complete(&tx, Work::ServicesResult(ctrl.list_services().await));
            });
        }
    }

    fn on_services(&mut self, result: Result<Vec<Service>, CtrlFailure>) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }

        self.schedule_services_refresh();

        let update = match result {
            Ok(update) => update,
            Err(err) => {
                log::error!("failed to refresh services: {}", err);
                if err.is_not_authorized() {
                    self.re_auth();
                } else {
                    self.update_ctrl_status(Err(Error::ControllerUnavailable), Some(err.message));
                }
                return;
            }
        };

        self.update_ctrl_status(Ok(()), None);

        let (added, changed, removed) = diff_services(&self.services, update);

        for service in &removed {
            log::debug!("service[{}] is no longer available", service.name);
            self.services.remove(&service.name);
            // a stale net session must not outlive its service
            self.net_sessions
                .remove(&(service.id.clone(), SessionType::Dial));
            self.net_sessions
                .remove(&(service.id.clone(), SessionType::Bind));
        }
        for service in changed.iter().chain(added.iter()) {
            self.services.insert(service.name.clone(), service.clone());
        }

        if !(added.is_empty() && changed.is_empty() && removed.is_empty()) {
            log::debug!(
                "service event: {} added, {} changed, {} removed",
                added.len(),
                changed.len(),
                removed.len()
            );
            self.shared.events.emit(Event::Service(ServiceEvent {
                added,
                changed,
                removed,
            }));
        }
    }

    fn refresh_edge_routers(&mut self) {
        if self.no_edge_routers_api {
            return;
        }

        let ctrl = self.ctrl.clone();
        let tx = self.work_tx.clone();
        tokio::spawn(async move {
            complete(&tx, Work::EdgeRoutersResult(ctrl.list_current_edge_routers().await));
        });
    }

    fn on_edge_routers(&mut self, result: Result<Vec<EdgeRouter>, CtrlFailure>) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }

        let routers = match result {
            Ok(routers) => routers,
            Err(err) if err.is_unsupported() => {
                self.no_edge_routers_api = true;
                return;
            }
            Err(err) => {
                log::error!("failed to list edge routers: {}", err);
                if err.is_not_authorized() {
                    self.re_auth();
                }
                return;
            }
        };

        let mut stale: Vec<String> = self.channels.keys().cloned().collect();
        for router in routers {
            let Some(url) = router.tls_url().map(str::to_string) else {
                log::debug!("edge router {} has no tls listener", router.name);
                continue;
            };

            let key = channel_key(&router.name, &url);
            stale.retain(|it| it != &key);
            if !self.channels.contains_key(&key) {
                self.connect_channel(&router.name, &url);
            }
        }

        for key in stale {
            if let Some(channel) = self.channels.remove(&key) {
                log::info!("removing channel[{}]: no longer listed", key);
                channel.close();
                self.shared.events.emit(Event::Router(RouterEvent {
                    name: channel.name().to_string(),
                    address: channel.url().to_string(),
                    version: channel.version(),
                    status: RouterStatus::Removed,
                }));
            }
        }
    }

    fn tls_config(&mut self) -> Result<Arc<ClientConfig>, Error> {
        if let Some(cached) = &self.tls_cache {
            return Ok(cached.clone());
        }

        let material = self.tls_material.as_ref().ok_or(Error::InvalidConfig)?;
        let config = material.client_tls()?;
        self.tls_cache = Some(config.clone());
        Ok(config)
    }

    /// Opens (or re-attaches to) the channel for one edge router. At most
    /// one channel exists per router address.
    fn connect_channel(&mut self, name: &str, url: &str) -> Result<Channel, Error> {
        let key = channel_key(name, url);
        if let Some(existing) = self.channels.get(&key) {
            return Ok(existing.clone());
        }

        let tls = if url.starts_with("tls://") {
            Some(self.tls_config()?)
        } else {
            None
        };

        let options = &self.shared.options;
        let config = ChannelConfig {
            tls,
            session_token: self.shared.session_token.clone(),
            enabled: self.enabled_tx.subscribe(),
            events: self.shared.events.clone(),
            connect_timeout: options.timeout,
            latency_interval: options.latency_interval,
            reconnect_initial: options.reconnect_initial,
            reconnect_ceiling: options.reconnect_ceiling,
        };

        let id = self.shared.ch_seq.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("connecting channel[{}] {}", id, key);
        let channel = Channel::connect(id, name, url, config)?;
        self.channels.insert(key, channel.clone());
        Ok(channel)
    }

    fn on_dial(&mut self, name: String, reply: oneshot::Sender<Result<Connection, Error>>) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            let _ = reply.send(Err(Error::Disabled));
            return;
        }

        let Some(service) = self.services.get(&name).cloned() else {
            let _ = reply.send(Err(Error::ServiceUnavailable));
            return;
        };
        if !service.can_dial() {
            let _ = reply.send(Err(Error::ServiceUnavailable));
            return;
        }

        let key = (service.id.clone(), SessionType::Dial);
        if let Some(session) = self.net_sessions.get(&key).cloned() {
            self.start_dial(service, session, reply);
            return;
        }

        self.queue_pending(key, Pending::Dial { service, reply });
    }

    fn on_listen(
        &mut self,
        name: String,
        opts: ListenOptions,
        reply: oneshot::Sender<Result<Listener, Error>>,
    ) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            let _ = reply.send(Err(Error::Disabled));
            return;
        }

        let Some(service) = self.services.get(&name).cloned() else {
            let _ = reply.send(Err(Error::ServiceUnavailable));
            return;
        };
        if !service.can_bind() {
            let _ = reply.send(Err(Error::ServiceUnavailable));
            return;
        }

        let key = (service.id.clone(), SessionType::Bind);
        if let Some(session) = self.net_sessions.get(&key).cloned() {
            self.start_listen(service, session, opts, reply);
            return;
        }

        self.queue_pending(key, Pending::Listen {
            service,
            opts,
            reply,
        });
    }

    /// Parks an operation on the net-session fetch for its service,
    /// starting the fetch when it is the first one in line.
    fn queue_pending(&mut self, key: (String, SessionType), op: Pending) {
        let waiters = self.pending_sessions.entry(key.clone()).or_default();
        waiters.push(op);

        if waiters.len() == 1 {
            let ctrl = self.ctrl.clone();
            let tx = self.work_tx.clone();
            let (service_id, session_type) = key.clone();
            tokio::spawn(async move {
                let result = ctrl.create_net_session(&service_id, session_type).await;
                complete(&tx, Work::NetSessionResult {
                    key,
                    result: Box::new(result),
                });
            });
        }
    }

    fn on_net_session(
        &mut self,
        key: (String, SessionType),
        result: Result<NetSession, CtrlFailure>,
    ) {
        let waiters = self.pending_sessions.remove(&key).unwrap_or_default();

        if !self.shared.enabled.load(Ordering::Relaxed) {
            for op in waiters {
                match op {
                    Pending::Dial { reply, .. } => {
                        let _ = reply.send(Err(Error::Disabled));
                    }
                    Pending::Listen { reply, .. } => {
                        let _ = reply.send(Err(Error::Disabled));
                    }
                }
            }
            return;
        }

        match result {
            Ok(session) => {
                self.net_sessions.insert(key, session.clone());
                for op in waiters {
                    match op {
                        Pending::Dial { service, reply } => {
                            self.start_dial(service, session.clone(), reply)
                        }
                        Pending::Listen {
                            service,
                            opts,
                            reply,
                        } => self.start_listen(service, session.clone(), opts, reply),
                    }
                }
            }
            Err(err) => {
                log::warn!("net session for service[{}] failed: {}", key.0, err);
                let not_authorized = err.is_not_authorized();
                for op in waiters {
                    match op {
                        Pending::Dial { reply, .. } => {
                            let _ = reply.send(Err(err.kind));
                        }
                        Pending::Listen { reply, .. } => {
                            let _ = reply.send(Err(err.kind));
                        }
                    }
                }
                if not_authorized {
                    self.re_auth();
                }
            }
        }
    }

    /// Channels for the routers a net session authorizes, connecting any
    /// that are new.
    fn session_channels(&mut self, session: &NetSession) -> Vec<Channel> {
        let mut channels = Vec::new();
        for router in &session.edge_routers {
            let Some(url) = router.tls_url().map(str::to_string) else {
                continue;
            };

            match self.connect_channel(&router.name, &url) {
                Ok(channel) => channels.push(channel),
                Err(err) => log::warn!("channel to {} failed: {}", router.name, err),
            }
        }

        channels
    }

    fn start_dial(
        &mut self,
        service: Service,
        session: NetSession,
        reply: oneshot::Sender<Result<Connection, Error>>,
    ) {
        let channels = self.session_channels(&session);
        if channels.is_empty() {
            let _ = reply.send(Err(Error::GatewayUnavailable));
            return;
        }

        let shared = self.shared.clone();
        let deadline = self.shared.options.timeout;
        let caller_id = self.identity.as_ref().map(|it| it.name.clone());

        tokio::spawn(async move {
            let result = async {
                let channel = pick_channel(channels, deadline).await?;
                let setup = ConnSetup {
                    id: shared.conn_seq.fetch_add(1, Ordering::Relaxed) + 1,
                    channel,
                    service: service.name.clone(),
                    encrypted: service.encryption_required,
                    rates: shared.rates.clone(),
                    conns: shared.conns.clone(),
                };

                conn::dial(setup, &session.token, caller_id.as_deref(), deadline).await
            }
            .await;

            let _ = reply.send(result);
        });
    }

    fn start_listen(
        &mut self,
        service: Service,
        session: NetSession,
        opts: ListenOptions,
        reply: oneshot::Sender<Result<Listener, Error>>,
    ) {
        let channels = self.session_channels(&session);
        if channels.is_empty() {
            let _ = reply.send(Err(Error::GatewayUnavailable));
            return;
        }

        let shared = self.shared.clone();
        let deadline = self.shared.options.timeout;

        tokio::spawn(async move {
            let result = async {
                let channel = pick_channel(channels, deadline).await?;
                let setup = ConnSetup {
                    id: shared.conn_seq.fetch_add(1, Ordering::Relaxed) + 1,
                    channel,
                    service: service.name.clone(),
                    encrypted: service.encryption_required,
                    rates: shared.rates.clone(),
                    conns: shared.conns.clone(),
                };

                conn::bind(setup, &session.token, &opts, deadline, shared.conn_seq.clone()).await
            }
            .await;

            let _ = reply.send(result);
        });
    }

    fn on_service_available(
        &mut self,
        name: String,
        reply: oneshot::Sender<Result<Service, Error>>,
    ) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            let _ = reply.send(Err(Error::Disabled));
            return;
        }

        if let Some(service) = self.services.get(&name) {
            let _ = reply.send(Ok(service.clone()));
            return;
        }

        let waiters = self.pending_lookups.entry(name.clone()).or_default();
        waiters.push(reply);
        if waiters.len() > 1 {
            return;
        }

        let ctrl = self.ctrl.clone();
        let tx = self.work_tx.clone();
        tokio::spawn(async move {
            let result = ctrl.get_service(&name).await;
            complete(&tx, Work::ServiceLookupResult { name, result });
        });
    }

    fn on_service_lookup(
        &mut self,
        name: String,
        result: Result<Option<Service>, CtrlFailure>,
    ) {
        let waiters = self.pending_lookups.remove(&name).unwrap_or_default();

        let outcome = match result {
            Ok(Some(service)) => {
                self.services.insert(service.name.clone(), service.clone());
                Ok(service)
            }
            Ok(None) => Err(Error::ServiceUnavailable),
            Err(err) => {
                if err.is_not_authorized() {
                    self.re_auth();
                }
                Err(err.kind)
            }
        };

        for reply in waiters {
            let _ = reply.send(outcome.clone());
        }
    }

    fn update_ctrl_status(&mut self, status: Result<(), Error>, message: Option<String>) {
        if self.ctrl_status == status {
            return;
        }

        self.ctrl_status = status;
        self.shared.events.emit(Event::Context(ContextEvent {
            status,
            message,
        }));
    }

    fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "=================\nContext:");
        let _ = writeln!(
            out,
            "Enabled:\t{}",
            self.shared.enabled.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "Controller:\t{}", self.controller_url);
        let _ = writeln!(out, "Config types:\t{}", self.config_types.join(","));
        match &self.identity {
            Some(identity) => {
                let _ = writeln!(out, "Identity:\t{}[{}]", identity.name, identity.id);
            }
            None => {
                let _ = writeln!(out, "Identity:\tunknown - never logged in");
            }
        }

        let _ = writeln!(out, "=================\nSession:");
        match &self.session {
            Some(session) => {
                let _ = writeln!(out, "api session[{}]", session.id);
            }
            None => {
                let _ = writeln!(out, "no session");
            }
        }

        let _ = writeln!(out, "=================\nServices:");
        for service in self.services.values() {
            let _ = writeln!(
                out,
                "{}: id[{}] perm(dial={},bind={})",
                service.name,
                service.id,
                service.can_dial(),
                service.can_bind()
            );
            for (kind, value) in &service.config {
                let _ = writeln!(out, "\tconfig[{}]={}", kind, value);
            }
        }

        let _ = writeln!(out, "=================\nNet Sessions:");
        for ((service_id, session_type), session) in &self.net_sessions {
            let _ = writeln!(
                out,
                "{}: service_id[{}] type[{}]",
                session.id, service_id, session_type
            );
        }

        let _ = writeln!(out, "=================\nChannels:");
        for channel in self.channels.values() {
            let _ = write!(
                out,
                "ch[{}]({}@{}) ",
                channel.id(),
                channel.name(),
                channel.url()
            );
            let _ = match channel.latency() {
                Some(ms) if channel.is_connected() => {
                    writeln!(out, "connected [latency={}ms]", ms)
                }
                _ if channel.is_connected() => writeln!(out, "connected"),
                _ => writeln!(out, "{:?}", channel.state()),
            };
        }

        let _ = writeln!(out, "=================\nConnections:");
        for conn in self.shared.conns.lock().iter() {
            let _ = writeln!(
                out,
                "conn[{}]: state[{:?}] service[{}]",
                conn.id(),
                conn.state(),
                conn.service()
            );
        }

        out
    }
}

fn channel_key(name: &str, url: &str) -> String {
    format!("{}@{}", name, url)
}

/// Posts a completion back to the loop, unless the loop is already gone.
fn complete(tx: &mpsc::WeakUnboundedSender<Work>, work: Work) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(work);
    }
}

/// Prefers the lowest-latency connected channel; otherwise races the
/// candidates and takes whichever connects first.
async fn pick_channel(channels: Vec<Channel>, deadline: Duration) -> Result<Channel, Error> {
    let best = channels
        .iter()
        .filter(|ch| ch.is_connected())
        .min_by_key(|ch| ch.latency().unwrap_or(u64::MAX));
    if let Some(best) = best {
        return Ok(best.clone());
    }

    let mut set = JoinSet::new();
    for channel in channels {
        set.spawn(async move {
            channel.wait_connected(deadline).await.map(|_| channel)
        });
    }

    let mut last = Error::GatewayUnavailable;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(channel)) => return Ok(channel),
            Ok(Err(err)) => last = err,
            Err(_) => {}
        }
    }

    Err(last)
}

/// Splits a catalog update into added / changed / removed relative to the
/// current catalog. The three sets are disjoint; services present in both
/// catalogs land in `changed` exactly when they compare unequal.
pub(crate) fn diff_services(
    current: &AHashMap<String, Service>,
    update: Vec<Service>,
) -> (Vec<Service>, Vec<Service>, Vec<Service>) {
    let mut incoming: AHashMap<String, Service> =
        update.into_iter().map(|svc| (svc.name.clone(), svc)).collect();

    let mut changed = Vec::new();
    let mut removed = Vec::new();
    for (name, old) in current {
        match incoming.remove(name) {
            Some(new) => {
                if &new != old {
                    changed.push(new);
                }
            }
            None => removed.push(old.clone()),
        }
    }

    let added: Vec<Service> = incoming.into_values().collect();
    (added, changed, removed)
}
