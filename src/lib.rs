//! Client runtime for the veil zero-trust overlay network.
//!
//! An application embeds a [`Context`] to reach services published in the
//! overlay without any conventional addressing: the context authenticates
//! the identity against its controller, keeps the authorized service catalog
//! in sync, and maintains multiplexed channels to the edge routers traffic
//! actually rides on. Logical connections are dialed (or hosted) per
//! service; payloads are end-to-end encrypted between the two endpoints
//! whenever the service requires it, independent of the TLS protecting each
//! router hop.
//!
//! ```no_run
//! use veil_sdk::{Context, Options};
//!
//! # async fn example() -> Result<(), veil_sdk::Error> {
//! let ctx = Context::init(Options {
//!     config: Some("identity.json".into()),
//!     ..Options::default()
//! })?;
//!
//! let conn = ctx.dial("wiki").await?;
//! conn.write(b"GET / HTTP/1.0\r\n\r\n").await?;
//! while let Some(chunk) = conn.recv().await? {
//!     println!("{}", String::from_utf8_lossy(&chunk));
//! }
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod events;
pub mod metrics;

mod channel;
mod conn;
mod context;
mod error;

pub use self::{
    bridge::{bridge, bridge_split},
    config::{Config, IdentityConfig, KeyMaterial, Pkcs11Key, TlsMaterial, init_logging},
    conn::{ConnState, Connection, ListenOptions, Listener},
    context::Context,
    controller::{ControllerClient, CtrlFailure},
    error::{Error, code_to_error},
    events::{
        AuthEvent, ContextEvent, Event, EventTypes, RouterEvent, RouterStatus, ServiceEvent,
    },
};

pub use model::{ApiSession, EdgeRouter, Identity, NetSession, Service, SessionType};

use std::path::PathBuf;
use std::time::Duration;

/// Context construction options.
///
/// Either `config` (an identity file) or `controller` must be set; the
/// identity file wins when both are present. The rest tunes timers that are
/// otherwise fine at their defaults.
#[derive(Debug, Clone)]
pub struct Options {
    /// Path to the JSON identity configuration.
    pub config: Option<PathBuf>,
    /// Controller base URL, for contexts built without an identity file.
    pub controller: Option<String>,
    /// Service config types resolved at login.
    pub config_types: Vec<String>,
    /// Service catalog poll interval; `None` disables periodic refresh.
    pub refresh_interval: Option<Duration>,
    /// Which event kinds subscribers receive.
    pub events: EventTypes,
    /// Deadline for dial, bind, and channel connect operations.
    pub timeout: Duration,
    /// Channel latency probe interval.
    pub latency_interval: Duration,
    /// First reconnect delay after a channel loss.
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_ceiling: Duration,
    /// Create the context disabled; call [`Context::enable`] later.
    pub disabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: None,
            controller: None,
            config_types: vec!["all".to_string()],
            refresh_interval: Some(Duration::from_secs(60)),
            events: EventTypes::ALL,
            timeout: Duration::from_secs(10),
            latency_interval: Duration::from_secs(10),
            reconnect_initial: Duration::from_secs(1),
            reconnect_ceiling: Duration::from_secs(60),
            disabled: false,
        }
    }
}
