//! Typed entities of the controller REST API.
//!
//! Every controller response is a JSON envelope `{meta, data, error}`;
//! [`Envelope`] is generic over the data shape so each operation deserializes
//! straight into its typed result. Entities derive structural equality, which
//! is what the catalog refresh uses to detect changed services.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Service permission, as the controller spells it.
pub const PERMISSION_DIAL: &str = "Dial";
pub const PERMISSION_BIND: &str = "Bind";

/// Generic response envelope of the controller API.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// Error body of a failed controller request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub version: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default, rename = "buildDate")]
    pub build_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

/// Authentication session against the controller.
///
/// The token rides every subsequent request. `cached_last_activity_at` (or
/// `updated_at` on older controllers) is the controller's clock at the time
/// the session was produced; comparing it with the local clock lets the
/// refresh timer compensate for skew.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSession {
    pub id: String,
    pub token: String,
    #[serde(default, rename = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub identity: Option<Identity>,
    #[serde(default, rename = "cachedLastActivityAt")]
    pub cached_last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostureQuery {
    pub id: String,
    #[serde(default, rename = "queryType")]
    pub query_type: Option<String>,
    #[serde(default, rename = "isPassing")]
    pub is_passing: bool,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default, rename = "timeoutRemaining")]
    pub timeout_remaining: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostureQuerySet {
    #[serde(default, rename = "policyId")]
    pub policy_id: String,
    #[serde(default, rename = "isPassing")]
    pub is_passing: bool,
    #[serde(default, rename = "postureQueries")]
    pub posture_queries: Vec<PostureQuery>,
}

/// A service published in the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, rename = "encryptionRequired")]
    pub encryption_required: bool,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "postureQueries")]
    pub posture_queries: Vec<PostureQuerySet>,
}

impl Service {
    pub fn can_dial(&self) -> bool {
        self.permissions.iter().any(|it| it == PERMISSION_DIAL)
    }

    pub fn can_bind(&self) -> bool {
        self.permissions.iter().any(|it| it == PERMISSION_BIND)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    #[default]
    Dial,
    Bind,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dial => write!(f, "Dial"),
            Self::Bind => write!(f, "Bind"),
        }
    }
}

/// Edge router descriptor inside a net session or the current-routers list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRouter {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Listener URLs keyed by protocol; the SDK only consumes `tls`.
    #[serde(default, alias = "urls", rename = "supportedProtocols")]
    pub protocols: HashMap<String, String>,
}

impl EdgeRouter {
    pub fn tls_url(&self) -> Option<&str> {
        self.protocols.get("tls").map(String::as_str)
    }
}

/// Per-service authorization to dial or bind through edge routers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetSession {
    pub id: String,
    pub token: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default, rename = "edgeRouters")]
    pub edge_routers: Vec<EdgeRouter>,
    /// Filled in by the caller; the wire shape does not carry it.
    #[serde(default, rename = "serviceId")]
    pub service_id: Option<String>,
}

/// Reply of `GET /current-api-session/service-updates`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    #[serde(rename = "lastChangeAt")]
    pub last_change: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvInfo {
    pub os: String,
    pub arch: String,
}

/// Body of `POST /authenticate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "sdkInfo")]
    pub sdk_info: SdkInfo,
    #[serde(rename = "envInfo")]
    pub env_info: EnvInfo,
    #[serde(rename = "configTypes")]
    pub config_types: Vec<String>,
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetSessionRequest {
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
}
