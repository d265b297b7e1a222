//! Typed client for the controller REST API.
//!
//! Every response is an envelope `{meta, data, error}`; `data` is parsed into
//! the operation's result type and `error` is mapped through the taxonomy
//! table. The session token obtained at login rides every later request in
//! the `zt-session` header until logout or an authentication failure clears
//! it. There are no retries here: the control loop owns retry policy.

use std::sync::Arc;

use model::{
    ApiSession, ApiVersion, AuthRequest, EdgeRouter, Envelope, EnvInfo, Identity, NetSession,
    NetSessionRequest, SdkInfo, Service, ServiceUpdate, SessionType,
};
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::{Error, config::TlsMaterial, error::code_to_error};

pub const SESSION_HEADER: &str = "zt-session";

/// A failed controller request.
///
/// Keeps the HTTP status and the controller's error code next to the mapped
/// kind: the control loop needs the status to recognize endpoints the
/// controller does not implement (404) and authentication loss (401).
#[derive(Debug, Clone)]
pub struct CtrlFailure {
    pub kind: Error,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl CtrlFailure {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            kind: Error::ControllerUnavailable,
            status: err.status().map(|it| it.as_u16()),
            code: None,
            message: err.to_string(),
        }
    }

    fn from_status(status: StatusCode) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => Error::NotAuthorized,
            _ => Error::ControllerUnavailable,
        };

        Self {
            kind,
            status: Some(status.as_u16()),
            code: None,
            message: format!("controller returned {}", status),
        }
    }

    pub fn is_not_authorized(&self) -> bool {
        self.kind == Error::NotAuthorized
    }

    /// The controller predates this endpoint.
    pub fn is_unsupported(&self) -> bool {
        self.status == Some(404)
    }
}

impl std::fmt::Display for CtrlFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({})",
            self.code.as_deref().unwrap_or("-"),
            self.message
        )
    }
}

impl From<CtrlFailure> for Error {
    fn from(value: CtrlFailure) -> Self {
        value.kind
    }
}

pub type CtrlResult<T> = Result<T, CtrlFailure>;

fn envelope_error(body: &str) -> Option<model::ApiError> {
    if body.is_empty() {
        return None;
    }

    serde_json::from_str::<Envelope<serde_json::Value>>(body)
        .ok()
        .and_then(|envelope| envelope.error)
}

#[derive(Clone)]
pub struct ControllerClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    base: String,
    session: RwLock<Option<String>>,
}

impl ControllerClient {
    pub fn new(base_url: &str, tls: Option<&TlsMaterial>) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(tls) = tls {
            builder = tls.apply_reqwest(builder)?;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                client: builder.build().map_err(|_| Error::InvalidConfig)?,
                base: base_url.trim_end_matches('/').to_string(),
                session: RwLock::new(None),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base
    }

    pub fn session_token(&self) -> Option<String> {
        self.inner.session.read().clone()
    }

    pub fn clear_session(&self) {
        *self.inner.session.write() = None;
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .inner
            .client
            .request(method, format!("{}{}", self.inner.base, path));

        match self.session_token() {
            Some(token) => req.header(SESSION_HEADER, token),
            None => req,
        }
    }

    /// Sends the request and unwraps the response envelope.
    async fn send<T: DeserializeOwned + Default>(
        &self,
        req: RequestBuilder,
    ) -> CtrlResult<Option<T>> {
        let resp = req.send().await.map_err(CtrlFailure::transport)?;
        let status = resp.status();

        let envelope: Envelope<T> = match resp.json().await {
            Ok(envelope) => envelope,
            Err(_) => return Err(CtrlFailure::from_status(status)),
        };

        if let Some(err) = envelope.error {
            return Err(CtrlFailure {
                kind: code_to_error(&err.code),
                status: Some(status.as_u16()),
                code: Some(err.code),
                message: err.message,
            });
        }

        if !status.is_success() {
            return Err(CtrlFailure::from_status(status));
        }

        Ok(envelope.data)
    }

    async fn send_data<T: DeserializeOwned + Default>(&self, req: RequestBuilder) -> CtrlResult<T> {
        self.send(req).await?.ok_or_else(|| CtrlFailure {
            kind: Error::Wtf,
            status: None,
            code: None,
            message: "response envelope carried no data".to_string(),
        })
    }

    /// Sends a request whose success reply may have an empty body.
    async fn send_empty(&self, req: RequestBuilder) -> CtrlResult<()> {
        let resp = req.send().await.map_err(CtrlFailure::transport)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if let Some(err) = envelope_error(&body) {
            return Err(CtrlFailure {
                kind: code_to_error(&err.code),
                status: Some(status.as_u16()),
                code: Some(err.code),
                message: err.message,
            });
        }

        if !status.is_success() {
            return Err(CtrlFailure::from_status(status));
        }

        Ok(())
    }

    /// Sends a request whose success reply is plain text (enrollment paths).
    async fn send_text(&self, req: RequestBuilder) -> CtrlResult<String> {
        let resp = req.send().await.map_err(CtrlFailure::transport)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            if let Some(err) = envelope_error(&body) {
                return Err(CtrlFailure {
                    kind: code_to_error(&err.code),
                    status: Some(status.as_u16()),
                    code: Some(err.code),
                    message: err.message,
                });
            }

            return Err(CtrlFailure::from_status(status));
        }

        Ok(body)
    }

    pub async fn get_version(&self) -> CtrlResult<ApiVersion> {
        self.send_data(self.request(Method::GET, "/version")).await
    }

    /// Authenticates with the client certificate and installs the session
    /// token for all subsequent requests.
    pub async fn login(&self, config_types: &[String]) -> CtrlResult<ApiSession> {
        let body = AuthRequest {
            sdk_info: SdkInfo {
                kind: "veil-sdk-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            env_info: EnvInfo {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            },
            config_types: config_types.to_vec(),
        };

        let result = self
            .send_data::<ApiSession>(
                self.request(Method::POST, "/authenticate?method=cert")
                    .json(&body),
            )
            .await;

        match &result {
            Ok(session) => *self.inner.session.write() = Some(session.token.clone()),
            Err(_) => self.clear_session(),
        }

        result
    }

    /// Refreshes the current session. A successful refresh re-installs the
    /// (possibly rotated) token.
    pub async fn current_api_session(&self) -> CtrlResult<ApiSession> {
        let result = self
            .send_data::<ApiSession>(self.request(Method::GET, "/current-api-session"))
            .await;

        if let Ok(session) = &result {
            *self.inner.session.write() = Some(session.token.clone());
        }

        result
    }

    pub async fn logout(&self) -> CtrlResult<()> {
        let result = self
            .send_empty(self.request(Method::DELETE, "/current-api-session"))
            .await;

        self.clear_session();
        result
    }

    pub async fn current_identity(&self) -> CtrlResult<Identity> {
        self.send_data(self.request(Method::GET, "/current-identity"))
            .await
    }

    pub async fn services_update(&self) -> CtrlResult<ServiceUpdate> {
        self.send_data(self.request(Method::GET, "/current-api-session/service-updates"))
            .await
    }

    pub async fn list_services(&self) -> CtrlResult<Vec<Service>> {
        self.send_data(self.request(Method::GET, "/services?limit=1000"))
            .await
    }

    pub async fn get_service(&self, name: &str) -> CtrlResult<Option<Service>> {
        let filter = format!("name=\"{}\"", name);
        let services: Vec<Service> = self
            .send_data(
                self.request(Method::GET, "/services")
                    .query(&[("filter", filter.as_str())]),
            )
            .await?;

        Ok(services.into_iter().next())
    }

    pub async fn create_net_session(
        &self,
        service_id: &str,
        session_type: SessionType,
    ) -> CtrlResult<NetSession> {
        let body = NetSessionRequest {
            service_id: service_id.to_string(),
            session_type,
        };

        let mut session: NetSession = self
            .send_data(self.request(Method::POST, "/sessions").json(&body))
            .await?;

        session.service_id = Some(service_id.to_string());
        Ok(session)
    }

    /// The list variant is informational; session establishment always goes
    /// through [`Self::create_net_session`].
    pub async fn list_net_sessions(&self) -> CtrlResult<Vec<NetSession>> {
        self.send_data(self.request(Method::GET, "/sessions")).await
    }

    pub async fn list_current_edge_routers(&self) -> CtrlResult<Vec<EdgeRouter>> {
        self.send_data(self.request(Method::GET, "/current-api-session/edge-routers"))
            .await
    }

    /// Exchanges a CSR for a signed certificate during enrollment.
    pub async fn enroll(&self, csr_pem: &str, method: &str, token: &str) -> CtrlResult<String> {
        let path = format!("/enroll?method={}&token={}", method, token);

        self.send_text(
            self.request(Method::POST, &path)
                .header("Content-Type", "text/plain")
                .body(csr_pem.to_string()),
        )
        .await
    }

    pub async fn well_known_certs(&self) -> CtrlResult<String> {
        self.send_text(self.request(Method::GET, "/.well-known/est/cacerts"))
            .await
    }
}
