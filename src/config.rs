//! Identity configuration.
//!
//! The configuration file is JSON: a controller URL plus the identity's CA,
//! certificate, and private key. Each of those is either inline PEM
//! (`pem:-----BEGIN ...`), a file reference (`file:///path/to/cert.pem`), or
//! raw inline PEM with no prefix. The private key additionally accepts a
//! `pkcs11://module?pin=…&slot=…&id=…` URI for hardware-held keys.

use std::{fs, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer};
use url::Url;

use crate::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the controller, e.g. `https://ctrl.example.org:1280`.
    pub controller_url: String,
    pub id: IdentityConfig,
    /// Service config types the identity wants resolved; defaults to `all`.
    #[serde(default)]
    pub config_types: Option<Vec<String>>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = fs::read_to_string(path).map_err(|_| Error::ConfigNotFound)?;
        serde_json::from_str(&raw).map_err(|_| Error::InvalidConfig)
    }
}

/// A private key held behind a PKCS#11 module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkcs11Key {
    pub module: String,
    pub pin: String,
    pub slot: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    None,
    Pem(Vec<u8>),
    Pkcs11(Pkcs11Key),
}

/// Resolved identity material, ready to build TLS configurations from.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub key: KeyMaterial,
}

/// Resolves a `pem:` / `file://` / inline reference to its PEM bytes.
fn parse_ref(value: &str) -> Result<Vec<u8>, Error> {
    if let Some(path) = value.strip_prefix("file://") {
        fs::read(path).map_err(|_| Error::ConfigNotFound)
    } else if let Some(inline) = value.strip_prefix("pem:") {
        Ok(inline.as_bytes().to_vec())
    } else {
        Ok(value.as_bytes().to_vec())
    }
}

fn query_param(url: &Url, name: &str) -> Result<String, Error> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .ok_or(Error::InvalidConfig)
}

/// Parses a `pkcs11://module-path?pin=…&slot=…&id=…` key reference.
fn parse_pkcs11(value: &str) -> Result<Pkcs11Key, Error> {
    let url = Url::parse(value).map_err(|_| Error::InvalidConfig)?;

    let mut module = String::new();
    if let Some(host) = url.host_str() {
        module.push_str(host);
    }
    module.push_str(url.path());
    if module.is_empty() {
        return Err(Error::InvalidConfig);
    }

    Ok(Pkcs11Key {
        module,
        pin: query_param(&url, "pin")?,
        slot: query_param(&url, "slot")?,
        id: query_param(&url, "id")?,
    })
}

impl TlsMaterial {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let ca = config.id.ca.as_deref().map(parse_ref).transpose()?;
        let cert = config.id.cert.as_deref().map(parse_ref).transpose()?;

        let key = match config.id.key.as_deref() {
            None => KeyMaterial::None,
            Some(value) if value.starts_with("pkcs11://") => {
                KeyMaterial::Pkcs11(parse_pkcs11(value)?)
            }
            Some(value) => KeyMaterial::Pem(parse_ref(value)?),
        };

        Ok(Self { ca, cert, key })
    }

    /// Builds the rustls client configuration used for edge-router channels.
    ///
    /// Zero-trust deployments pin the fabric CA, so a missing CA is a
    /// configuration error rather than a fall-back to system roots.
    pub fn client_tls(&self) -> Result<Arc<ClientConfig>, Error> {
        let ca = self.ca.as_ref().ok_or(Error::InvalidConfig)?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca.as_slice()) {
            roots
                .add(cert.map_err(|_| Error::InvalidConfig)?)
                .map_err(|_| Error::InvalidConfig)?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match (&self.cert, &self.key) {
            (Some(cert), KeyMaterial::Pem(key)) => {
                let certs = rustls_pemfile::certs(&mut cert.as_slice())
                    .collect::<Result<Vec<CertificateDer>, _>>()
                    .map_err(|_| Error::InvalidConfig)?;
                let key = rustls_pemfile::private_key(&mut key.as_slice())
                    .map_err(|_| Error::InvalidConfig)?
                    .ok_or(Error::InvalidConfig)?;

                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|_| Error::InvalidConfig)?
            }
            (_, KeyMaterial::Pkcs11(key)) => {
                // rustls needs an external signer for hardware keys; the
                // parsed parameters are surfaced so an embedding application
                // can wire one up, but the built-in config cannot.
                log::error!(
                    "pkcs11 key module[{}] slot[{}] requires an external signer",
                    key.module,
                    key.slot
                );
                return Err(Error::InvalidConfig);
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    /// Applies the identity material to a reqwest builder for controller
    /// requests.
    pub fn apply_reqwest(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, Error> {
        builder = builder.use_rustls_tls();

        if let Some(ca) = &self.ca {
            for cert in
                reqwest::Certificate::from_pem_bundle(ca).map_err(|_| Error::InvalidConfig)?
            {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let (Some(cert), KeyMaterial::Pem(key)) = (&self.cert, &self.key) {
            let mut pem = cert.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key);
            builder = builder
                .identity(reqwest::Identity::from_pem(&pem).map_err(|_| Error::InvalidConfig)?);
        }

        Ok(builder)
    }
}

/// Initializes the process-wide log sink.
///
/// `VEIL_LOG` selects the level (0 off … 5 trace); `VEIL_TIME_FORMAT=utc`
/// switches timestamps to UTC wall-clock, anything else drops them.
pub fn init_logging() {
    let level = match std::env::var("VEIL_LOG")
        .ok()
        .and_then(|it| it.parse::<u8>().ok())
        .unwrap_or(3)
    {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let logger = simple_logger::SimpleLogger::new().with_level(level);
    let logger = if std::env::var("VEIL_TIME_FORMAT").as_deref() == Ok("utc") {
        logger.with_utc_timestamps()
    } else {
        logger.without_timestamps()
    };

    // a second context in the same process keeps the first sink
    let _ = logger.init();
}
