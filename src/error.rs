/// Error taxonomy of the SDK.
///
/// Controller error strings map onto these kinds through [`code_to_error`];
/// everything the public API returns is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    ConfigNotFound,
    InvalidConfig,
    NotAuthorized,
    ControllerUnavailable,
    GatewayUnavailable,
    ServiceUnavailable,
    Eof,
    Timeout,
    ConnClosed,
    InvalidState,
    Crypto,
    Disabled,
    /// Anything the taxonomy has no name for.
    Wtf,
}

impl std::error::Error for Error {}

impl From<codec::Error> for Error {
    fn from(_: codec::Error) -> Self {
        Self::Wtf
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigNotFound => write!(f, "configuration not found"),
            Self::InvalidConfig => write!(f, "configuration is invalid"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::ControllerUnavailable => write!(f, "controller is not available"),
            Self::GatewayUnavailable => write!(f, "no edge router available"),
            Self::ServiceUnavailable => write!(f, "service not available"),
            Self::Eof => write!(f, "end of data"),
            Self::Timeout => write!(f, "operation did not complete in time"),
            Self::ConnClosed => write!(f, "connection is closed"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Crypto => write!(f, "crypto failure"),
            Self::Disabled => write!(f, "context is disabled"),
            Self::Wtf => write!(f, "unexpected error"),
        }
    }
}

/// Maps a controller error code string to an error kind.
///
/// Unknown codes are worth a warning: they usually mean the controller grew
/// a new failure mode this SDK does not understand yet.
pub fn code_to_error(code: &str) -> Error {
    match code {
        "NO_ROUTABLE_INGRESS_NODES" => Error::GatewayUnavailable,
        "NO_EDGE_ROUTERS_AVAILABLE" => Error::GatewayUnavailable,
        "INVALID_AUTHENTICATION" => Error::NotAuthorized,
        "REQUIRES_CERT_AUTH" => Error::NotAuthorized,
        "UNAUTHORIZED" => Error::NotAuthorized,
        "INVALID_AUTH" => Error::NotAuthorized,
        "INVALID_SESSION" => Error::NotAuthorized,
        "NOT_FOUND" => Error::ServiceUnavailable,
        _ => {
            log::warn!("unmapped error code: {}", code);
            Error::Wtf
        }
    }
}
