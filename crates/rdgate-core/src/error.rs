use thiserror::Error;

/// Errors produced by the gateway. Every variant except `Config` is local to
/// a single session.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("token decryption failed: {0}")]
    TokenDecryption(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("settings processing failed: {0}")]
    SettingsProcessing(String),

    #[error("backend connect failed: {0}")]
    BackendConnect(String),

    #[error("backend protocol error: {0}")]
    BackendProtocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("inactivity timeout ({0})")]
    InactivityTimeout(Leg),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Which side of a session went quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Backend,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Client => write!(f, "client"),
            Leg::Backend => write!(f, "backend"),
        }
    }
}

impl GatewayError {
    /// Numeric status code carried in the `error` instruction sent to the
    /// browser before a failed session is closed.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::TokenDecryption(_) => status::CLIENT_UNAUTHORIZED,
            GatewayError::UnsupportedProtocol(_) => status::CLIENT_BAD_REQUEST,
            GatewayError::BackendConnect(_) => status::UPSTREAM_NOT_FOUND,
            GatewayError::BackendProtocol(_) => status::UPSTREAM_ERROR,
            GatewayError::InactivityTimeout(Leg::Client) => status::CLIENT_TIMEOUT,
            GatewayError::InactivityTimeout(Leg::Backend) => status::UPSTREAM_TIMEOUT,
            _ => status::SERVER_ERROR,
        }
    }
}

/// Status codes understood by browser clients of the instruction protocol.
pub mod status {
    pub const SERVER_ERROR: u16 = 0x0200;
    pub const UPSTREAM_TIMEOUT: u16 = 0x0202;
    pub const UPSTREAM_ERROR: u16 = 0x0203;
    pub const UPSTREAM_NOT_FOUND: u16 = 0x0207;
    pub const CLIENT_BAD_REQUEST: u16 = 0x0300;
    pub const CLIENT_UNAUTHORIZED: u16 = 0x0301;
    pub const CLIENT_TIMEOUT: u16 = 0x0308;
}

pub type GatewayResult<T> = Result<T, GatewayError>;
