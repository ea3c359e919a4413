use thiserror::Error;

pub(crate) const GENERIC_FAILURE: &str = "request failed";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    /// Failure envelope reported by the server (e.g. "login already taken").
    #[error("{0}")]
    Api(String),
    #[error("server reported success without a payload")]
    EmptyPayload,
    #[error("session expired")]
    SessionExpired,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("local cache error: {0}")]
    Cache(String),
    #[error("scope '{0}' is closed")]
    ScopeClosed(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ClientError::SessionExpired | ClientError::NotLoggedIn)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ClientError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return ClientError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        ClientError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Undecodable push frame. These are logged and dropped, never surfaced.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of type '{kind}' has no data")]
    MissingData { kind: String },
    #[error("frame of type '{kind}' has malformed data: {source}")]
    MalformedData {
        kind: String,
        source: serde_json::Error,
    },
}
