use crate::models::account::{HeaderStyle, ModelFamily};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Refresh token permanently rejected; the account must be removed.
    #[error("OAuth refresh rejected with invalid_grant")]
    InvalidGrant,

    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Every account in the family is rate limited.
    #[error("no account available (retry in {retry_after_ms} ms)")]
    NoAccountsAvailable { retry_after_ms: i64 },

    #[error("rate limited for {family:?}/{style:?} (retry in {retry_after_ms} ms)")]
    RateLimited {
        family: ModelFamily,
        style: HeaderStyle,
        retry_after_ms: i64,
    },

    #[error("upstream error {status}: {body}")]
    UpstreamTransient { status: u16, body: String },

    /// Success response carried no candidates/choices after all retries.
    #[error("upstream returned an empty response after {attempts} attempts")]
    EmptyResponse { attempts: u32 },

    /// Internal sentinel: the upstream rejected thinking-block ordering and
    /// the request should be rebuilt once with forced thinking recovery.
    #[error("thinking recovery needed: {original}")]
    ThinkingRecoveryNeeded { original: String },

    #[error("conversation corrupted: {0}")]
    ConversationCorrupted(String),

    #[error("project unavailable: {0}")]
    ProjectUnavailable(String),

    #[error("configuration missing: {0}. Run the login flow to add an account.")]
    ConfigurationMissing(String),

    #[error("transform error: {0}")]
    Transform(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
