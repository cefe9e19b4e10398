//! Error taxonomy for the remote game client.

use thiserror::Error;

/// Errors surfaced by the remote client. Everything the retry loop can't
/// handle internally ends up as one of these.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The token was rejected. There is no recovery; the coordinator must stop.
    #[error("unauthorized")]
    Unauthorized,

    /// The game server answered 503. Callers decide whether to wait it out.
    #[error("server is in maintenance mode")]
    MaintenanceMode,

    /// The request was retried past its budget.
    #[error("too many retries")]
    TooManyRetries,

    /// The server answered 2xx with a body we can't parse. Retrying can't help.
    #[error("unable to decode response: {0}")]
    UnableToDecodeResponse(String),

    /// We failed to encode a request body we were about to send.
    #[error("invalid request body: {0}")]
    InvalidRequest(#[source] serde_json::Error),

    /// Structured error envelope from the game server.
    #[error("remote error (code {code}): {message}")]
    Remote { message: String, code: i64 },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// The server-provided message, when there is one. The fuel probe matches
    /// on this to extract the required quantity from the rejection.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            ClientError::Remote { message, .. } => Some(message),
            _ => None,
        }
    }
}
