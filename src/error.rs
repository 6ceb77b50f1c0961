use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const NETWORK_ERROR_MESSAGE: &str = "Cannot reach server. Is the backend running?";

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{message}")]
    Server { status: u16, message: String },

    #[error("{}", NETWORK_ERROR_MESSAGE)]
    Network,

    #[error("Unexpected response from server.")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn from_response(status: u16, body: &[u8]) -> Self {
        ApiError::Server {
            status,
            message: envelope_message(body).unwrap_or_else(|| format!("HTTP {}", status)),
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    errors: Option<Value>,
}

// A list of strings in `errors` wins over `error`; anything else in `errors` is ignored.
fn envelope_message(body: &[u8]) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_slice(body).ok()?;
    let listed = envelope.errors.as_ref().and_then(Value::as_array).and_then(|items| {
        let messages: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
        (!messages.is_empty() && messages.len() == items.len()).then(|| messages.join(" • "))
    });
    listed.or_else(|| {
        envelope
            .error
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}
