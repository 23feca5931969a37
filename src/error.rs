//! Error handling for fleetdesk

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Error body returned by the PostgREST API on a failed request
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for ApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(message) = &self.message {
            parts.push(format!("Message: {}", message));
        }
        if let Some(details) = &self.details {
            parts.push(format!("Details: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("Hint: {}", hint));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Unified error type for fleetdesk
#[derive(Error, Debug)]
pub enum Error {
    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// CSV reading or writing errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The backend rejected the request with a structured error body
    #[error("API error: {details} (Status: {status})")]
    Api {
        details: ApiErrorDetails,
        status: u16,
    },

    /// Backend failures without a structured body
    #[error("Database error: {0}")]
    Database(String),

    /// Realtime socket errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Change notification errors
    #[error("Realtime error: {0}")]
    Realtime(String),

    /// Input rejected before any remote call was made
    #[error("{0}")]
    Validation(String),

    /// A uniqueness or ledger membership rule would be violated
    #[error("{0}")]
    Conflict(String),

    /// The target record is not in the current working set
    #[error("{0}")]
    NotFound(String),

    /// The record's lifecycle state does not allow the operation
    #[error("{0}")]
    InvalidTransition(String),

    /// A multi-step workflow failed half way and could not be undone
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl Error {
    /// Create a new validation error
    pub fn validation<T: fmt::Display>(msg: T) -> Self {
        Error::Validation(msg.to_string())
    }

    /// Create a new conflict error
    pub fn conflict<T: fmt::Display>(msg: T) -> Self {
        Error::Conflict(msg.to_string())
    }

    /// Create a new not-found error
    pub fn not_found<T: fmt::Display>(msg: T) -> Self {
        Error::NotFound(msg.to_string())
    }

    /// Create a new invalid-transition error
    pub fn invalid_transition<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidTransition(msg.to_string())
    }

    /// Create a new database error
    pub fn database<T: fmt::Display>(msg: T) -> Self {
        Error::Database(msg.to_string())
    }

    /// Create a new realtime error
    pub fn realtime<T: fmt::Display>(msg: T) -> Self {
        Error::Realtime(msg.to_string())
    }

    /// Create a new inconsistency error
    pub fn inconsistent<T: fmt::Display>(msg: T) -> Self {
        Error::Inconsistent(msg.to_string())
    }

    /// Create a new general error
    pub fn general<T: fmt::Display>(msg: T) -> Self {
        Error::General(msg.to_string())
    }

    /// Whether the error describes something the operator can fix
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Conflict(_)
                | Error::NotFound(_)
                | Error::InvalidTransition(_)
        )
    }

    /// Text shown to the operator for this error
    pub fn user_message(&self) -> String {
        match self {
            Error::Inconsistent(_) => self.to_string(),
            Error::Api { details, .. } => match &details.message {
                Some(message) => format!("Request failed: {}", message),
                None => "Request failed. Please try again.".to_string(),
            },
            _ if self.is_user_facing() => self.to_string(),
            _ => "Something went wrong talking to the server. Please try again.".to_string(),
        }
    }
}
