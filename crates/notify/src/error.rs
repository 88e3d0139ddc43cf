//! Errors raised while publishing a lifecycle result.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub returned {status} for {action}: {body}")]
    Status { action: &'static str, status: u16, body: String },

    /// Required settings (token, repository) are missing.
    #[error("not configured: {0}")]
    NotConfigured(String),
}
