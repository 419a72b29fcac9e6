//! Error taxonomy shared by every component of the uploader.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No usable credential; the caller has to (re)start authorization.
    #[error("not authenticated: {0}")]
    AuthRequired(String),

    /// State mismatch or the provider rejected the exchange.
    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("upload failed ({status}): {message}")]
    Upload { status: u16, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file not usable for upload: {}", .0.display())]
    MissingMedia(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::AuthRequired(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::Download(message.into())
    }

    pub fn upload(status: u16, message: impl Into<String>) -> Self {
        Self::Upload {
            status,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthRequired(_))
    }
}
