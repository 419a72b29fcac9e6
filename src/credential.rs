//! OAuth credential record and its on-disk persistence.
//!
//! The JSON layout matches what Google's client libraries write
//! (`token`, `refresh_token`, `token_uri`, `client_id`, `client_secret`,
//! `scopes`, `expiry`), so a token produced by another tool can be dropped in
//! as-is, either as a file or through the `TOKEN_B64` variable.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::security::write_private_file;

/// Tokens this close to their expiry are treated as already expired.
const EXPIRY_LEEWAY_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Credentials without a recorded expiry are assumed valid; the provider
    /// will reject them on use if they are not.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .is_some_and(|expiry| now + Duration::seconds(EXPIRY_LEEWAY_SECS) >= expiry)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn to_env_blob(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn from_env_blob(blob: &str) -> Result<Self> {
        let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|err| Error::config(format!("token blob is not valid base64: {err}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// File-backed credential storage. Writes are atomic and owner-only.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Credential>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let credential = serde_json::from_slice(&bytes)?;
        Ok(Some(credential))
    }

    pub fn save(&self, credential: &Credential) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(credential)?;
        write_private_file(&self.path, &bytes)?;
        debug!(path = %self.path.display(), "credential persisted");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_credential() -> Credential {
    Credential {
        token: "ya29.access".into(),
        refresh_token: Some("1//refresh".into()),
        token_uri: "https://oauth2.googleapis.com/token".into(),
        client_id: "client-id".into(),
        client_secret: "client-secret".into(),
        scopes: vec!["https://www.googleapis.com/auth/youtube.upload".into()],
        expiry: None,
    }
}
