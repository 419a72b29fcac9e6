//! Turns base64 blobs from the environment into the files the OAuth broker and
//! yt-dlp read, and validates what ends up on disk.

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::config::{OAuthSettings, Settings};
use crate::credential::{Credential, TokenStore};
use crate::security::write_private_file;

/// A real Netscape cookie jar is never smaller than this.
const MIN_COOKIES_FILE_SIZE: u64 = 50;

/// Google's downloadable client secret JSON.
#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    #[serde(alias = "installed")]
    web: ClientSecretEntry,
}

#[derive(Debug, Deserialize)]
struct ClientSecretEntry {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    auth_uri: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

/// What `materialize` wrote, mostly for startup logging.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Materialized {
    pub client_secret: bool,
    pub cookies: bool,
    pub token: bool,
}

pub fn decode_blob(name: &str, value: &str) -> Result<Vec<u8>> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .with_context(|| format!("{name} is not valid base64"))
}

/// Writes every configured blob to its file and then fills OAuth settings that
/// were not given directly from the client secret file, if there is one.
pub fn materialize(settings: &mut Settings) -> Result<Materialized> {
    let mut written = Materialized::default();
    let paths = settings.paths.clone();

    if let Some(blob) = settings.blobs.client_secret.as_deref() {
        let bytes = decode_blob("CLIENT_SECRET_B64", blob)?;
        write_private_file(&paths.client_secret_file, &bytes)
            .with_context(|| format!("writing {}", paths.client_secret_file.display()))?;
        written.client_secret = true;
    }

    if let Some(blob) = settings.blobs.cookies.as_deref() {
        let bytes = decode_blob("COOKIES_B64", blob)?;
        write_private_file(&paths.cookies_file, &bytes)
            .with_context(|| format!("writing {}", paths.cookies_file.display()))?;
        written.cookies = true;
    }

    if let Some(blob) = settings.blobs.token.as_deref() {
        if paths.token_file.exists() {
            debug!(
                path = %paths.token_file.display(),
                "token file already present; TOKEN_B64 ignored"
            );
        } else {
            let credential = Credential::from_env_blob(blob)
                .context("TOKEN_B64 does not hold a stored credential")?;
            TokenStore::new(&paths.token_file)
                .save(&credential)
                .with_context(|| format!("writing {}", paths.token_file.display()))?;
            written.token = true;
        }
    }

    if paths.client_secret_file.exists() {
        apply_client_secret(&paths.client_secret_file, &mut settings.oauth)?;
    }

    info!(
        client_secret = written.client_secret,
        cookies = written.cookies,
        token = written.token,
        "materialized secrets"
    );
    Ok(written)
}

fn apply_client_secret(path: &Path, oauth: &mut OAuthSettings) -> Result<()> {
    let content = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: ClientSecretFile = serde_json::from_slice(&content)
        .with_context(|| format!("parsing client secret {}", path.display()))?;
    let entry = parsed.web;

    fill_if_empty(&mut oauth.client_id, entry.client_id);
    fill_if_empty(&mut oauth.client_secret, entry.client_secret);
    if let Some(first) = entry.redirect_uris.into_iter().next() {
        fill_if_empty(&mut oauth.redirect_uri, first);
    }
    // File-provided endpoints only replace the built-in Google defaults.
    if let Some(auth_uri) = entry.auth_uri {
        oauth.auth_uri = auth_uri;
    }
    if let Some(token_uri) = entry.token_uri {
        oauth.token_uri = token_uri;
    }
    Ok(())
}

fn fill_if_empty(slot: &mut String, value: String) {
    if slot.trim().is_empty() {
        *slot = value;
    }
}

/// Netscape cookie jars either carry the classic header or tab separated
/// lines with at least six fields.
pub fn is_valid_netscape_cookies(content: &str) -> bool {
    if content.starts_with("# Netscape HTTP Cookie File") || content.starts_with("# HTTP Cookie File")
    {
        return true;
    }
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .any(|line| line.split('\t').count() >= 6)
}

/// Returns the cookie jar path when it exists and looks usable.
pub fn usable_cookie_jar(path: &Path) -> Option<PathBuf> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return None,
    };
    if metadata.len() < MIN_COOKIES_FILE_SIZE {
        debug!(path = %path.display(), bytes = metadata.len(), "cookie jar too small, skipping");
        return None;
    }
    match fs::read_to_string(path) {
        Ok(content) if is_valid_netscape_cookies(&content) => Some(path.to_path_buf()),
        Ok(_) => {
            warn!(path = %path.display(), "cookie jar is not in Netscape format, skipping");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), "could not read cookie jar: {err}");
            None
        }
    }
}
