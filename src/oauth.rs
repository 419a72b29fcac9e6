//! OAuth2 authorization-code flow against Google's endpoints.
//!
//! The broker owns the credential lifecycle: it builds the consent URL,
//! exchanges the callback code, refreshes expired tokens and persists every
//! change through [`TokenStore`]. All calls block; the HTTP layer runs them on
//! the blocking pool.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::config::OAuthSettings;
use crate::credential::{Credential, TokenStore};
use crate::error::{Error, Result};
use crate::security::{constant_time_eq, random_token};

const STATE_BYTES: usize = 32;

/// Consent URL plus the state value that has to come back on the callback.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub url: String,
    pub state: String,
}

/// Query parameters Google appends to the redirect URI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Extracts the parameters from a full callback URL.
    pub fn from_url(callback_url: &str) -> Result<Self> {
        let url = Url::parse(callback_url)
            .map_err(|err| Error::auth(format!("malformed callback URL: {err}")))?;
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(params)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Why a token endpoint call failed.
enum TokenFailure {
    Rejected { status: u16, error: String },
    Transport(String),
}

impl TokenFailure {
    fn describe(&self) -> String {
        match self {
            Self::Rejected { status, error } => format!("token endpoint returned {status}: {error}"),
            Self::Transport(message) => format!("token endpoint unreachable: {message}"),
        }
    }
}

#[derive(Clone)]
pub struct OAuthBroker {
    settings: OAuthSettings,
    store: TokenStore,
    agent: ureq::Agent,
}

impl OAuthBroker {
    pub fn new(settings: OAuthSettings, store: TokenStore) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(StdDuration::from_secs(10))
            .timeout_read(StdDuration::from_secs(30))
            .build();
        Self {
            settings,
            store,
            agent,
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn begin_authorization(&self) -> Result<Authorization> {
        let state = random_token(STATE_BYTES);
        let scope = self.settings.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.settings.auth_uri,
            &[
                ("response_type", "code"),
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|err| Error::config(format!("invalid auth URI: {err}")))?;
        Ok(Authorization {
            url: url.into(),
            state,
        })
    }

    /// Exchanges the callback code for a credential and persists it.
    pub fn complete_authorization(
        &self,
        params: &CallbackParams,
        stored_state: Option<&str>,
    ) -> Result<Credential> {
        if let Some(error) = params.error.as_deref() {
            return Err(Error::auth(format!("provider denied authorization: {error}")));
        }
        let stored = stored_state
            .ok_or_else(|| Error::auth("no authorization in progress for this session"))?;
        let returned = params
            .state
            .as_deref()
            .ok_or_else(|| Error::auth("callback is missing the state parameter"))?;
        if !constant_time_eq(stored, returned) {
            return Err(Error::auth("state mismatch"));
        }
        let code = params
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or_else(|| Error::auth("callback is missing the authorization code"))?;

        let response = self
            .post_token(
                &self.settings.token_uri,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", self.settings.redirect_uri.as_str()),
                    ("client_id", self.settings.client_id.as_str()),
                    ("client_secret", self.settings.client_secret.as_str()),
                ],
            )
            .map_err(|failure| Error::auth(failure.describe()))?;

        let now = Utc::now();
        let credential = Credential {
            token: response.access_token,
            refresh_token: response.refresh_token,
            token_uri: self.settings.token_uri.clone(),
            client_id: self.settings.client_id.clone(),
            client_secret: self.settings.client_secret.clone(),
            scopes: granted_scopes(response.scope.as_deref(), &self.settings.scopes),
            expiry: response.expires_in.map(|secs| now + Duration::seconds(secs)),
        };
        if credential.refresh_token().is_none() {
            warn!("provider returned no refresh token; the credential will not survive expiry");
        }
        self.store.save(&credential)?;
        info!("authorization completed, credential stored");
        Ok(credential)
    }

    /// True when a stored credential is valid now or can be refreshed. Makes
    /// no network call.
    pub fn has_credential(&self) -> bool {
        self.has_credential_at(Utc::now())
    }

    pub fn has_credential_at(&self, now: DateTime<Utc>) -> bool {
        match self.store.load() {
            Ok(Some(credential)) => {
                !credential.is_expired(now) || credential.refresh_token().is_some()
            }
            Ok(None) | Err(_) => false,
        }
    }

    /// Returns a usable credential, refreshing it first when it has expired.
    pub fn credential(&self) -> Result<Credential> {
        self.credential_at(Utc::now())
    }

    pub fn credential_at(&self, now: DateTime<Utc>) -> Result<Credential> {
        let credential = match self.store.load() {
            Ok(Some(credential)) => credential,
            Ok(None) => return Err(Error::auth_required("no stored credential")),
            Err(Error::Json(err)) => {
                warn!(path = %self.store.path().display(), "stored credential is unreadable: {err}");
                return Err(Error::auth_required("stored credential is unreadable"));
            }
            Err(err) => return Err(err),
        };
        if !credential.is_expired(now) {
            return Ok(credential);
        }
        if credential.refresh_token().is_none() {
            return Err(Error::auth_required(
                "credential expired and has no refresh token",
            ));
        }
        self.refresh(credential, now)
    }

    fn refresh(&self, mut credential: Credential, now: DateTime<Utc>) -> Result<Credential> {
        let token_uri = non_empty_or(&credential.token_uri, &self.settings.token_uri);
        let client_id = non_empty_or(&credential.client_id, &self.settings.client_id);
        let client_secret = non_empty_or(&credential.client_secret, &self.settings.client_secret);
        let refresh_token = credential.refresh_token().unwrap_or_default().to_string();

        let response = self
            .post_token(
                &token_uri,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                ],
            )
            .map_err(|failure| match &failure {
                // A revoked or expired refresh token needs a new consent.
                TokenFailure::Rejected { status: 400 | 401, .. } => {
                    Error::auth_required(failure.describe())
                }
                _ => Error::auth(failure.describe()),
            })?;

        credential.token = response.access_token;
        if let Some(new_refresh) = response.refresh_token.filter(|t| !t.trim().is_empty()) {
            credential.refresh_token = Some(new_refresh);
        }
        if let Some(scope) = response.scope.as_deref() {
            credential.scopes = granted_scopes(Some(scope), &credential.scopes);
        }
        credential.expiry = response.expires_in.map(|secs| now + Duration::seconds(secs));
        self.store.save(&credential)?;
        info!("access token refreshed");
        Ok(credential)
    }

    /// Drops the stored credential and asks the provider to revoke it.
    pub fn revoke(&self) -> Result<()> {
        let stored = self.store.load().unwrap_or_else(|err| {
            warn!("discarding unreadable credential: {err}");
            None
        });
        if let Some(credential) = stored {
            let token = credential
                .refresh_token()
                .unwrap_or(credential.token.as_str())
                .to_string();
            let result = self
                .agent
                .post(&self.settings.revoke_uri)
                .send_form(&[("token", token.as_str())]);
            if let Err(err) = result {
                warn!("token revocation failed: {err}");
            }
        }
        self.store.clear()
    }

    fn post_token(
        &self,
        uri: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<TokenResponse, TokenFailure> {
        match self.agent.post(uri).send_form(form) {
            Ok(response) => response
                .into_json::<TokenResponse>()
                .map_err(|err| TokenFailure::Transport(format!("unreadable token response: {err}"))),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                let parsed: TokenErrorBody = serde_json::from_str(&body).unwrap_or_default();
                let error = match (parsed.error.is_empty(), parsed.error_description) {
                    (false, Some(description)) => format!("{}: {description}", parsed.error),
                    (false, None) => parsed.error,
                    (true, _) => body.trim().to_string(),
                };
                Err(TokenFailure::Rejected { status, error })
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(TokenFailure::Transport(transport.to_string()))
            }
        }
    }
}

fn granted_scopes(scope: Option<&str>, fallback: &[String]) -> Vec<String> {
    match scope {
        Some(scope) if !scope.trim().is_empty() => {
            scope.split_whitespace().map(str::to_string).collect()
        }
        _ => fallback.to_vec(),
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
