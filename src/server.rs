//! HTTP front end: the submission page, the OAuth round-trip and the upload
//! endpoints. Handlers stay async and push every blocking call (yt-dlp,
//! token endpoint, upload) onto the blocking pool.

use std::{sync::Arc, time::Duration};

use axum::{
    Form, Json, Router,
    extract::{FromRequest, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use chrono::FixedOffset;
use serde_json::json;
use tokio::task;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::credential::TokenStore;
use crate::downloader::Downloader;
use crate::error::Error;
use crate::job::{Submission, UploadJob};
use crate::oauth::{CallbackParams, OAuthBroker};
use crate::pipeline::{Published, Publisher};
use crate::session::{CookieSigner, SESSION_COOKIE, SessionPhase, SessionStore};
use crate::upload::Uploader;

#[derive(Clone)]
pub struct AppState {
    publisher: Arc<Publisher>,
    sessions: Arc<SessionStore>,
    signer: Arc<CookieSigner>,
    session_ttl: Duration,
    schedule_offset: FixedOffset,
    secure_cookies: bool,
}

impl AppState {
    pub fn new(
        publisher: Publisher,
        signer: CookieSigner,
        session_ttl: Duration,
        schedule_offset: FixedOffset,
        secure_cookies: bool,
    ) -> Self {
        Self {
            publisher: Arc::new(publisher),
            sessions: Arc::new(SessionStore::new(session_ttl)),
            signer: Arc::new(signer),
            session_ttl,
            schedule_offset,
            secure_cookies,
        }
    }

    /// Wires every component from the loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let store = TokenStore::new(&settings.paths.token_file);
        let broker = OAuthBroker::new(settings.oauth.clone(), store);
        let publisher = Publisher::new(
            Downloader::new(&settings.download, &settings.paths.cookies_file),
            broker,
            Uploader::new(&settings.upload),
            &settings.paths.work_dir,
        );
        Self::new(
            publisher,
            CookieSigner::new(&settings.session_secret),
            settings.session_ttl,
            settings.schedule_offset,
            settings.oauth.redirect_uri.starts_with("https://"),
        )
    }

    fn broker(&self) -> &OAuthBroker {
        self.publisher.broker()
    }

    /// Resolves the caller's session. A missing, forged or expired cookie
    /// gets a fresh id that is only issued once state is stored under it.
    fn session(&self, headers: &HeaderMap) -> Session {
        let presented = session_cookie(headers).and_then(|value| self.signer.verify(value));
        let id = self.sessions.resolve(presented.as_deref());
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.signer.sign(&id),
            self.session_ttl.as_secs()
        );
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        Session {
            id,
            set_cookie: HeaderValue::from_str(&cookie).ok(),
            sessions: Arc::clone(&self.sessions),
        }
    }

    async fn has_credential(&self) -> bool {
        let broker = self.broker().clone();
        task::spawn_blocking(move || broker.has_credential())
            .await
            .unwrap_or(false)
    }
}

struct Session {
    id: String,
    set_cookie: Option<HeaderValue>,
    sessions: Arc<SessionStore>,
}

impl Session {
    fn attach(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if let Some(cookie) = &self.set_cookie
            && self.sessions.contains(&self.id)
        {
            response.headers_mut().append(header::SET_COOKIE, cookie.clone());
        }
        response
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index).post(submit))
        .route("/upload_video", post(submit))
        .route("/authorize", get(authorize))
        .route("/oauth2callback", get(oauth_callback))
        .route("/logout", get(logout))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFormat {
    Json,
    Html,
}

impl ResponseFormat {
    fn of(headers: &HeaderMap) -> Self {
        let mentions_json = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.contains("application/json"))
        };
        if mentions_json(header::CONTENT_TYPE) || mentions_json(header::ACCEPT) {
            Self::Json
        } else {
            Self::Html
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    format: ResponseFormat,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, format: ResponseFormat) -> Self {
        Self {
            status,
            message: message.into(),
            format,
        }
    }

    fn from_error(err: Error, format: ResponseFormat) -> Self {
        let status = match &err {
            Error::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            Error::Auth(_) | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Download(_) | Error::Upload { .. } => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::MissingMedia(_) | Error::Io(_) | Error::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string(), format)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), "{}", self.message);
        } else {
            warn!(status = self.status.as_u16(), "{}", self.message);
        }
        match self.format {
            ResponseFormat::Json => {
                (self.status, Json(json!({ "error": self.message }))).into_response()
            }
            ResponseFormat::Html => (
                self.status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                self.message,
            )
                .into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs blocking work on the blocking pool.
async fn blocking<T, F>(f: F) -> crate::error::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| Error::Io(std::io::Error::other(format!("task join error: {err}"))))?
}

/// Form or JSON body, chosen by `Content-Type`.
struct SubmissionBody(Submission);

impl<S> FromRequest<S> for SubmissionBody
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let format = ResponseFormat::of(req.headers());
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));
        let submission = if is_json {
            Json::<Submission>::from_request(req, state)
                .await
                .map(|Json(submission)| submission)
                .map_err(|rej| ApiError::new(rej.status(), rej.body_text(), format))?
        } else {
            Form::<Submission>::from_request(req, state)
                .await
                .map(|Form(submission)| submission)
                .map_err(|rej| ApiError::new(rej.status(), rej.body_text(), format))?
        };
        Ok(Self(submission))
    }
}

async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = state.session(&headers);
    let phase = state
        .sessions
        .phase(&session.id, state.has_credential().await);
    session.attach(Html(render_index(phase)))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "authenticated": state.has_credential().await,
    }))
}

async fn authorize(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = state.session(&headers);
    let result = state.broker().begin_authorization().map(|authorization| {
        state
            .sessions
            .set_oauth_state(&session.id, authorization.state);
        info!("redirecting to consent screen");
        Redirect::to(&authorization.url)
    });
    match result {
        Ok(redirect) => session.attach(redirect),
        Err(err) => session.attach(ApiError::from_error(err, ResponseFormat::of(&headers))),
    }
}

async fn oauth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let session = state.session(&headers);
    let response = complete_callback(&state, &session, params).await;
    session.attach(response)
}

async fn complete_callback(
    state: &AppState,
    session: &Session,
    params: CallbackParams,
) -> ApiResult<Response> {
    let format = ResponseFormat::Html;
    let stored_state = state.sessions.take_oauth_state(&session.id);
    let broker = state.broker().clone();
    blocking(move || broker.complete_authorization(&params, stored_state.as_deref()))
        .await
        .map_err(|err| ApiError::from_error(err, format))?;

    let Some(job) = state.sessions.take_job(&session.id) else {
        return Ok(Html(render_connected()).into_response());
    };
    info!(job = %job.id, "resuming job that was waiting for authorization");
    let publisher = state.publisher.clone();
    let published = blocking(move || publisher.run(&job))
        .await
        .map_err(|err| ApiError::from_error(err, format))?;
    Ok(Html(render_published(&published)).into_response())
}

async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    SubmissionBody(submission): SubmissionBody,
) -> Response {
    let session = state.session(&headers);
    let format = ResponseFormat::of(&headers);
    let response = publish_submission(&state, &session, submission, format).await;
    session.attach(response)
}

async fn publish_submission(
    state: &AppState,
    session: &Session,
    submission: Submission,
    format: ResponseFormat,
) -> ApiResult<Response> {
    let job = UploadJob::from_submission(submission, state.schedule_offset)
        .map_err(|err| ApiError::from_error(err, format))?;
    info!(job = %job.id, url = %job.source_url, "job accepted");

    let publisher = state.publisher.clone();
    let pending = job.clone();
    match blocking(move || publisher.run(&job)).await {
        Ok(published) => Ok(match format {
            ResponseFormat::Json => Json(published).into_response(),
            ResponseFormat::Html => Html(render_published(&published)).into_response(),
        }),
        Err(err) if err.is_auth_required() => {
            info!(job = %pending.id, "no usable credential; job waits for authorization");
            state.sessions.stash_job(&session.id, pending);
            Ok(Redirect::to("/authorize").into_response())
        }
        Err(err) => Err(ApiError::from_error(err, format)),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let broker = state.broker().clone();
    if let Err(err) = blocking(move || broker.revoke()).await {
        return ApiError::from_error(err, ResponseFormat::of(&headers)).into_response();
    }
    if let Some(id) = session_cookie(&headers).and_then(|value| state.signer.verify(value)) {
        state.sessions.remove(&id);
    }
    info!("credential revoked");
    Redirect::to("/").into_response()
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n{body}\n</body></html>\n",
        escape_html(title)
    )
}

fn render_index(phase: SessionPhase) -> String {
    let status = match phase {
        SessionPhase::Authenticated => {
            "<p>YouTube account connected. <a href=\"/logout\">Disconnect</a></p>"
        }
        SessionPhase::PendingCallback => {
            "<p>Waiting for Google to confirm access. <a href=\"/authorize\">Start again</a></p>"
        }
        SessionPhase::Unauthenticated => {
            "<p>No YouTube account connected. <a href=\"/authorize\">Connect</a></p>"
        }
    };
    let form = r#"<form method="post" action="/upload_video">
<p><label>Video URL <input name="url" type="url" required></label></p>
<p><label>Title <input name="title" maxlength="100"></label></p>
<p><label>Description <textarea name="description"></textarea></label></p>
<p><label>Tags (comma separated) <input name="tags"></label></p>
<p><label>Privacy <select name="privacy_status">
<option value="private">private</option>
<option value="unlisted">unlisted</option>
<option value="public">public</option>
</select></label></p>
<p><label>Category id <input name="category_id" value="22" pattern="[0-9]+"></label></p>
<p><label>Publish at (YYYY-MM-DD HH:MM) <input name="schedule_time" type="datetime-local"></label></p>
<p><label><input name="for_kids" type="checkbox" value="true"> Made for kids</label></p>
<p><button type="submit">Upload</button></p>
</form>"#;
    page("retube", &format!("<h1>retube</h1>\n{status}\n{form}"))
}

fn render_connected() -> String {
    page(
        "Connected",
        "<h1>Connected</h1>\n<p>Your YouTube account is connected. <a href=\"/\">Upload a video</a></p>",
    )
}

fn render_published(published: &Published) -> String {
    let schedule = match published.publish_at {
        Some(at) => format!(
            "<p>Scheduled to go public at {} UTC.</p>",
            at.format("%Y-%m-%d %H:%M")
        ),
        None => format!("<p>Visibility: {}.</p>", published.privacy),
    };
    let url = escape_html(&published.url);
    page(
        "Uploaded",
        &format!(
            "<h1>Uploaded</h1>\n<p>{} is on YouTube as <a href=\"{url}\">{}</a>.</p>\n{schedule}\n<p><a href=\"/\">Upload another</a></p>",
            escape_html(&published.title),
            escape_html(&published.video_id),
        ),
    )
}
