//! YouTube Data API v3 resumable upload.
//!
//! The transfer takes two kinds of requests. A `POST` with the video
//! resource opens an upload session and returns its URI in `Location`; then
//! the file goes up in `PUT` chunks carrying `Content-Range`. The server
//! answers `308` with a `Range` header while bytes are still missing and
//! `200`/`201` with the created video once the last byte arrived. A transport
//! failure mid-chunk is followed by a status query (`bytes */<size>`) so the
//! next chunk resumes from what the server actually holds.

use std::{
    fmt,
    fs::{self, File},
    io::{Read, Seek, SeekFrom},
    path::Path,
    str::FromStr,
    time::Duration as StdDuration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::UploadSettings;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Private,
    Unlisted,
}

impl Privacy {
    pub fn as_str(self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Private => "private",
            Privacy::Unlisted => "unlisted",
        }
    }
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Privacy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Privacy::Public),
            "private" => Ok(Privacy::Private),
            "unlisted" => Ok(Privacy::Unlisted),
            other => Err(Error::invalid(format!(
                "privacy status must be public, private or unlisted, got {other:?}"
            ))),
        }
    }
}

/// Everything that goes into the `snippet` and `status` parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy: Privacy,
    pub made_for_kids: bool,
    pub publish_at: Option<DateTime<Utc>>,
}

impl VideoMetadata {
    pub fn to_resource(&self) -> Value {
        let mut status = json!({
            "privacyStatus": self.privacy.as_str(),
            "selfDeclaredMadeForKids": self.made_for_kids,
        });
        if let Some(publish_at) = self.publish_at {
            status["publishAt"] = Value::String(publish_at.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        json!({
            "snippet": {
                "title": self.title,
                "description": self.description,
                "tags": self.tags,
                "categoryId": self.category_id,
            },
            "status": status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.sent.min(self.total) * 100) / self.total) as u8
    }
}

#[derive(Debug, Default, Deserialize)]
struct GoogleErrorBody {
    #[serde(default)]
    error: Option<GoogleError>,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorItem {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: String,
}

/// Outcome of one chunk or status round.
enum ChunkReply {
    Incomplete { next_offset: u64 },
    Complete { video_id: String },
}

#[derive(Clone)]
pub struct Uploader {
    endpoint: String,
    chunk_size: usize,
    stall_budget: u32,
    agent: ureq::Agent,
}

impl Uploader {
    pub fn new(settings: &UploadSettings) -> Self {
        // 308 means "resume incomplete" here, never a redirect to follow.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(StdDuration::from_secs(15))
            .timeout_read(StdDuration::from_secs(300))
            .redirects(0)
            .build();
        Self {
            endpoint: settings.endpoint.clone(),
            chunk_size: settings.chunk_size.max(1),
            stall_budget: settings.stall_budget,
            agent,
        }
    }

    /// Uploads `path` and returns the id of the created video.
    pub fn publish(
        &self,
        access_token: &str,
        path: &Path,
        metadata: &VideoMetadata,
        mut progress: impl FnMut(UploadProgress),
    ) -> Result<String> {
        let total = match fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => return Err(Error::MissingMedia(path.to_path_buf())),
        };
        if metadata.publish_at.is_some() && metadata.privacy != Privacy::Private {
            return Err(Error::invalid(
                "scheduled videos must be uploaded as private",
            ));
        }
        let content_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");

        let session_uri = self.open_session(access_token, total, content_type, metadata)?;
        debug!("resumable session opened");

        let mut file = File::open(path)?;
        let chunk_count = total.div_ceil(self.chunk_size as u64);
        let max_rounds = chunk_count + u64::from(self.stall_budget);
        let mut offset = 0u64;
        let mut buf = Vec::with_capacity(self.chunk_size);

        for round in 0..max_rounds {
            let sent = if offset >= total {
                // Every byte is acknowledged but the video was not returned yet.
                self.query_status(&session_uri, total)
            } else {
                self.send_chunk(&session_uri, &mut file, &mut buf, offset, total, content_type)
            };
            let reply = match sent {
                Ok(reply) => reply,
                Err(ChunkError::Rejected(err)) => return Err(err),
                Err(ChunkError::Interrupted(reason)) => {
                    warn!(round, offset, "chunk interrupted ({reason}); querying upload status");
                    match self.query_status(&session_uri, total) {
                        Ok(reply) => reply,
                        Err(ChunkError::Rejected(err)) => return Err(err),
                        Err(ChunkError::Interrupted(reason)) => {
                            warn!(round, "status query failed: {reason}");
                            continue;
                        }
                    }
                }
            };

            match reply {
                ChunkReply::Complete { video_id } => {
                    progress(UploadProgress { sent: total, total });
                    info!(video_id = %video_id, bytes = total, "upload complete");
                    return Ok(video_id);
                }
                ChunkReply::Incomplete { next_offset } => {
                    if next_offset <= offset {
                        debug!(round, offset, "server acknowledged no new bytes");
                    }
                    offset = next_offset.min(total);
                    progress(UploadProgress { sent: offset, total });
                }
            }
        }

        Err(Error::upload(
            0,
            format!("upload did not complete after {max_rounds} rounds ({offset} of {total} bytes acknowledged)"),
        ))
    }

    fn open_session(
        &self,
        access_token: &str,
        total: u64,
        content_type: &str,
        metadata: &VideoMetadata,
    ) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint)
            .query("uploadType", "resumable")
            .query("part", "snippet,status")
            .set("Authorization", &format!("Bearer {access_token}"))
            .set("X-Upload-Content-Length", &total.to_string())
            .set("X-Upload-Content-Type", content_type)
            .send_json(metadata.to_resource());

        match response {
            Ok(response) if response.status() < 300 => response
                .header("Location")
                .map(str::to_string)
                .ok_or_else(|| Error::upload(response.status(), "no upload session URI in response")),
            Ok(response) => Err(Error::upload(
                response.status(),
                format!("unexpected response {}", response.status_text()),
            )),
            Err(ureq::Error::Status(status, response)) => Err(provider_error(status, response)),
            Err(ureq::Error::Transport(transport)) => Err(Error::upload(
                0,
                format!("could not open upload session: {transport}"),
            )),
        }
    }

    fn send_chunk(
        &self,
        session_uri: &str,
        file: &mut File,
        buf: &mut Vec<u8>,
        offset: u64,
        total: u64,
        content_type: &str,
    ) -> std::result::Result<ChunkReply, ChunkError> {
        let len = (total - offset).min(self.chunk_size as u64);
        buf.clear();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.by_ref().take(len).read_to_end(buf))
            .map_err(|err| ChunkError::Rejected(err.into()))?;
        if buf.len() as u64 != len {
            return Err(ChunkError::Rejected(Error::upload(
                0,
                "file changed size during upload",
            )));
        }
        let end = offset + len - 1;
        debug!(offset, end, total, "sending chunk");
        let response = self
            .agent
            .put(session_uri)
            .set("Content-Type", content_type)
            .set("Content-Range", &format!("bytes {offset}-{end}/{total}"))
            .send_bytes(buf.as_slice());
        interpret(response)
    }

    fn query_status(&self, session_uri: &str, total: u64) -> std::result::Result<ChunkReply, ChunkError> {
        let response = self
            .agent
            .put(session_uri)
            .set("Content-Range", &format!("bytes */{total}"))
            .send_bytes(&[]);
        interpret(response)
    }
}

enum ChunkError {
    /// The provider refused; not worth retrying.
    Rejected(Error),
    /// The request never got a complete answer.
    Interrupted(String),
}

fn interpret(
    response: std::result::Result<ureq::Response, ureq::Error>,
) -> std::result::Result<ChunkReply, ChunkError> {
    match response {
        Ok(response) if response.status() == 308 => {
            let next_offset = response
                .header("Range")
                .and_then(parse_range_end)
                .map_or(0, |end| end + 1);
            Ok(ChunkReply::Incomplete { next_offset })
        }
        Ok(response) if matches!(response.status(), 200 | 201) => {
            let status = response.status();
            let video: VideoResource = response.into_json().map_err(|err| {
                ChunkError::Rejected(Error::upload(status, format!("unreadable video resource: {err}")))
            })?;
            Ok(ChunkReply::Complete { video_id: video.id })
        }
        Ok(response) => Err(ChunkError::Rejected(Error::upload(
            response.status(),
            format!("unexpected response {}", response.status_text()),
        ))),
        Err(ureq::Error::Status(status, response)) if status >= 500 => {
            let err = provider_error(status, response);
            Err(ChunkError::Interrupted(err.to_string()))
        }
        Err(ureq::Error::Status(status, response)) => {
            Err(ChunkError::Rejected(provider_error(status, response)))
        }
        Err(ureq::Error::Transport(transport)) => Err(ChunkError::Interrupted(transport.to_string())),
    }
}

/// `Range: bytes=0-524287` → `524287`.
fn parse_range_end(header: &str) -> Option<u64> {
    header
        .trim()
        .strip_prefix("bytes=")?
        .split_once('-')?
        .1
        .trim()
        .parse()
        .ok()
}

fn provider_error(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    let parsed: GoogleErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = match parsed.error {
        Some(error) => {
            let reasons: Vec<&str> = error
                .errors
                .iter()
                .map(|item| item.reason.as_str())
                .filter(|reason| !reason.is_empty())
                .collect();
            if reasons.is_empty() {
                error.message
            } else {
                format!("{} ({})", error.message, reasons.join(", "))
            }
        }
        None if body.trim().is_empty() => "no error details".to_string(),
        None => body.trim().to_string(),
    };
    Error::upload(status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHUNK: usize = 256 * 1024;
    const SIZE: usize = 300_000;

    fn metadata() -> VideoMetadata {
        VideoMetadata {
            title: "A Title".into(),
            description: "desc".into(),
            tags: vec!["one".into(), "two".into()],
            category_id: "22".into(),
            privacy: Privacy::Private,
            made_for_kids: false,
            publish_at: None,
        }
    }

    fn uploader(endpoint: &str, stall_budget: u32) -> Uploader {
        Uploader::new(&UploadSettings {
            endpoint: endpoint.into(),
            chunk_size: CHUNK,
            stall_budget,
        })
    }

    fn video_file(size: usize) -> (TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        fs::write(&path, vec![7u8; size]).unwrap();
        (dir, path)
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(query_param("uploadType", "resumable"))
            .and(query_param("part", "snippet,status"))
            .and(header("X-Upload-Content-Length", "300000"))
            .and(header("X-Upload-Content-Type", "video/mp4"))
            .and(header("Authorization", "Bearer ya29.token"))
            .and(body_partial_json(json!({
                "snippet": { "title": "A Title", "categoryId": "22" },
                "status": { "privacyStatus": "private" }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Location", format!("{}/session/1", server.uri()).as_str()),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    async fn run_publish(
        uploader: Uploader,
        path: std::path::PathBuf,
        metadata: VideoMetadata,
    ) -> (Result<String>, Vec<UploadProgress>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let result = tokio::task::spawn_blocking(move || {
            uploader.publish("ya29.token", &path, &metadata, |p| sink.lock().unwrap().push(p))
        })
        .await
        .unwrap();
        let seen = seen.lock().unwrap().clone();
        (result, seen)
    }

    #[test]
    fn resource_contains_schedule_and_flags() {
        let mut meta = metadata();
        meta.publish_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 4, 30, 0).unwrap());
        meta.made_for_kids = true;
        let resource = meta.to_resource();
        assert_eq!(resource["snippet"]["title"], "A Title");
        assert_eq!(resource["snippet"]["categoryId"], "22");
        assert_eq!(resource["snippet"]["tags"], json!(["one", "two"]));
        assert_eq!(resource["status"]["privacyStatus"], "private");
        assert_eq!(resource["status"]["selfDeclaredMadeForKids"], true);
        assert_eq!(resource["status"]["publishAt"], "2024-01-01T04:30:00Z");
        assert!(metadata().to_resource()["status"].get("publishAt").is_none());
    }

    #[test]
    fn privacy_parsing() {
        assert_eq!(" Unlisted ".parse::<Privacy>().unwrap(), Privacy::Unlisted);
        assert!("friends".parse::<Privacy>().is_err());
    }

    #[test]
    fn range_header_parsing() {
        assert_eq!(parse_range_end("bytes=0-262143"), Some(262_143));
        assert_eq!(parse_range_end("0-10"), None);
        assert_eq!(parse_range_end("bytes=0-"), None);
    }

    #[test]
    fn progress_percent_is_clamped() {
        assert_eq!(UploadProgress { sent: 50, total: 200 }.percent(), 25);
        assert_eq!(UploadProgress { sent: 300, total: 200 }.percent(), 100);
        assert_eq!(UploadProgress { sent: 0, total: 0 }.percent(), 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_or_empty_file_fails_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.mp4");
        let (result, seen) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), missing, metadata()).await;
        assert!(matches!(result, Err(Error::MissingMedia(_))));
        assert!(seen.is_empty());

        let (_dir, empty) = video_file(0);
        let (result, _) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), empty, metadata()).await;
        assert!(matches!(result, Err(Error::MissingMedia(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduled_public_upload_is_refused_locally() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let (_dir, file) = video_file(SIZE);
        let mut meta = metadata();
        meta.privacy = Privacy::Public;
        meta.publish_at = Some(Utc::now());
        let (result, _) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), file, meta).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uploads_in_chunks_and_reports_progress() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(header("Content-Range", "bytes 0-262143/300000"))
            .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-262143"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(header("Content-Range", "bytes 262144-299999/300000"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "vid123" })))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = video_file(SIZE);
        let (result, seen) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), file, metadata()).await;
        assert_eq!(result.unwrap(), "vid123");
        assert_eq!(
            seen,
            vec![
                UploadProgress { sent: 262_144, total: 300_000 },
                UploadProgress { sent: 300_000, total: 300_000 },
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resumes_from_acknowledged_offset() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(header("Content-Range", "bytes 0-262143/300000"))
            .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-99999"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(header("Content-Range", "bytes 100000-299999/300000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "resumed" })))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = video_file(SIZE);
        let (result, _) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), file, metadata()).await;
        assert_eq!(result.unwrap(), "resumed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_chunk_carries_provider_detail() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "code": 403,
                    "message": "The request cannot be completed because you have exceeded your quota.",
                    "errors": [{ "reason": "quotaExceeded" }]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = video_file(SIZE);
        let (result, _) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), file, metadata()).await;
        match result {
            Err(Error::Upload { status, message }) => {
                assert_eq!(status, 403);
                assert!(message.contains("quotaExceeded"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_session_is_upload_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "code": 401, "message": "Invalid Credentials", "errors": [] }
            })))
            .mount(&server)
            .await;

        let (_dir, file) = video_file(SIZE);
        let (result, _) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), file, metadata()).await;
        assert!(matches!(
            result,
            Err(Error::Upload { status: 401, ref message }) if message == "Invalid Credentials"
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_upload_gives_up_after_budget() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .respond_with(ResponseTemplate::new(308))
            .expect(4)
            .mount(&server)
            .await;

        let (_dir, file) = video_file(SIZE);
        let (result, seen) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 2), file, metadata()).await;
        assert!(matches!(result, Err(Error::Upload { status: 0, .. })));
        assert!(seen.iter().all(|p| p.sent == 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_error_triggers_status_query() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(header("Content-Range", "bytes 0-262143/300000"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(header("Content-Range", "bytes */300000"))
            .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-262143"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(header("Content-Range", "bytes 262144-299999/300000"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "after-retry" })))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = video_file(SIZE);
        let (result, _) =
            run_publish(uploader(&format!("{}/upload", server.uri()), 3), file, metadata()).await;
        assert_eq!(result.unwrap(), "after-retry");
    }
}
