//! Sequences one job: credential check, download, upload, cleanup.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::downloader::Downloader;
use crate::error::Result;
use crate::job::UploadJob;
use crate::oauth::OAuthBroker;
use crate::session::JobPhase;
use crate::upload::{Privacy, UploadProgress, Uploader};

const DOWNLOADS_SUBDIR: &str = "downloads";

/// What the user gets back once a video is on YouTube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub video_id: String,
    pub title: String,
    pub url: String,
    pub privacy: Privacy,
    pub publish_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Publisher {
    downloader: Downloader,
    broker: OAuthBroker,
    uploader: Uploader,
    work_dir: PathBuf,
}

impl Publisher {
    pub fn new(
        downloader: Downloader,
        broker: OAuthBroker,
        uploader: Uploader,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            downloader,
            broker,
            uploader,
            work_dir: work_dir.into(),
        }
    }

    pub fn broker(&self) -> &OAuthBroker {
        &self.broker
    }

    /// Where the job's download lands. One file per job, so concurrent jobs
    /// never share a path.
    pub fn download_path(&self, job: &UploadJob) -> PathBuf {
        self.work_dir
            .join(DOWNLOADS_SUBDIR)
            .join(format!("{}.mp4", job.id))
    }

    /// Runs `job` to completion. Fails with `AuthRequired` before anything is
    /// downloaded when no usable credential exists.
    pub fn run(&self, job: &UploadJob) -> Result<Published> {
        self.broker.credential()?;

        let target = self.download_path(job);
        let _cleanup = RemoveOnDrop(&target);

        log_phase(job, JobPhase::Downloading);
        let downloaded = self
            .downloader
            .fetch(&job.source_url, &target)
            .inspect_err(|err| fail(job, err))?;

        // A long download can outlive the access token.
        let credential = self.broker.credential().inspect_err(|err| fail(job, err))?;
        let metadata = job.metadata(&downloaded.title);

        log_phase(job, JobPhase::Uploading);
        let mut reported = 0u8;
        let video_id = self
            .uploader
            .publish(&credential.token, &downloaded.path, &metadata, |progress: UploadProgress| {
                let percent = progress.percent();
                if percent >= reported.saturating_add(25) || percent == 100 {
                    reported = percent;
                    debug!(job = %job.id, percent, "upload progress");
                }
            })
            .inspect_err(|err| fail(job, err))?;

        log_phase(job, JobPhase::Done);
        Ok(Published {
            url: format!("https://www.youtube.com/watch?v={video_id}"),
            video_id,
            title: metadata.title,
            privacy: metadata.privacy,
            publish_at: metadata.publish_at,
        })
    }
}

fn log_phase(job: &UploadJob, phase: JobPhase) {
    info!(job = %job.id, url = %job.source_url, phase = phase.as_str(), "job phase");
}

fn fail(job: &UploadJob, err: &crate::error::Error) {
    warn!(job = %job.id, phase = JobPhase::Failed.as_str(), "job failed: {err}");
}

struct RemoveOnDrop<'a>(&'a Path);

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.0)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.0.display(), "could not remove download: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OAuthSettings, SCOPES, UploadSettings, parse_utc_offset};
    use crate::credential::{TokenStore, sample_credential};
    use crate::downloader::tests::stub_downloader;
    use crate::error::Error;
    use crate::job::Submission;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publisher(dir: &TempDir, upload_endpoint: &str, with_credential: bool) -> Publisher {
        let store = TokenStore::new(dir.path().join("token.json"));
        if with_credential {
            store.save(&sample_credential()).unwrap();
        }
        let broker = OAuthBroker::new(
            OAuthSettings {
                client_id: "client-id".into(),
                client_secret: "client-secret".into(),
                redirect_uri: "https://app.example/oauth2callback".into(),
                auth_uri: "https://accounts.example/o/oauth2/auth".into(),
                token_uri: "https://accounts.example/token".into(),
                revoke_uri: "https://accounts.example/revoke".into(),
                scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
            },
            store,
        );
        let uploader = Uploader::new(&UploadSettings {
            endpoint: upload_endpoint.into(),
            chunk_size: 256 * 1024,
            stall_budget: 2,
        });
        Publisher::new(stub_downloader(dir.path()), broker, uploader, dir.path().join("work"))
    }

    fn job(url: &str) -> UploadJob {
        let submission = Submission {
            url: url.into(),
            tags: vec!["clip".into()],
            ..Submission::default()
        };
        UploadJob::from_submission(submission, parse_utc_offset("+05:30").unwrap()).unwrap()
    }

    async fn mount_upload(server: &MockServer, final_status: u16, body: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Location", format!("{}/session/9", server.uri()).as_str()),
            )
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/9"))
            .respond_with(ResponseTemplate::new(final_status).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_job_returns_video_and_cleans_up() {
        let server = MockServer::start().await;
        mount_upload(&server, 200, json!({ "id": "vid123" })).await;
        let dir = tempdir().unwrap();
        let publisher = publisher(&dir, &format!("{}/upload", server.uri()), true);
        let job = job("https://youtube.com/shorts/abc");
        let target = publisher.download_path(&job);

        let published = tokio::task::spawn_blocking(move || publisher.run(&job))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.video_id, "vid123");
        assert_eq!(published.title, "Stub Title");
        assert_eq!(published.url, "https://www.youtube.com/watch?v=vid123");
        assert_eq!(published.privacy, Privacy::Private);
        assert!(!target.exists());

        let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(args.lines().any(|line| line == "https://youtube.com/watch?v=abc"));
    }

    #[test]
    fn missing_credential_fails_before_download() {
        let dir = tempdir().unwrap();
        let publisher = publisher(&dir, "http://127.0.0.1:9/upload", false);
        let err = publisher.run(&job("https://www.youtube.com/watch?v=abc")).unwrap_err();
        assert!(err.is_auth_required());
        assert!(!dir.path().join("args.txt").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_failure_skips_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let publisher = publisher(&dir, &format!("{}/upload", server.uri()), true);
        let job = job("https://example.com/broken");

        let err = tokio::task::spawn_blocking(move || publisher.run(&job))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Download(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_upload_still_removes_download() {
        let server = MockServer::start().await;
        mount_upload(
            &server,
            403,
            json!({ "error": { "code": 403, "message": "quotaExceeded" } }),
        )
        .await;
        let dir = tempdir().unwrap();
        let publisher = publisher(&dir, &format!("{}/upload", server.uri()), true);
        let job = job("https://www.youtube.com/watch?v=abc");
        let target = publisher.download_path(&job);

        let err = tokio::task::spawn_blocking(move || publisher.run(&job))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Upload { status: 403, .. }));
        assert!(!target.exists());
    }
}
