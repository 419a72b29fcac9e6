//! yt-dlp adapter.
//!
//! One call downloads one video to a fixed target path using a fixed format
//! policy: the best video stream at or below the configured height muxed with
//! the best audio, remuxed into mp4. The title yt-dlp reports after the final
//! move is returned alongside the path so the uploader can reuse it.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::{debug, info, warn};

use crate::config::DownloadSettings;
use crate::error::{Error, Result};
use crate::secrets::usable_cookie_jar;

const CONTAINER: &str = "mp4";
/// Lines of yt-dlp stderr quoted back in error messages.
const STDERR_TAIL_LINES: usize = 3;

/// Markers yt-dlp prints when content is gated behind a signed-in session.
const RESTRICTION_MARKERS: [&str; 4] = [
    "Sign in to confirm",
    "age-restricted",
    "not available in your country",
    "Private video",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    program: PathBuf,
    max_height: u32,
    cookies: PathBuf,
}

impl Downloader {
    pub fn new(settings: &DownloadSettings, cookies: impl Into<PathBuf>) -> Self {
        Self {
            program: settings.program.clone(),
            max_height: settings.max_height,
            cookies: cookies.into(),
        }
    }

    /// Runs `yt-dlp --version` to fail loudly when the binary is missing.
    pub fn ensure_available(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                Error::download(format!(
                    "{} is not runnable: {err}",
                    self.program.display()
                ))
            })?;
        if !output.status.success() {
            return Err(Error::download(format!(
                "{} --version exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn format_selector(&self) -> String {
        let h = self.max_height;
        format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]")
    }

    /// Downloads `url` to `target`, replacing whatever was there before.
    pub fn fetch(&self, url: &str, target: &Path) -> Result<Downloaded> {
        match fs::remove_file(target) {
            Ok(()) => debug!(path = %target.display(), "removed previous download"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut command = Command::new(&self.program);
        command
            .arg("--format")
            .arg(self.format_selector())
            .arg("--merge-output-format")
            .arg(CONTAINER)
            .arg("--remux-video")
            .arg(CONTAINER)
            .arg("--output")
            .arg(target)
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("--no-warnings")
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:title");

        if let Some(cookies) = usable_cookie_jar(&self.cookies) {
            command.arg("--cookies").arg(cookies);
        }
        command.arg("--").arg(url);

        info!(url, target = %target.display(), "starting download");
        let output = command
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                Error::download(format!(
                    "could not start {}: {err}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr_tail(&stderr);
            warn!(url, status = %output.status, "yt-dlp failed: {tail}");
            let hint = if RESTRICTION_MARKERS.iter().any(|m| stderr.contains(m)) {
                " (the video is restricted; configure a valid cookie jar)"
            } else {
                ""
            };
            return Err(Error::download(format!(
                "yt-dlp exited with {}: {tail}{hint}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let title = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .ok_or_else(|| Error::download("yt-dlp did not report a title"))?
            .to_string();

        let size = fs::metadata(target).map(|meta| meta.len()).unwrap_or(0);
        if size == 0 {
            return Err(Error::download(format!(
                "yt-dlp finished but {} is missing or empty",
                target.display()
            )));
        }

        info!(title = %title, bytes = size, "download finished");
        Ok(Downloaded {
            path: target.to_path_buf(),
            title,
        })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join(" | ");
    if tail.is_empty() {
        "no error output".to_string()
    } else {
        tail
    }
}
