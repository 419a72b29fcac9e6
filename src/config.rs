use anyhow::{Context, Result, anyhow, bail};
use chrono::FixedOffset;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/retube-env";
pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_WORK_DIR: &str = "./data";
pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_REVOKE_URI: &str = "https://oauth2.googleapis.com/revoke";
pub const DEFAULT_UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/youtube/v3/videos";
pub const DEFAULT_SCHEDULE_OFFSET: &str = "+05:30";
pub const DEFAULT_MAX_HEIGHT: u32 = 720;
pub const DEFAULT_CHUNK_MB: usize = 8;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
pub const DEFAULT_CATEGORY_ID: &str = "22";
pub const INSECURE_SECRET_KEY: &str = "change_this_secret";
pub const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/youtube.force-ssl",
];

const TOKEN_FILE: &str = "token.json";
const COOKIES_FILE: &str = "cookies.txt";
const CLIENT_SECRET_FILE: &str = "client_secret.json";
/// Resumable chunks must be multiples of 256 KiB.
const CHUNK_GRANULARITY: usize = 256 * 1024;

/// Raw `KEY=value` pairs, first from the config file and then from the
/// process environment.
pub type EnvConfig = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub revoke_uri: String,
    pub scopes: Vec<String>,
}

impl OAuthSettings {
    /// Every field is required once the client secret blob (if any) has been
    /// applied.
    pub fn ensure_complete(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("GOOGLE_CLIENT_ID", &self.client_id),
            ("GOOGLE_CLIENT_SECRET", &self.client_secret),
            ("GOOGLE_REDIRECT_URI", &self.redirect_uri),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(key, _)| key)
        .collect();
        if !missing.is_empty() {
            bail!("missing OAuth settings: {}", missing.join(", "));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub work_dir: PathBuf,
    pub token_file: PathBuf,
    pub cookies_file: PathBuf,
    pub client_secret_file: PathBuf,
}

/// Base64 blobs that get written to disk before anything else starts.
#[derive(Debug, Clone, Default)]
pub struct SecretBlobs {
    pub client_secret: Option<String>,
    pub cookies: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub program: PathBuf,
    pub max_height: u32,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub endpoint: String,
    pub chunk_size: usize,
    /// Chunk rounds that may pass without the server acknowledging new bytes.
    pub stall_budget: u32,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub session_secret: String,
    pub session_ttl: Duration,
    pub schedule_offset: FixedOffset,
    pub oauth: OAuthSettings,
    pub paths: RuntimePaths,
    pub blobs: SecretBlobs,
    pub download: DownloadSettings,
    pub upload: UploadSettings,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(Some(parse_env_lines(&content)))
}

fn parse_env_lines(content: &str) -> EnvConfig {
    let mut cfg = EnvConfig::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.insert(key.trim().to_string(), value.to_string());
        }
    }
    cfg
}

/// Loads the optional config file and overlays the process environment.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let mut cfg = read_env_config(path)?.unwrap_or_default();
    cfg.extend(std::env::vars());
    Settings::from_env(&cfg)
}

impl Settings {
    pub fn from_env(cfg: &EnvConfig) -> Result<Self> {
        let get = |key: &str| {
            cfg.get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let port = match get("PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("Parsing PORT value {value:?}"))?,
            None => DEFAULT_PORT,
        };
        let host = get("HOST").unwrap_or(DEFAULT_HOST).to_string();

        let work_dir = PathBuf::from(get("RETUBE_WORK_DIR").unwrap_or(DEFAULT_WORK_DIR));
        let paths = RuntimePaths {
            token_file: get("TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| work_dir.join(TOKEN_FILE)),
            cookies_file: get("COOKIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| work_dir.join(COOKIES_FILE)),
            client_secret_file: get("CLIENT_SECRET_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| work_dir.join(CLIENT_SECRET_FILE)),
            work_dir,
        };

        let oauth = OAuthSettings {
            client_id: get("GOOGLE_CLIENT_ID").unwrap_or_default().to_string(),
            client_secret: get("GOOGLE_CLIENT_SECRET").unwrap_or_default().to_string(),
            redirect_uri: get("GOOGLE_REDIRECT_URI").unwrap_or_default().to_string(),
            auth_uri: get("GOOGLE_AUTH_URI").unwrap_or(DEFAULT_AUTH_URI).to_string(),
            token_uri: get("GOOGLE_TOKEN_URI").unwrap_or(DEFAULT_TOKEN_URI).to_string(),
            revoke_uri: get("GOOGLE_REVOKE_URI")
                .unwrap_or(DEFAULT_REVOKE_URI)
                .to_string(),
            scopes: SCOPES.iter().map(|scope| scope.to_string()).collect(),
        };

        let blobs = SecretBlobs {
            client_secret: get("CLIENT_SECRET_B64").map(str::to_string),
            cookies: get("COOKIES_B64").map(str::to_string),
            token: get("TOKEN_B64").map(str::to_string),
        };

        let max_height = match get("MAX_HEIGHT") {
            Some(value) => value
                .parse::<u32>()
                .with_context(|| format!("Parsing MAX_HEIGHT value {value:?}"))?,
            None => DEFAULT_MAX_HEIGHT,
        };
        let download = DownloadSettings {
            program: PathBuf::from(get("YTDLP_PATH").unwrap_or("yt-dlp")),
            max_height,
        };

        let chunk_mb = match get("UPLOAD_CHUNK_MB") {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("Parsing UPLOAD_CHUNK_MB value {value:?}"))?,
            None => DEFAULT_CHUNK_MB,
        };
        if chunk_mb == 0 {
            bail!("UPLOAD_CHUNK_MB must be at least 1");
        }
        let upload = UploadSettings {
            endpoint: get("UPLOAD_ENDPOINT")
                .unwrap_or(DEFAULT_UPLOAD_ENDPOINT)
                .to_string(),
            chunk_size: chunk_mb * 4 * CHUNK_GRANULARITY,
            stall_budget: 5,
        };

        let session_ttl = match get("SESSION_TTL_SECS") {
            Some(value) => Duration::from_secs(
                value
                    .parse::<u64>()
                    .with_context(|| format!("Parsing SESSION_TTL_SECS value {value:?}"))?,
            ),
            None => Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        };

        let schedule_offset =
            parse_utc_offset(get("SCHEDULE_UTC_OFFSET").unwrap_or(DEFAULT_SCHEDULE_OFFSET))?;

        Ok(Self {
            host,
            port,
            session_secret: get("SECRET_KEY").unwrap_or(INSECURE_SECRET_KEY).to_string(),
            session_ttl,
            schedule_offset,
            oauth,
            paths,
            blobs,
            download,
            upload,
        })
    }

    pub fn uses_default_secret(&self) -> bool {
        self.session_secret == INSECURE_SECRET_KEY
    }
}

/// Parses `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("invalid UTC offset"));
    }
    let (sign, rest) = match value.as_bytes().first() {
        Some(b'+') => (1, &value[1..]),
        Some(b'-') => (-1, &value[1..]),
        _ => bail!("UTC offset {value:?} must start with + or -"),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => match (rest.get(..2), rest.get(2..)) {
            (Some(h), Some(m)) => (h, m),
            _ => bail!("UTC offset {value:?} is not of the form +HHMM"),
        },
        None => (rest, "0"),
    };
    let hours: i32 = hours
        .parse()
        .with_context(|| format!("Parsing hours of UTC offset {value:?}"))?;
    let minutes: i32 = minutes
        .parse()
        .with_context(|| format!("Parsing minutes of UTC offset {value:?}"))?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        bail!("UTC offset {value:?} out of range");
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("UTC offset {value:?} out of range"))
}
