#![forbid(unsafe_code)]

//! Web server that downloads a video URL and re-uploads it to the connected
//! YouTube account.

use std::{fs, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use retube_tools::{
    config::{DEFAULT_CONFIG_PATH, Settings, load_settings},
    credential::TokenStore,
    downloader::Downloader,
    secrets::materialize,
    security::ensure_not_root,
    server::{AppState, router},
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const PROCESS_NAME: &str = "retube";
const DEFAULT_LOG_FILTER: &str = "retube=info,retube_tools=info";

#[derive(Parser, Debug)]
#[command(author, version, about = "Download videos and re-upload them to YouTube.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web server (the default)
    Serve,
    /// Print the stored credential as a TOKEN_B64 line for another deployment
    ExportToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut settings = load_settings(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    materialize(&mut settings).context("writing secrets from the environment")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::ExportToken => export_token(&settings),
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(env_filter)
            .init();
    }
}

async fn serve(settings: Settings) -> Result<()> {
    ensure_not_root(PROCESS_NAME)?;
    settings.oauth.ensure_complete()?;
    if settings.uses_default_secret() {
        warn!("SECRET_KEY is unset or the placeholder; session cookies can be forged");
    }

    let version = Downloader::new(&settings.download, &settings.paths.cookies_file)
        .ensure_available()
        .context("checking yt-dlp")?;
    info!(version = %version, "yt-dlp available");

    fs::create_dir_all(&settings.paths.work_dir).with_context(|| {
        format!("creating work dir {}", settings.paths.work_dir.display())
    })?;

    let addr = SocketAddr::new(
        settings
            .host
            .parse()
            .with_context(|| format!("invalid HOST {:?}", settings.host))?,
        settings.port,
    );
    let app = router(AppState::from_settings(&settings));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    info!("server stopped");
    Ok(())
}

fn export_token(settings: &Settings) -> Result<()> {
    let store = TokenStore::new(&settings.paths.token_file);
    let Some(credential) = store.load()? else {
        bail!(
            "no credential stored at {}; connect an account first",
            store.path().display()
        );
    };
    println!("TOKEN_B64={}", credential.to_env_blob()?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}
