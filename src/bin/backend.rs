#![forbid(unsafe_code)]

//! HTTP backend: receives uploaded videos, forwards them to Gemini and returns
//! the generated subtitles. Also serves the upload page from the web root.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use mp4titles::{
    config::{ConfigOverrides, load_config},
    gemini::GeminiClient,
    pipeline::SubtitlePipeline,
    scratch::{ScratchDir, ScratchStrategy},
    server::{AppState, HttpOptions, build_router},
    telemetry::init_tracing,
};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_LOG_FILTER: &str = "mp4titles=info,backend=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serves the subtitle API and the upload page")]
struct BackendArgs {
    /// TOML config file (defaults to ./mp4titles.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dotenv file read before the process environment.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    host: Option<IpAddr>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    www_root: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host,
            port: self.port,
            www_root: self.www_root,
            config_path: self.config,
            env_path: self.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing(DEFAULT_LOG_FILTER);

    let config = load_config(args.into_overrides()).context("loading configuration")?;
    let strategy = ScratchStrategy::for_config(&config);
    let scratch = ScratchDir::prepare(&strategy).with_context(|| {
        format!(
            "preparing scratch directory {}",
            strategy.directory().display()
        )
    })?;
    if !config.www_root.is_dir() {
        warn!(www_root = %config.www_root.display(), "web root missing; only the API is served");
    }

    let gemini = Arc::new(GeminiClient::new(&config.gemini));
    let pipeline = SubtitlePipeline::new(gemini.clone(), gemini);
    let scratch_path = scratch.path().display().to_string();
    let state = AppState::new(pipeline, scratch, config.www_root.clone());
    let app = build_router(state, &HttpOptions::from_config(&config))?;

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        environment = config.environment.as_str(),
        scratch = %scratch_path,
        origins = ?config.allowed_origins,
        model = %config.gemini.model,
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Only affects graceful shutdown; Ctrl+C still terminates the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!(%err, "failed to install Ctrl+C handler");
    }
}
