//! rendr command line entry point.
//!
//! Renders a single URL with the same engine the MCP server uses. The body goes
//! to stdout or `--output`, the status line and logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rendr_client::{BrowserLifecycleManager, ChromiumDriver, RenderCoordinator, default_pipeline};
use rendr_core::{AppConfig, CacheDb, RenderOptions, RenderResponse, RenderType};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rendr", about = "Render JavaScript-heavy pages in a headless browser", version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a URL and write the result.
    Render(RenderArgs),

    /// Print the effective configuration as JSON.
    Config,
}

#[derive(Debug, clap::Args)]
struct RenderArgs {
    /// The URL to render.
    url: String,

    /// Output format: html, png, jpeg or pdf.
    #[arg(long = "type", default_value = "html")]
    render_type: RenderType,

    /// Viewport width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Viewport height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// User-Agent override.
    #[arg(long)]
    user_agent: Option<String>,

    /// Follow redirects of the page instead of returning them.
    #[arg(long)]
    follow_redirects: bool,

    /// Budget for the page to signal readiness in milliseconds.
    #[arg(long)]
    js_timeout_ms: Option<u64>,

    /// Quiet period after the last request before the network counts as idle.
    #[arg(long)]
    wait_after_last_request_ms: Option<u64>,

    /// Write the body here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl RenderArgs {
    fn options(&self) -> RenderOptions {
        RenderOptions {
            render_type: self.render_type,
            width: self.width,
            height: self.height,
            user_agent: self.user_agent.clone(),
            follow_redirects: self.follow_redirects.then_some(true),
            js_timeout_ms: self.js_timeout_ms,
            wait_after_last_request_ms: self.wait_after_last_request_ms,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = AppConfig::load()?;
    match cli.command {
        Commands::Render(args) => render(config, args).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn render(config: AppConfig, args: RenderArgs) -> Result<ExitCode> {
    let config = Arc::new(config);
    let cache = CacheDb::from_config(&config).await?;

    let driver = Arc::new(ChromiumDriver::from_config(&config));
    let lifecycle = BrowserLifecycleManager::from_config(driver, &config);
    lifecycle.start().await.context("failed to start the browser")?;

    let pipeline = default_pipeline(&config, cache);
    let coordinator = RenderCoordinator::new(config, lifecycle.clone(), pipeline);

    tracing::info!(url = %args.url, render_type = %args.render_type, "Rendering");
    let response = coordinator.render(&args.url, args.options()).await;
    lifecycle.shutdown().await;

    eprintln!("{}", status_line(&response));
    match &args.output {
        Some(path) => tokio::fs::write(path, &response.body)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&response.body).await?;
            stdout.flush().await?;
        }
    }

    Ok(if response.status_code >= 400 { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn status_line(response: &RenderResponse) -> String {
    let mut line = format!("{} {} ({} ms)", response.status_code, response.render_type.as_str(), response.render_ms);
    if let Some(location) = response.header("location") {
        line.push_str(&format!(" -> {location}"));
    }
    if !response.errors.is_empty() {
        let tags: Vec<&str> = response.errors.iter().map(|t| t.as_str()).collect();
        line.push_str(&format!(" [{}]", tags.join(", ")));
    }
    line
}
