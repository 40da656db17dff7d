//! # tether
//!
//! Binary entry point for the Tether session supervisor.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Logging setup (stderr, or a file via `TETHER_LOG_FILE`)
//! - `tether serve`: NDJSON bridge between stdio and the supervisor
//! - `tether run`: start one session, then serve until it ends
//! - `tether config`: print the effective configuration

mod bridge;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_adapters::SessionSupervisor;
use tether_core::{DEFAULT_CONFIG_FILE, JsonFileResumeStore, TetherConfig};
use tether_proto::{ImageAttachment, PermissionMode, StartOptions, UiCommand};
use tokio::io::BufReader;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read commands from stdin and write session events to stdout, one JSON object per line
    Serve,

    /// Start a session, then serve until it ends
    Run(RunArgs),

    /// Print the effective configuration as YAML
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Initial prompt
    prompt: Option<String>,

    /// Session id used in emitted events
    #[arg(short, long, default_value = "main")]
    session: String,

    /// Model to request from the agent
    #[arg(short, long)]
    model: Option<String>,

    /// Working directory for the agent and approved tool calls
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Permission mode: bypass, supervised or plan
    #[arg(long, value_parser = clap::value_parser!(PermissionMode))]
    mode: Option<PermissionMode>,

    /// Resume a specific agent conversation
    #[arg(long, conflicts_with = "continue_last")]
    resume: Option<String>,

    /// Resume this session's last stored conversation
    #[arg(long = "continue")]
    continue_last: bool,

    /// Image to attach to the initial prompt (repeatable)
    #[arg(long = "image", value_name = "PATH", requires = "prompt")]
    images: Vec<PathBuf>,

    /// Extra system prompt text
    #[arg(long)]
    append_system_prompt: Option<String>,

    /// MCP server config file passed to the agent
    #[arg(long)]
    mcp_config: Option<PathBuf>,
}

impl RunArgs {
    fn into_start(self) -> Result<(String, StartOptions)> {
        let images = self
            .images
            .iter()
            .map(|path| load_image(path))
            .collect::<Result<Vec<_>>>()?;
        let options = StartOptions {
            model: self.model,
            cwd: self.cwd,
            permission_mode: self.mode,
            prompt: self.prompt,
            resume_id: self.resume,
            continue_last: self.continue_last,
            images,
            append_system_prompt: self.append_system_prompt,
            mcp_config: self.mcp_config,
        };
        Ok((self.session, options))
    }
}

fn load_image(path: &Path) -> Result<ImageAttachment> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let Some(media_type) = ImageAttachment::media_type_for_extension(ext) else {
        bail!("Unsupported image type: {}", path.display());
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(ImageAttachment::from_bytes(media_type, &bytes))
}

/// Logs go to stderr, or to `TETHER_LOG_FILE` when set; stdout carries events.
fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    if let Ok(path) = std::env::var("TETHER_LOG_FILE") {
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file {path}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = TetherConfig::load(&cli.config)?;

    match cli.command {
        Commands::Config => {
            print!(
                "{}",
                serde_yaml::to_string(&config).context("Failed to render config")?
            );
            Ok(())
        }
        Commands::Serve => serve(config, None).await,
        Commands::Run(args) => {
            let (session_id, options) = args.into_start()?;
            serve(config, Some(UiCommand::Start { session_id, options })).await
        }
    }
}

async fn serve(config: TetherConfig, initial: Option<UiCommand>) -> Result<()> {
    let store = JsonFileResumeStore::open(&config.store.resume_file).with_context(|| {
        format!(
            "Failed to open resume store {}",
            config.store.resume_file.display()
        )
    })?;
    info!(
        agent = %config.agent.command,
        store = %store.path().display(),
        "Tether ready"
    );

    let (supervisor, events) = SessionSupervisor::new(config, Arc::new(store));

    let exit_with = match initial {
        Some(UiCommand::Start {
            session_id,
            options,
        }) => {
            // A spawn failure still goes out as session:error below.
            if let Err(e) = supervisor.start(&session_id, options).await {
                tracing::error!("{e}");
            }
            Some(session_id)
        }
        _ => None,
    };

    let stdin = BufReader::new(tokio::io::stdin());
    bridge::serve(supervisor, events, stdin, tokio::io::stdout(), exit_with).await
}
