mod ui;

use askql::ChatSession;
use askql::config::{ClientConfig, DEFAULT_BASE_URL, default_log_path, resolve_token};
use askql::confirmation::DEFAULT_MAX_CONFIRMATION_ROUNDS;
use askql::session::{DEFAULT_MODEL, SessionConfig};
use askql::transcript::Mode;
use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "askql", version, about = "Ask questions about your data from the terminal")]
struct Cli {
    /// Backend base URL.
    #[arg(long, env = "ASKQL_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Bearer token; falls back to ~/.askql/token.
    #[arg(long, env = "ASKQL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "ASKQL_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long, env = "ASKQL_MODE", value_enum, default_value_t = Mode::Ask)]
    mode: Mode,

    /// Upper bound on chained confirmations within one answer.
    #[arg(long, env = "ASKQL_MAX_CONFIRMATION_ROUNDS", default_value_t = DEFAULT_MAX_CONFIRMATION_ROUNDS)]
    max_confirmation_rounds: u32,

    #[arg(long, env = "ASKQL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let log_path = cli.log_file.clone().unwrap_or_else(default_log_path);
    init_logging(&log_path)?;

    let config = ClientConfig {
        base_url: cli.base_url,
        token: resolve_token(cli.token),
        session: SessionConfig {
            mode: cli.mode,
            model: cli.model,
            max_confirmation_rounds: cli.max_confirmation_rounds,
        },
    };
    if config.token.is_none() {
        warn!("no auth token configured; requests are sent unauthenticated");
    }
    info!(base_url = %config.base_url, model = %config.session.model, "starting askql");

    let session = ChatSession::new(config.transport(), config.session.clone());
    ui::run_tui(session)
}

// Logs go to a file; the inline viewport owns the terminal.
fn init_logging(path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("askql=info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
