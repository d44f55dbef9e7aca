// ABOUTME: Command-line entry point: runs the tool server or inspects stored watermarks
// ABOUTME: Initializes logging, loads config, picks the connection provider, and opens the SQLite store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use parley::config::Config;
use parley::{platform, server};
use parley_core::{SqliteWatermarkStore, WatermarkStore};

/// Parley - lets AI agents wait for, catch up on, and send chat messages
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP tool server (default)
    Serve,

    /// Inspect stored read watermarks
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
}

#[derive(Subcommand, Debug)]
enum WatermarkAction {
    /// Show the watermark for one scope key (`<identity>:<channel_id>`)
    Show {
        #[arg(value_name = "SCOPE")]
        scope: String,
    },
    /// List every stored watermark
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before the process goes down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\nPANIC! parley crashed:\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    init_logging(cli.log_json);

    dotenvy::dotenv().ok();
    let config = Config::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Watermark { action } => run_watermark(&config, action),
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_server(config: Config) -> Result<()> {
    tracing::info!(
        provider = %config.provider.kind,
        data_dir = %config.data_dir().display(),
        fallback_window = config.backlog.fallback_window,
        max_timeout_secs = config.waiter.max_timeout_secs,
        "Configuration loaded"
    );

    let provider = platform::create_provider(&config)?;
    let store = SqliteWatermarkStore::open(config.data_dir())
        .context("Failed to open watermark store")?;
    tracing::info!(data_dir = %config.data_dir().display(), "Watermark store initialized");

    server::serve(config, provider, Arc::new(store)).await
}

fn run_watermark(config: &Config, action: WatermarkAction) -> Result<()> {
    let store = SqliteWatermarkStore::open(config.data_dir())
        .context("Failed to open watermark store")?;

    match action {
        WatermarkAction::Show { scope } => match store.load(&scope)? {
            Some(id) => println!("{} {}", scope, id),
            None => println!("{} (no watermark)", scope),
        },
        WatermarkAction::List => {
            let records = store.list()?;
            if records.is_empty() {
                println!("No watermarks stored in {}", config.data_dir().display());
            }
            for record in records {
                println!(
                    "{}\t{}\t{}",
                    record.scope_key, record.last_seen_id, record.updated_at
                );
            }
        }
    }
    Ok(())
}
