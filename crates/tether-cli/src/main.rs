//! Tether CLI - run statements against a SQLite database through the
//! tether data-access core and print the results as JSON.

mod commands;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use commands::{ExecCommand, TablesCommand};
use settings::CliConfig;
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TETHER_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "TETHER_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "TETHER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a statement and print the resulting rows
    Exec(ExecCommand),
    /// List the tables of a database
    Tables(TablesCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.clone();

    // RUST_LOG wins when set; otherwise the tether crates log at --log-level
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::EnvFilter::try_from_default_env()
            .map_err(|e| anyhow::anyhow!("Invalid RUST_LOG environment variable: {}", e))?,
        Err(_) => tracing_subscriber::EnvFilter::new(format!(
            "tether={level},\
             tether_query={level},\
             tether_query_sqlite={level}",
            level = log_level
        )),
    };

    let fmt_layer = match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer() // "compact" or any other value
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {}", e))?;

    let config = CliConfig::load(cli.config.as_deref())?;
    commands::audit::install(&tether_query::EventBus::global());

    match cli.command {
        Commands::Exec(exec_cmd) => exec_cmd.execute(config),
        Commands::Tables(tables_cmd) => tables_cmd.execute(config),
    }
}
