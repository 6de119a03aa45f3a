//! polybook CLI - Run polyglot notebook code blocks.

mod bridge;
mod colors;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use polybook_core::Config;

#[derive(Parser)]
#[command(name = "polybook")]
#[command(about = "Run polyglot notebook code blocks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a config.json overriding toolchain paths
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one source file as a code block
    Run {
        /// Path to the source file
        file: PathBuf,

        /// Language tag (inferred from the file extension by default)
        #[arg(short, long)]
        language: Option<String>,

        /// Use a throwaway interpreter instead of the shared session
        #[arg(long)]
        stateless: bool,
    },

    /// Serve JSON-lines messages over stdin/stdout
    Bridge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries program output and JSON lines.
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format polybook-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<polybook_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let config = Config::load(cli.config.as_deref()).map_err(|e| format_error(e.into()))?;

    match cli.command {
        Commands::Run {
            file,
            language,
            stateless,
        } => {
            run::execute(&file, language.as_deref(), stateless, config)
                .await
                .map_err(format_error)?;
        }

        Commands::Bridge => {
            bridge::execute(config).await.map_err(format_error)?;
        }
    }

    Ok(())
}
