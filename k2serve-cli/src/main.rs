//! k2serve - streaming sequence classification over gRPC.

use anyhow::Result;
use clap::{Parser, Subcommand};
use k2serve_cli::config::{ClientConfig, EndpointConfig, ServerConfig};
use k2serve_cli::{client, server};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Streaming sequence classification server and client
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the classification server
    Serve(ServerConfig),

    /// Stream a sequence file to a server and print classifications
    Classify(ClientConfig),

    /// Fetch the cumulative summary from a server
    Summary(EndpointConfig),

    /// Ask a server to shut down gracefully
    Shutdown(EndpointConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; all diagnostics go to stderr so stdout stays
    // reserved for classification output.
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match cli.command {
        Commands::Serve(config) => server::run(config).await?,
        Commands::Classify(config) => client::run_classify(config).await?,
        Commands::Summary(config) => client::run_summary(config).await?,
        Commands::Shutdown(config) => client::run_shutdown(config).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
