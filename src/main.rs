use anyhow::Result;
use clap::{Parser, Subcommand};
use quire::config::QuireConfig;
use quire::server;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quire", version, about = "Resilient MCP backend for writing assistance")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport unless configured otherwise)
    Serve {
        /// Serve Streamable HTTP instead of stdio
        #[arg(long)]
        http: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (for log level)
    let config = QuireConfig::load()?;

    // Initialize tracing with the configured log level.
    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter =
        EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { http } => {
            if http || config.server.transport == "http" {
                server::serve_http(config).await?;
            } else {
                server::serve_stdio(config).await?;
            }
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
