use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flowboard::board::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "flowboard")]
#[command(version, about = "Agent-driven Kanban delivery board")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the board server
    Serve {
        #[arg(long, default_value = "4820")]
        port: u16,

        #[arg(long, default_value = ".flowboard/board.db")]
        db_path: PathBuf,

        /// Base URL of the agent runtime daemon
        #[arg(long, env = "FLOWBOARD_RUNTIME_URL", default_value = "http://127.0.0.1:4821")]
        runtime_url: String,

        /// Bearer token for the agent runtime
        #[arg(long, env = "FLOWBOARD_RUNTIME_TOKEN")]
        runtime_token: Option<String>,

        /// GitHub token used by the issue publisher
        #[arg(long, env = "GITHUB_TOKEN")]
        github_token: Option<String>,

        /// Bind on all interfaces and allow permissive CORS
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            runtime_url,
            runtime_token,
            github_token,
            dev,
        } => {
            start_server(ServerConfig {
                port,
                db_path,
                runtime_url,
                runtime_token,
                github_token,
                dev_mode: dev,
            })
            .await
        }
    }
}
