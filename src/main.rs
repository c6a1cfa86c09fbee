//! ark-relay - Streaming HTTP relay for hosted chat-completion models
//!
//! Serves a single endpoint that forwards prompts to the upstream model and
//! relays the answer as JSON or as an event stream.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ark_relay::completion::{write_answer, CompletionClient};
use ark_relay::config::Config;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ark-relay")]
#[command(about = "Streaming HTTP relay for hosted chat-completion models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args)]
struct CommonArgs {
    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra dotenv file loaded after `.env`
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        #[command(flatten)]
        common: CommonArgs,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Send one prompt to the model and print the answer
    Ask {
        #[command(flatten)]
        common: CommonArgs,

        /// The prompt to send
        prompt: String,

        /// Print fragments as they arrive
        #[arg(short, long)]
        stream: bool,

        /// Override the system prompt
        #[arg(long)]
        system: Option<String>,
    },

    /// Report which upstream settings are configured
    Check {
        #[command(flatten)]
        common: CommonArgs,
    },
}

impl Commands {
    fn common(&self) -> &CommonArgs {
        match self {
            Commands::Serve { common, .. } => common,
            Commands::Ask { common, .. } => common,
            Commands::Check { common } => common,
        }
    }
}

/// Load `.env` from the working directory, then an optional extra file.
///
/// Variables already present in the process environment are never overridden.
fn load_env_files(extra: Option<&Path>) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    if let Some(path) = extra {
        dotenvy::from_path(path)
            .with_context(|| format!("Failed to load env file '{}'", path.display()))?;
    }
    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let common = cli.command.common();
    load_env_files(common.env_file.as_deref())?;
    let mut config = Config::load(common.config.as_deref()).context("Failed to load configuration")?;

    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Serve { listen, .. } => {
            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }
            config.log_presence();

            ark_relay::relay::run_server(config).await
        }

        Commands::Ask {
            prompt,
            stream,
            system,
            ..
        } => {
            config.log_presence();
            let client = CompletionClient::new(config.upstream.clone())?;

            let mut stdout = tokio::io::stdout();
            if !write_answer(&client, &prompt, system.as_deref(), stream, &mut stdout).await? {
                tracing::warn!("No answer produced");
            }
            Ok(())
        }

        Commands::Check { .. } => {
            config.log_presence();
            println!("listen:         {}", config.server.listen);
            println!("allowed origin: {}", config.cors.allowed_origin);
            println!("base url:       {}", config.upstream.base_url);
            println!(
                "api key:        {}",
                config
                    .upstream
                    .api_key
                    .as_ref()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!(
                "model id:       {}",
                config.upstream.model_id.as_deref().unwrap_or("(not set)")
            );

            let missing = config.missing_settings();
            if !missing.is_empty() {
                anyhow::bail!("Missing required settings: {}", missing.join(", "));
            }
            Ok(())
        }
    }
}
