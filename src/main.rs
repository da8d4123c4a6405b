//! # docchat CLI
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and run schema migrations |
//! | `docchat serve` | Start the HTTP API |
//! | `docchat ingest <path\|url>` | Ingest a document for an owner |
//! | `docchat token <user>` | Issue a bearer token for a user |
//! | `docchat chat <doc> "<message>"` | Send a message to a running server |
//! | `docchat history <doc>` | Print a document's conversation |

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docchat::plans::PlanTier;
use docchat::session::SessionKeys;
use docchat::{client, config, ingest, migrate, server};

/// docchat: chat with your documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docchat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "Upload documents and chat with them through retrieval-augmented generation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Ingest a local file or URL as a new document.
    Ingest {
        /// File path, `file://` URL or `http(s)://` URL.
        address: String,

        /// Owning user id.
        #[arg(long)]
        owner: String,

        /// Plan tier whose limits apply (`free` or `pro`).
        #[arg(long, default_value = "free")]
        tier: String,
    },

    /// Print a bearer token for a user, signed with `[server].session_secret`.
    Token {
        user_id: String,
    },

    /// Send a message about a document and stream the answer.
    Chat {
        document_id: String,
        message: String,

        /// Base URL of a running server.
        #[arg(long, default_value = "http://127.0.0.1:7340")]
        server: String,

        /// Bearer token (see `docchat token`).
        #[arg(long, env = "DOCCHAT_TOKEN")]
        token: String,
    },

    /// Print the most recent messages of a document's conversation.
    History {
        document_id: String,

        #[arg(long, default_value = "http://127.0.0.1:7340")]
        server: String,

        #[arg(long, env = "DOCCHAT_TOKEN")]
        token: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Cursor printed by a previous `history` call.
        #[arg(long)]
        cursor: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docchat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that talk to a running server don't need the config file
    match &cli.command {
        Commands::Chat {
            document_id,
            message,
            server,
            token,
        } => return client::run_chat(server, token, document_id, message).await,
        Commands::History {
            document_id,
            server,
            token,
            limit,
            cursor,
        } => {
            return client::run_history(server, token, document_id, *limit, cursor.as_deref())
                .await
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest {
            address,
            owner,
            tier,
        } => {
            let Some(tier) = PlanTier::parse(&tier) else {
                bail!("Unknown tier: '{}'. Must be free or pro.", tier);
            };
            ingest::run_ingest(&cfg, &address, &owner, tier).await?;
        }
        Commands::Token { user_id } => {
            let token = SessionKeys::new(&cfg.server.session_secret).issue(&user_id)?;
            println!("{}", token);
        }
        Commands::Chat { .. } | Commands::History { .. } => unreachable!("handled above"),
    }

    Ok(())
}
