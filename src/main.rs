//! # docchat CLI
//!
//! The `docchat` binary indexes a documents directory and answers questions
//! about it, remembering earlier exchanges across sessions.
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
//! | `docchat index` | Build the document corpus from `documents_dir` |
//! | `docchat chat` | Interactive question answering |
//! | `docchat ask "<question>"` | Answer a single question |
//! | `docchat history` | Print stored turns of the conversation |
//! | `docchat stats` | Show index sizes and model bindings |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `docchat=info`, or `docchat=debug` with `--verbose`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docchat::config;
use docchat::engine::Engine;
use docchat::llm::OpenAiChat;
use docchat::progress::ProgressMode;
use docchat::{repl, stats};

/// docchat: ask questions about your documents, with long-term memory.
#[derive(Parser)]
#[command(name = "docchat", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    /// Enable debug logging for docchat.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Build the document corpus.
    ///
    /// Skipped when the documents and settings are unchanged since the
    /// last build.
    Index {
        /// Rebuild even if nothing changed.
        #[arg(long)]
        force: bool,

        /// Progress output on stderr.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressArg,
    },

    /// Start an interactive chat.
    Chat {
        /// Conversation to continue (defaults to `session.conversation`).
        #[arg(long, conflicts_with = "new")]
        conversation: Option<String>,

        /// Start a fresh conversation with a generated id.
        #[arg(long)]
        new: bool,
    },

    /// Ask a single question.
    Ask {
        question: String,

        #[arg(long)]
        conversation: Option<String>,
    },

    /// Print stored turns, oldest first.
    History {
        #[arg(long)]
        conversation: Option<String>,

        /// Only the most recent N turns.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show index statistics.
    Stats,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProgressArg {
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "docchat=debug" } else { "docchat=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn chat_model(cfg: &config::Config) -> anyhow::Result<Arc<OpenAiChat>> {
    Ok(Arc::new(OpenAiChat::new(&cfg.openai)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let engine = Engine::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Database initialized at {}", cfg.db_path().display());
        }
        Commands::Index { force, progress } => {
            let report = engine.build_corpus(force, progress.mode().reporter()).await?;
            println!("index {}", cfg.documents_dir.display());
            println!("  documents: {}", report.documents);
            println!("  chunks: {}", report.chunks);
            if report.skipped {
                println!("  unchanged, skipped rebuild");
            }
            if report.rebuilt_after_mismatch {
                println!("  rebuilt after embedding model change");
            }
            for skipped in &report.skipped_files {
                println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
            }
            println!("ok");
        }
        Commands::Chat { conversation, new } => {
            let conversation = if new {
                Some(uuid::Uuid::new_v4().to_string())
            } else {
                conversation
            };
            let mut session = engine
                .session(chat_model(&cfg)?, conversation.as_deref())
                .await?;
            repl::run_chat(&mut session).await?;
        }
        Commands::Ask {
            question,
            conversation,
        } => {
            let mut session = engine
                .session(chat_model(&cfg)?, conversation.as_deref())
                .await?;
            repl::run_ask(&mut session, &question).await?;
        }
        Commands::History {
            conversation,
            limit,
        } => {
            let memory = engine.memory(conversation.as_deref()).await?;
            for turn in memory.history(limit).await? {
                println!("[{}] {}: {}", turn.id, turn.role, turn.content);
            }
        }
        Commands::Stats => {
            stats::run_stats(&engine).await?;
        }
    }

    engine.close().await;
    Ok(())
}
