//! Chatkeep CLI
//!
//! Inspect and maintain a conversation store from the command line.

use chatkeep::compaction::ExtractiveOnly;
use chatkeep::{
    default_root, ChatkeepConfig, CompactionOutcome, HttpSummarizer, Message, Role, SessionStore,
    SessionSettings, Summarizer,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Chatkeep - crash-safe conversation store
#[derive(Parser, Debug)]
#[command(name = "chatkeep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store root (defaults to $CHATKEEP_HOME or ~/.chatkeep)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a session and make it active
    Create {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// List sessions, most recently active first
    List {
        #[arg(long)]
        tenant: String,
        /// Include archived sessions
        #[arg(long)]
        all: bool,
    },
    /// Print a session's summary and prompt window
    Show {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
    },
    /// Append one message
    Append {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
        #[arg(long, default_value = "user")]
        role: Role,
        #[arg(trailing_var_arg = true, required = true)]
        content: Vec<String>,
    },
    /// Compact a session now
    Compact {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
    },
    /// Delete a session and its directory
    Delete {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
    },
    /// Remove session directories missing from the index
    Sweep {
        #[arg(long)]
        tenant: String,
        /// Only remove directories untouched for this many seconds
        #[arg(long, default_value_t = 3600)]
        min_age_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = match cli.root {
        Some(root) => root,
        None => default_root()?,
    };
    let config = ChatkeepConfig::load(root)?;
    let summarizer = build_summarizer(&config)?;
    let store = SessionStore::open(config, summarizer);

    run(&store, cli.command).await
}

fn build_summarizer(config: &ChatkeepConfig) -> anyhow::Result<Arc<dyn Summarizer>> {
    let http = HttpSummarizer::new(config.summarizer.clone())?;
    if http.has_credentials() {
        return Ok(Arc::new(http));
    }
    info!(
        "{} is not set, compaction will use extractive summaries",
        config.summarizer.api_key_env
    );
    Ok(Arc::new(ExtractiveOnly))
}

async fn run(store: &SessionStore, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create {
            tenant,
            title,
            system_prompt,
        } => {
            let settings = SessionSettings {
                system_prompt,
                ..Default::default()
            };
            let meta = store
                .create_session(&tenant, settings, title.as_deref())
                .await?;
            println!("{}", meta.id);
        }
        Command::List { tenant, all } => {
            let registry = store.registry(&tenant)?;
            let active = registry.active().await.map(|m| m.id);
            for meta in registry.list(all).await {
                let marker = if active.as_deref() == Some(meta.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {}  {:>4} msgs  {}  {}{}",
                    marker,
                    meta.id,
                    meta.message_count,
                    meta.last_active_at.format("%Y-%m-%d %H:%M"),
                    meta.title,
                    if meta.archived { " (archived)" } else { "" }
                );
            }
        }
        Command::Show { tenant, session } => {
            let log = open_log(store, &tenant, &session).await?;
            let start = log.prompt_window_start().await;
            println!("{} messages, window starts at {}", log.len().await, start);
            if let Some(summary) = log.summary().await {
                println!("\n{summary}\n");
            }
            for (offset, msg) in log.prompt_window().await.iter().enumerate() {
                println!("#{} [{}] {}", start + offset, msg.role, msg.content);
            }
        }
        Command::Append {
            tenant,
            session,
            role,
            content,
        } => {
            let log = open_log(store, &tenant, &session).await?;
            if !log.append(Message::new(role, content.join(" "))).await {
                anyhow::bail!("failed to append to session {session}");
            }
            // Let a compaction triggered by this append finish before exit.
            store.scheduler().wait(&session).await;
            println!(
                "{} messages, window starts at {}",
                log.len().await,
                log.prompt_window_start().await
            );
        }
        Command::Compact { tenant, session } => {
            let log = open_log(store, &tenant, &session).await?;
            match log.force_compact().await {
                CompactionOutcome::Compacted {
                    previous_start,
                    new_start,
                    summary_tokens,
                    used_fallback,
                } => println!(
                    "Compacted: window {} -> {}, summary {} tokens{}",
                    previous_start,
                    new_start,
                    summary_tokens,
                    if used_fallback { " (extractive)" } else { "" }
                ),
                CompactionOutcome::NothingToCompact => println!("Nothing to compact"),
                CompactionOutcome::Cancelled => println!("Cancelled"),
                CompactionOutcome::Failed(reason) => anyhow::bail!("compaction failed: {reason}"),
            }
        }
        Command::Delete { tenant, session } => {
            if !store.delete_session(&tenant, &session).await {
                anyhow::bail!("no session {session} for tenant {tenant}");
            }
            println!("Deleted {session}");
        }
        Command::Sweep {
            tenant,
            min_age_secs,
        } => {
            let removed = store
                .sweep_orphans(&tenant, Duration::from_secs(min_age_secs))
                .await?;
            if removed.is_empty() {
                println!("No orphaned session directories");
            }
            for name in removed {
                println!("Removed {name}");
            }
        }
    }
    Ok(())
}

async fn open_log(
    store: &SessionStore,
    tenant: &str,
    session: &str,
) -> anyhow::Result<Arc<chatkeep::MessageLog>> {
    match store.log(tenant, session).await {
        Some(log) => Ok(log),
        None => {
            warn!("Unknown session {} for tenant {}", session, tenant);
            anyhow::bail!("no session {session} for tenant {tenant}")
        }
    }
}
