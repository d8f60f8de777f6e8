//! CLI commands for cc-bridge using clap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{self, load_settings, parse_duration, Settings};
use crate::core::{Broker, Message, QueueManager, SessionManager};
use crate::error::Error;
use crate::providers::ClaudeExecutor;

/// cc-bridge - relay messages between long-running Claude agents.
#[derive(Parser, Debug)]
#[command(name = "cc-bridge")]
#[command(version)]
#[command(about = "Relay messages between long-running Claude CLI agents", long_about = None)]
pub struct Commands {
    /// Data directory (default: ~/.cc-bridge)
    #[arg(long = "data-dir", global = true, env = "CC_BRIDGE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker until interrupted
    Start {
        /// Poll interval, e.g. 500ms, 1s, 2m
        #[arg(long = "poll-interval", value_parser = parse_duration)]
        poll_interval: Option<Duration>,
    },

    /// Show agent sessions and queue depth
    Status,

    /// Send a message from the human operator
    Send {
        /// Target agent
        #[arg(long)]
        to: Option<String>,

        /// Message text
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        message: Vec<String>,
    },

    /// Send a message that appears to come from another agent
    Inject {
        /// Agent to impersonate
        #[arg(long = "as")]
        as_agent: Option<String>,

        /// Target agent
        #[arg(long)]
        to: Option<String>,

        /// Message text
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        message: Vec<String>,
    },

    /// Delete every pending message for an agent
    Clear {
        /// Target agent
        #[arg(long)]
        to: Option<String>,
    },
}

impl Commands {
    /// The data directory in effect.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(config::default_data_dir)
    }

    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let data_dir = self.data_dir();
        match &self.command {
            Command::Start { poll_interval } => cmd_start(&data_dir, *poll_interval).await,
            Command::Status => cmd_status(&data_dir),
            Command::Send { to, message } => cmd_send(&data_dir, to.as_deref(), message),
            Command::Inject {
                as_agent,
                to,
                message,
            } => cmd_inject(&data_dir, as_agent.as_deref(), to.as_deref(), message),
            Command::Clear { to } => cmd_clear(&data_dir, to.as_deref()),
        }
    }
}

fn required<'a>(value: Option<&'a str>, flag: &str) -> Result<&'a str, Error> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Validation(format!("{} is required", flag))),
    }
}

fn message_text(words: &[String]) -> Result<String, Error> {
    let text = words.join(" ");
    if text.trim().is_empty() {
        return Err(Error::Validation("message is required".to_string()));
    }
    Ok(text)
}

/// Open the managers under `data_dir` and wire a broker around them.
fn open_broker(data_dir: &Path, settings: &Settings) -> Result<(Broker, Arc<SessionManager>)> {
    let queues = Arc::new(QueueManager::new(config::queues_dir(data_dir))?);
    let sessions = Arc::new(SessionManager::new(config::sessions_dir(data_dir))?);
    let executor = Arc::new(ClaudeExecutor::from_config(&settings.executor));

    let broker = Broker::new(queues, sessions.clone(), executor);
    Ok((broker, sessions))
}

// Command implementations

async fn cmd_start(data_dir: &Path, poll_interval: Option<Duration>) -> Result<()> {
    let settings = load_settings(data_dir)?;
    let poll_interval = poll_interval.unwrap_or_else(|| settings.poll_interval());

    println!("Starting cc-bridge broker...");
    println!("Data directory: {}", data_dir.display());
    println!("Poll interval: {:?}", poll_interval);

    let (mut broker, sessions) = open_broker(data_dir, &settings)?;
    if let Err(e) = sessions.load() {
        tracing::warn!("Failed to load sessions: {}", e);
    }

    for agent_id in &settings.agents {
        broker.initialize_agent(agent_id)?;
    }

    let snapshot = sessions.clone();
    broker.set_response_handler(move |msg: Message| {
        println!(
            "[{}] {} -> {}: {}",
            msg.timestamp.format("%H:%M:%S"),
            msg.from,
            msg.to,
            msg.payload.text
        );
        if let Err(e) = snapshot.save() {
            tracing::warn!("Failed to save sessions: {}", e);
        }
    });
    broker.set_error_handler(|agent_id, err| {
        tracing::error!(agent = agent_id, "Processing failed: {}", err);
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
        }
        shutdown.cancel();
    });

    println!("Broker running. Press Ctrl+C to stop.");
    broker.run(cancel, poll_interval).await;

    sessions.save()?;
    Ok(())
}

fn cmd_status(data_dir: &Path) -> Result<()> {
    let sessions = SessionManager::new(config::sessions_dir(data_dir))?;
    if !sessions.has_snapshot() {
        println!("No sessions found");
        return Ok(());
    }
    sessions.load()?;

    let mut list = sessions.list_sessions();
    if list.is_empty() {
        println!("No active sessions");
        return Ok(());
    }
    list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

    let queues = QueueManager::new(config::queues_dir(data_dir))?;
    println!("Active sessions:");
    for session in list {
        let status = if session.is_started() {
            format!("turn {}", session.turn_number)
        } else {
            "not started".to_string()
        };
        let pending = match queues.get_queue(&session.agent_id).and_then(|q| q.len()) {
            Ok(n) => n.to_string(),
            Err(e) => format!("unavailable ({})", e),
        };
        println!("  {}: {} | pending={}", session.agent_id, status, pending);
    }
    Ok(())
}

fn cmd_send(data_dir: &Path, to: Option<&str>, words: &[String]) -> Result<()> {
    let to = required(to, "--to")?;
    let text = message_text(words)?;

    let settings = load_settings(data_dir)?;
    let (broker, _) = open_broker(data_dir, &settings)?;
    broker.send_message(&Message::user(to, text))?;

    println!("Message sent to {}", to);
    Ok(())
}

fn cmd_inject(
    data_dir: &Path,
    as_agent: Option<&str>,
    to: Option<&str>,
    words: &[String],
) -> Result<()> {
    let as_agent = required(as_agent, "--as")?;
    let to = required(to, "--to")?;
    let text = message_text(words)?;

    let settings = load_settings(data_dir)?;
    let (broker, _) = open_broker(data_dir, &settings)?;
    broker.inject(as_agent, to, &text)?;

    println!("Injected message as {} to {}", as_agent, to);
    Ok(())
}

fn cmd_clear(data_dir: &Path, to: Option<&str>) -> Result<()> {
    let to = required(to, "--to")?;

    let queues = QueueManager::new(config::queues_dir(data_dir))?;
    let removed = queues.get_queue(to)?.clear()?;

    println!("Cleared {} pending message(s) for {}", removed, to);
    Ok(())
}
