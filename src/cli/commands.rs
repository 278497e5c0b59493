//! CLI command definitions for dispatchq.
//!
//! Each command connects to the store, runs one operation and shuts the
//! connection manager down again. `monitor` stays attached and reports link
//! state changes until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::connection::{ConnectionManager, LinkState};
use crate::lock::{new_owner_token, DistributedLock};
use crate::metrics;
use crate::queue::QueuePrimitives;
use crate::store::{KeyValueStore, RedisStore};

/// Default lock TTL in seconds.
const DEFAULT_LOCK_TTL_SECS: u64 = 30;

/// Diagnostics for the dispatch store's reliability layer.
#[derive(Parser)]
#[command(name = "dispatchq")]
#[command(about = "Inspect and exercise a dispatch queue store")]
#[command(version)]
#[command(
    long_about = "dispatchq talks to the redis-compatible store behind a priority task dispatcher.\n\nPool and reconnect settings come from STORE_* environment variables.\n\nExample usage:\n  dispatchq --host 127.0.0.1 queue double-push control data:sales '{\"task_id\":\"t1\"}'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Store host.
    #[arg(long, env = "STORE_HOST", default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Store port.
    #[arg(long, env = "STORE_PORT", default_value = "6379", global = true)]
    pub port: u16,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Round-trip a PING through the connection pool.
    Ping {
        /// Print Prometheus metrics afterwards.
        #[arg(long)]
        metrics: bool,
    },

    /// List keys matching a glob pattern.
    Keys {
        /// Pattern, e.g. "position:*".
        pattern: String,
    },

    /// Queue primitives.
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Distributed lock operations.
    #[command(subcommand)]
    Lock(LockCommand),

    /// Watch the store link and report state changes until interrupted.
    Monitor,
}

#[derive(clap::Subcommand, Debug)]
pub enum QueueCommand {
    /// Push a payload onto a queue.
    Push { queue: String, payload: String },

    /// Push a payload onto a data queue and announce it on a control queue.
    DoublePush {
        control: String,
        data_queue: String,
        payload: String,
    },

    /// Pop the oldest payload.
    Pop {
        queue: String,

        /// Block up to this many seconds for an element instead of failing
        /// on an empty queue.
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Show the oldest payload without removing it.
    Peek { queue: String },

    /// Move the oldest payload of one queue onto another.
    Move {
        src: String,
        dst: String,

        /// Seconds to wait for an element.
        #[arg(long, default_value = "1")]
        wait: u64,
    },

    /// Remove every copy of a payload.
    Remove { queue: String, payload: String },
}

#[derive(clap::Subcommand, Debug)]
pub enum LockCommand {
    /// Try once to take a lock. Prints the owner token on success.
    Acquire {
        key: String,

        /// Owner token (random if omitted).
        #[arg(long)]
        owner: Option<String>,

        /// Lock TTL in seconds.
        #[arg(long, default_value_t = DEFAULT_LOCK_TTL_SECS)]
        ttl: u64,
    },

    /// Release a lock held by the given owner token.
    Release { key: String, owner: String },
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// # Errors
///
/// Returns an error if the command fails.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with pre-parsed arguments.
///
/// # Errors
///
/// Returns an error if the command fails.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    metrics::init_metrics().context("failed to register metrics")?;

    let config = StoreConfig::from_env()
        .context("invalid store configuration")?
        .with_address(cli.host, cli.port);
    let manager = Arc::new(ConnectionManager::connect(config).await?);
    let store = RedisStore::new(Arc::clone(&manager));

    let result = match cli.command {
        Commands::Ping { metrics: show } => run_ping_command(&manager, show).await,
        Commands::Keys { pattern } => run_keys_command(&store, &pattern).await,
        Commands::Queue(command) => run_queue_command(&store, command).await,
        Commands::Lock(command) => run_lock_command(&store, command).await,
        Commands::Monitor => run_monitor_command(&manager).await,
    };

    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "Connection manager stopped with an error");
    }
    result
}

async fn run_ping_command(manager: &ConnectionManager, show_metrics: bool) -> anyhow::Result<()> {
    manager.ping().await.context("store did not answer PING")?;

    let stats = manager.pool_stats();
    println!("PONG ({})", manager.status());
    println!(
        "pool: {} idle, {} active, {} max",
        stats.idle, stats.active, stats.max_active
    );

    if show_metrics {
        println!();
        print!("{}", metrics::export_metrics());
    }
    Ok(())
}

async fn run_keys_command(store: &RedisStore, pattern: &str) -> anyhow::Result<()> {
    let keys = store.get_keys(pattern).await?;
    for key in &keys {
        println!("{}", key);
    }
    info!(pattern = %pattern, count = keys.len(), "Listed keys");
    Ok(())
}

async fn run_queue_command(store: &RedisStore, command: QueueCommand) -> anyhow::Result<()> {
    match command {
        QueueCommand::Push { queue, payload } => {
            store.simple_push(&queue, payload.as_bytes()).await?;
            println!("pushed to {}", queue);
        }
        QueueCommand::DoublePush {
            control,
            data_queue,
            payload,
        } => {
            store
                .double_push(&control, &data_queue, payload.as_bytes())
                .await?;
            println!("pushed to {} and announced on {}", data_queue, control);
        }
        QueueCommand::Pop { queue, wait } => {
            let popped = match wait {
                Some(secs) => store.blocking_pop(&queue, Duration::from_secs(secs)).await?,
                None => Some(store.pop(&queue).await?),
            };
            print_payload(popped);
        }
        QueueCommand::Peek { queue } => {
            let payload = store.peek(&queue).await?;
            print_payload(Some(payload));
        }
        QueueCommand::Move { src, dst, wait } => {
            let moved = store
                .pop_and_move(&src, &dst, Duration::from_secs(wait))
                .await?;
            print_payload(moved);
        }
        QueueCommand::Remove { queue, payload } => {
            let removed = store.remove_item(&queue, payload.as_bytes()).await?;
            println!("removed {}", removed);
        }
    }
    Ok(())
}

fn print_payload(payload: Option<Vec<u8>>) {
    match payload {
        Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
        None => println!("(timed out)"),
    }
}

async fn run_lock_command(store: &RedisStore, command: LockCommand) -> anyhow::Result<()> {
    match command {
        LockCommand::Acquire { key, owner, ttl } => {
            let owner = owner.unwrap_or_else(new_owner_token);
            store
                .acquire(&key, &owner, Duration::from_secs(ttl))
                .await?;
            println!("{}", owner);
        }
        LockCommand::Release { key, owner } => {
            store.release(&key, &owner).await?;
            println!("released {}", key);
        }
    }
    Ok(())
}

/// Pings on every monitor tick so the reconnect monitor sees traffic, and
/// prints each state change.
async fn run_monitor_command(manager: &ConnectionManager) -> anyhow::Result<()> {
    let mut status = manager.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    println!("link {}", *status.borrow());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping monitor");
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    bail!("connection monitor stopped unexpectedly");
                }
                let state = *status.borrow_and_update();
                println!("link {}", state);
                if state == LinkState::Unrecoverable {
                    bail!("store is unreachable; giving up");
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = manager.ping().await {
                    if e.is_fatal() {
                        bail!("store is unreachable; giving up");
                    }
                    warn!(error = %e, "Ping failed");
                }
            }
        }
    }
}
