//! Query relays from the command line.
//!
//!   relay-query query --kind 1 --author <hex> --limit 20
//!   relay-query relays
//!
//! Configuration comes from `--config` or `$NOSTR_POOL_CONFIG`; without
//! either the built-in relay sets are used.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nostr_pool::{
    Filter, PoolRegistry, PoolRole, PoolsConfig, QueryOptions, config_path_from_env, load_config,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay-query")]
#[command(about = "Query and inspect Nostr relay pools")]
struct Cli {
    /// JSON config file (defaults to $NOSTR_POOL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch events and print them newest first, one JSON object per line
    Query {
        /// Pool to query: default, discovery or outbox
        #[arg(long, default_value = "default")]
        role: PoolRole,

        /// Event kind (repeat or comma-delimit)
        #[arg(long = "kind", value_delimiter = ',')]
        kinds: Vec<u16>,

        /// Author pubkey in hex (repeat or comma-delimit)
        #[arg(long = "author", value_delimiter = ',')]
        authors: Vec<String>,

        /// Event id in hex (repeat or comma-delimit)
        #[arg(long = "id", value_delimiter = ',')]
        ids: Vec<String>,

        #[arg(long)]
        limit: Option<u64>,

        /// Unix timestamp lower bound
        #[arg(long)]
        since: Option<u64>,

        /// Unix timestamp upper bound
        #[arg(long)]
        until: Option<u64>,

        /// Overall deadline in milliseconds (defaults to the pool's)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List the configured relays of every pool
    Relays,
}

fn init_logging() {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn load(path: Option<PathBuf>) -> Result<PoolsConfig> {
    match path.or_else(config_path_from_env) {
        Some(path) => {
            debug!("Loading config from {}", path.display());
            load_config(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(PoolsConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load(cli.config)?;

    match cli.command {
        Command::Query {
            role,
            kinds,
            authors,
            ids,
            limit,
            since,
            until,
            timeout_ms,
        } => {
            let mut filter = Filter::new();
            if !kinds.is_empty() {
                filter = filter.kinds(kinds);
            }
            if !authors.is_empty() {
                filter = filter.authors(authors);
            }
            if !ids.is_empty() {
                filter = filter.ids(ids);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            if let Some(since) = since {
                filter = filter.since(since);
            }
            if let Some(until) = until {
                filter = filter.until(until);
            }
            if filter == Filter::new() {
                bail!("refusing an unbounded query: give at least one of --kind, --author, --id, --limit");
            }

            let mut options = QueryOptions::new();
            if let Some(ms) = timeout_ms {
                options = options.timeout(Duration::from_millis(ms));
            }

            let registry = PoolRegistry::new(config)?;
            let pool = registry.get(role)?;
            let mut events = pool.query(&[filter], options).await?;
            nostr::sort_events(&mut events);
            info!("{} events from {} pool", events.len(), role);

            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            registry.reset();
        }
        Command::Relays => {
            for role in PoolRole::ALL {
                let relays = config.relays_for(role);
                println!(
                    "{}",
                    serde_json::json!({ "role": role, "relays": relays })
                );
            }
        }
    }

    Ok(())
}
