//! Inspect or reset the durable cursor of a subscription.
//!
//! A running leader rewrites the cursor with every applied message, so a
//! reset must happen while no daemon consumes: stop the daemons (which
//! destroys their subscriptions and releases the lease), run `reset`, then
//! start them again to replay from cursor 0. In-process callers do the same
//! with `RepoSubscription::{destroy, reset_state, resume}`.
//!
//! # Usage
//!
//! ```bash
//! # Show the stored cursor and the current lease holder
//! subscription-state --db-path /data/tidemark.db show
//!
//! # Forget the cursor so the next connection replays from 0
//! subscription-state --db-path /data/tidemark.db reset
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tidemark_ingest::subscription::{Leader, LeaderConfig, METHOD, REPO_SUB_ID};
use tidemark_ingest::{Database, DatabaseConfig, StateStore};

#[derive(Parser, Debug)]
#[command(name = "subscription-state")]
#[command(about = "Inspect or reset the subscription cursor")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "TIDEMARK_DB_PATH", default_value = "./data/tidemark.db")]
    db_path: PathBuf,

    /// Upstream service URL the state is keyed by
    #[arg(long, env = "TIDEMARK_SERVICE", default_value = "wss://bsky.network")]
    service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored cursor
    Show,
    /// Delete the stored cursor
    Reset,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();

    let config = DatabaseConfig {
        path: args.db_path.clone(),
        ..Default::default()
    };
    let db = Arc::new(
        Database::open(&config)
            .with_context(|| format!("Failed to open database at {:?}", args.db_path))?,
    );
    let store = StateStore::new(Arc::clone(&db), &args.service, METHOD);

    match args.command {
        Command::Show => {
            let state = store.get_state()?;
            let leader = Leader::new(REPO_SUB_ID, db, LeaderConfig::default());
            println!("service: {}", store.service());
            println!("method:  {}", store.method());
            println!("cursor:  {}", state.cursor);
            match leader.current_holder()? {
                Some(holder) => println!("leader:  {holder}"),
                None => println!("leader:  none"),
            }
        }
        Command::Reset => {
            let leader = Leader::new(REPO_SUB_ID, Arc::clone(&db), LeaderConfig::default());
            if let Some(holder) = leader.current_holder()? {
                anyhow::bail!("{holder} holds the subscription lease; stop it before resetting");
            }
            let before = store.get_state()?;
            store.reset_state()?;
            println!(
                "Reset cursor for {} (was {})",
                store.service(),
                before.cursor
            );
        }
    }

    Ok(())
}
