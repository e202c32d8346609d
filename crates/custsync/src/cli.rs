use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "custsync",
    about = "Reconcile customer records across sources and keep the similarity index current",
    version
)]
pub struct Cli {
    /// Database file (overrides CUSTSYNC_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run scheduled syncs and reindex workers until interrupted
    Serve,
    /// Sync one source now
    Sync {
        /// deal, health or calls
        source: String,
        /// Only records modified at or after this RFC 3339 time or date
        #[arg(long)]
        since: Option<String>,
        /// Stop after this many source records
        #[arg(long)]
        limit: Option<usize>,
        /// Call-intelligence account id
        #[arg(long)]
        account: Option<String>,
    },
    /// Reindex one customer, or every customer in batches
    Reindex {
        /// Customer id (all customers if omitted)
        #[arg(long)]
        customer: Option<Uuid>,
        /// Batch size for a full reindex
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
    /// Find customers similar to a given one
    Similar {
        /// Customer id
        id: Uuid,
        /// Number of results
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        /// Restrict results to one industry
        #[arg(long)]
        industry: Option<String>,
    },
    /// List reindex tasks that exhausted their retries
    Failures {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete every customer and its index entries
    Wipe {
        /// Required; the wipe cannot be undone
        #[arg(long)]
        confirm: bool,
    },
}
