//! Configuration for spacesyncd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// spacesyncd - space replication daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "spacesyncd")]
#[command(about = "Replicated object space synchronization daemon")]
pub struct Config {
    /// Listen address for sync connections
    #[arg(short, long, default_value = "0.0.0.0:4870")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/spacesyncd")]
    pub data_dir: PathBuf,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, env = "SPACESYNC_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Sync round interval in seconds
    #[arg(long, default_value = "30")]
    pub sync_interval_secs: u64,

    /// Create a new space on startup when storage holds none
    #[arg(long)]
    pub create_space: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_interval_secs == 0 {
            anyhow::bail!("Sync interval must be at least one second");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("Log format must be 'json' or 'pretty'");
        }
        Ok(())
    }
}
