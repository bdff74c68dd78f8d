//! Runtime configuration for the scheduler core.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically, mirroring the teacher's `Config::load` fallback
//! behavior: a missing file is not an error, just a warning and defaults.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments for the demonstration binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "pagedkv", about = "Paged KV-cache block manager and scheduler demo")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the configured block size (tokens per block).
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Override the configured number of device blocks.
    #[arg(long)]
    pub num_device_blocks: Option<usize>,

    /// Override the configured number of host blocks.
    #[arg(long)]
    pub num_host_blocks: Option<usize>,

    /// Override the configured max batched tokens.
    #[arg(long)]
    pub max_batched_tokens: Option<usize>,
}

/// Scheduler configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tokens per block; must be one of 8, 16, 32 (spec §3).
    pub block_size: usize,

    /// Number of physical blocks in the device (fast) tier.
    pub num_device_blocks: usize,

    /// Number of physical blocks in the host (slow) tier.
    pub num_host_blocks: usize,

    /// Admission cap on total prompt tokens batched per step (spec §4.3).
    pub max_batched_tokens: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_device_blocks: 2048,
            num_host_blocks: 4096,
            max_batched_tokens: 2048,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults if the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply CLI overrides on top of a loaded config.
    pub fn apply_cli_overrides(mut self, cli: &Cli) -> Self {
        if let Some(v) = cli.block_size {
            self.block_size = v;
        }
        if let Some(v) = cli.num_device_blocks {
            self.num_device_blocks = v;
        }
        if let Some(v) = cli.num_host_blocks {
            self.num_host_blocks = v;
        }
        if let Some(v) = cli.max_batched_tokens {
            self.max_batched_tokens = v;
        }
        self
    }
}
