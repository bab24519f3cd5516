//! Configuration sourced from the CLI

use clap::Parser;
use std::path::PathBuf;

/// meshrate: client-side distributed rate-limiting core for a service mesh
#[derive(Parser, Debug)]
pub struct Cli {
    /// Validate the configuration file and exit without starting anything
    #[arg(long)]
    pub validate_configs: bool,

    /// Path to the TOML configuration file
    #[arg(long)]
    pub config_toml: Option<PathBuf>,

    #[arg(long)]
    pub lru_size: Option<usize>,
}
