//! Command-line arguments for `verityd`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use verity_kernel::request::Priority;

/// Verity daemon - verify claims read line by line from stdin
#[derive(Parser, Debug)]
#[command(name = "verityd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (yaml, toml, json, ini, ron or json5)
    #[arg(short, long, env = "VERITY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the number of pipeline workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Priority given to every submitted claim
    #[arg(short, long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,

    /// Also print per-stage progress events
    #[arg(long)]
    pub progress: bool,

    /// Do not sample host memory; the scheduler then relies on its budget only
    #[arg(long)]
    pub no_monitor: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}
