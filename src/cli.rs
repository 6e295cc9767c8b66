use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "edgar-risk",
    version,
    about = "Local EDGAR filing risk-section extraction and validation tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Extract(ExtractArgs),
    Batch(BatchArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long)]
    pub input: PathBuf,

    /// Pre-seek this single section id; without it the whole document is
    /// parsed and every configured section is extracted.
    #[arg(long)]
    pub section: Option<String>,

    #[arg(long, default_value = "config/sections.yaml")]
    pub sections_config: PathBuf,

    #[arg(long, default_value = "config/thresholds.yaml")]
    pub thresholds_config: PathBuf,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub report: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub fail_on_validation: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[arg(long)]
    pub input_dir: PathBuf,

    #[arg(long, default_value = "html,htm")]
    pub extensions: String,

    #[arg(long, default_value = ".cache/edgar-risk")]
    pub state_root: PathBuf,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Pre-seek this single section id per document instead of full parses.
    #[arg(long)]
    pub section: Option<String>,

    #[arg(long, default_value = "config/sections.yaml")]
    pub sections_config: PathBuf,

    #[arg(long, default_value = "config/thresholds.yaml")]
    pub thresholds_config: PathBuf,

    #[arg(long, default_value_t = 4)]
    pub max_workers: usize,

    #[arg(long, default_value_t = 120)]
    pub task_timeout_secs: u64,

    #[arg(long, default_value_t = 25)]
    pub checkpoint_every: usize,

    #[arg(long, default_value_t = 50)]
    pub tasks_per_worker: usize,

    /// Ignore the state manifest and process every discovered input.
    #[arg(long, default_value_t = false)]
    pub reprocess_all: bool,

    #[arg(long, default_value_t = false)]
    pub fail_on_validation: bool,

    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/edgar-risk")]
    pub state_root: PathBuf,
}
