use crate::ensemble::EnsembleConfig;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// dgex: ensemble prediction of differential-expression signatures
#[derive(Parser, Debug)]
#[command(name = "dgex")]
#[command(about = "Ensemble prediction of differential-expression signatures for unseen perturbations")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train every member, predict the unseen pairs and blend
    Run(RunArgs),

    /// Predict with artifacts stored by a previous run
    Predict(PredictArgs),

    /// Write a control prediction (zeros or mean outcome)
    Baseline(BaselineArgs),

    /// Score a prediction file against ground truth
    Score(ScoreArgs),
}

/// Labelled table and id map
#[derive(Args, Debug)]
pub struct DataArgs {
    /// Labelled DE table (CSV or TSV, optionally gzipped)
    #[arg(short = 't', long, required = true)]
    pub train: PathBuf,

    /// Id map of the pairs to predict
    #[arg(short = 'm', long, required = true)]
    pub id_map: PathBuf,

    /// Output prediction file
    #[arg(short, long, default_value = "prediction.csv")]
    pub output: PathBuf,
}

/// Values that take precedence over the configuration file
#[derive(Args, Debug, Default)]
pub struct ConfigOverrides {
    /// Ensemble configuration file (JSON); the four-member blend if omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of training epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Epochs without improvement before stopping
    #[arg(long)]
    pub early_stopping: Option<usize>,

    /// Batch size for training and prediction
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Device to use (cpu)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Quick test mode (a handful of epochs, no progress bar)
    #[arg(long)]
    pub quick: bool,
}

impl ConfigOverrides {
    /// Load the configuration and apply every override
    pub fn resolve(&self) -> Result<EnsembleConfig> {
        let mut config = match &self.config {
            Some(path) => EnsembleConfig::from_file(path)?,
            None => EnsembleConfig::canonical(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut EnsembleConfig) {
        if self.quick {
            config.training.num_epochs = 5;
            config.training.show_progress = false;
        }
        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(patience) = self.early_stopping {
            config.training.early_stopping_patience = patience;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
            config.batch_size = batch_size;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
    }
}

/// Run arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Directory receiving each member's reducer, scaler and model
    #[arg(short, long)]
    pub store: Option<PathBuf>,

    /// Write per-member reports as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Directory receiving each member's per-epoch metrics history (JSON)
    #[arg(long)]
    pub metrics_dir: Option<PathBuf>,
}

/// Prediction arguments
#[derive(Args, Debug)]
pub struct PredictArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Directory written by a previous run
    #[arg(short, long, required = true)]
    pub store: PathBuf,
}

/// Baseline arguments
#[derive(Args, Debug)]
pub struct BaselineArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Control method (zeros, mean_outcome)
    #[arg(long, default_value = "mean_outcome")]
    pub method: String,
}

/// Scoring arguments
#[derive(Args, Debug)]
pub struct ScoreArgs {
    /// Prediction file with an id column and one column per gene
    #[arg(short, long, required = true)]
    pub prediction: PathBuf,

    /// Ground-truth labelled table, rows in id-map order
    #[arg(short, long, required = true)]
    pub truth: PathBuf,

    /// Output file for the score report (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity
///
/// `RUST_LOG` takes precedence when set.
pub fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
