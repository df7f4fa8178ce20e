// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands: `train` and `evaluate`
// and all their configurable flags.
//
// clap's derive macros automatically generate:
//   - help text (--help)
//   - error messages for missing or invalid args
//   - type conversion (string → usize, f64, enums)
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand, ValueEnum};

use crate::application::train_use_case::{OptimizerKind, TrainConfig};
use crate::infra::distributed::SUPPORTED_WORLD_SIZES;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the acoustic model on LibriSpeech feature manifests
    Train(TrainArgs),

    /// Score a saved checkpoint on the validation set
    Evaluate(EvaluateArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerArg {
    /// SGD with momentum
    Sgd,
    /// Adam
    Adam,
}

impl From<OptimizerArg> for OptimizerKind {
    fn from(o: OptimizerArg) -> Self {
        match o {
            OptimizerArg::Sgd  => OptimizerKind::Sgd,
            OptimizerArg::Adam => OptimizerKind::Adam,
        }
    }
}

/// Only a single device or a full 8-core host
fn parse_world_size(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if SUPPORTED_WORLD_SIZES.contains(&n) {
        Ok(n)
    } else {
        Err(format!("world size must be one of {SUPPORTED_WORLD_SIZES:?}"))
    }
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Number of data-parallel replicas
    #[arg(long, default_value_t = 1, value_parser = parse_world_size)]
    pub world_size: usize,

    /// Data-loader workers per replica (0 = load inline; any other
    /// value uses one background worker so batches keep their order)
    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    /// Utterances per replica per step
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    /// Analysis window length used by the feature front-end (ms)
    #[arg(long, default_value_t = 20.0)]
    pub window_length: f64,

    /// Analysis window stride used by the feature front-end (ms)
    #[arg(long, default_value_t = 20.0)]
    pub window_stride: f64,

    /// MFCC coefficients per frame
    #[arg(long, default_value_t = 26)]
    pub n_mfcc: usize,

    /// Neighbouring frames stacked on each side of a frame
    #[arg(long, default_value_t = 9)]
    pub n_context: usize,

    #[arg(long, value_enum, default_value_t = OptimizerArg::Adam)]
    pub optimizer: OptimizerArg,

    /// Per-replica learning rate (scaled by world size)
    #[arg(long, default_value_t = 3e-4)]
    pub lr: f64,

    /// SGD momentum
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,

    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    /// Checkpoint file, rewritten atomically after every epoch
    #[arg(long, default_value = "deepspeech.pth")]
    pub checkpoint_path: String,

    /// Copy of the checkpoint with the best validation loss
    #[arg(long, default_value = "model_best.pth")]
    pub best_path: String,

    /// Directory holding <subset>.jsonl feature manifests
    #[arg(long, default_value = "/tmp/librispeech")]
    pub datadir: String,

    /// Training subsets (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "train-clean-100")]
    pub train_data_urls: Vec<String>,

    /// Validation subsets (comma separated); pass "" to split the
    /// training set instead
    #[arg(long, value_delimiter = ',', default_value = "dev-clean")]
    pub val_data_urls: Vec<String>,

    /// Share of the training set kept for training when splitting
    #[arg(long, default_value_t = 0.8)]
    pub train_fraction: f64,

    /// Log loss and WER every N steps
    #[arg(long, default_value_t = 100)]
    pub log_steps: usize,

    /// Directory for metrics.csv
    #[arg(long, default_value = "logs")]
    pub logdir: String,

    /// Seed for shuffling and the train/validation split
    #[arg(long, default_value_t = 200)]
    pub seed: u64,

    /// Global gradient-norm clipping threshold
    #[arg(long, default_value_t = 400.0)]
    pub max_grad_norm: f64,

    /// Hidden width of the dense and recurrent layers
    #[arg(long, default_value_t = 1024)]
    pub n_hidden: usize,

    #[arg(long, default_value_t = 0.0)]
    pub dropout: f64,

    /// Seconds a replica waits for the others before giving up
    #[arg(long, default_value_t = 1800)]
    pub sync_timeout: u64,

    /// Continue from the checkpoint if it exists
    #[arg(long)]
    pub resume: bool,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        let non_empty = |v: Vec<String>| -> Vec<String> {
            v.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
        };
        TrainConfig {
            world_size:        a.world_size,
            num_workers:       a.num_workers,
            batch_size:        a.batch_size,
            window_length_ms:  a.window_length,
            window_stride_ms:  a.window_stride,
            n_mfcc:            a.n_mfcc,
            n_context:         a.n_context,
            optimizer:         a.optimizer.into(),
            learning_rate:     a.lr,
            momentum:          a.momentum,
            epochs:            a.epochs,
            checkpoint_path:   a.checkpoint_path,
            best_path:         a.best_path,
            datadir:           a.datadir,
            train_subsets:     non_empty(a.train_data_urls),
            val_subsets:       non_empty(a.val_data_urls),
            train_fraction:    a.train_fraction,
            log_steps:         a.log_steps,
            logdir:            a.logdir,
            seed:              a.seed,
            max_grad_norm:     a.max_grad_norm,
            n_hidden:          a.n_hidden,
            dropout:           a.dropout,
            sync_timeout_secs: a.sync_timeout,
            resume:            a.resume,
        }
    }
}

/// All arguments for the `evaluate` command
#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// Checkpoint written by `train`; train_config.json is read from
    /// the same directory
    #[arg(long, default_value = "deepspeech.pth")]
    pub checkpoint_path: String,

    #[arg(long, default_value = "model_best.pth")]
    pub best_path: String,

    /// Score the best checkpoint instead of the latest
    #[arg(long)]
    pub best: bool,

    /// Override the training batch size
    #[arg(long)]
    pub batch_size: Option<usize>,
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn train_config(args: &[&str]) -> TrainConfig {
        let cli = Cli::try_parse_from(std::iter::once("deepspeech-ctc").chain(args.iter().copied())).unwrap();
        match cli.command {
            Commands::Train(a) => a.into(),
            other => panic!("expected train, got {other:?}"),
        }
    }

    #[test]
    fn test_world_size_accepts_one_and_eight() {
        assert_eq!(parse_world_size("1"), Ok(1));
        assert_eq!(parse_world_size("8"), Ok(8));
        assert!(parse_world_size("4").is_err());
        assert!(parse_world_size("eight").is_err());
    }

    #[test]
    fn test_train_defaults_match_config_defaults() {
        let from_cli = train_config(&["train"]);
        let default  = TrainConfig::default();
        assert_eq!(from_cli.batch_size, default.batch_size);
        assert_eq!(from_cli.train_subsets, default.train_subsets);
        assert_eq!(from_cli.val_subsets, default.val_subsets);
        assert_eq!(from_cli.optimizer, OptimizerKind::Adam);
        assert_eq!(from_cli.seed, 200);
    }

    #[test]
    fn test_subset_lists_and_optimizer() {
        let cfg = train_config(&[
            "train",
            "--train-data-urls", "train-clean-100,train-clean-360",
            "--val-data-urls", "",
            "--optimizer", "sgd",
            "--world-size", "8",
        ]);
        assert_eq!(cfg.train_subsets, vec!["train-clean-100", "train-clean-360"]);
        assert!(cfg.val_subsets.is_empty());
        assert_eq!(cfg.optimizer, OptimizerKind::Sgd);
        assert_eq!(cfg.world_size, 8);
    }

    #[test]
    fn test_bad_world_size_is_rejected() {
        assert!(Cli::try_parse_from(["deepspeech-ctc", "train", "--world-size", "3"]).is_err());
    }
}
