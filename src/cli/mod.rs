// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with `clap`.
// All business logic is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `train`    — trains the acoustic model, writing a
//                   checkpoint after every epoch
//   2. `evaluate` — loads a checkpoint and reports validation
//                   loss and WER
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvaluateArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "deepspeech-ctc",
    version = "0.1.0",
    about = "Train a DeepSpeech-style CTC model on LibriSpeech features, then score checkpoints."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the use case for the chosen subcommand.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)    => run_train(args),
            Commands::Evaluate(args) => run_evaluate(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!(
        "Starting training on {:?} from '{}' with {} replica(s)",
        args.train_data_urls, args.datadir, args.world_size,
    );

    let checkpoint = args.checkpoint_path.clone();
    let summary    = TrainUseCase::new(args.into()).execute()?;

    println!(
        "Training complete. Best validation loss: {:.4}. Checkpoint: {}",
        summary.best_loss, checkpoint,
    );
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    use crate::application::evaluate_use_case::EvaluateUseCase;

    let report = EvaluateUseCase::new(args.checkpoint_path, args.best_path, args.best, args.batch_size)
        .execute()?;

    println!("Checkpoint epoch : {}", report.epoch);
    println!("Utterances       : {}", report.utterances);
    println!("Validation loss  : {:.4}", report.loss);
    println!("WER              : {:.2}%", report.wer * 100.0);
    if report.skipped > 0 {
        println!("Rejected batches : {}", report.skipped);
    }
    Ok(())
}
