use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use stsan_trainer::logging::init_logging;
use stsan_trainer::training::checkpoints::{read_snapshot_header, CheckpointRecord};
use stsan_trainer::training::ReplicaTopology;
use stsan_trainer::TrainerConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "stsan-trainer")]
#[command(about = "Training orchestration for the STSAN-XL flow prediction model", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "STSAN_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the derived values
    Validate {
        /// Configuration file (.json, .yaml or .yml)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show the checkpoint record and retained snapshots of a run
    Inspect {
        /// Checkpoint directory of the run
        #[arg(short = 'd', long)]
        checkpoint_dir: PathBuf,

        /// Also list the tensors of every retained snapshot
        #[arg(long)]
        tensors: bool,
    },

    /// Show build and device information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json)?;

    match cli.command {
        Commands::Validate { config } => validate_config(config)?,
        Commands::Inspect {
            checkpoint_dir,
            tensors,
        } => inspect_checkpoints(checkpoint_dir, tensors)?,
        Commands::Info => show_system_info(),
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = TrainerConfig::from_file(&config_path).context("Failed to load configuration file")?;
    let settings = config.settings();

    println!("Configuration is valid");
    println!("  run id:             {}", settings.run_id);
    println!("  dataset:            {}", settings.dataset);
    println!("  sequence length:    {}", config.seq_len());
    println!("  horizons:           {}", config.n_pred());
    println!("  global batch size:  {} ({} x {})", config.global_batch_size(), settings.batch_size, settings.replicas);
    match config.loss_weights() {
        Some((w1, w2)) => println!("  loss weights:       {w1:.3} near / {w2:.3} far"),
        None => println!("  loss weights:       uniform"),
    }
    println!("  early-stop patience: {:?}", config.es_patiences());
    println!("  reshuffle tiers:    {:?}", config.reshuffle_tiers());
    println!("  trivial threshold:  {:.6}", config.test_threshold());
    println!("  snapshots kept:     {}", config.checkpoints_to_keep());
    println!("  results:            {}", config.result_path().display());
    println!("  checkpoints:        {}", config.checkpoint_path().display());
    println!("  telemetry:          {}", config.telemetry_path().display());

    Ok(())
}

fn inspect_checkpoints(dir: PathBuf, tensors: bool) -> Result<()> {
    let Some(record) = CheckpointRecord::read(&dir).context("Failed to read checkpoint record")? else {
        println!("No checkpoint record in {}", dir.display());
        return Ok(());
    };

    println!("Checkpoint record ({})", record.saved_at.to_rfc3339());
    println!("  completed epochs:   {}", record.epoch);
    println!("  optimizer steps:    {}", record.step_count);
    println!("  best epoch:         {}", record.best_epoch);
    println!("  validating:         {}", record.checkpoint_eligible);
    println!("  early stop:         {}", record.early_stop);
    println!(
        "  early-stop phase:   {:?} (wait {})",
        record.early_stopper.phase, record.early_stopper.wait
    );
    println!("  reshuffles:         {}", record.reshuffler.reshuffles);
    println!("Retained snapshots:");

    for (epoch, snapshot) in &record.snapshots {
        let path = dir.join(snapshot.weights_file());
        println!("  epoch {epoch:>4}  {}", path.display());
        if tensors {
            let summaries = read_snapshot_header(&path)
                .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
            for tensor in summaries {
                println!("      {} {} {:?}", tensor.name, tensor.dtype, tensor.shape);
            }
        }
    }

    Ok(())
}

fn show_system_info() {
    println!("STSAN-XL trainer");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA GPU acceleration: enabled");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA GPU acceleration: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal GPU acceleration: enabled");
    #[cfg(not(feature = "metal"))]
    println!("  Metal GPU acceleration: not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate framework: enabled");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate framework: not compiled");

    let topology = ReplicaTopology::detect(1);
    println!("  Selected device: {:?}", topology.device());
    println!("  Worker threads: {}", rayon::current_num_threads());
    println!();
    println!("Usage:");
    println!("  stsan-trainer validate -c taxi.yaml      # Check a configuration");
    println!("  stsan-trainer inspect -d checkpoints/0   # Show checkpoint progress");
    println!("  stsan-trainer info                       # Show this information");
}
