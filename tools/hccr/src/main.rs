//! Handwritten Chinese character recognition CLI.
//!
//! `hccr --mode train` trains (resuming from the newest checkpoint in the log
//! directory), `--mode evaluate` scores the newest checkpoint on the test
//! split and `--mode demo` classifies a single image.

mod backend;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use hccr_core::{
    cli::setup_cli_logging, AppConfig, EvaluationMetrics, ModelVariant, RunMode, TrainingConfig,
    TEST_SPLIT, TRAIN_SPLIT,
};
use hccr_dataset::{BuildOutcome, LabelIndexBuilder, SampleSource};
use hccr_training::{load_latest_model, predict_image, train, Evaluator};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use crate::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Train or resume training
    Train,
    /// Evaluate the latest checkpoint on the test split
    Evaluate,
    /// Classify a single image
    Demo,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Train => RunMode::Train,
            Mode::Evaluate => RunMode::Evaluate,
            Mode::Demo => RunMode::Demo,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Model {
    /// EfficientNetV2-S
    Small,
    /// Minimal two-stage network
    Tiny,
}

impl From<Model> for ModelVariant {
    fn from(model: Model) -> Self {
        match model {
            Model::Small => ModelVariant::Small,
            Model::Tiny => ModelVariant::Tiny,
        }
    }
}

/// Handwritten Chinese character recognition with EfficientNetV2
#[derive(Parser, Debug)]
#[command(
    name = "hccr",
    about = "Train, evaluate and demo an EfficientNetV2 handwritten Chinese character classifier"
)]
struct Args {
    /// What to run (defaults to the config file's mode, then demo)
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Configuration file (TOML); command-line flags override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of epochs to train for
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Initial learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Square input size in pixels
    #[arg(long, value_name = "PX")]
    img_size: Option<usize>,

    /// Directory holding train/ and test/
    #[arg(long, value_name = "DIR")]
    data_root: Option<PathBuf>,

    /// Directory for checkpoints
    #[arg(long, value_name = "DIR")]
    log_root: Option<PathBuf>,

    /// Number of classes to use
    #[arg(long, value_name = "N")]
    num_classes: Option<usize>,

    /// Image classified in demo mode
    #[arg(long, value_name = "FILE")]
    demo_img: Option<PathBuf>,

    /// Network size
    #[arg(long, value_enum)]
    model: Option<Model>,

    /// Print evaluation metrics as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = setup_cli_logging(args.verbose) {
        eprintln!("{e}");
    }

    if let Err(e) = run(&args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = resolve_config(args)?;
    config
        .training
        .validate()
        .context("Invalid configuration")?;

    info!(
        "hccr {} | backend {} | model {}",
        config.mode,
        backend_name(),
        config.training.model
    );

    match config.mode {
        RunMode::Train => {
            bootstrap_manifests(&config.training)?;
            run_training(&config.training)
        }
        RunMode::Evaluate => {
            bootstrap_manifests(&config.training)?;
            run_evaluation(&config.training, args.json)
        }
        RunMode::Demo => run_demo(&config),
    }
}

/// Defaults, then the TOML file, then command-line flags.
fn resolve_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => AppConfig::default(),
    };

    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(path) = &args.demo_img {
        config.demo_image = path.clone();
    }

    let training = &mut config.training;
    if let Some(epochs) = args.epochs {
        training.epoch_count = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        training.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        training.learning_rate = lr;
    }
    if let Some(size) = args.img_size {
        training.image_size = size;
    }
    if let Some(root) = &args.data_root {
        training.data_root = root.clone();
    }
    if let Some(root) = &args.log_root {
        training.log_root = root.clone();
    }
    if let Some(n) = args.num_classes {
        training.num_classes = n;
    }
    if let Some(model) = args.model {
        training.model = model.into();
    }

    Ok(config)
}

/// Writes `<data_root>/<split>.txt` for every split directory whose manifest
/// is missing.
fn bootstrap_manifests(config: &TrainingConfig) -> Result<()> {
    for split in [TRAIN_SPLIT, TEST_SPLIT] {
        let manifest = config.manifest_path(split);
        let split_dir = config.split_dir(split);

        if !manifest.exists() && !split_dir.is_dir() {
            warn!(
                "No {} manifest and no directory {}, skipping",
                split,
                split_dir.display()
            );
            continue;
        }

        let outcome = LabelIndexBuilder::new(&split_dir, config.num_classes)
            .build(&manifest)
            .with_context(|| format!("Failed to build {} manifest", split))?;

        if let BuildOutcome::Written { records, classes } = outcome {
            info!(
                "Wrote {} ({} images, {} classes)",
                manifest.display(),
                records,
                classes
            );
        }
    }
    Ok(())
}

fn run_training(config: &TrainingConfig) -> Result<()> {
    info!("Configuration:");
    info!("  Epochs: {}", config.epoch_count);
    info!("  Batch size: {}", config.batch_size);
    info!("  Learning rate: {}", config.learning_rate);
    info!("  Image size: {}", config.image_size);
    info!("  Classes: {}", config.num_classes);
    info!("  Data root: {}", config.data_root.display());
    info!("  Log root: {}", config.log_root.display());

    let report = train::<TrainingBackend>(config, default_device()).context("Training failed")?;

    println!();
    println!("{}", "Training finished".green().bold());
    match &report.resumed_from {
        Some(path) => println!("  Resumed from: {}", path.display()),
        None => println!("  Started from scratch"),
    }
    println!("  Epochs run:   {}", report.epochs.len());
    if let Some(last) = report.epochs.last() {
        println!("  Last loss:    {:.6}", last.last_loss);
        println!("  Next lr:      {:.3e}", last.learning_rate);
    }
    println!("  Checkpoints:  {}", config.log_root.display());

    Ok(())
}

fn run_evaluation(config: &TrainingConfig, json: bool) -> Result<()> {
    let device = default_device();
    let source = SampleSource::open(&config.manifest_path(TEST_SPLIT), config.num_classes)
        .context("Failed to open test manifest")?;
    let restored = load_latest_model::<DefaultBackend>(config, &device)
        .context("Failed to restore model")?;

    let evaluator = Evaluator::<DefaultBackend>::new(config, device);
    let progress = ProgressBar::new(evaluator.num_batches(&source) as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")?
            .progress_chars("=>-"),
    );

    let metrics = evaluator
        .evaluate(&restored.model, &source, |done| progress.set_position(done as u64))
        .context("Evaluation failed")?;
    progress.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else {
        print_metrics(&metrics, restored.epoch);
    }
    Ok(())
}

fn print_metrics(metrics: &EvaluationMetrics, epoch: usize) {
    println!();
    println!("{}", "=".repeat(50));
    println!("{}", format!("EVALUATION (checkpoint epoch {epoch})").bold());
    println!("{}", "=".repeat(50));
    println!("Samples:             {}", metrics.num_samples);
    println!(
        "Top-1 accuracy:      {}",
        format!("{:.2}%", metrics.accuracy * 100.0).green().bold()
    );
    println!("Top-5 accuracy:      {:.2}%", metrics.top5_accuracy * 100.0);
    println!(
        "Mean class accuracy: {:.2}%",
        metrics.mean_class_accuracy() * 100.0
    );

    let worst = metrics.worst_classes(5);
    if !worst.is_empty() {
        println!("\nWorst classes:");
        for (class, accuracy) in worst {
            println!("  {:>6}  {}", class, format!("{:.2}%", accuracy * 100.0).yellow());
        }
    }
    println!("{}", "=".repeat(50));
}

fn run_demo(config: &AppConfig) -> Result<()> {
    let result = predict_image::<DefaultBackend>(&config.training, &config.demo_image, default_device())
        .with_context(|| format!("Failed to classify {}", config.demo_image.display()))?;

    println!();
    println!("{}", config.demo_image.display().to_string().bold());
    println!(
        "  Predicted class: {} ({})",
        result.class_id.to_string().green().bold(),
        format!("{:.2}%", result.confidence * 100.0)
    );
    for (rank, (class, probability)) in result.top_k.iter().enumerate().skip(1) {
        println!("  #{} {:>6}  {:.2}%", rank + 1, class, probability * 100.0);
    }
    Ok(())
}
