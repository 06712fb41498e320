//! Command-line entry point: build the sub-volume cache or run a training fit
//! from a YAML config.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use volseg::config::RunConfig;
use volseg::data::DataModule;
use volseg::training::{
    DiceLoss, Experiment, JsonlTracker, PointwiseConv3d, RunInfo, Tracker, Trainer,
};

#[derive(Parser, Debug)]
#[command(name = "volseg", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample sub-volumes, normalize and cache them with manifests
    Prepare {
        /// YAML run configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Regenerate even when manifests exist
        #[arg(long)]
        force: bool,
    },
    /// Prepare data, then fit the baseline model
    Train {
        /// YAML run configuration
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<RunConfig> {
    RunConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))
}

fn prepare(config: RunConfig, force: bool) -> anyhow::Result<DataModule> {
    let mut params = config.data_params;
    params.force_regenerate |= force;
    let mut data = DataModule::new(params);
    data.setup().context("preparing data module")?;
    info!(
        subjects = data.num_subjects(),
        train = data.train_dataset()?.len(),
        val = data.val_dataset()?.len(),
        "data ready"
    );
    Ok(data)
}

fn train(config: RunConfig) -> anyhow::Result<()> {
    let run = RunInfo::new(
        &config.tracking_params.project,
        config.tracking_params.run_name.as_deref(),
        serde_json::to_value(&config).context("serializing config")?,
    );
    let classes = config.data_params.classes;
    let seed = config.data_params.seed;
    let trainer = Trainer::new(config.trainer_params.clone(), seed);
    let model = PointwiseConv3d::new(
        config.exp_params.in_channels,
        classes,
        config.model_params.init_seed,
    );
    let mut experiment = Experiment::new(model, DiceLoss::new(classes), config.exp_params.clone())
        .context("building experiment")?;
    let mut tracker = JsonlTracker::new(&config.tracking_params.save_dir);

    let data = prepare(config, false)?;

    tracker.init(&run)?;
    let summary = trainer.fit(&mut experiment, &data, &mut tracker);
    tracker.finish()?;
    let summary = summary.context("training")?;

    if let Some(last) = summary.epochs.last() {
        info!(
            steps = summary.steps,
            train_loss = last.train_loss,
            val_loss = ?last.val_loss,
            "fit complete"
        );
    }
    if let Some(path) = tracker.path() {
        info!(path = %path.display(), "metrics written");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Prepare { config, force } => {
            prepare(load_config(&config)?, force)?;
        }
        Command::Train { config } => train(load_config(&config)?)?,
    }
    Ok(())
}
