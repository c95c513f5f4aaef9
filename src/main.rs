mod augmentation;
mod backend;
mod base_model;
mod common;
mod config;
mod data;
mod entity;
mod error;
mod evaluation;
mod heads;
mod ingestion;
mod logging;
mod model;
mod pipeline;
mod prediction;
mod server;
mod tracking;
mod training;
mod vgg;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    backend::{backend_name, DefaultBackend},
    config::{ConfigurationManager, CONFIG_FILE_PATH, PARAMS_FILE_PATH},
    logging::{init_logging, LogConfig},
    pipeline::{run_pipeline, run_stage, PipelineContext, Stage},
    prediction::{BurnClassifier, PredictionPipeline},
    server::AppState,
};

/// Chest CT scan classifier: training pipeline and inference server
#[derive(Parser, Debug)]
#[command(name = "ct-scan-classifier")]
#[command(version)]
#[command(about = "Train, evaluate and serve a VGG16 chest CT scan classifier")]
struct Cli {
    /// Pipeline paths file
    #[arg(long, global = true, default_value = CONFIG_FILE_PATH)]
    config: PathBuf,

    /// Hyperparameters file
    #[arg(long, global = true, default_value = PARAMS_FILE_PATH)]
    params: PathBuf,

    /// Directory for the rotating log file
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the stages in order, up to and including `--through`
    Run {
        #[arg(long, value_enum, default_value_t = Stage::Evaluation)]
        through: Stage,

        /// Log evaluation results to the MLflow server
        #[arg(long)]
        track: bool,
    },

    /// Run a single stage
    Stage {
        #[arg(value_enum)]
        stage: Stage,

        #[arg(long)]
        track: bool,
    },

    /// Serve the web interface
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },

    /// Classify one image with the trained model
    Predict { image: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_guard = init_logging(&LogConfig {
        dir: cli.log_dir.clone(),
        ..LogConfig::default()
    })?;
    tracing::info!("Logging to {}", log_guard.log_file().display());
    tracing::info!("Backend: {}", backend_name());

    let context = |track: bool| PipelineContext {
        config_path: cli.config.clone(),
        params_path: cli.params.clone(),
        track,
    };

    match cli.command {
        Command::Run { through, track } => run_pipeline(through, &context(track)),
        Command::Stage { stage, track } => run_stage(stage, &context(track)),
        Command::Serve { ref host, port } => {
            let manager = ConfigurationManager::new(&cli.config, &cli.params)?;
            let state = AppState::new(
                cli.config.clone(),
                cli.params.clone(),
                std::env::current_exe().context("locating current executable")?,
                manager.get_prediction_config()?,
            );
            tokio::runtime::Runtime::new()
                .context("starting tokio runtime")?
                .block_on(server::serve(state, host, port))
        }
        Command::Predict { ref image } => {
            let manager = ConfigurationManager::new(&cli.config, &cli.params)?;
            let mut prediction = manager.get_prediction_config()?;
            prediction.input_image = image.clone();

            let records = PredictionPipeline::<BurnClassifier<DefaultBackend>>::new(prediction)
                .predict();
            println!("{}", serde_json::to_string(&records)?);
            Ok(())
        }
    }
}
