//! Stage runners: build the stage config, drive its component, log banners.

use std::{fmt, path::PathBuf};

use anyhow::Result;
use clap::ValueEnum;

use crate::{
    backend::{default_device, DefaultBackend, TrainingBackend},
    base_model::PrepareBaseModel,
    config::ConfigurationManager,
    evaluation::Evaluation,
    ingestion::DataIngestion,
    training::Training,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Stage {
    #[value(alias = "data_ingestion")]
    DataIngestion,
    #[value(alias = "prepare_base_model")]
    PrepareBaseModel,
    Training,
    Evaluation,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::DataIngestion,
        Stage::PrepareBaseModel,
        Stage::Training,
        Stage::Evaluation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::DataIngestion => "Data Ingestion stage",
            Stage::PrepareBaseModel => "Prepare base model",
            Stage::Training => "Training",
            Stage::Evaluation => "Evaluation stage",
        }
    }

    /// Stages from the first one up to and including `self`.
    pub fn through(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| *s <= self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs shared by every stage of one invocation.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub config_path: PathBuf,
    pub params_path: PathBuf,
    /// Send evaluation results to the tracking server.
    pub track: bool,
}

impl PipelineContext {
    fn configuration(&self) -> Result<ConfigurationManager> {
        Ok(ConfigurationManager::new(&self.config_path, &self.params_path)?)
    }
}

fn data_ingestion(ctx: &PipelineContext) -> Result<()> {
    let config = ctx.configuration()?.get_data_ingestion_config()?;
    let ingestion = DataIngestion::new(config);
    ingestion.download_file()?;
    ingestion.extract_zip_file()
}

fn prepare_base_model(ctx: &PipelineContext) -> Result<()> {
    let config = ctx.configuration()?.get_prepare_base_model_config()?;
    let mut prepare = PrepareBaseModel::<DefaultBackend>::new(config, default_device());
    prepare.get_base_model()?;
    prepare.update_base_model()
}

fn training(ctx: &PipelineContext) -> Result<()> {
    let config = ctx.configuration()?.get_training_config()?;
    let mut training = Training::<TrainingBackend>::new(config, default_device());
    training.get_base_model()?;
    training.train_valid_generator()?;
    training.train()
}

fn evaluation(ctx: &PipelineContext) -> Result<()> {
    let config = ctx.configuration()?.get_evaluation_config()?;
    let mut evaluation = Evaluation::<DefaultBackend>::new(config, default_device());
    evaluation.evaluation()?;

    if ctx.track {
        if let Err(e) = evaluation.log_into_mlflow() {
            tracing::warn!("Tracking failed, score file is still written: {:#}", e);
        }
    } else {
        tracing::info!("Tracking disabled for this run");
    }
    Ok(())
}

pub fn run_stage(stage: Stage, ctx: &PipelineContext) -> Result<()> {
    tracing::info!("*******************");
    tracing::info!(">>>>>> stage {} started <<<<<<", stage);

    let result = match stage {
        Stage::DataIngestion => data_ingestion(ctx),
        Stage::PrepareBaseModel => prepare_base_model(ctx),
        Stage::Training => training(ctx),
        Stage::Evaluation => evaluation(ctx),
    };

    match result {
        Ok(()) => {
            tracing::info!(">>>>>> stage {} completed <<<<<<\n\nx==========x", stage);
            Ok(())
        }
        Err(e) => {
            tracing::error!("stage {} failed: {:?}", stage, e);
            Err(e)
        }
    }
}

/// Run every stage in order up to and including `through`, stopping at the
/// first failure.
pub fn run_pipeline(through: Stage, ctx: &PipelineContext) -> Result<()> {
    for stage in through.through() {
        run_stage(stage, ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn stages_run_in_order() {
        let order: Vec<_> = Stage::Training.through().collect();
        assert_eq!(
            order,
            vec![Stage::DataIngestion, Stage::PrepareBaseModel, Stage::Training]
        );
        assert_eq!(Stage::Evaluation.through().count(), 4);
    }

    #[test]
    fn stage_names_match_log_banners() {
        assert_eq!(Stage::DataIngestion.to_string(), "Data Ingestion stage");
        assert_eq!(Stage::PrepareBaseModel.to_string(), "Prepare base model");
        assert_eq!(Stage::Training.to_string(), "Training");
        assert_eq!(Stage::Evaluation.to_string(), "Evaluation stage");
    }

    #[test]
    fn stage_parses_from_cli_names() {
        assert_eq!(
            Stage::from_str("prepare-base-model", true).unwrap(),
            Stage::PrepareBaseModel
        );
        assert_eq!(
            Stage::from_str("data_ingestion", true).unwrap(),
            Stage::DataIngestion
        );
    }

    #[test]
    fn missing_config_fails_the_stage() {
        let dir = TempDir::new().unwrap();
        let ctx = PipelineContext {
            config_path: dir.path().join("config.yaml"),
            params_path: dir.path().join("params.yaml"),
            track: false,
        };
        assert!(run_pipeline(Stage::Evaluation, &ctx).is_err());
    }

    #[test]
    fn failure_stops_later_stages() {
        let dir = TempDir::new().unwrap();
        let artifacts = dir.path().join("artifacts");
        let config = format!(
            r#"artifacts_root: {root}
data_ingestion:
  root_dir: {root}/data_ingestion
  source_URL: http://127.0.0.1:9/data.zip
  local_data_file: {root}/data_ingestion/data.zip
  unzip_dir: {root}/data_ingestion
prepare_base_model:
  root_dir: {root}/prepare_base_model
  base_model_path: {root}/prepare_base_model/base_model
  updated_base_model_path: {root}/prepare_base_model/base_model_updated
training:
  root_dir: {root}/training
  trained_model_path: {root}/training/model
evaluation:
  mlflow_uri: http://127.0.0.1:9
"#,
            root = artifacts.display()
        );
        let params = "AUGMENTATION: false\nIMAGE_SIZE: [32, 32, 3]\nBATCH_SIZE: 2\nINCLUDE_TOP: false\nEPOCHS: 1\nCLASSES: 2\nWEIGHTS: none\nLEARNING_RATE: 0.01\n";
        fs::write(dir.path().join("config.yaml"), config).unwrap();
        fs::write(dir.path().join("params.yaml"), params).unwrap();

        let ctx = PipelineContext {
            config_path: dir.path().join("config.yaml"),
            params_path: dir.path().join("params.yaml"),
            track: false,
        };

        // ingestion cannot download, so nothing after it may run
        assert!(run_pipeline(Stage::PrepareBaseModel, &ctx).is_err());
        assert!(!artifacts
            .join("prepare_base_model")
            .join("base_model.json")
            .exists());

        // the base model stage alone succeeds with random weights
        run_stage(Stage::PrepareBaseModel, &ctx).unwrap();
        assert!(artifacts
            .join("prepare_base_model")
            .join("base_model_updated.json")
            .exists());
    }
}
