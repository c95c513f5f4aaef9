use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    tensor::{backend::Backend, ElementConversion},
};
use serde::{Deserialize, Serialize};

use crate::{
    common::{load_json, save_json},
    data::{CtScanBatch, CtScanBatcher, DirectoryDataset, ImageItem, ImageTransform, Subset},
    entity::EvaluationConfig,
    model::{descriptor_path, load_classifier, record_path},
    tracking::{flatten_params, Metric, MlflowClient},
};

/// Share of each class the evaluator scores against.
pub const EVALUATION_SPLIT: f32 = 0.3;
const MODEL_ARTIFACT_DIR: &str = "model";
const NUM_WORKERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub loss: f64,
    pub accuracy: f64,
}

impl Score {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        load_json(path)
    }
}

/// Sample-weighted running totals over evaluation batches.
#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    loss: f64,
    correct: u64,
    samples: u64,
}

impl Totals {
    fn add(&mut self, mean_loss: f64, correct: u64, batch_size: usize) {
        self.loss += mean_loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size as u64;
    }

    fn score(&self) -> Option<Score> {
        (self.samples > 0).then(|| Score {
            loss: self.loss / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
        })
    }
}

pub struct Evaluation<B: Backend> {
    config: EvaluationConfig,
    device: B::Device,
    score: Option<Score>,
}

impl<B: Backend> Evaluation<B> {
    pub fn new(config: EvaluationConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            score: None,
        }
    }

    fn valid_loader(&self) -> Result<std::sync::Arc<dyn DataLoader<B, CtScanBatch<B>>>> {
        let dataset = DirectoryDataset::new(
            &self.config.training_data,
            EVALUATION_SPLIT,
            Subset::Validation,
        )?;
        if dataset.samples() == 0 {
            bail!(
                "no validation images under {}",
                self.config.training_data.display()
            );
        }

        let batcher = CtScanBatcher::new(ImageTransform::new(self.config.params_image_size));
        Ok(DataLoaderBuilder::<B, ImageItem, CtScanBatch<B>>::new(batcher)
            .batch_size(self.config.params_batch_size)
            .num_workers(NUM_WORKERS)
            .build(dataset))
    }

    /// Score the trained model on the held-out split and write the score file.
    pub fn evaluation(&mut self) -> Result<Score> {
        let (model, _) = load_classifier::<B>(&self.config.path_of_model, &self.device)
            .with_context(|| format!("loading {}", self.config.path_of_model.display()))?;
        let loader = self.valid_loader()?;

        let mut totals = Totals::default();
        for batch in loader.iter() {
            let batch_size = batch.targets.dims()[0];
            let output = model.forward_classification(batch);

            let mean_loss: f64 = output.loss.into_scalar().elem();
            let predicted = output.output.argmax(1).flatten::<1>(0, 1);
            let correct: i64 = predicted.equal(output.targets).int().sum().into_scalar().elem();

            totals.add(mean_loss, correct as u64, batch_size);
        }

        let score = totals
            .score()
            .ok_or_else(|| anyhow!("evaluation produced no batches"))?;
        tracing::info!("Evaluation loss: {:.4} | accuracy: {:.4}", score.loss, score.accuracy);

        self.score = Some(score);
        self.save_score()?;
        Ok(score)
    }

    pub fn save_score(&self) -> Result<()> {
        let score = self
            .score
            .ok_or_else(|| anyhow!("evaluation must run before save_score"))?;
        save_json(&self.config.score_path, &score)
    }

    fn model_files(&self) -> Vec<PathBuf> {
        let path = &self.config.path_of_model;
        [descriptor_path(path), record_path(path)]
            .into_iter()
            .filter(|p| p.is_file())
            .collect()
    }

    /// Push params, metrics and the model to the tracking server. Falls back
    /// to the score file when `evaluation` has not run in this process.
    pub fn log_into_mlflow(&self) -> Result<()> {
        let score = match self.score {
            Some(score) => score,
            None => Score::load(&self.config.score_path)
                .context("no evaluation score in memory or on disk")?,
        };
        let client = MlflowClient::new(&self.config.mlflow_uri)?;

        let run = client.create_run("evaluation")?;
        tracing::info!("Started tracking run {} on {}", run.run_id, client.base_url());

        let outcome = (|| -> Result<()> {
            let params = flatten_params(&self.config.all_params);
            let metrics = [Metric::new("loss", score.loss), Metric::new("accuracy", score.accuracy)];
            client.log_batch(&run.run_id, &params, &metrics)?;

            client.log_artifacts(&run, MODEL_ARTIFACT_DIR, &self.model_files())?;
            client.ensure_registered_model(&self.config.registered_model_name)?;
            let version = client.create_model_version(
                &self.config.registered_model_name,
                &run.run_id,
                MODEL_ARTIFACT_DIR,
            )?;
            tracing::info!(
                "Registered {} version {}",
                self.config.registered_model_name,
                version
            );
            Ok(())
        })();

        client.finish_run(&run.run_id, outcome.is_err())?;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::{FreezePolicy, ImageSize},
        model::{save_classifier, CtClassifierConfig},
        vgg::Vgg16Config,
    };
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::{fs, path::Path};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn eval_config(root: &Path) -> EvaluationConfig {
        EvaluationConfig {
            path_of_model: root.join("model"),
            training_data: root.join("data"),
            mlflow_uri: "http://127.0.0.1:9".to_string(),
            all_params: serde_yaml::Mapping::new(),
            params_image_size: ImageSize::new(32, 32, 3),
            params_batch_size: 4,
            score_path: root.join("scores.json"),
            registered_model_name: "VGG16Model".to_string(),
        }
    }

    #[test]
    fn totals_are_sample_weighted() {
        let mut totals = Totals::default();
        totals.add(1.0, 4, 4);
        totals.add(4.0, 0, 1);
        let score = totals.score().unwrap();
        assert!((score.loss - 8.0 / 5.0).abs() < 1e-12);
        assert!((score.accuracy - 0.8).abs() < 1e-12);
        assert!(Totals::default().score().is_none());
    }

    #[test]
    fn save_score_requires_evaluation() {
        let dir = TempDir::new().unwrap();
        let eval = Evaluation::<TestBackend>::new(eval_config(dir.path()), Default::default());
        assert!(eval.save_score().is_err());
        assert!(eval.log_into_mlflow().is_err());
    }

    #[test]
    fn evaluates_every_held_out_image() {
        let dir = TempDir::new().unwrap();
        let cfg = eval_config(dir.path());

        // 10 images per class: 3 + 3 held out, a partial final batch of 2
        for class in ["adenocarcinoma", "normal"] {
            let class_dir = cfg.training_data.join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..10u8 {
                RgbImage::from_pixel(8, 8, Rgb([i * 20, 0, 0]))
                    .save(class_dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }

        let model_config = CtClassifierConfig::new(
            Vgg16Config::new(ImageSize::new(32, 32, 3)),
            2,
            0.01,
            FreezePolicy::All,
        );
        let device = Default::default();
        save_classifier(model_config.init::<TestBackend>(&device), &model_config, &cfg.path_of_model)
            .unwrap();

        let mut eval = Evaluation::<TestBackend>::new(cfg.clone(), device);
        let score = eval.evaluation().unwrap();

        assert!(score.loss.is_finite());
        assert!((0.0..=1.0).contains(&score.accuracy));
        // accuracy is a multiple of 1/6
        let hits = score.accuracy * 6.0;
        assert!((hits - hits.round()).abs() < 1e-9);

        let stored = Score::load(&cfg.score_path).unwrap();
        assert_eq!(stored, score);
    }
}
