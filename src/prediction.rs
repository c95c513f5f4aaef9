use std::{fmt, marker::PhantomData, path::Path};

use anyhow::Result;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::{
    backend::DefaultBackend,
    data::{ImageBatch, ImageTransform, Interpolation},
    entity::{ImageSize, PredictionConfig},
    error::PredictionError,
    model::{load_classifier, save_classifier, CtClassifier, CtClassifierConfig},
};

/// Input geometry the served model expects.
pub const INPUT_SIZE: ImageSize = ImageSize {
    height: 224,
    width: 224,
    channels: 3,
};

pub const ERROR_LABEL: &str = "Error";

/// Opaque handle over a trained model.
pub trait Classifier: Sized {
    fn load(path: &Path) -> Result<Self>;

    /// Per-sample class scores, one row per image in the batch.
    fn infer(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>>;

    fn save(&self, path: &Path) -> Result<()>;
}

/// Classifier backed by a burn record on the given backend.
pub struct BurnClassifier<B: Backend> {
    model: CtClassifier<B>,
    config: CtClassifierConfig,
    device: B::Device,
}

impl<B: Backend> Classifier for BurnClassifier<B> {
    fn load(path: &Path) -> Result<Self> {
        let device = B::Device::default();
        let (model, config) = load_classifier::<B>(path, &device)?;
        tracing::info!(
            "Loaded classifier from {} ({} classes)",
            path.display(),
            config.num_classes
        );
        Ok(Self {
            model,
            config,
            device,
        })
    }

    fn infer(&self, batch: &ImageBatch) -> Result<Vec<Vec<f32>>> {
        let images = batch.to_tensor::<B>(&self.device)?;
        let probabilities = self.model.probabilities(images);
        let [rows, cols] = probabilities.dims();
        let values: Vec<f32> = probabilities
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("reading model output: {e:?}"))?;
        Ok((0..rows)
            .map(|r| values[r * cols..(r + 1) * cols].to_vec())
            .collect())
    }

    fn save(&self, path: &Path) -> Result<()> {
        save_classifier(self.model.clone(), &self.config, path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    Normal,
    AdenocarcinomaCancer,
}

impl Diagnosis {
    /// Index 1 is the normal class; every other index reads as cancer.
    pub fn from_index(index: usize) -> Self {
        if index == 1 {
            Diagnosis::Normal
        } else {
            Diagnosis::AdenocarcinomaCancer
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Diagnosis::Normal => "Normal",
            Diagnosis::AdenocarcinomaCancer => "Adenocarcinoma Cancer",
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of the prediction response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub image: String,
}

fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Single-image inference that reloads the model on every call.
pub struct PredictionPipeline<C: Classifier = BurnClassifier<DefaultBackend>> {
    config: PredictionConfig,
    transform: ImageTransform,
    _classifier: PhantomData<C>,
}

impl<C: Classifier> PredictionPipeline<C> {
    pub fn new(config: PredictionConfig) -> Self {
        Self {
            config,
            transform: ImageTransform::new(INPUT_SIZE).with_interpolation(Interpolation::Nearest),
            _classifier: PhantomData,
        }
    }

    pub fn classify(&self) -> Result<Diagnosis, PredictionError> {
        let model_path = &self.config.model_path;
        let image_path = &self.config.input_image;

        let model = C::load(model_path).map_err(|e| PredictionError::ModelLoad {
            path: model_path.clone(),
            reason: format!("{e:#}"),
        })?;

        let batch = ImageBatch::from_path(&self.transform, image_path).map_err(|e| {
            PredictionError::Decode {
                path: image_path.clone(),
                reason: format!("{e:#}"),
            }
        })?;

        let scores = model
            .infer(&batch)
            .map_err(|e| PredictionError::Inference(format!("{e:#}")))?;
        let first = scores.first().ok_or(PredictionError::EmptyOutput)?;
        let index = argmax(first).ok_or(PredictionError::EmptyOutput)?;

        tracing::debug!("Scores {:?} -> class {}", first, index);
        Ok(Diagnosis::from_index(index))
    }

    /// Always one record; failures are logged and reported as `Error`.
    pub fn predict(&self) -> Vec<PredictionRecord> {
        let label = match self.classify() {
            Ok(diagnosis) => {
                tracing::info!("Prediction for {}: {}", self.config.input_image.display(), diagnosis);
                diagnosis.label().to_string()
            }
            Err(e) => {
                tracing::error!("Prediction failed: {}", e);
                ERROR_LABEL.to_string()
            }
        };
        vec![PredictionRecord { image: label }]
    }
}
