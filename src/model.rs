// src/model.rs
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use burn::{
    config::Config,
    module::Module,
    record::{CompactRecorder, Recorder},
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        loss::cross_entropy_with_logits,
        Int, Tensor,
    },
    train::{TrainOutput, TrainStep, ValidStep},
};

use crate::{
    data::CtScanBatch,
    entity::FreezePolicy,
    heads::ClassificationHead,
    vgg::{Vgg16, Vgg16Config},
};

#[derive(Debug, Clone)]
pub struct ClassificationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub output: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> burn::train::metric::ItemLazy for ClassificationOutput<B> {
    type ItemSync = Self;
    fn sync(self) -> Self::ItemSync {
        self
    }
}

impl<B: Backend> burn::train::metric::Adaptor<burn::train::metric::LossInput<B>>
    for ClassificationOutput<B>
{
    fn adapt(&self) -> burn::train::metric::LossInput<B> {
        burn::train::metric::LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> burn::train::metric::Adaptor<burn::train::metric::AccuracyInput<B>>
    for ClassificationOutput<B>
{
    fn adapt(&self) -> burn::train::metric::AccuracyInput<B> {
        burn::train::metric::AccuracyInput::new(self.output.clone(), self.targets.clone())
    }
}

/// Architecture plus the "compile" settings of the full classifier.
///
/// Stored as JSON next to the weights so a later stage can rebuild the
/// exact same network before loading the record.
#[derive(Config, Debug)]
pub struct CtClassifierConfig {
    pub backbone: Vgg16Config,
    pub num_classes: usize,
    pub learning_rate: f64,
    pub freeze: FreezePolicy,
    #[config(default = "String::from(\"sgd\")")]
    pub optimizer: String,
    #[config(default = "String::from(\"categorical_crossentropy\")")]
    pub loss: String,
    #[config(default = "vec![String::from(\"accuracy\")]")]
    pub metrics: Vec<String>,
}

impl CtClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CtClassifier<B> {
        CtClassifier {
            backbone: self.backbone.init(device),
            head: ClassificationHead::new(
                self.backbone.output_features(),
                self.num_classes,
                device,
            ),
        }
    }
}

/// VGG16 backbone with a dense softmax head.
#[derive(Module, Debug)]
pub struct CtClassifier<B: Backend> {
    backbone: Vgg16<B>,
    head: ClassificationHead<B>,
}

impl<B: Backend> CtClassifier<B> {
    pub fn from_backbone(backbone: Vgg16<B>, config: &CtClassifierConfig, device: &B::Device) -> Self {
        let head = ClassificationHead::new(
            config.backbone.output_features(),
            config.num_classes,
            device,
        );
        Self { backbone, head }
    }

    /// Flattened backbone output, shape `[batch, features]`.
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.backbone.forward(images)
    }

    /// Class logits, shape `[batch, num_classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.features(images))
    }

    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn freeze(self, policy: FreezePolicy) -> Self {
        Self {
            backbone: self.backbone.freeze(policy),
            head: self.head,
        }
    }

    pub fn backbone_layers(&self) -> usize {
        self.backbone.layer_count()
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    /// Categorical cross-entropy against one-hot targets.
    pub fn compute_loss(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let num_classes = logits.dims()[1];
        let targets_one_hot = targets.one_hot(num_classes).float();
        cross_entropy_with_logits(logits, targets_one_hot)
    }

    pub fn forward_classification(&self, batch: CtScanBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.images);
        let loss = self.compute_loss(output.clone(), batch.targets.clone());

        ClassificationOutput {
            loss,
            output,
            targets: batch.targets,
        }
    }
}

impl<B: AutodiffBackend> TrainStep<CtScanBatch<B>, ClassificationOutput<B>> for CtClassifier<B> {
    fn step(&self, batch: CtScanBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch);
        let grads = item.loss.backward();

        TrainOutput::new(
            self,
            grads,
            ClassificationOutput {
                loss: item.loss.detach(),
                output: item.output.detach(),
                targets: item.targets,
            },
        )
    }
}

impl<B: Backend> ValidStep<CtScanBatch<B>, ClassificationOutput<B>> for CtClassifier<B> {
    fn step(&self, batch: CtScanBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}

/// Extension `CompactRecorder` gives the weights file.
pub const RECORD_EXTENSION: &str = "mpk.gz";

/// JSON architecture descriptor stored beside a weights record.
pub fn descriptor_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

pub fn record_path(path: &Path) -> PathBuf {
    path.with_extension(RECORD_EXTENSION)
}

/// True when `path` names a weights record, with or without its extension.
pub fn record_exists(path: &Path) -> bool {
    path.is_file() || record_path(path).is_file()
}

fn save_record<B: Backend, M: Module<B>>(model: M, path: &Path) -> Result<()> {
    CompactRecorder::new()
        .record(model.into_record(), path.to_path_buf())
        .map_err(|e| anyhow!("cannot save model to {}: {}", path.display(), e))
}

fn load_record<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    let record = CompactRecorder::new()
        .load(path.to_path_buf(), device)
        .map_err(|e| anyhow!("cannot load model from {}: {}", path.display(), e))?;
    Ok(model.load_record(record))
}

pub fn save_backbone<B: Backend>(model: Vgg16<B>, config: &Vgg16Config, path: &Path) -> Result<()> {
    config
        .save(descriptor_path(path))
        .map_err(|e| anyhow!("cannot write {}: {}", descriptor_path(path).display(), e))?;
    save_record::<B, _>(model, path)?;
    tracing::info!("Saved base model to {}", path.display());
    Ok(())
}

/// Load VGG16 weights from a record into a freshly built backbone.
pub fn load_backbone_weights<B: Backend>(
    model: Vgg16<B>,
    path: &Path,
    device: &B::Device,
) -> Result<Vgg16<B>> {
    load_record::<B, _>(model, path, device)
}

pub fn save_classifier<B: Backend>(
    model: CtClassifier<B>,
    config: &CtClassifierConfig,
    path: &Path,
) -> Result<()> {
    config
        .save(descriptor_path(path))
        .map_err(|e| anyhow!("cannot write {}: {}", descriptor_path(path).display(), e))?;
    save_record::<B, _>(model, path)?;
    tracing::info!("Saved classifier to {}", path.display());
    Ok(())
}

/// Rebuild a classifier from its descriptor and load its weights.
///
/// The freeze policy is not part of the weights record; callers that train
/// re-apply it with [`CtClassifier::freeze`].
pub fn load_classifier<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(CtClassifier<B>, CtClassifierConfig)> {
    let descriptor = descriptor_path(path);
    let config = CtClassifierConfig::load(&descriptor)
        .map_err(|e| anyhow!("cannot read model descriptor {}: {}", descriptor.display(), e))?;
    let model = load_record::<B, _>(config.init::<B>(device), path, device)?;
    Ok((model, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ImageSize;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn small_config() -> CtClassifierConfig {
        CtClassifierConfig::new(
            Vgg16Config::new(ImageSize::new(32, 32, 3)),
            2,
            0.01,
            FreezePolicy::All,
        )
    }

    #[test]
    fn forward_shapes() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);
        assert_eq!(model.backbone_layers(), 19);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(model.forward(images.clone()).dims(), [2, 2]);

        let probs: Vec<f32> = model.probabilities(images).sum_dim(1).into_data().to_vec().unwrap();
        for p in probs {
            assert!((p - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn loss_is_positive_scalar() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);
        let logits = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [0.0, 2.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 0], &device);

        let loss = model.compute_loss(logits, targets);
        assert_eq!(loss.dims(), [1]);
        let value: f32 = loss.into_scalar();
        assert!(value > 0.0);
    }

    #[test]
    fn classifier_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model");
        let device = Default::default();
        let config = small_config();
        let model = config.init::<TestBackend>(&device);

        save_classifier(model, &config, &path).unwrap();
        assert!(descriptor_path(&path).exists());
        assert!(record_exists(&path));

        let (loaded, loaded_config) = load_classifier::<TestBackend>(&path, &device).unwrap();
        assert_eq!(loaded_config.num_classes, 2);
        assert_eq!(loaded_config.freeze, FreezePolicy::All);
        assert_eq!(loaded_config.optimizer, "sgd");
        assert_eq!(loaded.num_classes(), 2);
    }

    #[test]
    fn missing_model_is_an_error() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        assert!(load_classifier::<TestBackend>(&dir.path().join("absent"), &device).is_err());
    }
}
