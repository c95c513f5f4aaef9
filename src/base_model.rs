use anyhow::{bail, Context, Result};
use burn::{module::Module, tensor::backend::Backend};

use crate::{
    entity::{PrepareBaseModelConfig, WeightsSource},
    model::{
        load_backbone_weights, record_exists, save_backbone, save_classifier, CtClassifier,
        CtClassifierConfig,
    },
    vgg::{Vgg16, Vgg16Config},
};

/// Builds the VGG16 backbone and turns it into the CT classifier.
pub struct PrepareBaseModel<B: Backend> {
    config: PrepareBaseModelConfig,
    device: B::Device,
    model: Option<Vgg16<B>>,
}

impl<B: Backend> PrepareBaseModel<B> {
    pub fn new(config: PrepareBaseModelConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            model: None,
        }
    }

    fn backbone_config(&self) -> Vgg16Config {
        Vgg16Config::new(self.config.params_image_size)
            .with_include_top(self.config.params_include_top)
    }

    /// Build the backbone, load its weights and persist it unmodified.
    pub fn get_base_model(&mut self) -> Result<()> {
        let backbone_config = self.backbone_config();
        backbone_config.check()?;

        let model = backbone_config.init::<B>(&self.device);
        let model = match &self.config.params_weights {
            WeightsSource::None => {
                tracing::info!("Initialising VGG16 with random weights");
                model
            }
            WeightsSource::ImageNet(path) | WeightsSource::File(path) => {
                if !record_exists(path) {
                    bail!("pretrained weights not found at {}", path.display());
                }
                tracing::info!("Loading VGG16 weights from {}", path.display());
                load_backbone_weights(model, path, &self.device)?
            }
        };

        save_backbone(model.clone(), &backbone_config, &self.config.base_model_path)
            .with_context(|| format!("saving {}", self.config.base_model_path.display()))?;
        self.model = Some(model);
        Ok(())
    }

    /// Freeze, attach the classification head, record the training setup
    /// and persist the full model.
    pub fn update_base_model(&mut self) -> Result<()> {
        let Some(backbone) = self.model.take() else {
            bail!("get_base_model must run before update_base_model");
        };

        let classifier_config = CtClassifierConfig::new(
            self.backbone_config(),
            self.config.params_classes,
            self.config.params_learning_rate,
            self.config.params_freeze,
        );

        let total_layers = backbone.layer_count();
        let frozen = self.config.params_freeze.frozen_count(total_layers);
        let backbone = backbone.freeze(self.config.params_freeze);
        let model = CtClassifier::from_backbone(backbone, &classifier_config, &self.device);

        log_summary(&model, &classifier_config, total_layers, frozen);

        save_classifier(model, &classifier_config, &self.config.updated_base_model_path)
            .with_context(|| format!("saving {}", self.config.updated_base_model_path.display()))
    }
}

fn log_summary<B: Backend>(
    model: &CtClassifier<B>,
    config: &CtClassifierConfig,
    total_layers: usize,
    frozen: usize,
) {
    tracing::info!("Model summary:\n{}", model);
    tracing::info!(
        "Total params: {} | backbone layers: {} | frozen: {} | classes: {}",
        model.num_params(),
        total_layers,
        frozen,
        config.num_classes
    );
    tracing::info!(
        "Compiled with optimizer={} (lr={}) loss={} metrics={:?}",
        config.optimizer,
        config.learning_rate,
        config.loss,
        config.metrics
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::{FreezePolicy, ImageSize},
        model::{descriptor_path, load_classifier},
    };
    use burn::backend::NdArray;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn config(root: &Path, weights: WeightsSource, freeze: FreezePolicy) -> PrepareBaseModelConfig {
        PrepareBaseModelConfig {
            root_dir: root.to_path_buf(),
            base_model_path: root.join("base_model"),
            updated_base_model_path: root.join("base_model_updated"),
            params_image_size: ImageSize::new(32, 32, 3),
            params_learning_rate: 0.01,
            params_include_top: false,
            params_weights: weights,
            params_classes: 2,
            params_freeze: freeze,
        }
    }

    #[test]
    fn prepares_and_persists_both_models() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WeightsSource::None, FreezePolicy::All);
        let mut prep = PrepareBaseModel::<TestBackend>::new(cfg.clone(), Default::default());

        prep.get_base_model().unwrap();
        assert!(descriptor_path(&cfg.base_model_path).exists());

        prep.update_base_model().unwrap();
        let (model, stored) =
            load_classifier::<TestBackend>(&cfg.updated_base_model_path, &Default::default()).unwrap();
        assert_eq!(stored.num_classes, 2);
        assert_eq!(stored.loss, "categorical_crossentropy");
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn saved_backbone_can_seed_another_model() {
        let dir = TempDir::new().unwrap();
        let first = config(dir.path(), WeightsSource::None, FreezePolicy::All);
        PrepareBaseModel::<TestBackend>::new(first.clone(), Default::default())
            .get_base_model()
            .unwrap();

        let other = TempDir::new().unwrap();
        let cfg = config(
            other.path(),
            WeightsSource::File(first.base_model_path.clone()),
            FreezePolicy::AllButLast(2),
        );
        let mut prep = PrepareBaseModel::<TestBackend>::new(cfg, Default::default());
        prep.get_base_model().unwrap();
        prep.update_base_model().unwrap();
    }

    #[test]
    fn missing_weights_file_fails() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            dir.path(),
            WeightsSource::ImageNet(dir.path().join("absent")),
            FreezePolicy::All,
        );
        let mut prep = PrepareBaseModel::<TestBackend>::new(cfg, Default::default());
        assert!(prep.get_base_model().is_err());
    }

    #[test]
    fn update_requires_base_model() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WeightsSource::None, FreezePolicy::All);
        let mut prep = PrepareBaseModel::<TestBackend>::new(cfg, Default::default());
        assert!(prep.update_base_model().is_err());
    }
}
