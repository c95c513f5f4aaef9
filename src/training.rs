use crate::{
    augmentation::AugmentationConfig,
    data::{CtScanBatch, CtScanBatcher, DirectoryDataset, ImageItem, ImageTransform, Subset},
    entity::TrainingConfig,
    model::{load_classifier, save_classifier, CtClassifier, CtClassifierConfig},
};
use anyhow::{anyhow, Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    optim::SgdConfig,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder,
    },
};
use std::sync::Arc;

/// Share of each class held out for validation while training.
pub const VALIDATION_SPLIT: f32 = 0.2;
const SHUFFLE_SEED: u64 = 42;
const NUM_WORKERS: usize = 2;

/// Whole batches that fit into `samples`.
pub fn steps_for(samples: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        samples / batch_size
    }
}

/// Training and validation flows over the same directory.
#[derive(Debug, Clone)]
pub struct Generators {
    pub train: DirectoryDataset,
    pub valid: DirectoryDataset,
    pub train_transform: ImageTransform,
    pub valid_transform: ImageTransform,
}

impl Generators {
    pub fn steps_per_epoch(&self, batch_size: usize) -> usize {
        steps_for(self.train.samples(), batch_size)
    }

    pub fn validation_steps(&self, batch_size: usize) -> usize {
        steps_for(self.valid.samples(), batch_size)
    }

    /// Training items seen in `epoch`: a fresh shuffle cut to whole batches.
    pub fn epoch_train(&self, epoch: usize, batch_size: usize) -> DirectoryDataset {
        self.train
            .clone()
            .shuffled(SHUFFLE_SEED + epoch as u64)
            .truncated(self.steps_per_epoch(batch_size) * batch_size)
    }
}

pub struct Training<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    model: Option<(CtClassifier<B>, CtClassifierConfig)>,
    generators: Option<Generators>,
}

impl<B: AutodiffBackend> Training<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            model: None,
            generators: None,
        }
    }

    /// Load the prepared classifier and restore its frozen layers.
    pub fn get_base_model(&mut self) -> Result<()> {
        let path = &self.config.updated_base_model_path;
        tracing::info!("Loading updated base model from {}", path.display());

        let (model, model_config) = load_classifier::<B>(path, &self.device)
            .with_context(|| format!("loading updated base model {}", path.display()))?;
        let model = model.freeze(model_config.freeze);

        self.model = Some((model, model_config));
        Ok(())
    }

    pub fn train_valid_generator(&mut self) -> Result<()> {
        let data_dir = &self.config.training_data;
        let valid_transform = ImageTransform::new(self.config.params_image_size);
        let train_transform = if self.config.params_is_augmentation {
            valid_transform
                .clone()
                .with_augmentation(Some(AugmentationConfig::default()))
        } else {
            valid_transform.clone()
        };

        let valid = DirectoryDataset::new(data_dir, VALIDATION_SPLIT, Subset::Validation)?;
        let train = DirectoryDataset::new(data_dir, VALIDATION_SPLIT, Subset::Training)?;

        tracing::info!(
            "Classes under {}: {:?} | train: {} | valid: {} | augmentation: {}",
            train.root().display(),
            train.class_names(),
            train.samples(),
            valid.samples(),
            self.config.params_is_augmentation
        );

        self.generators = Some(Generators {
            train,
            valid,
            train_transform,
            valid_transform,
        });
        Ok(())
    }

    pub fn generators(&self) -> Option<&Generators> {
        self.generators.as_ref()
    }

    fn create_dataloaders(
        &self,
        generators: &Generators,
        epoch: usize,
        validation_steps: usize,
    ) -> (
        Arc<dyn DataLoader<B, CtScanBatch<B>>>,
        Arc<dyn DataLoader<B::InnerBackend, CtScanBatch<B::InnerBackend>>>,
    ) {
        let batch_size = self.config.params_batch_size;

        let train_data = generators.epoch_train(epoch, batch_size);
        let valid_data = generators
            .valid
            .clone()
            .truncated(validation_steps * batch_size);

        let batcher_train = CtScanBatcher::new(generators.train_transform.clone());
        let batcher_valid = CtScanBatcher::new(generators.valid_transform.clone());

        let train_loader = DataLoaderBuilder::<B, ImageItem, CtScanBatch<B>>::new(batcher_train)
            .batch_size(batch_size)
            .num_workers(NUM_WORKERS)
            .build(train_data);

        let valid_loader = DataLoaderBuilder::<
            B::InnerBackend,
            ImageItem,
            CtScanBatch<B::InnerBackend>,
        >::new(batcher_valid)
        .batch_size(batch_size)
        .num_workers(NUM_WORKERS)
        .build(valid_data);

        (train_loader, valid_loader)
    }

    /// Fit the loaded model on the prepared flows and persist the result.
    pub fn train(self) -> Result<()> {
        let (model, model_config) = self
            .model
            .clone()
            .ok_or_else(|| anyhow!("get_base_model must run before train"))?;
        let generators = self
            .generators
            .clone()
            .ok_or_else(|| anyhow!("train_valid_generator must run before train"))?;

        let batch_size = self.config.params_batch_size;
        let steps_per_epoch = generators.steps_per_epoch(batch_size);
        let validation_steps = generators.validation_steps(batch_size);

        tracing::info!(
            "Training for {} epochs | steps_per_epoch: {} | validation_steps: {} | backend: {}",
            self.config.params_epochs,
            steps_per_epoch,
            validation_steps,
            std::any::type_name::<B>()
        );

        if validation_steps == 0 {
            tracing::warn!(
                "Only {} validation images for batch size {}, validation epochs will be empty",
                generators.valid.samples(),
                batch_size
            );
        }

        let mut model = model;
        if steps_per_epoch == 0 {
            tracing::warn!(
                "Only {} training images for batch size {}, every epoch is empty",
                generators.train.samples(),
                batch_size
            );
        } else {
            let start_time = std::time::Instant::now();
            let epochs = self.config.params_epochs;
            for epoch in 1..=epochs {
                tracing::info!("Epoch {}/{}", epoch, epochs);
                let (train_loader, valid_loader) =
                    self.create_dataloaders(&generators, epoch, validation_steps);
                model = self.fit(model, &model_config, train_loader, valid_loader);
            }
            tracing::info!("Training finished in {:?}", start_time.elapsed());
        }

        save_classifier(model, &model_config, &self.config.trained_model_path)
    }

    /// One pass of the learner over the given loaders.
    fn fit(
        &self,
        model: CtClassifier<B>,
        model_config: &CtClassifierConfig,
        train_loader: Arc<dyn DataLoader<B, CtScanBatch<B>>>,
        valid_loader: Arc<dyn DataLoader<B::InnerBackend, CtScanBatch<B::InnerBackend>>>,
    ) -> CtClassifier<B> {
        let learner = LearnerBuilder::new(&self.config.root_dir)
            .metric_train_numeric(AccuracyMetric::new())
            .metric_valid_numeric(AccuracyMetric::new())
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .with_file_checkpointer(CompactRecorder::new())
            .devices(vec![self.device.clone()])
            .num_epochs(1)
            .summary()
            .build(model, SgdConfig::new().init(), model_config.learning_rate);

        learner.fit(train_loader, valid_loader)
    }
}
