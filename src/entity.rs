//! Immutable per-stage configuration records.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Input shape of the network, `IMAGE_SIZE: [height, width, channels]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageSize {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }
}

impl TryFrom<&[usize]> for ImageSize {
    type Error = ConfigError;

    fn try_from(dims: &[usize]) -> Result<Self, Self::Error> {
        match *dims {
            [height, width, channels] => {
                if height == 0 || width == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "IMAGE_SIZE spatial dimensions must be positive, got {dims:?}"
                    )));
                }
                if channels != 1 && channels != 3 {
                    return Err(ConfigError::Invalid(format!(
                        "IMAGE_SIZE channels must be 1 or 3, got {channels}"
                    )));
                }
                Ok(Self::new(height, width, channels))
            }
            _ => Err(ConfigError::Invalid(format!(
                "IMAGE_SIZE must be [height, width, channels], got {dims:?}"
            ))),
        }
    }
}

/// Where the backbone's initial weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSource {
    /// Random initialization.
    None,
    /// Converted ImageNet VGG16 weights stored as a burn record.
    ImageNet(PathBuf),
    /// Any other burn record holding VGG16 weights.
    File(PathBuf),
}

/// Which backbone layers stop receiving gradient updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezePolicy {
    All,
    /// Every layer except the last `n` is frozen.
    AllButLast(usize),
    Nothing,
}

impl FreezePolicy {
    pub fn from_params(freeze_all: bool, freeze_till: Option<usize>) -> Self {
        match (freeze_all, freeze_till) {
            (true, _) => FreezePolicy::All,
            (false, Some(n)) if n > 0 => FreezePolicy::AllButLast(n),
            _ => FreezePolicy::Nothing,
        }
    }

    /// How many leading layers out of `total` are frozen.
    ///
    /// `AllButLast(n)` with `n >= total` freezes nothing, matching slice
    /// semantics of `layers[:-n]`.
    pub fn frozen_count(&self, total: usize) -> usize {
        match *self {
            FreezePolicy::All => total,
            FreezePolicy::AllButLast(n) if n < total => total - n,
            FreezePolicy::AllButLast(_) | FreezePolicy::Nothing => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataIngestionConfig {
    pub root_dir: PathBuf,
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareBaseModelConfig {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub params_image_size: ImageSize,
    pub params_learning_rate: f64,
    pub params_include_top: bool,
    pub params_weights: WeightsSource,
    pub params_classes: usize,
    pub params_freeze: FreezePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub training_data: PathBuf,
    pub params_epochs: usize,
    pub params_batch_size: usize,
    pub params_is_augmentation: bool,
    pub params_image_size: ImageSize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationConfig {
    pub path_of_model: PathBuf,
    pub training_data: PathBuf,
    pub mlflow_uri: String,
    /// Full hyperparameter document, logged verbatim to the tracking service.
    pub all_params: serde_yaml::Mapping,
    pub params_image_size: ImageSize,
    pub params_batch_size: usize,
    pub score_path: PathBuf,
    pub registered_model_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionConfig {
    pub model_path: PathBuf,
    /// Fixed file the HTTP layer writes each decoded upload to.
    pub input_image: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_requires_three_dims() {
        assert_eq!(
            ImageSize::try_from(&[224usize, 224, 3][..]).unwrap(),
            ImageSize::new(224, 224, 3)
        );
        assert!(ImageSize::try_from(&[224usize, 224][..]).is_err());
        assert!(ImageSize::try_from(&[224usize, 224, 3, 1][..]).is_err());
        assert!(ImageSize::try_from(&[0usize, 224, 3][..]).is_err());
        assert!(ImageSize::try_from(&[224usize, 224, 4][..]).is_err());
    }

    #[test]
    fn freeze_policy_counts_from_the_end() {
        assert_eq!(FreezePolicy::All.frozen_count(19), 19);
        assert_eq!(FreezePolicy::Nothing.frozen_count(19), 0);
        assert_eq!(FreezePolicy::AllButLast(4).frozen_count(19), 15);
        assert_eq!(FreezePolicy::AllButLast(19).frozen_count(19), 0);
        assert_eq!(FreezePolicy::AllButLast(40).frozen_count(19), 0);
    }

    #[test]
    fn freeze_policy_from_params() {
        assert_eq!(FreezePolicy::from_params(true, Some(3)), FreezePolicy::All);
        assert_eq!(FreezePolicy::from_params(false, Some(3)), FreezePolicy::AllButLast(3));
        assert_eq!(FreezePolicy::from_params(false, Some(0)), FreezePolicy::Nothing);
        assert_eq!(FreezePolicy::from_params(false, None), FreezePolicy::Nothing);
    }
}
