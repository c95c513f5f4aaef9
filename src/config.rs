use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::common::create_directories;
use crate::entity::{
    DataIngestionConfig, EvaluationConfig, FreezePolicy, ImageSize, PredictionConfig,
    PrepareBaseModelConfig, TrainingConfig, WeightsSource,
};
use crate::error::ConfigError;

pub const CONFIG_FILE_PATH: &str = "config/config.yaml";
pub const PARAMS_FILE_PATH: &str = "params.yaml";

/// Directory created inside the unzip dir by the dataset archive.
pub const TRAINING_DATA_DIR_NAME: &str = "Chest-CT-Scan-data";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataIngestionSection {
    pub root_dir: PathBuf,
    #[serde(rename = "source_URL")]
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareBaseModelSection {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    #[serde(default = "default_pretrained_weights_path")]
    pub pretrained_weights_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSection {
    pub mlflow_uri: String,
    #[serde(default = "default_score_path")]
    pub score_path: PathBuf,
    #[serde(default = "default_registered_model_name")]
    pub registered_model_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionSection {
    /// Falls back to the trained model path when absent.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_input_image")]
    pub input_image: PathBuf,
}

/// `config/config.yaml`: paths and URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub artifacts_root: PathBuf,
    pub data_ingestion: DataIngestionSection,
    pub prepare_base_model: PrepareBaseModelSection,
    pub training: TrainingSection,
    pub evaluation: EvaluationSection,
    #[serde(default)]
    pub prediction: PredictionSection,
}

/// `params.yaml`: hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Params {
    pub augmentation: bool,
    pub image_size: Vec<usize>,
    pub batch_size: usize,
    pub include_top: bool,
    pub epochs: usize,
    pub classes: usize,
    #[serde(default)]
    pub weights: Option<String>,
    pub learning_rate: f64,
    #[serde(default = "default_freeze_all")]
    pub freeze_all: bool,
    #[serde(default)]
    pub freeze_till: Option<usize>,
}

fn default_pretrained_weights_path() -> PathBuf {
    PathBuf::from("artifacts/prepare_base_model/vgg16_imagenet")
}

fn default_score_path() -> PathBuf {
    PathBuf::from("scores.json")
}

fn default_registered_model_name() -> String {
    "VGG16Model".to_string()
}

fn default_input_image() -> PathBuf {
    PathBuf::from("inputImage.jpg")
}

fn default_freeze_all() -> bool {
    true
}

/// Read a YAML document, rejecting missing, empty and malformed files.
pub fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
        _ => ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    if content.trim().is_empty() {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }

    let value: Value = serde_yaml::from_str(&content).map_err(|e| {
        tracing::error!("Error loading YAML file '{}': {}", path.display(), e);
        ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        }
    })?;

    let empty = match &value {
        Value::Null => true,
        Value::Mapping(m) => m.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }

    tracing::info!("YAML file '{}' loaded successfully", path.display());
    Ok(value)
}

fn from_value<T: for<'de> Deserialize<'de>>(path: &Path, value: Value) -> Result<T, ConfigError> {
    serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds one immutable record per pipeline stage from the two YAML files.
#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    config: GeneralConfig,
    params: Params,
    raw_params: Mapping,
    image_size: ImageSize,
}

impl ConfigurationManager {
    pub fn new(
        config_filepath: impl AsRef<Path>,
        params_filepath: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let config_filepath = config_filepath.as_ref();
        let params_filepath = params_filepath.as_ref();

        let config: GeneralConfig = from_value(config_filepath, read_yaml(config_filepath)?)?;
        let params_value = read_yaml(params_filepath)?;
        let raw_params = match &params_value {
            Value::Mapping(m) => m.clone(),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "'{}' must be a mapping of hyperparameters",
                    params_filepath.display()
                )))
            }
        };
        let params: Params = from_value(params_filepath, params_value)?;
        let image_size = ImageSize::try_from(params.image_size.as_slice())?;

        validate(&config, &params)?;

        create_directories(&[&config.artifacts_root]).map_err(|source| ConfigError::Io {
            path: config.artifacts_root.clone(),
            source,
        })?;

        Ok(Self {
            config,
            params,
            raw_params,
            image_size,
        })
    }

    fn ensure_dir(path: &Path) -> Result<(), ConfigError> {
        create_directories(&[path]).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn training_data(&self) -> PathBuf {
        self.config
            .data_ingestion
            .unzip_dir
            .join(TRAINING_DATA_DIR_NAME)
    }

    pub fn get_data_ingestion_config(&self) -> Result<DataIngestionConfig, ConfigError> {
        let config = &self.config.data_ingestion;
        Self::ensure_dir(&config.root_dir)?;

        Ok(DataIngestionConfig {
            root_dir: config.root_dir.clone(),
            source_url: config.source_url.clone(),
            local_data_file: config.local_data_file.clone(),
            unzip_dir: config.unzip_dir.clone(),
        })
    }

    pub fn get_prepare_base_model_config(&self) -> Result<PrepareBaseModelConfig, ConfigError> {
        let config = &self.config.prepare_base_model;
        Self::ensure_dir(&config.root_dir)?;

        let weights = match self.params.weights.as_deref().map(str::trim) {
            None => WeightsSource::None,
            Some(w) if w.is_empty() || w.eq_ignore_ascii_case("none") => WeightsSource::None,
            Some(w) if w.eq_ignore_ascii_case("imagenet") => {
                WeightsSource::ImageNet(config.pretrained_weights_path.clone())
            }
            Some(w) => WeightsSource::File(PathBuf::from(w)),
        };

        Ok(PrepareBaseModelConfig {
            root_dir: config.root_dir.clone(),
            base_model_path: config.base_model_path.clone(),
            updated_base_model_path: config.updated_base_model_path.clone(),
            params_image_size: self.image_size,
            params_learning_rate: self.params.learning_rate,
            params_include_top: self.params.include_top,
            params_weights: weights,
            params_classes: self.params.classes,
            params_freeze: FreezePolicy::from_params(
                self.params.freeze_all,
                self.params.freeze_till,
            ),
        })
    }

    pub fn get_training_config(&self) -> Result<TrainingConfig, ConfigError> {
        let training = &self.config.training;
        Self::ensure_dir(&training.root_dir)?;

        Ok(TrainingConfig {
            root_dir: training.root_dir.clone(),
            trained_model_path: training.trained_model_path.clone(),
            updated_base_model_path: self.config.prepare_base_model.updated_base_model_path.clone(),
            training_data: self.training_data(),
            params_epochs: self.params.epochs,
            params_batch_size: self.params.batch_size,
            params_is_augmentation: self.params.augmentation,
            params_image_size: self.image_size,
        })
    }

    pub fn get_evaluation_config(&self) -> Result<EvaluationConfig, ConfigError> {
        let evaluation = &self.config.evaluation;
        if let Some(parent) = evaluation.score_path.parent() {
            if !parent.as_os_str().is_empty() {
                Self::ensure_dir(parent)?;
            }
        }

        Ok(EvaluationConfig {
            path_of_model: self.config.training.trained_model_path.clone(),
            training_data: self.training_data(),
            mlflow_uri: evaluation.mlflow_uri.clone(),
            all_params: self.raw_params.clone(),
            params_image_size: self.image_size,
            params_batch_size: self.params.batch_size,
            score_path: evaluation.score_path.clone(),
            registered_model_name: evaluation.registered_model_name.clone(),
        })
    }

    pub fn get_prediction_config(&self) -> Result<PredictionConfig, ConfigError> {
        let prediction = &self.config.prediction;
        let model_path = prediction
            .model_path
            .clone()
            .unwrap_or_else(|| self.config.training.trained_model_path.clone());

        Ok(PredictionConfig {
            model_path,
            input_image: prediction.input_image.clone(),
        })
    }
}

fn validate(config: &GeneralConfig, params: &Params) -> Result<(), ConfigError> {
    let root = &config.artifacts_root;
    if root.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("artifacts_root must not be empty".into()));
    }

    let staged = [
        ("data_ingestion.root_dir", &config.data_ingestion.root_dir),
        ("data_ingestion.local_data_file", &config.data_ingestion.local_data_file),
        ("data_ingestion.unzip_dir", &config.data_ingestion.unzip_dir),
        ("prepare_base_model.root_dir", &config.prepare_base_model.root_dir),
        ("prepare_base_model.base_model_path", &config.prepare_base_model.base_model_path),
        (
            "prepare_base_model.updated_base_model_path",
            &config.prepare_base_model.updated_base_model_path,
        ),
        ("training.root_dir", &config.training.root_dir),
        ("training.trained_model_path", &config.training.trained_model_path),
    ];
    for (name, path) in staged {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(format!("{name} must not be empty")));
        }
        if !path.starts_with(root) {
            return Err(ConfigError::Invalid(format!(
                "{name} ({}) is outside artifacts_root ({})",
                path.display(),
                root.display()
            )));
        }
    }

    if config.data_ingestion.source_url.trim().is_empty() {
        return Err(ConfigError::Invalid("data_ingestion.source_URL must not be empty".into()));
    }
    if config.evaluation.mlflow_uri.trim().is_empty() {
        return Err(ConfigError::Invalid("evaluation.mlflow_uri must not be empty".into()));
    }
    if params.batch_size == 0 {
        return Err(ConfigError::Invalid("BATCH_SIZE must be > 0".into()));
    }
    if params.epochs == 0 {
        return Err(ConfigError::Invalid("EPOCHS must be > 0".into()));
    }
    if params.classes == 0 {
        return Err(ConfigError::Invalid("CLASSES must be > 0".into()));
    }
    if !(params.learning_rate > 0.0) {
        return Err(ConfigError::Invalid("LEARNING_RATE must be > 0".into()));
    }
    Ok(())
}
