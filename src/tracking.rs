//! Minimal MLflow REST client.
//!
//! Covers what the evaluation stage needs: open a run, log params and
//! metrics, upload the model files as run artifacts, register a model
//! version and close the run.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_yaml::Mapping;

use crate::error::TrackingError;

pub const USERNAME_ENV: &str = "MLFLOW_TRACKING_USERNAME";
pub const PASSWORD_ENV: &str = "MLFLOW_TRACKING_PASSWORD";
const DEFAULT_EXPERIMENT_ID: &str = "0";
const ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";

#[derive(Debug, Clone, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    #[serde(default)]
    pub artifact_uri: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Param {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub timestamp: u64,
    pub step: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Metric {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: now_millis(),
            step: 0,
        }
    }
}

/// Render a YAML value as a param literal: `True`/`False`, `None`, `[a, b]`.
fn param_literal(value: &serde_yaml::Value, nested: bool) -> String {
    use serde_yaml::Value as Y;
    match value {
        Y::Null => "None".to_string(),
        Y::Bool(true) => "True".to_string(),
        Y::Bool(false) => "False".to_string(),
        Y::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.is_finite() && f.fract() == 0.0 => format!("{f:.1}"),
            _ => n.to_string(),
        },
        Y::String(s) if nested => format!("'{s}'"),
        Y::String(s) => s.clone(),
        Y::Sequence(items) => {
            let parts: Vec<String> = items.iter().map(|v| param_literal(v, true)).collect();
            format!("[{}]", parts.join(", "))
        }
        Y::Mapping(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", param_literal(k, true), param_literal(v, true)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Y::Tagged(tagged) => param_literal(&tagged.value, nested),
    }
}

/// One MLflow param per top-level key of the params file.
pub fn flatten_params(params: &Mapping) -> Vec<Param> {
    params
        .iter()
        .map(|(k, v)| Param {
            key: param_literal(k, false),
            value: param_literal(v, false),
        })
        .collect()
}

/// Artifact-server path for a run's artifact root, if it is served over HTTP.
fn artifact_server_path(artifact_uri: &str) -> Option<&str> {
    artifact_uri
        .strip_prefix(ARTIFACT_SCHEME)
        .map(|rest| rest.trim_start_matches('/'))
}

fn local_artifact_root(artifact_uri: &str) -> Option<PathBuf> {
    if let Some(path) = artifact_uri.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    let path = Path::new(artifact_uri);
    path.is_absolute().then(|| path.to_path_buf())
}

pub struct MlflowClient {
    base_url: String,
    client: Client,
    credentials: Option<(String, String)>,
}

impl MlflowClient {
    pub fn new(tracking_uri: &str) -> Result<Self, TrackingError> {
        let base_url = tracking_uri.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TrackingError::Response(format!(
                "unsupported tracking URI '{tracking_uri}', expected http(s)"
            )));
        }

        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| TrackingError::Http {
                endpoint: base_url.clone(),
                source,
            })?;

        let credentials = std::env::var(USERNAME_ENV)
            .ok()
            .map(|user| (user, std::env::var(PASSWORD_ENV).unwrap_or_default()));

        Ok(Self {
            base_url,
            client,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Value, TrackingError> {
        let response = self
            .authorize(request)
            .send()
            .map_err(|source| TrackingError::Http {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response.text().map_err(|source| TrackingError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(TrackingError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str(&body)
                .map_err(|e| TrackingError::Response(format!("{endpoint}: {e}")))
        }
    }

    fn post(&self, endpoint: &str, body: &Value) -> Result<Value, TrackingError> {
        let url = format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint);
        self.send(endpoint, self.client.post(url).json(body))
    }

    pub fn create_run(&self, run_name: &str) -> Result<RunInfo, TrackingError> {
        let response = self.post(
            "runs/create",
            &json!({
                "experiment_id": DEFAULT_EXPERIMENT_ID,
                "run_name": run_name,
                "start_time": now_millis(),
            }),
        )?;
        let info = response
            .pointer("/run/info")
            .cloned()
            .ok_or_else(|| TrackingError::Response("runs/create: missing run info".into()))?;
        serde_json::from_value(info).map_err(|e| TrackingError::Response(format!("runs/create: {e}")))
    }

    pub fn log_batch(
        &self,
        run_id: &str,
        params: &[Param],
        metrics: &[Metric],
    ) -> Result<(), TrackingError> {
        self.post(
            "runs/log-batch",
            &json!({ "run_id": run_id, "params": params, "metrics": metrics }),
        )?;
        Ok(())
    }

    /// Upload every regular file in `files` under `<artifact root>/<artifact_dir>/`.
    pub fn log_artifacts(
        &self,
        run: &RunInfo,
        artifact_dir: &str,
        files: &[PathBuf],
    ) -> Result<(), TrackingError> {
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| TrackingError::Response(format!("not a file: {}", file.display())))?;

            if let Some(root) = artifact_server_path(&run.artifact_uri) {
                let endpoint = format!("mlflow-artifacts/artifacts/{root}/{artifact_dir}/{name}");
                let url = format!("{}/api/2.0/{}", self.base_url, endpoint);
                let bytes = fs::read(file)?;
                self.send(&endpoint, self.client.put(url).body(bytes))?;
            } else if let Some(root) = local_artifact_root(&run.artifact_uri) {
                let target_dir = root.join(artifact_dir);
                fs::create_dir_all(&target_dir)?;
                fs::copy(file, target_dir.join(&name))?;
            } else {
                return Err(TrackingError::Response(format!(
                    "unsupported artifact store '{}'",
                    run.artifact_uri
                )));
            }
            tracing::debug!("Uploaded artifact {}/{}", artifact_dir, name);
        }
        Ok(())
    }

    /// Create the registered model, tolerating one that already exists.
    pub fn ensure_registered_model(&self, name: &str) -> Result<(), TrackingError> {
        match self.post("registered-models/create", &json!({ "name": name })) {
            Ok(_) => Ok(()),
            Err(TrackingError::Status { body, .. }) if body.contains("RESOURCE_ALREADY_EXISTS") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Register `runs:/<run_id>/<artifact_dir>` as a new version; returns the version.
    pub fn create_model_version(
        &self,
        name: &str,
        run_id: &str,
        artifact_dir: &str,
    ) -> Result<String, TrackingError> {
        let response = self.post(
            "model-versions/create",
            &json!({
                "name": name,
                "source": format!("runs:/{run_id}/{artifact_dir}"),
                "run_id": run_id,
            }),
        )?;
        Ok(response
            .pointer("/model_version/version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    pub fn finish_run(&self, run_id: &str, failed: bool) -> Result<(), TrackingError> {
        self.post(
            "runs/update",
            &json!({
                "run_id": run_id,
                "status": if failed { "FAILED" } else { "FINISHED" },
                "end_time": now_millis(),
            }),
        )?;
        Ok(())
    }
}
