//! HTTP surface: landing page, training trigger and prediction.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    backend::DefaultBackend,
    common::decode_image,
    entity::PredictionConfig,
    pipeline::Stage,
    prediction::{BurnClassifier, Classifier, PredictionPipeline, PredictionRecord},
};

const INDEX_HTML: &str = include_str!("../templates/index.html");
pub const TRAINING_DONE: &str = "Training done successfully!";

#[derive(Debug)]
pub struct AppState {
    pub config_path: PathBuf,
    pub params_path: PathBuf,
    /// Binary re-invoked to run the training stages.
    pub executable: PathBuf,
    pub prediction: PredictionConfig,
    /// Held while `prediction.input_image` is written and classified.
    input_lock: Mutex<()>,
}

impl AppState {
    pub fn new(
        config_path: PathBuf,
        params_path: PathBuf,
        executable: PathBuf,
        prediction: PredictionConfig,
    ) -> Self {
        Self {
            config_path,
            params_path,
            executable,
            prediction,
            input_lock: Mutex::new(()),
        }
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// GET / - landing page
pub async fn home() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET|POST /train - run the pipeline through training in a child process.
/// A failed run answers 500 with `{"error"}` instead of the success text.
pub async fn train_route(State(state): State<SharedState>) -> Response {
    let through = Stage::Training
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_else(|| "training".to_string());

    tracing::info!("Starting training run via {}", state.executable.display());
    let status = tokio::process::Command::new(&state.executable)
        .arg("--config")
        .arg(&state.config_path)
        .arg("--params")
        .arg(&state.params_path)
        .args(["run", "--through", &through])
        .status()
        .await;

    match status {
        Ok(status) if status.success() => TRAINING_DONE.into_response(),
        Ok(status) => {
            tracing::error!("Training process exited with {}", status);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("training failed ({status})"),
            )
        }
        Err(e) => {
            tracing::error!("Could not start training process: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// POST /predict - classify a base64-encoded image.
///
/// Always answers 200; failures carry `{"error": ...}` in the body.
pub async fn predict_route<C: Classifier + Send + 'static>(
    State(state): State<SharedState>,
    body: Bytes,
) -> Response {
    let request: PredictRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected prediction request: {}", e);
            return error_response(StatusCode::OK, format!("invalid request body: {e}"));
        }
    };

    // one request at a time owns the input file
    let _input = state.input_lock.lock().await;

    let config = state.prediction.clone();
    if let Err(e) = decode_image(&request.image, &config.input_image) {
        tracing::warn!("Rejected prediction request: {:#}", e);
        return error_response(StatusCode::OK, format!("{e:#}"));
    }

    let records: Result<Vec<PredictionRecord>, _> =
        tokio::task::spawn_blocking(move || PredictionPipeline::<C>::new(config).predict()).await;

    match records {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            tracing::error!("Prediction task failed: {}", e);
            error_response(StatusCode::OK, e.to_string())
        }
    }
}

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(home))
        .route("/train", get(train_route).post(train_route))
        .route(
            "/predict",
            post(predict_route::<BurnClassifier<DefaultBackend>>),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Serving on http://{}", addr);

    axum::serve(listener, router(Arc::new(state)))
        .await
        .context("server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::encode_image_into_base64, data::ImageBatch};
    use image::{Rgb, RgbImage};
    use std::{path::Path, time::Duration};
    use tempfile::TempDir;

    type Served = BurnClassifier<DefaultBackend>;

    fn state(dir: &Path) -> SharedState {
        Arc::new(AppState::new(
            dir.join("config.yaml"),
            dir.join("params.yaml"),
            dir.join("missing-binary"),
            PredictionConfig {
                model_path: dir.join("model"),
                input_image: dir.join("inputImage.jpg"),
            },
        ))
    }

    /// Picks "Normal" for bright images, slowly enough for requests to overlap.
    struct Brightness;

    impl Classifier for Brightness {
        fn load(_path: &Path) -> anyhow::Result<Self> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(Self)
        }

        fn infer(&self, batch: &ImageBatch) -> anyhow::Result<Vec<Vec<f32>>> {
            let mean = batch.data.iter().sum::<f32>() / batch.data.len() as f32;
            Ok(vec![if mean > 0.5 { vec![0.0, 1.0] } else { vec![1.0, 0.0] }])
        }

        fn save(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn image_body(dir: &Path, name: &str, value: u8) -> Bytes {
        let path = dir.join(name);
        RgbImage::from_pixel(16, 16, Rgb([value; 3])).save(&path).unwrap();
        let image = encode_image_into_base64(&path).unwrap();
        Bytes::from(serde_json::json!({ "image": image }).to_string())
    }

    async fn error_of(body: &'static str) -> String {
        let dir = TempDir::new().unwrap();
        let response = predict_route::<Served>(State(state(dir.path())), Bytes::from(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        body["error"].as_str().unwrap().to_string()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_base64_returns_error_payload() {
        let message = error_of(r#"{"image":"%%% not base64 %%%"}"#).await;
        assert!(!message.is_empty());
    }

    #[tokio::test]
    async fn missing_image_key_returns_error_payload() {
        let message = error_of(r#"{"img":"abc"}"#).await;
        assert!(message.contains("image"), "{message}");
    }

    #[tokio::test]
    async fn non_json_body_returns_error_payload() {
        let message = error_of("not json").await;
        assert!(message.starts_with("invalid request body"), "{message}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_keep_their_own_image() {
        let dir = TempDir::new().unwrap();
        let shared = state(dir.path());
        let bright = image_body(dir.path(), "bright.png", 255);
        let dark = image_body(dir.path(), "dark.png", 0);

        let (first, second) = tokio::join!(
            predict_route::<Brightness>(State(shared.clone()), bright),
            predict_route::<Brightness>(State(shared.clone()), dark),
        );

        assert_eq!(
            body_json(first).await,
            serde_json::json!([{ "image": "Normal" }])
        );
        assert_eq!(
            body_json(second).await,
            serde_json::json!([{ "image": "Adenocarcinoma Cancer" }])
        );
    }

    #[tokio::test]
    async fn missing_model_yields_error_label() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("upload.bin");
        std::fs::write(&upload, b"some bytes").unwrap();
        let body = Bytes::from(
            serde_json::json!({ "image": encode_image_into_base64(&upload).unwrap() }).to_string(),
        );
        let response = predict_route::<Served>(State(state(dir.path())), body).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, serde_json::json!([{ "image": "Error" }]));
        assert!(dir.path().join("inputImage.jpg").exists());
    }

    #[tokio::test]
    async fn training_reports_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let response = train_route(State(state(dir.path()))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn home_serves_landing_page() {
        let Html(page) = home().await;
        assert!(page.contains("<html"));
    }
}
