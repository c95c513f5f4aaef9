//! Small file helpers shared by every stage.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Serialize};

/// `mkdir -p` for each path.
pub fn create_directories<P: AsRef<Path>>(paths: &[P]) -> std::io::Result<()> {
    for path in paths {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        tracing::info!("Created directory at: {}", path.display());
    }
    Ok(())
}

pub fn save_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    fs::write(path, json).with_context(|| format!("cannot write JSON to {}", path.display()))?;
    tracing::info!("JSON file saved at: {}", path.display());
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("cannot read JSON from {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("malformed JSON in {}", path.display()))?;
    tracing::info!("JSON file loaded successfully from: {}", path.display());
    Ok(value)
}

/// Human-readable file size, rounded to KB.
pub fn get_size(path: &Path) -> std::io::Result<String> {
    let bytes = fs::metadata(path)?.len();
    Ok(format!("~ {} KB", (bytes as f64 / 1024.0).round() as u64))
}

/// Decode a base64 payload and write the raw bytes to `file_name`.
pub fn decode_image(encoded: &str, file_name: &Path) -> Result<()> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("image payload is not valid base64")?;
    fs::write(file_name, bytes)
        .with_context(|| format!("cannot write image to {}", file_name.display()))?;
    tracing::info!("Image decoded and saved at: {}", file_name.display());
    Ok(())
}

pub fn encode_image_into_base64(image_path: &Path) -> Result<String> {
    let bytes = fs::read(image_path)
        .with_context(|| format!("cannot read image {}", image_path.display()))?;
    Ok(STANDARD.encode(bytes))
}
