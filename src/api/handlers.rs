//! リクエストハンドラ

use axum::{
    extract::{Multipart, State},
    Json,
};
use image::ImageReader;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::errors::ApiError;
use super::http_server::AppState;
use crate::ml::Prediction;

/// 画像を受け取るマルチパートのフィールド名
pub const IMAGE_FIELD: &str = "image";

/// `POST /add_message` の応答
///
/// `result` は予測ラベル。`probabilities` は `/health` の `labels` と同じ順序。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifyResponse {
    pub result: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
}

impl From<Prediction> for ClassifyResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            result: prediction.label,
            confidence: prediction.confidence,
            probabilities: prediction.probabilities,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub labels: Vec<String>,
}

/// 受信したファイル名と中身
struct Upload {
    file_name: String,
    bytes: Vec<u8>,
}

/// アップロードを一時保存したファイル。drop 時に削除される
struct UploadedFile {
    path: PathBuf,
}

impl UploadedFile {
    async fn save(dir: &Path, original_name: &str, bytes: &[u8]) -> Result<Self, ApiError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to create upload dir: {}", e)))?;

        let file = Self {
            path: dir.join(format!("{}.{}", Uuid::new_v4(), upload_extension(original_name))),
        };
        tokio::fs::write(&file.path, bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to save upload: {}", e)))?;
        tracing::debug!("アップロードを保存しました: {} ({} bytes)", file.path.display(), bytes.len());
        Ok(file)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UploadedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("アップロードを削除しました: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("アップロードの削除に失敗しました {}: {}", self.path.display(), e),
        }
    }
}

/// 保存用の拡張子。英数字以外を含む場合は `bin`
fn upload_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        if file_name.is_empty() {
            return Err(ApiError::EmptyFilename);
        }
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::EmptyImage);
        }
        return Ok(Upload {
            file_name,
            bytes: bytes.to_vec(),
        });
    }
    Err(ApiError::MissingImage)
}

/// 画像を保存して分類し、保存したファイルを削除してから結果を返す
pub async fn add_message_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ClassifyResponse>, ApiError> {
    let upload = read_image_field(&mut multipart).await?;
    tracing::info!("画像を受信しました: {} ({} bytes)", upload.file_name, upload.bytes.len());

    let saved = UploadedFile::save(&state.upload_dir, &upload.file_name, &upload.bytes).await?;
    let path = saved.path().to_path_buf();
    let classifier = state.classifier.clone();

    let prediction = tokio::task::spawn_blocking(move || -> Result<Prediction, ApiError> {
        let image = ImageReader::open(&path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| ApiError::InvalidImage(e.to_string()))?
            .decode()
            .map_err(|e| ApiError::InvalidImage(e.to_string()))?;
        Ok(classifier.classify(&image)?)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("prediction task failed: {}", e)))??;
    drop(saved);

    tracing::info!(
        "予測結果: {} (確率 {:.3})",
        prediction.label,
        prediction.confidence
    );
    Ok(Json(prediction.into()))
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        labels: state.classifier.labels(),
    })
}
