//! 推論 HTTP サーバー

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers::{add_message_handler, health_handler};
use crate::ml::ImageClassifier;
use crate::model::ServerSettings;

#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<dyn ImageClassifier>,
    pub upload_dir: PathBuf,
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        // 予測（モバイルクライアント互換のパス）
        .route("/add_message", post(add_message_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// サーバーを起動し、Ctrl+C を受けるまで待機する
pub async fn serve(settings: &ServerSettings, classifier: Arc<dyn ImageClassifier>) -> anyhow::Result<()> {
    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address: {}", settings.bind_addr))?;

    let upload_dir = PathBuf::from(&settings.upload_dir);
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .with_context(|| format!("Failed to create upload dir: {}", upload_dir.display()))?;

    let state = AppState {
        classifier,
        upload_dir,
    };
    let app = build_router(state, settings.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("サーバーを停止しました");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("シグナルの待機に失敗しました: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("停止要求を受け付けました");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::errors::ErrorResponse;
    use crate::api::handlers::{ClassifyResponse, HealthResponse};
    use crate::ml::Prediction;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "roi-classifier-test-boundary";

    /// 平均の赤が緑より強ければ ROI と判定するスタブ
    struct ColorClassifier;

    impl ImageClassifier for ColorClassifier {
        fn labels(&self) -> Vec<String> {
            vec!["ROI".to_string(), "background".to_string()]
        }

        fn classify(&self, image: &DynamicImage) -> anyhow::Result<Prediction> {
            let (mut red, mut green) = (0u64, 0u64);
            for (_, _, pixel) in image.pixels() {
                red += pixel[0] as u64;
                green += pixel[1] as u64;
            }
            let class_index = if red > green { 0 } else { 1 };
            let mut probabilities = vec![0.1, 0.1];
            probabilities[class_index] = 0.9;
            Ok(Prediction {
                label: self.labels()[class_index].clone(),
                class_index,
                confidence: 0.9,
                probabilities,
            })
        }
    }

    struct FailingClassifier;

    impl ImageClassifier for FailingClassifier {
        fn labels(&self) -> Vec<String> {
            vec!["a".to_string(), "b".to_string()]
        }

        fn classify(&self, _image: &DynamicImage) -> anyhow::Result<Prediction> {
            anyhow::bail!("backend exploded")
        }
    }

    fn png_bytes(color: [u8; 3]) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb(color)))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn multipart_request(field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/add_message")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn test_router(classifier: Arc<dyn ImageClassifier>, upload_dir: &std::path::Path, limit: usize) -> Router {
        build_router(
            AppState {
                classifier,
                upload_dir: upload_dir.to_path_buf(),
            },
            limit,
        )
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn upload_count(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_add_message_classifies_and_removes_upload() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let app = test_router(Arc::new(ColorClassifier), &uploads, 1 << 20);

        let response = app
            .clone()
            .oneshot(multipart_request("image", "roi.png", &png_bytes([220, 10, 10])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ClassifyResponse = read_json(response).await;
        assert_eq!(body.result, "ROI");
        assert_eq!(body.probabilities.len(), 2);

        let response = app
            .oneshot(multipart_request("image", "bg", &png_bytes([10, 220, 10])))
            .await
            .unwrap();
        let body: ClassifyResponse = read_json(response).await;
        assert_eq!(body.result, "background");

        assert_eq!(upload_count(&uploads), 0);
    }

    #[tokio::test]
    async fn test_missing_image_field() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(Arc::new(ColorClassifier), dir.path(), 1 << 20);

        let response = app
            .oneshot(multipart_request("file", "roi.png", &png_bytes([1, 2, 3])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = read_json(response).await;
        assert_eq!(body.error_type, "missing_image");
    }

    #[tokio::test]
    async fn test_empty_filename_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(Arc::new(ColorClassifier), dir.path(), 1 << 20);

        let response = app
            .clone()
            .oneshot(multipart_request("image", "", &png_bytes([1, 2, 3])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = read_json(response).await;
        assert_eq!(body.error_type, "empty_filename");

        let response = app.oneshot(multipart_request("image", "x.png", b"")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = read_json(response).await;
        assert_eq!(body.error_type, "empty_image");
    }

    #[tokio::test]
    async fn test_undecodable_image_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(Arc::new(ColorClassifier), dir.path(), 1 << 20);

        let response = app
            .oneshot(multipart_request("image", "broken.jpg", b"not really a jpeg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = read_json(response).await;
        assert_eq!(body.error_type, "invalid_image");
        assert_eq!(upload_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_inference_failure_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(Arc::new(FailingClassifier), dir.path(), 1 << 20);

        let response = app
            .oneshot(multipart_request("image", "roi.png", &png_bytes([1, 2, 3])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = read_json(response).await;
        assert_eq!(body.error_type, "internal_error");
        assert!(body.message.contains("backend exploded"));
        assert_eq!(upload_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_upload_over_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(Arc::new(ColorClassifier), dir.path(), 512);

        let response = app
            .oneshot(multipart_request("image", "big.png", &vec![7u8; 4096]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(upload_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_health_lists_labels() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(Arc::new(ColorClassifier), dir.path(), 1 << 20);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: HealthResponse = read_json(response).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.labels, vec!["ROI", "background"]);
    }
}
