//! HTTP エラー応答

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// クライアントに返すエラー本文
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("multipart field 'image' is missing")]
    MissingImage,

    #[error("uploaded file has no filename")]
    EmptyFilename,

    #[error("uploaded file is empty")]
    EmptyImage,

    #[error("uploaded file is not a readable image: {0}")]
    InvalidImage(String),

    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::MissingImage => "missing_image",
            ApiError::EmptyFilename => "empty_filename",
            ApiError::EmptyImage => "empty_image",
            ApiError::InvalidImage(_) => "invalid_image",
            ApiError::Multipart(_) => "invalid_request",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingImage
            | ApiError::EmptyFilename
            | ApiError::EmptyImage
            | ApiError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            // サイズ超過 (413) などは multipart 側のステータスをそのまま使う
            ApiError::Multipart(e) => e.status(),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error_type: self.error_type().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("リクエスト処理に失敗しました: {}", self);
        } else {
            tracing::warn!("不正なリクエスト: {}", self);
        }
        (status, Json(self.to_response())).into_response()
    }
}
