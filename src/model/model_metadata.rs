//! モデルメタデータの定義
//!
//! 推論時にモデルを再構築するために必要な情報（クラスラベル、入力サイズなど）を保持します。
//! tar.gz形式のモデルファイル内に `metadata.json` として保存されます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// クラスラベル（クラスID順）
    /// 例: ["ROI", "background"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形、ピクセル）
    pub image_size: usize,

    /// 学習時のドロップアウト率
    pub dropout: f64,

    /// 設定上のエポック数
    pub num_epochs: u32,

    /// 実際に学習したエポック数（EarlyStoppingで打ち切られた場合は少なくなる）
    #[serde(default)]
    pub epochs_run: u32,

    /// 最良の検証精度（復元された重みの精度）
    #[serde(default)]
    pub best_val_accuracy: f64,

    /// モデルの学習時刻（RFC 3339形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        image_size: usize,
        dropout: f64,
        num_epochs: u32,
        epochs_run: u32,
        best_val_accuracy: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            image_size,
            dropout,
            num_epochs,
            epochs_run,
            best_val_accuracy,
            trained_at,
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
