//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use crate::ml::ModelConfig;
use crate::model::model_metadata::ModelMetadata;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// 全クラスラベル（クラスID順）
    pub class_labels: Vec<String>,

    /// モデル入力解像度
    pub model_input_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            model_input_size: metadata.image_size,
        }
    }

    /// 推論用のモデル設定（ドロップアウトなし）
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.num_total_classes())
            .with_dropout(0.0)
            .with_image_size(self.model_input_size)
    }

    /// すべてのクラス数を取得
    pub fn num_total_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<String> {
        self.class_labels.get(index).cloned()
    }
}
