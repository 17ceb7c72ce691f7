//! モデル推論機能

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::DynamicImage;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

use crate::ml::ml_model::{preprocess_image, RoiClassifier, NUM_CHANNELS};
use crate::model::{load_model_with_metadata, InferenceConfig, ModelMetadata};

/// 1枚の画像に対する推論結果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Prediction {
    /// 予測クラスのラベル
    pub label: String,
    /// 予測クラスID
    pub class_index: usize,
    /// 予測クラスの確率
    pub confidence: f32,
    /// 全クラスの確率（クラスID順）
    pub probabilities: Vec<f32>,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: RoiClassifier<B>,
    config: InferenceConfig,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (metadata, model_binary) = load_model_with_metadata(model_path)
            .with_context(|| format!("モデルの読み込みに失敗しました: {}", model_path.display()))?;
        Self::from_parts(metadata, model_binary, device)
    }

    /// メタデータと重みのバイナリから初期化
    pub fn from_parts(metadata: ModelMetadata, model_binary: Vec<u8>, device: B::Device) -> Result<Self> {
        let config = InferenceConfig::from_metadata(&metadata);
        let model = config.model_config().init::<B>(&device)?;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        tracing::info!(
            "推論エンジンを初期化しました: クラス [{}], 入力 {}x{}",
            config.class_labels.join(", "),
            config.model_input_size,
            config.model_input_size
        );

        Ok(Self {
            model,
            config,
            metadata,
            device,
        })
    }

    /// 読み込み済み画像を分類
    pub fn classify(&self, image: &DynamicImage) -> Result<Prediction> {
        let size = self.config.model_input_size;
        let image_data = preprocess_image(image, size);

        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([1, NUM_CHANNELS, size, size]);

        let (_, probabilities) = self.model.predict(tensor);
        let probabilities = probabilities
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))?;

        let label = self
            .config
            .class_index_to_label(class_index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?;

        Ok(Prediction {
            label,
            class_index,
            confidence,
            probabilities,
        })
    }

    /// 単一画像ファイルを分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let path = image_path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("画像の読み込みに失敗しました: {}", path.display()))?;
        self.classify(&image)
    }

    /// 画像のバイト列を分類
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let image = image::load_from_memory(bytes).context("画像のデコードに失敗しました")?;
        self.classify(&image)
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths.iter().map(|path| self.classify_image(path)).collect()
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

/// HTTPハンドラなどから共有して使う分類器
pub trait ImageClassifier: Send + Sync {
    /// クラスラベル（クラスID順）
    fn labels(&self) -> Vec<String>;

    /// 画像を分類
    fn classify(&self, image: &DynamicImage) -> Result<Prediction>;

    /// 画像ファイルを読み込んで分類
    fn classify_file(&self, path: &Path) -> Result<Prediction> {
        let image = image::open(path)
            .with_context(|| format!("画像の読み込みに失敗しました: {}", path.display()))?;
        self.classify(&image)
    }
}

/// スレッド間で共有できるようにした推論エンジン
///
/// 推論は1リクエストずつ順番に実行される。
pub struct SharedEngine<B: Backend> {
    labels: Vec<String>,
    engine: Mutex<InferenceEngine<B>>,
}

impl<B: Backend> SharedEngine<B> {
    pub fn new(engine: InferenceEngine<B>) -> Self {
        Self {
            labels: engine.config().class_labels.clone(),
            engine: Mutex::new(engine),
        }
    }
}

impl<B: Backend> ImageClassifier for SharedEngine<B> {
    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn classify(&self, image: &DynamicImage) -> Result<Prediction> {
        let engine = self
            .engine
            .lock()
            .map_err(|_| anyhow::anyhow!("推論エンジンのロックが破損しています"))?;
        engine.classify(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ModelConfig;
    use crate::model::save_model_with_metadata;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    /// 未学習の重みでモデルファイルを作る
    fn write_untrained_model(path: &Path, labels: &[&str], image_size: usize) -> std::path::PathBuf {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(labels.len())
            .with_image_size(image_size)
            .init::<TestBackend>(&device)
            .unwrap();
        let binary = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.into_record(), ())
            .unwrap();
        let metadata = ModelMetadata::new(
            labels.iter().map(|l| l.to_string()).collect(),
            image_size,
            0.5,
            1,
            1,
            0.5,
        );
        save_model_with_metadata(path, &metadata, &binary).unwrap()
    }

    #[test]
    fn test_load_and_classify() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = write_untrained_model(&dir.path().join("model"), &["ROI", "background"], 24);

        let engine = InferenceEngine::<TestBackend>::load(&model_path, NdArrayDevice::Cpu).unwrap();
        assert_eq!(engine.config().num_total_classes(), 2);
        assert_eq!(engine.metadata().image_size, 24);

        // 入力サイズと異なる画像もリサイズされる
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([200, 10, 10])));
        let prediction = engine.classify(&image).unwrap();

        assert_eq!(prediction.probabilities.len(), 2);
        let sum: f32 = prediction.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert_eq!(prediction.confidence, prediction.probabilities[prediction.class_index]);
        assert_eq!(
            prediction.label,
            engine.config().class_index_to_label(prediction.class_index).unwrap()
        );
    }

    #[test]
    fn test_classify_file_bytes_and_batch_agree() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = write_untrained_model(&dir.path().join("model"), &["a", "b", "c"], 12);
        let engine = InferenceEngine::<TestBackend>::load(&model_path, NdArrayDevice::Cpu).unwrap();

        let image_path = dir.path().join("sample.png");
        RgbImage::from_pixel(12, 12, Rgb([10, 200, 10])).save(&image_path).unwrap();

        let from_file = engine.classify_image(&image_path).unwrap();
        let from_bytes = engine.classify_bytes(&std::fs::read(&image_path).unwrap()).unwrap();
        assert_eq!(from_file.class_index, from_bytes.class_index);

        let batch = engine.classify_batch(&[&image_path, &image_path]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].label, from_file.label);
    }

    #[test]
    fn test_invalid_inputs_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InferenceEngine::<TestBackend>::load(dir.path().join("none.tar.gz"), NdArrayDevice::Cpu).is_err());

        let model_path = write_untrained_model(&dir.path().join("model"), &["a", "b"], 12);
        let engine = InferenceEngine::<TestBackend>::load(&model_path, NdArrayDevice::Cpu).unwrap();
        assert!(engine.classify_bytes(b"definitely not an image").is_err());
    }

    #[test]
    fn test_shared_engine_labels() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = write_untrained_model(&dir.path().join("model"), &["ROI", "background"], 12);
        let engine = InferenceEngine::<TestBackend>::load(&model_path, NdArrayDevice::Cpu).unwrap();

        let shared: Box<dyn ImageClassifier> = Box::new(SharedEngine::new(engine));
        assert_eq!(shared.labels(), vec!["ROI", "background"]);
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 12, Rgb([0, 0, 0])));
        assert!(shared.classify(&image).is_ok());

        let image_path = dir.path().join("black.png");
        image.save(&image_path).unwrap();
        assert_eq!(shared.classify_file(&image_path).unwrap().probabilities.len(), 2);
        assert!(shared.classify_file(&dir.path().join("missing.png")).is_err());
    }
}
