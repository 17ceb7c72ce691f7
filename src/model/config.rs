//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル、学習、データセット、HTTPサーバーの設定を
//! JSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 学習済みモデル（tar.gz）の保存先・読み込み元
    pub model_path: String,
    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/roi_classifier.tar.gz".to_string(),
            image_size: 150,
            dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード（分割とシャッフルに使用）
    pub seed: u64,
    /// 検証データの割合
    pub validation_split: f32,
    /// val_accuracyが改善しない場合に打ち切るまでのエポック数
    pub early_stopping_patience: usize,
    /// val_accuracyの改善とみなす最小の増加量
    pub early_stopping_min_delta: f64,
    /// val_lossが改善しない場合に学習率を下げるまでのエポック数
    pub lr_patience: usize,
    /// val_lossの改善とみなす最小の減少量
    pub lr_min_delta: f64,
    /// 学習率の減衰係数
    pub lr_factor: f64,
    /// 学習率の下限
    pub min_learning_rate: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 64,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 2022,
            validation_split: 0.2,
            early_stopping_patience: 3,
            early_stopping_min_delta: 0.0,
            lr_patience: 2,
            lr_min_delta: 1e-4,
            lr_factor: 0.5,
            min_learning_rate: 1e-6,
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// 学習データのアーカイブ（.zip / .tar.gz）
    pub archive_path: String,
    /// アーカイブの展開先
    pub extract_dir: String,
    /// クラスディレクトリを含むデータセットのルート
    pub data_dir: String,
    /// 学習対象から除外するクラスディレクトリ
    pub excluded_classes: Vec<String>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            archive_path: "ROI.zip".to_string(),
            extract_dir: ".".to_string(),
            data_dir: "ROI".to_string(),
            excluded_classes: vec!["N".to_string(), "BG".to_string()],
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// 待ち受けアドレス
    pub bind_addr: String,
    /// アップロード画像の一時保存先
    pub upload_dir: String,
    /// アップロードの最大サイズ（バイト）
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            upload_dir: "uploads".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データセット設定
    pub dataset: DatasetSettings,
    /// HTTPサーバー設定
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// 指定パス（未指定ならデフォルトパス）から設定を読み込む
    ///
    /// ファイルが存在しない、または読み込めない場合はデフォルト設定を返します。
    /// 明示的に指定されたパスが存在しない場合は警告を出す。
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let explicit = path.is_some();
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else if explicit {
            tracing::warn!(
                "指定された設定ファイルが存在しません ({})。デフォルト設定を使用します",
                path.display()
            );
            Self::default()
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 学習前に設定値の整合性を確認する
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.training;
        if t.batch_size == 0 {
            anyhow::bail!("training.batch_size must be greater than 0");
        }
        if t.num_epochs == 0 {
            anyhow::bail!("training.num_epochs must be greater than 0");
        }
        if !(t.validation_split > 0.0 && t.validation_split < 1.0) {
            anyhow::bail!(
                "training.validation_split must be in (0, 1), got {}",
                t.validation_split
            );
        }
        if !(t.lr_factor > 0.0 && t.lr_factor < 1.0) {
            anyhow::bail!("training.lr_factor must be in (0, 1), got {}", t.lr_factor);
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            anyhow::bail!("model.dropout must be in [0, 1), got {}", self.model.dropout);
        }
        Ok(())
    }

    /// 計算デバイスを設定
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    /// モデルパスを設定
    pub fn set_model_path(&mut self, path: String) {
        self.model.model_path = path;
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("モデルパス: {}", self.model.model_path);
        println!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("検証データ割合: {}", self.training.validation_split);
        println!(
            "EarlyStopping patience: {} / ReduceLROnPlateau patience: {} (factor {})",
            self.training.early_stopping_patience,
            self.training.lr_patience,
            self.training.lr_factor
        );
        println!("\n--- データセット設定 ---");
        println!("アーカイブ: {}", self.dataset.archive_path);
        println!("データディレクトリ: {}", self.dataset.data_dir);
        println!("除外クラス: {}", self.dataset.excluded_classes.join(", "));
        println!("\n--- サーバー設定 ---");
        println!("待ち受け: {}", self.server.bind_addr);
        println!("アップロード先: {}", self.server.upload_dir);
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.image_size, 150);
        assert_eq!(config.training.num_epochs, 20);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.training.seed, 2022);
        assert_eq!(config.dataset.excluded_classes, vec!["N", "BG"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "device_type": "Cpu", "training": { "num_epochs": 3 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.server.bind_addr, "127.0.0.1:5000");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AppConfig::default();
        config.set_device_type(DeviceType::Cpu);
        config.set_model_path("out/model.tar.gz".to_string());
        config.save(&path).unwrap();

        let loaded = AppConfig::load_or_default(Some(&path));
        assert_eq!(loaded.device_type, DeviceType::Cpu);
        assert_eq!(loaded.model.model_path, "out/model.tar.gz");
    }

    #[test]
    fn test_broken_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_or_default(Some(&path));
        assert_eq!(config.training.num_epochs, 20);
    }

    /// ログ出力をバッファに集めて返す
    fn capture_logs<F: FnOnce()>(f: F) -> String {
        use std::sync::{Arc, Mutex};

        struct BufWriter(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for BufWriter {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Arc::new(Mutex::new(Vec::new()));
        let writer_buf = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || BufWriter(writer_buf.clone()))
            .finish();
        tracing::subscriber::with_default(subscriber, f);

        let bytes = buf.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_missing_explicit_config_warns() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("typo.json");

        let mut config = None;
        let logs = capture_logs(|| config = Some(AppConfig::load_or_default(Some(&missing))));

        assert_eq!(config.unwrap().training.num_epochs, 20);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("typo.json"));
    }

    #[test]
    fn test_validate_rejects_bad_split() {
        let mut config = AppConfig::default();
        config.training.validation_split = 1.0;
        assert!(config.validate().is_err());

        config.training.validation_split = 0.2;
        config.training.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
