//! コマンドライン インターフェース

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::api;
use crate::archive::ensure_dataset;
use crate::ml::{load_classifier, train_with_config, TrainingReport};
use crate::model::{bundle_path, load_metadata, print_metadata_info, AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(
    name = "roi-classifier",
    version,
    about = "ROI / 背景の画像分類モデルを学習し、HTTP で推論結果を返す"
)]
pub struct Cli {
    /// 設定ファイル (JSON)
    #[arg(long, global = true, env = "ROI_CLASSIFIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// GPU を使わず CPU (NdArray) で実行する
    #[arg(long, global = true)]
    pub cpu: bool,

    /// ログを詳細にする (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// データセットのアーカイブを展開する
    Unpack {
        /// 展開済みでも展開し直す
        #[arg(long)]
        force: bool,
    },
    /// モデルを学習する
    Train(TrainArgs),
    /// 学習済みモデルで推論サーバーを起動する
    Serve(ServeArgs),
    /// 学習してから、そのモデルで推論サーバーを起動する
    Run {
        #[command(flatten)]
        train: TrainArgs,
        #[command(flatten)]
        serve: ServeArgs,
    },
    /// 画像を分類して結果を表示する
    Classify {
        /// 分類する画像ファイル
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// モデルファイル (.tar.gz)
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// モデルファイルのメタデータを表示する
    Info {
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// 有効な設定を表示する
    Config {
        /// 設定を JSON で保存する
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// データディレクトリ（クラスごとのサブディレクトリを含む）
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// モデルの出力先
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
}

impl TrainArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.data_dir {
            config.dataset.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(output) = &self.output {
            config.set_model_path(output.to_string_lossy().to_string());
        }
        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.training.learning_rate = lr;
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// 待ち受けアドレス (例: 0.0.0.0:5000)
    #[arg(long)]
    pub bind: Option<String>,
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,
}

impl ServeArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind_addr = bind.clone();
        }
        if let Some(dir) = &self.upload_dir {
            config.server.upload_dir = dir.to_string_lossy().to_string();
        }
    }
}

impl Cli {
    /// ファイルの設定にグローバルフラグを反映したもの
    pub fn load_config(&self) -> AppConfig {
        let mut config = AppConfig::load_or_default(self.config.as_deref());
        if self.cpu {
            config.set_device_type(DeviceType::Cpu);
        }
        config
    }

    pub async fn run(self) -> Result<()> {
        let mut config = self.load_config();

        match self.command {
            Commands::Unpack { force } => {
                let data_dir = ensure_dataset(&config.dataset, force)?;
                println!("データセット: {}", data_dir.display());
                Ok(())
            }
            Commands::Train(args) => {
                args.apply(&mut config);
                run_training(config).await.map(|_| ())
            }
            Commands::Serve(args) => {
                args.apply(&mut config);
                run_server(&config, Path::new(&config.model.model_path)).await
            }
            Commands::Run { train, serve } => {
                train.apply(&mut config);
                serve.apply(&mut config);
                let report = run_training(config.clone()).await?;
                run_server(&config, &report.model_path).await
            }
            Commands::Classify { images, model } => {
                let model_path = model.unwrap_or_else(|| PathBuf::from(&config.model.model_path));
                let device_type = config.device_type;
                tokio::task::spawn_blocking(move || classify_images(&model_path, device_type, &images))
                    .await
                    .context("classify task panicked")?
            }
            Commands::Info { model } => {
                let model_path = model.unwrap_or_else(|| PathBuf::from(&config.model.model_path));
                let metadata = load_metadata(&model_path)?;
                println!("モデル: {}", bundle_path(&model_path).display());
                print_metadata_info(&metadata);
                Ok(())
            }
            Commands::Config { save } => {
                config.display();
                if let Some(path) = save {
                    config
                        .save(&path)
                        .with_context(|| format!("Failed to save config: {}", path.display()))?;
                    println!("設定を保存しました: {}", path.display());
                }
                Ok(())
            }
        }
    }
}

/// データセットを準備して学習し、結果を表示する
async fn run_training(config: AppConfig) -> Result<TrainingReport> {
    config.display();
    tokio::task::spawn_blocking(move || -> Result<TrainingReport> {
        ensure_dataset(&config.dataset, false)?;
        let report = train_with_config(&config, |record| {
            println!(
                "Epoch {:>3}: loss {:.4} acc {:.2}% | val_loss {:.4} val_acc {:.2}% | lr {:.2e}",
                record.epoch,
                record.train_loss,
                record.train_accuracy * 100.0,
                record.val_loss,
                record.val_accuracy * 100.0,
                record.learning_rate
            );
        })?;
        print_report(&report);
        Ok(report)
    })
    .await
    .context("training task panicked")?
}

fn print_report(report: &TrainingReport) {
    println!("\n=== 学習結果 ===");
    println!("クラス: {}", report.class_labels.join(", "));
    println!(
        "最良エポック: {} (検証精度 {:.2}%){}",
        report.best_epoch,
        report.best_val_accuracy * 100.0,
        if report.stopped_early { " / early stopping" } else { "" }
    );
    println!("\n{}", report.confusion.render());
    println!("モデル: {}", report.model_path.display());
    println!("学習履歴: {}", report.history_path.display());
}

async fn run_server(config: &AppConfig, model_path: &Path) -> Result<()> {
    let model_path = model_path.to_path_buf();
    let device_type = config.device_type;
    let classifier = tokio::task::spawn_blocking(move || load_classifier(&model_path, device_type))
        .await
        .context("model loading task panicked")??;
    tracing::info!("モデルを読み込みました: クラス [{}]", classifier.labels().join(", "));

    api::serve(&config.server, classifier).await
}

fn classify_images(model_path: &Path, device_type: DeviceType, images: &[PathBuf]) -> Result<()> {
    let classifier = load_classifier(model_path, device_type)?;
    for path in images {
        let prediction = classifier.classify_file(path)?;
        let probabilities = classifier
            .labels()
            .iter()
            .zip(&prediction.probabilities)
            .map(|(label, p)| format!("{}={:.3}", label, p))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{}: {} ({:.2}%) [{}]",
            path.display(),
            prediction.label,
            prediction.confidence * 100.0,
            probabilities
        );
    }
    Ok(())
}
