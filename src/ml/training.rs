//! モデル学習機能
//!
//! データセット読み込み → 学習/検証分割 → 学習ループ（EarlyStopping, ReduceLROnPlateau）
//! → 検証データでの評価 → モデル保存 の一連の処理を行います。

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Int, Tensor},
};
use burn_dataset::Dataset;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::ml::callbacks::{EarlyStopping, ReduceLrOnPlateau};
use crate::ml::dataset::{ImageBatcher, RoiDataset};
use crate::ml::evaluation::ConfusionMatrix;
use crate::ml::ml_model::{ModelConfig, RoiClassifier};
use crate::model::{save_model_with_metadata, AppConfig, ModelMetadata};

/// 1エポック分の学習履歴
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 保存したモデル（tar.gz）のパス
    pub model_path: PathBuf,
    /// 学習履歴（CSV）のパス
    pub history_path: PathBuf,
    pub history: Vec<EpochRecord>,
    pub best_epoch: usize,
    pub best_val_accuracy: f64,
    pub stopped_early: bool,
    pub class_labels: Vec<String>,
    /// 復元した最良モデルによる検証データの混同行列
    pub confusion: ConfusionMatrix,
}

/// 損失と正解数の集計（損失はサンプル数で重み付け）
#[derive(Debug, Default)]
struct EpochTotals {
    weighted_loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl EpochTotals {
    fn add<B: Backend>(&mut self, loss: f64, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) {
        let [batch_size, _] = logits.dims();
        // argmax(1) は [batch, 1] を返すので [batch] に潰してから比較する
        let correct: i64 = logits
            .argmax(1)
            .flatten::<1>(0, 1)
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        self.record(loss, batch_size, correct as usize);
    }

    /// バッチ平均の損失 `loss` を `batch_size` 件分として加算
    fn record(&mut self, loss: f64, batch_size: usize, correct: usize) {
        self.weighted_loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            f64::NAN
        } else {
            self.weighted_loss_sum / self.samples as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }
}

/// 学習履歴をCSVに書き出す
pub fn write_history(path: &Path, history: &[EpochRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create history file: {}", path.display()))?;
    for record in history {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// モデル保存先に対応する学習履歴CSVのパス
pub fn history_path_for(model_path: &Path) -> PathBuf {
    let file_name = model_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("model");
    let stem = file_name
        .strip_suffix(".tar.gz")
        .or_else(|| file_name.strip_suffix(".gz"))
        .unwrap_or(file_name);
    model_path.with_file_name(format!("{}_history.csv", stem))
}

/// 検証データを推論して (正解, 予測) を集める
fn collect_predictions<B: Backend>(
    model: &RoiClassifier<B>,
    dataset: RoiDataset,
    device: &B::Device,
    image_size: usize,
    batch_size: usize,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let loader = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone(), image_size))
        .batch_size(batch_size)
        .build(dataset);

    let mut targets = Vec::new();
    let mut predictions = Vec::new();
    for batch in loader.iter() {
        let (predicted, _) = model.predict(batch.images);
        let predicted = predicted
            .flatten::<1>(0, 1)
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;
        let expected = batch
            .targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("正解ラベルの取得エラー: {:?}", e))?;

        predictions.extend(predicted.into_iter().map(|p| p as usize));
        targets.extend(expected.into_iter().map(|t| t as usize));
    }
    Ok((targets, predictions))
}

/// モデル学習を実行
///
/// `on_epoch` はエポック終了ごとに呼ばれる（進捗表示用）。
pub fn train_model<B, F>(config: &AppConfig, device: B::Device, mut on_epoch: F) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    F: FnMut(&EpochRecord),
{
    config.validate()?;
    let settings = &config.training;
    let image_size = config.model.image_size;

    // === データセット読み込み ===
    let data_dir = PathBuf::from(&config.dataset.data_dir);
    tracing::info!("学習データを読み込みます: {}", data_dir.display());
    let dataset = RoiDataset::from_directory(&data_dir, &config.dataset.excluded_classes)?;
    let class_labels = dataset.class_names().to_vec();

    let (dataset_train, dataset_val) = dataset.split(settings.validation_split, settings.seed)?;
    let val_for_report = dataset_val.clone();
    let train_breakdown = class_labels
        .iter()
        .zip(dataset_train.class_counts())
        .map(|(label, count)| format!("{}={}", label, count))
        .collect::<Vec<_>>()
        .join(", ");
    tracing::info!("学習データ: {} 枚 ({})", dataset_train.len(), train_breakdown);
    tracing::info!("検証データ: {} 枚", dataset_val.len());

    // === モデル ===
    let model_config = ModelConfig::new(class_labels.len())
        .with_dropout(config.model.dropout)
        .with_image_size(image_size);
    let mut model: RoiClassifier<B> = model_config.init(&device)?;
    tracing::info!("使用デバイス: {:?}", device);

    // === データローダー ===
    let dataloader_train = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone(), image_size))
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(dataset_train);

    // 検証は自動微分なしのバックエンドで行う
    let dataloader_val =
        DataLoaderBuilder::new(ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size))
            .batch_size(settings.batch_size)
            .num_workers(settings.num_workers)
            .build(dataset_val);

    let mut optim = AdamConfig::new().init();
    let mut learning_rate = settings.learning_rate;
    let mut early_stopping = EarlyStopping::new(settings.early_stopping_patience)
        .with_min_delta(settings.early_stopping_min_delta);
    let mut plateau = ReduceLrOnPlateau::new(
        settings.lr_patience,
        settings.lr_factor,
        settings.min_learning_rate,
    )
    .with_min_delta(settings.lr_min_delta);

    let mut best_model = model.clone();
    let mut history = Vec::with_capacity(settings.num_epochs);
    let mut stopped_early = false;

    tracing::info!(
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}",
        settings.num_epochs,
        settings.batch_size,
        learning_rate
    );

    for epoch in 1..=settings.num_epochs {
        // --- 学習 ---
        let mut train_totals = EpochTotals::default();
        for batch in dataloader_train.iter() {
            let output = model.forward_classification(batch.images, batch.targets);
            let loss_value = output.loss.clone().into_scalar().elem::<f64>();
            train_totals.add(loss_value, output.output.clone(), output.targets.clone());

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(learning_rate, model, grads);
        }

        // --- 検証（ドロップアウト無効、BatchNormは移動平均を使用）---
        let model_valid = model.valid();
        let mut val_totals = EpochTotals::default();
        for batch in dataloader_val.iter() {
            let output = model_valid.forward_classification(batch.images, batch.targets);
            let loss_value = output.loss.into_scalar().elem::<f64>();
            val_totals.add(loss_value, output.output, output.targets);
        }

        let record = EpochRecord {
            epoch,
            train_loss: train_totals.mean_loss(),
            train_accuracy: train_totals.accuracy(),
            val_loss: val_totals.mean_loss(),
            val_accuracy: val_totals.accuracy(),
            learning_rate,
        };
        tracing::info!(
            "Epoch {:>3}/{} | loss={:.4} acc={:.2}% | val_loss={:.4} val_acc={:.2}% | lr={:.2e}",
            epoch,
            settings.num_epochs,
            record.train_loss,
            record.train_accuracy * 100.0,
            record.val_loss,
            record.val_accuracy * 100.0,
            learning_rate
        );
        on_epoch(&record);

        let decision = early_stopping.update(epoch, record.val_accuracy);
        if decision.improved {
            best_model = model.clone();
        }

        let next_lr = plateau.update(record.val_loss, learning_rate);
        if next_lr < learning_rate {
            tracing::info!("ReduceLROnPlateau: 学習率を {:.2e} に下げます", next_lr);
        }
        learning_rate = next_lr;

        history.push(record);

        if decision.stop {
            tracing::info!(
                "EarlyStopping: {} エポック改善がないため学習を終了します",
                settings.early_stopping_patience
            );
            stopped_early = true;
            break;
        }
    }

    let best_epoch = early_stopping.best_epoch();
    let best_val_accuracy = early_stopping.best().unwrap_or(0.0);
    tracing::info!(
        "最良エポック {} の重みを復元します (val_acc={:.2}%)",
        best_epoch,
        best_val_accuracy * 100.0
    );
    let trained_model = best_model.valid();

    // === 検証データで評価 ===
    let (targets, predictions) = collect_predictions(
        &trained_model,
        val_for_report,
        &device,
        image_size,
        settings.batch_size,
    )?;
    let confusion = ConfusionMatrix::from_predictions(class_labels.clone(), &targets, &predictions);
    tracing::info!("検証データの評価結果:\n{}", confusion.render());

    // === 保存 ===
    let model_binary = BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(trained_model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;
    tracing::info!(
        "モデルバイナリサイズ: {} バイト ({:.2} MB)",
        model_binary.len(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );

    let metadata = ModelMetadata::new(
        class_labels.clone(),
        image_size,
        config.model.dropout,
        settings.num_epochs as u32,
        history.len() as u32,
        best_val_accuracy,
    );
    let model_path = save_model_with_metadata(Path::new(&config.model.model_path), &metadata, &model_binary)?;
    tracing::info!("モデルを保存しました: {}", model_path.display());

    let history_path = history_path_for(&model_path);
    write_history(&history_path, &history)?;
    tracing::info!("学習履歴を保存しました: {}", history_path.display());

    Ok(TrainingReport {
        model_path,
        history_path,
        history,
        best_epoch,
        best_val_accuracy,
        stopped_early,
        class_labels,
        confusion,
    })
}
