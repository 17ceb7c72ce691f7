//! 機械学習モデルの共通定義
//!
//! ROI / 背景の画像分類用CNNモデルと画像の前処理を提供します。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
        PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::{imageops::FilterType, DynamicImage};
use std::path::Path;

/// 入力チャネル数（RGB）
pub const NUM_CHANNELS: usize = 3;

/// 最終畳み込み層の出力チャネル数
const LAST_CONV_CHANNELS: usize = 128;

/// ImageNetの平均と標準偏差
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 150)]
    pub image_size: usize,
}

/// プーリング3段を通過した後の特徴マップの一辺
///
/// 畳み込みはsame paddingなのでサイズは変わらず、
/// プーリング (3x3/3, 2x2/2, 2x2/2) でのみ縮小する。
pub fn feature_map_size(image_size: usize) -> usize {
    ((image_size / 3) / 2) / 2
}

impl ModelConfig {
    /// Flatten後の特徴次元
    pub fn flattened_features(&self) -> usize {
        let f = feature_map_size(self.image_size);
        LAST_CONV_CHANNELS * f * f
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<RoiClassifier<B>> {
        let f = feature_map_size(self.image_size);
        if f == 0 {
            anyhow::bail!(
                "入力サイズが小さすぎます: {} (最小12x12が必要)",
                self.image_size
            );
        }
        if self.num_classes < 2 {
            anyhow::bail!("クラス数は2以上が必要です: {}", self.num_classes);
        }

        let d = self.flattened_features();

        let model = RoiClassifier {
            conv1: Conv2dConfig::new([NUM_CHANNELS, 64], [5, 5])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            pool1: MaxPool2dConfig::new([3, 3]).with_strides([3, 3]).init(),

            conv2: Conv2dConfig::new([64, 64], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            conv3: Conv2dConfig::new([64, LAST_CONV_CHANNELS], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            pool3: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            fc1: LinearConfig::new(d, 64).init(device),
            norm1: BatchNormConfig::new(64).init(device),
            fc2: LinearConfig::new(64, 128).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            norm2: BatchNormConfig::new(128).init(device),
            head: LinearConfig::new(128, self.num_classes).init(device),

            activation: Relu::new(),
        };

        self.log_summary(model.num_params());
        Ok(model)
    }

    fn log_summary(&self, num_params: usize) {
        let s = self.image_size;
        let p1 = s / 3;
        let p2 = p1 / 2;
        let p3 = p2 / 2;
        tracing::info!("[Model] 入力: 3 x {}x{}", s, s);
        tracing::info!("[Model] Conv1(5x5, same) + Pool(3x3): 64 x {}x{}", p1, p1);
        tracing::info!("[Model] Conv2(3x3, same) + Pool(2x2): 64 x {}x{}", p2, p2);
        tracing::info!("[Model] Conv3(3x3, same) + Pool(2x2): 128 x {}x{}", p3, p3);
        tracing::info!("[Model] Flatten: {}", self.flattened_features());
        tracing::info!("[Model] Dense 64 -> BatchNorm -> Dense 128 -> Dropout({}) -> BatchNorm", self.dropout);
        tracing::info!("[Model] 出力: {} クラス", self.num_classes);
        tracing::info!("[Model] 総パラメータ数: {} ({:.2}M)", num_params, num_params as f64 / 1_000_000.0);
    }
}

/// ROI分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 5x5 (64) + ReLU + MaxPool 3x3
/// - Conv 3x3 (64) + ReLU + MaxPool 2x2
/// - Conv 3x3 (128) + ReLU + MaxPool 2x2
/// - Flatten
/// - Dense 64 + ReLU, BatchNorm
/// - Dense 128 + ReLU, Dropout, BatchNorm
/// - Dense num_classes（分類時にSoftmax）
#[derive(Module, Debug)]
pub struct RoiClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    pool3: MaxPool2d,

    fc1: Linear<B>,
    norm1: BatchNorm<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    norm2: BatchNorm<B>,
    head: Linear<B>,

    activation: Relu,
}

impl<B: Backend> RoiClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = Self::normalize_features(&self.norm1, x);

        let x = self.activation.forward(self.fc2.forward(x));
        let x = self.dropout.forward(x);
        let x = Self::normalize_features(&self.norm2, x);

        self.head.forward(x)
    }

    /// 全結合層の出力 [batch, features] を [batch, features, 1] としてBatchNormに通す
    fn normalize_features(norm: &BatchNorm<B>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch_size, features] = x.dims();
        norm.forward(x.reshape([batch_size, features, 1]))
            .reshape([batch_size, features])
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], クラス確率 [batch_size, num_classes])
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let probabilities = softmax(self.forward(images), 1);
        let predictions = probabilities.clone().argmax(1);
        (predictions, probabilities)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 画像をリサイズして正規化
///
/// 学習と推論で同じ前処理を行うため、必ずこの関数を通すこと。
///
/// # 戻り値
/// - 正規化されたRGB画像データ (C, H, W) の順で平坦化
pub fn preprocess_image(img: &DynamicImage, size: usize) -> Vec<f32> {
    let side = size as u32;
    let rgb = img.resize_exact(side, side, FilterType::Triangle).to_rgb8();

    let mut data = Vec::with_capacity(NUM_CHANNELS * size * size);
    for channel in 0..NUM_CHANNELS {
        for y in 0..side {
            for x in 0..side {
                let value = rgb.get_pixel(x, y)[channel] as f32 / 255.0;
                data.push((value - MEAN[channel]) / STD[channel]);
            }
        }
    }
    data
}

/// 画像を読み込んで正規化（サイズ指定版）
pub fn load_and_normalize_image_with_size(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("画像の読み込みに失敗しました: {}", path.display()))?;
    Ok(preprocess_image(&img, size))
}
