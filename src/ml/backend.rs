//! 計算バックエンドの選択
//!
//! 設定の `DeviceType` に応じて WGPU (GPU) または NdArray (CPU) で学習・推論を行います。
//! `wgpu` フィーチャーが無効な場合は常に CPU を使用します。

use anyhow::Result;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use std::path::Path;
use std::sync::Arc;

use crate::ml::inference::{ImageClassifier, InferenceEngine, SharedEngine};
use crate::ml::training::{train_model, EpochRecord, TrainingReport};
use crate::model::{AppConfig, DeviceType};

#[cfg(feature = "wgpu")]
use burn_wgpu::{Wgpu, WgpuDevice};

/// CPU バックエンド
pub type CpuBackend = NdArray<f32>;

/// 実際に使用するデバイス種別（フィーチャーの有無を反映）
pub fn effective_device(requested: DeviceType) -> DeviceType {
    if cfg!(feature = "wgpu") {
        requested
    } else {
        if requested == DeviceType::Wgpu {
            tracing::warn!("wgpu フィーチャーが無効なため CPU (NdArray) を使用します");
        }
        DeviceType::Cpu
    }
}

/// 設定に従ってバックエンドを選び、学習を実行
pub fn train_with_config<F>(config: &AppConfig, on_epoch: F) -> Result<TrainingReport>
where
    F: FnMut(&EpochRecord),
{
    match effective_device(config.device_type) {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            tracing::info!("GPU (WGPU) モードで学習を開始します");
            train_model::<Autodiff<Wgpu>, _>(config, WgpuDevice::default(), on_epoch)
        }
        _ => {
            tracing::info!("CPU (NdArray) モードで学習を開始します");
            train_model::<Autodiff<CpuBackend>, _>(config, NdArrayDevice::Cpu, on_epoch)
        }
    }
}

/// 設定に従ってバックエンドを選び、共有可能な分類器を読み込む
pub fn load_classifier(model_path: &Path, device_type: DeviceType) -> Result<Arc<dyn ImageClassifier>> {
    match effective_device(device_type) {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            let engine = InferenceEngine::<Wgpu>::load(model_path, WgpuDevice::default())?;
            Ok(Arc::new(SharedEngine::new(engine)))
        }
        _ => {
            let engine = InferenceEngine::<CpuBackend>::load(model_path, NdArrayDevice::Cpu)?;
            Ok(Arc::new(SharedEngine::new(engine)))
        }
    }
}
