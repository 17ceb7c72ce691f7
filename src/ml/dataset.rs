//! 学習データセットとバッチャー
//!
//! `<data_dir>/<クラス名>/<画像>` の構成から画像パスとクラスIDを収集し、
//! バッチ生成時にのみ画像を読み込みます。

use anyhow::Result;
use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor},
};
use burn_dataset::Dataset;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::ml::ml_model::{load_and_normalize_image_with_size, NUM_CHANNELS};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 学習対象の画像ファイルか判定
pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// クラスディレクトリ内の画像パスを名前順で収集
fn collect_images(class_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(class_dir)? {
        let path = entry?.path();
        if is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// データディレクトリからクラス名を収集
///
/// 除外クラスを取り除き、名前順にソートした結果がクラスIDの順序になる。
pub fn discover_classes(data_dir: &Path, excluded: &[String]) -> Result<Vec<String>> {
    if !data_dir.is_dir() {
        anyhow::bail!("データディレクトリが存在しません: {}", data_dir.display());
    }

    let mut class_names = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let class_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", path.display()))?
            .to_string();
        if excluded.iter().any(|e| e == &class_name) {
            tracing::debug!("除外クラスをスキップ: {}", class_name);
            continue;
        }
        class_names.push(class_name);
    }
    class_names.sort();

    if class_names.len() < 2 {
        anyhow::bail!(
            "分類には2クラス以上が必要です ({}): {:?}",
            data_dir.display(),
            class_names
        );
    }
    Ok(class_names)
}

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct RoiDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

impl RoiDataset {
    /// 指定された順序でディレクトリから学習データを読み込む
    ///
    /// 画像が1枚もないクラスがあればエラー。
    pub fn from_directory_with_order(data_dir: &Path, class_order: &[String]) -> Result<Self> {
        let mut samples = Vec::new();
        let mut empty_classes = Vec::new();

        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                empty_classes.push(class_name.clone());
                continue;
            }

            let images = collect_images(&class_dir)?;
            tracing::info!("  クラス {} '{}': {} 枚", class_id, class_name, images.len());
            if images.is_empty() {
                empty_classes.push(class_name.clone());
            }
            samples.extend(images.into_iter().map(|path| (path, class_id)));
        }

        if !empty_classes.is_empty() {
            anyhow::bail!(
                "以下のクラスディレクトリに画像が1枚もありません: {}",
                empty_classes.join(", ")
            );
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
        })
    }

    /// ディレクトリから学習データを読み込む（除外クラス以外の全サブディレクトリ）
    pub fn from_directory(data_dir: &Path, excluded: &[String]) -> Result<Self> {
        let class_names = discover_classes(data_dir, excluded)?;
        tracing::info!("クラス順序 ({}個): {}", class_names.len(), class_names.join(", "));
        let dataset = Self::from_directory_with_order(data_dir, &class_names)?;
        tracing::info!(
            "{} クラスから {} 枚の画像を読み込みました",
            dataset.num_classes(),
            dataset.samples.len()
        );
        Ok(dataset)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }

    /// データセットを学習用と検証用に分割
    ///
    /// シード固定でシャッフルし、`validation_split` の割合（切り上げ）を検証用にする。
    pub fn split(self, validation_split: f32, seed: u64) -> Result<(Self, Self)> {
        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total_len = samples.len();
        let val_len = (total_len as f64 * validation_split as f64).ceil() as usize;
        if val_len == 0 || val_len >= total_len {
            anyhow::bail!(
                "サンプル数 {} を割合 {} で分割できません",
                total_len,
                validation_split
            );
        }

        let val_samples = samples.split_off(total_len - val_len);

        let train_dataset = Self {
            samples,
            class_names: self.class_names.clone(),
        };
        let val_dataset = Self {
            samples: val_samples,
            class_names: self.class_names,
        };

        Ok((train_dataset, val_dataset))
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<ImageItem> for RoiDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let (path, label) = self.samples.get(index)?;
        Some(ImageItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let pixels_per_image = NUM_CHANNELS * size * size;
        let mut all_pixels = Vec::with_capacity(batch_size * pixels_per_image);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match load_and_normalize_image_with_size(&item.path, size) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    // 読めない画像はゼロ埋め
                    tracing::warn!("画像読み込み失敗 {}: {:#}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(pixels_per_image));
                }
            }
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, NUM_CHANNELS, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{Rgb, RgbImage};

    /// テスト用データセットを作成する
    ///
    /// 各クラスは単色の画像で、クラスごとに色が異なる。
    pub(crate) fn write_dataset(root: &Path, classes: &[(&str, [u8; 3], usize)], size: u32) {
        for (name, color, count) in classes {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let img = RgbImage::from_pixel(size, size, Rgb(*color));
                img.save(dir.join(format!("{}_{}.png", name, i))).unwrap();
            }
        }
    }

    #[test]
    fn test_discover_classes_excludes_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(
            dir.path(),
            &[("S", [0, 0, 255], 1), ("BG", [0, 0, 0], 1), ("D", [255, 0, 0], 1), ("N", [9, 9, 9], 1)],
            8,
        );
        std::fs::write(dir.path().join("README.txt"), "not a class").unwrap();

        let excluded = vec!["N".to_string(), "BG".to_string()];
        let classes = discover_classes(dir.path(), &excluded).unwrap();
        assert_eq!(classes, vec!["D", "S"]);
    }

    #[test]
    fn test_single_class_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("ROI", [255, 0, 0], 2), ("N", [0, 0, 0], 2)], 8);

        let excluded = vec!["N".to_string()];
        assert!(discover_classes(dir.path(), &excluded).is_err());
    }

    #[test]
    fn test_empty_class_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("A", [255, 0, 0], 2)], 8);
        std::fs::create_dir_all(dir.path().join("B")).unwrap();
        std::fs::write(dir.path().join("B").join("notes.txt"), "x").unwrap();

        let err = RoiDataset::from_directory(dir.path(), &[]).unwrap_err();
        assert!(err.to_string().contains('B'));
    }

    #[test]
    fn test_loads_only_images() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("A", [255, 0, 0], 3), ("B", [0, 255, 0], 2)], 8);
        std::fs::write(dir.path().join("A").join("labels.csv"), "x").unwrap();

        let dataset = RoiDataset::from_directory(dir.path(), &[]).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.class_counts(), vec![3, 2]);
        assert_eq!(dataset.get(0).unwrap().label, 0);
        assert!(dataset.get(5).is_none());
    }

    #[test]
    fn test_split_is_deterministic_and_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("A", [255, 0, 0], 6), ("B", [0, 255, 0], 5)], 8);

        let dataset = RoiDataset::from_directory(dir.path(), &[]).unwrap();
        let (train_a, val_a) = dataset.clone().split(0.2, 2022).unwrap();
        let (train_b, val_b) = dataset.split(0.2, 2022).unwrap();

        // ceil(11 * 0.2) = 3
        assert_eq!(val_a.len(), 3);
        assert_eq!(train_a.len(), 8);

        let paths = |d: &RoiDataset| -> Vec<PathBuf> { (0..d.len()).map(|i| d.get(i).unwrap().path).collect() };
        assert_eq!(paths(&val_a), paths(&val_b));
        assert_eq!(paths(&train_a), paths(&train_b));

        let train_paths = paths(&train_a);
        assert!(paths(&val_a).iter().all(|p| !train_paths.contains(p)));
    }

    #[test]
    fn test_split_too_small_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("A", [255, 0, 0], 1)], 8);
        let dataset = RoiDataset::from_directory_with_order(dir.path(), &["A".to_string()]).unwrap();
        assert!(dataset.split(0.2, 1).is_err());
    }

    #[test]
    fn test_batcher_shapes_and_broken_image() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), &[("A", [255, 0, 0], 2)], 20);
        let broken = dir.path().join("A").join("broken.png");
        std::fs::write(&broken, b"not really a png").unwrap();

        let device = NdArrayDevice::Cpu;
        let batcher = ImageBatcher::<NdArray<f32>>::new(device.clone(), 12);
        let items = vec![
            ImageItem { path: dir.path().join("A").join("A_0.png"), label: 1 },
            ImageItem { path: broken, label: 0 },
        ];
        let batch = batcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 12, 12]);
        let targets = batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![1, 0]);
    }
}
