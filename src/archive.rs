//! 学習データアーカイブの展開
//!
//! `.zip` と `.tar.gz` / `.tgz` に対応します。
//! 展開先の外に出るエントリ（絶対パスや `..` を含むパス）はエラーにします。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use crate::model::DatasetSettings;

/// アーカイブの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    /// ファイル名から種類を判定
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }
}

/// アーカイブを `dest` に展開し、展開先を返す
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let kind = ArchiveKind::from_path(archive)
        .ok_or_else(|| anyhow::anyhow!("未対応のアーカイブ形式です: {}", archive.display()))?;

    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    let count = match kind {
        ArchiveKind::Zip => extract_zip(archive, dest)?,
        ArchiveKind::TarGz => extract_tar_gz(archive, dest)?,
    };
    tracing::info!("{} を展開しました: {} エントリ -> {}", archive.display(), count, dest.display());

    Ok(dest.to_path_buf())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open zip file: {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("Invalid zip archive: {}", archive.display()))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| anyhow::anyhow!("不正なパスを含むエントリです: {}", entry.name()))?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out_path)
            .with_context(|| format!("Failed to create file: {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out_file)?;
    }

    Ok(zip.len())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open tar.gz file: {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    let mut count = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let name = entry_path.display().to_string();
        if !is_enclosed(&entry_path) {
            anyhow::bail!("不正なパスを含むエントリです: {}", name);
        }
        // unpack_in はリンク経由で展開先の外に出る場合も false を返す
        if !entry.unpack_in(dest)? {
            anyhow::bail!("不正なパスを含むエントリです: {}", name);
        }
        count += 1;
    }
    Ok(count)
}

/// 展開先からはみ出さない相対パスか
fn is_enclosed(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// データセットが未展開ならアーカイブを展開する
///
/// `force` が true の場合は既に存在していても展開し直す。
pub fn ensure_dataset(settings: &DatasetSettings, force: bool) -> Result<PathBuf> {
    let data_dir = PathBuf::from(&settings.data_dir);
    if data_dir.is_dir() && !force {
        tracing::info!("データセットは展開済みです: {}", data_dir.display());
        return Ok(data_dir);
    }

    let archive = Path::new(&settings.archive_path);
    if !archive.exists() {
        anyhow::bail!(
            "データセット {} もアーカイブ {} も見つかりません",
            data_dir.display(),
            archive.display()
        );
    }
    extract_archive(archive, Path::new(&settings.extract_dir))?;

    if !data_dir.is_dir() {
        anyhow::bail!(
            "アーカイブを展開しましたがデータディレクトリがありません: {}",
            data_dir.display()
        );
    }
    Ok(data_dir)
}
