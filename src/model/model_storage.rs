//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズなど）
//! - model.bin       - モデルの重み（バイナリ）
//! - optimizer.bin   - オプティマイザの状態（バイナリ、任意）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optimizer.bin";

/// tar.gzから読み込んだモデル一式
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub metadata: ModelMetadata,
    pub model_binary: Vec<u8>,
    pub optimizer_binary: Option<Vec<u8>>,
}

/// 保存先のパスを決める
///
/// すでに `.gz` で終わっている場合はそのまま、そうでなければ `.tar.gz` にする。
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 既存のファイルは上書きします。保存したパスを返します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;
    if let Some(optimizer_binary) = optimizer_binary {
        append_entry(&mut tar_builder, OPTIMIZER_ENTRY, optimizer_binary)?;
    }

    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    Ok(tar_gz_path)
}

/// 必要なエントリだけを読み込む
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut found = Vec::new();
    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read tar.gz archive: {:?}", tar_gz_path))?
    {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if wanted.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found.push((name, buffer));
        }
    }
    Ok(found)
}

fn take_entry(entries: &mut Vec<(String, Vec<u8>)>, name: &str) -> Option<Vec<u8>> {
    let index = entries.iter().position(|(n, _)| n == name)?;
    Some(entries.swap_remove(index).1)
}

fn parse_metadata(bytes: Vec<u8>) -> Result<ModelMetadata> {
    let json_str = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json_str)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    let bytes = take_entry(&mut entries, METADATA_ENTRY)
        .ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))?;
    parse_metadata(bytes)
}

/// Tar.gzからモデル一式を読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<ModelArtifact> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY, OPTIMIZER_ENTRY])?;

    let metadata = take_entry(&mut entries, METADATA_ENTRY)
        .ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))?;
    let model_binary = take_entry(&mut entries, MODEL_ENTRY)
        .ok_or_else(|| anyhow::anyhow!("model.bin not found in tar.gz archive"))?;
    let optimizer_binary = take_entry(&mut entries, OPTIMIZER_ENTRY);

    Ok(ModelArtifact {
        metadata: parse_metadata(metadata)?,
        model_binary,
        optimizer_binary,
    })
}

/// メタデータをログ出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!(
        "クラス ({}): {}",
        metadata.num_classes(),
        metadata.class_names.join(", ")
    );
    tracing::info!(
        "モデル入力サイズ: {}x{}",
        metadata.image_width,
        metadata.image_height
    );
    tracing::info!("学習エポック数: {}", metadata.num_epochs);
    tracing::info!("バッチサイズ: {}", metadata.batch_size);
    tracing::info!("学習率: {}", metadata.learning_rate);
    tracing::info!(
        "シード: {} (検証データ割合 {})",
        metadata.seed,
        metadata.validation_split
    );
    tracing::info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::unique_temp_dir;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(vec!["cotton".into(), "silk".into()], 24, 24, 2, 8, 1e-3, 123, 0.2)
    }

    #[test]
    fn test_artifact_path_extension() {
        assert_eq!(
            artifact_path(Path::new("pattern_sense_model.h5")),
            PathBuf::from("pattern_sense_model.tar.gz")
        );
        assert_eq!(
            artifact_path(Path::new("out/model.tar.gz")),
            PathBuf::from("out/model.tar.gz")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = unique_temp_dir("storage");
        let path = dir.join("nested").join("model.tar.gz");

        let saved = save_model_with_metadata(&path, &metadata(), &[1, 2, 3], Some(&[9, 9])).unwrap();
        assert_eq!(saved, path);

        let loaded = load_metadata(&saved).unwrap();
        assert_eq!(loaded, metadata());

        let artifact = load_model_with_metadata(&saved).unwrap();
        assert_eq!(artifact.metadata.class_names, vec!["cotton", "silk"]);
        assert_eq!(artifact.model_binary, vec![1, 2, 3]);
        assert_eq!(artifact.optimizer_binary, Some(vec![9, 9]));
    }

    #[test]
    fn test_save_overwrites_existing_file() {
        let dir = unique_temp_dir("overwrite");
        let path = dir.join("model.tar.gz");
        save_model_with_metadata(&path, &metadata(), &[1; 64], None).unwrap();
        save_model_with_metadata(&path, &metadata(), &[7], None).unwrap();

        let artifact = load_model_with_metadata(&path).unwrap();
        assert_eq!(artifact.model_binary, vec![7]);
        assert!(artifact.optimizer_binary.is_none());
    }

    #[test]
    fn test_missing_entries_are_rejected() {
        let dir = unique_temp_dir("missing_entry");
        let path = dir.join("broken.tar.gz");

        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let json = metadata().to_json_string().unwrap();
        append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(load_metadata(&path).is_ok());
        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(err.to_string().contains("model.bin"));

        assert!(load_metadata(&dir.join("nothing.tar.gz")).is_err());
    }
}
