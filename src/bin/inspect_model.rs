//! 保存済みモデル（tar.gz）のメタデータを表示するツール

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use pattern_sense::model::{
    load_metadata, load_model_with_metadata, print_metadata_info, AppConfig,
};

#[derive(Parser, Debug)]
#[command(name = "inspect_model", about = "モデルファイルのメタデータを表示")]
struct Args {
    /// モデルファイル（省略時は設定ファイルのパス）
    model: Option<PathBuf>,

    /// 重みとオプティマイザ状態のサイズも表示する
    #[arg(long)]
    full: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let model_path = match args.model {
        Some(path) => path,
        None => AppConfig::load_or_default(AppConfig::default_path())?.model.model_path,
    };
    tracing::info!("モデルファイル: {}", model_path.display());

    if args.full {
        let artifact = load_model_with_metadata(&model_path)?;
        print_metadata_info(&artifact.metadata);
        tracing::info!("model.bin: {} bytes", artifact.model_binary.len());
        match &artifact.optimizer_binary {
            Some(bytes) => tracing::info!("optimizer.bin: {} bytes", bytes.len()),
            None => tracing::info!("optimizer.bin: なし"),
        }
    } else {
        let metadata = load_metadata(&model_path)?;
        print_metadata_info(&metadata);
    }

    Ok(())
}
