//! 布地パターン分類器のCLI
//!
//! - `pattern_sense train`   : データセットから学習してモデルを保存
//! - `pattern_sense predict` : 保存済みモデルで画像を分類

use anyhow::Result;
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pattern_sense::ml::backend::describe;
use pattern_sense::ml::{predict_image, train_model, TrainedModel};
use pattern_sense::model::{AppConfig, DeviceType};
use pattern_sense::with_backend;

#[derive(Parser, Debug)]
#[command(name = "pattern_sense", version, about = "布地パターン画像分類（Burn CNN）")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// データセットから学習し、モデルを保存する
    Train {
        /// 設定ファイル（存在しない場合はデフォルト設定）
        #[arg(long, default_value_os_t = AppConfig::default_path())]
        config: PathBuf,

        /// クラスごとのサブディレクトリを含むデータセット
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// エポック数
        #[arg(long)]
        epochs: Option<usize>,

        /// モデルの保存先（tar.gz）
        #[arg(long)]
        output: Option<PathBuf>,

        /// 計算デバイス (cpu / wgpu)
        #[arg(long, env = "PATTERN_SENSE_DEVICE")]
        device: Option<DeviceType>,

        /// 最終的な設定を設定ファイルに保存する
        #[arg(long)]
        write_config: bool,
    },

    /// 保存済みモデルで画像を分類する
    Predict {
        /// 分類する画像
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// 設定ファイル（存在しない場合はデフォルト設定）
        #[arg(long, default_value_os_t = AppConfig::default_path())]
        config: PathBuf,

        /// モデルファイル（tar.gz）
        #[arg(long)]
        model: Option<PathBuf>,

        /// 計算デバイス (cpu / wgpu)
        #[arg(long, env = "PATTERN_SENSE_DEVICE")]
        device: Option<DeviceType>,

        /// モデル出力に再度softmaxを適用しない
        #[arg(long)]
        no_renormalize: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            dataset,
            epochs,
            output,
            device,
            write_config,
        } => {
            let config_path = config;
            let mut config = AppConfig::load_or_default(&config_path)?;
            if let Some(dataset) = dataset {
                config.dataset.path = dataset;
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(output) = output {
                config.set_model_path(output);
            }
            if let Some(device) = device {
                config.set_device_type(device);
            }
            config.validate()?;
            if write_config {
                config.save(&config_path)?;
            }
            config.display();

            run_train(&config)
        }
        Command::Predict {
            images,
            config,
            model,
            device,
            no_renormalize,
        } => {
            let mut config = AppConfig::load_or_default(&config)?;
            if let Some(model) = model {
                config.set_model_path(model);
            }
            if let Some(device) = device {
                config.set_device_type(device);
            }
            if no_renormalize {
                config.predict.renormalize_scores = false;
            }

            run_predict(&config, &images)
        }
    }
}

fn run_train(config: &AppConfig) -> Result<()> {
    tracing::info!("計算デバイス: {}", describe(config.device_type));

    let (class_names, model_path, history_len) = with_backend!(config.device_type, |B, device| {
        let outcome = train_model::<B>(config, device)?;
        (
            outcome.class_names.clone(),
            outcome.model_path(),
            outcome.history.len(),
        )
    });

    tracing::info!(
        "学習完了: {} エポック, クラス: {:?}, モデル: {}",
        history_len,
        class_names,
        model_path.display()
    );
    Ok(())
}

fn run_predict(config: &AppConfig, images: &[PathBuf]) -> Result<()> {
    tracing::info!("計算デバイス: {}", describe(config.device_type));

    with_backend!(config.device_type, |B, device| {
        predict_with::<B>(config, images, &device)
    })
}

fn predict_with<B: AutodiffBackend>(
    config: &AppConfig,
    images: &[PathBuf],
    device: &B::Device,
) -> Result<()> {
    let model = TrainedModel::<B::InnerBackend>::load(&config.model.model_path, device)?
        .with_renormalize_scores(config.predict.renormalize_scores);
    tracing::info!(
        "モデルを読み込みました: {} (クラス: {:?})",
        model.path().display(),
        model.class_names()
    );

    let mut failures = 0;
    for image in images {
        match predict_image(&model, image) {
            Ok(prediction) => println!("{}: {}", image.display(), prediction),
            Err(e) => {
                tracing::error!("{}: {:#}", image.display(), e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} / {} 枚の画像を分類できませんでした", failures, images.len());
    }
    Ok(())
}
