//! モデル学習
//!
//! データセット読み込み → モデル構築 → 学習 → レポート → 保存 を順に実行します。

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::DataLoader, dataset::Dataset},
    module::{AutodiffModule, Module},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::ml::dataset::{
    build_loader, load_dataset, prefetch, LoadedDataset, PatternBatch, PatternDataset,
    ShuffleBuffer,
};
use crate::ml::inference::TrainedModel;
use crate::ml::{ModelConfig, PatternClassifier};
use crate::model::config::{AppConfig, DatasetSettings, TrainingSettings};
use crate::model::{save_model_with_metadata, ModelMetadata};
use crate::report::{reporters_from_settings, run_reports};

/// 1エポック分の指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1始まりのエポック番号
    pub epoch: usize,
    pub train_accuracy: f64,
    pub train_loss: f64,
    /// 検証データが無い場合は `None`
    pub val_accuracy: Option<f64>,
    pub val_loss: Option<f64>,
}

/// 学習履歴（エポックごとに追記）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn record(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// 学習精度の推移
    pub fn accuracy(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.train_accuracy).collect()
    }

    /// 検証精度の推移（検証しなかったエポックは除く）
    pub fn val_accuracy(&self) -> Vec<f64> {
        self.epochs.iter().filter_map(|e| e.val_accuracy).collect()
    }

    pub fn loss(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.train_loss).collect()
    }

    pub fn val_loss(&self) -> Vec<f64> {
        self.epochs.iter().filter_map(|e| e.val_loss).collect()
    }
}

#[derive(Default)]
struct TrainStats {
    loss_sum: f64,
    examples: usize,
    correct: usize,
}

impl TrainStats {
    /// `loss` はバッチ平均
    fn record(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.examples += batch_size;
    }

    fn avg_loss(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            self.loss_sum / self.examples as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            self.correct as f64 / self.examples as f64
        }
    }
}

/// 予測が正解と一致した数
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size] = targets.dims();
    let predicted = logits.argmax(1);
    let correct: i64 = predicted
        .equal(targets.reshape([batch_size, 1]))
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

/// 学習済みモデルとその状態
pub struct FitOutput<B: AutodiffBackend> {
    pub model: PatternClassifier<B>,
    /// オプティマイザ状態（BinBytesRecorder形式）
    pub optimizer_state: Vec<u8>,
    pub history: TrainingHistory,
}

fn evaluate<B: Backend>(
    model: &PatternClassifier<B>,
    loss_fn: &CrossEntropyLoss<B>,
    loader: &Arc<dyn DataLoader<B, PatternBatch<B>>>,
    prefetch_batches: usize,
) -> TrainStats {
    let mut stats = TrainStats::default();

    for batch in prefetch(loader.clone(), prefetch_batches) {
        let [batch_size] = batch.targets.dims();
        let logits = model.forward_logits(batch.images);
        let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
        let correct = count_correct(logits, batch.targets);
        stats.record(loss.into_scalar().elem(), correct, batch_size);
    }

    stats
}

/// 検証用データローダー（シャッフルしない）
///
/// 検証データが空の場合は `None`。
fn validation_loader<B: Backend>(
    valid: &PatternDataset,
    batch_size: usize,
    device: &B::Device,
) -> Option<Arc<dyn DataLoader<B, PatternBatch<B>>>> {
    (!valid.is_empty())
        .then(|| build_loader::<B, _>(valid.clone(), valid.batcher(), batch_size, device.clone()))
}

/// 学習ループ
///
/// 各エポックで学習データ全体を1周し、その後に検証データを評価します（重みは更新しない）。
pub fn fit<B: AutodiffBackend>(
    mut model: PatternClassifier<B>,
    data: &LoadedDataset,
    dataset: &DatasetSettings,
    training: &TrainingSettings,
    device: &B::Device,
) -> Result<FitOutput<B>> {
    if data.train.is_empty() {
        anyhow::bail!("学習データが空です。validation_split かデータセットを確認してください");
    }

    // 損失関数とオプティマイザ
    let loss_fn = CrossEntropyLossConfig::new().init::<B>(device);
    let valid_loss_fn = CrossEntropyLossConfig::new().init::<B::InnerBackend>(device);
    let mut optimizer = AdamConfig::new().init();

    // 検証データは全エポックで同じ順序
    let valid_loader =
        validation_loader::<B::InnerBackend>(&data.valid, dataset.batch_size, device);
    if valid_loader.is_none() {
        tracing::warn!("検証データがありません。検証指標は記録されません");
    }

    let mut history = TrainingHistory::default();

    for epoch in 0..training.num_epochs {
        // エポックごとにシャッフル順を引き直す
        let shuffled = ShuffleBuffer::new(
            data.train.clone(),
            dataset.shuffle_buffer,
            dataset.seed.wrapping_add(epoch as u64),
        );
        let train_loader = build_loader::<B, _>(
            shuffled,
            data.train.batcher(),
            dataset.batch_size,
            device.clone(),
        );

        let mut stats = TrainStats::default();
        for batch in prefetch(train_loader, dataset.prefetch_batches) {
            // 順伝播
            let [batch_size] = batch.targets.dims();
            let logits = model.forward_logits(batch.images);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());

            let correct = count_correct(logits, batch.targets);
            stats.record(loss.clone().into_scalar().elem(), correct, batch_size);

            // 逆伝播とパラメータ更新
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(training.learning_rate, model, grads);
        }

        // 検証（重みは更新しない）
        let (val_accuracy, val_loss) = match &valid_loader {
            Some(loader) => {
                let eval = evaluate(&model.valid(), &valid_loss_fn, loader, dataset.prefetch_batches);
                (Some(eval.accuracy()), Some(eval.avg_loss()))
            }
            None => (None, None),
        };

        let metrics = EpochMetrics {
            epoch: epoch + 1,
            train_accuracy: stats.accuracy(),
            train_loss: stats.avg_loss(),
            val_accuracy,
            val_loss,
        };
        tracing::info!(
            "epoch {:>3}/{:<3} | loss: {:.4} | accuracy: {:.4} | val_loss: {} | val_accuracy: {}",
            metrics.epoch,
            training.num_epochs,
            metrics.train_loss,
            metrics.train_accuracy,
            format_optional(metrics.val_loss),
            format_optional(metrics.val_accuracy),
        );
        history.record(metrics);
    }

    // オプティマイザ状態（Adamのモーメント）をバイト列に
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let optimizer_state = Recorder::<B>::record(&recorder, optimizer.to_record(), ())
        .map_err(|e| anyhow::anyhow!("オプティマイザ状態の保存エラー: {:?}", e))?;

    Ok(FitOutput {
        model,
        optimizer_state,
        history,
    })
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v))
}

/// 学習の成果物
pub struct TrainingOutcome<B: Backend> {
    pub class_names: Vec<String>,
    pub history: TrainingHistory,
    /// 保存済みモデル（このプロセス内でそのまま推論に使える）
    pub model: TrainedModel<B>,
}

impl<B: Backend> TrainingOutcome<B> {
    pub fn model_path(&self) -> PathBuf {
        self.model.path().to_path_buf()
    }
}

/// モデル学習を実行
///
/// データセット読み込みから保存までを行い、学習済みモデルを返します。
pub fn train_model<B: AutodiffBackend>(
    config: &AppConfig,
    device: B::Device,
) -> Result<TrainingOutcome<B::InnerBackend>> {
    config.validate()?;
    let settings = &config.dataset;

    tracing::info!("Loading dataset...");
    let data = load_dataset(settings)?;

    // モデル初期化
    tracing::info!("Building model...");
    let model_config = ModelConfig::new(data.num_classes())
        .with_image_height(settings.image_height)
        .with_image_width(settings.image_width);
    let model = model_config.init::<B>(&device)?;
    tracing::info!(
        "モデル設定: {} クラス, 入力サイズ: {}x{}, パラメータ数: {}",
        data.num_classes(),
        settings.image_width,
        settings.image_height,
        model.num_params()
    );

    tracing::info!("Training model...");
    tracing::info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        config.training.num_epochs,
        settings.batch_size,
        config.training.learning_rate
    );
    let output = fit(model, &data, settings, &config.training, &device)?;

    // 学習履歴のレポート
    tracing::info!("Evaluating model...");
    let reporters = reporters_from_settings(&config.report);
    run_reports(&output.history, &reporters)?;

    // 自動微分を外した重みを記録
    let trained = output.model.valid();
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = Recorder::<B::InnerBackend>::record(&recorder, trained.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの保存エラー: {:?}", e))?;

    let metadata = ModelMetadata::new(
        data.class_names.clone(),
        settings.image_height,
        settings.image_width,
        config.training.num_epochs,
        settings.batch_size,
        config.training.learning_rate,
        settings.seed,
        settings.validation_split,
    );

    // メタデータと一緒にtar.gzへ保存
    let saved_path = save_model_with_metadata(
        &config.model.model_path,
        &metadata,
        &model_binary,
        Some(&output.optimizer_state),
    )
    .context("モデルの保存に失敗しました")?;
    tracing::info!("Model saved as {}", saved_path.display());

    let model = TrainedModel::new(saved_path, trained, metadata, device)
        .with_renormalize_scores(config.predict.renormalize_scores);

    Ok(TrainingOutcome {
        class_names: data.class_names,
        history: output.history,
        model,
    })
}
