//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット、学習、レポートの設定をJSON形式で保存・読み込みします。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => anyhow::bail!("不明なデバイス種別です: {} (cpu / wgpu)", other),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSettings {
    /// クラスごとのサブディレクトリを含むルートディレクトリ
    pub path: PathBuf,
    /// リサイズ後の画像高さ
    pub image_height: usize,
    /// リサイズ後の画像幅
    pub image_width: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 検証データの割合 [0, 1)
    pub validation_split: f32,
    /// 分割とシャッフルのシード
    pub seed: u64,
    /// 学習データのシャッフルバッファ長
    pub shuffle_buffer: usize,
    /// 先読みしておくバッチ数
    pub prefetch_batches: usize,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fabric_patterns"),
            image_height: 128,
            image_width: 128,
            batch_size: 32,
            validation_split: 0.2,
            seed: 123,
            shuffle_buffer: 1000,
            prefetch_batches: 2,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// 学習率
    pub learning_rate: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            learning_rate: 1e-3,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    /// 学習済みモデル（tar.gz）の保存先
    pub model_path: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("pattern_sense_model.tar.gz"),
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictSettings {
    /// モデル出力（softmax済み）に再度softmaxを適用するか
    pub renormalize_scores: bool,
}

impl Default for PredictSettings {
    fn default() -> Self {
        Self {
            renormalize_scores: true,
        }
    }
}

/// 学習履歴レポートの出力先
///
/// `None` の項目は出力しません。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSettings {
    /// 精度曲線のPNG
    pub chart_path: Option<PathBuf>,
    /// エポックごとの指標CSV
    pub csv_path: Option<PathBuf>,
    /// 学習履歴JSON
    pub json_path: Option<PathBuf>,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            chart_path: Some(PathBuf::from("training_accuracy.png")),
            csv_path: None,
            json_path: None,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// データセット設定
    #[serde(default)]
    pub dataset: DatasetSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// 推論設定
    #[serde(default)]
    pub predict: PredictSettings,
    /// レポート設定
    #[serde(default)]
    pub report: ReportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("pattern_sense.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("設定ファイルの解析に失敗しました: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定ファイルが存在すれば読み込み、存在しない場合はデフォルト設定を返す
    ///
    /// 壊れた設定ファイルはエラーとして扱います。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            tracing::info!("設定ファイルを読み込みました: {}", path.display());
            Ok(config)
        } else {
            tracing::info!(
                "設定ファイルが存在しません ({})。デフォルト設定を使用します",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("設定ファイルを書き込めません: {}", path.display()))?;
        tracing::info!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// 値の範囲チェック
    pub fn validate(&self) -> Result<()> {
        let dataset = &self.dataset;
        if !(0.0..1.0).contains(&dataset.validation_split) {
            anyhow::bail!(
                "validation_split は [0, 1) の範囲で指定してください: {}",
                dataset.validation_split
            );
        }
        if dataset.batch_size == 0 {
            anyhow::bail!("batch_size は1以上を指定してください");
        }
        if dataset.shuffle_buffer == 0 {
            anyhow::bail!("shuffle_buffer は1以上を指定してください");
        }
        if dataset.image_height == 0 || dataset.image_width == 0 {
            anyhow::bail!(
                "画像サイズが不正です: {}x{}",
                dataset.image_width,
                dataset.image_height
            );
        }
        Ok(())
    }

    /// 計算デバイスを設定
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    /// モデルパスを設定
    pub fn set_model_path<P: AsRef<Path>>(&mut self, path: P) {
        self.model.model_path = path.as_ref().to_path_buf();
    }

    /// 設定情報をログ出力
    pub fn display(&self) {
        tracing::info!("=== アプリケーション設定 ===");
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("データセット: {}", self.dataset.path.display());
        tracing::info!(
            "画像サイズ: {}x{}",
            self.dataset.image_width,
            self.dataset.image_height
        );
        tracing::info!("バッチサイズ: {}", self.dataset.batch_size);
        tracing::info!("検証データ割合: {}", self.dataset.validation_split);
        tracing::info!("シード: {}", self.dataset.seed);
        tracing::info!("エポック数: {}", self.training.num_epochs);
        tracing::info!("学習率: {}", self.training.learning_rate);
        tracing::info!("モデルパス: {}", self.model.model_path.display());
    }
}
