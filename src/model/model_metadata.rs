//! モデルメタデータの定義
//!
//! 推論時に必要な情報（クラス名と入力サイズ）を重みと一緒に保存します。
//! 学習時のディレクトリ構成に依存せずに推論できるようにするためです。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::ModelConfig;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
/// - optimizer.bin: Adamのモーメント（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// クラス名（インデックス = ラベル）
    /// 例: ["cotton", "denim", "silk"]
    pub class_names: Vec<String>,

    /// モデル入力画像の高さ（ピクセル）
    pub image_height: usize,

    /// モデル入力画像の幅（ピクセル）
    pub image_width: usize,

    /// 学習エポック数
    pub num_epochs: usize,

    /// 学習時のバッチサイズ
    pub batch_size: usize,

    /// 学習率
    pub learning_rate: f64,

    /// 分割・シャッフルに使ったシード
    pub seed: u64,

    /// 検証データの割合
    pub validation_split: f32,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 現在時刻で新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        image_height: usize,
        image_width: usize,
        num_epochs: usize,
        batch_size: usize,
        learning_rate: f64,
        seed: u64,
        validation_split: f32,
    ) -> Self {
        Self {
            class_names,
            image_height,
            image_width,
            num_epochs,
            batch_size,
            learning_rate,
            seed,
            validation_split,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 保存されたモデルを再構築するための設定
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.num_classes())
            .with_image_height(self.image_height)
            .with_image_width(self.image_width)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.class_names.is_empty() {
            anyhow::bail!("メタデータにクラス名がありません");
        }
        Ok(metadata)
    }
}
