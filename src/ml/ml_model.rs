//! 機械学習モデルの共通定義
//!
//! 生地パターン分類用のCNNモデルと画像前処理を提供します。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Tensor, TensorData},
};
use image::{imageops::FilterType, DynamicImage};
use std::path::Path;

/// 入力チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// 画素値の最大値（Rescale層で使用）
const PIXEL_MAX: f32 = 255.0;

/// 全結合層の隠れユニット数
const HIDDEN_UNITS: usize = 128;

/// 3段の Conv(3x3, no padding) + MaxPool(2x2) を通過した後の特徴マップの一辺
///
/// 途中で1ピクセル未満になる場合は `None`。
pub fn feature_map_size(size: usize) -> Option<usize> {
    let mut s = size;
    for _ in 0..3 {
        if s < 3 {
            return None;
        }
        s = (s - 2) / 2;
    }
    (s > 0).then_some(s)
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像の高さ
    #[config(default = 128)]
    pub image_height: usize,
    /// 入力画像の幅
    #[config(default = 128)]
    pub image_width: usize,
}

impl ModelConfig {
    /// Flatten後の特徴次元
    pub fn flattened_features(&self) -> Result<usize> {
        let h = feature_map_size(self.image_height);
        let w = feature_map_size(self.image_width);
        match (h, w) {
            (Some(h), Some(w)) => Ok(128 * h * w),
            _ => anyhow::bail!(
                "入力サイズが小さすぎます: {}x{} (最小22x22が必要)",
                self.image_width,
                self.image_height
            ),
        }
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PatternClassifier<B>> {
        if self.num_classes == 0 {
            anyhow::bail!("クラス数が0です");
        }
        let d = self.flattened_features()?;

        tracing::debug!(
            "[Model] 入力: 3x{}x{}, Flatten後: {}, FC1: {} -> {}, FC2: {} -> {}",
            self.image_height,
            self.image_width,
            d,
            d,
            HIDDEN_UNITS,
            HIDDEN_UNITS,
            self.num_classes
        );

        Ok(PatternClassifier {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([64, 128], [3, 3]).init(device),
            pool3: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 生地パターン分類用CNNモデル
///
/// # アーキテクチャ
/// - Rescale (÷255)
/// - {Conv 3x3 (no padding, stride 1) + ReLU + MaxPool 2x2} x 3層 (32, 64, 128ch)
/// - Flatten
/// - FC: d -> 128 + ReLU
/// - FC: 128 -> num_classes
/// - Softmax
#[derive(Module, Debug)]
pub struct PatternClassifier<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    pool3: MaxPool2d,

    fc1: Linear<B>, // d -> 128
    fc2: Linear<B>, // 128 -> num_classes

    activation: Relu,
}

impl<B: Backend> PatternClassifier<B> {
    /// Softmax前のスコアを計算
    ///
    /// # 引数
    /// - `images`: 0〜255の画素値 [batch_size, 3, height, width]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        // Rescale: 0〜255 → 0〜1
        let x = images.div_scalar(PIXEL_MAX);

        // 特徴抽出
        let x = self.conv1.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);

        // 分類
        let x = x.flatten(1, 3);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// 順伝播（クラス確率）
    ///
    /// 出力は各行の和が1になります。
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward_logits(images), 1)
    }

    /// 出力層のクラス数
    pub fn num_classes(&self) -> usize {
        let [_, classes] = self.fc2.weight.dims();
        classes
    }
}

/// 画像を RGB に変換し、指定サイズに引き伸ばして (C, H, W) 順の画素列にする
pub fn image_to_chw(image: &DynamicImage, height: usize, width: usize) -> Vec<u8> {
    let rgb = image
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_rgb8();

    let mut data = vec![0u8; CHANNELS * height * width];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for channel in 0..CHANNELS {
            data[channel * height * width + y * width + x] = pixel[channel];
        }
    }
    data
}

/// 画像ファイルを読み込んで (C, H, W) 順の画素列にする
pub fn load_image_chw(path: &Path, height: usize, width: usize) -> Result<Vec<u8>> {
    if !path.exists() {
        anyhow::bail!("画像ファイルが存在しません: {}", path.display());
    }
    let image = image::open(path)
        .with_context(|| format!("画像を読み込めません: {}", path.display()))?;
    Ok(image_to_chw(&image, height, width))
}

/// 画素列をまとめて [n, 3, height, width] のテンソルにする
pub fn pixels_to_tensor<B: Backend>(
    pixels: &[&[u8]],
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let mut all = Vec::with_capacity(pixels.len() * CHANNELS * height * width);
    for image in pixels {
        all.extend(image.iter().map(|&p| p as f32));
    }
    let data = TensorData::new(all, [pixels.len(), CHANNELS, height, width]);
    Tensor::<B, 4>::from_data(data, device)
}
