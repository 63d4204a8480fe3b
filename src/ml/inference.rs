//! モデル推論機能

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use image::DynamicImage;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::ml::ml_model::{image_to_chw, load_image_chw, pixels_to_tensor};
use crate::ml::PatternClassifier;
use crate::model::{load_model_with_metadata, ModelMetadata};

/// 推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub class_name: String,
    /// 予測クラスの確率 [0, 1]
    pub confidence: f32,
    /// 全クラスの確率（クラス順）
    pub scores: Vec<(String, f32)>,
}

impl Prediction {
    /// 確信度（%）
    pub fn confidence_percent(&self) -> f32 {
        self.confidence * 100.0
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.2}% confidence)",
            self.class_name,
            self.confidence_percent()
        )
    }
}

/// 学習済みモデルのハンドル
///
/// 保存先のパス、重み、クラス名を保持します。学習直後のプロセスでも、
/// 別プロセスで `load` した場合でも同じように推論できます。
pub struct TrainedModel<B: Backend> {
    path: PathBuf,
    model: PatternClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
    renormalize_scores: bool,
}

impl<B: Backend> TrainedModel<B> {
    pub fn new(
        path: PathBuf,
        model: PatternClassifier<B>,
        metadata: ModelMetadata,
        device: B::Device,
    ) -> Self {
        Self {
            path,
            model,
            metadata,
            device,
            renormalize_scores: true,
        }
    }

    /// tar.gzからモデルを読み込む
    ///
    /// ファイルが無い、エントリが欠けている、メタデータが壊れている、
    /// クラス数が重みと合わない場合は `Err` を返します。
    /// ただし `model.bin` 自体が途中で切れている場合は、burn の
    /// `BinBytesRecorder` がデコード中にパニックします。
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        // メタデータと重みの読み込み
        let path = model_path.as_ref();
        let artifact = load_model_with_metadata(path)
            .with_context(|| format!("モデルを読み込めません: {}", path.display()))?;

        // モデル初期化
        let model = artifact.metadata.model_config().init::<B>(device)?;

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, artifact.model_binary, device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);
        if model.num_classes() != artifact.metadata.num_classes() {
            anyhow::bail!(
                "モデルの出力数 ({}) とクラス数 ({}) が一致しません",
                model.num_classes(),
                artifact.metadata.num_classes()
            );
        }

        Ok(Self::new(path.to_path_buf(), model, artifact.metadata, device.clone()))
    }

    /// モデル出力に再度softmaxを適用するかを設定
    pub fn with_renormalize_scores(mut self, renormalize_scores: bool) -> Self {
        self.renormalize_scores = renormalize_scores;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn class_names(&self) -> &[String] {
        &self.metadata.class_names
    }

    pub fn model(&self) -> &PatternClassifier<B> {
        &self.model
    }

    /// 画像ファイルを分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let pixels = load_image_chw(
            image_path.as_ref(),
            self.metadata.image_height,
            self.metadata.image_width,
        )?;
        self.classify_pixels(&pixels)
    }

    /// デコード済み画像を分類
    pub fn classify_dynamic(&self, image: &DynamicImage) -> Result<Prediction> {
        let pixels = image_to_chw(image, self.metadata.image_height, self.metadata.image_width);
        self.classify_pixels(&pixels)
    }

    fn classify_pixels(&self, pixels: &[u8]) -> Result<Prediction> {
        // バッチ次元を追加 [1, 3, H, W]
        let tensor = pixels_to_tensor::<B>(
            &[pixels],
            self.metadata.image_height,
            self.metadata.image_width,
            &self.device,
        );

        let probabilities = self.model.forward(tensor);
        let scores: Tensor<B, 2> = if self.renormalize_scores {
            softmax(probabilities, 1)
        } else {
            probabilities
        };

        let scores = scores
            .into_data()
            .convert::<f32>()
            .into_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        let (class_index, confidence) = scores
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((i, p)),
            })
            .ok_or_else(|| anyhow::anyhow!("モデル出力が空です"))?;

        let class_name = self
            .metadata
            .class_names
            .get(class_index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?;

        let scores = self
            .metadata
            .class_names
            .iter()
            .cloned()
            .zip(scores.iter().copied())
            .collect();

        Ok(Prediction {
            class_index,
            class_name,
            confidence,
            scores,
        })
    }

    /// 複数画像を分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths
            .iter()
            .map(|path| self.classify_image(path))
            .collect()
    }
}

/// 画像1枚を分類して結果をログ出力する
pub fn predict_image<B: Backend, P: AsRef<Path>>(
    model: &TrainedModel<B>,
    image_path: P,
) -> Result<Prediction> {
    let image_path = image_path.as_ref();
    tracing::info!("Predicting image: {}", image_path.display());

    let prediction = model.classify_image(image_path)?;
    tracing::info!("Prediction: {}", prediction);
    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backend::{cpu_device, CpuBackend};
    use crate::ml::dataset::tests::unique_temp_dir;
    use crate::model::save_model_with_metadata;
    use image::{Rgb, RgbImage};

    fn metadata(classes: &[&str]) -> ModelMetadata {
        ModelMetadata::new(
            classes.iter().map(|c| c.to_string()).collect(),
            24,
            24,
            1,
            8,
            1e-3,
            123,
            0.2,
        )
    }

    fn random_model(classes: &[&str]) -> TrainedModel<CpuBackend> {
        let device = cpu_device();
        let metadata = metadata(classes);
        let model = metadata.model_config().init::<CpuBackend>(&device).unwrap();
        TrainedModel::new(PathBuf::from("unsaved.tar.gz"), model, metadata, device)
    }

    fn write_image(dir: &Path, name: &str, color: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(40, 32, Rgb(color)).save(&path).unwrap();
        path
    }

    #[test]
    fn test_prediction_display() {
        let prediction = Prediction {
            class_index: 1,
            class_name: "silk".into(),
            confidence: 0.87654,
            scores: vec![("cotton".into(), 0.12346), ("silk".into(), 0.87654)],
        };
        assert_eq!(prediction.to_string(), "silk (87.65% confidence)");
    }

    #[test]
    fn test_scores_cover_all_classes() {
        let dir = unique_temp_dir("predict_scores");
        let image = write_image(&dir, "sample.png", [120, 60, 30]);
        let model = random_model(&["cotton", "denim", "silk"]);

        for renormalize in [true, false] {
            let model = TrainedModel::new(
                model.path().to_path_buf(),
                model.model().clone(),
                model.metadata().clone(),
                cpu_device(),
            )
            .with_renormalize_scores(renormalize);
            let prediction = predict_image(&model, &image).unwrap();

            assert_eq!(prediction.scores.len(), 3);
            let sum: f32 = prediction.scores.iter().map(|(_, p)| p).sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert_eq!(
                prediction.class_name,
                model.class_names()[prediction.class_index]
            );
            let best = prediction
                .scores
                .iter()
                .map(|(_, p)| *p)
                .fold(f32::MIN, f32::max);
            assert_eq!(prediction.confidence, best);
        }
    }

    #[test]
    fn test_renormalize_keeps_predicted_class() {
        let dir = unique_temp_dir("predict_renormalize");
        let image = write_image(&dir, "sample.png", [10, 200, 90]);
        let model = random_model(&["a", "b", "c", "d"]);

        let twice = predict_image(&model, &image).unwrap();
        let once = TrainedModel::new(
            model.path().to_path_buf(),
            model.model().clone(),
            model.metadata().clone(),
            cpu_device(),
        )
        .with_renormalize_scores(false);
        let once = predict_image(&once, &image).unwrap();

        assert_eq!(twice.class_index, once.class_index);
    }

    #[test]
    fn test_missing_image_is_error_and_model_stays_usable() {
        let dir = unique_temp_dir("predict_missing");
        let model = random_model(&["cotton", "silk"]);

        assert!(predict_image(&model, dir.join("nope.jpg")).is_err());

        let not_an_image = dir.join("text.png");
        std::fs::write(&not_an_image, "hello").unwrap();
        assert!(predict_image(&model, &not_an_image).is_err());

        let image = write_image(&dir, "ok.png", [1, 2, 3]);
        assert!(predict_image(&model, &image).is_ok());
    }

    #[test]
    fn test_save_reload_gives_same_prediction() {
        let dir = unique_temp_dir("predict_reload");
        let image = write_image(&dir, "sample.png", [200, 180, 20]);
        let model = random_model(&["cotton", "silk"]);
        let before = predict_image(&model, &image).unwrap();

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let bytes = Recorder::<CpuBackend>::record(&recorder, model.model().clone().into_record(), ())
            .unwrap();
        let path =
            save_model_with_metadata(&dir.join("model.tar.gz"), model.metadata(), &bytes, None)
                .unwrap();

        let reloaded = TrainedModel::<CpuBackend>::load(&path, &cpu_device()).unwrap();
        let after = predict_image(&reloaded, &image).unwrap();

        assert_eq!(reloaded.class_names(), model.class_names());
        assert_eq!(after.class_index, before.class_index);
        assert!((after.confidence - before.confidence).abs() < 1e-5);
    }

    #[test]
    fn test_load_rejects_wrong_architecture() {
        let dir = unique_temp_dir("predict_wrong_arch");
        let model = random_model(&["cotton", "silk"]);
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let bytes = Recorder::<CpuBackend>::record(&recorder, model.model().clone().into_record(), ())
            .unwrap();

        // 重みは2クラス分だが、メタデータは3クラス
        let path = save_model_with_metadata(
            &dir.join("model.tar.gz"),
            &metadata(&["a", "b", "c"]),
            &bytes,
            None,
        )
        .unwrap();

        let err = TrainedModel::<CpuBackend>::load(&path, &cpu_device())
            .err()
            .expect("クラス数の不一致はエラーになるはず");
        assert!(err.to_string().contains("一致しません"));
    }
}
