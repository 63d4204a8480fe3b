//! クラスごとのディレクトリから学習データを読み込む
//!
//! ```text
//! fabric_patterns/
//!   cotton/  *.jpg
//!   silk/    *.png
//! ```
//!
//! サブディレクトリ名をソートした順がクラスIDになります。

use anyhow::{Context, Result};
use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use crate::ml::ml_model::{load_image_chw, pixels_to_tensor};
use crate::model::config::DatasetSettings;

/// 学習に使う画像の拡張子
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

/// 画像ファイルかどうか（拡張子で判定、大文字小文字は無視）
pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// ディレクトリ走査の結果
#[derive(Debug, Clone)]
pub struct ClassTree {
    /// クラス名（インデックス = ラベル）
    pub class_names: Vec<String>,
    /// (画像パス, クラスID)
    pub samples: Vec<(PathBuf, usize)>,
}

impl ClassTree {
    /// ルートディレクトリ直下のサブディレクトリをクラスとして走査する
    pub fn scan(data_dir: &Path) -> Result<Self> {
        if !data_dir.is_dir() {
            anyhow::bail!("データセットのディレクトリが存在しません: {}", data_dir.display());
        }

        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(data_dir)
            .with_context(|| format!("ディレクトリを読み込めません: {}", data_dir.display()))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", path.display()))?
                .to_string();
            if name.starts_with('.') {
                continue;
            }
            class_dirs.push((name, path));
        }
        class_dirs.sort_by(|a, b| a.0.cmp(&b.0));

        if class_dirs.is_empty() {
            anyhow::bail!("クラスのサブディレクトリが見つかりません: {}", data_dir.display());
        }

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut samples = Vec::new();

        for (class_id, (name, path)) in class_dirs.into_iter().enumerate() {
            let mut images = Vec::new();
            for entry in std::fs::read_dir(&path)
                .with_context(|| format!("ディレクトリを読み込めません: {}", path.display()))?
            {
                let img_path = entry?.path();
                if is_image_file(&img_path) {
                    images.push(img_path);
                }
            }
            images.sort();

            if images.is_empty() {
                tracing::warn!("クラス '{}' に画像がありません", name);
            }
            tracing::debug!("  Class {}: {} ({} samples)", class_id, name, images.len());

            samples.extend(images.into_iter().map(|p| (p, class_id)));
            class_names.push(name);
        }

        if samples.is_empty() {
            anyhow::bail!("No training samples found in {}", data_dir.display());
        }

        Ok(Self {
            class_names,
            samples,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 学習用と検証用に分割する
    ///
    /// シード付きでシャッフルした後、末尾 `floor(total * validation_split)` 件を検証用にします。
    pub fn split(
        &self,
        validation_split: f32,
        seed: u64,
    ) -> (Vec<(PathBuf, usize)>, Vec<(PathBuf, usize)>) {
        let mut shuffled = self.samples.clone();
        let mut rng = StdRng::seed_from_u64(seed);
        shuffled.shuffle(&mut rng);

        let total = shuffled.len();
        let val_count = ((total as f64) * validation_split as f64).floor() as usize;
        let val_count = val_count.min(total);

        let valid = shuffled.split_off(total - val_count);
        (shuffled, valid)
    }
}

/// データセットアイテム（リサイズ済みのCHW画素列）
#[derive(Clone, Debug)]
pub struct PatternItem {
    pub pixels: Arc<[u8]>,
    pub label: usize,
}

/// メモリ上にキャッシュされたデータセット
#[derive(Clone, Debug)]
pub struct PatternDataset {
    items: Arc<Vec<PatternItem>>,
    height: usize,
    width: usize,
}

impl PatternDataset {
    /// 画像をすべてデコード・リサイズしてメモリに載せる
    pub fn cache(samples: &[(PathBuf, usize)], height: usize, width: usize) -> Result<Self> {
        let items = samples
            .par_iter()
            .map(|(path, label)| -> Result<PatternItem> {
                let pixels = load_image_chw(path, height, width)?;
                Ok(PatternItem {
                    pixels: pixels.into(),
                    label: *label,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            items: Arc::new(items),
            height,
            width,
        })
    }

    /// (高さ, 幅)
    pub fn image_size(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// バッチャーを作成
    pub fn batcher(&self) -> PatternBatcher {
        PatternBatcher::new(self.height, self.width)
    }
}

impl Dataset<PatternItem> for PatternDataset {
    fn get(&self, index: usize) -> Option<PatternItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// 上限付きバッファでシャッフルした順序を作る
///
/// 先頭から `buffer_size` 件をバッファに入れ、ランダムに1件取り出すたびに次の要素を補充します。
/// 位置 `i` の要素が出力されるのは `i + 1 - buffer_size` 番目以降です。
pub fn bounded_shuffle_order<R: Rng>(len: usize, buffer_size: usize, rng: &mut R) -> Vec<usize> {
    let mut source = 0..len;
    let mut buffer: Vec<usize> = source.by_ref().take(buffer_size.max(1)).collect();
    let mut order = Vec::with_capacity(len);

    while !buffer.is_empty() {
        let slot = rng.gen_range(0..buffer.len());
        match source.next() {
            Some(next) => order.push(std::mem::replace(&mut buffer[slot], next)),
            None => order.push(buffer.swap_remove(slot)),
        }
    }

    order
}

/// シャッフルバッファを通した順で内側のデータセットを返す
pub struct ShuffleBuffer<D> {
    inner: D,
    order: Vec<usize>,
}

impl<D> ShuffleBuffer<D> {
    pub fn new<I>(inner: D, buffer_size: usize, seed: u64) -> Self
    where
        D: Dataset<I>,
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let order = bounded_shuffle_order(inner.len(), buffer_size, &mut rng);
        Self { inner, order }
    }
}

impl<D, I> Dataset<I> for ShuffleBuffer<D>
where
    D: Dataset<I>,
{
    fn get(&self, index: usize) -> Option<I> {
        let actual_index = *self.order.get(index)?;
        self.inner.get(actual_index)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct PatternBatcher {
    height: usize,
    width: usize,
}

impl PatternBatcher {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

impl<B: Backend> Batcher<B, PatternItem, PatternBatch<B>> for PatternBatcher {
    fn batch(&self, items: Vec<PatternItem>, device: &B::Device) -> PatternBatch<B> {
        let pixels: Vec<&[u8]> = items.iter().map(|item| item.pixels.as_ref()).collect();
        let images = pixels_to_tensor::<B>(&pixels, self.height, self.width, device);

        let targets: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, [items.len()]),
            device,
        );

        PatternBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct PatternBatch<B: Backend> {
    /// [batch_size, 3, height, width]、画素値は0〜255
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// データローダーを作成（順序はデータセットの順のまま）
pub fn build_loader<B, D>(
    dataset: D,
    batcher: PatternBatcher,
    batch_size: usize,
    device: B::Device,
) -> Arc<dyn DataLoader<B, PatternBatch<B>>>
where
    B: Backend,
    D: Dataset<PatternItem> + 'static,
{
    DataLoaderBuilder::<B, PatternItem, PatternBatch<B>>::new(batcher)
        .batch_size(batch_size)
        .set_device(device)
        .build(dataset)
}

/// 別スレッドでバッチを先読みするイテレータ
///
/// 現在のバッチを処理している間に、次の `depth` 個のバッチを組み立てます。
/// 順序はデータローダーと同じです。
pub struct Prefetch<O> {
    receiver: mpsc::Receiver<O>,
    handle: Option<JoinHandle<()>>,
}

impl<O> Iterator for Prefetch<O> {
    type Item = O;

    fn next(&mut self) -> Option<O> {
        match self.receiver.recv() {
            Ok(batch) => Some(batch),
            Err(_) => {
                // 送信側が終了した。パニックしていた場合は呼び出し側に伝える
                if let Some(handle) = self.handle.take() {
                    if let Err(panic) = handle.join() {
                        std::panic::resume_unwind(panic);
                    }
                }
                None
            }
        }
    }
}

/// データローダーのバッチを先読みする。`depth == 0` の場合も1バッチ分は先行します。
pub fn prefetch<B, O>(loader: Arc<dyn DataLoader<B, O>>, depth: usize) -> Prefetch<O>
where
    B: Backend,
    O: Send + 'static,
{
    let (sender, receiver) = mpsc::sync_channel(depth);
    let handle = std::thread::spawn(move || {
        for batch in loader.iter() {
            if sender.send(batch).is_err() {
                break;
            }
        }
    });

    Prefetch {
        receiver,
        handle: Some(handle),
    }
}

/// 読み込み済みデータセット
#[derive(Clone, Debug)]
pub struct LoadedDataset {
    pub class_names: Vec<String>,
    pub train: PatternDataset,
    pub valid: PatternDataset,
}

impl LoadedDataset {
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn total_len(&self) -> usize {
        self.train.len() + self.valid.len()
    }
}

/// 設定に従ってデータセットを読み込み、分割してキャッシュする
pub fn load_dataset(settings: &DatasetSettings) -> Result<LoadedDataset> {
    tracing::info!("データセットを読み込み中: {}", settings.path.display());
    let tree = ClassTree::scan(&settings.path)?;
    tracing::info!(
        "{} 枚の画像 ({} クラス) を検出しました",
        tree.samples.len(),
        tree.num_classes()
    );
    tracing::info!("Detected Classes: {:?}", tree.class_names);

    let (train_samples, valid_samples) = tree.split(settings.validation_split, settings.seed);
    tracing::info!(
        "学習データ: {} 枚, 検証データ: {} 枚",
        train_samples.len(),
        valid_samples.len()
    );

    let (height, width) = (settings.image_height, settings.image_width);
    let train = PatternDataset::cache(&train_samples, height, width)
        .context("学習データのキャッシュに失敗しました")?;
    let valid = PatternDataset::cache(&valid_samples, height, width)
        .context("検証データのキャッシュに失敗しました")?;

    Ok(LoadedDataset {
        class_names: tree.class_names,
        train,
        valid,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestBackend = NdArray<f32>;

    static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// テスト用の一時ディレクトリ（プロセス内で一意）
    pub(crate) fn unique_temp_dir(name: &str) -> PathBuf {
        let id = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "pattern_sense_{}_{}_{}",
            name,
            std::process::id(),
            id
        ));
        if dir.exists() {
            std::fs::remove_dir_all(&dir).unwrap();
        }
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// クラスごとに単色の画像を生成する
    pub(crate) fn write_class_tree(root: &Path, classes: &[(&str, usize, [u8; 3])]) {
        for (name, count, color) in classes {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let img = RgbImage::from_pixel(30, 20, Rgb(*color));
                img.save(dir.join(format!("{:03}.png", i))).unwrap();
            }
        }
    }

    /// ラベルが 0, 1, 2, ... と並ぶ小さなデータセット（順序の確認用）
    pub(crate) fn indexed_dataset(len: usize) -> PatternDataset {
        let items = (0..len)
            .map(|label| PatternItem {
                pixels: vec![(label % 256) as u8; crate::ml::ml_model::CHANNELS * 4 * 4].into(),
                label,
            })
            .collect();
        PatternDataset {
            items: Arc::new(items),
            height: 4,
            width: 4,
        }
    }

    pub(crate) fn batch_targets<B: Backend>(batch: &PatternBatch<B>) -> Vec<i64> {
        batch
            .targets
            .clone()
            .into_data()
            .convert::<i64>()
            .into_vec::<i64>()
            .unwrap()
    }

    #[test]
    fn test_scan_sorted_class_names() {
        let root = unique_temp_dir("scan");
        write_class_tree(&root, &[("silk", 3, [200, 0, 0]), ("cotton", 2, [0, 0, 200])]);
        std::fs::create_dir_all(root.join(".hidden")).unwrap();
        std::fs::write(root.join("cotton").join("notes.txt"), "not an image").unwrap();

        let tree = ClassTree::scan(&root).unwrap();
        assert_eq!(tree.class_names, vec!["cotton".to_string(), "silk".to_string()]);
        assert_eq!(tree.samples.len(), 5);
        assert_eq!(tree.samples.iter().filter(|(_, id)| *id == 0).count(), 2);
        assert_eq!(tree.samples.iter().filter(|(_, id)| *id == 1).count(), 3);
    }

    #[test]
    fn test_scan_errors() {
        let missing = std::env::temp_dir().join("pattern_sense_missing_dataset_dir");
        assert!(ClassTree::scan(&missing).is_err());

        let no_classes = unique_temp_dir("no_classes");
        assert!(ClassTree::scan(&no_classes).is_err());

        let no_images = unique_temp_dir("no_images");
        std::fs::create_dir_all(no_images.join("cotton")).unwrap();
        assert!(ClassTree::scan(&no_images).is_err());
    }

    #[test]
    fn test_split_sizes_and_determinism() {
        let tree = ClassTree {
            class_names: vec!["cotton".into(), "silk".into()],
            samples: (0..200)
                .map(|i| (PathBuf::from(format!("{}.png", i)), i / 100))
                .collect(),
        };

        let (train, valid) = tree.split(0.2, 123);
        assert_eq!(train.len(), 160);
        assert_eq!(valid.len(), 40);

        let all: HashSet<_> = train.iter().chain(valid.iter()).map(|(p, _)| p.clone()).collect();
        assert_eq!(all.len(), 200);

        let (train_again, valid_again) = tree.split(0.2, 123);
        assert_eq!(train, train_again);
        assert_eq!(valid, valid_again);

        let (_, valid_other) = tree.split(0.2, 7);
        assert_ne!(valid, valid_other);
    }

    #[test]
    fn test_split_without_validation() {
        let tree = ClassTree {
            class_names: vec!["a".into()],
            samples: (0..5).map(|i| (PathBuf::from(format!("{}.png", i)), 0)).collect(),
        };
        let (train, valid) = tree.split(0.0, 1);
        assert_eq!(train.len(), 5);
        assert!(valid.is_empty());
    }

    #[test]
    fn test_bounded_shuffle_is_permutation_within_horizon() {
        let mut rng = StdRng::seed_from_u64(5);
        let buffer_size = 10;
        let order = bounded_shuffle_order(500, buffer_size, &mut rng);

        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, (0..500).collect::<Vec<_>>());

        for (position, &original) in order.iter().enumerate() {
            assert!(
                position + buffer_size > original,
                "要素 {} が位置 {} に出力された",
                original,
                position
            );
        }
        assert_ne!(order, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_shuffle_buffer_of_one_is_identity() {
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(bounded_shuffle_order(20, 1, &mut rng), (0..20).collect::<Vec<_>>());
        assert!(bounded_shuffle_order(0, 1000, &mut rng).is_empty());
    }

    #[test]
    fn test_shuffle_buffer_dataset_keeps_items() {
        let root = unique_temp_dir("shuffle");
        write_class_tree(&root, &[("a", 4, [1, 2, 3]), ("b", 4, [4, 5, 6])]);
        let tree = ClassTree::scan(&root).unwrap();
        let dataset = PatternDataset::cache(&tree.samples, 8, 8).unwrap();

        let shuffled = ShuffleBuffer::new(dataset.clone(), 1000, 42);
        assert_eq!(shuffled.len(), dataset.len());
        let labels: Vec<usize> = (0..shuffled.len()).map(|i| shuffled.get(i).unwrap().label).collect();
        assert_eq!(labels.iter().filter(|l| **l == 0).count(), 4);
        assert_eq!(labels.iter().filter(|l| **l == 1).count(), 4);
        assert!(shuffled.get(8).is_none());
    }

    #[test]
    fn test_batches_have_expected_shape() {
        let root = unique_temp_dir("batches");
        write_class_tree(&root, &[("cotton", 40, [10, 20, 30]), ("silk", 30, [200, 100, 0])]);

        let settings = DatasetSettings {
            path: root,
            image_height: 24,
            image_width: 24,
            batch_size: 32,
            ..DatasetSettings::default()
        };
        let loaded = load_dataset(&settings).unwrap();
        assert_eq!(loaded.num_classes(), 2);
        assert_eq!(loaded.total_len(), 70);
        assert_eq!(loaded.valid.len(), 14);

        let device = Default::default();
        let loader = build_loader::<TestBackend, _>(
            loaded.train.clone(),
            loaded.train.batcher(),
            settings.batch_size,
            device,
        );

        let sizes: Vec<usize> = prefetch(loader, 2)
            .map(|batch| {
                let [n, c, h, w] = batch.images.dims();
                assert_eq!([c, h, w], [3, 24, 24]);
                assert_eq!(batch.targets.dims(), [n]);
                n
            })
            .collect();
        assert_eq!(sizes, vec![32, 24]);
    }

    #[test]
    fn test_prefetch_keeps_loader_order() {
        let dataset = indexed_dataset(40);
        let shuffled = ShuffleBuffer::new(dataset.clone(), 8, 3);
        let expected: Vec<i64> = (0..shuffled.len())
            .map(|i| shuffled.get(i).unwrap().label as i64)
            .collect();

        let loader = build_loader::<TestBackend, _>(shuffled, dataset.batcher(), 6, Default::default());

        let direct: Vec<Vec<i64>> = loader.iter().map(|batch| batch_targets(&batch)).collect();
        let prefetched: Vec<Vec<i64>> = prefetch(loader.clone(), 2)
            .map(|batch| batch_targets(&batch))
            .collect();

        assert_eq!(prefetched.len(), 7);
        assert_eq!(prefetched, direct);
        assert_eq!(prefetched.concat(), expected);

        // 先読みなし（ランデブー）でも同じ順序
        let unbuffered: Vec<Vec<i64>> = prefetch(loader, 0)
            .map(|batch| batch_targets(&batch))
            .collect();
        assert_eq!(unbuffered, direct);
    }

    #[test]
    fn test_cache_fails_on_corrupt_image() {
        let root = unique_temp_dir("corrupt");
        write_class_tree(&root, &[("a", 1, [0, 0, 0])]);
        std::fs::write(root.join("a").join("broken.png"), b"not a png").unwrap();

        let tree = ClassTree::scan(&root).unwrap();
        assert!(PatternDataset::cache(&tree.samples, 8, 8).is_err());
    }
}
