//! 学習履歴のレポート出力
//!
//! エポックごとの精度をCSV・JSON・PNG（精度曲線）に書き出します。

use ab_glyph::{FontRef, PxScale};
use anyhow::{Context, Result};
use image::imageops::{overlay, rotate270};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
    draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::TrainingHistory;
use crate::model::ReportSettings;

/// 学習履歴の出力先
pub trait ReportSink {
    fn report(&self, history: &TrainingHistory) -> Result<()>;
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("出力ディレクトリを作成できません: {}", parent.display()))?;
        }
    }
    Ok(())
}

/// エポックごとの指標をCSVで出力
pub struct CsvReport {
    pub path: PathBuf,
}

impl ReportSink for CsvReport {
    fn report(&self, history: &TrainingHistory) -> Result<()> {
        ensure_parent(&self.path)?;
        let mut writer = csv::Writer::from_path(&self.path)
            .with_context(|| format!("CSVファイルを作成できません: {}", self.path.display()))?;

        writer.write_record([
            "epoch",
            "train_accuracy",
            "train_loss",
            "val_accuracy",
            "val_loss",
        ])?;
        for metrics in &history.epochs {
            writer.write_record([
                metrics.epoch.to_string(),
                format!("{:.6}", metrics.train_accuracy),
                format!("{:.6}", metrics.train_loss),
                metrics.val_accuracy.map(|v| format!("{:.6}", v)).unwrap_or_default(),
                metrics.val_loss.map(|v| format!("{:.6}", v)).unwrap_or_default(),
            ])?;
        }
        writer.flush()?;

        tracing::info!("学習履歴CSVを保存しました: {}", self.path.display());
        Ok(())
    }
}

/// 学習履歴をJSONで出力
pub struct JsonReport {
    pub path: PathBuf,
}

impl ReportSink for JsonReport {
    fn report(&self, history: &TrainingHistory) -> Result<()> {
        ensure_parent(&self.path)?;
        let json = serde_json::to_string_pretty(history)?;
        fs::write(&self.path, json)
            .with_context(|| format!("JSONファイルを書き込めません: {}", self.path.display()))?;

        tracing::info!("学習履歴JSONを保存しました: {}", self.path.display());
        Ok(())
    }
}

/// 凡例・軸ラベル用フォント（DejaVu Sans）
const CHART_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

const CHART_WIDTH: u32 = 800;
const CHART_HEIGHT: u32 = 560;

const CHART_TITLE: &str = "Training vs Validation Accuracy";
const X_LABEL: &str = "Epoch";
const Y_LABEL: &str = "Accuracy";
const TRAIN_LABEL: &str = "Training Accuracy";
const VAL_LABEL: &str = "Validation Accuracy";

const TITLE_SCALE: f32 = 22.0;
const LABEL_SCALE: f32 = 16.0;
const TICK_SCALE: f32 = 13.0;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT: Rgb<u8> = Rgb([20, 20, 20]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
const TRAIN_COLOR: Rgb<u8> = Rgb([31, 119, 180]);
const VAL_COLOR: Rgb<u8> = Rgb([255, 127, 14]);

/// 凡例の1行の高さ
const LEGEND_ROW: i32 = 22;
/// 凡例の線サンプルの長さ
const LEGEND_SWATCH: i32 = 28;

fn chart_font() -> Result<FontRef<'static>> {
    FontRef::try_from_slice(CHART_FONT)
        .map_err(|e| anyhow::anyhow!("グラフ用フォントの読み込みに失敗しました: {}", e))
}

/// 精度曲線（学習・検証）をPNGで出力
///
/// 横軸はエポック、縦軸は精度 [0, 1] 固定。凡例は右下。
pub struct ChartReport {
    pub path: PathBuf,
}

impl ChartReport {
    /// 精度曲線を描画
    pub fn render(history: &TrainingHistory) -> Result<RgbImage> {
        let font = chart_font()?;
        let mut canvas = RgbImage::from_pixel(CHART_WIDTH, CHART_HEIGHT, BACKGROUND);
        let plot = PlotArea::new(history.len());

        // タイトル
        let title_scale = PxScale::from(TITLE_SCALE);
        let (title_width, _) = text_size(title_scale, &font, CHART_TITLE);
        draw_text_mut(
            &mut canvas,
            TEXT,
            (CHART_WIDTH as i32 - title_width as i32) / 2,
            14,
            title_scale,
            &font,
            CHART_TITLE,
        );

        // 0.1刻みのグリッドと縦軸の目盛り
        let tick_scale = PxScale::from(TICK_SCALE);
        for step in 0..=10 {
            let accuracy = step as f64 / 10.0;
            let y = plot.y(accuracy);
            draw_line_segment_mut(&mut canvas, (plot.left, y), (plot.right, y), GRID);

            let label = format!("{:.1}", accuracy);
            let (w, h) = text_size(tick_scale, &font, &label);
            draw_text_mut(
                &mut canvas,
                TEXT,
                plot.left as i32 - 8 - w as i32,
                y as i32 - h as i32 / 2 - 2,
                tick_scale,
                &font,
                &label,
            );
        }
        draw_line_segment_mut(&mut canvas, (plot.left, plot.top), (plot.left, plot.bottom), AXIS);
        draw_line_segment_mut(&mut canvas, (plot.left, plot.bottom), (plot.right, plot.bottom), AXIS);

        // エポックの目盛り（多い場合は間引く）
        let label_every = history.len().div_ceil(20).max(1);
        for index in 0..history.len() {
            let x = plot.x(index);
            draw_line_segment_mut(&mut canvas, (x, plot.bottom), (x, plot.bottom + 5.0), AXIS);
            if index % label_every == 0 {
                let label = (index + 1).to_string();
                let (w, _) = text_size(tick_scale, &font, &label);
                draw_text_mut(
                    &mut canvas,
                    TEXT,
                    x as i32 - w as i32 / 2,
                    plot.bottom as i32 + 8,
                    tick_scale,
                    &font,
                    &label,
                );
            }
        }

        // 軸ラベル
        let label_scale = PxScale::from(LABEL_SCALE);
        let (w, _) = text_size(label_scale, &font, X_LABEL);
        draw_text_mut(
            &mut canvas,
            TEXT,
            ((plot.left + plot.right) / 2.0) as i32 - w as i32 / 2,
            plot.bottom as i32 + 30,
            label_scale,
            &font,
            X_LABEL,
        );
        let y_label = vertical_label(&font, label_scale, Y_LABEL);
        overlay(
            &mut canvas,
            &y_label,
            14,
            ((plot.top + plot.bottom) / 2.0) as i64 - y_label.height() as i64 / 2,
        );

        let train: Vec<(f32, f32)> = history
            .epochs
            .iter()
            .enumerate()
            .map(|(i, e)| (plot.x(i), plot.y(e.train_accuracy)))
            .collect();
        let val: Vec<(f32, f32)> = history
            .epochs
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.val_accuracy.map(|v| (plot.x(i), plot.y(v))))
            .collect();

        draw_series(&mut canvas, &train, TRAIN_COLOR);
        draw_series(&mut canvas, &val, VAL_COLOR);

        // 凡例
        let mut entries = vec![(TRAIN_LABEL, TRAIN_COLOR)];
        if !val.is_empty() {
            entries.push((VAL_LABEL, VAL_COLOR));
        }
        draw_legend(&mut canvas, &font, &plot, &entries);

        Ok(canvas)
    }
}

impl ReportSink for ChartReport {
    fn report(&self, history: &TrainingHistory) -> Result<()> {
        ensure_parent(&self.path)?;
        Self::render(history)?
            .save(&self.path)
            .with_context(|| format!("グラフを保存できません: {}", self.path.display()))?;

        tracing::info!("精度グラフを保存しました: {}", self.path.display());
        Ok(())
    }
}

struct PlotArea {
    left: f32,
    right: f32,
    top: f32,
    bottom: f32,
    epochs: usize,
}

impl PlotArea {
    fn new(epochs: usize) -> Self {
        Self {
            left: 80.0,
            right: CHART_WIDTH as f32 - 30.0,
            top: 56.0,
            bottom: CHART_HEIGHT as f32 - 64.0,
            epochs,
        }
    }

    fn x(&self, epoch: usize) -> f32 {
        if self.epochs <= 1 {
            return self.left;
        }
        let ratio = epoch as f32 / (self.epochs - 1) as f32;
        (self.left + ratio * (self.right - self.left)).round()
    }

    fn y(&self, accuracy: f64) -> f32 {
        let clamped = accuracy.clamp(0.0, 1.0) as f32;
        (self.bottom - clamped * (self.bottom - self.top)).round()
    }

    /// 凡例の左上
    fn legend_origin(&self, rows: usize) -> (i32, i32) {
        (
            self.right as i32 - 200,
            self.bottom as i32 - 16 - rows as i32 * LEGEND_ROW,
        )
    }
}

/// 90度回転した縦書きラベル
fn vertical_label(font: &FontRef<'_>, scale: PxScale, text: &str) -> RgbImage {
    let (w, h) = text_size(scale, font, text);
    let mut label = RgbImage::from_pixel(w + 4, h + 6, BACKGROUND);
    draw_text_mut(&mut label, TEXT, 2, 0, scale, font, text);
    rotate270(&label)
}

/// 折れ線（太さ2px）と各点のマーカー
fn draw_series(canvas: &mut RgbImage, points: &[(f32, f32)], color: Rgb<u8>) {
    for pair in points.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        draw_line_segment_mut(canvas, (x0, y0), (x1, y1), color);
        draw_line_segment_mut(canvas, (x0, y0 + 1.0), (x1, y1 + 1.0), color);
    }
    for &(x, y) in points {
        draw_filled_circle_mut(canvas, (x as i32, y as i32), 3, color);
    }
}

fn draw_legend(
    canvas: &mut RgbImage,
    font: &FontRef<'_>,
    plot: &PlotArea,
    entries: &[(&str, Rgb<u8>)],
) {
    let (x, y) = plot.legend_origin(entries.len());
    let frame = Rect::at(x, y).of_size(188, (entries.len() as i32 * LEGEND_ROW + 8) as u32);
    draw_filled_rect_mut(canvas, frame, BACKGROUND);
    draw_hollow_rect_mut(canvas, frame, GRID);

    let scale = PxScale::from(TICK_SCALE);
    for (row, (label, color)) in entries.iter().enumerate() {
        let center = (y + 4 + row as i32 * LEGEND_ROW + LEGEND_ROW / 2) as f32;
        let start = (x + 8) as f32;
        draw_line_segment_mut(canvas, (start, center), (start + LEGEND_SWATCH as f32, center), *color);
        draw_line_segment_mut(
            canvas,
            (start, center + 1.0),
            (start + LEGEND_SWATCH as f32, center + 1.0),
            *color,
        );
        draw_text_mut(
            canvas,
            TEXT,
            x + 16 + LEGEND_SWATCH,
            center as i32 - 9,
            scale,
            font,
            label,
        );
    }
}

/// 設定から出力先を組み立てる
pub fn reporters_from_settings(settings: &ReportSettings) -> Vec<Box<dyn ReportSink>> {
    let mut reporters: Vec<Box<dyn ReportSink>> = Vec::new();
    if let Some(path) = &settings.chart_path {
        reporters.push(Box::new(ChartReport { path: path.clone() }));
    }
    if let Some(path) = &settings.csv_path {
        reporters.push(Box::new(CsvReport { path: path.clone() }));
    }
    if let Some(path) = &settings.json_path {
        reporters.push(Box::new(JsonReport { path: path.clone() }));
    }
    reporters
}

/// 学習履歴をログに出し、すべての出力先に書き出す
pub fn run_reports(history: &TrainingHistory, reporters: &[Box<dyn ReportSink>]) -> Result<()> {
    if let Some(last) = history.epochs.last() {
        match last.val_accuracy {
            Some(val) => tracing::info!(
                "最終精度 - Training Accuracy: {:.4}, Validation Accuracy: {:.4}",
                last.train_accuracy,
                val
            ),
            None => tracing::info!("最終精度 - Training Accuracy: {:.4}", last.train_accuracy),
        }
    }

    for reporter in reporters {
        reporter.report(history)?;
    }
    Ok(())
}
