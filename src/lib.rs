// Burnのジェネリクスが深くなるため
#![recursion_limit = "256"]

// 画像分類（データセット・モデル・学習・推論）
pub mod ml;
// 設定とモデル成果物
pub mod model;
pub mod report;
