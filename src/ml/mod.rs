pub mod backend;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use dataset::{load_dataset, LoadedDataset, PatternBatch, PatternBatcher, PatternDataset};
pub use inference::{predict_image, Prediction, TrainedModel};
pub use ml_model::{ModelConfig, PatternClassifier};
pub use training::{fit, train_model, EpochMetrics, FitOutput, TrainingHistory, TrainingOutcome};
