pub mod ml_model;
pub mod dataset;
pub mod callbacks;
pub mod evaluation;
pub mod training;
pub mod inference;
pub mod backend;

pub use ml_model::{RoiClassifier, ModelConfig, NUM_CHANNELS, feature_map_size, preprocess_image, load_and_normalize_image_with_size};
pub use dataset::{RoiDataset, ImageBatcher, ImageBatch, ImageItem, discover_classes};
pub use evaluation::{ConfusionMatrix, ClassReport};
pub use training::{train_model, EpochRecord, TrainingReport};
pub use inference::{InferenceEngine, ImageClassifier, Prediction, SharedEngine};
pub use backend::{train_with_config, load_classifier};
