#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
mod cli;
mod data;
mod error;
mod metrics;
mod model;
mod plot;
pub mod resnet;
mod train;
pub mod transform;

#[cfg(any(feature = "tch", feature = "candle", feature = "ndarray"))]
pub use cli::run;
pub use data::{read_annotations, Annotation, FakedditBatch, FakedditBatcher, FakedditDataset, Sample};
pub use error::{Error, Result};
pub use metrics::{AccuracyDenominator, BatchOutcome, MetricSeries, Tally};
pub use model::{Model, ModelConfig, ResNetType};
pub use plot::render as render_charts;
pub use train::{
    evaluate, fit, sgd, train, EpochSummary, Evaluation, Fitted, LoopSettings, TrainingConfig,
    TrainingReport,
};
