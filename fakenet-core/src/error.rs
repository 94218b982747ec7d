use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read annotations {}: {source}", path.display())]
    Annotations {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    /// A row without an image name and a label
    #[error("{}:{row}: {reason}", path.display())]
    MalformedRow {
        path: PathBuf,
        row: usize,
        reason: String,
    },
    #[error("{}:{row}: label {label} is outside 0..{num_classes}", path.display())]
    InvalidLabel {
        path: PathBuf,
        row: usize,
        label: i64,
        num_classes: usize,
    },
    #[error("{}:{row}: image {} does not exist", path.display(), image.display())]
    MissingImage {
        path: PathBuf,
        row: usize,
        image: PathBuf,
    },
    #[error("the {split} set {} contains no samples", path.display())]
    EmptySplit { split: &'static str, path: PathBuf },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to render {}: {reason}", path.display())]
    Plot { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
