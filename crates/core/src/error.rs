// error types for the prediction cache, pipeline and wire layer.

use thiserror::Error;

// errors raised while building or reshaping datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Row {row} has {actual} cells, expected {expected}")]
    RowWidth {
        row: usize,
        actual: usize,
        expected: usize,
    },

    #[error("Column not found: {0}")]
    UnknownColumn(String),

    #[error("Cannot cast value '{value}' of column '{column}' to {dtype}")]
    Cast {
        column: String,
        value: String,
        dtype: String,
    },

    #[error("Invalid dataset metadata: {0}")]
    Meta(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// errors from the prediction cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Got {keys} keys but {values} values")]
    LengthMismatch { keys: usize, values: usize },

    #[error("Corrupt cache record {line}: {reason}")]
    CorruptRecord { line: u64, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// errors raised by a wrapped model's raw inference call
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Model load error: {0}")]
    Load(String),
}

// configuration errors surfaced by the prediction pipeline; fatal to the request only
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("The following columns are not found in the dataset: {}", .0.join(", "))]
    MissingFeatures(Vec<String>),

    #[error("The output of your model has shape {shape:?}, but we expect it to be (n_entries, n_classes)")]
    OutputShape { shape: Vec<usize> },

    #[error(
        "The output of your model has {actual} columns, but the model declares {expected} classification labels"
    )]
    ClassCountMismatch { actual: usize, expected: usize },

    #[error("The model returned {actual} predictions for {expected} rows")]
    RowCountMismatch { actual: usize, expected: usize },

    #[error("Prediction task is not supported: {0}")]
    UnsupportedModelType(String),

    #[error("Model returned {actual} output for a {expected} model")]
    OutputKind {
        actual: &'static str,
        expected: &'static str,
    },

    #[error("Invalid model metadata: {0}")]
    InvalidMeta(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

// decoding errors for request envelopes
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid parameters for '{action}': {reason}")]
    InvalidParam { action: String, reason: String },
}

// validation errors for decoded requests
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Row limit exceeded: {actual} rows > {limit} max")]
    RowLimitExceeded { actual: usize, limit: usize },

    #[error("Invalid parameter '{field}': {reason}")]
    InvalidParameter { field: String, reason: String },

    #[error("Duplicate argument: {0}")]
    DuplicateArgument(String),
}
