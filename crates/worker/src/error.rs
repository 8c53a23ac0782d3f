// error types for the worker.

use std::path::PathBuf;

use mlworker_core::{
    DatasetError, DecodeError, ErrorDetail, ModelError, PredictionError, ValidationError,
};
use thiserror::Error;
use uuid::Uuid;

use crate::artifacts::ArtifactKind;

// top-level worker errors (startup and shutdown, never sent to callers)
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}' ({reason})")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Cannot determine the worker home directory, set MLWORKER_HOME")]
    MissingHome,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Invalid project key '{0}'")]
    InvalidProjectKey(String),

    #[error("{kind} {id} not found in project '{project_key}'")]
    NotFound {
        kind: ArtifactKind,
        project_key: String,
        id: Uuid,
    },

    #[error("Failed to fetch {kind} {id}: {reason}")]
    Fetch {
        kind: ArtifactKind,
        id: Uuid,
        reason: String,
    },

    #[error("No model loader registered under '{0}'")]
    UnknownLoader(String),

    #[error("Invalid artifact metadata in {path}: {reason}")]
    Meta { path: PathBuf, reason: String },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// errors raised while resolving arguments for, or running, catalog functions
#[derive(Debug, Error)]
pub enum TestError {
    #[error("Unknown {kind} function {id}")]
    UnknownFunction { kind: &'static str, id: Uuid },

    #[error("Missing argument '{name}' for {function}")]
    MissingArgument { function: String, name: String },

    #[error("Argument '{name}' of {function} expects a {expected}")]
    ArgumentType {
        function: String,
        name: String,
        expected: &'static str,
    },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Push kind INVALID cannot be requested")]
    InvalidKind,

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

// request-level failures; always turned into an error reply
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Payload too large: {size} bytes > {limit} max")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Test(#[from] TestError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RequestError {
    // returns the error class for the reply envelope
    pub fn error_type(&self) -> &'static str {
        match self {
            RequestError::Decode(_)
            | RequestError::Validation(_)
            | RequestError::Test(_)
            | RequestError::Artifact(ArtifactError::InvalidProjectKey(_))
            | RequestError::Push(PushError::InvalidKind) => "configuration_error",
            RequestError::Prediction(e) | RequestError::Push(PushError::Prediction(e)) => {
                prediction_error_type(e)
            }
            RequestError::Dataset(e) | RequestError::Push(PushError::Dataset(e)) => dataset_error_type(e),
            RequestError::Unauthorized(_) => "auth_error",
            RequestError::PayloadTooLarge { .. } | RequestError::Artifact(_) => "resource_error",
            RequestError::Internal(_) => "internal_error",
        }
    }

    // returns the error code for the reply envelope
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::Decode(DecodeError::InvalidJson(_)) => "invalid_json",
            RequestError::Decode(DecodeError::UnknownAction(_)) => "unknown_action",
            RequestError::Decode(DecodeError::InvalidParam { .. }) => "invalid_param",
            RequestError::Validation(_) => "validation_failed",
            RequestError::Unauthorized(_) => "unauthorized",
            RequestError::PayloadTooLarge { .. } => "payload_too_large",
            RequestError::Artifact(ArtifactError::InvalidProjectKey(_)) => "invalid_project_key",
            RequestError::Artifact(ArtifactError::NotFound { .. }) => "artifact_not_found",
            RequestError::Artifact(_) => "artifact_unavailable",
            RequestError::Prediction(PredictionError::MissingFeatures(_)) => "missing_features",
            RequestError::Prediction(_) => "prediction_failed",
            RequestError::Dataset(_) => "dataset_error",
            RequestError::Test(_) => "test_failed",
            RequestError::Push(_) => "push_failed",
            RequestError::Internal(_) => "internal",
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.to_string(), self.error_type(), self.code())
    }
}

fn prediction_error_type(err: &PredictionError) -> &'static str {
    match err {
        PredictionError::Model(_) => "internal_error",
        PredictionError::Dataset(e) => dataset_error_type(e),
        _ => "configuration_error",
    }
}

fn dataset_error_type(err: &DatasetError) -> &'static str {
    match err {
        DatasetError::Io(_) | DatasetError::Csv(_) => "resource_error",
        _ => "configuration_error",
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed STOMP frame: {0}")]
    Stomp(String),

    #[error("Control channel refused the connection: {0}")]
    Refused(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Bridge handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
