// core types for the ml worker: row keying, the prediction cache, the
// prediction pipeline and the wire messages.

pub mod cache;
pub mod dataset;
pub mod error;
pub mod keyer;
pub mod messages;
pub mod model;
pub mod pipeline;
pub mod types;
pub mod validator;

// commonly used types
pub use error::{
    CacheError, DatasetError, DecodeError, ModelError, PredictionError, ValidationError,
};
pub use types::{
    is_valid_project_key, ArtifactRef, CacheKey, ColumnType, DatasetId, ModelId, ModelType,
    RequestId,
};

// prediction path
pub use cache::{PredictionCache, PredictionValue};
pub use dataset::{Cell, DataFrame, Dataset, DatasetMeta};
pub use keyer::RowKeyer;
pub use model::{Model, ModelMeta, RawModel, RawOutput};
pub use pipeline::{ClassificationResults, ModelPredictionResults};

// messages
pub use messages::{
    ActionKind, ErrorDetail, ReplyEnvelope, RequestEnvelope, WorkerReply, WorkerRequest,
    PROTOCOL_VERSION,
};
pub use validator::{RequestValidator, Validated, ValidatorConfig};
