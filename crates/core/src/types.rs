// identifiers and small enums shared by the cache, the pipeline and the worker.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// models own exactly one prediction cache, keyed by this id
pub type ModelId = Uuid;
pub type DatasetId = Uuid;
// correlation id chosen by the caller, echoed back on the reply
pub type RequestId = String;

// content digest of one dataset row (hex sha-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// task type of a wrapped model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Classification,
    Regression,
    TextGeneration,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Classification => "classification",
            ModelType::Regression => "regression",
            ModelType::TextGeneration => "text_generation",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(ModelType::Classification),
            "regression" => Ok(ModelType::Regression),
            "text_generation" => Ok(ModelType::TextGeneration),
            other => Err(format!(
                "Invalid model type value \"{other}\". Available values are: classification, regression, text_generation"
            )),
        }
    }
}

// semantic type of a dataset column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Numeric,
    Category,
    Text,
}

// reference to a model, dataset or function artifact within a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub project_key: String,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<bool>,
}

impl ArtifactRef {
    pub fn new(project_key: impl Into<String>, id: Uuid) -> Self {
        Self {
            project_key: project_key.into(),
            id,
            sample: None,
        }
    }

    // memoization key; `sample` does not change the artifact's content
    pub fn key(&self) -> (String, Uuid) {
        (self.project_key.clone(), self.id)
    }
}

// a project key names one directory under the projects root
pub fn is_valid_project_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(|c: char| matches!(c, '/' | '\\' | ':' | '\0'))
}
