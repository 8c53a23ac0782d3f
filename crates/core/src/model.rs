// wrapped models: metadata, the raw inference seam and dataframe preparation.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{
    cache::PredictionCache,
    dataset::{Cell, DataFrame},
    error::{ModelError, PredictionError},
    ModelId, ModelType,
};

pub const MODEL_META_FILE: &str = "model-meta.json";

fn default_threshold() -> Option<f64> {
    Some(0.5)
}

// what the worker knows about a model without loading its weights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMeta {
    pub name: String,
    pub model_type: ModelType,
    #[serde(default)]
    pub feature_names: Option<Vec<String>>,
    #[serde(default)]
    pub classification_labels: Vec<String>,
    // only used by binary classifiers; `None` means arg-max
    #[serde(default = "default_threshold")]
    pub classification_threshold: Option<f64>,
    // name of the loader able to rebuild the raw model from its directory
    #[serde(default)]
    pub loader: Option<String>,
}

impl ModelMeta {
    pub fn new(name: impl Into<String>, model_type: ModelType) -> Self {
        Self {
            name: name.into(),
            model_type,
            feature_names: None,
            classification_labels: Vec::new(),
            classification_threshold: default_threshold(),
            loader: None,
        }
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.classification_labels = labels;
        self
    }

    pub fn with_threshold(mut self, threshold: Option<f64>) -> Self {
        self.classification_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), PredictionError> {
        let unique: HashSet<&String> = self.classification_labels.iter().collect();
        if unique.len() != self.classification_labels.len() {
            return Err(PredictionError::InvalidMeta(
                "Duplicates are found in 'classification_labels', please only provide unique values."
                    .to_string(),
            ));
        }
        if self.model_type == ModelType::Classification && self.classification_labels.is_empty() {
            return Err(PredictionError::InvalidMeta(
                "The parameter 'classification_labels' is required if 'model_type' is 'classification'."
                    .to_string(),
            ));
        }
        Ok(())
    }
}

// raw model output before shape repair
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Numeric(ArrayD<f64>),
    Text(Vec<String>),
}

// the wrapped model's inference call, fed a prepared batch
pub trait RawModel: Send + Sync {
    fn predict_raw(&self, batch: &DataFrame) -> Result<RawOutput, ModelError>;
}

impl<F> RawModel for F
where
    F: Fn(&DataFrame) -> Result<RawOutput, ModelError> + Send + Sync,
{
    fn predict_raw(&self, batch: &DataFrame) -> Result<RawOutput, ModelError> {
        self(batch)
    }
}

pub struct Model {
    id: ModelId,
    meta: ModelMeta,
    inner: Box<dyn RawModel>,
    cache: Mutex<PredictionCache>,
    cache_enabled: bool,
    pub(crate) reshape_warned: AtomicBool,
    pub(crate) binary_warned: AtomicBool,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("cache_enabled", &self.cache_enabled)
            .finish_non_exhaustive()
    }
}

impl Model {
    // `cache_dir = None` keeps predictions in memory only
    pub fn new(
        id: ModelId,
        meta: ModelMeta,
        inner: Box<dyn RawModel>,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self, PredictionError> {
        meta.validate()?;
        let mut cache = PredictionCache::new(id, meta.model_type, cache_dir);
        if meta.model_type == ModelType::Classification {
            cache = cache.with_class_count(meta.classification_labels.len());
        }
        Ok(Self {
            id,
            meta,
            inner,
            cache: Mutex::new(cache),
            cache_enabled: true,
            reshape_warned: AtomicBool::new(false),
            binary_warned: AtomicBool::new(false),
        })
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn model_type(&self) -> ModelType {
        self.meta.model_type
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn is_classification(&self) -> bool {
        self.meta.model_type == ModelType::Classification
    }

    pub fn is_binary_classification(&self) -> bool {
        self.is_classification() && self.meta.classification_labels.len() == 2
    }

    pub fn is_regression(&self) -> bool {
        self.meta.model_type == ModelType::Regression
    }

    pub fn is_text_generation(&self) -> bool {
        self.meta.model_type == ModelType::TextGeneration
    }

    pub fn labels(&self) -> &[String] {
        &self.meta.classification_labels
    }

    // the cache entries are idempotent, so a poisoned lock is still usable
    pub fn lock_cache(&self) -> MutexGuard<'_, PredictionCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn raw_predict(&self, batch: &DataFrame) -> Result<RawOutput, ModelError> {
        self.inner.predict_raw(batch)
    }

    pub(crate) fn warn_once(flag: &AtomicBool) -> bool {
        !flag.swap(true, Ordering::Relaxed)
    }

    // shape a frame into what the wrapped model expects
    pub fn prepare_dataframe(
        &self,
        df: &DataFrame,
        column_dtypes: &BTreeMap<String, String>,
        target: Option<&str>,
    ) -> Result<DataFrame, PredictionError> {
        let mut df = df.clone();
        let mut dtypes = column_dtypes.clone();

        for name in dtypes.keys() {
            if !df.contains(name) {
                df.add_column(name.clone(), Cell::Missing);
            }
        }

        let mut features = self.meta.feature_names.clone();
        if let Some(target) = target {
            df.drop_column(target);
            dtypes.remove(target);
            if let Some(names) = features.as_mut() {
                names.retain(|n| n != target);
            }
        }

        if let Some(features) = features {
            let present: BTreeSet<&str> = df.columns().iter().map(String::as_str).collect();
            let missing: Vec<String> = features
                .iter()
                .filter(|f| !present.contains(f.as_str()))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if !missing.is_empty() {
                return Err(PredictionError::MissingFeatures(missing));
            }
            df = df.select(&features)?;
            dtypes.retain(|k, _| features.contains(k));
        }

        Ok(df.cast(&dtypes)?)
    }
}
