// prediction pipeline: cache lookup, inference on misses, shape repair and
// task-specific post-processing.

use std::time::Instant;

use ndarray::{Array2, ArrayD, Axis, Ix2};
use tracing::{debug, warn};

use crate::{
    cache::PredictionValue,
    dataset::{DataFrame, Dataset},
    error::PredictionError,
    keyer::RowKeyer,
    model::{Model, RawOutput},
    ModelType,
};

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResults {
    // class labels, in output column order
    pub labels: Vec<String>,
    // full per-class probability table (n_rows x n_classes)
    pub raw: Array2<f64>,
    // predicted label index per row
    pub label_index: Vec<usize>,
    pub prediction: Vec<String>,
    // probability mass of the predicted label
    pub probabilities: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelPredictionResults {
    Empty,
    Regression { prediction: Vec<f64> },
    TextGeneration { prediction: Vec<String> },
    Classification(ClassificationResults),
}

impl ModelPredictionResults {
    pub fn len(&self) -> usize {
        match self {
            ModelPredictionResults::Empty => 0,
            ModelPredictionResults::Regression { prediction } => prediction.len(),
            ModelPredictionResults::TextGeneration { prediction } => prediction.len(),
            ModelPredictionResults::Classification(c) => c.prediction.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // per-row values in the shape the cache stores them
    pub fn values(&self) -> Vec<PredictionValue> {
        match self {
            ModelPredictionResults::Empty => Vec::new(),
            ModelPredictionResults::Regression { prediction } => {
                prediction.iter().copied().map(PredictionValue::Float).collect()
            }
            ModelPredictionResults::TextGeneration { prediction } => {
                prediction.iter().cloned().map(PredictionValue::Text).collect()
            }
            ModelPredictionResults::Classification(c) => c
                .raw
                .outer_iter()
                .map(|row| PredictionValue::Probabilities(row.to_vec()))
                .collect(),
        }
    }

    pub fn prediction_strings(&self) -> Vec<String> {
        match self {
            ModelPredictionResults::Empty => Vec::new(),
            ModelPredictionResults::Regression { prediction } => {
                prediction.iter().map(f64::to_string).collect()
            }
            ModelPredictionResults::TextGeneration { prediction } => prediction.clone(),
            ModelPredictionResults::Classification(c) => c.prediction.clone(),
        }
    }

    // regression values, or predicted label indices for classifiers
    pub fn raw_prediction(&self) -> Option<Vec<f64>> {
        match self {
            ModelPredictionResults::Regression { prediction } => Some(prediction.clone()),
            ModelPredictionResults::Classification(c) => {
                Some(c.label_index.iter().map(|&i| i as f64).collect())
            }
            ModelPredictionResults::Empty | ModelPredictionResults::TextGeneration { .. } => None,
        }
    }

    pub fn probabilities(&self) -> Option<&[f64]> {
        match self {
            ModelPredictionResults::Classification(c) => Some(&c.probabilities),
            _ => None,
        }
    }

    pub fn all_predictions(&self) -> Option<&Array2<f64>> {
        match self {
            ModelPredictionResults::Classification(c) => Some(&c.raw),
            _ => None,
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

impl Model {
    pub fn predict(&self, dataset: &Dataset) -> Result<ModelPredictionResults, PredictionError> {
        if dataset.is_empty() {
            return Ok(ModelPredictionResults::Empty);
        }
        let started = Instant::now();

        let values = if self.cache_enabled() {
            self.predict_from_cache(dataset)?
        } else {
            let prepared = self.prepare_dataframe(
                &dataset.df,
                &dataset.column_dtypes,
                dataset.target.as_deref(),
            )?;
            self.predict_values(&prepared)?
        };

        let results = self.postprocess(values)?;
        debug!(
            model_id = %self.id(),
            rows = dataset.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "predicted dataset"
        );
        Ok(results)
    }

    // the whole read/compute/write sequence runs under the model's cache lock
    fn predict_from_cache(&self, dataset: &Dataset) -> Result<Vec<PredictionValue>, PredictionError> {
        let keys = RowKeyer::key_frame(&dataset.df);
        let mut cache = self.lock_cache();
        let mut merged = cache.read(&keys);

        let missing: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i)
            .collect();

        let unpredicted = self.prepare_dataframe(
            &dataset.df.take(&missing),
            &dataset.column_dtypes,
            dataset.target.as_deref(),
        )?;

        debug!(
            model_id = %self.id(),
            hits = keys.len() - missing.len(),
            misses = missing.len(),
            "prediction cache lookup"
        );

        if !unpredicted.is_empty() {
            let fresh = self.predict_values(&unpredicted)?;
            let missing_keys: Vec<_> = missing.iter().map(|&i| keys[i].clone()).collect();
            if let Err(err) = cache.write(&missing_keys, fresh.clone()) {
                warn!(model_id = %self.id(), error = %err, "failed to persist predictions");
            }
            for (&pos, value) in missing.iter().zip(fresh) {
                merged[pos] = Some(value);
            }
        }

        let expected = merged.len();
        let values: Vec<PredictionValue> = merged.into_iter().flatten().collect();
        if values.len() != expected {
            return Err(PredictionError::RowCountMismatch {
                actual: values.len(),
                expected,
            });
        }
        Ok(values)
    }

    // raw inference + shape repair, one value per input row
    fn predict_values(&self, batch: &DataFrame) -> Result<Vec<PredictionValue>, PredictionError> {
        let rows = batch.len();
        let raw = self.raw_predict(batch)?;

        let values: Vec<PredictionValue> = match (self.model_type(), raw) {
            (ModelType::TextGeneration, RawOutput::Text(texts)) => {
                texts.into_iter().map(PredictionValue::Text).collect()
            }
            (ModelType::TextGeneration, RawOutput::Numeric(_)) => {
                return Err(PredictionError::OutputKind {
                    actual: "numeric",
                    expected: "text_generation",
                });
            }
            (ModelType::Regression, RawOutput::Numeric(array)) => {
                if array.len() != rows {
                    return Err(PredictionError::OutputShape {
                        shape: array.shape().to_vec(),
                    });
                }
                array.iter().copied().map(PredictionValue::Float).collect()
            }
            (ModelType::Classification, RawOutput::Numeric(array)) => self
                .fix_classification_shape(array)?
                .outer_iter()
                .map(|row| PredictionValue::Probabilities(row.to_vec()))
                .collect(),
            (model_type, RawOutput::Text(_)) => {
                return Err(PredictionError::OutputKind {
                    actual: "text",
                    expected: model_type.as_str(),
                });
            }
        };

        if values.len() != rows {
            return Err(PredictionError::RowCountMismatch {
                actual: values.len(),
                expected: rows,
            });
        }
        Ok(values)
    }

    // coerce classifier output into (n_rows, n_classes)
    pub fn fix_classification_shape(&self, array: ArrayD<f64>) -> Result<Array2<f64>, PredictionError> {
        let mut array = array;

        if array.ndim() <= 1 {
            let n = array.len();
            array = array
                .into_shape(vec![n, 1])
                .map_err(|_| PredictionError::OutputShape { shape: vec![n] })?;
        }

        if array.ndim() > 2 {
            let shape = array.shape().to_vec();
            if Model::warn_once(&self.reshape_warned) {
                warn!(
                    ?shape,
                    "model output is not (n_entries, n_classes); squeezing extra dimensions, please check the results"
                );
            }
            // squeeze singleton axes between the batch axis and the class axis
            for axis in (1..array.ndim() - 1).rev() {
                if array.shape()[axis] == 1 {
                    array = array.remove_axis(Axis(axis));
                }
            }
            if array.ndim() > 2 {
                return Err(PredictionError::OutputShape {
                    shape: array.shape().to_vec(),
                });
            }
        }

        let mut table = array
            .into_dimensionality::<Ix2>()
            .map_err(|_| PredictionError::OutputShape { shape: Vec::new() })?;

        if self.is_binary_classification() && table.ncols() == 1 {
            if Model::warn_once(&self.binary_warned) {
                warn!("binary classifier returned one column; treating it as the probability of the second label");
            }
            let positive = table.column(0).to_owned();
            let mut both = Array2::<f64>::zeros((table.nrows(), 2));
            for (i, p) in positive.iter().enumerate() {
                both[[i, 0]] = 1.0 - p;
                both[[i, 1]] = *p;
            }
            table = both;
        }

        let expected = self.labels().len();
        if table.ncols() != expected {
            return Err(PredictionError::ClassCountMismatch {
                actual: table.ncols(),
                expected,
            });
        }
        Ok(table)
    }

    fn postprocess(&self, values: Vec<PredictionValue>) -> Result<ModelPredictionResults, PredictionError> {
        match self.model_type() {
            ModelType::Regression => Ok(ModelPredictionResults::Regression {
                prediction: values
                    .into_iter()
                    .map(|v| match v {
                        PredictionValue::Float(f) => Ok(f),
                        _ => Err(PredictionError::OutputKind {
                            actual: "non-float",
                            expected: "regression",
                        }),
                    })
                    .collect::<Result<_, _>>()?,
            }),
            ModelType::TextGeneration => Ok(ModelPredictionResults::TextGeneration {
                prediction: values
                    .into_iter()
                    .map(|v| match v {
                        PredictionValue::Text(t) => Ok(t),
                        _ => Err(PredictionError::OutputKind {
                            actual: "non-text",
                            expected: "text_generation",
                        }),
                    })
                    .collect::<Result<_, _>>()?,
            }),
            ModelType::Classification => self.classify(values).map(ModelPredictionResults::Classification),
        }
    }

    fn classify(&self, values: Vec<PredictionValue>) -> Result<ClassificationResults, PredictionError> {
        let labels = self.labels().to_vec();
        let n_classes = labels.len();

        let mut raw = Array2::<f64>::zeros((values.len(), n_classes));
        for (i, value) in values.into_iter().enumerate() {
            let PredictionValue::Probabilities(row) = value else {
                return Err(PredictionError::OutputKind {
                    actual: "non-probability",
                    expected: "classification",
                });
            };
            if row.len() != n_classes {
                return Err(PredictionError::ClassCountMismatch {
                    actual: row.len(),
                    expected: n_classes,
                });
            }
            for (j, p) in row.into_iter().enumerate() {
                raw[[i, j]] = p;
            }
        }

        let threshold = self.meta().classification_threshold;
        let label_index: Vec<usize> = raw
            .outer_iter()
            .map(|row| match threshold {
                Some(t) if n_classes == 2 => usize::from(row[1] > t),
                _ => argmax(&row.to_vec()),
            })
            .collect();

        let prediction = label_index.iter().map(|&i| labels[i].clone()).collect();
        let probabilities = label_index
            .iter()
            .enumerate()
            .map(|(row, &col)| raw[[row, col]])
            .collect();

        Ok(ClassificationResults {
            labels,
            raw,
            label_index,
            prediction,
            probabilities,
        })
    }
}

// first index of the maximum; NaN never wins
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] || values[best].is_nan() {
            best = i;
        }
    }
    best
}
