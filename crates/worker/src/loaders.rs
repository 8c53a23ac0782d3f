// model loaders: rebuild a raw model from the files in its artifact directory.

use std::{fs, path::Path};

use mlworker_core::{
    model::{ModelMeta, RawModel, RawOutput},
    DataFrame, ModelError,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

pub const LINEAR_LOADER: &str = "linear";
pub const LINEAR_MODEL_FILE: &str = "model.json";

pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, dir: &Path, meta: &ModelMeta) -> Result<Box<dyn RawModel>, ArtifactError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    Identity,
    Sigmoid,
    Softmax,
}

// one output per weight row: link(w . x + b)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    #[serde(default = "default_link")]
    pub link: Link,
}

fn default_link() -> Link {
    Link::Identity
}

impl LinearModel {
    fn check(&self) -> Result<(), ModelError> {
        if self.weights.is_empty() {
            return Err(ModelError::Load("linear model has no outputs".to_string()));
        }
        if self.bias.len() != self.weights.len() {
            return Err(ModelError::Load(format!(
                "linear model has {} weight rows but {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        let width = self.weights[0].len();
        if self.weights.iter().any(|w| w.len() != width) {
            return Err(ModelError::Load("linear model weight rows differ in length".to_string()));
        }
        Ok(())
    }
}

impl RawModel for LinearModel {
    fn predict_raw(&self, batch: &DataFrame) -> Result<RawOutput, ModelError> {
        let inputs = self.weights.first().map_or(0, Vec::len);
        if batch.columns().len() != inputs {
            return Err(ModelError::InferenceFailed(format!(
                "expected {inputs} features, got {}",
                batch.columns().len()
            )));
        }

        let mut out = Array2::<f64>::zeros((batch.len(), self.weights.len()));
        for (i, row) in batch.rows().iter().enumerate() {
            let x = row
                .iter()
                .zip(batch.columns())
                .map(|(cell, column)| {
                    if cell.is_missing() {
                        return Ok(0.0);
                    }
                    cell.as_f64().ok_or_else(|| {
                        ModelError::InferenceFailed(format!("column '{column}' is not numeric"))
                    })
                })
                .collect::<Result<Vec<f64>, _>>()?;

            for (k, (w, b)) in self.weights.iter().zip(&self.bias).enumerate() {
                out[[i, k]] = w.iter().zip(&x).map(|(w, x)| w * x).sum::<f64>() + b;
            }

            match self.link {
                Link::Identity => {}
                Link::Sigmoid => out.row_mut(i).mapv_inplace(|z| 1.0 / (1.0 + (-z).exp())),
                Link::Softmax => {
                    let max = out.row(i).fold(f64::NEG_INFINITY, |m, v| m.max(*v));
                    out.row_mut(i).mapv_inplace(|z| (z - max).exp());
                    let total = out.row(i).sum();
                    out.row_mut(i).mapv_inplace(|z| z / total);
                }
            }
        }
        Ok(RawOutput::Numeric(out.into_dyn()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LinearLoader;

impl ModelLoader for LinearLoader {
    fn name(&self) -> &'static str {
        LINEAR_LOADER
    }

    fn load(&self, dir: &Path, _meta: &ModelMeta) -> Result<Box<dyn RawModel>, ArtifactError> {
        let path = dir.join(LINEAR_MODEL_FILE);
        let raw = fs::read_to_string(&path)?;
        let model: LinearModel = serde_json::from_str(&raw).map_err(|e| ArtifactError::Meta {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        model.check()?;
        Ok(Box::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlworker_core::{Cell, ModelType};

    fn frame(rows: &[[f64; 2]]) -> DataFrame {
        DataFrame::from_rows(
            vec!["a".into(), "b".into()],
            rows.iter()
                .map(|r| vec![Cell::Float(r[0]), Cell::Float(r[1])])
                .collect(),
        )
        .expect("frame")
    }

    fn numeric(output: RawOutput) -> Array2<f64> {
        match output {
            RawOutput::Numeric(a) => a.into_dimensionality().expect("2d"),
            RawOutput::Text(_) => panic!("expected numeric output"),
        }
    }

    #[test]
    fn identity_link_is_affine() {
        let model = LinearModel {
            weights: vec![vec![2.0, -1.0]],
            bias: vec![0.5],
            link: Link::Identity,
        };
        let out = numeric(model.predict_raw(&frame(&[[1.0, 1.0], [3.0, 0.0]])).expect("predict"));
        assert_eq!(out.column(0).to_vec(), vec![1.5, 6.5]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let model = LinearModel {
            weights: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]],
            bias: vec![0.0, 0.0, 0.0],
            link: Link::Softmax,
        };
        let out = numeric(model.predict_raw(&frame(&[[3.0, -1.0]])).expect("predict"));
        assert!((out.row(0).sum() - 1.0).abs() < 1e-12);
        assert!(out[[0, 0]] > out[[0, 2]]);
    }

    #[test]
    fn text_features_are_rejected() {
        let model = LinearModel {
            weights: vec![vec![1.0]],
            bias: vec![0.0],
            link: Link::Sigmoid,
        };
        let df = DataFrame::from_rows(vec!["t".into()], vec![vec![Cell::Text("x".into())]])
            .expect("frame");
        assert!(matches!(
            model.predict_raw(&df),
            Err(ModelError::InferenceFailed(_))
        ));
    }

    #[test]
    fn loader_reads_model_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(LINEAR_MODEL_FILE),
            r#"{"weights": [[1.0, 1.0]], "bias": [0.0], "link": "sigmoid"}"#,
        )
        .expect("write");
        let meta = ModelMeta::new("m", ModelType::Classification)
            .with_labels(vec!["no".into(), "yes".into()]);
        let model = LinearLoader.load(dir.path(), &meta).expect("load");
        let out = numeric(model.predict_raw(&frame(&[[0.0, 0.0]])).expect("predict"));
        assert!((out[[0, 0]] - 0.5).abs() < 1e-12);

        std::fs::write(dir.path().join(LINEAR_MODEL_FILE), r#"{"weights": [], "bias": []}"#)
            .expect("write");
        assert!(LinearLoader.load(dir.path(), &meta).is_err());
    }
}
