// occlusion explanations: how much each feature (or word) moves the model
// output when it is replaced by a neutral value.

use std::collections::BTreeMap;

use mlworker_core::{
    messages::{Explain, ExplainText, ExplainTextParam, Explanation, WeightsPerFeature},
    Cell, DataFrame, Dataset, DatasetError, Model, ModelPredictionResults, PredictionError,
};
use tracing::debug;

// output key used for regression models
pub const REGRESSION_KEY: &str = "prediction";

// per output key (class label or "prediction"), one value per batch row
fn output_columns(
    model: &Model,
    results: &ModelPredictionResults,
) -> Result<BTreeMap<String, Vec<f64>>, PredictionError> {
    match results {
        ModelPredictionResults::Classification(c) => Ok(c
            .labels
            .iter()
            .enumerate()
            .map(|(j, label)| (label.clone(), c.raw.column(j).to_vec()))
            .collect()),
        ModelPredictionResults::Regression { prediction } => {
            Ok(BTreeMap::from([(REGRESSION_KEY.to_string(), prediction.clone())]))
        }
        ModelPredictionResults::Empty => Ok(BTreeMap::new()),
        ModelPredictionResults::TextGeneration { .. } => Err(PredictionError::UnsupportedModelType(
            format!("cannot explain a {} model", model.model_type()),
        )),
    }
}

// median of the numeric values, otherwise the most frequent value
fn baseline(values: &[&Cell]) -> Cell {
    let mut numeric: Vec<f64> = values.iter().filter_map(|c| c.as_f64()).collect();
    let all_numeric = values
        .iter()
        .all(|c| c.is_missing() || matches!(c, Cell::Int(_) | Cell::Float(_)));
    if all_numeric && !numeric.is_empty() {
        numeric.sort_by(f64::total_cmp);
        let mid = numeric.len() / 2;
        let median = if numeric.len() % 2 == 0 {
            (numeric[mid - 1] + numeric[mid]) / 2.0
        } else {
            numeric[mid]
        };
        return Cell::Float(median);
    }

    let mut counts: BTreeMap<String, (usize, &Cell)> = BTreeMap::new();
    for &cell in values.iter().filter(|c| !c.is_missing()) {
        counts.entry(cell.to_string()).or_insert((0, cell)).0 += 1;
    }
    // ties go to the smallest rendering so the choice is stable
    counts
        .into_values()
        .fold(None::<(usize, &Cell)>, |best, (n, cell)| match best {
            Some((m, _)) if m >= n => best,
            _ => Some((n, cell)),
        })
        .map_or(Cell::Missing, |(_, cell)| cell.clone())
}

// neutral replacement value per feature, taken from the reference dataset
pub fn baselines(dataset: &Dataset, features: &[String]) -> Result<BTreeMap<String, Cell>, DatasetError> {
    features
        .iter()
        .map(|f| Ok((f.clone(), baseline(&dataset.df.column(f)?))))
        .collect()
}

// feature -> attribution, per output key
pub type Attributions = BTreeMap<String, BTreeMap<String, f64>>;

// occlusion attribution of the first row of `row`
pub fn occlusion(model: &Model, dataset: &Dataset, row: &DataFrame) -> Result<Attributions, PredictionError> {
    let original = row
        .row(0)
        .ok_or_else(|| DatasetError::Meta("nothing to explain: the row is empty".to_string()))?
        .to_vec();
    let features: Vec<String> = model
        .meta()
        .feature_names
        .clone()
        .unwrap_or_else(|| dataset.feature_columns())
        .into_iter()
        .filter(|f| row.contains(f) && dataset.df.contains(f))
        .collect();
    let baselines = baselines(dataset, &features)?;

    // row 0 is the original, row k+1 has feature k occluded
    let mut batch = DataFrame::new(row.columns().to_vec());
    batch.push_row(original.clone())?;
    for feature in &features {
        let mut occluded = DataFrame::from_rows(row.columns().to_vec(), vec![original.clone()])?;
        if let Some(cell) = baselines.get(feature) {
            occluded.set_value(0, feature, cell.clone())?;
        }
        for cells in occluded.rows() {
            batch.push_row(cells.clone())?;
        }
    }

    let results = model.predict(&dataset.with_frame(batch))?;
    let outputs = output_columns(model, &results)?;
    debug!(features = features.len(), outputs = outputs.len(), "computed occlusion attributions");

    Ok(outputs
        .into_iter()
        .map(|(key, values)| {
            let per_feature = features
                .iter()
                .enumerate()
                .map(|(k, f)| (f.clone(), values[0] - values[k + 1]))
                .collect();
            (key, per_feature)
        })
        .collect())
}

pub fn explain(
    model: &Model,
    dataset: &Dataset,
    columns: &BTreeMap<String, String>,
) -> Result<Explain, PredictionError> {
    let row = DataFrame::from_string_rows(std::slice::from_ref(columns), &dataset.column_dtypes)?;
    let explanations = occlusion(model, dataset, &row)?
        .into_iter()
        .map(|(key, per_feature)| (key, Explanation { per_feature }))
        .collect();
    Ok(Explain { explanations })
}

// word weights for one text feature: the output change when a word is dropped
pub fn explain_text(model: &Model, param: &ExplainTextParam) -> Result<ExplainText, PredictionError> {
    let text = param
        .columns
        .get(&param.feature_name)
        .ok_or_else(|| PredictionError::MissingFeatures(vec![param.feature_name.clone()]))?;
    let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    // one sample per word, capped by the requested sample count
    let sampled = words.len().min(param.n_samples);

    let mut rows = vec![param.columns.clone()];
    for i in 0..sampled {
        let reduced: Vec<&str> = words
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, w)| w.as_str())
            .collect();
        let mut row = param.columns.clone();
        row.insert(param.feature_name.clone(), reduced.join(" "));
        rows.push(row);
    }

    let dataset = Dataset::from_string_rows(
        &rows,
        None,
        param.column_types.clone(),
        param.column_dtypes.clone(),
    )?;
    let results = model.predict(&dataset)?;
    let weights = output_columns(model, &results)?
        .into_iter()
        .map(|(key, values)| {
            let weights = (0..words.len())
                .map(|i| if i < sampled { values[0] - values[i + 1] } else { 0.0 })
                .collect();
            (key, WeightsPerFeature { weights })
        })
        .collect();

    Ok(ExplainText { words, weights })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlworker_core::{
        model::{ModelMeta, RawOutput},
        ColumnType, ModelError, ModelType,
    };
    use uuid::Uuid;

    // y = 2a + 0b
    fn regressor() -> Model {
        let meta = ModelMeta::new("reg", ModelType::Regression)
            .with_feature_names(vec!["a".into(), "b".into()]);
        let raw = |batch: &DataFrame| -> Result<RawOutput, ModelError> {
            let y: Vec<f64> = batch
                .rows()
                .iter()
                .map(|r| 2.0 * r[0].as_f64().unwrap_or(0.0))
                .collect();
            Ok(RawOutput::Numeric(ndarray::Array1::from(y).into_dyn()))
        };
        Model::new(Uuid::new_v4(), meta, Box::new(raw), None).expect("model")
    }

    fn reference() -> Dataset {
        let df = DataFrame::from_rows(
            vec!["a".into(), "b".into()],
            vec![
                vec![Cell::Float(1.0), Cell::Float(10.0)],
                vec![Cell::Float(2.0), Cell::Float(20.0)],
                vec![Cell::Float(3.0), Cell::Float(30.0)],
            ],
        )
        .expect("frame");
        Dataset::new(df).with_column_dtypes(BTreeMap::from([
            ("a".to_string(), "float64".to_string()),
            ("b".to_string(), "float64".to_string()),
        ]))
    }

    #[test]
    fn baseline_is_median_or_mode() {
        let numbers = [Cell::Int(1), Cell::Missing, Cell::Float(4.0), Cell::Int(9)];
        assert_eq!(baseline(&numbers.iter().collect::<Vec<_>>()), Cell::Float(4.0));

        let words = [Cell::Text("b".into()), Cell::Text("a".into()), Cell::Text("b".into())];
        assert_eq!(baseline(&words.iter().collect::<Vec<_>>()), Cell::Text("b".into()));

        assert_eq!(baseline(&[]), Cell::Missing);
    }

    #[test]
    fn regression_attribution_follows_the_weights() {
        let columns = BTreeMap::from([
            ("a".to_string(), "5".to_string()),
            ("b".to_string(), "7".to_string()),
        ]);
        let explain = explain(&regressor(), &reference(), &columns).expect("explain");
        let per_feature = &explain.explanations[REGRESSION_KEY].per_feature;
        // a: 2*5 - 2*2, b never matters
        assert_eq!(per_feature["a"], 6.0);
        assert_eq!(per_feature["b"], 0.0);
    }

    #[test]
    fn dropped_words_carry_the_weight() {
        let meta = ModelMeta::new("spam", ModelType::Classification)
            .with_labels(vec!["ham".into(), "spam".into()]);
        // spam when the text mentions "free"
        let raw = |batch: &DataFrame| -> Result<RawOutput, ModelError> {
            let p: Vec<f64> = batch
                .rows()
                .iter()
                .map(|r| match r[0].as_str() {
                    Some(t) if t.contains("free") => 0.9,
                    _ => 0.2,
                })
                .collect();
            Ok(RawOutput::Numeric(ndarray::Array1::from(p).into_dyn()))
        };
        let model = Model::new(Uuid::new_v4(), meta, Box::new(raw), None).expect("model");

        let param = ExplainTextParam {
            model: mlworker_core::ArtifactRef::new("p", Uuid::nil()),
            feature_name: "text".into(),
            columns: BTreeMap::from([("text".to_string(), "win free money".to_string())]),
            column_types: BTreeMap::from([("text".to_string(), ColumnType::Text)]),
            column_dtypes: BTreeMap::from([("text".to_string(), "object".to_string())]),
            n_samples: 2,
        };
        let explained = explain_text(&model, &param).expect("explain");
        assert_eq!(explained.words, vec!["win", "free", "money"]);
        let spam = &explained.weights["spam"].weights;
        assert!(spam[0].abs() < 1e-12);
        assert!((spam[1] - 0.7).abs() < 1e-12);
        // beyond the sample budget
        assert_eq!(spam[2], 0.0);
    }

    #[test]
    fn text_generation_cannot_be_explained() {
        let meta = ModelMeta::new("gen", ModelType::TextGeneration);
        let raw = |batch: &DataFrame| -> Result<RawOutput, ModelError> {
            Ok(RawOutput::Text(vec!["x".into(); batch.len()]))
        };
        let model = Model::new(Uuid::new_v4(), meta, Box::new(raw), None).expect("model");
        let columns = BTreeMap::from([("a".to_string(), "1".to_string())]);
        assert!(matches!(
            explain(&model, &reference(), &columns),
            Err(PredictionError::UnsupportedModelType(_))
        ));
    }
}
