// pushes: suggestions computed for a single row (a strong feature contribution,
// a fragile prediction, an overconfident or borderline answer), each offering
// call-to-actions the caller can ask to have prepared.

use mlworker_core::{
    messages::{
        ArgumentValue, CallToActionKind, FuncArgument, FunctionRef, GetPushResponse, Push,
        PushAction, PushDetails, PushKind,
    },
    Cell, ColumnType, DataFrame, Dataset, Model, ModelPredictionResults,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    builtins::{
        SLICE_COLUMN_EQUALS, TEST_ACCURACY, TEST_METAMORPHIC_INVARIANCE, TEST_RMSE,
        TRANSFORM_NUMERIC_SHIFT, TRANSFORM_UPPERCASE,
    },
    error::PushError,
    explain::{occlusion, REGRESSION_KEY},
};

// thresholds of the push heuristics
#[derive(Debug, Clone)]
pub struct PushConfig {
    // (p_pred - p_true) / p_pred at or above this is overconfident
    pub overconfidence_ratio: f64,
    // top-2 probability gap at or below this is borderline
    pub borderline_gap: f64,
    // share of the total attribution one feature must carry
    pub contribution_share: f64,
    // numeric perturbation size, in median absolute deviations
    pub mad_multiplier: f64,
    // relative regression change counted as a flip
    pub regression_change: f64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            overconfidence_ratio: 0.5,
            borderline_gap: 0.1,
            contribution_share: 0.5,
            mad_multiplier: 3.0,
            regression_change: 0.2,
        }
    }
}

// the row a push is computed for
#[derive(Debug, Clone, Copy)]
pub struct PushRow<'a> {
    pub model: &'a Model,
    // reference data (baselines, deviations)
    pub dataset: &'a Dataset,
    // a single row, target included when known
    pub row: &'a DataFrame,
    pub row_idx: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Pusher {
    config: PushConfig,
}

impl Pusher {
    pub fn new(config: PushConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    // every applicable push, plus the action for (`push_kind`, `cta_kind`) when
    // both are given and that push offers the call-to-action
    pub fn get_push(
        &self,
        target: PushRow<'_>,
        push_kind: Option<PushKind>,
        cta_kind: Option<CallToActionKind>,
    ) -> Result<GetPushResponse, PushError> {
        if push_kind == Some(PushKind::Invalid) {
            return Err(PushError::InvalidKind);
        }

        let sample = target.dataset.with_frame(target.row.clone());
        let results = target.model.predict(&sample)?;

        let mut response = GetPushResponse {
            contribution: self.contribution(&target, &results)?,
            perturbation: self.perturbation(&target, &results)?,
            overconfidence: self.overconfidence(&target, &results),
            borderline: self.borderline(&results),
            action: None,
        };

        if let (Some(kind), Some(cta)) = (push_kind, cta_kind) {
            if cta != CallToActionKind::None {
                let push = match kind {
                    PushKind::Contribution => response.contribution.as_ref(),
                    PushKind::Perturbation => response.perturbation.as_ref(),
                    PushKind::Overconfidence => response.overconfidence.as_ref(),
                    PushKind::Borderline => response.borderline.as_ref(),
                    PushKind::Invalid => None,
                };
                response.action = push
                    .filter(|p| p.push_details.iter().any(|d| d.cta == cta))
                    .map(|p| self.action(&target, p, cta));
            }
        }

        debug!(
            row_idx = target.row_idx,
            contribution = response.contribution.is_some(),
            perturbation = response.perturbation.is_some(),
            overconfidence = response.overconfidence.is_some(),
            borderline = response.borderline.is_some(),
            action = response.action.is_some(),
            "computed pushes"
        );
        Ok(response)
    }

    fn contribution(
        &self,
        target: &PushRow<'_>,
        results: &ModelPredictionResults,
    ) -> Result<Option<Push>, PushError> {
        let key = match results {
            ModelPredictionResults::Classification(c) => match c.prediction.first() {
                Some(label) => label.clone(),
                None => return Ok(None),
            },
            ModelPredictionResults::Regression { .. } => REGRESSION_KEY.to_string(),
            _ => return Ok(None),
        };

        let attributions = occlusion(target.model, target.dataset, target.row)?;
        let Some(per_feature) = attributions.get(&key) else {
            return Ok(None);
        };
        let total: f64 = per_feature.values().map(|v| v.abs()).sum();
        if total <= 0.0 {
            return Ok(None);
        }
        let strongest = per_feature
            .iter()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .filter(|(_, v)| v.abs() / total >= self.config.contribution_share);

        Ok(strongest.map(|(feature, _)| {
            let value = cell_string(target.row, feature);
            Push {
                kind: PushKind::Contribution,
                push_title: format!("{feature}=={value} contributes a lot to the prediction"),
                key: Some(feature.clone()),
                value: Some(value),
                push_details: vec![
                    details(
                        "Open a new debugger session with similar examples",
                        "Debugging similar examples may help you find common patterns",
                        "Open debugger",
                        CallToActionKind::CreateSliceOpenDebugger,
                    ),
                    details(
                        "Test the model performance on this slice",
                        "Performance tests on the slice show whether the pattern generalizes",
                        "Create test",
                        CallToActionKind::CreateTest,
                    ),
                    details(
                        "Save this slice for later use",
                        "Saved slices can be reused in tests and debugging sessions",
                        "Save slice",
                        CallToActionKind::CreateSlice,
                    ),
                ],
            }
        }))
    }

    fn perturbation(
        &self,
        target: &PushRow<'_>,
        results: &ModelPredictionResults,
    ) -> Result<Option<Push>, PushError> {
        let dataset = target.dataset;
        for (feature, column_type) in &dataset.column_types {
            if Some(feature.as_str()) == dataset.target.as_deref() || !target.row.contains(feature) {
                continue;
            }
            let Some(original) = target.row.value(0, feature) else {
                continue;
            };
            let perturbed_cell = match (column_type, original) {
                (ColumnType::Numeric, cell) => match cell.as_f64() {
                    Some(v) => {
                        let mad = median_absolute_deviation(&dataset.df.column(feature)?);
                        if mad <= 0.0 {
                            continue;
                        }
                        Cell::Float(v + self.config.mad_multiplier * mad)
                    }
                    None => continue,
                },
                (ColumnType::Text, Cell::Text(text)) => Cell::Text(text.to_uppercase()),
                _ => continue,
            };

            let mut perturbed = target.row.clone();
            perturbed.set_value(0, feature, perturbed_cell)?;
            let changed = target.model.predict(&dataset.with_frame(perturbed))?;
            if self.flipped(results, &changed) {
                let value = cell_string(target.row, feature);
                return Ok(Some(Push {
                    kind: PushKind::Perturbation,
                    push_title: format!(
                        "A small variation of {feature}=={value} makes the prediction change"
                    ),
                    key: Some(feature.clone()),
                    value: Some(value),
                    push_details: vec![
                        details(
                            "Generate a robustness test that slightly perturbs this feature",
                            "This will enable you to make sure the model is robust against small similar changes",
                            "Add to test suite",
                            CallToActionKind::CreateRobustnessTest,
                        ),
                        details(
                            "Save the perturbation that changed the prediction",
                            "Saved perturbations can be reused in tests",
                            "Save perturbation",
                            CallToActionKind::SavePerturbation,
                        ),
                    ],
                }));
            }
        }
        Ok(None)
    }

    fn flipped(&self, before: &ModelPredictionResults, after: &ModelPredictionResults) -> bool {
        match (before, after) {
            (
                ModelPredictionResults::Regression { prediction: a },
                ModelPredictionResults::Regression { prediction: b },
            ) => match (a.first(), b.first()) {
                (Some(a), Some(b)) if *a != 0.0 => ((b - a) / a).abs() >= self.config.regression_change,
                _ => false,
            },
            _ => before.prediction_strings().first() != after.prediction_strings().first(),
        }
    }

    fn overconfidence(&self, target: &PushRow<'_>, results: &ModelPredictionResults) -> Option<Push> {
        let ModelPredictionResults::Classification(c) = results else {
            return None;
        };
        let truth = cell_string(target.row, target.dataset.target.as_deref()?);
        let true_idx = c.labels.iter().position(|l| *l == truth)?;
        let pred_idx = *c.label_index.first()?;
        if pred_idx == true_idx {
            return None;
        }
        let p_pred = c.raw[[0, pred_idx]];
        let p_true = c.raw[[0, true_idx]];
        if p_pred <= 0.0 || (p_pred - p_true) / p_pred < self.config.overconfidence_ratio {
            return None;
        }

        Some(Push {
            kind: PushKind::Overconfidence,
            key: None,
            value: None,
            push_title: "This example is incorrect while having a high confidence.".to_string(),
            push_details: example_details(CallToActionKind::OpenDebuggerOverconfidence),
        })
    }

    fn borderline(&self, results: &ModelPredictionResults) -> Option<Push> {
        let ModelPredictionResults::Classification(c) = results else {
            return None;
        };
        let mut row: Vec<f64> = c.raw.outer_iter().next()?.to_vec();
        if row.len() < 2 {
            return None;
        }
        row.sort_by(|a, b| b.total_cmp(a));
        if row[0] - row[1] > self.config.borderline_gap {
            return None;
        }

        Some(Push {
            kind: PushKind::Borderline,
            key: None,
            value: None,
            push_title: "This example was predicted with very low confidence".to_string(),
            push_details: example_details(CallToActionKind::OpenDebuggerBorderline),
        })
    }

    // the function and arguments the caller should create for `cta`
    fn action(&self, target: &PushRow<'_>, push: &Push, cta: CallToActionKind) -> PushAction {
        let key = push.key.clone().unwrap_or_default();
        let value = push.value.clone().unwrap_or_default();
        let performance_test = if target.model.is_regression() {
            TEST_RMSE
        } else {
            TEST_ACCURACY
        };
        let slice = || FunctionRef {
            id: SLICE_COLUMN_EQUALS,
            arguments: vec![
                FuncArgument::new("column", ArgumentValue::Str(key.clone())),
                FuncArgument::new("value", ArgumentValue::Str(value.clone())),
            ],
        };
        let transformation = || self.transformation(target, &key);

        match cta {
            CallToActionKind::CreateSlice | CallToActionKind::CreateSliceOpenDebugger => {
                let slice = slice();
                action(Some(slice.id), slice.arguments)
            }
            CallToActionKind::CreateTest => action(
                Some(performance_test),
                vec![FuncArgument::new(
                    "slicing_function",
                    ArgumentValue::SlicingFunction(slice()),
                )],
            ),
            CallToActionKind::CreatePerturbation | CallToActionKind::SavePerturbation => {
                let transformation = transformation();
                action(Some(transformation.id), transformation.arguments)
            }
            CallToActionKind::CreateRobustnessTest => action(
                Some(TEST_METAMORPHIC_INVARIANCE),
                vec![FuncArgument::new(
                    "transformation_function",
                    ArgumentValue::TransformationFunction(transformation()),
                )],
            ),
            CallToActionKind::CreateUnitTest => action(Some(performance_test), Vec::new()),
            CallToActionKind::SaveExample
            | CallToActionKind::OpenDebuggerBorderline
            | CallToActionKind::OpenDebuggerOverconfidence
            | CallToActionKind::AddTestToCatalog
            | CallToActionKind::None => action(
                None,
                vec![FuncArgument::new("row_idx", ArgumentValue::Int(target.row_idx))],
            ),
        }
    }

    fn transformation(&self, target: &PushRow<'_>, feature: &str) -> FunctionRef {
        let column = FuncArgument::new("column", ArgumentValue::Str(feature.to_string()));
        match target.dataset.column_types.get(feature) {
            Some(ColumnType::Text) => FunctionRef {
                id: TRANSFORM_UPPERCASE,
                arguments: vec![column],
            },
            _ => {
                let mad = target
                    .dataset
                    .df
                    .column(feature)
                    .map(|c| median_absolute_deviation(&c))
                    .unwrap_or(0.0);
                FunctionRef {
                    id: TRANSFORM_NUMERIC_SHIFT,
                    arguments: vec![
                        column,
                        FuncArgument::new(
                            "amount",
                            ArgumentValue::Float(self.config.mad_multiplier * mad),
                        ),
                    ],
                }
            }
        }
    }
}

fn action(object_uuid: Option<Uuid>, arguments: Vec<FuncArgument>) -> PushAction {
    PushAction {
        object_uuid,
        arguments,
    }
}

fn details(action: &str, explanation: &str, button: &str, cta: CallToActionKind) -> PushDetails {
    PushDetails {
        action: action.to_string(),
        explanation: explanation.to_string(),
        button: button.to_string(),
        cta,
    }
}

fn example_details(debugger: CallToActionKind) -> Vec<PushDetails> {
    vec![
        details(
            "Save this example for further inspection and testing",
            "This may help you identify spurious correlation and create unit tests",
            "Save example",
            CallToActionKind::SaveExample,
        ),
        details(
            "Generate a unit test to check if this example is correctly predicted",
            "This enables you to make sure this specific example is handled by future versions",
            "Create unit test",
            CallToActionKind::CreateUnitTest,
        ),
        details(
            "Open the debugger session on similar examples",
            "Debugging similar examples may help you find common patterns",
            "Debug similar examples",
            debugger,
        ),
    ]
}

fn cell_string(row: &DataFrame, column: &str) -> String {
    row.value(0, column).map(Cell::to_string).unwrap_or_default()
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn median_absolute_deviation(column: &[&Cell]) -> f64 {
    let mut values: Vec<f64> = column.iter().filter_map(|c| c.as_f64()).collect();
    let Some(center) = median(&mut values) else {
        return 0.0;
    };
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&mut deviations).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlworker_core::{
        model::{ModelMeta, RawOutput},
        ModelError, ModelType,
    };
    use std::collections::BTreeMap;

    // p(yes) = sigmoid(x); y is ignored
    fn model() -> Model {
        let meta = ModelMeta::new("logit", ModelType::Classification)
            .with_feature_names(vec!["x".into(), "y".into()])
            .with_labels(vec!["no".into(), "yes".into()]);
        let raw = |batch: &DataFrame| -> Result<RawOutput, ModelError> {
            let p: Vec<f64> = batch
                .rows()
                .iter()
                .map(|r| 1.0 / (1.0 + (-r[0].as_f64().unwrap_or(0.0)).exp()))
                .collect();
            Ok(RawOutput::Numeric(ndarray::Array1::from(p).into_dyn()))
        };
        Model::new(Uuid::new_v4(), meta, Box::new(raw), None).expect("model")
    }

    fn reference() -> Dataset {
        let columns = vec!["x".to_string(), "y".to_string(), "label".to_string()];
        let df = DataFrame::from_rows(
            columns,
            [-1.0, 0.0, 1.0, 2.0]
                .iter()
                .map(|x| vec![Cell::Float(*x), Cell::Float(5.0), Cell::Text("yes".into())])
                .collect(),
        )
        .expect("frame");
        Dataset::new(df)
            .with_target(Some("label".into()))
            .with_column_types(BTreeMap::from([
                ("x".to_string(), ColumnType::Numeric),
                ("y".to_string(), ColumnType::Numeric),
                ("label".to_string(), ColumnType::Category),
            ]))
    }

    fn row(x: f64, label: &str) -> DataFrame {
        DataFrame::from_rows(
            vec!["x".into(), "y".into(), "label".into()],
            vec![vec![Cell::Float(x), Cell::Float(5.0), Cell::Text(label.into())]],
        )
        .expect("row")
    }

    fn push(
        row: &DataFrame,
        kind: Option<PushKind>,
        cta: Option<CallToActionKind>,
    ) -> Result<GetPushResponse, PushError> {
        let (model, dataset) = (model(), reference());
        let target = PushRow {
            model: &model,
            dataset: &dataset,
            row,
            row_idx: 7,
        };
        Pusher::default().get_push(target, kind, cta)
    }

    #[test]
    fn invalid_kind_is_rejected() {
        let err = push(&row(-1.0, "yes"), Some(PushKind::Invalid), None).unwrap_err();
        assert!(matches!(err, PushError::InvalidKind));
    }

    #[test]
    fn wrong_confident_answer_pushes() {
        let response = push(&row(-1.0, "yes"), None, None).expect("push");

        let contribution = response.contribution.expect("contribution");
        assert_eq!(contribution.key.as_deref(), Some("x"));
        assert_eq!(contribution.value.as_deref(), Some("-1"));

        // x + 3 * MAD(x) = 2 crosses the decision boundary
        let perturbation = response.perturbation.expect("perturbation");
        assert_eq!(perturbation.key.as_deref(), Some("x"));

        assert!(response.overconfidence.is_some());
        assert!(response.borderline.is_none());
        assert!(response.action.is_none());
    }

    #[test]
    fn near_even_probabilities_are_borderline() {
        let response = push(&row(0.1, "yes"), None, None).expect("push");
        assert!(response.borderline.is_some());
        assert!(response.overconfidence.is_none());
    }

    #[test]
    fn requested_cta_prepares_an_action() {
        let response = push(
            &row(-1.0, "yes"),
            Some(PushKind::Contribution),
            Some(CallToActionKind::CreateSlice),
        )
        .expect("push");
        let action = response.action.expect("action");
        assert_eq!(action.object_uuid, Some(SLICE_COLUMN_EQUALS));
        assert_eq!(action.arguments[0].name, "column");

        let response = push(
            &row(-1.0, "yes"),
            Some(PushKind::Perturbation),
            Some(CallToActionKind::CreateRobustnessTest),
        )
        .expect("push");
        assert_eq!(
            response.action.expect("action").object_uuid,
            Some(TEST_METAMORPHIC_INVARIANCE)
        );
    }

    #[test]
    fn inapplicable_cta_is_a_no_op() {
        // contribution pushes do not offer saving an example
        let response = push(
            &row(-1.0, "yes"),
            Some(PushKind::Contribution),
            Some(CallToActionKind::SaveExample),
        )
        .expect("push");
        assert!(response.contribution.is_some());
        assert!(response.action.is_none());

        let response = push(
            &row(-1.0, "yes"),
            Some(PushKind::Borderline),
            Some(CallToActionKind::SaveExample),
        )
        .expect("push");
        assert!(response.action.is_none());
    }

    #[test]
    fn every_kind_and_cta_pair_is_answered() {
        let kinds = [
            PushKind::Perturbation,
            PushKind::Contribution,
            PushKind::Overconfidence,
            PushKind::Borderline,
        ];
        let ctas = [
            CallToActionKind::None,
            CallToActionKind::CreateSlice,
            CallToActionKind::CreateTest,
            CallToActionKind::CreatePerturbation,
            CallToActionKind::SavePerturbation,
            CallToActionKind::CreateRobustnessTest,
            CallToActionKind::CreateSliceOpenDebugger,
            CallToActionKind::OpenDebuggerBorderline,
            CallToActionKind::AddTestToCatalog,
            CallToActionKind::SaveExample,
            CallToActionKind::OpenDebuggerOverconfidence,
            CallToActionKind::CreateUnitTest,
        ];

        let mut prepared = 0;
        for target in [row(-1.0, "yes"), row(0.1, "yes")] {
            for kind in kinds {
                for cta in ctas {
                    let response = push(&target, Some(kind), Some(cta))
                        .unwrap_or_else(|e| panic!("{kind:?}/{cta:?} failed: {e}"));
                    let offered = match kind {
                        PushKind::Contribution => response.contribution.as_ref(),
                        PushKind::Perturbation => response.perturbation.as_ref(),
                        PushKind::Overconfidence => response.overconfidence.as_ref(),
                        PushKind::Borderline => response.borderline.as_ref(),
                        PushKind::Invalid => None,
                    }
                    .is_some_and(|p| p.push_details.iter().any(|d| d.cta == cta));
                    let expected = offered && cta != CallToActionKind::None;
                    assert_eq!(
                        response.action.is_some(),
                        expected,
                        "{kind:?}/{cta:?}: action {:?}",
                        response.action
                    );
                    prepared += usize::from(expected);
                }
            }
        }
        assert!(prepared > 0);
    }

    #[test]
    fn mad_ignores_missing_values() {
        let cells = [Cell::Float(-1.0), Cell::Missing, Cell::Float(0.0), Cell::Float(1.0), Cell::Float(2.0)];
        assert_eq!(median_absolute_deviation(&cells.iter().collect::<Vec<_>>()), 1.0);
    }
}
