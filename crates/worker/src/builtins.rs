// functions every worker ships with.

use std::sync::Arc;

use mlworker_core::{
    messages::{
        ArgumentType, FunctionArgumentMeta, FunctionKind, FunctionMeta, SingleTestResult,
    },
    Cell, DataFrame, Dataset, Model, ModelPredictionResults,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    catalog::{
        apply_slice, FunctionCatalog, ResolvedArguments, SlicingFunction, TestFunction,
        TransformationFunction,
    },
    error::TestError,
};

pub const TEST_ACCURACY: Uuid = Uuid::from_u128(0x6d6c_776b_7465_7374_0000_0000_0000_0001);
pub const TEST_RMSE: Uuid = Uuid::from_u128(0x6d6c_776b_7465_7374_0000_0000_0000_0002);
pub const TEST_METAMORPHIC_INVARIANCE: Uuid =
    Uuid::from_u128(0x6d6c_776b_7465_7374_0000_0000_0000_0003);
pub const SLICE_MISSING_VALUES: Uuid = Uuid::from_u128(0x6d6c_776b_736c_6963_0000_0000_0000_0001);
pub const SLICE_COLUMN_EQUALS: Uuid = Uuid::from_u128(0x6d6c_776b_736c_6963_0000_0000_0000_0002);
pub const TRANSFORM_UPPERCASE: Uuid = Uuid::from_u128(0x6d6c_776b_7472_616e_0000_0000_0000_0001);
pub const TRANSFORM_NUMERIC_SHIFT: Uuid =
    Uuid::from_u128(0x6d6c_776b_7472_616e_0000_0000_0000_0002);

const MODULE: &str = "mlworker.builtins";

pub fn register(catalog: &mut FunctionCatalog) {
    catalog.register_test(Arc::new(AccuracyTest));
    catalog.register_test(Arc::new(RmseTest));
    catalog.register_test(Arc::new(MetamorphicInvarianceTest));
    catalog.register_slice(Arc::new(MissingValuesSlice));
    catalog.register_slice(Arc::new(ColumnEqualsSlice));
    catalog.register_transformation(Arc::new(UppercaseText));
    catalog.register_transformation(Arc::new(NumericShift));
}

fn function_meta(
    uuid: Uuid,
    name: &str,
    display_name: &str,
    kind: FunctionKind,
    doc: &str,
    tags: &[&str],
    args: Vec<FunctionArgumentMeta>,
) -> FunctionMeta {
    FunctionMeta {
        uuid,
        name: name.to_string(),
        display_name: display_name.to_string(),
        module: MODULE.to_string(),
        doc: doc.to_string(),
        kind,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        args,
        cell_level: false,
    }
}

fn arg(name: &str, arg_type: ArgumentType, default: Option<Value>, arg_order: u32) -> FunctionArgumentMeta {
    FunctionArgumentMeta {
        name: name.to_string(),
        arg_type,
        optional: default.is_some(),
        default,
        arg_order,
    }
}

fn optional_slice(arg_order: u32) -> FunctionArgumentMeta {
    FunctionArgumentMeta {
        name: "slicing_function".to_string(),
        arg_type: ArgumentType::SlicingFunction,
        optional: true,
        default: None,
        arg_order,
    }
}

// ============================================================================
// Tests
// ============================================================================

fn evaluated(args: &ResolvedArguments) -> Result<(Arc<Model>, Dataset, String), TestError> {
    let model = args.model("model")?;
    let dataset = apply_slice(&*args.dataset("dataset")?, args.slice("slicing_function")?)?;
    let target = dataset
        .target
        .clone()
        .ok_or_else(|| TestError::Failed("The dataset has no target column".to_string()))?;
    if dataset.is_empty() {
        return Err(TestError::Failed("The sliced dataset is empty".to_string()));
    }
    Ok((model, dataset, target))
}

pub struct AccuracyTest;

impl TestFunction for AccuracyTest {
    fn meta(&self) -> FunctionMeta {
        function_meta(
            TEST_ACCURACY,
            "test_accuracy",
            "Accuracy",
            FunctionKind::Test,
            "Passes when the share of correctly predicted labels is at least `threshold`.",
            &["classification", "performance"],
            vec![
                arg("model", ArgumentType::Model, None, 0),
                arg("dataset", ArgumentType::Dataset, None, 1),
                optional_slice(2),
                arg("threshold", ArgumentType::Float, Some(json!(0.8)), 3),
            ],
        )
    }

    fn run(&self, args: &ResolvedArguments) -> Result<SingleTestResult, TestError> {
        let (model, dataset, target) = evaluated(args)?;
        let threshold = args.float_or("threshold", 0.8)?;
        if !model.is_classification() {
            return Err(TestError::Failed(
                "Accuracy can only be computed for classification models".to_string(),
            ));
        }

        let predicted = model.predict(&dataset)?.prediction_strings();
        let truth = dataset.df.column(&target)?;
        let failed_indexes: Vec<usize> = predicted
            .iter()
            .zip(truth)
            .enumerate()
            .filter(|(_, (p, t))| **p != t.to_string())
            .map(|(i, _)| i)
            .collect();

        let metric = 1.0 - failed_indexes.len() as f64 / dataset.len() as f64;
        Ok(SingleTestResult {
            passed: metric >= threshold,
            metric: Some(metric),
            actual_slices_size: vec![dataset.len()],
            failed_indexes,
            ..Default::default()
        })
    }
}

pub struct RmseTest;

impl TestFunction for RmseTest {
    fn meta(&self) -> FunctionMeta {
        function_meta(
            TEST_RMSE,
            "test_rmse",
            "RMSE",
            FunctionKind::Test,
            "Passes when the root mean squared error is at most `threshold`.",
            &["regression", "performance"],
            vec![
                arg("model", ArgumentType::Model, None, 0),
                arg("dataset", ArgumentType::Dataset, None, 1),
                optional_slice(2),
                arg("threshold", ArgumentType::Float, Some(json!(1.0)), 3),
            ],
        )
    }

    fn run(&self, args: &ResolvedArguments) -> Result<SingleTestResult, TestError> {
        let (model, dataset, target) = evaluated(args)?;
        let threshold = args.float_or("threshold", 1.0)?;

        let ModelPredictionResults::Regression { prediction } = model.predict(&dataset)? else {
            return Err(TestError::Failed(
                "RMSE can only be computed for regression models".to_string(),
            ));
        };
        let truth = dataset
            .df
            .column(&target)?
            .into_iter()
            .map(|c| {
                c.as_f64()
                    .ok_or_else(|| TestError::Failed(format!("Target value '{c}' is not numeric")))
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let mse = prediction
            .iter()
            .zip(&truth)
            .map(|(p, t)| (p - t).powi(2))
            .sum::<f64>()
            / truth.len() as f64;
        let metric = mse.sqrt();
        Ok(SingleTestResult {
            passed: metric <= threshold,
            metric: Some(metric),
            actual_slices_size: vec![dataset.len()],
            ..Default::default()
        })
    }
}

// share of rows whose prediction survives a transformation
pub struct MetamorphicInvarianceTest;

impl TestFunction for MetamorphicInvarianceTest {
    fn meta(&self) -> FunctionMeta {
        function_meta(
            TEST_METAMORPHIC_INVARIANCE,
            "test_metamorphic_invariance",
            "Invariance to transformation",
            FunctionKind::Test,
            "Passes when at least `threshold` of the rows keep their prediction after the transformation.",
            &["classification", "regression", "robustness"],
            vec![
                arg("model", ArgumentType::Model, None, 0),
                arg("dataset", ArgumentType::Dataset, None, 1),
                arg("transformation_function", ArgumentType::TransformationFunction, None, 2),
                optional_slice(3),
                arg("threshold", ArgumentType::Float, Some(json!(0.5)), 4),
                arg("output_sensitivity", ArgumentType::Float, Some(json!(0.05)), 5),
            ],
        )
    }

    fn run(&self, args: &ResolvedArguments) -> Result<SingleTestResult, TestError> {
        let model = args.model("model")?;
        let dataset = apply_slice(&*args.dataset("dataset")?, args.slice("slicing_function")?)?;
        let (transformation, transformation_args) = args.transformation("transformation_function")?;
        let threshold = args.float_or("threshold", 0.5)?;
        let sensitivity = args.float_or("output_sensitivity", 0.05)?;
        if dataset.is_empty() {
            return Err(TestError::Failed("The sliced dataset is empty".to_string()));
        }

        let transformed = dataset.with_frame(transformation.transform(&dataset, transformation_args)?);
        let before = model.predict(&dataset)?;
        let after = model.predict(&transformed)?;

        let failed_indexes: Vec<usize> = match (&before, &after) {
            (
                ModelPredictionResults::Regression { prediction: a },
                ModelPredictionResults::Regression { prediction: b },
            ) => a
                .iter()
                .zip(b)
                .enumerate()
                .filter(|(_, (a, b))| ((*b - *a) / a.abs().max(f64::EPSILON)).abs() > sensitivity)
                .map(|(i, _)| i)
                .collect(),
            _ => before
                .prediction_strings()
                .iter()
                .zip(after.prediction_strings())
                .enumerate()
                .filter(|(_, (a, b))| **a != *b)
                .map(|(i, _)| i)
                .collect(),
        };

        let metric = 1.0 - failed_indexes.len() as f64 / dataset.len() as f64;
        Ok(SingleTestResult {
            passed: metric >= threshold,
            metric: Some(metric),
            actual_slices_size: vec![dataset.len()],
            reference_slices_size: vec![transformed.len()],
            failed_indexes,
            ..Default::default()
        })
    }
}

// ============================================================================
// Slices
// ============================================================================

pub struct MissingValuesSlice;

impl SlicingFunction for MissingValuesSlice {
    fn meta(&self) -> FunctionMeta {
        function_meta(
            SLICE_MISSING_VALUES,
            "missing_values_slice",
            "Missing values",
            FunctionKind::Slice,
            "Rows where `column` has no value.",
            &["slice"],
            vec![arg("column", ArgumentType::Str, None, 0)],
        )
    }

    fn mask(&self, dataset: &Dataset, args: &ResolvedArguments) -> Result<Vec<bool>, TestError> {
        let column = dataset.df.column(args.str("column")?)?;
        Ok(column.into_iter().map(Cell::is_missing).collect())
    }
}

pub struct ColumnEqualsSlice;

impl SlicingFunction for ColumnEqualsSlice {
    fn meta(&self) -> FunctionMeta {
        function_meta(
            SLICE_COLUMN_EQUALS,
            "column_equals_slice",
            "Column equals value",
            FunctionKind::Slice,
            "Rows where `column` renders as `value`.",
            &["slice"],
            vec![
                arg("column", ArgumentType::Str, None, 0),
                arg("value", ArgumentType::Str, None, 1),
            ],
        )
    }

    fn mask(&self, dataset: &Dataset, args: &ResolvedArguments) -> Result<Vec<bool>, TestError> {
        let value = args.str("value")?;
        let column = dataset.df.column(args.str("column")?)?;
        Ok(column.into_iter().map(|c| c.to_string() == value).collect())
    }
}

// ============================================================================
// Transformations
// ============================================================================

fn rewrite_column<F>(dataset: &Dataset, column: &str, mut rewrite: F) -> Result<DataFrame, TestError>
where
    F: FnMut(&Cell) -> Option<Cell>,
{
    let mut df = dataset.df.clone();
    let updates: Vec<(usize, Cell)> = df
        .column(column)?
        .into_iter()
        .enumerate()
        .filter_map(|(row, cell)| rewrite(cell).map(|new| (row, new)))
        .collect();
    for (row, cell) in updates {
        df.set_value(row, column, cell)?;
    }
    Ok(df)
}

pub struct UppercaseText;

impl TransformationFunction for UppercaseText {
    fn meta(&self) -> FunctionMeta {
        FunctionMeta {
            cell_level: true,
            ..function_meta(
                TRANSFORM_UPPERCASE,
                "uppercase_text",
                "Uppercase text",
                FunctionKind::Transformation,
                "Upper-cases every text value of `column`.",
                &["text", "robustness"],
                vec![arg("column", ArgumentType::Str, None, 0)],
            )
        }
    }

    fn transform(&self, dataset: &Dataset, args: &ResolvedArguments) -> Result<DataFrame, TestError> {
        rewrite_column(dataset, args.str("column")?, |cell| match cell {
            Cell::Text(text) => Some(Cell::Text(text.to_uppercase())),
            _ => None,
        })
    }
}

pub struct NumericShift;

impl TransformationFunction for NumericShift {
    fn meta(&self) -> FunctionMeta {
        FunctionMeta {
            cell_level: true,
            ..function_meta(
                TRANSFORM_NUMERIC_SHIFT,
                "numeric_shift",
                "Shift numeric values",
                FunctionKind::Transformation,
                "Adds `amount` to every numeric value of `column`.",
                &["numeric", "robustness"],
                vec![
                    arg("column", ArgumentType::Str, None, 0),
                    arg("amount", ArgumentType::Float, Some(json!(1.0)), 1),
                ],
            )
        }
    }

    fn transform(&self, dataset: &Dataset, args: &ResolvedArguments) -> Result<DataFrame, TestError> {
        let amount = args.float_or("amount", 1.0)?;
        rewrite_column(dataset, args.str("column")?, |cell| match cell {
            Cell::Int(v) => Some(Cell::Float(*v as f64 + amount)),
            Cell::Float(v) => Some(Cell::Float(v + amount)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Resolved;
    use mlworker_core::{
        model::{ModelMeta, RawOutput},
        ModelError, ModelType,
    };

    fn people() -> Dataset {
        let df = DataFrame::from_rows(
            vec!["name".into(), "age".into(), "label".into()],
            vec![
                vec![Cell::Text("ann".into()), Cell::Int(30), Cell::Text("adult".into())],
                vec![Cell::Text("bo".into()), Cell::Missing, Cell::Text("minor".into())],
                vec![Cell::Text("cy".into()), Cell::Int(12), Cell::Text("minor".into())],
            ],
        )
        .expect("frame");
        Dataset::new(df).with_target(Some("label".into()))
    }

    // predicts "adult" when age >= 18, missing ages count as adults
    fn age_model() -> Arc<Model> {
        let meta = ModelMeta::new("age", ModelType::Classification)
            .with_feature_names(vec!["age".into()])
            .with_labels(vec!["minor".into(), "adult".into()]);
        let raw = |batch: &DataFrame| -> Result<RawOutput, ModelError> {
            let p: Vec<f64> = batch
                .rows()
                .iter()
                .map(|r| if r[0].as_f64().unwrap_or(99.0) >= 18.0 { 1.0 } else { 0.0 })
                .collect();
            Ok(RawOutput::Numeric(ndarray::Array1::from(p).into_dyn()))
        };
        Arc::new(Model::new(Uuid::new_v4(), meta, Box::new(raw), None).expect("model"))
    }

    fn args(pairs: Vec<(&str, Resolved)>) -> ResolvedArguments {
        let mut args = ResolvedArguments::new("under test");
        for (name, value) in pairs {
            args.insert(name, value);
        }
        args
    }

    #[test]
    fn accuracy_counts_mismatches() {
        let result = AccuracyTest
            .run(&args(vec![
                ("model", Resolved::Model(age_model())),
                ("dataset", Resolved::Dataset(Arc::new(people()))),
                ("threshold", Resolved::Float(0.5)),
            ]))
            .expect("run");
        assert_eq!(result.failed_indexes, vec![1]);
        assert!(result.passed);
        assert!((result.metric.expect("metric") - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn accuracy_honours_slices() {
        let slice_args = args(vec![("column", Resolved::Str("age".into()))]);
        let result = AccuracyTest
            .run(&args(vec![
                ("model", Resolved::Model(age_model())),
                ("dataset", Resolved::Dataset(Arc::new(people()))),
                ("slicing_function", Resolved::Slice(Arc::new(MissingValuesSlice), slice_args)),
            ]))
            .expect("run");
        assert_eq!(result.actual_slices_size, vec![1]);
        assert!(!result.passed);
    }

    #[test]
    fn missing_model_argument_is_reported() {
        let err = AccuracyTest
            .run(&args(vec![("dataset", Resolved::Dataset(Arc::new(people())))]))
            .err()
            .expect("error");
        assert_eq!(err.to_string(), "Missing argument 'model' for under test");
    }

    #[test]
    fn column_equals_masks_rows() {
        let mask = ColumnEqualsSlice
            .mask(
                &people(),
                &args(vec![
                    ("column", Resolved::Str("label".into())),
                    ("value", Resolved::Str("minor".into())),
                ]),
            )
            .expect("mask");
        assert_eq!(mask, vec![false, true, true]);
    }

    #[test]
    fn transformations_rewrite_one_column() {
        let upper = UppercaseText
            .transform(&people(), &args(vec![("column", Resolved::Str("name".into()))]))
            .expect("transform");
        assert_eq!(upper.value(0, "name"), Some(&Cell::Text("ANN".into())));
        assert_eq!(upper.value(0, "label"), Some(&Cell::Text("adult".into())));

        let shifted = NumericShift
            .transform(
                &people(),
                &args(vec![
                    ("column", Resolved::Str("age".into())),
                    ("amount", Resolved::Float(10.0)),
                ]),
            )
            .expect("transform");
        assert_eq!(shifted.value(2, "age"), Some(&Cell::Float(22.0)));
        assert_eq!(shifted.value(1, "age"), Some(&Cell::Missing));
    }

    #[test]
    fn invariance_detects_flips() {
        let shift = args(vec![
            ("column", Resolved::Str("age".into())),
            ("amount", Resolved::Float(10.0)),
        ]);
        let result = MetamorphicInvarianceTest
            .run(&args(vec![
                ("model", Resolved::Model(age_model())),
                ("dataset", Resolved::Dataset(Arc::new(people()))),
                ("transformation_function", Resolved::Transformation(Arc::new(NumericShift), shift)),
                ("threshold", Resolved::Float(0.9)),
            ]))
            .expect("run");
        assert_eq!(result.failed_indexes, vec![2]);
        assert!(!result.passed);
    }

    #[test]
    fn invariance_runs_on_the_slice() {
        let shift = args(vec![
            ("column", Resolved::Str("age".into())),
            ("amount", Resolved::Float(10.0)),
        ]);
        let missing_ages = args(vec![("column", Resolved::Str("age".into()))]);
        let result = MetamorphicInvarianceTest
            .run(&args(vec![
                ("model", Resolved::Model(age_model())),
                ("dataset", Resolved::Dataset(Arc::new(people()))),
                ("transformation_function", Resolved::Transformation(Arc::new(NumericShift), shift)),
                ("slicing_function", Resolved::Slice(Arc::new(MissingValuesSlice), missing_ages)),
            ]))
            .expect("run");
        assert_eq!(result.actual_slices_size, vec![1]);
        assert!(result.failed_indexes.is_empty());
        assert!(result.passed);
    }
}
