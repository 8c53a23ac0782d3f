// registered test, slicing and transformation functions, and the resolution
// of wire arguments into values they can run with.

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use mlworker_core::{
    messages::{ArgumentValue, Catalog, FuncArgument, FunctionMeta, FunctionRef, SingleTestResult},
    DataFrame, Dataset, Model,
};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::TestError, registry::ArtifactRegistry};

pub trait TestFunction: Send + Sync {
    fn meta(&self) -> FunctionMeta;

    fn run(&self, args: &ResolvedArguments) -> Result<SingleTestResult, TestError>;
}

// keeps the rows whose mask entry is true
pub trait SlicingFunction: Send + Sync {
    fn meta(&self) -> FunctionMeta;

    fn mask(&self, dataset: &Dataset, args: &ResolvedArguments) -> Result<Vec<bool>, TestError>;
}

// returns a frame with the same rows, some cells rewritten
pub trait TransformationFunction: Send + Sync {
    fn meta(&self) -> FunctionMeta;

    fn transform(&self, dataset: &Dataset, args: &ResolvedArguments) -> Result<DataFrame, TestError>;
}

// registers functions into a catalog; rerun on reload
pub type Plugin = fn(&mut FunctionCatalog);

#[derive(Clone, Default)]
pub struct FunctionCatalog {
    tests: BTreeMap<Uuid, Arc<dyn TestFunction>>,
    slices: BTreeMap<Uuid, Arc<dyn SlicingFunction>>,
    transformations: BTreeMap<Uuid, Arc<dyn TransformationFunction>>,
}

impl std::fmt::Debug for FunctionCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCatalog")
            .field("tests", &self.tests.len())
            .field("slices", &self.slices.len())
            .field("transformations", &self.transformations.len())
            .finish()
    }
}

impl FunctionCatalog {
    pub fn from_plugins(plugins: &[Plugin]) -> Self {
        let mut catalog = Self::default();
        for plugin in plugins {
            plugin(&mut catalog);
        }
        catalog
    }

    pub fn register_test(&mut self, test: Arc<dyn TestFunction>) {
        self.tests.insert(test.meta().uuid, test);
    }

    pub fn register_slice(&mut self, slice: Arc<dyn SlicingFunction>) {
        self.slices.insert(slice.meta().uuid, slice);
    }

    pub fn register_transformation(&mut self, transformation: Arc<dyn TransformationFunction>) {
        self.transformations
            .insert(transformation.meta().uuid, transformation);
    }

    pub fn test(&self, id: &Uuid) -> Result<Arc<dyn TestFunction>, TestError> {
        self.tests
            .get(id)
            .cloned()
            .ok_or(TestError::UnknownFunction { kind: "test", id: *id })
    }

    pub fn slice(&self, id: &Uuid) -> Result<Arc<dyn SlicingFunction>, TestError> {
        self.slices
            .get(id)
            .cloned()
            .ok_or(TestError::UnknownFunction { kind: "slicing", id: *id })
    }

    pub fn transformation(&self, id: &Uuid) -> Result<Arc<dyn TransformationFunction>, TestError> {
        self.transformations
            .get(id)
            .cloned()
            .ok_or(TestError::UnknownFunction {
                kind: "transformation",
                id: *id,
            })
    }

    pub fn tests(&self) -> impl Iterator<Item = &Arc<dyn TestFunction>> {
        self.tests.values()
    }

    pub fn catalog(&self) -> Catalog {
        Catalog {
            tests: self.tests.iter().map(|(id, f)| (*id, f.meta())).collect(),
            slices: self.slices.iter().map(|(id, f)| (*id, f.meta())).collect(),
            transformations: self
                .transformations
                .iter()
                .map(|(id, f)| (*id, f.meta()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tests.len() + self.slices.len() + self.transformations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Argument resolution
// ============================================================================

#[derive(Clone)]
pub enum Resolved {
    Model(Arc<Model>),
    Dataset(Arc<Dataset>),
    Float(f64),
    Int(i64),
    Str(String),
    Bool(bool),
    Slice(Arc<dyn SlicingFunction>, ResolvedArguments),
    Transformation(Arc<dyn TransformationFunction>, ResolvedArguments),
    Kwargs(BTreeMap<String, Value>),
    None,
}

#[derive(Clone, Default)]
pub struct ResolvedArguments {
    function: String,
    values: BTreeMap<String, Resolved>,
}

impl ResolvedArguments {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Resolved) {
        self.values.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        !matches!(self.values.get(name), None | Some(Resolved::None))
    }

    fn get(&self, name: &str) -> Option<&Resolved> {
        match self.values.get(name) {
            None | Some(Resolved::None) => None,
            Some(value) => Some(value),
        }
    }

    fn missing(&self, name: &str) -> TestError {
        TestError::MissingArgument {
            function: self.function.clone(),
            name: name.to_string(),
        }
    }

    fn mistyped(&self, name: &str, expected: &'static str) -> TestError {
        TestError::ArgumentType {
            function: self.function.clone(),
            name: name.to_string(),
            expected,
        }
    }

    pub fn model(&self, name: &str) -> Result<Arc<Model>, TestError> {
        match self.get(name) {
            Some(Resolved::Model(m)) => Ok(m.clone()),
            Some(_) => Err(self.mistyped(name, "model")),
            None => Err(self.missing(name)),
        }
    }

    pub fn dataset(&self, name: &str) -> Result<Arc<Dataset>, TestError> {
        match self.get(name) {
            Some(Resolved::Dataset(d)) => Ok(d.clone()),
            Some(_) => Err(self.mistyped(name, "dataset")),
            None => Err(self.missing(name)),
        }
    }

    pub fn float_or(&self, name: &str, default: f64) -> Result<f64, TestError> {
        match self.get(name) {
            Some(Resolved::Float(v)) => Ok(*v),
            Some(Resolved::Int(v)) => Ok(*v as f64),
            Some(_) => Err(self.mistyped(name, "float")),
            None => Ok(default),
        }
    }

    pub fn str(&self, name: &str) -> Result<&str, TestError> {
        match self.get(name) {
            Some(Resolved::Str(v)) => Ok(v),
            Some(_) => Err(self.mistyped(name, "str")),
            None => Err(self.missing(name)),
        }
    }

    pub fn slice(&self, name: &str) -> Result<Option<(Arc<dyn SlicingFunction>, &ResolvedArguments)>, TestError> {
        match self.get(name) {
            Some(Resolved::Slice(f, args)) => Ok(Some((f.clone(), args))),
            Some(_) => Err(self.mistyped(name, "slicing function")),
            None => Ok(None),
        }
    }

    pub fn transformation(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn TransformationFunction>, &ResolvedArguments), TestError> {
        match self.get(name) {
            Some(Resolved::Transformation(f, args)) => Ok((f.clone(), args)),
            Some(_) => Err(self.mistyped(name, "transformation function")),
            None => Err(self.missing(name)),
        }
    }
}

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<ResolvedArguments, TestError>> + Send + 'a>>;

// turn wire arguments into live values: artifacts through the registry,
// functions through the catalog (their own arguments resolved recursively)
pub fn resolve_arguments<'a>(
    function: &'a str,
    arguments: &'a [FuncArgument],
    registry: &'a ArtifactRegistry,
    catalog: &'a FunctionCatalog,
) -> ResolveFuture<'a> {
    Box::pin(async move {
        let mut resolved = ResolvedArguments::new(function);
        for arg in arguments {
            let value = match &arg.value {
                ArgumentValue::Model(r) => Resolved::Model(registry.model(r).await?),
                ArgumentValue::Dataset(r) => Resolved::Dataset(registry.dataset(r).await?),
                ArgumentValue::Float(v) => Resolved::Float(*v),
                ArgumentValue::Int(v) => Resolved::Int(*v),
                ArgumentValue::Str(v) => Resolved::Str(v.clone()),
                ArgumentValue::Bool(v) => Resolved::Bool(*v),
                ArgumentValue::SlicingFunction(FunctionRef { id, arguments }) => {
                    let slice = catalog.slice(id)?;
                    let name = slice.meta().name;
                    let args = resolve_arguments(&name, arguments, registry, catalog).await?;
                    Resolved::Slice(slice, args)
                }
                ArgumentValue::TransformationFunction(FunctionRef { id, arguments }) => {
                    let transformation = catalog.transformation(id)?;
                    let name = transformation.meta().name;
                    let args = resolve_arguments(&name, arguments, registry, catalog).await?;
                    Resolved::Transformation(transformation, args)
                }
                ArgumentValue::Kwargs(map) => Resolved::Kwargs(map.clone()),
                ArgumentValue::None => Resolved::None,
            };
            resolved.insert(arg.name.clone(), value);
        }
        Ok(resolved)
    })
}

// apply an optional slicing function to a dataset
pub fn apply_slice(
    dataset: &Dataset,
    slice: Option<(Arc<dyn SlicingFunction>, &ResolvedArguments)>,
) -> Result<Dataset, TestError> {
    match slice {
        None => Ok(dataset.clone()),
        Some((function, args)) => {
            let mask = function.mask(dataset, args)?;
            Ok(dataset.with_frame(dataset.df.filter(&mask)))
        }
    }
}
