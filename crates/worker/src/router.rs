// request router: decodes envelopes, runs the interceptors, validates and
// dispatches each request kind to its handler, and builds the reply.

use std::{
    collections::BTreeMap,
    fs,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use mlworker_core::{
    messages::{
        ArgumentType, DatasetProcessing, DatasetProcessingFunction, DatasetProcessingParam,
        DatasetRowModificationResult, EchoMsg, Empty, FuncArgument, FunctionMeta,
        GenerateTestSuite, GenerateTestSuiteParam, GeneratedTestInput, GeneratedTestSuite,
        GetInfo, GetPushParam, GetPushResponse, IdentifierSingleTestResult,
        NamedSingleTestResult, Platform, RunAdHocTest, RunAdHocTestParam, RunModel,
        RunModelForDataFrame, RunModelForDataFrameParam, RunModelParam, SingleTestResult,
        SuiteInput, TestSuite, TestSuiteParam,
    },
    Cell, DataFrame, Dataset, DatasetError, ModelPredictionResults, ModelType, ReplyEnvelope,
    RequestEnvelope, RequestValidator, WorkerReply, WorkerRequest,
};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    builtins,
    catalog::{
        resolve_arguments, FunctionCatalog, Plugin, ResolvedArguments, SlicingFunction,
        TransformationFunction,
    },
    config::WorkerSettings,
    error::{RequestError, TestError},
    explain,
    interceptor::{Interceptor, PayloadLimit, RequestContext, RequestLogger, TokenAuth},
    push::{PushRow, Pusher},
    registry::ArtifactRegistry,
};

pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PREDICTIONS_FILE: &str = "predictions.csv";
pub const CALCULATED_FILE: &str = "calculated.csv";

const MODEL_TYPE_TAGS: [ModelType; 3] = [
    ModelType::Classification,
    ModelType::Regression,
    ModelType::TextGeneration,
];

pub struct RequestRouter {
    settings: WorkerSettings,
    registry: Arc<ArtifactRegistry>,
    plugins: Vec<Plugin>,
    catalog: RwLock<Arc<FunctionCatalog>>,
    validator: RequestValidator,
    interceptors: Vec<Arc<dyn Interceptor>>,
    pusher: Pusher,
    stop: Arc<Notify>,
    is_remote: bool,
    internal_address: Mutex<String>,
    started_at: u64,
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("registry", &self.registry)
            .field("plugins", &self.plugins.len())
            .field(
                "interceptors",
                &self.interceptors.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .field("is_remote", &self.is_remote)
            .finish_non_exhaustive()
    }
}

impl RequestRouter {
    // router with the built-in functions and the interceptors the settings ask for
    pub fn new(settings: WorkerSettings, registry: Arc<ArtifactRegistry>) -> Self {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(RequestLogger),
            Arc::new(PayloadLimit {
                max_bytes: settings.max_receive_bytes(),
            }),
        ];
        if let Some(token) = &settings.request_token {
            interceptors.push(Arc::new(TokenAuth::new(token.clone())));
        }

        let plugins: Vec<Plugin> = vec![builtins::register];
        Self {
            validator: RequestValidator::new(settings.validator.clone()),
            catalog: RwLock::new(Arc::new(FunctionCatalog::from_plugins(&plugins))),
            plugins,
            settings,
            registry,
            interceptors,
            pusher: Pusher::default(),
            stop: Arc::new(Notify::new()),
            is_remote: false,
            internal_address: Mutex::new(String::new()),
            started_at: unix_now(),
        }
    }

    // adds plugins on top of the built-ins and rebuilds the catalog
    pub fn with_plugins(mut self, plugins: Vec<Plugin>) -> Self {
        self.plugins.extend(plugins);
        self.catalog = RwLock::new(Arc::new(FunctionCatalog::from_plugins(&self.plugins)));
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_pusher(mut self, pusher: Pusher) -> Self {
        self.pusher = pusher;
        self
    }

    pub fn with_remote(mut self, is_remote: bool) -> Self {
        self.is_remote = is_remote;
        self
    }

    pub fn set_internal_address(&self, address: impl Into<String>) {
        *self
            .internal_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = address.into();
    }

    pub fn internal_address(&self) -> String {
        self.internal_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // notified when a stopWorker request was handled
    pub fn stop_signal(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    pub fn registry(&self) -> &Arc<ArtifactRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn catalog(&self) -> Arc<FunctionCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // handles one encoded request frame; never fails, errors become error replies
    pub async fn handle_frame(&self, frame: &[u8]) -> ReplyEnvelope {
        match RequestEnvelope::parse(frame) {
            Ok(envelope) => self.handle(envelope, frame.len()).await,
            Err(err) => {
                let (id, action) = salvage_ids(frame);
                let err = RequestError::from(err);
                warn!(%id, error = %err, "undecodable request");
                ReplyEnvelope::error(id, action, err.detail())
            }
        }
    }

    pub async fn handle(&self, envelope: RequestEnvelope, frame_size: usize) -> ReplyEnvelope {
        let span = info_span!("request", id = %envelope.id, action = %envelope.action);
        async move {
            let ctx = RequestContext::new(&envelope, frame_size);
            let reply = match self.process(&ctx, &envelope).await {
                Ok(reply) => ReplyEnvelope::ok(&envelope.id, &envelope.action, &reply)
                    .unwrap_or_else(|e| {
                        let err = RequestError::Internal(format!("cannot encode reply: {e}"));
                        ReplyEnvelope::error(&envelope.id, &envelope.action, err.detail())
                    }),
                Err(err) => ReplyEnvelope::error(&envelope.id, &envelope.action, err.detail()),
            };
            for interceptor in &self.interceptors {
                interceptor.after(&ctx, &reply);
            }
            reply
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        ctx: &RequestContext,
        envelope: &RequestEnvelope,
    ) -> Result<WorkerReply, RequestError> {
        for interceptor in &self.interceptors {
            interceptor.before(ctx, envelope)?;
        }
        let request = envelope.decode()?;
        debug!("decoded");
        let request = self.validator.validate(request)?.into_inner();
        self.dispatch(request).await
    }

    pub async fn dispatch(&self, request: WorkerRequest) -> Result<WorkerReply, RequestError> {
        match request {
            WorkerRequest::Echo(param) => Ok(WorkerReply::Echo(EchoMsg { msg: param.msg })),
            WorkerRequest::GetInfo(param) => Ok(WorkerReply::GetInfo(self.info(param.list_packages))),
            WorkerRequest::GetCatalog => Ok(WorkerReply::Catalog(self.catalog().catalog())),
            WorkerRequest::RunAdHocTest(param) => {
                self.run_ad_hoc_test(param).await.map(WorkerReply::RunAdHocTest)
            }
            WorkerRequest::RunTestSuite(param) => {
                self.run_test_suite(param).await.map(WorkerReply::TestSuite)
            }
            WorkerRequest::RunModel(param) => self.run_model(param).await.map(WorkerReply::RunModel),
            WorkerRequest::RunModelForDataFrame(param) => self
                .run_model_for_dataframe(param)
                .await
                .map(WorkerReply::RunModelForDataFrame),
            WorkerRequest::Explain(param) => {
                let model = self.registry.model(&param.model).await?;
                let dataset = self.registry.dataset(&param.dataset).await?;
                blocking(move || Ok(explain::explain(&model, &dataset, &param.columns)?))
                    .await
                    .map(WorkerReply::Explain)
            }
            WorkerRequest::ExplainText(param) => {
                let model = self.registry.model(&param.model).await?;
                blocking(move || Ok(explain::explain_text(&model, &param)?))
                    .await
                    .map(WorkerReply::ExplainText)
            }
            WorkerRequest::GenerateTestSuite(param) => Ok(WorkerReply::GenerateTestSuite(
                generate_test_suite(&self.catalog(), &param),
            )),
            WorkerRequest::GetPush(param) => self.get_push(param).await.map(WorkerReply::GetPush),
            WorkerRequest::DatasetProcessing(param) => self
                .dataset_processing(param)
                .await
                .map(WorkerReply::DatasetProcessing),
            WorkerRequest::ReloadPlugins => {
                self.reload_plugins();
                Ok(WorkerReply::Empty(Empty {}))
            }
            WorkerRequest::StopWorker => {
                info!("stop requested");
                self.stop.notify_one();
                Ok(WorkerReply::Empty(Empty {}))
            }
        }
    }

    fn info(&self, list_packages: bool) -> GetInfo {
        let mut installed_packages = BTreeMap::new();
        if list_packages {
            installed_packages.insert("mlworker".to_string(), WORKER_VERSION.to_string());
            for loader in self.registry.loader_names() {
                installed_packages.insert(format!("loader:{loader}"), WORKER_VERSION.to_string());
            }
            let catalog = self.catalog().catalog();
            for meta in catalog
                .tests
                .values()
                .chain(catalog.slices.values())
                .chain(catalog.transformations.values())
            {
                installed_packages.insert(format!("{}.{}", meta.module, meta.name), WORKER_VERSION.to_string());
            }
        }

        GetInfo {
            platform: Platform {
                machine: std::env::consts::ARCH.to_string(),
                node: std::env::var("HOSTNAME").unwrap_or_default(),
                processor: std::env::consts::ARCH.to_string(),
                release: String::new(),
                system: std::env::consts::OS.to_string(),
                version: String::new(),
            },
            runtime: "rust".to_string(),
            runtime_version: option_env!("CARGO_PKG_RUST_VERSION")
                .unwrap_or_default()
                .to_string(),
            installed_packages,
            internal_address: self.internal_address(),
            pid: std::process::id(),
            process_start_time: self.started_at,
            is_remote: self.is_remote,
            worker_version: WORKER_VERSION.to_string(),
        }
    }

    pub fn reload_plugins(&self) {
        let catalog = FunctionCatalog::from_plugins(&self.plugins);
        info!(functions = catalog.len(), plugins = self.plugins.len(), "reloaded plugins");
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    async fn run_ad_hoc_test(&self, param: RunAdHocTestParam) -> Result<RunAdHocTest, RequestError> {
        let catalog = self.catalog();
        let result = self.run_test(&catalog, param.test_uuid, &param.arguments).await;
        Ok(RunAdHocTest {
            results: vec![NamedSingleTestResult {
                test_uuid: param.test_uuid,
                result,
            }],
        })
    }

    async fn run_test_suite(&self, param: TestSuiteParam) -> Result<TestSuite, RequestError> {
        let catalog = self.catalog();
        let mut results = Vec::with_capacity(param.tests.len());
        let mut logs = String::new();

        for test in &param.tests {
            // globals fill in arguments the test declares but the suite entry left out
            let declared: Vec<String> = catalog
                .test(&test.test_uuid)
                .map(|t| t.meta().args.into_iter().map(|a| a.name).collect())
                .unwrap_or_default();
            let mut arguments = test.arguments.clone();
            for global in &param.globals {
                if declared.contains(&global.name) && !arguments.iter().any(|a| a.name == global.name) {
                    arguments.push(global.clone());
                }
            }

            let result = self.run_test(&catalog, test.test_uuid, &arguments).await;
            let outcome = if result.is_error {
                "error"
            } else if result.passed {
                "passed"
            } else {
                "failed"
            };
            logs.push_str(&format!("test {} ({}): {outcome}\n", test.id, test.test_uuid));
            results.push(IdentifierSingleTestResult {
                id: test.id,
                result,
                arguments,
            });
        }

        let is_error = results.iter().any(|r| r.result.is_error);
        let is_pass = !is_error && results.iter().all(|r| r.result.passed);
        info!(tests = results.len(), is_pass, is_error, "ran test suite");
        Ok(TestSuite {
            is_error,
            is_pass,
            results,
            logs,
        })
    }

    // test failures are reported in the result, never as a request error
    async fn run_test(
        &self,
        catalog: &Arc<FunctionCatalog>,
        test_uuid: Uuid,
        arguments: &[FuncArgument],
    ) -> SingleTestResult {
        match self.try_run_test(catalog, test_uuid, arguments).await {
            Ok(result) => result,
            Err(err) => {
                warn!(%test_uuid, error = %err, "test errored");
                SingleTestResult::errored(err.to_string())
            }
        }
    }

    async fn try_run_test(
        &self,
        catalog: &Arc<FunctionCatalog>,
        test_uuid: Uuid,
        arguments: &[FuncArgument],
    ) -> Result<SingleTestResult, TestError> {
        let test = catalog.test(&test_uuid)?;
        let name = test.meta().name;
        let args = resolve_arguments(&name, arguments, &self.registry, catalog).await?;
        debug!(test = %name, "running test");
        tokio::task::spawn_blocking(move || test.run(&args))
            .await
            .map_err(|e| TestError::Failed(format!("test task failed: {e}")))?
    }

    // ------------------------------------------------------------------------
    // Predictions
    // ------------------------------------------------------------------------

    async fn run_model(&self, param: RunModelParam) -> Result<RunModel, RequestError> {
        let dir = self
            .settings
            .inspection_dir(&param.project_key, param.inspection_id)?;
        let model = self.registry.model(&param.model).await?;
        let dataset = self.registry.dataset(&param.dataset).await?;

        blocking(move || {
            let results = model.predict(&dataset)?;
            fs::create_dir_all(&dir).map_err(DatasetError::from)?;

            let (columns, rows): (Vec<String>, Vec<Vec<Cell>>) = match &results {
                ModelPredictionResults::Classification(c) => (
                    c.labels.clone(),
                    c.raw
                        .outer_iter()
                        .map(|row| row.iter().map(|p| Cell::Float(*p)).collect())
                        .collect(),
                ),
                _ => (
                    vec!["prediction".to_string()],
                    results
                        .prediction_strings()
                        .into_iter()
                        .map(|p| vec![prediction_cell(&results, p)])
                        .collect(),
                ),
            };
            DataFrame::from_rows(columns, rows)?.write_csv(&dir.join(PREDICTIONS_FILE))?;

            // predicted value next to the target, when there is one
            let mut calculated = DataFrame::new(vec!["prediction".to_string()]);
            for p in results.prediction_strings() {
                calculated.push_row(vec![Cell::Text(p)])?;
            }
            if let Some(target) = &dataset.target {
                calculated.add_column(target.clone(), Cell::Missing);
                for (row, cell) in dataset.df.column(target)?.into_iter().enumerate() {
                    calculated.set_value(row, target, cell.clone())?;
                }
            }
            calculated.write_csv(&dir.join(CALCULATED_FILE))?;

            info!(rows = results.len(), path = %dir.display(), "wrote inspection");
            Ok(RunModel {
                inspection_id: param.inspection_id,
                rows: results.len(),
            })
        })
        .await
    }

    async fn run_model_for_dataframe(
        &self,
        param: RunModelForDataFrameParam,
    ) -> Result<RunModelForDataFrame, RequestError> {
        let model = self.registry.model(&param.model).await?;
        blocking(move || {
            let dataset = Dataset::from_string_rows(
                &param.dataframe.to_maps(),
                param.target,
                param.column_types,
                param.column_dtypes,
            )?;
            let results = model.predict(&dataset)?;
            let labels = model.labels();
            Ok(RunModelForDataFrame {
                prediction: results.prediction_strings(),
                raw_prediction: results.raw_prediction(),
                probabilities: results.probabilities().map(<[f64]>::to_vec),
                all_predictions: results.all_predictions().map(|table| {
                    table
                        .outer_iter()
                        .map(|row| labels.iter().cloned().zip(row.iter().copied()).collect())
                        .collect()
                }),
            })
        })
        .await
    }

    async fn get_push(&self, param: GetPushParam) -> Result<GetPushResponse, RequestError> {
        let model = self.registry.model(&param.model).await?;
        let dataset = self.registry.dataset(&param.dataset).await?;
        let pusher = self.pusher.clone();

        blocking(move || {
            // the caller's schema wins over the stored one
            let mut reference = (*dataset).clone();
            reference.column_dtypes.extend(param.column_dtypes);
            reference.column_types.extend(param.column_types);
            if param.target.is_some() {
                reference.target = param.target;
            }
            let row = DataFrame::from_string_rows(&param.dataframe.to_maps(), &reference.column_dtypes)?;

            let target = PushRow {
                model: &model,
                dataset: &reference,
                row: &row,
                row_idx: param.row_idx,
            };
            Ok(pusher.get_push(target, param.push_kind, param.cta_kind)?)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Dataset processing
    // ------------------------------------------------------------------------

    async fn dataset_processing(
        &self,
        param: DatasetProcessingParam,
    ) -> Result<DatasetProcessing, RequestError> {
        let dataset = self.registry.dataset(&param.dataset).await?;
        let catalog = self.catalog();

        let mut steps = Vec::with_capacity(param.functions.len());
        for function in &param.functions {
            let step = match function {
                DatasetProcessingFunction::Slicing(r) => {
                    let slice = catalog.slice(&r.id)?;
                    let args = resolve_arguments(&slice.meta().name, &r.arguments, &self.registry, &catalog).await?;
                    ProcessingStep::Slice(slice, args)
                }
                DatasetProcessingFunction::Transformation(r) => {
                    let transformation = catalog.transformation(&r.id)?;
                    let args =
                        resolve_arguments(&transformation.meta().name, &r.arguments, &self.registry, &catalog)
                            .await?;
                    ProcessingStep::Transformation(transformation, args)
                }
            };
            steps.push(step);
        }

        blocking(move || Ok(process_dataset(&dataset, &steps)?)).await
    }
}

enum ProcessingStep {
    Slice(Arc<dyn SlicingFunction>, ResolvedArguments),
    Transformation(Arc<dyn TransformationFunction>, ResolvedArguments),
}

// applies the steps in order, tracking which original rows were sliced out
// and which cells were rewritten
fn process_dataset(dataset: &Dataset, steps: &[ProcessingStep]) -> Result<DatasetProcessing, TestError> {
    let mut ids: Vec<usize> = (0..dataset.len()).collect();
    let mut current = dataset.clone();
    let mut filtered_rows = Vec::new();
    let mut modified: BTreeMap<usize, BTreeMap<String, String>> = BTreeMap::new();

    for step in steps {
        match step {
            ProcessingStep::Slice(function, args) => {
                let mask = function.mask(&current, args)?;
                if mask.len() != ids.len() {
                    return Err(TestError::Failed(format!(
                        "slicing function '{}' returned {} flags for {} rows",
                        function.meta().name,
                        mask.len(),
                        ids.len()
                    )));
                }
                let (kept, dropped): (Vec<(usize, bool)>, Vec<(usize, bool)>) =
                    ids.iter().copied().zip(mask.iter().copied()).partition(|(_, keep)| *keep);
                filtered_rows.extend(dropped.into_iter().map(|(id, _)| id));
                ids = kept.into_iter().map(|(id, _)| id).collect();
                current = current.with_frame(current.df.filter(&mask));
            }
            ProcessingStep::Transformation(function, args) => {
                let df = function.transform(&current, args)?;
                if df.len() != ids.len() {
                    return Err(TestError::Failed(format!(
                        "transformation function '{}' changed the row count from {} to {}",
                        function.meta().name,
                        ids.len(),
                        df.len()
                    )));
                }
                for (row, id) in ids.iter().enumerate() {
                    for column in df.columns() {
                        let after = df.value(row, column);
                        if current.df.value(row, column) != after {
                            let rendered = after.map(ToString::to_string).unwrap_or_default();
                            modified.entry(*id).or_default().insert(column.clone(), rendered);
                        }
                    }
                }
                current = current.with_frame(df);
            }
        }
    }

    filtered_rows.sort_unstable();
    let modifications = modified
        .into_iter()
        .filter(|(id, _)| ids.contains(id))
        .map(|(row_id, modifications)| DatasetRowModificationResult {
            row_id,
            modifications,
        })
        .collect();

    Ok(DatasetProcessing {
        dataset_id: dataset.id,
        total_rows: dataset.len(),
        filtered_rows,
        modifications,
    })
}

// ----------------------------------------------------------------------------
// Test suite generation
// ----------------------------------------------------------------------------

// input to bind to `arg`: same name first, then the first input of that type
fn matching_input<'a>(
    inputs: &'a [SuiteInput],
    name: &str,
    arg_type: ArgumentType,
) -> Option<&'a SuiteInput> {
    inputs
        .iter()
        .find(|i| i.name == name && i.input_type == arg_type)
        .or_else(|| inputs.iter().find(|i| i.input_type == arg_type))
}

fn supports_model_type(meta: &FunctionMeta, model_type: ModelType) -> bool {
    let restricted = MODEL_TYPE_TAGS
        .iter()
        .any(|t| meta.tags.iter().any(|tag| tag == t.as_str()));
    !restricted || meta.tags.iter().any(|tag| tag == model_type.as_str())
}

// every catalog test whose required arguments the inputs can satisfy
fn generate_test_suite(catalog: &FunctionCatalog, param: &GenerateTestSuiteParam) -> GenerateTestSuite {
    let tests = catalog
        .tests()
        .filter_map(|test| {
            let meta = test.meta();
            let mut inputs = Vec::new();
            for arg in &meta.args {
                match matching_input(&param.inputs, &arg.name, arg.arg_type) {
                    Some(input) => {
                        if let Some(model_type) = input.model_type {
                            if arg.arg_type == ArgumentType::Model && !supports_model_type(&meta, model_type) {
                                return None;
                            }
                        }
                        inputs.push(GeneratedTestInput {
                            name: arg.name.clone(),
                            value: input.name.clone(),
                            is_alias: true,
                        });
                    }
                    None if arg.optional => {}
                    None => return None,
                }
            }
            Some(GeneratedTestSuite {
                test_uuid: meta.uuid,
                inputs,
            })
        })
        .collect();
    GenerateTestSuite { tests }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

async fn blocking<T, F>(work: F) -> Result<T, RequestError>
where
    F: FnOnce() -> Result<T, RequestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RequestError::Internal(format!("worker task failed: {e}")))?
}

fn prediction_cell(results: &ModelPredictionResults, rendered: String) -> Cell {
    match results {
        ModelPredictionResults::Regression { .. } => rendered
            .parse()
            .map(Cell::Float)
            .unwrap_or(Cell::Text(rendered)),
        _ => Cell::Text(rendered),
    }
}

// best effort id/action for replies to envelopes that failed to parse
fn salvage_ids(frame: &[u8]) -> (String, String) {
    let value: Value = serde_json::from_slice(frame).unwrap_or(Value::Null);
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    (field("id"), field("action"))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
