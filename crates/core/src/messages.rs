// request and reply messages exchanged with the control plane.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::DecodeError, ArtifactRef, ColumnType, ModelType, RequestId};

pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Envelopes
// ============================================================================

// what arrives on the wire; `param` is decoded once `action` is known
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub action: String,
    #[serde(default)]
    pub param: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<RequestId>, request: &WorkerRequest) -> Result<Self, DecodeError> {
        Ok(Self {
            id: id.into(),
            action: request.kind().as_str().to_string(),
            param: request.to_param()?,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))
    }

    pub fn decode(&self) -> Result<WorkerRequest, DecodeError> {
        WorkerRequest::decode(&self.action, self.param.clone())
    }
}

// error details carried by failed replies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    // human-readable error message
    pub message: String,
    // error class (eg: "configuration_error")
    pub error_type: String,
    // error code (eg: "missing_features")
    pub code: String,
}

impl ErrorDetail {
    pub fn new(
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyEnvelope {
    pub id: RequestId,
    pub action: String,
    pub version: u32,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl ReplyEnvelope {
    pub fn ok(
        id: impl Into<RequestId>,
        action: impl Into<String>,
        reply: &WorkerReply,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            action: action.into(),
            version: PROTOCOL_VERSION,
            is_error: false,
            payload: Some(serde_json::to_value(reply)?),
            error: None,
        })
    }

    pub fn error(id: impl Into<RequestId>, action: impl Into<String>, error: ErrorDetail) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            version: PROTOCOL_VERSION,
            is_error: true,
            payload: None,
            error: Some(error),
        }
    }

    // typed view of the payload, for callers that know what they asked for
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.payload
            .as_ref()
            .map(|payload| serde_json::from_value(payload.clone()))
    }
}

// ============================================================================
// Request kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Echo,
    GetInfo,
    GetCatalog,
    RunAdHocTest,
    RunTestSuite,
    RunModel,
    RunModelForDataFrame,
    Explain,
    ExplainText,
    GenerateTestSuite,
    GetPush,
    DatasetProcessing,
    ReloadPlugins,
    StopWorker,
}

impl ActionKind {
    pub const ALL: [ActionKind; 14] = [
        ActionKind::Echo,
        ActionKind::GetInfo,
        ActionKind::GetCatalog,
        ActionKind::RunAdHocTest,
        ActionKind::RunTestSuite,
        ActionKind::RunModel,
        ActionKind::RunModelForDataFrame,
        ActionKind::Explain,
        ActionKind::ExplainText,
        ActionKind::GenerateTestSuite,
        ActionKind::GetPush,
        ActionKind::DatasetProcessing,
        ActionKind::ReloadPlugins,
        ActionKind::StopWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Echo => "echo",
            ActionKind::GetInfo => "getInfo",
            ActionKind::GetCatalog => "getCatalog",
            ActionKind::RunAdHocTest => "runAdHocTest",
            ActionKind::RunTestSuite => "runTestSuite",
            ActionKind::RunModel => "runModel",
            ActionKind::RunModelForDataFrame => "runModelForDataFrame",
            ActionKind::Explain => "explain",
            ActionKind::ExplainText => "explainText",
            ActionKind::GenerateTestSuite => "generateTestSuite",
            ActionKind::GetPush => "getPush",
            ActionKind::DatasetProcessing => "datasetProcessing",
            ActionKind::ReloadPlugins => "reloadPlugins",
            ActionKind::StopWorker => "stopWorker",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownAction(s.to_string()))
    }
}

// the closed set of requests a worker understands
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    Echo(EchoParam),
    GetInfo(GetInfoParam),
    GetCatalog,
    RunAdHocTest(RunAdHocTestParam),
    RunTestSuite(TestSuiteParam),
    RunModel(RunModelParam),
    RunModelForDataFrame(RunModelForDataFrameParam),
    Explain(ExplainParam),
    ExplainText(ExplainTextParam),
    GenerateTestSuite(GenerateTestSuiteParam),
    GetPush(GetPushParam),
    DatasetProcessing(DatasetProcessingParam),
    ReloadPlugins,
    StopWorker,
}

fn decode_param<T: DeserializeOwned>(kind: ActionKind, param: Value) -> Result<T, DecodeError> {
    // a missing param means "all defaults"
    let param = if param.is_null() {
        Value::Object(Default::default())
    } else {
        param
    };
    serde_json::from_value(param).map_err(|e| DecodeError::InvalidParam {
        action: kind.as_str().to_string(),
        reason: e.to_string(),
    })
}

impl WorkerRequest {
    pub fn decode(action: &str, param: Value) -> Result<Self, DecodeError> {
        let kind: ActionKind = action.parse()?;
        Ok(match kind {
            ActionKind::Echo => WorkerRequest::Echo(decode_param(kind, param)?),
            ActionKind::GetInfo => WorkerRequest::GetInfo(decode_param(kind, param)?),
            ActionKind::GetCatalog => WorkerRequest::GetCatalog,
            ActionKind::RunAdHocTest => WorkerRequest::RunAdHocTest(decode_param(kind, param)?),
            ActionKind::RunTestSuite => WorkerRequest::RunTestSuite(decode_param(kind, param)?),
            ActionKind::RunModel => WorkerRequest::RunModel(decode_param(kind, param)?),
            ActionKind::RunModelForDataFrame => {
                WorkerRequest::RunModelForDataFrame(decode_param(kind, param)?)
            }
            ActionKind::Explain => WorkerRequest::Explain(decode_param(kind, param)?),
            ActionKind::ExplainText => WorkerRequest::ExplainText(decode_param(kind, param)?),
            ActionKind::GenerateTestSuite => {
                WorkerRequest::GenerateTestSuite(decode_param(kind, param)?)
            }
            ActionKind::GetPush => WorkerRequest::GetPush(decode_param(kind, param)?),
            ActionKind::DatasetProcessing => {
                WorkerRequest::DatasetProcessing(decode_param(kind, param)?)
            }
            ActionKind::ReloadPlugins => WorkerRequest::ReloadPlugins,
            ActionKind::StopWorker => WorkerRequest::StopWorker,
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            WorkerRequest::Echo(_) => ActionKind::Echo,
            WorkerRequest::GetInfo(_) => ActionKind::GetInfo,
            WorkerRequest::GetCatalog => ActionKind::GetCatalog,
            WorkerRequest::RunAdHocTest(_) => ActionKind::RunAdHocTest,
            WorkerRequest::RunTestSuite(_) => ActionKind::RunTestSuite,
            WorkerRequest::RunModel(_) => ActionKind::RunModel,
            WorkerRequest::RunModelForDataFrame(_) => ActionKind::RunModelForDataFrame,
            WorkerRequest::Explain(_) => ActionKind::Explain,
            WorkerRequest::ExplainText(_) => ActionKind::ExplainText,
            WorkerRequest::GenerateTestSuite(_) => ActionKind::GenerateTestSuite,
            WorkerRequest::GetPush(_) => ActionKind::GetPush,
            WorkerRequest::DatasetProcessing(_) => ActionKind::DatasetProcessing,
            WorkerRequest::ReloadPlugins => ActionKind::ReloadPlugins,
            WorkerRequest::StopWorker => ActionKind::StopWorker,
        }
    }

    pub fn to_param(&self) -> Result<Value, DecodeError> {
        let encoded = match self {
            WorkerRequest::Echo(p) => serde_json::to_value(p),
            WorkerRequest::GetInfo(p) => serde_json::to_value(p),
            WorkerRequest::RunAdHocTest(p) => serde_json::to_value(p),
            WorkerRequest::RunTestSuite(p) => serde_json::to_value(p),
            WorkerRequest::RunModel(p) => serde_json::to_value(p),
            WorkerRequest::RunModelForDataFrame(p) => serde_json::to_value(p),
            WorkerRequest::Explain(p) => serde_json::to_value(p),
            WorkerRequest::ExplainText(p) => serde_json::to_value(p),
            WorkerRequest::GenerateTestSuite(p) => serde_json::to_value(p),
            WorkerRequest::GetPush(p) => serde_json::to_value(p),
            WorkerRequest::DatasetProcessing(p) => serde_json::to_value(p),
            WorkerRequest::GetCatalog | WorkerRequest::ReloadPlugins | WorkerRequest::StopWorker => {
                Ok(Value::Object(Default::default()))
            }
        };
        encoded.map_err(|e| DecodeError::InvalidParam {
            action: self.kind().as_str().to_string(),
            reason: e.to_string(),
        })
    }
}

// typed reply payloads; serialized as the bare payload object
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum WorkerReply {
    Echo(EchoMsg),
    GetInfo(GetInfo),
    Catalog(Catalog),
    RunAdHocTest(RunAdHocTest),
    TestSuite(TestSuite),
    RunModel(RunModel),
    RunModelForDataFrame(RunModelForDataFrame),
    Explain(Explain),
    ExplainText(ExplainText),
    GenerateTestSuite(GenerateTestSuite),
    GetPush(GetPushResponse),
    DatasetProcessing(DatasetProcessing),
    Empty(Empty),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Empty {}

// ============================================================================
// Echo / info / catalog
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EchoParam {
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EchoMsg {
    pub msg: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetInfoParam {
    #[serde(default)]
    pub list_packages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub machine: String,
    pub node: String,
    pub processor: String,
    pub release: String,
    pub system: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetInfo {
    pub platform: Platform,
    pub runtime: String,
    pub runtime_version: String,
    // name -> version; empty unless requested
    pub installed_packages: BTreeMap<String, String>,
    pub internal_address: String,
    pub pid: u32,
    // unix seconds
    pub process_start_time: u64,
    pub is_remote: bool,
    pub worker_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArgumentType {
    Model,
    Dataset,
    Float,
    Int,
    Str,
    Bool,
    SlicingFunction,
    TransformationFunction,
    Kwargs,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionArgumentMeta {
    pub name: String,
    pub arg_type: ArgumentType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub arg_order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FunctionKind {
    Test,
    Slice,
    Transformation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMeta {
    pub uuid: Uuid,
    pub name: String,
    pub display_name: String,
    pub module: String,
    #[serde(default)]
    pub doc: String,
    pub kind: FunctionKind,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub args: Vec<FunctionArgumentMeta>,
    // transformations only: applied cell by cell on one column
    #[serde(default)]
    pub cell_level: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    pub tests: BTreeMap<Uuid, FunctionMeta>,
    pub slices: BTreeMap<Uuid, FunctionMeta>,
    pub transformations: BTreeMap<Uuid, FunctionMeta>,
}

// ============================================================================
// Function arguments
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRef {
    pub id: Uuid,
    #[serde(default)]
    pub arguments: Vec<FuncArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ArgumentValue {
    Model(ArtifactRef),
    Dataset(ArtifactRef),
    Float(f64),
    Int(i64),
    Str(String),
    Bool(bool),
    SlicingFunction(FunctionRef),
    TransformationFunction(FunctionRef),
    Kwargs(BTreeMap<String, Value>),
    None,
}

impl ArgumentValue {
    pub fn arg_type(&self) -> Option<ArgumentType> {
        Some(match self {
            ArgumentValue::Model(_) => ArgumentType::Model,
            ArgumentValue::Dataset(_) => ArgumentType::Dataset,
            ArgumentValue::Float(_) => ArgumentType::Float,
            ArgumentValue::Int(_) => ArgumentType::Int,
            ArgumentValue::Str(_) => ArgumentType::Str,
            ArgumentValue::Bool(_) => ArgumentType::Bool,
            ArgumentValue::SlicingFunction(_) => ArgumentType::SlicingFunction,
            ArgumentValue::TransformationFunction(_) => ArgumentType::TransformationFunction,
            ArgumentValue::Kwargs(_) => ArgumentType::Kwargs,
            ArgumentValue::None => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuncArgument {
    pub name: String,
    pub value: ArgumentValue,
}

impl FuncArgument {
    pub fn new(name: impl Into<String>, value: ArgumentValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

// ============================================================================
// Tests and suites
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunAdHocTestParam {
    pub test_uuid: Uuid,
    #[serde(default)]
    pub arguments: Vec<FuncArgument>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestMessageType {
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestMessage {
    pub message_type: TestMessageType,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SingleTestResult {
    pub passed: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub messages: Vec<TestMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
    #[serde(default)]
    pub actual_slices_size: Vec<usize>,
    #[serde(default)]
    pub reference_slices_size: Vec<usize>,
    #[serde(default)]
    pub failed_indexes: Vec<usize>,
}

impl SingleTestResult {
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            is_error: true,
            messages: vec![TestMessage {
                message_type: TestMessageType::Error,
                text: message.into(),
            }],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamedSingleTestResult {
    pub test_uuid: Uuid,
    pub result: SingleTestResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunAdHocTest {
    pub results: Vec<NamedSingleTestResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuiteTestArgument {
    pub id: i64,
    pub test_uuid: Uuid,
    #[serde(default)]
    pub arguments: Vec<FuncArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSuiteParam {
    pub tests: Vec<SuiteTestArgument>,
    // fallbacks for arguments a suite test does not set itself
    #[serde(default)]
    pub globals: Vec<FuncArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierSingleTestResult {
    pub id: i64,
    pub result: SingleTestResult,
    // arguments the test actually ran with
    #[serde(default)]
    pub arguments: Vec<FuncArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSuite {
    pub is_error: bool,
    pub is_pass: bool,
    pub results: Vec<IdentifierSingleTestResult>,
    #[serde(default)]
    pub logs: String,
}

// ============================================================================
// Inference
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataRow {
    pub columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowBatch {
    pub rows: Vec<DataRow>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_maps(&self) -> Vec<BTreeMap<String, String>> {
        self.rows.iter().map(|r| r.columns.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunModelParam {
    pub model: ArtifactRef,
    pub dataset: ArtifactRef,
    pub inspection_id: i64,
    pub project_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunModel {
    pub inspection_id: i64,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunModelForDataFrameParam {
    pub model: ArtifactRef,
    pub dataframe: RowBatch,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub column_dtypes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunModelForDataFrame {
    pub prediction: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_prediction: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<f64>>,
    // one label -> probability map per row (classification only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_predictions: Option<Vec<BTreeMap<String, f64>>>,
}

// ============================================================================
// Explanations
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExplainParam {
    pub model: ArtifactRef,
    pub dataset: ArtifactRef,
    pub columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    pub per_feature: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Explain {
    // keyed by class label, or "prediction" for regression
    pub explanations: BTreeMap<String, Explanation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExplainTextParam {
    pub model: ArtifactRef,
    pub feature_name: String,
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub column_dtypes: BTreeMap<String, String>,
    pub n_samples: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WeightsPerFeature {
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExplainText {
    pub words: Vec<String>,
    pub weights: BTreeMap<String, WeightsPerFeature>,
}

// ============================================================================
// Test suite generation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuiteInput {
    pub name: String,
    pub input_type: ArgumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<ModelType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTestSuiteParam {
    pub project_key: String,
    #[serde(default)]
    pub inputs: Vec<SuiteInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTestInput {
    pub name: String,
    pub value: String,
    pub is_alias: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTestSuite {
    pub test_uuid: Uuid,
    pub inputs: Vec<GeneratedTestInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateTestSuite {
    pub tests: Vec<GeneratedTestSuite>,
}

// ============================================================================
// Push
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushKind {
    Invalid,
    Perturbation,
    Contribution,
    Overconfidence,
    Borderline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallToActionKind {
    None,
    CreateSlice,
    CreateTest,
    CreatePerturbation,
    SavePerturbation,
    CreateRobustnessTest,
    CreateSliceOpenDebugger,
    OpenDebuggerBorderline,
    AddTestToCatalog,
    SaveExample,
    OpenDebuggerOverconfidence,
    CreateUnitTest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetPushParam {
    pub model: ArtifactRef,
    pub dataset: ArtifactRef,
    pub row_idx: i64,
    pub dataframe: RowBatch,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub column_dtypes: BTreeMap<String, String>,
    #[serde(default)]
    pub push_kind: Option<PushKind>,
    #[serde(default)]
    pub cta_kind: Option<CallToActionKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushDetails {
    pub action: String,
    pub explanation: String,
    pub button: String,
    pub cta: CallToActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Push {
    pub kind: PushKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub push_title: String,
    pub push_details: Vec<PushDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_uuid: Option<Uuid>,
    #[serde(default)]
    pub arguments: Vec<FuncArgument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetPushResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution: Option<Push>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perturbation: Option<Push>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overconfidence: Option<Push>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borderline: Option<Push>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PushAction>,
}

// ============================================================================
// Dataset processing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "function", rename_all = "camelCase")]
pub enum DatasetProcessingFunction {
    Slicing(FunctionRef),
    Transformation(FunctionRef),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetProcessingParam {
    pub dataset: ArtifactRef,
    #[serde(default)]
    pub functions: Vec<DatasetProcessingFunction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRowModificationResult {
    pub row_id: usize,
    // column -> new value, rendered as a string
    pub modifications: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetProcessing {
    pub dataset_id: Uuid,
    pub total_rows: usize,
    // row ids that were sliced out
    pub filtered_rows: Vec<usize>,
    pub modifications: Vec<DatasetRowModificationResult>,
}

// ============================================================================
// Tests
// ============================================================================
