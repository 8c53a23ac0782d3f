// Request validation for the ml worker
// Checks decoded requests against configurable limits and rules

use std::collections::HashSet;

use crate::{
    is_valid_project_key,
    messages::{DatasetProcessingFunction, FuncArgument, WorkerRequest},
    ValidationError,
};

// configuration for the request validator
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub max_rows_per_dataframe: usize, // rows a caller may send inline
    pub min_explain_samples: usize,    // min perturbed samples for text explanations
    pub max_explain_samples: usize,    // max perturbed samples for text explanations
    pub max_suite_tests: usize,        // tests per suite run
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_rows_per_dataframe: 100_000,
            min_explain_samples: 1,
            max_explain_samples: 5_000,
            max_suite_tests: 1_000,
        }
    }
}

// wrapper for a validated request
#[derive(Debug, Clone)]
pub struct Validated<T>(pub T);

impl<T> Validated<T> {
    // unwrap the validated request
    pub fn into_inner(self) -> T {
        self.0
    }
}

// request validator that checks decoded requests against configured limits.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    config: ValidatorConfig,
}

impl RequestValidator {
    // creates a new validator with the given configuration
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    // create a validator with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ValidatorConfig::default())
    }

    pub fn validate(&self, request: WorkerRequest) -> Result<Validated<WorkerRequest>, ValidationError> {
        match &request {
            WorkerRequest::RunAdHocTest(param) => {
                if param.test_uuid.is_nil() {
                    return Err(ValidationError::MissingField("testUuid".to_string()));
                }
                unique_arguments(&param.arguments)?;
            }

            WorkerRequest::RunTestSuite(param) => {
                if param.tests.len() > self.config.max_suite_tests {
                    return Err(ValidationError::InvalidParameter {
                        field: "tests".to_string(),
                        reason: format!(
                            "must hold <= {} tests, got {}",
                            self.config.max_suite_tests,
                            param.tests.len()
                        ),
                    });
                }
                let mut ids = HashSet::new();
                for test in &param.tests {
                    if !ids.insert(test.id) {
                        return Err(ValidationError::InvalidParameter {
                            field: "tests".to_string(),
                            reason: format!("duplicate suite test id {}", test.id),
                        });
                    }
                    unique_arguments(&test.arguments)?;
                }
                unique_arguments(&param.globals)?;
            }

            WorkerRequest::RunModelForDataFrame(param) => {
                self.check_rows(param.dataframe.len())?;
            }

            WorkerRequest::Explain(param) => {
                if param.columns.is_empty() {
                    return Err(ValidationError::MissingField("columns".to_string()));
                }
            }

            WorkerRequest::ExplainText(param) => {
                if param.feature_name.trim().is_empty() {
                    return Err(ValidationError::MissingField("featureName".to_string()));
                }
                if !param.columns.contains_key(&param.feature_name) {
                    return Err(ValidationError::InvalidParameter {
                        field: "featureName".to_string(),
                        reason: format!("column '{}' is not in the row", param.feature_name),
                    });
                }
                // check sample count
                if param.n_samples < self.config.min_explain_samples
                    || param.n_samples > self.config.max_explain_samples
                {
                    return Err(ValidationError::InvalidParameter {
                        field: "nSamples".to_string(),
                        reason: format!(
                            "must be between {} and {}, got {}",
                            self.config.min_explain_samples,
                            self.config.max_explain_samples,
                            param.n_samples
                        ),
                    });
                }
            }

            WorkerRequest::GetPush(param) => {
                if param.dataframe.len() != 1 {
                    return Err(ValidationError::InvalidParameter {
                        field: "dataframe".to_string(),
                        reason: format!("must hold exactly one row, got {}", param.dataframe.len()),
                    });
                }
            }

            WorkerRequest::RunModel(param) => {
                project_key("projectKey", &param.project_key)?;
                project_key("model.projectKey", &param.model.project_key)?;
                project_key("dataset.projectKey", &param.dataset.project_key)?;
            }

            WorkerRequest::GenerateTestSuite(param) => {
                project_key("projectKey", &param.project_key)?;
                let mut names = HashSet::new();
                for input in &param.inputs {
                    if !names.insert(input.name.as_str()) {
                        return Err(ValidationError::DuplicateArgument(input.name.clone()));
                    }
                }
            }

            WorkerRequest::DatasetProcessing(param) => {
                for function in &param.functions {
                    let (DatasetProcessingFunction::Slicing(f)
                    | DatasetProcessingFunction::Transformation(f)) = function;
                    unique_arguments(&f.arguments)?;
                }
            }

            WorkerRequest::Echo(_)
            | WorkerRequest::GetInfo(_)
            | WorkerRequest::GetCatalog
            | WorkerRequest::ReloadPlugins
            | WorkerRequest::StopWorker => {}
        }

        Ok(Validated(request))
    }

    fn check_rows(&self, rows: usize) -> Result<(), ValidationError> {
        if rows > self.config.max_rows_per_dataframe {
            return Err(ValidationError::RowLimitExceeded {
                actual: rows,
                limit: self.config.max_rows_per_dataframe,
            });
        }
        Ok(())
    }

    // Get the validator configuration
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }
}

fn project_key(field: &str, key: &str) -> Result<(), ValidationError> {
    if !is_valid_project_key(key) {
        return Err(ValidationError::InvalidParameter {
            field: field.to_string(),
            reason: format!("'{key}' is not a plain directory name"),
        });
    }
    Ok(())
}

fn unique_arguments(arguments: &[FuncArgument]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for arg in arguments {
        if !seen.insert(arg.name.as_str()) {
            return Err(ValidationError::DuplicateArgument(arg.name.clone()));
        }
    }
    Ok(())
}
