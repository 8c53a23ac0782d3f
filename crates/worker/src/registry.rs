// loaded models and datasets, memoized per (project key, id) so a model's
// prediction cache lives as long as the worker.

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use mlworker_core::{
    model::{ModelMeta, MODEL_META_FILE},
    ArtifactRef, Dataset, Model,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    artifacts::{ArtifactKind, ArtifactResolver},
    error::ArtifactError,
    loaders::{LinearLoader, ModelLoader, LINEAR_LOADER},
};

type ArtifactKey = (String, Uuid);

pub struct ArtifactRegistry {
    resolver: ArtifactResolver,
    loaders: HashMap<String, Arc<dyn ModelLoader>>,
    models: Mutex<HashMap<ArtifactKey, Arc<Model>>>,
    datasets: Mutex<HashMap<ArtifactKey, Arc<Dataset>>>,
    cache_enabled: bool,
}

impl std::fmt::Debug for ArtifactRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRegistry")
            .field("resolver", &self.resolver)
            .field("loaders", &self.loader_names())
            .field("cache_enabled", &self.cache_enabled)
            .finish_non_exhaustive()
    }
}

impl ArtifactRegistry {
    // registry with the built-in loaders
    pub fn new(resolver: ArtifactResolver) -> Self {
        let mut registry = Self {
            resolver,
            loaders: HashMap::new(),
            models: Mutex::new(HashMap::new()),
            datasets: Mutex::new(HashMap::new()),
            cache_enabled: true,
        };
        registry.add_loader(Arc::new(LinearLoader));
        registry
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn add_loader(&mut self, loader: Arc<dyn ModelLoader>) {
        self.loaders.insert(loader.name().to_string(), loader);
    }

    pub fn loader_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaders.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolver(&self) -> &ArtifactResolver {
        &self.resolver
    }

    // make an in-process model reachable under `artifact`
    pub fn insert_model(&self, artifact: &ArtifactRef, model: Model) -> Arc<Model> {
        let model = Arc::new(model);
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact.key(), model.clone());
        model
    }

    pub fn insert_dataset(&self, artifact: &ArtifactRef, dataset: Dataset) -> Arc<Dataset> {
        let dataset = Arc::new(dataset);
        self.datasets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact.key(), dataset.clone());
        dataset
    }

    pub async fn model(&self, artifact: &ArtifactRef) -> Result<Arc<Model>, ArtifactError> {
        let key = artifact.key();
        if let Some(model) = self.lock_models().get(&key) {
            return Ok(model.clone());
        }

        let dir = self.resolver.resolve(ArtifactKind::Model, artifact).await?;
        let loaders = self.loaders.clone();
        let id = artifact.id;
        let cache_enabled = self.cache_enabled;
        let model = tokio::task::spawn_blocking(move || load_model(&dir, id, &loaders, cache_enabled))
            .await
            .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))??;

        info!(model_id = %id, name = %model.meta().name, model_type = %model.model_type(), "loaded model");
        // a concurrent load may have won; keep the first so its cache is shared
        let mut models = self.lock_models();
        Ok(models.entry(key).or_insert_with(|| Arc::new(model)).clone())
    }

    pub async fn dataset(&self, artifact: &ArtifactRef) -> Result<Arc<Dataset>, ArtifactError> {
        let key = artifact.key();
        if let Some(dataset) = self.lock_datasets().get(&key) {
            return Ok(dataset.clone());
        }

        let dir = self.resolver.resolve(ArtifactKind::Dataset, artifact).await?;
        let id = artifact.id;
        let mut dataset = tokio::task::spawn_blocking(move || Dataset::load(&dir))
            .await
            .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))??;
        dataset.id = id;

        info!(dataset_id = %id, rows = dataset.len(), "loaded dataset");
        let mut datasets = self.lock_datasets();
        Ok(datasets.entry(key).or_insert_with(|| Arc::new(dataset)).clone())
    }

    fn lock_models(&self) -> std::sync::MutexGuard<'_, HashMap<ArtifactKey, Arc<Model>>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_datasets(&self) -> std::sync::MutexGuard<'_, HashMap<ArtifactKey, Arc<Dataset>>> {
        self.datasets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_model(
    dir: &Path,
    id: Uuid,
    loaders: &HashMap<String, Arc<dyn ModelLoader>>,
    cache_enabled: bool,
) -> Result<Model, ArtifactError> {
    let meta_path = dir.join(MODEL_META_FILE);
    let raw = fs::read_to_string(&meta_path)?;
    let meta: ModelMeta = serde_json::from_str(&raw).map_err(|e| ArtifactError::Meta {
        path: meta_path.clone(),
        reason: e.to_string(),
    })?;

    let loader_name = meta.loader.clone().unwrap_or_else(|| LINEAR_LOADER.to_string());
    let loader = loaders
        .get(&loader_name)
        .ok_or_else(|| ArtifactError::UnknownLoader(loader_name.clone()))?;
    let inner = loader.load(dir, &meta)?;

    // the prediction cache store lives next to the model files
    Ok(Model::new(id, meta, inner, Some(dir.to_path_buf()))?.with_cache_enabled(cache_enabled))
}
