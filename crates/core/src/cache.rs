// per-model prediction cache with an append-only csv store.
//
// records are `key,value` for regression and text generation models and
// `key,p0,p1,...` for classification models. the store is never rewritten;
// replaying it is last-write-wins. warm-up happens once, on first read.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{error::CacheError, CacheKey, ModelId, ModelType};

pub const CACHE_FILE_NAME: &str = "prediction-cache.csv";

// one cached model output for one row
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionValue {
    Float(f64),
    Text(String),
    Probabilities(Vec<f64>),
}

impl PredictionValue {
    fn fields(&self) -> Vec<String> {
        match self {
            PredictionValue::Float(v) => vec![v.to_string()],
            PredictionValue::Text(v) => vec![v.clone()],
            PredictionValue::Probabilities(ps) => ps.iter().map(f64::to_string).collect(),
        }
    }
}

#[derive(Debug)]
pub struct PredictionCache {
    model_id: ModelId,
    model_type: ModelType,
    // expected record width for classification models
    class_count: Option<usize>,
    file: Option<PathBuf>,
    entries: HashMap<CacheKey, PredictionValue>,
    warmed: bool,
}

impl PredictionCache {
    // `dir = None` keeps the cache in memory only
    pub fn new(model_id: ModelId, model_type: ModelType, dir: Option<PathBuf>) -> Self {
        Self {
            model_id,
            model_type,
            class_count: None,
            file: dir.map(|d| d.join(CACHE_FILE_NAME)),
            entries: HashMap::new(),
            warmed: false,
        }
    }

    pub fn with_class_count(mut self, class_count: usize) -> Self {
        self.class_count = Some(class_count);
        self
    }

    pub fn cache_file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_warm(&self) -> bool {
        self.warmed
    }

    // look up every key; `None` marks a miss. never fails.
    pub fn read(&mut self, keys: &[CacheKey]) -> Vec<Option<PredictionValue>> {
        if !self.warmed {
            self.warm_up();
            self.warmed = true;
        }
        keys.iter().map(|k| self.entries.get(k).cloned()).collect()
    }

    // insert in memory, then append to the store
    pub fn write(
        &mut self,
        keys: &[CacheKey],
        values: Vec<PredictionValue>,
    ) -> Result<(), CacheError> {
        if keys.len() != values.len() {
            return Err(CacheError::LengthMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }

        for (key, value) in keys.iter().zip(values.iter()) {
            self.entries.insert(key.clone(), value.clone());
        }

        match &self.file {
            Some(path) => append_records(path, keys, &values),
            None => Ok(()),
        }
    }

    fn warm_up(&mut self) {
        let Some(path) = self.file.clone() else {
            return;
        };
        if !path.exists() {
            return;
        }

        match self.load_records(&path) {
            Ok(records) => {
                let mut loaded = 0usize;
                for (key, value) in records {
                    // entries written by this process are newer than anything on disk
                    if !self.entries.contains_key(&key) {
                        loaded += 1;
                    }
                    self.entries.entry(key).or_insert(value);
                }
                debug!(model_id = %self.model_id, loaded, "warmed prediction cache from disk");
            }
            Err(err) => {
                warn!(
                    model_id = %self.model_id,
                    path = %path.display(),
                    error = %err,
                    "failed to load prediction cache from disk, starting cold"
                );
            }
        }
    }

    // replay the store into a map; last record for a key wins
    fn load_records(&self, path: &Path) -> Result<HashMap<CacheKey, PredictionValue>, CacheError> {
        let mut raw = fs::read(path)?;

        // a crash mid-append leaves a record without its terminator
        if raw.last().is_some_and(|b| *b != b'\n') {
            let keep = raw.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
            warn!(
                model_id = %self.model_id,
                dropped_bytes = raw.len() - keep,
                "dropping incomplete trailing cache record"
            );
            raw.truncate(keep);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(raw.as_slice());

        let mut records = HashMap::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let (key, value) = self.decode_record(line as u64 + 1, &record)?;
            records.insert(key, value);
        }
        Ok(records)
    }

    fn decode_record(
        &self,
        line: u64,
        record: &csv::StringRecord,
    ) -> Result<(CacheKey, PredictionValue), CacheError> {
        let corrupt = |reason: String| CacheError::CorruptRecord { line, reason };

        let key = record
            .get(0)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| corrupt("empty key".to_string()))?;
        let fields: Vec<&str> = record.iter().skip(1).collect();

        let value = match self.model_type {
            ModelType::TextGeneration | ModelType::Regression if fields.len() != 1 => {
                return Err(corrupt(format!("expected 1 value, got {}", fields.len())));
            }
            ModelType::TextGeneration => PredictionValue::Text(fields[0].to_string()),
            ModelType::Regression => PredictionValue::Float(
                fields[0]
                    .parse()
                    .map_err(|_| corrupt(format!("not a float: {}", fields[0])))?,
            ),
            ModelType::Classification => {
                if fields.is_empty() {
                    return Err(corrupt("no probabilities".to_string()));
                }
                if let Some(expected) = self.class_count {
                    if fields.len() != expected {
                        return Err(corrupt(format!(
                            "expected {expected} probabilities, got {}",
                            fields.len()
                        )));
                    }
                }
                let probabilities = fields
                    .iter()
                    .map(|f| f.parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| corrupt(e.to_string()))?;
                PredictionValue::Probabilities(probabilities)
            }
        };

        Ok((CacheKey::new(key), value))
    }
}

fn append_records(
    path: &Path,
    keys: &[CacheKey],
    values: &[PredictionValue],
) -> Result<(), CacheError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(file);

    for (key, value) in keys.iter().zip(values) {
        let mut record = Vec::with_capacity(2);
        record.push(key.as_str().to_string());
        record.extend(value.fields());
        writer.write_record(&record)?;
    }
    writer.flush()?;

    let mut file = writer
        .into_inner()
        .map_err(|e| CacheError::Io(e.into_error()))?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    fn disk_cache(dir: &Path, model_type: ModelType) -> PredictionCache {
        PredictionCache::new(Uuid::nil(), model_type, Some(dir.to_path_buf()))
    }

    #[test]
    fn unknown_keys_read_as_missing() {
        let mut cache = PredictionCache::new(Uuid::nil(), ModelType::Regression, None);
        assert_eq!(cache.read(&[key("a"), key("b")]), vec![None, None]);
    }

    #[test]
    fn write_is_idempotent() {
        let mut cache = PredictionCache::new(Uuid::nil(), ModelType::Regression, None);
        cache.write(&[key("a")], vec![PredictionValue::Float(1.5)]).expect("write");
        cache.write(&[key("a")], vec![PredictionValue::Float(1.5)]).expect("write");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.read(&[key("a")]), vec![Some(PredictionValue::Float(1.5))]);
    }

    #[test]
    fn read_preserves_order_with_partial_hits() {
        let mut cache = PredictionCache::new(Uuid::nil(), ModelType::Regression, None);
        cache
            .write(&[key("b")], vec![PredictionValue::Float(2.0)])
            .expect("write");
        let got = cache.read(&[key("a"), key("b"), key("c")]);
        assert_eq!(got, vec![None, Some(PredictionValue::Float(2.0)), None]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut cache = PredictionCache::new(Uuid::nil(), ModelType::Regression, None);
        let err = cache.write(&[key("a"), key("b")], vec![PredictionValue::Float(1.0)]);
        assert!(matches!(err, Err(CacheError::LengthMismatch { keys: 2, values: 1 })));
    }

    #[test]
    fn all_value_shapes_survive_warm_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cases = [
            (ModelType::Regression, PredictionValue::Float(0.1 + 0.2)),
            (
                ModelType::TextGeneration,
                PredictionValue::Text("hello, \"world\"\nbye".to_string()),
            ),
            (
                ModelType::Classification,
                PredictionValue::Probabilities(vec![0.25, 0.75]),
            ),
        ];

        for (i, (model_type, value)) in cases.into_iter().enumerate() {
            let sub = dir.path().join(i.to_string());
            let mut writer = disk_cache(&sub, model_type);
            writer.write(&[key("k")], vec![value.clone()]).expect("write");

            let mut reader = disk_cache(&sub, model_type);
            assert_eq!(reader.read(&[key("k")]), vec![Some(value)]);
            assert!(reader.is_warm());
        }
    }

    #[test]
    fn replay_is_last_write_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut first = disk_cache(dir.path(), ModelType::Regression);
        first.write(&[key("k")], vec![PredictionValue::Float(1.0)]).expect("write");
        let mut second = disk_cache(dir.path(), ModelType::Regression);
        second.write(&[key("k")], vec![PredictionValue::Float(2.0)]).expect("write");

        let mut reader = disk_cache(dir.path(), ModelType::Regression);
        assert_eq!(reader.read(&[key("k")]), vec![Some(PredictionValue::Float(2.0))]);
    }

    #[test]
    fn warm_up_does_not_override_newer_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut old = disk_cache(dir.path(), ModelType::Regression);
        old.write(&[key("k")], vec![PredictionValue::Float(1.0)]).expect("write");

        let mut cache = PredictionCache::new(Uuid::nil(), ModelType::Regression, None);
        cache.file = Some(dir.path().join(CACHE_FILE_NAME));
        cache.entries.insert(key("k"), PredictionValue::Float(9.0));
        assert_eq!(cache.read(&[key("k")]), vec![Some(PredictionValue::Float(9.0))]);
    }

    #[test]
    fn missing_store_is_cold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = disk_cache(&dir.path().join("nope"), ModelType::Regression);
        assert_eq!(cache.read(&[key("k")]), vec![None]);
        assert!(cache.is_empty());
    }

    #[test]
    fn corrupt_store_is_cold() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CACHE_FILE_NAME), "a,1.0\nb,not-a-float\n").expect("write");
        let mut cache = disk_cache(dir.path(), ModelType::Regression);
        assert_eq!(cache.read(&[key("a"), key("b")]), vec![None, None]);
        assert!(cache.is_empty());
    }

    #[test]
    fn wrong_class_count_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CACHE_FILE_NAME), "a,0.5,0.5\nb,0.1,0.2,0.7\n").expect("write");
        let mut cache = disk_cache(dir.path(), ModelType::Classification).with_class_count(2);
        assert_eq!(cache.read(&[key("a")]), vec![None]);
    }

    #[test]
    fn truncated_tail_keeps_earlier_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CACHE_FILE_NAME), "a,1.0\nb,2.0\nc,3.").expect("write");
        let mut cache = disk_cache(dir.path(), ModelType::Regression);
        assert_eq!(
            cache.read(&[key("a"), key("b"), key("c")]),
            vec![
                Some(PredictionValue::Float(1.0)),
                Some(PredictionValue::Float(2.0)),
                None
            ]
        );
    }

    #[test]
    fn store_is_append_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = disk_cache(dir.path(), ModelType::Regression);
        cache.write(&[key("k")], vec![PredictionValue::Float(1.0)]).expect("write");
        cache.write(&[key("k")], vec![PredictionValue::Float(1.0)]).expect("write");
        let contents = fs::read_to_string(dir.path().join(CACHE_FILE_NAME)).expect("read");
        assert_eq!(contents.lines().count(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_probabilities_roundtrip(probs in prop::collection::vec(0.0f64..1.0, 1..6)) {
            let dir = tempfile::tempdir().expect("tempdir");
            let value = PredictionValue::Probabilities(probs);
            let mut writer = disk_cache(dir.path(), ModelType::Classification);
            writer.write(&[key("k")], vec![value.clone()]).expect("write");

            let mut reader = disk_cache(dir.path(), ModelType::Classification);
            prop_assert_eq!(reader.read(&[key("k")]), vec![Some(value)]);
        }
    }
}
