//! Service and CLI settings.
//!
//! Loaded once from a TOML file, then overridden by `FACEFIND_*`
//! environment variables. The resulting [`Settings`] value is passed by
//! reference; there is no global instance.

use facefind_core::extractor::{DEFAULT_MIN_FACE_SIZE, DEFAULT_QUERY_MIN_FACE_SIZE};
use facefind_core::model::{DEFAULT_DETECTOR_BACKEND, DEFAULT_MODEL_NAME};
use facefind_core::{DetectorBackend, Metric, ModelRegistry, ModelSpec, QualityGate};
use facefind_store::{CorpusLoader, DEFAULT_EMBEDDING_EXT};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use toml::Value;

pub const CONFIG_ENV: &str = "FACEFIND_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level tables whose keys are user-chosen names, not field names.
const NAMED_TABLES: [&str; 3] = ["sources", "projects", "models"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    pub model_name: String,
    pub detector_backend: String,
    pub min_face_size: f32,
    pub query_min_face_size: f32,
    pub embedding_ext: String,
    pub skip_existing: bool,
    pub workers: usize,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            detector_backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            query_min_face_size: DEFAULT_QUERY_MIN_FACE_SIZE,
            embedding_ext: DEFAULT_EMBEDDING_EXT.to_string(),
            skip_existing: true,
            workers: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub max_uploads: usize,
    pub max_upload_bytes: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_uploads: 5,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OnnxSettings {
    pub model_dir: PathBuf,
}

impl Default for OnnxSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Where embeddings of remote sources are mirrored.
    pub cache_dir: PathBuf,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("facefind"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSettings {
    Filesystem { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSettings {
    pub source: String,
    pub original_images: String,
    pub resized_images: String,
    pub embeddings: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    pub dimension: usize,
    pub metric: Metric,
    pub threshold: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub recognition: RecognitionSettings,
    pub query: QuerySettings,
    pub onnx: OnnxSettings,
    pub service: ServiceSettings,
    pub sources: BTreeMap<String, SourceSettings>,
    pub projects: BTreeMap<String, ProjectSettings>,
    pub models: BTreeMap<String, ModelSettings>,
}

impl Settings {
    /// Load from `explicit`, else `$FACEFIND_CONFIG`, else
    /// `config/default.toml` if present, else defaults; then apply the
    /// environment and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let required = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut settings = match required {
            Some(path) if !path.is_file() => return Err(ConfigError::NotFound(path)),
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                tracing::debug!("no config file, using defaults");
                Self::default()
            }
        };

        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: Value = toml::from_str(text)?;
        Ok(normalize_keys(raw).try_into::<Settings>()?)
    }

    /// Apply `FACEFIND_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let r = &mut self.recognition;
        if let Some(v) = lookup("FACEFIND_MODEL_NAME") {
            r.model_name = v;
        }
        if let Some(v) = lookup("FACEFIND_DETECTOR_BACKEND") {
            r.detector_backend = v;
        }
        override_parsed(&lookup, "FACEFIND_MIN_FACE_SIZE", &mut r.min_face_size)?;
        override_parsed(&lookup, "FACEFIND_QUERY_MIN_FACE_SIZE", &mut r.query_min_face_size)?;
        override_parsed(&lookup, "FACEFIND_WORKERS", &mut r.workers)?;
        if let Some(v) = lookup("FACEFIND_MODEL_DIR") {
            self.onnx.model_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "FACEFIND_MAX_UPLOADS", &mut self.query.max_uploads)?;
        override_parsed(&lookup, "FACEFIND_MAX_UPLOAD_BYTES", &mut self.query.max_upload_bytes)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.recognition;
        if r.workers == 0 {
            return Err(ConfigError::Invalid("recognition.workers must be at least 1".into()));
        }
        for (name, size) in [
            ("min_face_size", r.min_face_size),
            ("query_min_face_size", r.query_min_face_size),
        ] {
            if !size.is_finite() || size < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "recognition.{name} must be a non-negative number"
                )));
            }
        }
        if self.query.max_uploads == 0 {
            return Err(ConfigError::Invalid("query.max_uploads must be at least 1".into()));
        }
        for (name, project) in &self.projects {
            if !self.sources.contains_key(&project.source) {
                return Err(ConfigError::Invalid(format!(
                    "project {name} references unknown source {}",
                    project.source
                )));
            }
        }
        for (name, m) in &self.models {
            if m.dimension == 0 {
                return Err(ConfigError::Invalid(format!("models.{name}.dimension must be at least 1")));
            }
            if !m.threshold.is_finite() || m.threshold < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "models.{name}.threshold must be a non-negative number"
                )));
            }
        }
        self.model_spec()?;
        Ok(())
    }

    /// Built-in models plus `[models.*]` entries.
    pub fn registry(&self) -> ModelRegistry {
        let mut registry = ModelRegistry::builtin();
        for (name, m) in &self.models {
            registry.register(ModelSpec::new(name.clone(), m.dimension, m.metric, m.threshold));
        }
        registry
    }

    pub fn model_spec(&self) -> Result<ModelSpec, ConfigError> {
        self.registry()
            .resolve(&self.recognition.model_name)
            .cloned()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Loader that only accepts embeddings of the configured model's length.
    pub fn corpus_loader(&self) -> Result<CorpusLoader, ConfigError> {
        let spec = self.model_spec()?;
        Ok(CorpusLoader::new(&self.recognition.embedding_ext).with_dimension(spec.dimension))
    }

    pub fn detector(&self) -> DetectorBackend {
        DetectorBackend::new(self.recognition.detector_backend.clone())
    }

    pub fn ingest_gate(&self) -> QualityGate {
        QualityGate::new(self.recognition.min_face_size)
    }

    pub fn query_gate(&self) -> QualityGate {
        QualityGate::new(self.recognition.query_min_face_size)
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

/// Lowercase every table key, except the user-chosen entry names directly
/// under `[sources]`, `[projects]` and `[models]`.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Table(table) => Value::Table(
            table
                .into_iter()
                .map(|(key, v)| {
                    let key = key.to_lowercase();
                    let v = if NAMED_TABLES.contains(&key.as_str()) {
                        normalize_entries(v)
                    } else {
                        lowercase_all(v)
                    };
                    (key, v)
                })
                .collect(),
        ),
        other => other,
    }
}

fn normalize_entries(value: Value) -> Value {
    match value {
        Value::Table(table) => Value::Table(
            table
                .into_iter()
                .map(|(name, v)| (name, lowercase_all(v)))
                .collect(),
        ),
        other => other,
    }
}

fn lowercase_all(value: Value) -> Value {
    match value {
        Value::Table(table) => Value::Table(
            table
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_all(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_all).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[Recognition]
Model_Name = "ArcFace"
detector_backend = "scrfd"
WORKERS = 4

[sources.Local]
type = "filesystem"
Path = "/srv/photos"

[projects.Wedding2024]
source = "Local"
original_images = "wedding/originals"
resized_images = "wedding/resized"
EMBEDDINGS = "wedding/embeddings"

[models.TinyNet]
dimension = 64
metric = "euclidean_l2"
threshold = 0.8
"#;

    #[test]
    fn test_parse_normalizes_field_keys_only() {
        let s = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(s.recognition.model_name, "ArcFace");
        assert_eq!(s.recognition.workers, 4);
        assert_eq!(s.recognition.min_face_size, DEFAULT_MIN_FACE_SIZE);

        let project = &s.projects["Wedding2024"];
        assert_eq!(project.source, "Local");
        assert_eq!(project.embeddings, "wedding/embeddings");
        match &s.sources["Local"] {
            SourceSettings::Filesystem { path } => assert_eq!(path, Path::new("/srv/photos")),
        }
        s.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let s = Settings::from_toml_str("").unwrap();
        assert_eq!(s.recognition.model_name, "Facenet");
        assert_eq!(s.recognition.detector_backend, "yolov8");
        assert_eq!(s.recognition.embedding_ext, ".parq");
        assert!(s.recognition.skip_existing);
        assert_eq!(s.query_gate().min_face_size, 100.0);
        s.validate().unwrap();
    }

    #[test]
    fn test_registry_includes_configured_models() {
        let mut s = Settings::from_toml_str(SAMPLE).unwrap();
        s.recognition.model_name = "TinyNet".into();
        let spec = s.model_spec().unwrap();
        assert_eq!(spec.dimension, 64);
        assert_eq!(spec.metric, Metric::EuclideanL2);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FACEFIND_MODEL_NAME", "Facenet512"),
            ("FACEFIND_MIN_FACE_SIZE", "32"),
            ("FACEFIND_MAX_UPLOADS", "2"),
            ("FACEFIND_MODEL_DIR", "/opt/models"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(s.recognition.model_name, "Facenet512");
        assert_eq!(s.recognition.min_face_size, 32.0);
        assert_eq!(s.query.max_uploads, 2);
        assert_eq!(s.onnx.model_dir, Path::new("/opt/models"));
    }

    #[test]
    fn test_bad_env_value() {
        let mut s = Settings::default();
        let err = s
            .apply_overrides(|k| (k == "FACEFIND_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validation_errors() {
        let mut s = Settings::from_toml_str(SAMPLE).unwrap();
        s.recognition.workers = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::from_toml_str(SAMPLE).unwrap();
        s.projects.get_mut("Wedding2024").unwrap().source = "s3".into();
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.recognition.model_name = "NoSuchNet".into();
        assert!(s.validate().is_err());

        for threshold in [-0.1, f32::NAN, f32::INFINITY] {
            let mut s = Settings::from_toml_str(SAMPLE).unwrap();
            s.models.get_mut("TinyNet").unwrap().threshold = threshold;
            let err = s.validate().unwrap_err();
            assert!(err.to_string().contains("models.TinyNet.threshold"));
        }

        let mut s = Settings::from_toml_str(SAMPLE).unwrap();
        s.models.get_mut("TinyNet").unwrap().dimension = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("models.TinyNet.dimension"));
    }

    #[test]
    fn test_corpus_loader_uses_model_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::from_toml_str(SAMPLE).unwrap();
        let partition = facefind_store::Partition::new(s.detector(), "ArcFace");
        let store = facefind_store::EmbeddingStore::at(dir.path().to_path_buf(), partition.clone(), ".parq");
        let record = |name: &str, len: usize| facefind_core::FaceEmbedding {
            detection: facefind_core::FaceDetection {
                filename: name.to_string(),
                model_name: "ArcFace".to_string(),
                facial_area: facefind_core::FacialArea::new(0.0, 0.0, 40.0, 40.0),
                face_confidence: 0.9,
            },
            embedding: vec![0.1; len],
        };
        store.write(&store.path_for(Path::new("0stray.jpg")), &[record("0stray.jpg", 128)]).unwrap();
        store.write(&store.path_for(Path::new("b.jpg")), &[record("b.jpg", 512)]).unwrap();

        let corpus = s.corpus_loader().unwrap().load(dir.path(), &partition).unwrap();
        assert_eq!(corpus.dimension(), Some(512));
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.skipped().len(), 1);
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facefind.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.projects.len(), 1);
    }

    #[test]
    fn test_shipped_config_parses() {
        let s = Settings::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(s.recognition.model_name, "ArcFace");
        assert_eq!(s.detector().as_str(), "scrfd");
        assert_eq!(s.model_spec().unwrap().dimension, 512);
        s.validate().unwrap();
    }
}
