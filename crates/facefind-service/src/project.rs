//! Configured photo projects: their image listings and loaded corpus.

use crate::config::{ConfigError, ProjectSettings, Settings, SourceSettings};
use crate::query::CorpusSource;
use facefind_store::mirror::download_prefix;
use facefind_store::{
    CorpusError, CorpusHandle, CorpusLoader, FilesystemStore, MirrorError, ObjectStore, Partition,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("project {project} uses unknown source {source_name}")]
    UnknownSource { project: String, source_name: String },
    #[error("project {project}: no {what} objects found")]
    Empty { project: String, what: &'static str },
    #[error("project {project}: {source}")]
    Mirror {
        project: String,
        #[source]
        source: MirrorError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("project {project}: {source}")]
    Corpus {
        project: String,
        #[source]
        source: CorpusError,
    },
}

/// Object keys of a search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub original: Option<String>,
    pub resized: Option<String>,
}

/// One project with its corpus loaded.
pub struct Project {
    name: String,
    settings: ProjectSettings,
    original_images: BTreeSet<String>,
    resized_images: BTreeSet<String>,
    embedding_files: usize,
    corpus: Arc<CorpusHandle>,
    source: CorpusSource,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Project {} ({}/{}/{})>",
            self.name,
            self.original_images.len(),
            self.resized_images.len(),
            self.embedding_files
        )
    }
}

impl Project {
    /// List the project's objects in `store` and load its corpus.
    ///
    /// Embeddings are read in place when the store is a local directory,
    /// otherwise mirrored to `cache_dir/<project>/embeddings` first.
    pub fn open(
        name: &str,
        settings: &ProjectSettings,
        store: &dyn ObjectStore,
        partition: &Partition,
        loader: &CorpusLoader,
        cache_dir: &Path,
    ) -> Result<Self, ProjectError> {
        let list = |what: &'static str, prefix: &str| -> Result<Vec<String>, ProjectError> {
            let keys = store.list(prefix).map_err(|source| ProjectError::Mirror {
                project: name.to_string(),
                source,
            })?;
            if keys.is_empty() {
                return Err(ProjectError::Empty {
                    project: name.to_string(),
                    what,
                });
            }
            Ok(keys)
        };

        let original_images: BTreeSet<String> =
            list("original_images", &settings.original_images)?.into_iter().collect();
        let resized_images: BTreeSet<String> =
            list("resized_images", &settings.resized_images)?.into_iter().collect();
        let embedding_keys = list("embeddings", &settings.embeddings)?;

        let embeddings_dir = match store.local_root() {
            Some(root) => root.join(settings.embeddings.trim_matches('/')),
            None => {
                let dir = cache_dir.join(name).join("embeddings");
                download_prefix(store, &settings.embeddings, &dir, true).map_err(|source| {
                    ProjectError::Mirror {
                        project: name.to_string(),
                        source,
                    }
                })?;
                dir
            }
        };

        let source = CorpusSource::new(embeddings_dir, partition.clone(), loader.clone());
        let corpus = source.load().map_err(|source| ProjectError::Corpus {
            project: name.to_string(),
            source,
        })?;

        let project = Self {
            name: name.to_string(),
            settings: settings.clone(),
            original_images,
            resized_images,
            embedding_files: embedding_keys.len(),
            corpus: Arc::new(CorpusHandle::new(corpus)),
            source,
        };
        tracing::info!(project = ?project, "project loaded");
        Ok(project)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn corpus(&self) -> Arc<CorpusHandle> {
        Arc::clone(&self.corpus)
    }

    pub fn corpus_source(&self) -> &CorpusSource {
        &self.source
    }

    pub fn original_images(&self) -> &BTreeSet<String> {
        &self.original_images
    }

    pub fn resized_images(&self) -> &BTreeSet<String> {
        &self.resized_images
    }

    /// Map a corpus filename (path relative to the ingested directory) to
    /// the stored original and resized images, where they exist.
    pub fn resolve(&self, filename: &str) -> ResolvedImage {
        let lookup = |prefix: &str, keys: &BTreeSet<String>| {
            let key = join_key(prefix, filename);
            keys.contains(&key).then_some(key)
        };
        ResolvedImage {
            original: lookup(&self.settings.original_images, &self.original_images),
            resized: lookup(&self.settings.resized_images, &self.resized_images),
        }
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Every configured project, loaded.
#[derive(Debug, Default)]
pub struct ProjectCatalog {
    projects: BTreeMap<String, Project>,
}

impl ProjectCatalog {
    pub fn open(settings: &Settings, partition: &Partition) -> Result<Self, ProjectError> {
        let loader = settings.corpus_loader()?;
        let mut projects = BTreeMap::new();

        for (name, project) in &settings.projects {
            let source = settings
                .sources
                .get(&project.source)
                .ok_or_else(|| ProjectError::UnknownSource {
                    project: name.clone(),
                    source_name: project.source.clone(),
                })?;
            let store = open_store(source);
            let loaded = Project::open(
                name,
                project,
                store.as_ref(),
                partition,
                &loader,
                &settings.service.cache_dir,
            )?;
            projects.insert(name.clone(), loaded);
        }
        Ok(Self { projects })
    }

    pub fn get(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

pub fn open_store(source: &SourceSettings) -> Box<dyn ObjectStore> {
    match source {
        SourceSettings::Filesystem { path } => Box::new(FilesystemStore::new(path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facefind_core::{DetectorBackend, FaceDetection, FaceEmbedding, FacialArea};
    use facefind_store::EmbeddingStore;
    use std::fs;

    fn partition() -> Partition {
        Partition::new(DetectorBackend::new("yolov8"), "Facenet")
    }

    fn record(filename: &str) -> FaceEmbedding {
        FaceEmbedding {
            detection: FaceDetection {
                filename: filename.to_string(),
                model_name: "Facenet".to_string(),
                facial_area: FacialArea::new(0.0, 0.0, 50.0, 50.0),
                face_confidence: 0.9,
            },
            embedding: vec![0.5; 128],
        }
    }

    /// Lay out a project under `root` the way ingestion and upload leave it.
    fn seed(root: &Path) {
        for key in ["orig/a.jpg", "orig/b.jpg", "resized/a.jpg"] {
            let path = root.join(key);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"jpeg").unwrap();
        }
        let store = EmbeddingStore::at(root.join("emb"), partition(), ".parq");
        store.write(&store.path_for(Path::new("a.jpg")), &[record("a.jpg")]).unwrap();
        store.write(&store.path_for(Path::new("b.jpg")), &[record("b.jpg")]).unwrap();
    }

    fn project_settings() -> ProjectSettings {
        ProjectSettings {
            source: "local".into(),
            original_images: "orig".into(),
            resized_images: "resized".into(),
            embeddings: "emb".into(),
        }
    }

    fn settings(root: &Path) -> Settings {
        let text = format!(
            r#"
            [sources.local]
            type = "filesystem"
            path = "{}"

            [projects.Wedding]
            source = "local"
            original_images = "orig"
            resized_images = "resized"
            embeddings = "emb"
            "#,
            root.display()
        );
        Settings::from_toml_str(&text).unwrap()
    }

    #[test]
    fn test_catalog_loads_filesystem_project() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());

        let catalog = ProjectCatalog::open(&settings(dir.path()), &partition()).unwrap();
        assert_eq!(catalog.len(), 1);
        let project = catalog.get("Wedding").unwrap();
        assert_eq!(project.original_images().len(), 2);
        assert_eq!(project.resized_images().len(), 1);
        assert_eq!(project.corpus().snapshot().len(), 2);
        assert_eq!(project.corpus_source().dir(), dir.path().join("emb"));
    }

    #[test]
    fn test_resolve_match() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let catalog = ProjectCatalog::open(&settings(dir.path()), &partition()).unwrap();
        let project = catalog.get("Wedding").unwrap();

        assert_eq!(
            project.resolve("a.jpg"),
            ResolvedImage {
                original: Some("orig/a.jpg".into()),
                resized: Some("resized/a.jpg".into()),
            }
        );
        assert_eq!(project.resolve("b.jpg").resized, None);
        assert_eq!(project.resolve("zzz.jpg").original, None);
    }

    #[test]
    fn test_empty_listing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        fs::remove_dir_all(dir.path().join("resized")).unwrap();

        let err = ProjectCatalog::open(&settings(dir.path()), &partition()).unwrap_err();
        assert!(matches!(err, ProjectError::Empty { what: "resized_images", .. }));
    }

    /// Filesystem store that hides its root, so embeddings must be mirrored.
    struct Remote(FilesystemStore);

    impl ObjectStore for Remote {
        fn list(&self, prefix: &str) -> Result<Vec<String>, MirrorError> {
            self.0.list(prefix)
        }
        fn download(&self, key: &str, local: &Path) -> Result<(), MirrorError> {
            self.0.download(key, local)
        }
        fn upload(&self, local: &Path, key: &str) -> Result<(), MirrorError> {
            self.0.upload(local, key)
        }
    }

    #[test]
    fn test_remote_embeddings_are_mirrored() {
        let bucket = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        seed(bucket.path());

        let remote = Remote(FilesystemStore::new(bucket.path()));
        let project = Project::open(
            "Wedding",
            &project_settings(),
            &remote,
            &partition(),
            &CorpusLoader::new(".parq"),
            cache.path(),
        )
        .unwrap();

        let local = cache.path().join("Wedding").join("embeddings");
        assert_eq!(project.corpus_source().dir(), local);
        assert!(local.join("a.parq").is_file());
        assert_eq!(project.corpus().snapshot().len(), 2);
    }
}
