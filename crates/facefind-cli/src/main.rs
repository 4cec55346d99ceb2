use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facefind_core::{DetectorBackend, FaceEmbeddingExtractor};
use facefind_ingest::processors::{DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH};
use facefind_ingest::{
    BatchIngestionPipeline, CancellationToken, EmbeddingProcessor, IngestError, ItemProcessor,
    LogObserver, PipelineConfig, ResizeProcessor, RunReport,
};
use facefind_models::backend::{ARCFACE_MODEL_FILE, SCRFD_MODEL_FILE};
use facefind_models::{OnnxFaceModel, SCRFD_BACKEND};
use facefind_service::project::open_store;
use facefind_service::{
    spawn_engine, CorpusSource, Project, QueryConfig, QueryService, ResolvedImage, Settings, Upload,
};
use facefind_store::fsutil::{default_image_extensions, extension_set};
use facefind_store::mirror::{download_prefix, upload_dir};
use facefind_store::{CorpusHandle, CorpusLoader, EmbeddingStore, MirrorReport, ObjectStore, Partition};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facefind", about = "Find people in photo collections by face")]
struct Cli {
    /// Config file (default: $FACEFIND_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BatchArgs {
    /// Directory of source images
    #[arg(long)]
    src: PathBuf,
    /// Output directory
    #[arg(long)]
    dst: PathBuf,
    /// Reprocess files whose output already exists
    #[arg(long)]
    no_skip_existing: bool,
    /// Stop at the first file that fails
    #[arg(long)]
    raise_errors: bool,
    /// Worker threads (default from config)
    #[arg(long)]
    workers: Option<usize>,
    /// Allowed file extension, repeatable (default: common image types)
    #[arg(long = "ext")]
    extensions: Vec<String>,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute and cache face embeddings for a directory of photos
    Ingest {
        #[command(flatten)]
        batch: BatchArgs,
        /// Recognition model (e.g. "ArcFace")
        #[arg(long)]
        model: Option<String>,
        /// Detector backend (e.g. "scrfd", "skip")
        #[arg(long)]
        detector: Option<String>,
    },
    /// Shrink photos for display, keeping aspect ratio
    Resize {
        #[command(flatten)]
        batch: BatchArgs,
        #[arg(long, default_value_t = DEFAULT_MAX_WIDTH)]
        max_width: u32,
        #[arg(long, default_value_t = DEFAULT_MAX_HEIGHT)]
        max_height: u32,
    },
    /// Search a project for photos of the people in the given pictures
    Find {
        /// Configured project to search
        #[arg(long)]
        project: Option<String>,
        /// Search this partition directory instead of a project
        #[arg(long, conflicts_with = "project")]
        embeddings: Option<PathBuf>,
        /// Photos showing one face each
        #[arg(required = true)]
        photos: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Copy files between a local directory and a configured source
    Mirror {
        #[command(subcommand)]
        action: MirrorAction,
    },
    /// List known recognition models
    Models,
    /// Show configuration and project status
    Status,
}

#[derive(Subcommand)]
enum MirrorAction {
    /// Upload a local directory under a key prefix
    Upload {
        /// Configured source name
        #[arg(long)]
        source: String,
        #[arg(long)]
        src: PathBuf,
        #[arg(long)]
        prefix: String,
        /// Allowed file extension, repeatable (default: all files)
        #[arg(long = "ext")]
        extensions: Vec<String>,
    },
    /// Download every object under a key prefix
    Download {
        /// Configured source name
        #[arg(long)]
        source: String,
        #[arg(long)]
        prefix: String,
        #[arg(long)]
        dst: PathBuf,
        /// Overwrite files already present locally
        #[arg(long)]
        no_skip_existing: bool,
    },
}

/// One search hit as printed.
#[derive(Serialize)]
struct FoundPhoto {
    filename: String,
    distance: f32,
    original: Option<String>,
    resized: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Ingest {
            batch,
            model,
            detector,
        } => ingest(&settings, batch, model, detector).await,
        Commands::Resize {
            batch,
            max_width,
            max_height,
        } => {
            let config = pipeline_config(&settings, &batch);
            let processor = ResizeProcessor::new(batch.dst.clone()).with_bounds(max_width, max_height);
            let report = run_batch(config, batch.src.clone(), processor).await?;
            print_report(&report, batch.json)
        }
        Commands::Find {
            project,
            embeddings,
            photos,
            json,
        } => find(&settings, project, embeddings, photos, json).await,
        Commands::Mirror { action } => mirror(&settings, action).await,
        Commands::Models => {
            models(&settings);
            Ok(())
        }
        Commands::Status => {
            status(&settings);
            Ok(())
        }
    }
}

fn pipeline_config(settings: &Settings, batch: &BatchArgs) -> PipelineConfig {
    let allowed_extensions = if batch.extensions.is_empty() {
        default_image_extensions()
    } else {
        extension_set(&batch.extensions)
    };
    PipelineConfig {
        allowed_extensions,
        skip_existing: settings.recognition.skip_existing && !batch.no_skip_existing,
        raise_errors: batch.raise_errors,
        workers: batch.workers.unwrap_or(settings.recognition.workers),
    }
}

async fn ingest(
    settings: &Settings,
    batch: BatchArgs,
    model: Option<String>,
    detector: Option<String>,
) -> Result<()> {
    let model_name = model.unwrap_or_else(|| settings.recognition.model_name.clone());
    let spec = settings.registry().resolve(&model_name)?.clone();
    let detector = detector
        .map(DetectorBackend::new)
        .unwrap_or_else(|| settings.detector());
    OnnxFaceModel::supports(&spec, &detector)?;

    let face_model = OnnxFaceModel::load(&settings.onnx.model_dir).with_context(|| {
        format!("failed to load face models from {}", settings.onnx.model_dir.display())
    })?;

    let partition = Partition::new(detector.clone(), spec.name.clone());
    let store = EmbeddingStore::new(&batch.dst, partition, &settings.recognition.embedding_ext);
    let out_dir = store.dir().to_path_buf();
    let extractor = FaceEmbeddingExtractor::new(spec, detector, settings.ingest_gate());
    let processor = EmbeddingProcessor::new(face_model, extractor, store);

    let config = pipeline_config(settings, &batch);
    let report = run_batch(config, batch.src.clone(), processor).await?;
    tracing::info!(dir = %out_dir.display(), "embeddings written");
    print_report(&report, batch.json)
}

/// Run `processor` over `src` on a blocking thread; Ctrl-C cancels the run.
async fn run_batch<P>(config: PipelineConfig, src: PathBuf, processor: P) -> Result<RunReport>
where
    P: ItemProcessor + Send + 'static,
{
    let pipeline = BatchIngestionPipeline::new(config)?;
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing files in flight");
            on_signal.cancel();
        }
    });

    let result = tokio::task::spawn_blocking(move || {
        pipeline.run(&src, &processor, &LogObserver, &cancel)
    })
    .await
    .context("pipeline task failed")?;
    signal.abort();

    match result {
        Ok(report) => Ok(report),
        Err(IngestError::Cancelled(report)) => {
            println!("{report}");
            bail!("cancelled");
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{report}");
    for failure in &report.failures {
        println!("  failed: {}: {}", failure.path.display(), failure.message);
    }
    Ok(())
}

async fn find(
    settings: &Settings,
    project: Option<String>,
    embeddings: Option<PathBuf>,
    photos: Vec<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = QueryConfig::from_settings(settings)?;
    OnnxFaceModel::supports(&config.spec, &config.detector)?;
    let partition = Partition::new(config.detector.clone(), config.spec.name.clone());
    let loader = settings.corpus_loader()?;

    let (corpus, project) = match embeddings {
        Some(dir) => {
            let corpus = CorpusSource::new(dir, partition, loader).load()?;
            (Arc::new(CorpusHandle::new(corpus)), None)
        }
        None => {
            let project = open_project(settings, project.as_deref(), &partition, &loader)?;
            (project.corpus(), Some(project))
        }
    };

    let mut uploads = Vec::with_capacity(photos.len());
    for path in &photos {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        uploads.push(Upload::new(name, bytes));
    }

    let face_model = OnnxFaceModel::load(&settings.onnx.model_dir)?;
    let engine = spawn_engine(Box::new(face_model))?;
    let service = QueryService::new(engine, corpus, config);
    let rows = service.find(uploads).await?;

    let found: Vec<FoundPhoto> = rows
        .into_iter()
        .map(|row| {
            let ResolvedImage { original, resized } = match &project {
                Some(p) => p.resolve(&row.filename),
                None => ResolvedImage {
                    original: None,
                    resized: None,
                },
            };
            FoundPhoto {
                filename: row.filename,
                distance: row.distance,
                original,
                resized,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else if found.is_empty() {
        println!("No matching photos.");
    } else {
        for photo in &found {
            println!(
                "{:.4}  {}  {}",
                photo.distance,
                photo.filename,
                photo.resized.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

/// The named project, or the only configured one.
fn open_project(
    settings: &Settings,
    name: Option<&str>,
    partition: &Partition,
    loader: &CorpusLoader,
) -> Result<Project> {
    let name = match name {
        Some(n) => n.to_string(),
        None if settings.projects.len() == 1 => {
            settings.projects.keys().next().cloned().unwrap_or_default()
        }
        None => bail!("pass --project or --embeddings ({} projects configured)", settings.projects.len()),
    };
    let project = settings
        .projects
        .get(&name)
        .with_context(|| format!("unknown project {name}"))?;
    let source = settings
        .sources
        .get(&project.source)
        .with_context(|| format!("unknown source {}", project.source))?;
    let store = open_store(source);
    Ok(Project::open(
        &name,
        project,
        store.as_ref(),
        partition,
        loader,
        &settings.service.cache_dir,
    )?)
}

async fn mirror(settings: &Settings, action: MirrorAction) -> Result<()> {
    let source_name = match &action {
        MirrorAction::Upload { source, .. } | MirrorAction::Download { source, .. } => source.clone(),
    };
    let source = settings
        .sources
        .get(&source_name)
        .with_context(|| format!("unknown source {source_name}"))?;
    let store: Box<dyn ObjectStore> = open_store(source);

    let report: MirrorReport = tokio::task::spawn_blocking(move || match action {
        MirrorAction::Upload {
            src,
            prefix,
            extensions,
            ..
        } => upload_dir(store.as_ref(), &src, &prefix, &extension_set(&extensions)),
        MirrorAction::Download {
            prefix,
            dst,
            no_skip_existing,
            ..
        } => download_prefix(store.as_ref(), &prefix, &dst, !no_skip_existing),
    })
    .await
    .context("mirror task failed")??;

    println!(
        "{} transferred, {} skipped, {} failed",
        report.transferred,
        report.skipped,
        report.failed.len()
    );
    for (key, error) in &report.failed {
        println!("  failed: {key}: {error}");
    }
    if !report.failed.is_empty() {
        bail!("{} transfers failed", report.failed.len());
    }
    Ok(())
}

fn models(settings: &Settings) {
    let onnx_detector = DetectorBackend::new(SCRFD_BACKEND);
    println!("{:<14} {:>5}  {:<12} {:>9}  onnx", "model", "dim", "metric", "threshold");
    for spec in settings.registry().iter() {
        let marker = if spec.name == settings.recognition.model_name { "*" } else { " " };
        let onnx = if OnnxFaceModel::supports(spec, &onnx_detector).is_ok() { "yes" } else { "" };
        println!(
            "{:<14} {:>5}  {:<12} {:>9.3}  {onnx} {marker}",
            spec.name,
            spec.dimension,
            spec.metric.as_str(),
            spec.threshold
        );
    }
}

fn status(settings: &Settings) {
    let r = &settings.recognition;
    println!("model:     {} (detector {})", r.model_name, r.detector_backend);
    println!("min face:  {} ingest, {} query", r.min_face_size, r.query_min_face_size);
    println!("workers:   {}", r.workers);

    let dir = &settings.onnx.model_dir;
    for file in [SCRFD_MODEL_FILE, ARCFACE_MODEL_FILE] {
        println!("onnx:      {} {}", dir.join(file).display(), presence(&dir.join(file)));
    }

    if settings.projects.is_empty() {
        println!("projects:  none configured");
        return;
    }
    let loader = match settings.corpus_loader() {
        Ok(loader) => loader,
        Err(e) => {
            println!("projects:  unavailable: {e}");
            return;
        }
    };
    let partition = Partition::new(settings.detector(), r.model_name.clone());
    for name in settings.projects.keys() {
        match open_project(settings, Some(name), &partition, &loader) {
            Ok(project) => println!(
                "project:   {project:?} {} embeddings",
                project.corpus().snapshot().len()
            ),
            Err(e) => println!("project:   {name} unavailable: {e:#}"),
        }
    }
}

fn presence(path: &Path) -> &'static str {
    if path.is_file() {
        "(present)"
    } else {
        "(missing)"
    }
}
