use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceswap_core::codec;
use faceswap_core::enroll::{
    collect_dataset_images, dataset_name_from_archive, is_dataset_archive, read_dataset_archive,
};
use faceswap_core::{
    EmbeddingStore, FacePipeline, IdentityRef, ModelProvider, OnnxModelLoader, PipelineError,
    SafetensorsStore,
};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "faceswap", about = "Swap faces in images with a stored identity")]
struct Cli {
    /// TOML configuration file (defaults to $FACESWAP_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and store an identity from sample images
    Enroll {
        /// Identity name (defaults to the stem of the first .zip dataset)
        #[arg(short, long)]
        name: Option<String>,
        /// Image files, directories (searched recursively) or .zip datasets
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Replace every face in the inputs with a stored identity
    Swap {
        /// Stored identity name
        #[arg(short, long)]
        identity: String,
        /// Image files, data:image URIs or http(s) URLs
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Directory for swapped images
        #[arg(long, conflicts_with = "output")]
        out_dir: Option<PathBuf>,
        /// Output file (single input only)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print results as data URIs instead of writing files
        #[arg(long, conflicts_with_all = ["output", "out_dir"])]
        data_uri: bool,
    },
    /// List stored identities
    List,
    /// Show a stored identity as JSON
    Inspect {
        name: String,
    },
    /// Remove a stored identity
    Remove {
        name: String,
    },
    /// Download every model artifact into the cache
    FetchModels,
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { name, paths } => {
            let pipeline = build_pipeline(&config);
            let record = tokio::task::spawn_blocking(move || {
                let name = match name {
                    Some(name) => name,
                    None => default_identity_name(&paths)?,
                };
                let samples = expand_paths(&paths)?;
                if samples.is_empty() {
                    bail!("no images found in the given paths");
                }
                tracing::info!(
                    name = %name,
                    archived = samples.archived.len(),
                    files = samples.files.len(),
                    "enrolling identity"
                );
                let images = samples
                    .archived
                    .into_iter()
                    .chain(samples.files.into_iter().filter_map(|path| read_image(&path)));
                pipeline
                    .enroll_identity(&name, images)
                    .with_context(|| format!("enrolling {name:?}"))
            })
            .await??;
            println!(
                "Enrolled {} from {} sample(s)",
                record.name, record.samples
            );
        }
        Commands::Swap {
            identity,
            inputs,
            out_dir,
            output,
            data_uri,
        } => {
            if output.is_some() && inputs.len() != 1 {
                bail!("--output requires exactly one input; use --out-dir for several");
            }
            let pipeline = Arc::new(build_pipeline(&config));
            let identity = IdentityRef::Stored(identity);

            let mut tasks = Vec::with_capacity(inputs.len());
            for (index, input) in inputs.into_iter().enumerate() {
                let pipeline = pipeline.clone();
                let identity = identity.clone();
                tasks.push(tokio::task::spawn_blocking(move || {
                    let result = load_input(&input)
                        .and_then(|image| pipeline.swap_faces(&image, &identity));
                    (index, input, result)
                }));
            }

            let mut failures = 0usize;
            for task in tasks {
                let (index, input, result) = task.await?;
                let swapped = match result {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::error!(input = %preview(&input), error = %e, "swap failed");
                        eprintln!("{}: processing failed: {e}", preview(&input));
                        failures += 1;
                        continue;
                    }
                };

                if data_uri {
                    println!("{}", codec::encode_data_uri(&swapped)?);
                    continue;
                }
                let target = match &output {
                    Some(path) => path.clone(),
                    None => {
                        let dir = out_dir.clone().unwrap_or_else(|| PathBuf::from("."));
                        dir.join(output_file_name(&input, index))
                    }
                };
                write_jpeg(&target, &swapped)?;
                println!("{}", target.display());
            }

            if failures > 0 {
                bail!("{failures} input(s) failed");
            }
        }
        Commands::List => {
            let store = SafetensorsStore::new(&config.store_dir);
            let names = store.list()?;
            if names.is_empty() {
                println!("No identities stored in {}", config.store_dir.display());
            }
            for name in names {
                println!("{name}");
            }
        }
        Commands::Inspect { name } => {
            let store = SafetensorsStore::new(&config.store_dir);
            let record = store.load(&name).map_err(PipelineError::from)?;
            let embedding = record.vector.embedding();
            let summary = serde_json::json!({
                "name": record.name,
                "dim": embedding.dim(),
                "norm": embedding.norm(),
                "normalized": record.vector.is_normalized(),
                "samples": record.samples,
                "created_at": record.created_at,
                "model_version": record.model_version,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Remove { name } => {
            let store = SafetensorsStore::new(&config.store_dir);
            store.remove(&name).map_err(PipelineError::from)?;
            println!("Removed {name}");
        }
        Commands::FetchModels => {
            let loader = OnnxModelLoader::new(config.models.clone());
            let paths = tokio::task::spawn_blocking(move || loader.fetch_all()).await??;
            for path in paths {
                println!("{}", path.display());
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn build_pipeline(config: &Config) -> FacePipeline {
    let provider = Arc::new(ModelProvider::new(OnnxModelLoader::new(config.models.clone())));
    let store: Arc<dyn EmbeddingStore> = Arc::new(SafetensorsStore::new(&config.store_dir));
    FacePipeline::new(provider, store)
        .with_compositor(config.compositor)
        .with_isolation(config.isolation)
}

/// Files are read from disk; anything else goes through the URI/URL decoder.
fn load_input(input: &str) -> Result<RgbImage, PipelineError> {
    let path = Path::new(input);
    if path.is_file() {
        let bytes = std::fs::read(path)
            .map_err(|e| PipelineError::UnsupportedInput(format!("{input}: {e}")))?;
        return Ok(codec::decode_image_bytes(&bytes)?);
    }
    Ok(codec::decode_image_input(input)?)
}

/// Enrollment samples: images decoded from .zip datasets plus files still to be read.
#[derive(Default)]
struct Samples {
    archived: Vec<RgbImage>,
    files: Vec<PathBuf>,
}

impl Samples {
    fn is_empty(&self) -> bool {
        self.archived.is_empty() && self.files.is_empty()
    }
}

fn expand_paths(paths: &[PathBuf]) -> Result<Samples> {
    let mut samples = Samples::default();
    for path in paths {
        if path.is_dir() {
            samples.files.extend(
                collect_dataset_images(path)
                    .with_context(|| format!("scanning {}", path.display()))?,
            );
        } else if is_dataset_archive(path) {
            samples.archived.extend(
                read_dataset_archive(path)
                    .with_context(|| format!("reading dataset {}", path.display()))?,
            );
        } else {
            samples.files.push(path.clone());
        }
    }
    Ok(samples)
}

/// Name a dataset after its archive when `--name` is omitted.
fn default_identity_name(paths: &[PathBuf]) -> Result<String> {
    paths
        .iter()
        .filter(|path| is_dataset_archive(path))
        .find_map(|path| dataset_name_from_archive(path))
        .context("--name is required unless a .zip dataset is given")
}

fn read_image(path: &Path) -> Option<RgbImage> {
    match image::open(path) {
        Ok(image) => Some(image.to_rgb8()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
            None
        }
    }
}

fn write_jpeg(path: &Path, image: &RgbImage) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = codec::encode_jpeg(image)?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

/// `<stem>_swapped.jpg` for file inputs, `swapped_<index>.jpg` otherwise.
fn output_file_name(input: &str, index: usize) -> String {
    let path = Path::new(input);
    let is_remote = input.starts_with("data:") || input.contains("://");
    match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !is_remote => format!("{stem}_swapped.jpg"),
        _ => format!("swapped_{index}.jpg"),
    }
}

/// Short form of an input for diagnostics; data URIs can be megabytes long.
fn preview(input: &str) -> String {
    if input.len() <= 64 {
        return input.to_string();
    }
    let head: String = input.chars().take(48).collect();
    format!("{head}...")
}
