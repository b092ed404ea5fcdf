use crate::cache::{CacheStore, FileCacheStore, MemoryCacheStore};
use crate::config::Config;
use crate::engine::DockerCliEngine;
use crate::enricher::TriggersAnnotationEnricher;
use crate::orchestrator::BuildService;
use crate::pull::ImagePullManager;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

mod cache;
mod config;
mod dockerfile;
mod engine;
mod enricher;
mod generator;
mod image_config;
mod image_reference;
mod manifest;
mod orchestrator;
mod pull;
mod secret_string;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "kube-imagebuild")]
#[command(about = "Build project images and annotate Kubernetes manifests with image triggers")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "kube-imagebuild.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and tag all configured images
    Build,
    /// Add image change triggers to the generated manifests
    Enrich,
    /// Build, then enrich
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    info!("Starting kube-imagebuild {}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&cli.config)?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, cancelling running builds");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Build => build(&config, &cancel).await,
        Commands::Enrich => enrich(&config),
        Commands::Run => {
            build(&config, &cancel).await?;
            enrich(&config)
        }
    }
}

async fn build(config: &Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    let images = match &config.project {
        Some(project) => generator::generate(
            &generator::default_generators(),
            project,
            config.images.clone(),
        ),
        None => config.images.clone(),
    };
    if images.is_empty() {
        warn!("No images configured and no generator applies, nothing to build");
        return Ok(());
    }

    let cache: Arc<dyn CacheStore> = match &config.build.cache_file {
        Some(path) => {
            let store = FileCacheStore::open(path).context("Failed to open pull cache")?;
            info!("Using pull cache {}", store.path().display());
            Arc::new(store)
        }
        None => Arc::new(MemoryCacheStore::new()),
    };
    let pull_manager =
        ImagePullManager::new(cache, config.build.pull_policy, config.build.auto_pull);
    let service = BuildService::new(
        Arc::new(DockerCliEngine::new(config.build.engine.clone())),
        Arc::new(pull_manager),
        config.build.build_context(),
    );
    info!(
        "Building {} images with pull policy {} (auto pull mode {:?})",
        images.len(),
        service.pull_manager().policy(),
        service.pull_manager().auto_pull_mode()
    );
    let results = service
        .build_all(&images, config.build.concurrency, cancel)
        .await;

    let mut failed = Vec::new();
    for (name, result) in results {
        if let Err(e) = result {
            error!("Image {} failed: {}", name, e);
            failed.push(name);
        }
    }
    if !failed.is_empty() {
        anyhow::bail!("Failed to build images: {}", failed.join(", "));
    }
    Ok(())
}

fn enrich(config: &Config) -> anyhow::Result<()> {
    let enricher =
        TriggersAnnotationEnricher::new(info_span!("enricher", name = "triggers-annotation"));
    let summary = manifest::enrich_manifests(
        &config.manifests.dir,
        &config.manifests.include,
        &enricher,
    )?;
    info!(
        "Annotated {} workloads in {} manifest files",
        summary.annotated, summary.files
    );
    if !summary.failed.is_empty() {
        let failed: Vec<String> = summary
            .failed
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        anyhow::bail!("Failed to enrich manifests: {}", failed.join(", "));
    }
    Ok(())
}
