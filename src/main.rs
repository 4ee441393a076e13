use std::path::{Path, PathBuf};
use std::sync::Arc;

use anomaly_engine::config::LeaseBackendKind;
use anomaly_engine::engine::lease_backend_for;
use anomaly_engine::ingest::UploadOptions;
use anomaly_engine::job::types::JobConfig;
use anomaly_engine::store::InMemoryResultStore;
use anomaly_engine::validation::ConfigValidator;
use anomaly_engine::{Engine, EngineConfig};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use clap::{Args, Parser, Subcommand};
use futures::Stream;
use tokio::io::AsyncReadExt;

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "anomaly-engine", version, about = "Anomaly-detection job control plane")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct NodeArgs {
    /// Overrides ENGINE_NODE_ID.
    #[arg(long, global = true)]
    node_id: Option<String>,
    /// Overrides ENGINE_JOBS_DIR.
    #[arg(long, global = true)]
    jobs_dir: Option<PathBuf>,
    /// `memory` or `file`.
    #[arg(long, global = true)]
    lease_backend: Option<String>,
    #[arg(long, global = true)]
    lease_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load job configs, start their schedulers and run until interrupted.
    Serve,
    /// Stream a data file into a job from the jobs directory, then close it.
    Upload { job_id: String, path: PathBuf },
    /// Check a job config file without creating the job.
    Validate { path: PathBuf },
}

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,anomaly_engine=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn apply_overrides(config: &mut EngineConfig, args: NodeArgs) -> Result<()> {
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(dir) = args.jobs_dir {
        config.jobs_dir = dir;
    }
    if let Some(kind) = args.lease_backend {
        config.lease_backend = LeaseBackendKind::parse(&kind)
            .with_context(|| format!("--lease-backend must be 'memory' or 'file', got '{kind}'"))?;
    }
    if let Some(dir) = args.lease_dir {
        config.lease_dir = dir;
    }
    Ok(())
}

fn node(config: EngineConfig) -> Engine {
    let leases = lease_backend_for(&config);
    Engine::new(config, Arc::new(InMemoryResultStore::new()), leases)
}

async fn serve(config: EngineConfig) -> Result<()> {
    let jobs_dir = config.jobs_dir.clone();
    let engine = node(config);
    engine.start();

    let loaded = engine.load_jobs(&jobs_dir).await?;
    let schedulers = engine.start_schedulers().await?;
    tracing::info!(
        node_id = %engine.node_id(),
        jobs = loaded,
        schedulers,
        "anomaly engine running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    engine.shutdown().await?;
    Ok(())
}

fn file_chunks(file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    futures::stream::unfold(Some(file), |file| async move {
        let mut file = file?;
        let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
        match file.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(file))),
            Err(err) => Some((Err(err), None)),
        }
    })
}

async fn upload(config: EngineConfig, job_id: &str, path: &Path) -> Result<()> {
    let jobs_dir = config.jobs_dir.clone();
    let engine = node(config);
    engine.load_jobs(&jobs_dir).await?;
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    let counts = engine
        .upload(job_id, file_chunks(file), UploadOptions::default())
        .await
        .with_context(|| format!("upload into job '{job_id}' failed"))?;
    engine.close(job_id).await?;
    let job = engine.get_job(job_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "jobId": job.id,
            "counts": counts,
            "bucketCount": job.counts.bucket_count,
        }))?
    );
    engine.shutdown().await?;
    Ok(())
}

async fn validate(path: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: JobConfig =
        serde_json::from_str(&text).with_context(|| format!("invalid job config in {}", path.display()))?;
    ConfigValidator.validate(&config)?;
    println!("{} is a valid job config", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    apply_overrides(&mut config, cli.node)?;
    init_tracing()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Upload { job_id, path } => upload(config, &job_id, &path).await,
        Commands::Validate { path } => validate(&path).await,
    }
}
