//! assetlift -- upload proxy server and command-line upload client.
//!
//! `assetlift serve` runs the `/upload` endpoint. `assetlift upload` sends
//! local files through a running backend and prints each file's public URL.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use assetlift::auth::CredentialProvider;
use assetlift::client::task::FileRef;
use assetlift::client::{HttpTransport, TaskStatus, UploadOrchestrator};
use assetlift::config::{Config, LoggingConfig, DEFAULT_BUCKET_NAME};
use assetlift::describe::{GeminiDescriber, ImageDescriber};
use assetlift::storage::backend::ObjectWriter;

/// Command-line arguments for assetlift.
#[derive(Parser, Debug)]
#[command(
    name = "assetlift",
    version,
    about = "Upload proxy for Google Cloud Storage"
)]
struct Cli {
    /// Path to the YAML configuration file. Environment variables are
    /// applied on top.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the upload server.
    Serve {
        /// Override the bind address (host:port).
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Upload files through a running server.
    Upload(UploadArgs),
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Backend base URL (defaults to BACKEND_URL or the config file).
    #[arg(long)]
    backend: Option<String>,

    /// Target bucket (defaults to GCP_BUCKET_NAME or the built-in default).
    #[arg(long)]
    bucket: Option<String>,

    /// Describe uploaded images with the configured model.
    #[arg(long)]
    describe: bool,

    /// Files to upload.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = assetlift::config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind } => {
            init_tracing(&config.logging, false);
            if let Some(path) = &cli.config {
                info!("Loaded configuration from {}", path.display());
            }
            serve(config, bind).await
        }
        Command::Upload(args) => {
            init_tracing(&config.logging, true);
            upload(config, args).await
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the config.
fn init_tracing(logging: &LoggingConfig, to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let writer = if to_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    }
}

async fn serve(config: Config, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr =
        bind.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Initialize Prometheus metrics recorder and register metric descriptions.
    assetlift::metrics::init_metrics()?;
    assetlift::metrics::describe_metrics();
    info!("Prometheus metrics initialized");

    let credentials = CredentialProvider::from_config(&config.credentials)?;
    info!("Credential source: {}", credentials.mode());

    let writer: Arc<dyn ObjectWriter> = match config.storage.backend.as_str() {
        "gcs" => Arc::new(assetlift::storage::gcs::GcsWriter::new(
            &config.storage,
            &config.credentials,
        )?),
        "memory" => {
            warn!("In-memory storage backend: uploads are not persisted");
            Arc::new(assetlift::storage::memory::MemoryWriter::new())
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected 'gcs' or 'memory')"),
    };

    match &config.bucket_name {
        Some(bucket) => info!("Default bucket: {}", bucket),
        None => warn!("GCP_BUCKET_NAME is not set; requests must name a bucket"),
    }

    let shutdown_grace = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(assetlift::AppState {
        config,
        credentials: Arc::new(credentials),
        writer,
    });
    let app = assetlift::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("assetlift listening on {}", bind_addr);

    // On SIGTERM/SIGINT stop accepting connections and give in-flight
    // uploads `shutdown_timeout` seconds to finish.
    let stopping = CancellationToken::new();
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let stopping = stopping.clone();
        async move {
            shutdown_signal().await;
            stopping.cancel();
        }
    });

    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            stopping.cancelled().await;
            tokio::time::sleep(shutdown_grace).await;
        } => warn!("In-flight requests still running after {:?}; exiting", shutdown_grace),
    }

    info!("assetlift shut down");
    Ok(())
}

async fn upload(config: Config, args: UploadArgs) -> anyhow::Result<()> {
    let backend = args.backend.unwrap_or(config.backend_base_url);
    let bucket = args
        .bucket
        .or(config.bucket_name)
        .unwrap_or_else(|| DEFAULT_BUCKET_NAME.to_string());

    let transport = HttpTransport::new(&backend, &config.client)?;
    info!("Uploading to {} (bucket {})", transport.endpoint(), bucket);

    let describer: Option<Arc<dyn ImageDescriber>> = if args.describe {
        GeminiDescriber::from_config(&config.ai)?.map(|d| Arc::new(d) as Arc<dyn ImageDescriber>)
    } else {
        None
    };

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let file = FileRef::from_path(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        files.push(file);
    }

    let orchestrator =
        UploadOrchestrator::new(Arc::new(transport), bucket).with_describer(describer);
    let ids = orchestrator.select_files(files);

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; cancelling uploads");
                for id in &ids {
                    orchestrator.cancel(*id);
                }
            }
        }
        let tasks = orchestrator.snapshot();
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Uploading) {
            info!(file = %task.file.name, "Uploading: {:.0}%", task.progress);
        }
        if tasks.iter().all(|t| t.status.is_terminal()) {
            break;
        }
    }
    orchestrator.wait().await;

    if args.describe {
        for id in &ids {
            if let Some(task) = orchestrator.task(*id) {
                if task.status == TaskStatus::Completed && task.file.is_image() {
                    orchestrator.describe(*id).await;
                }
            }
        }
    }

    let mut failed = 0usize;
    for task in orchestrator.snapshot() {
        match task.status {
            TaskStatus::Completed => {
                println!(
                    "{}\t{}",
                    task.file.name,
                    task.public_url.unwrap_or_default()
                );
                if let Some(description) = task.description {
                    println!("\t{}", description.trim());
                } else if let Some(error) = task.description_error {
                    println!("\t({error})");
                }
            }
            status => {
                failed += 1;
                let reason = task.error.unwrap_or_else(|| status.to_string());
                println!("{}\t{}: {}", task.file.name, status, reason);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} upload(s) did not complete", ids.len());
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
