//! ShardVault command line
//!
//! ```text
//! shardvault node --id node1 --data-dir /var/lib/shardvault --listen 0.0.0.0:9001
//! shardvault serve                     # engine with GC, health probes, /metrics
//! shardvault bucket create photos      # one-shot commands against the
//! shardvault put photos cat.jpg ./cat.jpg   # metadata file and node pool
//! shardvault get photos cat.jpg -o out.jpg
//! ```
//!
//! One-shot commands load the metadata snapshot, run against the storage
//! nodes, and save the snapshot again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shardvault::adapters::{ChannelEventPublisher, HttpShardTransport, LoggingEventPublisher};
use shardvault::config::parse_storage_nodes;
use shardvault::domain::ports::{Node, Quota, TOTAL_SHARDS};
use shardvault::metrics::EngineMetrics;
use shardvault::node::{FsShardStore, NodeServer};
use shardvault::registry::NodeRegistry;
use shardvault::{EngineConfig, StorageEngine, UploadOptions};

// =============================================================================
// CLI Arguments
// =============================================================================

/// ShardVault - erasure-coded, deduplicated object storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage nodes as `id[@region]:url`, comma separated
    #[arg(long, env = "STORAGE_NODES", global = true)]
    storage_nodes: Option<String>,

    /// Metadata snapshot file
    #[arg(
        long,
        env = "SHARDVAULT_METADATA",
        default_value = "shardvault-metadata.json",
        global = true
    )]
    metadata: PathBuf,

    /// YAML engine configuration
    #[arg(long, env = "SHARDVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a storage node
    Node {
        /// Node id reported in the shard inventory
        #[arg(long, env = "NODE_ID")]
        id: String,
        /// Directory holding shard files
        #[arg(long, env = "NODE_DATA_DIR")]
        data_dir: PathBuf,
        #[arg(long, env = "NODE_LISTEN", default_value = "0.0.0.0:9001")]
        listen: String,
    },
    /// Run the engine with background GC, health probes and metrics
    Serve {
        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: String,
        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
        health_addr: String,
        /// Seconds between metadata snapshots
        #[arg(long, default_value = "60")]
        snapshot_interval_secs: u64,
    },
    /// Manage buckets
    Bucket {
        #[command(subcommand)]
        action: BucketAction,
    },
    /// Upload a file
    Put {
        bucket: String,
        key: String,
        file: PathBuf,
        /// Prefer nodes in this region
        #[arg(long)]
        region: Option<String>,
    },
    /// Download an object
    Get {
        bucket: String,
        key: String,
        #[arg(long)]
        version: Option<String>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a version (the latest by default)
    Rm {
        bucket: String,
        key: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// List the latest version of every key
    Ls { bucket: String },
    /// List every version of a key
    Versions { bucket: String, key: String },
    /// Run the garbage collector once
    Gc {
        /// Also reconcile node inventories
        #[arg(long)]
        orphans: bool,
    },
    /// Show dedup, node and GC statistics
    Stats,
}

#[derive(Subcommand, Debug)]
enum BucketAction {
    Create {
        name: String,
        /// Keep only the latest version of each key
        #[arg(long)]
        no_versioning: bool,
        #[arg(long)]
        max_bytes: Option<u64>,
        #[arg(long)]
        max_objects: Option<u64>,
    },
    Delete {
        name: String,
    },
    Versioning {
        name: String,
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    Usage {
        name: String,
    },
    List,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match args.command {
        Command::Node {
            ref id,
            ref data_dir,
            ref listen,
        } => run_node(id, data_dir, listen).await,
        Command::Serve {
            ref metrics_addr,
            ref health_addr,
            snapshot_interval_secs,
        } => {
            let engine = open_engine(&args, config).await?;
            serve(
                engine,
                &args.metadata,
                metrics_addr,
                health_addr,
                Duration::from_secs(snapshot_interval_secs.max(1)),
            )
            .await
        }
        _ => {
            let engine = open_engine(&args, config).await?;
            engine.health_monitor().check_once().await;
            run_command(&engine, args.command).await?;
            engine
                .save_metadata(&args.metadata)
                .await
                .context("saving metadata")?;
            Ok(())
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn", "reqwest=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so command output on stdout stays clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Engine
// =============================================================================

fn resolve_nodes(args: &Args, config: &EngineConfig) -> anyhow::Result<Vec<Node>> {
    let nodes = match &args.storage_nodes {
        Some(list) => parse_storage_nodes(list)?,
        None => config.configured_nodes(),
    };
    if nodes.is_empty() {
        bail!("no storage nodes configured; set STORAGE_NODES or list nodes in the config file");
    }
    if nodes.len() < TOTAL_SHARDS {
        warn!(
            nodes = nodes.len(),
            "fewer than {} storage nodes; uploads will fail", TOTAL_SHARDS
        );
    }
    Ok(nodes)
}

async fn open_engine(args: &Args, config: EngineConfig) -> anyhow::Result<Arc<StorageEngine>> {
    let nodes = resolve_nodes(args, &config)?;
    let transport = Arc::new(HttpShardTransport::new(config.coordinator.shard_timeout())?);
    let (events, _drain) = ChannelEventPublisher::spawn(
        Arc::new(LoggingEventPublisher::info_level()),
        config.event_queue_capacity,
    );

    let engine = StorageEngine::new(config, nodes, transport, Arc::new(events))?;
    let loaded = engine
        .load_metadata(&args.metadata)
        .await
        .with_context(|| format!("loading metadata from {}", args.metadata.display()))?;
    if loaded {
        info!(path = %args.metadata.display(), "metadata loaded");
    }
    Ok(Arc::new(engine))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(engine: &StorageEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Bucket { action } => match action {
            BucketAction::Create {
                name,
                no_versioning,
                max_bytes,
                max_objects,
            } => {
                let quota = match (max_bytes, max_objects) {
                    (None, None) => None,
                    (bytes, objects) => {
                        let default = Quota::default();
                        Some(Quota::new(
                            bytes.unwrap_or(default.max_size_bytes),
                            objects.unwrap_or(default.max_objects),
                        ))
                    }
                };
                print_json(&engine.create_bucket(&name, !no_versioning, quota).await?)
            }
            BucketAction::Delete { name } => {
                engine.delete_bucket(&name).await?;
                println!("deleted bucket {}", name);
                Ok(())
            }
            BucketAction::Versioning { name, state } => {
                print_json(&engine.set_versioning(&name, state == "on")?)
            }
            BucketAction::Usage { name } => print_json(&engine.quota_usage(&name).await?),
            BucketAction::List => print_json(&engine.list_buckets()),
        },
        Command::Put {
            bucket,
            key,
            file,
            region,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let options = UploadOptions {
                preferred_region: region,
            };
            let receipt = engine
                .upload_with(&bucket, &key, Bytes::from(data), options)
                .await?;
            print_json(&receipt)
        }
        Command::Get {
            bucket,
            key,
            version,
            output,
        } => {
            let data = engine.download(&bucket, &key, version.as_deref()).await?;
            match output {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
            Ok(())
        }
        Command::Rm {
            bucket,
            key,
            version,
        } => {
            let outcome = engine.delete(&bucket, &key, version.as_deref()).await?;
            println!("deleted {}/{} version {}", bucket, key, outcome.version.version_id);
            Ok(())
        }
        Command::Ls { bucket } => print_json(&engine.list_objects(&bucket).await?),
        Command::Versions { bucket, key } => print_json(&engine.list_versions(&bucket, &key).await?),
        Command::Gc { orphans } => print_json(&engine.run_gc(orphans).await),
        Command::Stats => print_json(&engine.stats()),
        Command::Node { .. } | Command::Serve { .. } => bail!("not a one-shot command"),
    }
}

// =============================================================================
// Node
// =============================================================================

async fn run_node(id: &str, data_dir: &Path, listen: &str) -> anyhow::Result<()> {
    let store = FsShardStore::open(data_dir)
        .await
        .with_context(|| format!("opening {}", data_dir.display()))?;

    let shutdown = CancellationToken::new();
    let node = NodeServer::new(id, store);
    let listen = listen.to_string();
    let token = shutdown.clone();
    let server = tokio::spawn(async move { node.serve(&listen, token).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();
    server.await??;
    Ok(())
}

// =============================================================================
// Serve
// =============================================================================

async fn serve(
    engine: Arc<StorageEngine>,
    metadata: &Path,
    metrics_addr: &str,
    health_addr: &str,
    snapshot_interval: Duration,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let mut tasks = engine.spawn_background(shutdown.clone());

    let metrics = engine.metrics().clone();
    let metrics_addr = metrics_addr.to_string();
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics, token).await {
            error!("Metrics server error: {}", e);
        }
    }));

    let registry = engine.registry().clone();
    let health_addr = health_addr.to_string();
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, registry, token).await {
            error!("Health server error: {}", e);
        }
    }));

    let snapshots = {
        let engine = engine.clone();
        let metadata = metadata.to_path_buf();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(snapshot_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = engine.save_metadata(&metadata).await {
                            error!("Metadata snapshot failed: {}", e);
                        }
                    }
                }
            }
        })
    };
    tasks.push(snapshots);

    info!("Engine serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    engine
        .save_metadata(metadata)
        .await
        .context("saving metadata on shutdown")?;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(
    addr: &str,
    registry: Arc<NodeRegistry>,
    shutdown: CancellationToken,
) -> shardvault::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use shardvault::Error;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
    }

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
        registry: Arc<NodeRegistry>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
            "/readyz" => {
                // Ready while a full placement is still possible
                let (up, degraded, _) = registry.snapshot().status_counts();
                if up + degraded >= TOTAL_SHARDS {
                    respond(StatusCode::OK, "ok")
                } else {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "insufficient healthy nodes")
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, registry.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    metrics: EngineMetrics,
    shutdown: CancellationToken,
) -> shardvault::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use shardvault::Error;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        metrics: EngineMetrics,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let (status, body) = match req.uri().path() {
            "/metrics" => match metrics.encode() {
                Ok(text) => (StatusCode::OK, text),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => (StatusCode::NOT_FOUND, "not found".to_string()),
        };

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        if status == StatusCode::OK {
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
        }
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, metrics.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
