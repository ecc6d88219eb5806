//! galleria daemon.
//!
//! Keeps the task records of a photo library in step with the files:
//! every sync pass walks the photo root, creates or refreshes records, and
//! submits thumbnail, metadata and face detection jobs to the worker pool.
//!
//! ## Usage
//!
//! ```bash
//! galleria                    # Run in foreground, sync periodically
//! galleria --once             # One sync pass, wait for the queue, exit
//! galleria --zip trips/2024   # Build one album archive and exit
//! ```

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use galleria::adapters::{Adapters, FaceRecognizer};
use galleria::archive::AlbumArchiver;
use galleria::config::Config;
use galleria::db::Database;
use galleria::faces::{ArcFaceRecognizer, UltraFaceDetector};
use galleria::logging;
use galleria::scanner::{self, ExifExtractor, ImageThumbnailer, LibrarySync};
use galleria::tasks::{JobQueue, TaskStatus, WorkerContext, WorkerPool};

/// How long `--once` and `--zip` wait for the queue to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    once: bool,
    interval: Option<u64>,
    zip: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                parsed.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(interval) => parsed.interval = Some(interval),
                        Err(_) => {
                            eprintln!("Invalid interval: {}", args[i + 1]);
                            std::process::exit(1);
                        }
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--zip" | "-z" => {
                if i + 1 < args.len() {
                    parsed.zip = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--version" | "-V" => {
                println!("galleria {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"galleria - photo library task daemon

USAGE:
    galleria [OPTIONS]

OPTIONS:
    --once, -1          Run one sync pass, wait for all jobs, and exit
    --interval, -i N    Seconds between sync passes (default from config)
    --zip, -z ALBUM     Build the archive of one album and exit
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    GALLERIA_CONFIG     Path to config file (overrides default location)
    GALLERIA_LOG        Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/galleria/config.toml"#
    );
}

fn build_adapters(config: &Config) -> Adapters {
    let recognizer: Option<Arc<dyn FaceRecognizer>> = if config.faces.enabled {
        Some(Arc::new(ArcFaceRecognizer::new(&config.faces.models_dir)))
    } else {
        None
    };

    Adapters {
        thumbnails: Arc::new(ImageThumbnailer::new(&config.thumbnails)),
        metadata: Arc::new(ExifExtractor),
        detector: Arc::new(UltraFaceDetector::new(
            &config.faces.models_dir,
            config.faces.detection_confidence,
        )),
        recognizer,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Err(e) = logging::init(config.daemon.log_dir.clone()) {
        eprintln!("Logging unavailable: {:#}", e);
    }
    info!(version = env!("CARGO_PKG_VERSION"), "galleria starting");

    let db = Arc::new(
        Database::open(&config.database.path)
            .with_context(|| format!("opening database {}", config.database.path.display()))?,
    );
    db.initialize()?;
    info!(path = %config.database.path.display(), "Database opened");

    let queue = Arc::new(JobQueue::new(config.workers.queue_capacity));
    let adapters = build_adapters(&config);
    let recognition = adapters.recognizer.is_some();
    let pool = WorkerPool::start(
        config.workers.count,
        WorkerContext {
            db: db.clone(),
            queue: queue.clone(),
            adapters,
        },
    )?;

    let sync = Arc::new(
        LibrarySync::new(db.clone(), queue.clone(), &config).with_recognition(recognition),
    );

    let result = if let Some(album) = &args.zip {
        let archiver = AlbumArchiver::new(
            db.clone(),
            queue.clone(),
            &config.library.root,
            &config.archive.path,
        );
        build_archive(&db, &queue, &archiver, &config.library.root, album).await
    } else if args.once {
        run_once(sync, queue.clone()).await
    } else {
        let interval = args.interval.unwrap_or(config.daemon.sync_interval);
        run_daemon(sync, interval).await
    };

    // Running jobs finish; queued ones are picked up again after restart
    if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown()).await {
        error!(error = %e, "Worker pool shutdown failed");
    }
    info!("galleria stopped");
    result
}

async fn run_sync(sync: Arc<LibrarySync>) -> Result<scanner::SyncReport> {
    let report = tokio::task::spawn_blocking(move || sync.run())
        .await
        .context("sync task panicked")??;
    Ok(report)
}

async fn wait_for_queue(queue: Arc<JobQueue>) -> Result<()> {
    let idle = tokio::task::spawn_blocking(move || queue.wait_idle(DRAIN_TIMEOUT)).await?;
    if !idle {
        bail!("timed out waiting for the job queue to drain");
    }
    Ok(())
}

async fn run_once(sync: Arc<LibrarySync>, queue: Arc<JobQueue>) -> Result<()> {
    info!("Running a single sync pass");
    let report = run_sync(sync).await?;
    info!(submitted = report.submitted, "Waiting for jobs to finish");

    tokio::select! {
        result = wait_for_queue(queue) => result,
        _ = shutdown_signal() => {
            warn!("Interrupted before the queue drained");
            Ok(())
        }
    }
}

async fn run_daemon(sync: Arc<LibrarySync>, interval: u64) -> Result<()> {
    info!(interval, root = %sync.root().display(), "Running in daemon mode");

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_sync(sync.clone()).await {
                    error!(error = %format!("{:#}", e), "Sync pass failed");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                return Ok(());
            }
        }
    }
}

async fn build_archive(
    db: &Database,
    queue: &Arc<JobQueue>,
    archiver: &AlbumArchiver,
    root: &Path,
    album: &str,
) -> Result<()> {
    let album_id = scanner::normalize_relative(Path::new(album))?;
    if !root.join(&album_id).is_dir() {
        bail!("album folder {} not found under {}", album_id, root.display());
    }
    db.ensure_album(&album_id, &album_id)?;

    if !archiver.request_zip(&album_id)? {
        bail!("archive queue is full, try again later");
    }
    wait_for_queue(queue.clone()).await?;

    let record = archiver.status(&album_id)?;
    match record.status {
        TaskStatus::Done => {
            println!(
                "{}\t{} bytes",
                record.path.unwrap_or_default(),
                record.size.unwrap_or(0)
            );
            Ok(())
        }
        status => bail!(
            "archive of {} ended {}: {}",
            album_id,
            status,
            record.error.unwrap_or_default()
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not listen for Ctrl-C");
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
                error!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
