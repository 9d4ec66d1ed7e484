use crate::cli::FetchArgs;
use fetchpool::config::Config;
use fetchpool::dispatch::QueueDispatcher;
use fetchpool::job::{Job, JobResult};
use fetchpool::pool::{Pool, finalize_channel};
use serde::Serialize;
use std::io::Write;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One line of output per finished job
#[derive(Debug, Serialize)]
struct FetchRecord<'a> {
    id: Uuid,
    url: Option<&'a str>,
    effective_url: Option<&'a str>,
    status: Option<u16>,
    bytes: u64,
    body_len: usize,
    truncated: bool,
    round_trip_ms: u128,
    finished_at: Option<String>,
    error: Option<String>,
}

impl<'a> FetchRecord<'a> {
    fn new(job: &'a Job) -> Self {
        let result = job.result();
        let properties = result.map(|r| &r.properties);

        Self {
            id: job.id(),
            url: job.label(),
            effective_url: properties.and_then(|p| p.effective_uri.as_deref()),
            status: result.and_then(JobResult::status),
            bytes: properties.map_or(0, |p| p.bytes_downloaded),
            body_len: result.map_or(0, |r| r.body.len()),
            truncated: result.is_some_and(JobResult::truncated),
            round_trip_ms: properties.map_or(0, |p| p.round_trip_time.as_millis()),
            finished_at: result.and_then(|r| r.finished_at.format(&Rfc3339).ok()),
            error: result.and_then(|r| r.error.as_ref()).map(ToString::to_string),
        }
    }
}

pub async fn run(args: FetchArgs) -> Result<(), AnyError> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path.clone())?,
        None => Config::load()?,
    };
    if let Some(workers) = args.workers {
        config.pool.size = workers;
    }
    if let Some(limit) = args.max_body_size {
        config.pool.max_body_size = Some(limit);
    }
    config.validate()?;

    let urls = collect_urls(&args).await?;
    if urls.is_empty() {
        warn!("No URLs given");
        return Ok(());
    }

    let job_config = config.pool.job_config();
    let dispatcher: QueueDispatcher = urls
        .iter()
        .map(|url| {
            let job = Job::get(url);
            match job_config.max_body_size {
                Some(limit) => job.with_max_body_size(limit),
                None => job,
            }
        })
        .collect();

    let (on_finalize, mut finished) = finalize_channel();
    let mut pool = Pool::from_config(&config, on_finalize)?;

    let printer = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some(job) = finished.recv().await {
            match serde_json::to_string(&FetchRecord::new(&job)) {
                Ok(line) => {
                    if let Err(e) = writeln!(stdout.lock(), "{line}") {
                        warn!(error = %e, "Could not write output");
                        break;
                    }
                }
                Err(e) => warn!(job_id = %job.id(), error = %e, "Could not encode job"),
            }
        }
    });

    info!(urls = urls.len(), workers = pool.size(), "Fetching");
    pool.work(dispatcher)?;

    let interrupted = tokio::select! {
        _ = pool.wait_until_idle() => false,
        _ = shutdown_signal() => true,
    };

    if interrupted {
        pool.kill_workers();
    } else {
        pool.close_non_blocking();
    }
    let closed = pool.wait_until_closed().await;

    let metrics = pool.metrics().snapshot();
    // Dropping the pool drops the finalize sender and ends the printer
    drop(pool);
    printer.await?;

    info!(
        completed = metrics.jobs_completed,
        failed = metrics.jobs_failed,
        truncated = metrics.jobs_truncated,
        bytes = metrics.bytes_downloaded,
        "Done"
    );

    closed?;
    Ok(())
}

async fn collect_urls(args: &FetchArgs) -> Result<Vec<String>, AnyError> {
    let mut urls = args.urls.clone();

    if let Some(path) = &args.input {
        let contents = if path.as_os_str() == "-" {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        } else {
            tokio::fs::read_to_string(path).await?
        };

        urls.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }

    Ok(urls)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Shutdown signal received, killing workers");
}
