use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use media_cache::cache::{cache_key_of, filename_for};
use media_cache::{CacheConfig, CacheRegistry};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use error::AppError;
use utils::{format_bytes, parse_headers, parse_size};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const MAX_READ_RETRIES: usize = 3;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    init_logging(&args)?;

    let config = build_config(&args)?;
    let registry = Arc::new(CacheRegistry::with_http(config)?);
    info!(
        cache_dir = ?registry.cache_dir(),
        budget = %format_bytes(registry.max_cache_size()),
        "Media cache ready"
    );

    let sweeper = registry.start_eviction_task();

    let output = if args.to_stdout() {
        None
    } else {
        let dir = PathBuf::from(&args.output_dir);
        std::fs::create_dir_all(&dir)?;
        Some(dir)
    };

    let mut failures = 0usize;
    match &output {
        // stdout output is written one URI after the other
        None => {
            for uri in args.input.iter().cloned() {
                let registry = registry.clone();
                let offset = args.offset;
                let result =
                    tokio::task::spawn_blocking(move || fetch(&registry, &uri, offset, None))
                        .await?;
                failures += usize::from(report(result));
            }
        }
        Some(dir) => {
            let tasks: Vec<_> = args
                .input
                .iter()
                .cloned()
                .map(|uri| {
                    let registry = registry.clone();
                    let offset = args.offset;
                    let dir = dir.clone();
                    tokio::task::spawn_blocking(move || {
                        fetch(&registry, &uri, offset, Some(dir.as_path()))
                    })
                })
                .collect();

            for task in tasks {
                failures += usize::from(report(task.await?));
            }
        }
    }

    if args.sweep {
        let report = registry.evict().await?;
        info!(
            deleted = report.files_deleted,
            freed = %format_bytes(report.bytes_deleted),
            skipped = report.files_skipped,
            "Sweep done"
        );
    }

    sweeper.abort();

    if failures > 0 {
        return Err(AppError::InvalidInput(format!(
            "{failures} of {} fetches failed",
            args.input.len()
        )));
    }

    Ok(())
}

fn init_logging(args: &CliArgs) -> Result<(), AppError> {
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder().with_max_level(log_level);

    // logs never go to stdout, it may carry the fetched data
    let result = match &args.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            let writer = MakeWriterExt::and(io::stderr, Arc::new(log_file));
            tracing::subscriber::set_global_default(
                builder.with_writer(writer).with_ansi(false).finish(),
            )
        }
        None => tracing::subscriber::set_global_default(
            builder.with_writer(io::stderr).with_ansi(true).finish(),
        ),
    };

    result.map_err(|e| AppError::Initialization(e.to_string()))
}

fn build_config(args: &CliArgs) -> Result<CacheConfig, AppError> {
    let mut builder = CacheConfig::builder()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_headers(parse_headers(&args.headers));

    if let Some(dir) = &args.cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }

    if let Some(size) = &args.max_cache_size {
        let bytes = parse_size(size)?;
        if bytes == 0 {
            return Err(AppError::InvalidInput(
                "Cache size budget must be greater than zero".to_string(),
            ));
        }
        builder = builder.with_max_cache_size(bytes);
    }

    if let Some(user_agent) = &args.user_agent {
        builder = builder.with_user_agent(user_agent.clone());
    }

    if let Some(proxy) = &args.proxy {
        info!(proxy_url = %proxy, "Using explicit proxy configuration for downloads");
        builder = builder.with_proxy(proxy.clone());
    }

    Ok(builder.build())
}

fn report(result: Result<u64, AppError>) -> bool {
    match result {
        Ok(_) => false,
        Err(e) => {
            error!(error = %e, "Fetch failed");
            true
        }
    }
}

/// Copy one resource through the cache into `dir`, or stdout if `None`.
/// Runs on a blocking thread, the reads wait for the download.
fn fetch(
    registry: &CacheRegistry,
    uri: &str,
    offset: u64,
    dir: Option<&Path>,
) -> Result<u64, AppError> {
    let entry = registry.get(uri)?;
    let total_size = entry.total_size()?;
    info!(
        uri = %uri,
        total_size = %format_bytes(total_size),
        cached = entry.fraction_cached(),
        "Fetching"
    );

    let mut sink: Box<dyn Write> = match dir {
        Some(dir) => {
            let path = dir.join(filename_for(&cache_key_of(uri)));
            debug!(uri = %uri, path = ?path, "Writing to file");
            Box::new(File::create(path)?)
        }
        None => Box::new(io::stdout().lock()),
    };

    let mut stream = entry.open_stream(offset)?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    let mut retries = 0usize;
    let mut last_progress = Instant::now();

    loop {
        let count = match stream.read_bytes(&mut buf) {
            Ok(count) => count,
            Err(e) if e.is_retryable() && retries < MAX_READ_RETRIES => {
                retries += 1;
                warn!(uri = %uri, error = %e, retries, "Read failed, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if count == 0 {
            break;
        }

        sink.write_all(&buf[..count])?;
        copied += count as u64;
        retries = 0;

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            info!(
                uri = %uri,
                copied = %format_bytes(copied),
                cached = %format!("{:.1}%", entry.fraction_cached() * 100.0),
                "Progress"
            );
            last_progress = Instant::now();
        }
    }

    sink.flush()?;
    stream.close();
    entry.close();

    info!(uri = %uri, copied = %format_bytes(copied), "Fetch complete");
    Ok(copied)
}
