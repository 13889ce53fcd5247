//! Core of the rscp transfer tools: chunked copy with positional writes, resume from part files,
//! MD5 verification, retry with exponential backoff and directory fan-out.
//!
//! # Logging Convention
//! Errors are reported with the alternate format so the whole chain is visible:
//! ```ignore
//! tracing::error!("{:#}", &error);
//! ```

pub mod chunker;
pub mod config;
pub mod fs;
pub mod integrity;
pub mod progress;
pub mod resume;
pub mod retry;
pub mod transfer;

#[cfg(test)]
pub mod testutils;

pub use config::{OutputConfig, RuntimeConfig, TransferConfig};
pub use transfer::{Direction, Summary, transfer};

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose > 1)
        .try_init()
    {
        eprintln!("failed to initialize logging: {error}");
    }
}

/// Runs `func` on a fresh tokio runtime configured from `runtime`.
///
/// Errors are printed unless `output.quiet` is set; the summary is printed when requested (or
/// when running verbose). Returns `None` on failure, callers exit with a non-zero status.
pub fn run<Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    T: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init_tracing(output.verbose);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("✗ failed to start runtime: {error}");
            }
            return None;
        }
    };
    match tokio_runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("✗ {error:#}");
            }
            None
        }
    }
}
