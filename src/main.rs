use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::AdmissionStatus;

/// Read identifiers from stdin, one per line, and print an admission decision for each.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = TurnstileConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging, args.json_logs);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let handle = turnstile::create(config.limiter.clone())?;
    info!(
        window_secs = config.limiter.window_secs,
        max_attempts = config.limiter.max_attempts,
        cleanup_interval_secs = config.limiter.cleanup_interval_secs,
        "Limiter initialized"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let id = line.trim();
                if id.is_empty() {
                    continue;
                }

                let output = match handle.check(id) {
                    Ok(status) => format_status(id, &status),
                    Err(e) => {
                        warn!(error = %e, "Invalid identifier");
                        format!("ERROR {} {}\n", id, e)
                    }
                };
                stdout.write_all(output.as_bytes()).await?;
                stdout.flush().await?;
            }
            received = &mut shutdown => {
                info!(signal = received, "Shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig, json_flag: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Decisions go to stdout, so logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json || json_flag {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn format_status(id: &str, status: &AdmissionStatus) -> String {
    match status.retry_after {
        Some(retry_after) => format!(
            "{} {} retry_after={:.3}s\n",
            status.decision,
            id,
            retry_after.as_secs_f64()
        ),
        None => format!(
            "{} {} remaining={}\n",
            status.decision, id, status.remaining
        ),
    }
}

/// Resolve with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
                ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
        "Ctrl+C"
    }
}

/// Wait for Ctrl+C; never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
}
