use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use lanbeam_transfer::net::local_ip;
use lanbeam_transfer::{
    format_rate, Batch, Outcome, SecurityCode, SessionController, TransferConfig, TransferEvent,
};

#[derive(Parser)]
#[command(name = "lanbeam", version, about = "Send files straight to another device on your network")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for a receiver and send it these files
    Send {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Connect to a sender and download its files
    Receive {
        /// Sender address, `host` or `host:port`
        address: String,
        /// Six-digit code shown by the sender
        code: String,
        /// Where received files are written
        #[arg(long, short, default_value = ".")]
        dest: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lanbeam=info,lanbeam_transfer=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config_from_env()?;
    config.validate().context("invalid configuration")?;
    let mut controller = SessionController::new(config);

    match cli.command {
        Command::Send { paths } => {
            let batch = Batch::from_paths(&paths).context("cannot prepare files")?;
            let total = batch.total_bytes();
            let count = batch.len();
            controller.start_sending(batch)?;
            let snapshot = controller
                .snapshot()
                .context("session ended before it started")?;
            let port = snapshot
                .local_addr
                .map(|a| a.port())
                .unwrap_or(controller.config().port);
            let host = local_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "<this device>".into());
            println!("Sending {} file(s), {} bytes", count, total);
            println!("Address: {}:{}", host, port);
            println!("Code:    {}", snapshot.code);
        }
        Command::Receive {
            address,
            code,
            dest,
        } => {
            let code: SecurityCode = code.parse()?;
            info!("receiving from {} into {}", address, dest.display());
            controller.start_receiving(&address, code, dest)?;
        }
    }

    run_to_completion(&mut controller)
}

/// Print progress until the session finishes.
fn run_to_completion(controller: &mut SessionController) -> anyhow::Result<()> {
    while !controller.is_idle() {
        match controller.next_event(Duration::from_millis(500)) {
            Some(TransferEvent::Progress(p)) => {
                println!(
                    "{:>5.1}%  {}  {}",
                    p.overall_fraction * 100.0,
                    p.label,
                    p.rate_label()
                );
            }
            Some(TransferEvent::StateChanged(state)) => info!("state: {:?}", state),
            Some(_) | None => {}
        }
    }

    match controller.last_session().and_then(|s| s.outcome.clone()) {
        Some(Outcome::Completed(summary)) => {
            println!(
                "Done: {} file(s), {} bytes in {:.1}s ({})",
                summary.files,
                summary.total_bytes,
                summary.elapsed.as_secs_f64(),
                format_rate(summary.throughput_bps as f64)
            );
            Ok(())
        }
        Some(Outcome::Failed { kind, message }) => bail!("transfer failed ({}): {}", kind, message),
        None => bail!("transfer ended without a result"),
    }
}

/// Defaults overridden by `LANBEAM_*` environment variables.
fn config_from_env() -> anyhow::Result<TransferConfig> {
    config_from_vars(|key| std::env::var(key).ok())
}

fn config_from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<TransferConfig> {
    let secs = |key: &str| -> anyhow::Result<Option<Duration>> {
        var(key)
            .map(|v| v.trim().parse().map(Duration::from_secs).context(key.to_string()))
            .transpose()
    };

    let mut config = TransferConfig::default();
    if let Some(port) = var("LANBEAM_PORT") {
        config.port = port.trim().parse().context("LANBEAM_PORT")?;
    }
    if let Some(t) = secs("LANBEAM_CONNECT_TIMEOUT_SECS")? {
        config.connect_timeout = t;
    }
    if let Some(t) = secs("LANBEAM_READ_TIMEOUT_SECS")? {
        config.read_timeout = t;
    }
    if let Some(t) = secs("LANBEAM_WRITE_TIMEOUT_SECS")? {
        config.write_timeout = t;
    }
    if let Some(t) = secs("LANBEAM_ACK_TIMEOUT_SECS")? {
        config.ack_timeout = t;
    }
    if let Some(size) = var("LANBEAM_CHUNK_SIZE") {
        config.chunk_size = size.trim().parse().context("LANBEAM_CHUNK_SIZE")?;
    }
    if let Some(keep) = var("LANBEAM_KEEP_PARTIAL") {
        config.keep_partial_files = matches!(keep.trim(), "1" | "true" | "yes");
    }
    Ok(config)
}
