//! portfwd
//!
//! Headless TCP port forwarder. Starts one engine per forward definition and
//! logs every connection, chunk and transmission summary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use portfwd_core::format::{PREVIEW_BYTES, format_bytes, format_duration, hex_preview};
use portfwd_core::{ForwardSpec, config, forwards};
use portfwd_engine::{EngineConfig, Forwarder, Notification, NotificationKind};

#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(version, about = "portfwd - TCP port forwarder with traffic history")]
struct Args {
    /// Forwards file, one `<-|*><port>:<host>:<port>` per line.
    #[arg(long, env = "PORTFWD_FORWARDS")]
    forwards: Option<PathBuf>,

    /// Ad-hoc forward in forwards-file syntax; replaces the file when given.
    #[arg(long = "forward", value_name = "SPEC")]
    forward: Vec<ForwardSpec>,

    /// Settings JSON file.
    #[arg(long, env = "PORTFWD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "trace").
    #[arg(long, env = "PORTFWD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PORTFWD_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = config::load_config(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        settings.log.level = level;
    }
    settings.log.json |= args.log_json;
    portfwd_core::tracing_init::init_tracing(&settings.log);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting portfwd");

    let specs = if args.forward.is_empty() {
        let path = match args.forwards {
            Some(path) => path,
            None => config::default_forwards_path()
                .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?,
        };
        info!(path = %path.display(), "Loading forwards");
        forwards::load_forwards(&path)?
    } else {
        args.forward
    };
    if specs.is_empty() {
        anyhow::bail!("No forwards configured");
    }

    let engine_config = EngineConfig::from(&settings.engine);
    let mut engines = Vec::with_capacity(specs.len());
    let mut observers = Vec::with_capacity(specs.len());
    for spec in &specs {
        match start_forward(spec, engine_config.clone()).await {
            Ok((engine, observer)) => {
                engines.push(engine);
                observers.push(observer);
            }
            Err(e) => error!(forward = %spec, error = %e, "Forward not started"),
        }
    }
    if engines.iter().all(|engine| !engine.active()) {
        warn!("No forward is listening");
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    for engine in &engines {
        engine.deactivate().await;
    }
    for engine in &engines {
        engine.wait_idle().await;
    }
    // Observers finish once the last handle to each bus is gone.
    drop(engines);
    for observer in observers {
        let _ = observer.await;
    }

    info!("portfwd stopped");
    Ok(())
}

async fn start_forward(
    spec: &ForwardSpec,
    config: EngineConfig,
) -> anyhow::Result<(Arc<Forwarder>, JoinHandle<()>)> {
    let engine = Arc::new(Forwarder::new(config));
    engine.set_local(spec.bind_host(), spec.source_port).await?;
    engine
        .set_remote(&spec.destination_host, spec.destination_port)
        .await?;

    let observer = tokio::spawn(observe(engine.to_string(), engine.subscribe()));
    if let Err(e) = engine.activate().await {
        warn!(forward = %engine, error = %e, "Activation failed");
    }
    Ok((engine, observer))
}

async fn observe(
    forward: String,
    mut rx: tokio::sync::broadcast::Receiver<Notification>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => log_notification(&forward, &notification),
            Err(RecvError::Lagged(missed)) => {
                warn!(%forward, missed, "Observer fell behind; notifications dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_notification(forward: &str, notification: &Notification) {
    match &notification.kind {
        NotificationKind::Error(e) => warn!(%forward, error = %e, "Forward error"),
        NotificationKind::Activated | NotificationKind::Deactivated => {
            info!(%forward, "{}", notification.message());
        }
        NotificationKind::TransmissionStarted => {
            debug!(%forward, "{}", notification.message());
        }
        NotificationKind::TransmissionSent { bytes }
        | NotificationKind::TransmissionReceived { bytes } => {
            trace!(%forward, bytes, "{}", notification.message());
        }
        NotificationKind::TransmissionEnded => {
            let Some(transmission) = notification.transmission() else {
                return;
            };
            info!(
                %forward,
                id = %transmission.id(),
                source = %transmission.source(),
                destination = %transmission.destination(),
                uploaded = %format_bytes(transmission.uploaded_bytes()),
                downloaded = %format_bytes(transmission.downloaded_bytes()),
                duration = %format_duration(transmission.duration()),
                messages = transmission.event_count(),
                state = ?transmission.state(),
                "Transmission summary"
            );
            if tracing::enabled!(tracing::Level::TRACE) {
                for event in transmission.events() {
                    trace!(
                        id = %transmission.id(),
                        direction = ?event.direction,
                        size = %format_bytes(event.payload.len() as u64),
                        payload = %hex_preview(&event.payload, PREVIEW_BYTES),
                        "Message"
                    );
                }
            }
        }
    }
}
