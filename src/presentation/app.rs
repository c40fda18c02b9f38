use crate::domain::models::AppEvent;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::{ConnectionManager, LifecycleConfig};
use crate::presentation::boundary::{parse_command, BoundaryCommand, BoundaryEvent, BoundaryWriter};
use crate::presentation::session::TelemetrySession;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for an in-flight connect task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Apply one command. Returns an event to report straight away, if any.
fn dispatch<A: BleAdapter>(
    manager: &ConnectionManager<A>,
    command: BoundaryCommand,
) -> Option<BoundaryEvent> {
    debug!("Command: {:?}", command);
    match command {
        BoundaryCommand::Scan => {
            manager.scan();
            None
        }
        BoundaryCommand::Connect { device_id } => {
            match device_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
                Some(id) => {
                    manager.connect(id);
                    None
                }
                None => Some(BoundaryEvent::error("device_id is required")),
            }
        }
        BoundaryCommand::Disconnect => {
            manager.disconnect();
            None
        }
    }
}

async fn forward<W: AsyncWrite + Unpin>(
    session: &mut TelemetrySession,
    writer: &mut BoundaryWriter<W>,
    event: AppEvent,
) -> std::io::Result<()> {
    for out in session.handle(event) {
        writer.write(&out).await?;
    }
    Ok(())
}

/// Command loop: reads commands from `input`, writes events to `output`.
///
/// Runs until `input` reaches EOF or `shutdown` resolves, then ends any live
/// session and flushes the remaining events.
pub async fn run<A, R, W, S>(
    adapter: A,
    settings: &Settings,
    input: R,
    output: W,
    shutdown: S,
) -> anyhow::Result<()>
where
    A: BleAdapter,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let config = LifecycleConfig::from_settings(&settings.ble)?;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let manager = ConnectionManager::new(adapter, config, event_tx);
    let mut session = TelemetrySession::new(
        &settings.sensor,
        &settings.telemetry,
        manager.subscribe_phase(),
    );
    let mut writer = BoundaryWriter::new(output);
    let mut lines = input.lines();
    tokio::pin!(shutdown);

    info!("Ready for commands");
    let mut outcome = Ok(());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(reply) = parse_command(&line).and_then(|c| dispatch(&manager, c)) {
                        if let Err(e) = writer.write(&reply).await {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("Command input closed, shutting down");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read command input: {}", e);
                    break;
                }
            },
            Some(event) = event_rx.recv() => {
                if let Err(e) = forward(&mut session, &mut writer, event).await {
                    outcome = Err(e);
                    break;
                }
            }
        }
    }

    manager.shutdown(SHUTDOWN_GRACE).await;

    if let Err(e) = outcome {
        error!("Event output closed: {}", e);
        return Err(e.into());
    }
    while let Ok(event) = event_rx.try_recv() {
        forward(&mut session, &mut writer, event).await?;
    }
    info!("Stopped");
    Ok(())
}
