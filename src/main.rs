mod domain;
mod infrastructure;
mod presentation;

use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::mock::{MockBikeAdapter, MockRide};
use crate::infrastructure::bluetooth::platform::BtleplugAdapter;
use crate::presentation::boundary::{BoundaryEvent, BoundaryWriter};
use tokio::io::BufReader;
use tracing::{error, info, warn};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = crate::infrastructure::logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting DeskBike BLE helper");
    if let Some(path) = settings_service.path() {
        info!("Settings file: {}", path.display());
    }
    if let Some(warning) = settings_service.load_warning() {
        warn!("{}", warning);
    }

    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();

    if settings.mock_ble {
        return presentation::app::run(
            MockBikeAdapter::new(MockRide::from_settings(&settings)),
            &settings,
            input,
            output,
            shutdown_signal(),
        )
        .await;
    }

    match BtleplugAdapter::new(settings.ble.adapter.as_deref()).await {
        Ok(adapter) => {
            presentation::app::run(adapter, &settings, input, output, shutdown_signal()).await
        }
        Err(e) => {
            error!("Bluetooth unavailable: {}", e);
            let mut writer = BoundaryWriter::new(output);
            writer
                .write(&BoundaryEvent::error(format!("Bluetooth unavailable: {}", e)))
                .await?;
            Err(e.into())
        }
    }
}
