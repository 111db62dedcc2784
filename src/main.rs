use anyhow::Context;
use octo_bed_controller::console::{self, ConsoleCommand};
use octo_bed_controller::coordinator::Coordinator;
use octo_bed_controller::domain::settings::SettingsService;
use octo_bed_controller::infrastructure::bluetooth::BtleplugBackend;
use octo_bed_controller::infrastructure::logging::init_logger;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let base_dir = settings
        .path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let _logging = init_logger(&settings.get().log_settings, &base_dir)?;
    info!(settings = %settings.path().display(), "Starting Octo bed controller");

    let backend = BtleplugBackend::new()
        .await
        .context("failed to open Bluetooth adapters")?;
    let coordinator = Coordinator::new(Arc::new(backend), Arc::new(Mutex::new(settings)));
    coordinator.start();

    println!("Octo bed controller ready. Type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let command = match console::parse(&line) {
            Ok(ConsoleCommand::Quit) => break,
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        // Moves and calibrations run for seconds; keep reading so `stop` stays available
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            match console::execute(&coordinator, command).await {
                Ok(reply) => println!("{reply}"),
                Err(e) => {
                    error!("Command failed: {}", e);
                    println!("error: {e}");
                }
            }
        });
    }

    info!("Shutting down");
    coordinator.shutdown().await;
    Ok(())
}
