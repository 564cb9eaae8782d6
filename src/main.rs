use anyhow::Result;
use log::info;

// Generate ESP-IDF app descriptor
// Note: This macro generates warnings about cfg conditions but they're harmless
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
#[cfg(target_os = "espidf")]
mod ota;
#[cfg(target_os = "espidf")]
mod system;
mod version;

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use esp_idf_svc::hal::delay::FreeRtos;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use updater_core::PartitionTable;

    use crate::ota::EspPartitionTable;

    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();

    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    info!("ESP32-S3 SD Updater {}", version::full_version());
    info!("Boot reason: {}", system::reset::get_reset_reason());

    let peripherals = Peripherals::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let config = config::load_or_default(&nvs)?;
    if !logging::set_max_level_from_str(&config.log_level) {
        log::warn!("Unknown log level '{}', keeping info", config.log_level);
    }

    let partitions = EspPartitionTable::new();
    match partitions.running_partition() {
        Some(running) => info!("Running from partition: {}", running),
        None => log::warn!("Running partition unknown"),
    }

    match ota::mount_sd_card(
        peripherals.spi2,
        peripherals.pins.gpio12,
        peripherals.pins.gpio11,
        peripherals.pins.gpio13,
        peripherals.pins.gpio10,
        &config.installer.mount_point,
    ) {
        Ok(card) => run_sd_update(&config, card.mount_point(), partitions),
        Err(e) => log::warn!("SD card not available: {:?}", e),
    }

    info!("Continuing normal boot");
    loop {
        FreeRtos::delay_ms(1000);
    }
}

/// Flash /firmware.bin from the card if one is staged. Only returns when
/// there was nothing to install or the install failed.
#[cfg(target_os = "espidf")]
fn run_sd_update(config: &config::Config, mount_point: &str, partitions: ota::EspPartitionTable) {
    use updater_core::{FsStorage, Installer};

    let storage = FsStorage::new(mount_point);
    let restart = system::EspRestart::new(config.installer.restart_delay_ms);

    let mut installer = match Installer::new(config.installer.clone(), storage, partitions, restart) {
        Ok(installer) => installer,
        Err(e) => {
            log::error!("SD card updater disabled: {}", e);
            return;
        }
    };

    if !installer.has_update() {
        info!("No firmware update on SD card");
        return;
    }

    if !installer.install_update() {
        log::warn!(
            "SD card update failed at stage '{}', booting current firmware",
            installer.stage().description()
        );
    }
}

/// Host build: validate a config file the way the device would load it
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    info!("ESP32-S3 SD Updater {} (host build)", version::full_version());

    let config = match std::env::args().nth(1) {
        Some(path) => config::Config::from_json(&std::fs::read(&path)?)?,
        None => config::Config::default(),
    };
    if !logging::set_max_level_from_str(&config.log_level) {
        log::warn!("Unknown log level '{}', keeping info", config.log_level);
    }

    info!(
        "Staged image: {}{}",
        config.installer.mount_point, config.installer.firmware_path
    );
    info!(
        "Completion marker: {}{}",
        config.installer.mount_point, config.installer.done_path
    );
    info!("{}", serde_json::to_string_pretty(&config)?);
    log::warn!("Flashing needs the ESP32-S3 target; host tests run with `cargo test --workspace`");
    Ok(())
}
