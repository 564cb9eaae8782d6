// SD card mount over SPI
//
// The card is mounted into the ESP-IDF VFS so the installer can use
// updater_core::FsStorage (plain std::fs) on top of it.

use std::any::Any;

use anyhow::Result;
use esp_idf_svc::fs::fatfs::Fatfs;
use esp_idf_svc::hal::gpio::{AnyIOPin, Gpio10, Gpio11, Gpio12, Gpio13};
use esp_idf_svc::hal::sd::{spi::SdSpiHostDriver, SdCardConfiguration, SdCardDriver};
use esp_idf_svc::hal::spi::{config::DriverConfig, Dma, SpiDriver, SPI2};
use esp_idf_svc::io::vfs::MountedFatfs;
use log::info;

const MAX_OPEN_FILES: usize = 4;

/// Keeps the card mounted until dropped
pub struct MountedCard {
    mount_point: String,
    _mount: Box<dyn Any>,
}

impl MountedCard {
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }
}

/// Mount the card on SPI2 (SCLK 12, MOSI 11, MISO 13, CS 10)
pub fn mount_sd_card(
    spi: SPI2,
    sclk: Gpio12,
    mosi: Gpio11,
    miso: Gpio13,
    cs: Gpio10,
    mount_point: &str,
) -> Result<MountedCard> {
    let spi_driver = SpiDriver::new(
        spi,
        sclk,
        mosi,
        Some(miso),
        &DriverConfig::default().dma(Dma::Auto(4096)),
    )?;

    let sd_card_driver = SdCardDriver::new_spi(
        SdSpiHostDriver::new(
            spi_driver,
            Some(cs),
            AnyIOPin::none(),
            AnyIOPin::none(),
            AnyIOPin::none(),
            None,
        )?,
        &SdCardConfiguration::new(),
    )?;

    let mounted = MountedFatfs::mount(Fatfs::new_sdcard(0, sd_card_driver)?, mount_point, MAX_OPEN_FILES)?;
    info!("SD card mounted at {}", mount_point);

    Ok(MountedCard {
        mount_point: mount_point.to_string(),
        _mount: Box::new(mounted),
    })
}
