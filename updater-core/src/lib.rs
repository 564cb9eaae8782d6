//! Updater Core - hardware-independent SD card firmware installer
//!
//! This crate contains the installer logic for the ESP32-S3 SD card updater.
//! Storage, flash partitions and the device restart are reached through
//! traits so the whole install path can be tested on the host platform
//! without requiring ESP32 hardware.
//!
//! Install flow:
//! 1. Check for `/firmware.bin` on the card
//! 2. Stream it into the next OTA partition
//! 3. Set that partition as the boot partition
//! 4. Rename the image to `/firmware.bin.done`
//! 5. Restart

pub mod config;
pub mod error;
pub mod installer;
pub mod marker;
pub mod partition;
pub mod restart;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::InstallerConfig;
pub use error::{InstallError, PartitionError, StorageError};
pub use installer::{InstallReport, InstallStage, Installer, Progress};
pub use partition::{FlashPartition, PartitionTable, WriteSession};
pub use restart::Restart;
pub use storage::{FsStorage, RemovableStorage, UpdateImage};
