/// Installer configuration that can be tested independently
use serde::{Deserialize, Serialize};

use crate::error::InstallError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstallerConfig {
    /// VFS mount point of the SD card
    pub mount_point: String,
    /// Staged image, relative to the card root
    pub firmware_path: String,
    /// Name the image is renamed to once it has been flashed
    pub done_path: String,
    /// Copy buffer size in bytes
    pub chunk_size: usize,
    /// Log progress every N chunks worth of bytes
    pub progress_interval_chunks: usize,
    /// Delay before restarting so the last log lines reach the UART
    pub restart_delay_ms: u32,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            mount_point: "/sdcard".to_string(),
            firmware_path: "/firmware.bin".to_string(),
            done_path: "/firmware.bin.done".to_string(),
            chunk_size: 4096,
            progress_interval_chunks: 10,
            restart_delay_ms: 100,
        }
    }
}

impl InstallerConfig {
    pub fn validate(&self) -> Result<(), InstallError> {
        if self.chunk_size == 0 {
            return Err(InstallError::InvalidConfig("chunk_size must be non-zero".into()));
        }
        if self.progress_interval_chunks == 0 {
            return Err(InstallError::InvalidConfig(
                "progress_interval_chunks must be non-zero".into(),
            ));
        }
        if self.firmware_path.is_empty() || self.done_path.is_empty() {
            return Err(InstallError::InvalidConfig("firmware paths must not be empty".into()));
        }
        if self.firmware_path == self.done_path {
            return Err(InstallError::InvalidConfig(
                "firmware_path and done_path must differ".into(),
            ));
        }
        Ok(())
    }

    /// Number of bytes between two progress reports
    pub fn progress_interval_bytes(&self) -> u64 {
        (self.chunk_size as u64).saturating_mul(self.progress_interval_chunks as u64)
    }
}
