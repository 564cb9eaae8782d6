//! Completion marker
//!
//! A flashed image is renamed so the next boot no longer sees it as staged.
//! This rename is what stops the device from reflashing the same image on
//! every boot.

use crate::error::InstallError;
use crate::storage::RemovableStorage;

pub fn mark_consumed<S: RemovableStorage>(
    storage: &mut S,
    firmware_path: &str,
    done_path: &str,
) -> Result<(), InstallError> {
    if storage.exists(done_path) {
        // A failed remove surfaces through the rename below
        if let Err(e) = storage.remove(done_path) {
            log::warn!("Could not remove stale marker: {}", e);
        }
    }

    storage
        .rename(firmware_path, done_path)
        .map_err(|source| InstallError::MarkRenameFailed {
            from: firmware_path.to_string(),
            to: done_path.to_string(),
            source,
        })?;

    log::info!("Renamed {} to {}", firmware_path, done_path);
    Ok(())
}
