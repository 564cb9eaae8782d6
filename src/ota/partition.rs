// Partition table backed by the ESP-IDF OTA API

use core::ffi::{c_void, CStr};
use std::ffi::CString;

use esp_idf_sys::{
    esp_err_t, esp_err_to_name, esp_ota_abort, esp_ota_begin, esp_ota_end,
    esp_ota_get_next_update_partition, esp_ota_get_running_partition, esp_ota_handle_t,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_find_first,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, ESP_ERR_NOT_FOUND, ESP_OK,
};
use updater_core::{FlashPartition, PartitionError, PartitionTable};

pub struct EspPartitionTable;

impl EspPartitionTable {
    pub fn new() -> Self {
        Self
    }

    /// Look the raw partition back up from its label and offset
    fn raw(&self, partition: &FlashPartition) -> Result<*const esp_partition_t, PartitionError> {
        let label = CString::new(partition.label.as_str())
            .map_err(|_| not_found("invalid partition label"))?;

        let raw = unsafe {
            esp_partition_find_first(
                esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                label.as_ptr(),
            )
        };

        match unsafe { raw.as_ref() } {
            Some(p) if p.address == partition.address => Ok(raw),
            _ => Err(not_found("partition not found")),
        }
    }
}

impl Default for EspPartitionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionTable for EspPartitionTable {
    type Transaction = esp_ota_handle_t;

    fn running_partition(&self) -> Option<FlashPartition> {
        to_flash_partition(unsafe { esp_ota_get_running_partition() })
    }

    fn next_update_partition(&self) -> Option<FlashPartition> {
        to_flash_partition(unsafe { esp_ota_get_next_update_partition(core::ptr::null()) })
    }

    fn begin_write(
        &mut self,
        partition: &FlashPartition,
        size: u64,
    ) -> Result<esp_ota_handle_t, PartitionError> {
        let raw = self.raw(partition)?;
        let mut handle: esp_ota_handle_t = 0;

        check(unsafe { esp_ota_begin(raw, size as _, &mut handle as *mut _) })?;
        Ok(handle)
    }

    fn write(&mut self, tx: &mut esp_ota_handle_t, data: &[u8]) -> Result<(), PartitionError> {
        check(unsafe { esp_ota_write(*tx, data.as_ptr() as *const c_void, data.len() as _) })
    }

    fn finalize(&mut self, tx: esp_ota_handle_t) -> Result<(), PartitionError> {
        // esp_ota_end releases the handle whether or not validation passes
        check(unsafe { esp_ota_end(tx) })
    }

    fn abort(&mut self, tx: esp_ota_handle_t) {
        let result = unsafe { esp_ota_abort(tx) };
        if result != ESP_OK as esp_err_t {
            log::warn!("esp_ota_abort failed: {}", error_name(result));
        }
    }

    fn commit_boot_target(&mut self, partition: &FlashPartition) -> Result<(), PartitionError> {
        let raw = self.raw(partition)?;
        check(unsafe { esp_ota_set_boot_partition(raw) })
    }
}

fn to_flash_partition(raw: *const esp_partition_t) -> Option<FlashPartition> {
    let p = unsafe { raw.as_ref() }?;
    let label = unsafe { CStr::from_ptr(p.label.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Some(FlashPartition::new(label, p.address, p.size))
}

fn check(code: esp_err_t) -> Result<(), PartitionError> {
    if code == ESP_OK as esp_err_t {
        Ok(())
    } else {
        Err(PartitionError::new(code, error_name(code)))
    }
}

fn error_name(code: esp_err_t) -> String {
    unsafe { CStr::from_ptr(esp_err_to_name(code)) }
        .to_string_lossy()
        .into_owned()
}

fn not_found(name: &str) -> PartitionError {
    PartitionError::new(ESP_ERR_NOT_FOUND as esp_err_t, name)
}
