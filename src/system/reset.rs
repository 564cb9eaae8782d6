/// Restart handling and reset reason reporting

use esp_idf_hal::delay::FreeRtos;
use log::info;
use updater_core::Restart;

/// Restart used once a new image has been committed
pub struct EspRestart {
    delay_ms: u32,
}

impl EspRestart {
    pub fn new(delay_ms: u32) -> Self {
        Self { delay_ms }
    }
}

impl Restart for EspRestart {
    fn restart(&mut self) {
        info!("Restarting in {} ms", self.delay_ms);

        // Ensure log is flushed before the UART goes away
        log::logger().flush();
        FreeRtos::delay_ms(self.delay_ms);

        unsafe {
            esp_idf_sys::esp_restart();
        }
    }
}

/// Get the last reset reason as a string
pub fn get_reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_UNKNOWN => "Unknown",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SDIO => "SDIO",
        _ => "Unknown reason code",
    }
}
