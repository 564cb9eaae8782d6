use serde::{Deserialize, Serialize};
use updater_core::InstallerConfig;

#[cfg(target_os = "espidf")]
pub use nvs::load_or_default;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    // SD card update settings
    pub installer: InstallerConfig,

    // Console log level: off, error, warn, info, debug, trace
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            installer: InstallerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse a stored blob, falling back to defaults for an unusable installer section
    pub fn from_json(data: &[u8]) -> anyhow::Result<Self> {
        let mut config: Config = serde_json::from_slice(data)?;
        if let Err(e) = config.installer.validate() {
            log::warn!("Stored installer config rejected ({}), using defaults", e);
            config.installer = InstallerConfig::default();
        }
        Ok(config)
    }
}

#[cfg(target_os = "espidf")]
mod nvs {
    use super::Config;
    use anyhow::Result;
    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

    const CONFIG_NAMESPACE: &str = "sdupdater";
    const CONFIG_KEY: &str = "config";

    impl Config {
        pub fn save(&self, partition: &EspDefaultNvsPartition) -> Result<()> {
            let mut nvs = EspNvs::new(partition.clone(), CONFIG_NAMESPACE, true)?;
            let json = serde_json::to_vec(self)?;
            nvs.set_blob(CONFIG_KEY, &json)?;
            log::info!("Configuration saved to NVS");
            Ok(())
        }
    }

    pub fn load_or_default(partition: &EspDefaultNvsPartition) -> Result<Config> {
        match load_from_nvs(partition) {
            Ok(config) => {
                log::info!("Loaded configuration from NVS");
                Ok(config)
            }
            Err(e) => {
                log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
                let config = Config::default();

                // Try to save default config to NVS for next time
                if let Err(save_err) = config.save(partition) {
                    log::warn!("Failed to save default config to NVS: {:?}", save_err);
                }

                Ok(config)
            }
        }
    }

    fn load_from_nvs(partition: &EspDefaultNvsPartition) -> Result<Config> {
        let nvs = EspNvs::new(partition.clone(), CONFIG_NAMESPACE, true)?;

        let mut buf = vec![0u8; 1024]; // Max config size
        let data = nvs
            .get_blob(CONFIG_KEY, &mut buf)?
            .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

        Config::from_json(data)
    }
}
