// config.rs

use std::fmt;

use anyhow::bail;
use askama::Template;
use crc::{Crc, CRC_32_ISCSI};
use log::*;
use serde::{Deserialize, Serialize};

pub const NVS_BUF_SIZE: usize = 512;

const DEFAULT_API_PORT: u16 = 80;
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_PORTAL_SSID: &str = "Temperature Monitor";

pub const CONFIG_NAME: &str = "cfg";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Template)]
#[template(path = "portal.html.ask", escape = "html")]
pub struct MyConfig {
    pub port: u16,

    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub portal_ssid: String,

    pub mqtt_server: String,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_port: u16,
    pub mqtt_name: String,
}

impl Default for MyConfig {
    fn default() -> Self {
        Self {
            port: option_env!("API_PORT")
                .unwrap_or("-")
                .parse()
                .unwrap_or(DEFAULT_API_PORT),

            wifi_ssid: option_env!("WIFI_SSID").unwrap_or("").into(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or("").into(),
            portal_ssid: DEFAULT_PORTAL_SSID.into(),

            mqtt_server: option_env!("MQTT_SERVER").unwrap_or("server.local").into(),
            mqtt_user: "homeassistant".into(),
            mqtt_pass: "".into(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_name: "TempMon".into(),
        }
    }
}

/// The "MQTT" parameter group of the configuration portal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MqttSettings {
    pub server: String,
    pub user: String,
    pub pass: String,
    pub port: u16,
    pub name: String,
}

impl MqttSettings {
    pub fn is_used(&self) -> bool {
        !self.server.trim().is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    BadPort,
    EmptyName,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadPort => write!(f, "MQTT port must be between 1 and 65535"),
            ConfigError::EmptyName => write!(f, "MQTT name cannot be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl MyConfig {
    pub fn mqtt(&self) -> MqttSettings {
        MqttSettings {
            server: self.mqtt_server.trim().to_string(),
            user: self.mqtt_user.clone(),
            pass: self.mqtt_pass.clone(),
            port: self.mqtt_port,
            name: self.mqtt_name.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt_port == 0 {
            return Err(ConfigError::BadPort);
        }
        if self.mqtt_name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        Ok(())
    }

    pub fn wifi_changed(&self, other: &MyConfig) -> bool {
        self.wifi_ssid != other.wifi_ssid
            || self.wifi_pass != other.wifi_pass
            || self.portal_ssid != other.portal_ssid
            || self.port != other.port
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        match postcard::from_bytes_crc32::<MyConfig>(b, digest) {
            Ok(c) => {
                info!("Successfully parsed config.");
                Some(c)
            }
            Err(e) => {
                error!("Cannot parse config: {e:?}");
                None
            }
        }
    }

    pub fn to_bytes<'a>(&self, buf: &'a mut [u8]) -> anyhow::Result<&'a mut [u8]> {
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        match postcard::to_slice_crc32(self, buf, digest) {
            Ok(d) => Ok(d),
            Err(e) => {
                let estr = format!("Cannot encode config to buffer {e:?}");
                bail!("{estr}");
            }
        }
    }
}

/// Persistent home of [`MyConfig`].
pub trait ConfigStore {
    fn load(&mut self) -> Option<MyConfig>;
    fn save(&mut self, config: &MyConfig) -> anyhow::Result<()>;
}

/// Keeps the encoded config in RAM. Used by the host build and tests.
#[derive(Default)]
pub struct MemoryStore {
    data: Option<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.data.as_mut()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&mut self) -> Option<MyConfig> {
        MyConfig::from_bytes(self.data.as_deref()?)
    }

    fn save(&mut self, config: &MyConfig) -> anyhow::Result<()> {
        let mut buf = [0u8; NVS_BUF_SIZE];
        let data = config.to_bytes(&mut buf)?;
        self.data = Some(data.to_vec());
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub use nvs_store::*;

#[cfg(target_os = "espidf")]
mod nvs_store {
    use super::*;
    use esp_idf_svc::nvs;

    pub struct NvsStore {
        nvs: nvs::EspNvs<nvs::NvsDefault>,
    }

    impl NvsStore {
        pub fn new(nvs: nvs::EspNvs<nvs::NvsDefault>) -> Self {
            NvsStore { nvs }
        }
    }

    impl ConfigStore for NvsStore {
        fn load(&mut self) -> Option<MyConfig> {
            let mut nvsbuf = [0u8; NVS_BUF_SIZE];
            info!("Reading up to {sz} bytes from nvs...", sz = NVS_BUF_SIZE);
            let b = match self.nvs.get_raw(CONFIG_NAME, &mut nvsbuf) {
                Err(e) => {
                    error!("Nvs read error {e:?}");
                    return None;
                }
                Ok(Some(b)) => b,
                _ => {
                    error!("Nvs key not found");
                    return None;
                }
            };
            info!("Got {sz} bytes from nvs. Parsing config...", sz = b.len());
            MyConfig::from_bytes(b)
        }

        fn save(&mut self, config: &MyConfig) -> anyhow::Result<()> {
            let mut nvsbuf = [0u8; NVS_BUF_SIZE];
            let nvsdata = config.to_bytes(&mut nvsbuf)?;
            info!(
                "Encoded config to {sz} bytes. Saving to nvs...",
                sz = nvsdata.len()
            );

            match self.nvs.set_raw(CONFIG_NAME, nvsdata) {
                Ok(_) => {
                    info!("Config saved.");
                    Ok(())
                }
                Err(e) => {
                    let estr = format!("Cannot save to nvs: {e:?}");
                    bail!("{estr}");
                }
            }
        }
    }
}


// EOF
