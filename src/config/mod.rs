use lazy_static::lazy_static;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::agent::{DEFAULT_MAX_TIMEOUTS, EXIT_CONFIG};
use crate::models::DeviceNode;

const CONFIG_ENV: &str = "M2M_CONFIG";
const CONFIG_PATHS: [&str; 2] = ["config/m2m.yaml", "m2m.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration found, tried {0}")]
    NotFound(String),
    #[error("Configuration I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration can not be parsed: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Configuration section {0} is not known")]
    UnknownBase(String),
}

fn link_timeout_default() -> u64 { return 5000 }
fn link_poll_delay_default() -> u64 { return 200 }
fn link_max_timeouts_default() -> u32 { return DEFAULT_MAX_TIMEOUTS }

/// TCP target of the meter gateway and the polling timings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    #[serde(default="link_timeout_default", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default="link_poll_delay_default", alias = "polldelay")]
    pub poll_delay_ms: u64,
    #[serde(default="link_max_timeouts_default")]
    pub max_timeouts: u32,
}

fn mqtt_client_name_default() -> String { return "meterlink2mqtt".to_string() }
fn mqtt_base_topic_default() -> String { return "meterlink".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Debug)]
pub enum ConfigOperation {
    ADD,
    DELETE,
    CHANGE
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConfigChange {
    pub operation: ConfigOperation,
    pub base: String, /* link, mqtt or devices */
}

#[derive(Clone)]
pub struct Callbacks {
    sender: tokio::sync::broadcast::Sender<ConfigChange>,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub link: LinkConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub devices: Vec<DeviceNode>,
}

pub struct ConfigHolder {
    pub config: Config,
    pub callbacks: Callbacks,
    pub dirty: bool,
    pub path: PathBuf,
}

pub enum ConfigBases {
    Link(LinkConfig),
    Mqtt(MqttConfig),
    Devices(Vec<DeviceNode>),
}

impl ConfigHolder {
    /// Environment override first, then the usual places
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return ConfigHolder::load_from(Path::new(&path));
        }

        for path in CONFIG_PATHS {
            if Path::new(path).exists() {
                return ConfigHolder::load_from(Path::new(path));
            }
        }

        Err(ConfigError::NotFound(CONFIG_PATHS.join(", ")))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let c: Config = serde_yml::from_str(&contents)?;
        info!("Configuration loaded from {}, {} device records", path.display(), c.devices.len());

        let (s, _) = tokio::sync::broadcast::channel(100);
        return Ok(ConfigHolder {
            config: c,
            callbacks: Callbacks { sender: s },
            dirty: false,
            path: path.to_path_buf(),
        })
    }

    pub fn save(&mut self) -> Result<(), ConfigError> {
        /* No need to write config if it's not dirty */
        if !self.dirty {
            debug!("Who ever called me, the config is not dirty");
            return Ok(());
        }

        let backup_path = self.path.with_extension("yaml.bak");
        fs::copy(&self.path, &backup_path)?;

        let x = serde_yml::to_string(&self.config)?;
        fs::write(&self.path, x.as_bytes())?;
        info!("New Config written to {}", self.path.display());
        self.dirty = false;
        Ok(())
    }

    pub fn get_change_receiver(&self) -> tokio::sync::broadcast::Receiver<ConfigChange> {
        return self.callbacks.sender.subscribe();
    }

    pub fn is_dirty(&self) -> bool {
        return self.dirty;
    }

    pub fn update_config(&mut self, operation: ConfigOperation, new_data: ConfigBases) {
        let base: &str;

        match new_data {
            ConfigBases::Link(link_config) => {
                self.config.link = link_config;
                base = "link";
            },
            ConfigBases::Mqtt(mqtt_config) => {
                self.config.mqtt = mqtt_config;
                base = "mqtt";
            },
            ConfigBases::Devices(devices) => {
                self.config.devices = devices;
                base = "devices";
            },
        }

        self.dirty = true;

        /* Nobody listening is fine, e.g. during startup */
        let _ = self.callbacks.sender.send(ConfigChange { operation: operation, base: base.to_string()});
    }

    pub fn get_copy(&self, base: &str) -> Result<ConfigBases, ConfigError> {
        match base {
            "link" => { return Ok(ConfigBases::Link(self.config.link.clone())) },
            "mqtt" => { return Ok(ConfigBases::Mqtt(self.config.mqtt.clone())) },
            "devices" => { return Ok(ConfigBases::Devices(self.config.devices.clone())) },
            _ => { Err(ConfigError::UnknownBase(base.to_string())) }
        }
    }

    /// Snapshot of the whole device/channel tree
    pub fn get_devices(&self) -> Vec<DeviceNode> {
        return self.config.devices.clone();
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<ConfigHolder> = RwLock::new(ConfigHolder::load().unwrap_or_else(|e| {
        error!("{e}");
        std::process::exit(EXIT_CONFIG);
    }));
}

/* A panic while holding the lock does not make the configuration itself invalid */
pub fn config_read() -> RwLockReadGuard<'static, ConfigHolder> {
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

pub fn config_write() -> RwLockWriteGuard<'static, ConfigHolder> {
    CONFIG.write().unwrap_or_else(|e| e.into_inner())
}

#[macro_export]
macro_rules! get_config_or_panic {
    ($base: expr, $pat: path) => {
        {
            let c = $crate::config::config_read().get_copy($base);
            match c {
                Ok($pat(a)) => a,
                _ => panic!(
                    "mismatch variant when cast to {}",
                    stringify!($pat)),
            }
        }
    };
}
