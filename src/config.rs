//! Configuration management for the host daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including managed adapters, discovery timing and pre-provisioned peers.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::address::Address,
   error::{HostError, Result},
};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Root of the device store. Defaults to the user data directory.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub storage_dir: Option<PathBuf>,

   #[serde(default = "default_name_resolving")]
   pub name_resolving: bool,

   #[serde(default = "default_inquiry_interval")]
   pub inquiry_interval_sec: u64,

   #[serde(default = "default_found_device_keepalive")]
   pub found_device_keepalive_sec: u64,

   /// Local adapter addresses to manage.
   #[serde(default)]
   pub adapters: Vec<Address>,

   #[serde(default)]
   pub provisioned_devices: Vec<ProvisionedDevice>,
}

/// A peer installed as paired without radio pairing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProvisionedDevice {
   pub address: Address,
   pub name: String,
   #[serde(default)]
   pub vendor: u16,
   #[serde(default)]
   pub product: u16,
   #[serde(default)]
   pub version: u16,
   /// Serialized PnP Information SDP record, hex encoded.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub record: Option<String>,
}

const fn default_name_resolving() -> bool {
   true
}

const fn default_inquiry_interval() -> u64 {
   10
}

const fn default_found_device_keepalive() -> u64 {
   180
}

impl Default for Config {
   fn default() -> Self {
      Self {
         storage_dir: None,
         name_resolving: default_name_resolving(),
         inquiry_interval_sec: default_inquiry_interval(),
         found_device_keepalive_sec: default_found_device_keepalive(),
         adapters: vec![],
         provisioned_devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTHOSTD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(HostError::ConfigDirNotFound);
      };

      Ok(config_dir.join("bthostd").join("config.toml"))
   }

   /// Where the device store lives: `$BTHOSTD_STORAGE`, then
   /// `storage_dir`, then the platform data directory.
   pub fn storage_root(&self) -> Result<PathBuf> {
      if let Ok(dir) = env::var("BTHOSTD_STORAGE") {
         return Ok(PathBuf::from(dir));
      }
      if let Some(dir) = &self.storage_dir {
         return Ok(dir.clone());
      }
      dirs::data_local_dir()
         .map(|dir| dir.join("bthostd"))
         .ok_or(HostError::ConfigDirNotFound)
   }

   pub const fn inquiry_interval(&self) -> Duration {
      Duration::from_secs(self.inquiry_interval_sec)
   }

   pub const fn found_device_keepalive(&self) -> Duration {
      Duration::from_secs(self.found_device_keepalive_sec)
   }
}
