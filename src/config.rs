//! Configuration management for the `btserial` client.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and connection parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
   error::{Result, SerialError},
   serial::charset::Charset,
};

/// Main configuration structure for the client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Charset name used for new connections.
   #[serde(default = "default_charset")]
   pub charset: String,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   /// RFCOMM channel used by the Bluetooth transport.
   #[serde(default = "default_bluetooth_channel")]
   pub bluetooth_channel: u8,
}

/// A device the user gave a name to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

fn default_charset() -> String {
   Charset::default().to_string()
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_bluetooth_channel() -> u8 {
   1
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         charset: default_charset(),
         connect_timeout_sec: default_connect_timeout(),
         bluetooth_channel: default_bluetooth_channel(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing defaults there if it is missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the configuration to `path`, creating missing directories.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      config_dir_with(|key| env::var(key).ok(), dirs::config_dir)
         .map(|dir| dir.join("btserial").join("config.toml"))
   }

   /// Parses the configured charset name.
   pub fn charset(&self) -> Result<Charset> {
      Charset::from_name(&self.charset)
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}

fn config_dir_with(
   var: impl Fn(&str) -> Option<String>,
   fallback: impl FnOnce() -> Option<PathBuf>,
) -> Result<PathBuf> {
   if let Some(home) = var("BTSERIAL_HOME") {
      Ok(PathBuf::from(home))
   } else if let Some(config_home) = var("XDG_CONFIG_HOME") {
      Ok(PathBuf::from(config_home))
   } else if let Some(home) = var("HOME") {
      Ok(PathBuf::from(home).join(".config"))
   } else {
      fallback().ok_or(SerialError::ConfigDirNotFound)
   }
}
