//! Configuration management for the reader link service.
//!
//! This module handles loading and saving configuration from disk,
//! including the adapter selection, the reader name filter, and the
//! timing parameters of the scan and connect loops.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{ReaderLinkError, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter to use, e.g. `hci0`. The default adapter when absent.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   /// Case-insensitive name fragments of compatible readers.
   #[serde(default)]
   pub name_patterns: Vec<SmolStr>,

   #[serde(default = "default_scan_tick")]
   pub scan_tick_ms: u64,

   #[serde(default = "default_aging_window")]
   pub aging_window_sec: u64,

   #[serde(default = "default_watchdog_interval")]
   pub watchdog_interval_sec: u64,

   #[serde(default = "default_connect_poll")]
   pub connect_poll_ms: u64,

   #[serde(default = "default_connect_budget")]
   pub connect_budget: u32,
}

const fn default_scan_tick() -> u64 {
   50
}

const fn default_aging_window() -> u64 {
   10
}

const fn default_watchdog_interval() -> u64 {
   5
}

const fn default_connect_poll() -> u64 {
   500
}

const fn default_connect_budget() -> u32 {
   30
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         name_patterns: vec![],
         scan_tick_ms: default_scan_tick(),
         aging_window_sec: default_aging_window(),
         watchdog_interval_sec: default_watchdog_interval(),
         connect_poll_ms: default_connect_poll(),
         connect_budget: default_connect_budget(),
      }
   }
}

/// Timing parameters of the discovery core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
   pub scan_tick: Duration,
   pub aging_window: Duration,
   pub watchdog_interval: Duration,
   pub connect_poll: Duration,
   pub connect_budget: u32,
}

impl Default for Timing {
   fn default() -> Self {
      Config::default().timing()
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("READERLINK_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }

      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(ReaderLinkError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("readerlinkd").join("config.toml"))
   }

   /// Converts the raw settings into durations, clamping zero values.
   pub fn timing(&self) -> Timing {
      Timing {
         scan_tick: Duration::from_millis(self.scan_tick_ms.max(1)),
         aging_window: Duration::from_secs(self.aging_window_sec.max(1)),
         watchdog_interval: Duration::from_secs(self.watchdog_interval_sec.max(1)),
         connect_poll: Duration::from_millis(self.connect_poll_ms.max(1)),
         connect_budget: self.connect_budget.max(1),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_creates_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());

      // Second load reads what was written
      let again = Config::load_from(&path).unwrap();
      assert_eq!(again, config);
   }

   #[test]
   fn test_partial_file_uses_field_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "adapter = \"hci1\"\nname_patterns = [\"RFD\"]\nconnect_budget = 4\n",
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.name_patterns, vec![SmolStr::new("RFD")]);
      assert_eq!(config.connect_budget, 4);
      assert_eq!(config.aging_window_sec, 10);
      assert_eq!(config.scan_tick_ms, 50);
   }

   #[test]
   fn test_timing_defaults_and_clamping() {
      let timing = Config::default().timing();
      assert_eq!(timing.scan_tick, Duration::from_millis(50));
      assert_eq!(timing.aging_window, Duration::from_secs(10));
      assert_eq!(timing.watchdog_interval, Duration::from_secs(5));
      assert_eq!(timing.connect_poll, Duration::from_millis(500));
      assert_eq!(timing.connect_budget, 30);

      let zeroed = Config {
         scan_tick_ms: 0,
         connect_budget: 0,
         ..Config::default()
      };
      assert_eq!(zeroed.timing().scan_tick, Duration::from_millis(1));
      assert_eq!(zeroed.timing().connect_budget, 1);
   }

   #[test]
   fn test_invalid_toml_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "connect_budget = \"lots\"").unwrap();

      assert!(matches!(
         Config::load_from(&path),
         Err(ReaderLinkError::TomlParse(_))
      ));
   }
}
