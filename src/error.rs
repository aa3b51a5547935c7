//! Error types for the reader link service.
//!
//! This module defines every error that can surface while scanning for
//! readers, connecting to them, or serving the D-Bus interface.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the reader link service.
#[derive(Error, Debug)]
pub enum ReaderLinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Radio refused to start scanning: {0}")]
   ScanStartFailed(String),

   #[error("Connection to {0} timed out")]
   ConnectTimedOut(SmolStr),

   #[error("Connection to {0} was cancelled")]
   ConnectCancelled(SmolStr),

   #[error("Permission denied by the radio layer")]
   PermissionDenied,

   #[error("Invalid device address: {0}")]
   InvalidAddress(SmolStr),

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("A device is already connected")]
   AlreadyConnected,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("No connection attempt in progress")]
   NoActiveAttempt,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Supervisor has been shut down")]
   SupervisorShutdown,

   #[error("Adapter not found")]
   AdapterNotFound,
}

/// Convenience type alias for Results with `ReaderLinkError`.
pub type Result<T> = std::result::Result<T, ReaderLinkError>;
