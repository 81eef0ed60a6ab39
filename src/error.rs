//! Error types for the host daemon.
//!
//! Storage and parser failures are recoverable and carry their own enums;
//! this module folds them into [`HostError`] for the service layers.

use thiserror::Error;

use crate::{
   bluetooth::{
      address::{Address, InvalidAddress},
      eir::EirError,
   },
   storage::StoreError,
};

/// Main error type for the host daemon.
#[derive(Error, Debug)]
pub enum HostError {
   #[error("Storage error: {0}")]
   Store(#[from] StoreError),

   #[error("EIR error: {0}")]
   Eir(#[from] EirError),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error(transparent)]
   InvalidAddress(#[from] InvalidAddress),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Adapter not found: {0}")]
   AdapterNotFound(Address),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Transport error: {0}")]
   Transport(String),

   #[error("No agent available")]
   NoAgent,

   #[error("Already bonding with {0}")]
   AlreadyBonding(Address),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `HostError`.
pub type Result<T> = std::result::Result<T, HostError>;
