//! Persistent per-adapter device storage.
//!
//! Storage is partitioned by local adapter address, then by [`Category`],
//! then by peer key. [`Storage`] wraps the flat-file tables and exposes the
//! typed record codec on top of them.

pub mod lekeys;
pub mod records;
pub mod sdp;
pub mod textfile;

use std::path::{Path, PathBuf};

use thiserror::Error;

use self::textfile::TextStore;
use crate::bluetooth::address::Address;

/// Recoverable storage failures.
#[derive(Error, Debug)]
pub enum StoreError {
   #[error("Not found")]
   NotFound,

   #[error("Malformed record: {0}")]
   Malformed(String),

   #[error("Invalid input: {0}")]
   InvalidInput(&'static str),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),
}

impl StoreError {
   pub(crate) fn malformed(what: impl Into<String>) -> Self {
      Self::Malformed(what.into())
   }

   pub const fn is_not_found(&self) -> bool {
      matches!(self, Self::NotFound)
   }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Folds `NotFound` into `None`.
pub(crate) trait OptionalExt<T> {
   fn optional(self) -> StoreResult<Option<T>>;
}

impl<T> OptionalExt<T> for StoreResult<T> {
   fn optional(self) -> StoreResult<Option<T>> {
      match self {
         Ok(v) => Ok(Some(v)),
         Err(StoreError::NotFound) => Ok(None),
         Err(e) => Err(e),
      }
   }
}

/// One table per adapter; the file name is the lowercase variant name.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum Category {
   #[strum(serialize = "linkkeys")]
   LinkKeys,
   #[strum(serialize = "lekeys")]
   LeKeys,
   Names,
   Aliases,
   Classes,
   Eir,
   Manufacturers,
   Features,
   #[strum(serialize = "lastseen")]
   LastSeen,
   #[strum(serialize = "lastused")]
   LastUsed,
   #[strum(serialize = "pincodes")]
   PinCodes,
   Trusts,
   Blocked,
   Sdp,
   Did,
   Primary,
   Characteristic,
   Attributes,
   Types,
   LeParams,
   Config,
   Profiles,
}

impl Category {
   /// Permission bits for newly created tables.
   pub const fn mode(self) -> u32 {
      match self {
         Self::LinkKeys | Self::LeKeys | Self::PinCodes => 0o600,
         _ => 0o644,
      }
   }

   /// Categories holding exactly one row per peer address.
   pub const PER_PEER: &'static [Self] = &[
      Self::LinkKeys,
      Self::Names,
      Self::Aliases,
      Self::Classes,
      Self::Eir,
      Self::Manufacturers,
      Self::Features,
      Self::LastSeen,
      Self::LastUsed,
      Self::PinCodes,
      Self::Trusts,
      Self::Blocked,
      Self::Did,
      Self::Primary,
      Self::Types,
      Self::LeParams,
      Self::Profiles,
   ];
}

/// Typed access to the device store.
#[derive(Debug, Clone)]
pub struct Storage {
   table: TextStore,
}

impl Storage {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self {
         table: TextStore::new(root),
      }
   }

   pub fn root(&self) -> &Path {
      self.table.root()
   }

   pub fn table(&self) -> &TextStore {
      &self.table
   }

   /// Deletes every row keyed by `peer` in every category, including
   /// composite keys and the LE key record.
   pub fn remove_device_storage(&self, adapter: &Address, peer: &Address) -> StoreResult<()> {
      let key = peer.to_string();
      for &category in Category::PER_PEER {
         match self.table.delete_nocase(adapter, category, &key) {
            Ok(()) | Err(StoreError::NotFound) => {},
            Err(e) => return Err(e),
         }
      }

      self.delete_all_records(adapter, peer)?;
      for category in [Category::Characteristic, Category::Attributes] {
         match self.table.delete_where(adapter, category, |k| peer.prefixes(k)) {
            Ok(_) | Err(StoreError::NotFound) => {},
            Err(e) => return Err(e),
         }
      }

      match self.delete_le_keys(adapter, peer) {
         Ok(()) | Err(StoreError::NotFound) => Ok(()),
         Err(e) => Err(e),
      }
   }
}
