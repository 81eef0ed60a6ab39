//! Known peer devices of an adapter.

use log::warn;
use serde::Serialize;
use smol_str::SmolStr;

use super::address::{Address, AddressType};
use crate::storage::{
   OptionalExt, Storage,
   records::{DeviceType, LeParams},
};

/// Bonding progress of a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "status", rename_all = "lowercase")]
pub enum BondState {
   #[default]
   Unbonded,
   Bonding,
   Bonded,
   /// Last bonding attempt failed with this HCI status.
   Failed(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
   #[default]
   Disconnected,
   Connected,
}

/// Connection parameters last reported for an LE link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeConnParams {
   pub interval: u16,
   pub latency: u16,
   pub timeout: u16,
}

/// A peer the adapter keeps state for.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
   pub address: Address,
   pub addr_type: AddressType,
   pub le: bool,
   pub name: Option<SmolStr>,
   pub alias: Option<SmolStr>,
   pub class: u32,
   pub bond: BondState,
   pub conn: ConnState,
   pub temporary: bool,
   pub paired: bool,
   pub blocked: bool,
   pub le_hash: Option<u32>,
   pub rssi: Option<i8>,
   pub le_conn_params: Option<LeConnParams>,
   pub stored_le_params: Option<LeParams>,
}

impl Device {
   /// A fresh temporary device with no stored state.
   pub fn new(address: Address, le: bool) -> Self {
      Self {
         address,
         addr_type: AddressType::Public,
         le,
         name: None,
         alias: None,
         class: 0,
         bond: BondState::Unbonded,
         conn: ConnState::Disconnected,
         temporary: true,
         paired: false,
         blocked: false,
         le_hash: None,
         rssi: None,
         le_conn_params: None,
         stored_le_params: None,
      }
   }

   /// Builds a device from whatever the store holds for it. Peers with a
   /// stored key come back bonded and non-temporary.
   pub fn restore(storage: &Storage, adapter: &Address, address: Address, le: bool) -> Self {
      let mut dev = Self::new(address, le);

      macro_rules! load {
         ($what:literal, $expr:expr) => {
            match $expr.optional() {
               Ok(v) => v,
               Err(e) => {
                  warn!("{address}: failed to read stored {}: {e}", $what);
                  None
               },
            }
         };
      }

      dev.name = load!("name", storage.read_device_name(adapter, &address)).map(SmolStr::from);
      dev.alias = load!("alias", storage.read_device_alias(adapter, &address)).map(SmolStr::from);
      dev.class = load!("class", storage.read_remote_class(adapter, &address)).unwrap_or(0);
      dev.stored_le_params = load!("le params", storage.read_le_params(adapter, &address));
      dev.blocked = storage.read_blocked(adapter, &address).unwrap_or(false);

      if let Some(DeviceType::LeOnly) = load!("device type", storage.read_device_type(adapter, &address)) {
         dev.le = true;
      }

      let has_link_key = load!("link key", storage.read_link_key(adapter, &address)).is_some();
      let le_hash = load!("le keys", storage.find_le_record_hash(adapter, &address));
      dev.le_hash = le_hash;

      if has_link_key || le_hash.is_some() {
         dev.bond = BondState::Bonded;
         dev.paired = true;
         dev.temporary = false;
      }
      dev
   }

   /// Alias if set, else the remote name.
   pub fn display_name(&self) -> Option<&str> {
      self.alias.as_deref().or(self.name.as_deref())
   }

   pub const fn is_bonding(&self) -> bool {
      matches!(self.bond, BondState::Bonding)
   }

   pub const fn is_bonded(&self) -> bool {
      matches!(self.bond, BondState::Bonded)
   }

   pub const fn is_connected(&self) -> bool {
      matches!(self.conn, ConnState::Connected)
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;
   use crate::storage::records::PinLength;

   const ADAPTER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const PEER: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   #[test]
   fn test_new_device_is_temporary() {
      let dev = Device::new(PEER, false);
      assert!(dev.temporary);
      assert_eq!(dev.bond, BondState::Unbonded);
      assert_eq!(dev.display_name(), None);
   }

   #[test]
   fn test_restore_from_storage() {
      let dir = TempDir::new().unwrap();
      let storage = Storage::new(dir.path());
      storage.write_device_name(&ADAPTER, &PEER, "Headset").unwrap();
      storage.write_device_alias(&ADAPTER, &PEER, "Mine").unwrap();
      storage.write_remote_class(&ADAPTER, &PEER, 0x240404).unwrap();
      storage
         .write_link_key(&ADAPTER, &PEER, &[7; 16], 5, PinLength::Known(0))
         .unwrap();

      let dev = Device::restore(&storage, &ADAPTER, PEER, false);
      assert_eq!(dev.name.as_deref(), Some("Headset"));
      assert_eq!(dev.display_name(), Some("Mine"));
      assert_eq!(dev.class, 0x240404);
      assert!(dev.is_bonded());
      assert!(!dev.temporary);
   }

   #[test]
   fn test_restore_unknown_peer() {
      let dir = TempDir::new().unwrap();
      let storage = Storage::new(dir.path());
      let dev = Device::restore(&storage, &ADAPTER, PEER, true);
      assert!(dev.temporary);
      assert!(dev.le);
      assert_eq!(dev.le_hash, None);
   }
}
