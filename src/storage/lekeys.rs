//! LE key records.
//!
//! All LE keys of one peer live in a single row of the `lekeys` table,
//! keyed by a 32-bit hash allocated from the `lasthash` row:
//!
//! ```text
//! AA:BB:CC:DD:EE:FF TT MM LL AU[ LTK EDIVRAND][ IRK IT ID:AD:DR:ES:SS:00][ CSRK CNT]
//! ```
//!
//! `MM` is the presence mask and the key blocks always appear in mask order.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use super::{Category, OptionalExt, Storage, StoreError, StoreResult};
use crate::bluetooth::address::{Address, AddressType};

const LAST_HASH: &str = "lasthash";

const MASK_LTK: u8 = 0x01;
const MASK_IRK: u8 = 0x02;
const MASK_CSRK: u8 = 0x04;

/// Key types at and above [`LeKeyKind::Ltk`] belong to the LE key store.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   PartialOrd,
   Ord,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
pub enum LeKeyKind {
   Ltk = 0x10,
   Irk = 0x11,
   Csrk = 0x12,
}

impl LeKeyKind {
   /// True when a link-key type belongs in the LE key store.
   pub const fn is_le(key_type: u8) -> bool {
      key_type >= Self::Ltk as u8
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ltk {
   pub key: [u8; 16],
   /// EDIV followed by Rand, as exchanged during pairing.
   pub ediv_rand: [u8; 10],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Irk {
   pub key: [u8; 16],
   pub id_type: AddressType,
   pub id_address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Csrk {
   pub key: [u8; 16],
   pub counter: [u8; 4],
}

/// One distributed LE key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LeKey {
   Ltk(Ltk),
   Irk(Irk),
   Csrk(Csrk),
}

impl LeKey {
   pub const fn kind(&self) -> LeKeyKind {
      match self {
         Self::Ltk(_) => LeKeyKind::Ltk,
         Self::Irk(_) => LeKeyKind::Irk,
         Self::Csrk(_) => LeKeyKind::Csrk,
      }
   }

   /// Builds a key from a key notification. `data` carries EDIV and Rand
   /// for an LTK, the identity type and little-endian address for an IRK,
   /// and the sign counter for a CSRK.
   pub fn from_wire(kind: LeKeyKind, key: [u8; 16], data: &[u8]) -> StoreResult<Self> {
      match kind {
         LeKeyKind::Ltk => {
            let ediv_rand = data
               .try_into()
               .map_err(|_| StoreError::InvalidInput("LTK data must be 10 bytes"))?;
            Ok(Self::Ltk(Ltk { key, ediv_rand }))
         },
         LeKeyKind::Irk => {
            let [id_type, rest @ ..] = data else {
               return Err(StoreError::InvalidInput("IRK data must be 7 bytes"));
            };
            let mut octets: [u8; 6] = rest
               .try_into()
               .map_err(|_| StoreError::InvalidInput("IRK data must be 7 bytes"))?;
            octets.reverse();
            let id_type = AddressType::from_repr(*id_type)
               .ok_or(StoreError::InvalidInput("unknown identity address type"))?;
            Ok(Self::Irk(Irk {
               key,
               id_type,
               id_address: Address(octets),
            }))
         },
         LeKeyKind::Csrk => {
            let counter = data
               .try_into()
               .map_err(|_| StoreError::InvalidInput("CSRK data must be 4 bytes"))?;
            Ok(Self::Csrk(Csrk { key, counter }))
         },
      }
   }
}

/// In-memory form of an `lekeys` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeKeyRecord {
   pub address: Address,
   pub addr_type: AddressType,
   pub length: u8,
   pub auth: u8,
   pub ltk: Option<Ltk>,
   pub irk: Option<Irk>,
   pub csrk: Option<Csrk>,
}

impl LeKeyRecord {
   pub fn new(address: Address, addr_type: AddressType, length: u8, auth: u8) -> Self {
      Self {
         address,
         addr_type,
         length,
         auth,
         ltk: None,
         irk: None,
         csrk: None,
      }
   }

   pub const fn mask(&self) -> u8 {
      let mut mask = 0;
      if self.ltk.is_some() {
         mask |= MASK_LTK;
      }
      if self.irk.is_some() {
         mask |= MASK_IRK;
      }
      if self.csrk.is_some() {
         mask |= MASK_CSRK;
      }
      mask
   }

   /// Replaces the slot of `key`'s kind.
   pub fn set(&mut self, key: LeKey) {
      match key {
         LeKey::Ltk(ltk) => self.ltk = Some(ltk),
         LeKey::Irk(irk) => self.irk = Some(irk),
         LeKey::Csrk(csrk) => self.csrk = Some(csrk),
      }
   }

   pub fn get(&self, kind: LeKeyKind) -> Option<LeKey> {
      match kind {
         LeKeyKind::Ltk => self.ltk.map(LeKey::Ltk),
         LeKeyKind::Irk => self.irk.map(LeKey::Irk),
         LeKeyKind::Csrk => self.csrk.map(LeKey::Csrk),
      }
   }

   /// Whether the row refers to `peer`, either directly or as the identity
   /// address behind an IRK.
   pub fn mentions(&self, peer: &Address) -> bool {
      self.address == *peer || self.irk.is_some_and(|irk| irk.id_address == *peer)
   }

   pub fn has_master_id(&self, master_id: &[u8; 10]) -> bool {
      self.ltk.is_some_and(|ltk| ltk.ediv_rand == *master_id)
   }

   pub fn parse(text: &str) -> StoreResult<Self> {
      let mut tokens = text.split_whitespace();
      let mut next = |what: &str| {
         tokens
            .next()
            .ok_or_else(|| StoreError::malformed(format!("lekeys row missing {what}")))
      };

      let address = next("address")?
         .parse::<Address>()
         .map_err(|e| StoreError::malformed(e.to_string()))?;
      let addr_type = AddressType::from_repr(hex_u8(next("address type")?)?)
         .ok_or_else(|| StoreError::malformed("lekeys row has bad address type"))?;
      let mask = hex_u8(next("mask")?)?;
      let length = hex_u8(next("key length")?)?;
      let auth = hex_u8(next("auth")?)?;

      let mut record = Self::new(address, addr_type, length, auth);
      if mask & MASK_LTK != 0 {
         record.ltk = Some(Ltk {
            key: hex_array(next("ltk")?)?,
            ediv_rand: hex_array(next("ediv/rand")?)?,
         });
      }
      if mask & MASK_IRK != 0 {
         let key = hex_array(next("irk")?)?;
         let id_type = AddressType::from_repr(hex_u8(next("identity type")?)?)
            .ok_or_else(|| StoreError::malformed("lekeys row has bad identity type"))?;
         let id_address = next("identity address")?
            .parse::<Address>()
            .map_err(|e| StoreError::malformed(e.to_string()))?;
         record.irk = Some(Irk {
            key,
            id_type,
            id_address,
         });
      }
      if mask & MASK_CSRK != 0 {
         record.csrk = Some(Csrk {
            key: hex_array(next("csrk")?)?,
            counter: hex_array(next("csrk counter")?)?,
         });
      }
      Ok(record)
   }
}

impl fmt::Display for LeKeyRecord {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "{} {:02X} {:02X} {:02X} {:02X}",
         self.address,
         self.addr_type as u8,
         self.mask(),
         self.length,
         self.auth
      )?;
      if let Some(ltk) = &self.ltk {
         write!(f, " {} {}", hex::encode_upper(ltk.key), hex::encode_upper(ltk.ediv_rand))?;
      }
      if let Some(irk) = &self.irk {
         write!(
            f,
            " {} {:02X} {}",
            hex::encode_upper(irk.key),
            irk.id_type as u8,
            irk.id_address
         )?;
      }
      if let Some(csrk) = &self.csrk {
         write!(f, " {} {}", hex::encode_upper(csrk.key), hex::encode_upper(csrk.counter))?;
      }
      Ok(())
   }
}

/// A key read back from the store with its record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredLeKey {
   pub hash: u32,
   pub addr_type: AddressType,
   pub length: u8,
   pub auth: u8,
   pub key: LeKey,
}

fn hex_u8(token: &str) -> StoreResult<u8> {
   u8::from_str_radix(token, 16).map_err(|_| StoreError::malformed(format!("bad hex byte {token:?}")))
}

fn hex_array<const N: usize>(token: &str) -> StoreResult<[u8; N]> {
   let mut out = [0u8; N];
   hex::decode_to_slice(token, &mut out)
      .map_err(|e| StoreError::malformed(format!("bad hex {token:?}: {e}")))?;
   Ok(out)
}

fn hash_key(hash: u32) -> String {
   format!("{hash:08X}")
}

impl Storage {
   /// First record hash whose row satisfies `pred`.
   fn find_le_hash(
      &self,
      adapter: &Address,
      mut pred: impl FnMut(&LeKeyRecord) -> bool,
   ) -> StoreResult<Option<u32>> {
      let mut found = None;
      let result = self.table().for_each(adapter, Category::LeKeys, |key, value| {
         if found.is_some() || key == LAST_HASH {
            return;
         }
         match LeKeyRecord::parse(value) {
            Ok(record) if pred(&record) => found = u32::from_str_radix(key, 16).ok(),
            Ok(_) => {},
            Err(e) => debug!("lekeys: skipping row {key}: {e}"),
         }
      });
      match result {
         Ok(()) | Err(StoreError::NotFound) => Ok(found),
         Err(e) => Err(e),
      }
   }

   fn allocate_le_hash(&self, adapter: &Address) -> StoreResult<u32> {
      let last = self
         .table()
         .get(adapter, Category::LeKeys, LAST_HASH)
         .optional()?
         .and_then(|v| u32::from_str_radix(v.trim(), 16).ok())
         .unwrap_or(0);
      let hash = last.wrapping_add(1).max(1);
      self
         .table()
         .put(adapter, Category::LeKeys, LAST_HASH, &hash_key(hash))?;
      debug!("lekeys: allocated hash {hash:08X}");
      Ok(hash)
   }

   /// Hash of the record holding keys for `peer`.
   pub fn find_le_record_hash(&self, adapter: &Address, peer: &Address) -> StoreResult<u32> {
      self
         .find_le_hash(adapter, |r| r.mentions(peer))?
         .ok_or(StoreError::NotFound)
   }

   /// Reads the whole record stored under `hash`.
   pub fn read_le_record(&self, adapter: &Address, hash: u32) -> StoreResult<LeKeyRecord> {
      let value = self.table().get(adapter, Category::LeKeys, &hash_key(hash))?;
      LeKeyRecord::parse(&value)
   }

   /// Merges `key` into the peer's record and returns the record hash.
   ///
   /// Without an explicit hash the record is located by address, and a new
   /// hash is allocated if none exists. Header fields of an existing record
   /// are kept.
   pub fn write_le_key(
      &self,
      adapter: &Address,
      peer: &Address,
      addr_type: AddressType,
      hash: Option<u32>,
      key: LeKey,
      length: u8,
      auth: u8,
   ) -> StoreResult<u32> {
      let hash = match hash {
         Some(hash) => hash,
         None => match self.find_le_hash(adapter, |r| r.mentions(peer))? {
            Some(hash) => hash,
            None => self.allocate_le_hash(adapter)?,
         },
      };

      let mut record = match self.read_le_record(adapter, hash) {
         Ok(record) => record,
         Err(StoreError::NotFound) => LeKeyRecord::new(*peer, addr_type, length, auth),
         Err(e) => return Err(e),
      };
      record.set(key);

      debug!("lekeys: {peer} {:?} mask {:02X}", key.kind(), record.mask());
      self
         .table()
         .put(adapter, Category::LeKeys, &hash_key(hash), &record.to_string())?;
      Ok(hash)
   }

   /// Reads one key kind. A record without that kind is `NotFound`.
   pub fn read_le_key(
      &self,
      adapter: &Address,
      peer: &Address,
      hash: Option<u32>,
      kind: LeKeyKind,
   ) -> StoreResult<StoredLeKey> {
      let hash = match hash {
         Some(hash) => hash,
         None => self
            .find_le_hash(adapter, |r| r.mentions(peer))?
            .ok_or(StoreError::NotFound)?,
      };
      let record = self.read_le_record(adapter, hash)?;
      let key = record.get(kind).ok_or(StoreError::NotFound)?;
      Ok(StoredLeKey {
         hash,
         addr_type: record.addr_type,
         length: record.length,
         auth: record.auth,
         key,
      })
   }

   /// Deletes the peer's LE key record.
   pub fn delete_le_keys(&self, adapter: &Address, peer: &Address) -> StoreResult<()> {
      let hash = self.find_le_record_hash(adapter, peer)?;
      self.delete_le_hash(adapter, hash)
   }

   pub fn delete_le_hash(&self, adapter: &Address, hash: u32) -> StoreResult<()> {
      self.table().delete(adapter, Category::LeKeys, &hash_key(hash))
   }

   /// Finds the record hash for a peer by address, then by master
   /// identification, allocating a fresh hash for a previously unseen peer.
   pub fn read_le_hash(
      &self,
      adapter: &Address,
      peer: Option<&Address>,
      master_id: Option<&[u8; 10]>,
   ) -> StoreResult<u32> {
      if let Some(peer) = peer
         && let Some(hash) = self.find_le_hash(adapter, |r| r.mentions(peer))?
      {
         return Ok(hash);
      }
      if let Some(mid) = master_id
         && let Some(hash) = self.find_le_hash(adapter, |r| r.has_master_id(mid))?
      {
         return Ok(hash);
      }
      self.allocate_le_hash(adapter)
   }
}
