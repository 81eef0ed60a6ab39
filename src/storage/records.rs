//! Typed codecs for the per-peer and per-adapter tables.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Category, OptionalExt, Storage, StoreError, StoreResult};
use crate::bluetooth::address::Address;

/// Longest name the controller can carry.
pub const MAX_NAME_LEN: usize = 248;

/// Size of a stored extended inquiry response.
pub const EIR_LEN: usize = 240;

/// Longest PIN code handed to the controller.
pub const MAX_PIN_LEN: usize = 16;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Truncates to [`MAX_NAME_LEN`] bytes on a character boundary and replaces
/// control characters with `.`.
pub fn sanitize_name(name: &str) -> String {
   let mut out = heapless::String::<MAX_NAME_LEN>::new();
   for c in name.chars() {
      let c = if (c as u32) < 0x20 || c == '\x7f' { '.' } else { c };
      if out.push(c).is_err() {
         break;
      }
   }
   out.as_str().to_string()
}

fn truncate_name(mut name: String) -> String {
   if name.len() > MAX_NAME_LEN {
      let mut end = MAX_NAME_LEN;
      while !name.is_char_boundary(end) {
         end -= 1;
      }
      name.truncate(end);
   }
   name
}

fn decode_fixed<const N: usize>(text: &str) -> StoreResult<[u8; N]> {
   let hex = text
      .get(..N * 2)
      .ok_or_else(|| StoreError::malformed(format!("expected {} hex digits", N * 2)))?;
   let mut out = [0u8; N];
   hex::decode_to_slice(hex, &mut out)
      .map_err(|e| StoreError::malformed(format!("bad hex {hex:?}: {e}")))?;
   Ok(out)
}

fn parse_hex_u32(text: &str) -> StoreResult<u32> {
   let digits = text
      .strip_prefix("0x")
      .or_else(|| text.strip_prefix("0X"))
      .unwrap_or(text);
   u32::from_str_radix(digits, 16).map_err(|_| StoreError::malformed(format!("bad hex {text:?}")))
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>, what: &str) -> StoreResult<T> {
   field
      .and_then(|f| f.parse().ok())
      .ok_or_else(|| StoreError::malformed(format!("bad {what}")))
}

/// How to fill the PIN-length column of a link key row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLength {
   /// Writes the full row with this length.
   Known(u8),
   /// Rewrites key and type only and keeps the stored tail.
   Refresh,
}

/// A classic BR/EDR link key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkKey {
   pub key: [u8; 16],
   pub key_type: u8,
   pub pin_length: Option<u8>,
}

/// Manufacturer and LMP version of a remote controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
   pub manufacturer: u16,
   pub lmp_version: u8,
   pub lmp_subversion: u16,
}

/// Stored LMP feature pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteFeatures {
   pub page1: Option<[u8; 8]>,
   pub page2: Option<[u8; 8]>,
}

/// Radio technologies a peer has been seen with.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
pub enum DeviceType {
   #[default]
   Unknown = 0x00,
   BrEdr = 0x01,
   LeOnly = 0x02,
   DualMode = 0x03,
}

/// Stored LE connection parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeParams {
   pub prohibit_remote_chg: u8,
   pub filter_policy: u8,
   pub scan_interval: u16,
   pub scan_window: u16,
   pub interval_min: u16,
   pub interval_max: u16,
   pub latency: u16,
   pub supervision_timeout: u16,
   pub min_ce_len: u16,
   pub max_ce_len: u16,
   pub conn_timeout: u16,
}

impl LeParams {
   fn encode(&self) -> String {
      format!(
         "{:02X} {:02X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X} {:04X}",
         self.prohibit_remote_chg,
         self.filter_policy,
         self.scan_interval,
         self.scan_window,
         self.interval_min,
         self.interval_max,
         self.latency,
         self.supervision_timeout,
         self.min_ce_len,
         self.max_ce_len,
         self.conn_timeout,
      )
   }

   fn decode(text: &str) -> StoreResult<Self> {
      let fields = text
         .split_whitespace()
         .map(|f| u16::from_str_radix(f, 16))
         .collect::<Result<Vec<_>, _>>()
         .map_err(|_| StoreError::malformed("bad le_params field"))?;
      let [a, b, c, d, e, f, g, h, i, j, k] = fields[..] else {
         return Err(StoreError::malformed(format!(
            "le_params has {} fields, expected 11",
            fields.len()
         )));
      };
      let byte = |v: u16| u8::try_from(v).map_err(|_| StoreError::malformed("le_params byte"));
      Ok(Self {
         prohibit_remote_chg: byte(a)?,
         filter_policy: byte(b)?,
         scan_interval: c,
         scan_window: d,
         interval_min: e,
         interval_max: f,
         latency: g,
         supervision_timeout: h,
         min_ce_len: i,
         max_ce_len: j,
         conn_timeout: k,
      })
   }
}

/// Scan mode of a local adapter.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AdapterMode {
   Off,
   Connectable,
   Discoverable,
}

const CONFIG_NAME: &str = "name";
const CONFIG_CLASS: &str = "class";
const CONFIG_DISCOVTO: &str = "discovto";
const CONFIG_PAIRTO: &str = "pairto";
const CONFIG_MODE: &str = "mode";
const CONFIG_ONMODE: &str = "onmode";
const CONFIG_PAIRABLE: &str = "pairable";

impl Storage {
   fn peer_get(&self, adapter: &Address, category: Category, peer: &Address) -> StoreResult<String> {
      self.table().get(adapter, category, &peer.to_string())
   }

   fn peer_put(
      &self,
      adapter: &Address,
      category: Category,
      peer: &Address,
      value: &str,
   ) -> StoreResult<()> {
      self.table().put(adapter, category, &peer.to_string(), value)
   }

   // Names

   pub fn write_device_name(&self, adapter: &Address, peer: &Address, name: &str) -> StoreResult<()> {
      self.peer_put(adapter, Category::Names, peer, &sanitize_name(name))
   }

   pub fn read_device_name(&self, adapter: &Address, peer: &Address) -> StoreResult<String> {
      self.peer_get(adapter, Category::Names, peer).map(truncate_name)
   }

   pub fn write_local_name(&self, adapter: &Address, name: &str) -> StoreResult<()> {
      self
         .table()
         .put(adapter, Category::Config, CONFIG_NAME, &sanitize_name(name))
   }

   pub fn read_local_name(&self, adapter: &Address) -> StoreResult<String> {
      self
         .table()
         .get(adapter, Category::Config, CONFIG_NAME)
         .map(truncate_name)
   }

   pub fn write_device_alias(&self, adapter: &Address, peer: &Address, alias: &str) -> StoreResult<()> {
      self.peer_put(adapter, Category::Aliases, peer, &sanitize_name(alias))
   }

   pub fn read_device_alias(&self, adapter: &Address, peer: &Address) -> StoreResult<String> {
      self.peer_get(adapter, Category::Aliases, peer).map(truncate_name)
   }

   pub fn delete_device_alias(&self, adapter: &Address, peer: &Address) -> StoreResult<()> {
      self
         .table()
         .delete(adapter, Category::Aliases, &peer.to_string())
   }

   // Class of device

   pub fn write_remote_class(&self, adapter: &Address, peer: &Address, class: u32) -> StoreResult<()> {
      self.peer_put(adapter, Category::Classes, peer, &format!("0x{:06x}", class & 0xFF_FFFF))
   }

   pub fn read_remote_class(&self, adapter: &Address, peer: &Address) -> StoreResult<u32> {
      parse_hex_u32(&self.peer_get(adapter, Category::Classes, peer)?)
   }

   pub fn write_local_class(&self, adapter: &Address, class: u32) -> StoreResult<()> {
      self
         .table()
         .put(adapter, Category::Config, CONFIG_CLASS, &format!("0x{:06x}", class & 0xFF_FFFF))
   }

   pub fn read_local_class(&self, adapter: &Address) -> StoreResult<u32> {
      parse_hex_u32(&self.table().get(adapter, Category::Config, CONFIG_CLASS)?)
   }

   // Inquiry data

   pub fn write_remote_eir(
      &self,
      adapter: &Address,
      peer: &Address,
      data: &[u8; EIR_LEN],
   ) -> StoreResult<()> {
      self.peer_put(adapter, Category::Eir, peer, &hex::encode_upper(data))
   }

   pub fn read_remote_eir(&self, adapter: &Address, peer: &Address) -> StoreResult<[u8; EIR_LEN]> {
      decode_fixed(&self.peer_get(adapter, Category::Eir, peer)?)
   }

   pub fn write_version_info(&self, adapter: &Address, peer: &Address, info: VersionInfo) -> StoreResult<()> {
      let value = format!("{} {} {}", info.manufacturer, info.lmp_version, info.lmp_subversion);
      self.peer_put(adapter, Category::Manufacturers, peer, &value)
   }

   pub fn read_version_info(&self, adapter: &Address, peer: &Address) -> StoreResult<VersionInfo> {
      let value = self.peer_get(adapter, Category::Manufacturers, peer)?;
      let mut fields = value.split(' ');
      Ok(VersionInfo {
         manufacturer: parse_field(fields.next(), "manufacturer")?,
         lmp_version: parse_field(fields.next(), "lmp version")?,
         lmp_subversion: parse_field(fields.next(), "lmp subversion")?,
      })
   }

   /// Writes LMP feature pages; an absent page keeps its stored value.
   pub fn write_features_info(
      &self,
      adapter: &Address,
      peer: &Address,
      page1: Option<&[u8; 8]>,
      page2: Option<&[u8; 8]>,
   ) -> StoreResult<()> {
      let old = self
         .peer_get(adapter, Category::Features, peer)
         .optional()?
         .unwrap_or_default();

      let zeros = "0".repeat(16);
      let p1 = match page1 {
         Some(page) => hex::encode_upper(page),
         None => old.get(..16).unwrap_or(&zeros).to_string(),
      };
      let p2 = match page2 {
         Some(page) => hex::encode_upper(page),
         None => old.get(17..33).unwrap_or(&zeros).to_string(),
      };
      self.peer_put(adapter, Category::Features, peer, &format!("{p1} {p2}"))
   }

   pub fn read_remote_features(&self, adapter: &Address, peer: &Address) -> StoreResult<RemoteFeatures> {
      let value = self.peer_get(adapter, Category::Features, peer)?;
      let page1 = if value.len() >= 16 {
         Some(decode_fixed::<8>(&value)?)
      } else {
         None
      };
      let page2 = match value.get(17..) {
         Some(tail) if tail.len() >= 16 => Some(decode_fixed::<8>(tail)?),
         _ => None,
      };
      if page1.is_none() && page2.is_none() {
         return Err(StoreError::NotFound);
      }
      Ok(RemoteFeatures { page1, page2 })
   }

   // Timestamps

   pub fn write_lastseen_info(&self, adapter: &Address, peer: &Address, at: DateTime<Utc>) -> StoreResult<()> {
      self.peer_put(adapter, Category::LastSeen, peer, &at.format(TIMESTAMP_FORMAT).to_string())
   }

   pub fn write_lastused_info(&self, adapter: &Address, peer: &Address, at: DateTime<Utc>) -> StoreResult<()> {
      self.peer_put(adapter, Category::LastUsed, peer, &at.format(TIMESTAMP_FORMAT).to_string())
   }

   pub fn read_lastseen_info(&self, adapter: &Address, peer: &Address) -> StoreResult<DateTime<Utc>> {
      parse_timestamp(&self.peer_get(adapter, Category::LastSeen, peer)?)
   }

   pub fn read_lastused_info(&self, adapter: &Address, peer: &Address) -> StoreResult<DateTime<Utc>> {
      parse_timestamp(&self.peer_get(adapter, Category::LastUsed, peer)?)
   }

   // Link keys

   pub fn write_link_key(
      &self,
      adapter: &Address,
      peer: &Address,
      key: &[u8; 16],
      key_type: u8,
      pin_length: PinLength,
   ) -> StoreResult<()> {
      let head = format!("{} {key_type}", hex::encode_upper(key));
      let value = match pin_length {
         PinLength::Known(len) => format!("{head} {len}"),
         PinLength::Refresh => {
            let old = self.peer_get(adapter, Category::LinkKeys, peer).optional()?;
            let tail = old
               .as_deref()
               .map(|row| row.split(' ').skip(2).collect::<Vec<_>>().join(" "))
               .filter(|tail| !tail.is_empty())
               .unwrap_or_else(|| "-1".to_string());
            format!("{head} {tail}")
         },
      };
      self.peer_put(adapter, Category::LinkKeys, peer, &value)
   }

   pub fn read_link_key(&self, adapter: &Address, peer: &Address) -> StoreResult<LinkKey> {
      let value = self.peer_get(adapter, Category::LinkKeys, peer)?;
      let mut fields = value.split(' ');
      let key = decode_fixed::<16>(fields.next().unwrap_or_default())?;
      let key_type = parse_field(fields.next(), "link key type")?;
      let pin_length = fields
         .next()
         .and_then(|f| f.parse::<i32>().ok())
         .and_then(|len| u8::try_from(len).ok());
      Ok(LinkKey {
         key,
         key_type,
         pin_length,
      })
   }

   pub fn delete_link_key(&self, adapter: &Address, peer: &Address) -> StoreResult<()> {
      self
         .table()
         .delete(adapter, Category::LinkKeys, &peer.to_string())
   }

   // PIN codes

   /// Returns the stored PIN text, cut to [`MAX_PIN_LEN`] bytes worth of
   /// characters. A `$` hex PIN keeps two digits per byte.
   pub fn read_pin_code(&self, adapter: &Address, peer: &Address) -> StoreResult<String> {
      let pin = self.peer_get(adapter, Category::PinCodes, peer)?;
      let limit = if pin.starts_with('$') {
         1 + 2 * MAX_PIN_LEN
      } else {
         MAX_PIN_LEN
      };
      Ok(pin.chars().take(limit).collect())
   }

   pub fn write_pin_code(&self, adapter: &Address, peer: &Address, pin: &str) -> StoreResult<()> {
      self.peer_put(adapter, Category::PinCodes, peer, pin)
   }

   // Trust and block lists

   /// Adds or removes `service` from the peer's trust list.
   pub fn write_trust(
      &self,
      adapter: &Address,
      peer: &Address,
      service: &str,
      trusted: bool,
   ) -> StoreResult<()> {
      if service.is_empty() || service.contains(char::is_whitespace) {
         return Err(StoreError::InvalidInput("service must be a single token"));
      }

      let key = peer.to_string();
      let current = self
         .table()
         .get_nocase(adapter, Category::Trusts, &key)
         .optional()?
         .unwrap_or_default();
      let mut services: Vec<&str> = current.split_whitespace().collect();

      if services.contains(&service) == trusted {
         return Ok(());
      }
      if trusted {
         services.push(service);
      } else {
         services.retain(|s| *s != service);
      }

      if services.is_empty() {
         self.table().delete_nocase(adapter, Category::Trusts, &key)
      } else {
         self
            .table()
            .put_nocase(adapter, Category::Trusts, &key, &services.join(" "))
      }
   }

   pub fn read_trust(&self, adapter: &Address, peer: &Address, service: &str) -> StoreResult<bool> {
      let services = self
         .table()
         .get_nocase(adapter, Category::Trusts, &peer.to_string())
         .optional()?;
      Ok(services.is_some_and(|s| s.split_whitespace().any(|t| t == service)))
   }

   /// Peers trusting `service`. A missing table yields an empty list.
   pub fn list_trusts(&self, adapter: &Address, service: &str) -> StoreResult<Vec<Address>> {
      let mut peers = Vec::new();
      let result = self.table().for_each(adapter, Category::Trusts, |key, value| {
         if value.split_whitespace().any(|t| t == service)
            && let Ok(addr) = key.parse()
         {
            peers.push(addr);
         }
      });
      match result {
         Ok(()) | Err(StoreError::NotFound) => Ok(peers),
         Err(e) => Err(e),
      }
   }

   pub fn write_blocked(&self, adapter: &Address, peer: &Address, blocked: bool) -> StoreResult<()> {
      let key = peer.to_string();
      if blocked {
         self.table().put_nocase(adapter, Category::Blocked, &key, "")
      } else {
         self
            .table()
            .delete_nocase(adapter, Category::Blocked, &key)
            .optional()
            .map(drop)
      }
   }

   pub fn read_blocked(&self, adapter: &Address, peer: &Address) -> StoreResult<bool> {
      Ok(self
         .table()
         .get_nocase(adapter, Category::Blocked, &peer.to_string())
         .optional()?
         .is_some())
   }

   // Misc per-peer tables

   pub fn write_device_profiles(&self, adapter: &Address, peer: &Address, profiles: &str) -> StoreResult<()> {
      self.peer_put(adapter, Category::Profiles, peer, profiles)
   }

   pub fn read_device_profiles(&self, adapter: &Address, peer: &Address) -> StoreResult<String> {
      self.peer_get(adapter, Category::Profiles, peer)
   }

   pub fn write_device_type(&self, adapter: &Address, peer: &Address, kind: DeviceType) -> StoreResult<()> {
      self
         .table()
         .put(adapter, Category::Types, &peer.to_string(), &format!("{:02X}", kind as u8))
   }

   /// Stored device type, `Unknown` when none has been recorded.
   pub fn read_device_type(&self, adapter: &Address, peer: &Address) -> StoreResult<DeviceType> {
      let Some(value) = self
         .table()
         .get_nocase(adapter, Category::Types, &peer.to_string())
         .optional()?
      else {
         return Ok(DeviceType::Unknown);
      };
      u8::from_str_radix(value.trim(), 16)
         .ok()
         .and_then(DeviceType::from_repr)
         .ok_or_else(|| StoreError::malformed(format!("bad device type {value:?}")))
   }

   /// Stores connection parameters, or deletes them when `params` is `None`.
   pub fn write_le_params(
      &self,
      adapter: &Address,
      peer: &Address,
      params: Option<&LeParams>,
   ) -> StoreResult<()> {
      match params {
         Some(params) => self.peer_put(adapter, Category::LeParams, peer, &params.encode()),
         None => self
            .table()
            .delete(adapter, Category::LeParams, &peer.to_string()),
      }
   }

   pub fn read_le_params(&self, adapter: &Address, peer: &Address) -> StoreResult<LeParams> {
      LeParams::decode(&self.peer_get(adapter, Category::LeParams, peer)?)
   }

   // GATT caches

   pub fn write_device_services(&self, adapter: &Address, peer: &Address, services: &str) -> StoreResult<()> {
      self.peer_put(adapter, Category::Primary, peer, services)
   }

   pub fn read_device_services(&self, adapter: &Address, peer: &Address) -> StoreResult<String> {
      self
         .table()
         .get_nocase(adapter, Category::Primary, &peer.to_string())
   }

   /// Deletes the primary services row and every characteristic and attribute
   /// row of the peer.
   pub fn delete_device_service(&self, adapter: &Address, peer: &Address) -> StoreResult<()> {
      self
         .table()
         .delete(adapter, Category::Primary, &peer.to_string())?;
      for category in [Category::Characteristic, Category::Attributes] {
         self
            .table()
            .delete_where(adapter, category, |key| peer.prefixes(key))
            .optional()?;
      }
      Ok(())
   }

   pub fn write_device_characteristics(
      &self,
      adapter: &Address,
      peer: &Address,
      handle: u16,
      chars: &str,
   ) -> StoreResult<()> {
      self
         .table()
         .put(adapter, Category::Characteristic, &handle_key(peer, handle), chars)
   }

   pub fn read_device_characteristics(
      &self,
      adapter: &Address,
      peer: &Address,
      handle: u16,
   ) -> StoreResult<String> {
      self
         .table()
         .get_nocase(adapter, Category::Characteristic, &handle_key(peer, handle))
   }

   pub fn write_device_attribute(
      &self,
      adapter: &Address,
      peer: &Address,
      handle: u16,
      value: &str,
   ) -> StoreResult<()> {
      self
         .table()
         .put(adapter, Category::Attributes, &handle_key(peer, handle), value)
   }

   /// Cached attribute values of a peer, in file order.
   pub fn read_device_attributes(&self, adapter: &Address, peer: &Address) -> StoreResult<Vec<(u16, String)>> {
      let mut out = Vec::new();
      self.table().for_each(adapter, Category::Attributes, |key, value| {
         if peer.prefixes(key)
            && let Some(handle) = key
               .split_once('#')
               .and_then(|(_, h)| u16::from_str_radix(h, 16).ok())
         {
            out.push((handle, value.to_string()));
         }
      })?;
      Ok(out)
   }

   // Adapter configuration

   pub fn write_discoverable_timeout(&self, adapter: &Address, timeout: u32) -> StoreResult<()> {
      self
         .table()
         .put(adapter, Category::Config, CONFIG_DISCOVTO, &timeout.to_string())
   }

   pub fn read_discoverable_timeout(&self, adapter: &Address) -> StoreResult<u32> {
      let value = self.table().get(adapter, Category::Config, CONFIG_DISCOVTO)?;
      parse_field(Some(&value), "discoverable timeout")
   }

   pub fn write_pairable_timeout(&self, adapter: &Address, timeout: u32) -> StoreResult<()> {
      self
         .table()
         .put(adapter, Category::Config, CONFIG_PAIRTO, &timeout.to_string())
   }

   pub fn read_pairable_timeout(&self, adapter: &Address) -> StoreResult<u32> {
      let value = self.table().get(adapter, Category::Config, CONFIG_PAIRTO)?;
      parse_field(Some(&value), "pairable timeout")
   }

   /// Stores the scan mode; any mode other than `Off` is also remembered as
   /// the mode to restore on power-up.
   pub fn write_device_mode(&self, adapter: &Address, mode: AdapterMode) -> StoreResult<()> {
      let value: &'static str = mode.into();
      if mode != AdapterMode::Off {
         self.table().put(adapter, Category::Config, CONFIG_ONMODE, value)?;
      }
      self.table().put(adapter, Category::Config, CONFIG_MODE, value)
   }

   pub fn read_device_mode(&self, adapter: &Address) -> StoreResult<AdapterMode> {
      parse_mode(&self.table().get(adapter, Category::Config, CONFIG_MODE)?)
   }

   pub fn read_on_mode(&self, adapter: &Address) -> StoreResult<AdapterMode> {
      parse_mode(&self.table().get(adapter, Category::Config, CONFIG_ONMODE)?)
   }

   pub fn write_device_pairable(&self, adapter: &Address, pairable: bool) -> StoreResult<()> {
      self.table().put(
         adapter,
         Category::Config,
         CONFIG_PAIRABLE,
         if pairable { "yes" } else { "no" },
      )
   }

   pub fn read_device_pairable(&self, adapter: &Address) -> StoreResult<bool> {
      Ok(self.table().get(adapter, Category::Config, CONFIG_PAIRABLE)? == "yes")
   }
}

fn handle_key(peer: &Address, handle: u16) -> String {
   format!("{peer}#{handle:04X}")
}

fn parse_mode(value: &str) -> StoreResult<AdapterMode> {
   value
      .parse()
      .map_err(|_| StoreError::malformed(format!("bad adapter mode {value:?}")))
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
   NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
      .map(|t| t.and_utc())
      .map_err(|e| StoreError::malformed(format!("bad timestamp {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
   use chrono::TimeZone;
   use tempfile::TempDir;

   use super::*;

   const ADAPTER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const PEER: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   fn create_storage() -> (Storage, TempDir) {
      let dir = TempDir::new().unwrap();
      (Storage::new(dir.path()), dir)
   }

   #[test]
   fn test_link_key_round_trip() {
      let (storage, _dir) = create_storage();
      let key = [
         0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54, 0x32,
         0x10,
      ];
      storage
         .write_link_key(&ADAPTER, &PEER, &key, 4, PinLength::Known(4))
         .unwrap();

      let raw = storage
         .table()
         .get(&ADAPTER, Category::LinkKeys, &PEER.to_string())
         .unwrap();
      assert_eq!(raw, "0123456789ABCDEFFEDCBA9876543210 4 4");

      let stored = storage.read_link_key(&ADAPTER, &PEER).unwrap();
      assert_eq!(stored.key, key);
      assert_eq!(stored.key_type, 4);
      assert_eq!(stored.pin_length, Some(4));
   }

   #[test]
   fn test_link_key_refresh_keeps_tail() {
      let (storage, _dir) = create_storage();
      storage
         .write_link_key(&ADAPTER, &PEER, &[0x11; 16], 0, PinLength::Known(6))
         .unwrap();
      storage
         .write_link_key(&ADAPTER, &PEER, &[0x22; 16], 5, PinLength::Refresh)
         .unwrap();

      let stored = storage.read_link_key(&ADAPTER, &PEER).unwrap();
      assert_eq!(stored.key, [0x22; 16]);
      assert_eq!(stored.key_type, 5);
      assert_eq!(stored.pin_length, Some(6));
   }

   #[test]
   fn test_link_key_refresh_without_row() {
      let (storage, _dir) = create_storage();
      storage
         .write_link_key(&ADAPTER, &PEER, &[0x33; 16], 3, PinLength::Refresh)
         .unwrap();
      let stored = storage.read_link_key(&ADAPTER, &PEER).unwrap();
      assert_eq!(stored.pin_length, None);
   }

   #[test]
   fn test_name_sanitized_and_truncated() {
      let (storage, _dir) = create_storage();
      storage
         .write_device_name(&ADAPTER, &PEER, "bad\x01name\x7f")
         .unwrap();
      assert_eq!(storage.read_device_name(&ADAPTER, &PEER).unwrap(), "bad.name.");

      let long = "x".repeat(300);
      storage.write_device_name(&ADAPTER, &PEER, &long).unwrap();
      assert_eq!(
         storage.read_device_name(&ADAPTER, &PEER).unwrap().len(),
         MAX_NAME_LEN
      );

      // Multi-byte characters are never split.
      let wide = "é".repeat(200);
      let stored = sanitize_name(&wide);
      assert!(stored.len() <= MAX_NAME_LEN);
      assert_eq!(stored.chars().count(), MAX_NAME_LEN / 2);
   }

   #[test]
   fn test_classes_and_config() {
      let (storage, _dir) = create_storage();
      storage.write_remote_class(&ADAPTER, &PEER, 0x5a020c).unwrap();
      assert_eq!(
         storage
            .table()
            .get(&ADAPTER, Category::Classes, &PEER.to_string())
            .unwrap(),
         "0x5a020c"
      );
      assert_eq!(storage.read_remote_class(&ADAPTER, &PEER).unwrap(), 0x5a020c);

      storage.write_local_class(&ADAPTER, 0x00010c).unwrap();
      assert_eq!(storage.read_local_class(&ADAPTER).unwrap(), 0x00010c);

      storage.write_local_name(&ADAPTER, "host\tname").unwrap();
      assert_eq!(storage.read_local_name(&ADAPTER).unwrap(), "host.name");

      storage.write_discoverable_timeout(&ADAPTER, 180).unwrap();
      storage.write_pairable_timeout(&ADAPTER, 0).unwrap();
      assert_eq!(storage.read_discoverable_timeout(&ADAPTER).unwrap(), 180);
      assert_eq!(storage.read_pairable_timeout(&ADAPTER).unwrap(), 0);

      storage.write_device_pairable(&ADAPTER, false).unwrap();
      assert!(!storage.read_device_pairable(&ADAPTER).unwrap());
   }

   #[test]
   fn test_device_mode_tracks_on_mode() {
      let (storage, _dir) = create_storage();
      storage
         .write_device_mode(&ADAPTER, AdapterMode::Discoverable)
         .unwrap();
      storage.write_device_mode(&ADAPTER, AdapterMode::Off).unwrap();

      assert_eq!(storage.read_device_mode(&ADAPTER).unwrap(), AdapterMode::Off);
      assert_eq!(
         storage.read_on_mode(&ADAPTER).unwrap(),
         AdapterMode::Discoverable
      );
   }

   #[test]
   fn test_features_carry_forward() {
      let (storage, _dir) = create_storage();
      let page1 = [0xFF, 0xFE, 0x8F, 0xFE, 0xD8, 0x3F, 0x5B, 0x87];
      let page2 = [0x01, 0, 0, 0, 0, 0, 0, 0];

      storage
         .write_features_info(&ADAPTER, &PEER, Some(&page1), None)
         .unwrap();
      storage
         .write_features_info(&ADAPTER, &PEER, None, Some(&page2))
         .unwrap();

      let features = storage.read_remote_features(&ADAPTER, &PEER).unwrap();
      assert_eq!(features.page1, Some(page1));
      assert_eq!(features.page2, Some(page2));
   }

   #[test]
   fn test_features_bad_hex_is_malformed() {
      let (storage, _dir) = create_storage();
      storage
         .table()
         .put(&ADAPTER, Category::Features, &PEER.to_string(), "ZZZZZZZZZZZZZZZZ 0000000000000000")
         .unwrap();
      assert!(matches!(
         storage.read_remote_features(&ADAPTER, &PEER),
         Err(StoreError::Malformed(_))
      ));
   }

   #[test]
   fn test_eir_blob_and_short_value() {
      let (storage, _dir) = create_storage();
      let mut data = [0u8; EIR_LEN];
      data[..4].copy_from_slice(&[0x03, 0x09, b'H', b'i']);
      storage.write_remote_eir(&ADAPTER, &PEER, &data).unwrap();
      assert_eq!(storage.read_remote_eir(&ADAPTER, &PEER).unwrap(), data);

      storage
         .table()
         .put(&ADAPTER, Category::Eir, &PEER.to_string(), "0309")
         .unwrap();
      assert!(matches!(
         storage.read_remote_eir(&ADAPTER, &PEER),
         Err(StoreError::Malformed(_))
      ));
   }

   #[test]
   fn test_version_info() {
      let (storage, _dir) = create_storage();
      let info = VersionInfo {
         manufacturer: 15,
         lmp_version: 6,
         lmp_subversion: 8704,
      };
      storage.write_version_info(&ADAPTER, &PEER, info).unwrap();
      assert_eq!(
         storage
            .table()
            .get(&ADAPTER, Category::Manufacturers, &PEER.to_string())
            .unwrap(),
         "15 6 8704"
      );
      assert_eq!(storage.read_version_info(&ADAPTER, &PEER).unwrap(), info);
   }

   #[test]
   fn test_timestamps() {
      let (storage, _dir) = create_storage();
      let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 4, 5).unwrap();
      storage.write_lastseen_info(&ADAPTER, &PEER, at).unwrap();
      storage.write_lastused_info(&ADAPTER, &PEER, at).unwrap();

      assert_eq!(
         storage
            .table()
            .get(&ADAPTER, Category::LastSeen, &PEER.to_string())
            .unwrap(),
         "2024-03-09 17:04:05 UTC"
      );
      assert_eq!(storage.read_lastseen_info(&ADAPTER, &PEER).unwrap(), at);
      assert_eq!(storage.read_lastused_info(&ADAPTER, &PEER).unwrap(), at);
   }

   #[test]
   fn test_pin_code_is_capped() {
      let (storage, _dir) = create_storage();
      storage
         .write_pin_code(&ADAPTER, &PEER, "12345678901234567890")
         .unwrap();
      assert_eq!(
         storage.read_pin_code(&ADAPTER, &PEER).unwrap(),
         "1234567890123456"
      );
   }

   #[test]
   fn test_hex_pin_code_keeps_all_bytes() {
      let (storage, _dir) = create_storage();
      let pin = format!("${}", "AB".repeat(MAX_PIN_LEN));
      storage.write_pin_code(&ADAPTER, &PEER, &pin).unwrap();
      assert_eq!(storage.read_pin_code(&ADAPTER, &PEER).unwrap(), pin);

      storage
         .write_pin_code(&ADAPTER, &PEER, &format!("{pin}CDEF"))
         .unwrap();
      assert_eq!(storage.read_pin_code(&ADAPTER, &PEER).unwrap(), pin);
   }

   #[test]
   fn test_trust_is_idempotent() {
      let (storage, _dir) = create_storage();
      storage.write_trust(&ADAPTER, &PEER, "[all]", true).unwrap();
      storage.write_trust(&ADAPTER, &PEER, "[all]", true).unwrap();
      storage.write_trust(&ADAPTER, &PEER, "hfp", true).unwrap();

      assert_eq!(
         storage
            .table()
            .get_nocase(&ADAPTER, Category::Trusts, &PEER.to_string())
            .unwrap(),
         "[all] hfp"
      );
      assert!(storage.read_trust(&ADAPTER, &PEER, "hfp").unwrap());
      assert!(!storage.read_trust(&ADAPTER, &PEER, "a2dp").unwrap());
      assert_eq!(storage.list_trusts(&ADAPTER, "[all]").unwrap(), vec![PEER]);

      storage.write_trust(&ADAPTER, &PEER, "hfp", false).unwrap();
      storage.write_trust(&ADAPTER, &PEER, "hfp", false).unwrap();
      storage.write_trust(&ADAPTER, &PEER, "[all]", false).unwrap();

      assert!(matches!(
         storage
            .table()
            .get_nocase(&ADAPTER, Category::Trusts, &PEER.to_string()),
         Err(StoreError::NotFound)
      ));
      assert!(storage.list_trusts(&ADAPTER, "[all]").unwrap().is_empty());
   }

   #[test]
   fn test_list_trusts_matches_whole_tokens() {
      let (storage, _dir) = create_storage();
      storage.write_trust(&ADAPTER, &PEER, "hfp-ag", true).unwrap();
      assert!(storage.list_trusts(&ADAPTER, "hfp").unwrap().is_empty());
   }

   #[test]
   fn test_blocked_toggle() {
      let (storage, _dir) = create_storage();
      assert!(!storage.read_blocked(&ADAPTER, &PEER).unwrap());
      storage.write_blocked(&ADAPTER, &PEER, true).unwrap();
      assert!(storage.read_blocked(&ADAPTER, &PEER).unwrap());
      storage.write_blocked(&ADAPTER, &PEER, false).unwrap();
      storage.write_blocked(&ADAPTER, &PEER, false).unwrap();
      assert!(!storage.read_blocked(&ADAPTER, &PEER).unwrap());
   }

   #[test]
   fn test_device_type_defaults_unknown() {
      let (storage, _dir) = create_storage();
      assert_eq!(
         storage.read_device_type(&ADAPTER, &PEER).unwrap(),
         DeviceType::Unknown
      );
      storage
         .write_device_type(&ADAPTER, &PEER, DeviceType::DualMode)
         .unwrap();
      assert_eq!(
         storage.read_device_type(&ADAPTER, &PEER).unwrap(),
         DeviceType::DualMode
      );
   }

   #[test]
   fn test_le_params() {
      let (storage, _dir) = create_storage();
      let params = LeParams {
         prohibit_remote_chg: 1,
         filter_policy: 0,
         scan_interval: 0x0060,
         scan_window: 0x0030,
         interval_min: 0x0018,
         interval_max: 0x0028,
         latency: 0,
         supervision_timeout: 0x01F4,
         min_ce_len: 0,
         max_ce_len: 0,
         conn_timeout: 0x0BB8,
      };
      storage.write_le_params(&ADAPTER, &PEER, Some(&params)).unwrap();
      assert_eq!(storage.read_le_params(&ADAPTER, &PEER).unwrap(), params);

      storage
         .table()
         .put(&ADAPTER, Category::LeParams, &PEER.to_string(), "01 00 0060")
         .unwrap();
      assert!(matches!(
         storage.read_le_params(&ADAPTER, &PEER),
         Err(StoreError::Malformed(_))
      ));

      storage.write_le_params(&ADAPTER, &PEER, None).unwrap();
      assert!(matches!(
         storage.read_le_params(&ADAPTER, &PEER),
         Err(StoreError::NotFound)
      ));
   }

   #[test]
   fn test_service_delete_cascades() {
      let (storage, _dir) = create_storage();
      let other = Address([1, 2, 3, 4, 5, 6]);
      storage
         .write_device_services(&ADAPTER, &PEER, "0001#0005#1800")
         .unwrap();
      storage
         .write_device_characteristics(&ADAPTER, &PEER, 0x0001, "0002#02#0003#2a00")
         .unwrap();
      storage
         .write_device_characteristics(&ADAPTER, &other, 0x0001, "keep")
         .unwrap();
      storage
         .write_device_attribute(&ADAPTER, &PEER, 0x0003, "4E616D65")
         .unwrap();

      assert_eq!(
         storage.read_device_attributes(&ADAPTER, &PEER).unwrap(),
         vec![(0x0003, "4E616D65".to_string())]
      );

      storage.delete_device_service(&ADAPTER, &PEER).unwrap();
      assert!(storage.read_device_services(&ADAPTER, &PEER).is_err());
      assert!(
         storage
            .read_device_characteristics(&ADAPTER, &PEER, 0x0001)
            .is_err()
      );
      assert!(storage.read_device_attributes(&ADAPTER, &PEER).unwrap().is_empty());
      assert_eq!(
         storage
            .read_device_characteristics(&ADAPTER, &other, 0x0001)
            .unwrap(),
         "keep"
      );
   }

   #[test]
   fn test_alias_sanitized_like_name() {
      let (storage, _dir) = create_storage();
      storage.write_device_alias(&ADAPTER, &PEER, "a\x01b\x7f").unwrap();
      assert_eq!(storage.read_device_alias(&ADAPTER, &PEER).unwrap(), "a.b.");

      storage
         .write_device_alias(&ADAPTER, &PEER, &"y".repeat(300))
         .unwrap();
      assert_eq!(
         storage.read_device_alias(&ADAPTER, &PEER).unwrap().len(),
         MAX_NAME_LEN
      );
   }

   #[test]
   fn test_alias_and_profiles() {
      let (storage, _dir) = create_storage();
      storage.write_device_alias(&ADAPTER, &PEER, "Kitchen").unwrap();
      assert_eq!(storage.read_device_alias(&ADAPTER, &PEER).unwrap(), "Kitchen");
      storage.delete_device_alias(&ADAPTER, &PEER).unwrap();
      assert!(storage.read_device_alias(&ADAPTER, &PEER).is_err());

      storage
         .write_device_profiles(&ADAPTER, &PEER, "0000110b-0000-1000-8000-00805f9b34fb")
         .unwrap();
      assert!(
         storage
            .read_device_profiles(&ADAPTER, &PEER)
            .unwrap()
            .starts_with("0000110b")
      );
   }
}
