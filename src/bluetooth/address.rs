//! Bluetooth device addresses.
//!
//! The canonical textual form of an address is the 17 character,
//! colon separated, upper-case string used as the storage key for every
//! per-peer row.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of the canonical textual address form.
pub const ADDRESS_STR_LEN: usize = 17;

/// A 48-bit Bluetooth device address, most significant octet first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 6]);

impl Address {
   pub const ANY: Self = Self([0; 6]);

   pub const fn new(octets: [u8; 6]) -> Self {
      Self(octets)
   }

   pub const fn octets(&self) -> [u8; 6] {
      self.0
   }

   /// Returns true if `key` starts with this address, ignoring case.
   ///
   /// Used for composite keys such as `AA:BB:CC:DD:EE:FF#0001`.
   pub fn prefixes(&self, key: &str) -> bool {
      key.get(..ADDRESS_STR_LEN)
         .is_some_and(|head| head.eq_ignore_ascii_case(&self.to_string()))
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl fmt::Debug for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Display::fmt(self, f)
   }
}

/// Error returned when a string is not a canonical address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: {0:?}")]
pub struct InvalidAddress(pub String);

impl FromStr for Address {
   type Err = InvalidAddress;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || InvalidAddress(s.to_string());
      if s.len() != ADDRESS_STR_LEN {
         return Err(invalid());
      }

      let mut octets = [0u8; 6];
      for (i, part) in s.split(':').enumerate() {
         if i >= octets.len() || part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
         }
         octets[i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
      }
      Ok(Self(octets))
   }
}

impl Serialize for Address {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for Address {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}

/// LE address type of a peer.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
   #[default]
   Public = 0x00,
   Random = 0x01,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_display_is_canonical() {
      let addr = Address([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);
      let s = addr.to_string();
      assert_eq!(s, "00:1A:7D:DA:71:13");
      assert_eq!(s.len(), ADDRESS_STR_LEN);
   }

   #[test]
   fn test_parse_accepts_lowercase() {
      let addr: Address = "00:1a:7d:da:71:13".parse().unwrap();
      assert_eq!(addr, Address([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]));
   }

   #[test]
   fn test_parse_rejects_bad_shapes() {
      for bad in ["", "00:11:22:33:44", "00:11:22:33:44:55:66", "0011:22:33:44:55", "GG:11:22:33:44:55"] {
         assert!(bad.parse::<Address>().is_err(), "{bad} parsed");
      }
   }

   #[test]
   fn test_prefixes_composite_keys() {
      let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
      assert!(addr.prefixes("aa:bb:cc:dd:ee:ff#0001"));
      assert!(addr.prefixes("AA:BB:CC:DD:EE:FF#00010000"));
      assert!(!addr.prefixes("AA:BB:CC:DD:EE:F0#0001"));
      assert!(!addr.prefixes("AA:BB"));
   }
}
