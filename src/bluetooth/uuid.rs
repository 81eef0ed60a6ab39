//! Promotion of short Bluetooth UUIDs into the 128-bit base UUID space.

use uuid::Uuid;

/// `00000000-0000-1000-8000-00805F9B34FB`
pub const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

pub const fn from_u16(short: u16) -> Uuid {
   from_u32(short as u32)
}

pub const fn from_u32(short: u32) -> Uuid {
   Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// PnP Information service class.
pub const PNP_INFO: Uuid = from_u16(0x1200);
