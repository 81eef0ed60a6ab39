//! Extended inquiry response and LE advertising data parser.
//!
//! Both formats are a run of `len | type | payload[len - 1]` structures,
//! terminated by a zero length or the end of the buffer.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::uuid as bt_uuid;

pub const EIR_FLAGS: u8 = 0x01;
pub const EIR_UUID16_SOME: u8 = 0x02;
pub const EIR_UUID16_ALL: u8 = 0x03;
pub const EIR_UUID32_SOME: u8 = 0x04;
pub const EIR_UUID32_ALL: u8 = 0x05;
pub const EIR_UUID128_SOME: u8 = 0x06;
pub const EIR_UUID128_ALL: u8 = 0x07;
pub const EIR_NAME_SHORT: u8 = 0x08;
pub const EIR_NAME_COMPLETE: u8 = 0x09;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EirError {
   #[error("EIR field at offset {offset} needs {needed} bytes, {available} available")]
   Truncated {
      offset: usize,
      needed: usize,
      available: usize,
   },
}

/// Data extracted from one EIR or advertising payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EirData {
   pub flags: Option<u8>,
   pub name: Option<String>,
   pub name_complete: bool,
   /// 16-bit, then 32-bit, then 128-bit service UUIDs.
   pub services: Vec<Uuid>,
}

fn name_from(payload: &[u8]) -> String {
   std::str::from_utf8(payload).map(str::to_owned).unwrap_or_default()
}

/// Parses a complete payload. A field that overruns the buffer discards
/// everything collected so far.
pub fn parse(data: &[u8]) -> Result<EirData, EirError> {
   let mut eir = EirData::default();
   let mut uuid16 = Vec::new();
   let mut uuid32 = Vec::new();
   let mut uuid128 = Vec::new();

   let mut offset = 0;
   while offset < data.len() {
      let field_len = usize::from(data[offset]);
      if field_len == 0 {
         break;
      }

      let end = offset + 1 + field_len;
      if end > data.len() {
         return Err(EirError::Truncated {
            offset,
            needed: field_len + 1,
            available: data.len() - offset,
         });
      }

      let field_type = data[offset + 1];
      let payload = &data[offset + 2..end];
      match field_type {
         EIR_UUID16_SOME | EIR_UUID16_ALL => uuid16.extend(
            payload
               .chunks_exact(2)
               .map(|c| bt_uuid::from_u16(u16::from_le_bytes([c[0], c[1]]))),
         ),
         EIR_UUID32_SOME | EIR_UUID32_ALL => uuid32.extend(
            payload
               .chunks_exact(4)
               .map(|c| bt_uuid::from_u32(u32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
         ),
         EIR_UUID128_SOME | EIR_UUID128_ALL => uuid128.extend(payload.chunks_exact(16).map(|c| {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(c);
            bytes.reverse();
            Uuid::from_bytes(bytes)
         })),
         EIR_FLAGS => {
            if let Some(&flags) = payload.first() {
               eir.flags = Some(flags);
            }
         },
         EIR_NAME_COMPLETE => {
            eir.name = Some(name_from(payload));
            eir.name_complete = true;
         },
         EIR_NAME_SHORT if !eir.name_complete => {
            eir.name = Some(name_from(payload));
         },
         _ => {},
      }

      offset = end;
   }

   eir.services = uuid16;
   eir.services.extend(uuid32);
   eir.services.extend(uuid128);
   Ok(eir)
}
