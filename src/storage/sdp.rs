//! Cached SDP records and the device ID derived from them.
//!
//! Records are kept as the serialized attribute list the remote returned.
//! Decoding goes only as deep as device ID resolution needs.

use log::debug;
use smallvec::SmallVec;
use uuid::Uuid;

use super::{Category, OptionalExt, Storage, StoreError, StoreResult};
use crate::bluetooth::{address::Address, uuid as bt_uuid};

pub const ATTR_RECORD_HANDLE: u16 = 0x0000;
pub const ATTR_SERVICE_CLASS_IDS: u16 = 0x0001;
pub const ATTR_VENDOR_ID: u16 = 0x0201;
pub const ATTR_PRODUCT_ID: u16 = 0x0202;
pub const ATTR_VERSION: u16 = 0x0203;
pub const ATTR_VENDOR_ID_SOURCE: u16 = 0x0205;

/// Source value cached when a peer has no PnP record.
pub const DID_SOURCE_NONE: u16 = 0xFFFF;

/// One SDP data element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
   Nil,
   Uint(u64),
   Sint(i64),
   Uuid(Uuid),
   Text(Vec<u8>),
   Bool(bool),
   Seq(Vec<DataElement>),
   Alt(Vec<DataElement>),
   Url(Vec<u8>),
   /// 128-bit integers and reserved types, kept undecoded.
   Opaque(u8, Vec<u8>),
}

const TYPE_NIL: u8 = 0;
const TYPE_UINT: u8 = 1;
const TYPE_SINT: u8 = 2;
const TYPE_UUID: u8 = 3;
const TYPE_TEXT: u8 = 4;
const TYPE_BOOL: u8 = 5;
const TYPE_SEQ: u8 = 6;
const TYPE_ALT: u8 = 7;
const TYPE_URL: u8 = 8;

/// Deepest sequence/alternative nesting accepted in a record.
const MAX_NESTING: usize = 32;

struct Reader<'a> {
   buf: &'a [u8],
}

impl<'a> Reader<'a> {
   fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
      if self.buf.len() < n {
         return Err(StoreError::malformed("sdp element runs past end of record"));
      }
      let (head, tail) = self.buf.split_at(n);
      self.buf = tail;
      Ok(head)
   }

   fn uint_be(&mut self, n: usize) -> StoreResult<u64> {
      Ok(self.take(n)?.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
   }

   fn element(&mut self, depth: usize) -> StoreResult<DataElement> {
      let header = self.take(1)?[0];
      let kind = header >> 3;
      let size_index = header & 0x07;

      let len = match size_index {
         0 if kind == TYPE_NIL => 0,
         0 => 1,
         1 => 2,
         2 => 4,
         3 => 8,
         4 => 16,
         5 => self.uint_be(1)? as usize,
         6 => self.uint_be(2)? as usize,
         _ => self.uint_be(4)? as usize,
      };
      let body = self.take(len)?;

      Ok(match (kind, len) {
         (TYPE_NIL, _) => DataElement::Nil,
         (TYPE_UINT, 1 | 2 | 4 | 8) => DataElement::Uint(Reader { buf: body }.uint_be(len)?),
         (TYPE_SINT, 1 | 2 | 4 | 8) => {
            let raw = Reader { buf: body }.uint_be(len)?;
            let shift = 64 - len * 8;
            DataElement::Sint(((raw << shift) as i64) >> shift)
         },
         (TYPE_UUID, 2) => DataElement::Uuid(bt_uuid::from_u16(Reader { buf: body }.uint_be(2)? as u16)),
         (TYPE_UUID, 4) => DataElement::Uuid(bt_uuid::from_u32(Reader { buf: body }.uint_be(4)? as u32)),
         (TYPE_UUID, 16) => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(body);
            DataElement::Uuid(Uuid::from_bytes(bytes))
         },
         (TYPE_TEXT, _) => DataElement::Text(body.to_vec()),
         (TYPE_BOOL, 1) => DataElement::Bool(body[0] != 0),
         (TYPE_SEQ | TYPE_ALT, _) => {
            if depth >= MAX_NESTING {
               return Err(StoreError::malformed("sdp sequences nested too deep"));
            }
            let mut inner = Reader { buf: body };
            let mut items = Vec::new();
            while !inner.buf.is_empty() {
               items.push(inner.element(depth + 1)?);
            }
            if kind == TYPE_SEQ {
               DataElement::Seq(items)
            } else {
               DataElement::Alt(items)
            }
         },
         (TYPE_URL, _) => DataElement::Url(body.to_vec()),
         _ => DataElement::Opaque(kind, body.to_vec()),
      })
   }
}

impl DataElement {
   pub fn parse(buf: &[u8]) -> StoreResult<Self> {
      Reader { buf }.element(0)
   }

   pub const fn as_uint(&self) -> Option<u64> {
      match self {
         Self::Uint(v) => Some(*v),
         _ => None,
      }
   }

   fn write_header(out: &mut Vec<u8>, kind: u8, len: usize) {
      let fixed = match len {
         1 => Some(0),
         2 => Some(1),
         4 => Some(2),
         8 => Some(3),
         16 => Some(4),
         _ => None,
      };
      match (kind, fixed) {
         (TYPE_UINT | TYPE_SINT | TYPE_UUID | TYPE_BOOL, Some(index)) => out.push(kind << 3 | index),
         _ if len <= 0xFF => out.extend_from_slice(&[kind << 3 | 5, len as u8]),
         _ if len <= 0xFFFF => {
            out.push(kind << 3 | 6);
            out.extend_from_slice(&(len as u16).to_be_bytes());
         },
         _ => {
            out.push(kind << 3 | 7);
            out.extend_from_slice(&(len as u32).to_be_bytes());
         },
      }
   }

   /// Serializes in the smallest encoding; integers are written as 16 bits
   /// when they fit, which is what every PnP attribute uses.
   pub fn write_to(&self, out: &mut Vec<u8>) {
      match self {
         Self::Nil => out.push(0),
         Self::Uint(v) => {
            let bytes: SmallVec<[u8; 8]> = if *v <= u64::from(u16::MAX) {
               SmallVec::from_slice(&(*v as u16).to_be_bytes())
            } else if *v <= u64::from(u32::MAX) {
               SmallVec::from_slice(&(*v as u32).to_be_bytes())
            } else {
               SmallVec::from_slice(&v.to_be_bytes())
            };
            Self::write_header(out, TYPE_UINT, bytes.len());
            out.extend_from_slice(&bytes);
         },
         Self::Sint(v) => {
            Self::write_header(out, TYPE_SINT, 8);
            out.extend_from_slice(&v.to_be_bytes());
         },
         Self::Uuid(uuid) => {
            let value = uuid.as_u128();
            if value & !(0xFFFF_u128 << 96) == bt_uuid::BASE_UUID && value >> 112 == 0 {
               Self::write_header(out, TYPE_UUID, 2);
               out.extend_from_slice(&((value >> 96) as u16).to_be_bytes());
            } else {
               Self::write_header(out, TYPE_UUID, 16);
               out.extend_from_slice(uuid.as_bytes());
            }
         },
         Self::Text(bytes) | Self::Url(bytes) => {
            let kind = if matches!(self, Self::Text(_)) { TYPE_TEXT } else { TYPE_URL };
            Self::write_header(out, kind, bytes.len());
            out.extend_from_slice(bytes);
         },
         Self::Bool(b) => {
            Self::write_header(out, TYPE_BOOL, 1);
            out.push(u8::from(*b));
         },
         Self::Seq(items) | Self::Alt(items) => {
            let kind = if matches!(self, Self::Seq(_)) { TYPE_SEQ } else { TYPE_ALT };
            let mut body = Vec::new();
            for item in items {
               item.write_to(&mut body);
            }
            Self::write_header(out, kind, body.len());
            out.extend_from_slice(&body);
         },
         Self::Opaque(kind, bytes) => {
            Self::write_header(out, *kind, bytes.len());
            out.extend_from_slice(bytes);
         },
      }
   }
}

/// A serialized service record together with its decoded attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpRecord {
   pub handle: u32,
   pub attributes: Vec<(u16, DataElement)>,
   raw: Vec<u8>,
}

impl SdpRecord {
   /// Decodes the top-level attribute list of a record.
   pub fn from_bytes(raw: &[u8]) -> StoreResult<Self> {
      let DataElement::Seq(items) = DataElement::parse(raw)? else {
         return Err(StoreError::malformed("sdp record is not a sequence"));
      };
      if items.len() % 2 != 0 {
         return Err(StoreError::malformed("sdp record has a dangling attribute id"));
      }

      let mut attributes = Vec::with_capacity(items.len() / 2);
      let mut pairs = items.into_iter();
      while let (Some(id), Some(value)) = (pairs.next(), pairs.next()) {
         let id = id
            .as_uint()
            .and_then(|id| u16::try_from(id).ok())
            .ok_or_else(|| StoreError::malformed("sdp attribute id is not a uint16"))?;
         attributes.push((id, value));
      }

      let handle = attributes
         .iter()
         .find(|(id, _)| *id == ATTR_RECORD_HANDLE)
         .and_then(|(_, v)| v.as_uint())
         .and_then(|h| u32::try_from(h).ok())
         .ok_or_else(|| StoreError::malformed("sdp record has no handle"))?;

      Ok(Self {
         handle,
         attributes,
         raw: raw.to_vec(),
      })
   }

   /// Builds a record from attributes, sorted by id.
   pub fn new(handle: u32, mut attributes: Vec<(u16, DataElement)>) -> Self {
      attributes.retain(|(id, _)| *id != ATTR_RECORD_HANDLE);
      attributes.push((ATTR_RECORD_HANDLE, DataElement::Uint(u64::from(handle))));
      attributes.sort_by_key(|(id, _)| *id);

      let seq = DataElement::Seq(
         attributes
            .iter()
            .flat_map(|(id, v)| [DataElement::Uint(u64::from(*id)), v.clone()])
            .collect(),
      );
      let mut raw = Vec::new();
      seq.write_to(&mut raw);
      Self {
         handle,
         attributes,
         raw,
      }
   }

   /// A minimal PnP Information record.
   pub fn pnp(handle: u32, source: u16, vendor: u16, product: u16, version: u16) -> Self {
      Self::new(handle, vec![
         (
            ATTR_SERVICE_CLASS_IDS,
            DataElement::Seq(vec![DataElement::Uuid(bt_uuid::PNP_INFO)]),
         ),
         (ATTR_VENDOR_ID, DataElement::Uint(u64::from(vendor))),
         (ATTR_PRODUCT_ID, DataElement::Uint(u64::from(product))),
         (ATTR_VERSION, DataElement::Uint(u64::from(version))),
         (ATTR_VENDOR_ID_SOURCE, DataElement::Uint(u64::from(source))),
      ])
   }

   pub fn as_bytes(&self) -> &[u8] {
      &self.raw
   }

   pub fn attribute(&self, id: u16) -> Option<&DataElement> {
      self.attributes.iter().find(|(a, _)| *a == id).map(|(_, v)| v)
   }

   fn attribute_u16(&self, id: u16) -> u16 {
      self
         .attribute(id)
         .and_then(DataElement::as_uint)
         .and_then(|v| u16::try_from(v).ok())
         .unwrap_or(0)
   }

   pub fn service_classes(&self) -> impl Iterator<Item = &Uuid> {
      let items = match self.attribute(ATTR_SERVICE_CLASS_IDS) {
         Some(DataElement::Seq(items)) => items.as_slice(),
         _ => &[],
      };
      items.iter().filter_map(|item| match item {
         DataElement::Uuid(uuid) => Some(uuid),
         _ => None,
      })
   }

   pub fn has_service_class(&self, class: &Uuid) -> bool {
      self.service_classes().any(|c| c == class)
   }
}

/// Device ID quadruple from the PnP Information record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceId {
   pub source: u16,
   pub vendor: u16,
   pub product: u16,
   pub version: u16,
}

impl DeviceId {
   fn from_pnp(record: &SdpRecord) -> Self {
      Self {
         source: record.attribute_u16(ATTR_VENDOR_ID_SOURCE),
         vendor: record.attribute_u16(ATTR_VENDOR_ID),
         product: record.attribute_u16(ATTR_PRODUCT_ID),
         version: record.attribute_u16(ATTR_VERSION),
      }
   }
}

fn record_key(peer: &Address, handle: u32) -> String {
   format!("{peer}#{handle:08X}")
}

impl Storage {
   pub fn store_record(&self, adapter: &Address, peer: &Address, record: &SdpRecord) -> StoreResult<()> {
      self.table().put_nocase(
         adapter,
         Category::Sdp,
         &record_key(peer, record.handle),
         &hex::encode_upper(record.as_bytes()),
      )
   }

   pub fn fetch_record(&self, adapter: &Address, peer: &Address, handle: u32) -> StoreResult<SdpRecord> {
      let value = self
         .table()
         .get_nocase(adapter, Category::Sdp, &record_key(peer, handle))?;
      decode_record(&value)
   }

   pub fn delete_record(&self, adapter: &Address, peer: &Address, handle: u32) -> StoreResult<()> {
      self
         .table()
         .delete_nocase(adapter, Category::Sdp, &record_key(peer, handle))
   }

   /// Every decodable record cached for the peer. Rows that fail to decode
   /// are skipped.
   pub fn read_records(&self, adapter: &Address, peer: &Address) -> StoreResult<Vec<SdpRecord>> {
      let mut records = Vec::new();
      let result = self.table().for_each(adapter, Category::Sdp, |key, value| {
         if !peer.prefixes(key) {
            return;
         }
         match decode_record(value) {
            Ok(record) => records.push(record),
            Err(e) => debug!("sdp: skipping {key}: {e}"),
         }
      });
      match result {
         Ok(()) | Err(StoreError::NotFound) => Ok(records),
         Err(e) => Err(e),
      }
   }

   pub fn delete_all_records(&self, adapter: &Address, peer: &Address) -> StoreResult<()> {
      self
         .table()
         .delete_where(adapter, Category::Sdp, |key| peer.prefixes(key))
         .optional()
         .map(drop)
   }

   pub fn store_device_id(&self, adapter: &Address, peer: &Address, id: DeviceId) -> StoreResult<()> {
      let value = format!(
         "{:04X} {:04X} {:04X} {:04X}",
         id.source, id.vendor, id.product, id.version
      );
      self.table().put(adapter, Category::Did, &peer.to_string(), &value)
   }

   fn read_cached_device_id(&self, adapter: &Address, peer: &Address) -> StoreResult<DeviceId> {
      let value = self.table().get(adapter, Category::Did, &peer.to_string())?;
      let fields = value
         .split_whitespace()
         .map(|f| u16::from_str_radix(f, 16))
         .collect::<Result<SmallVec<[u16; 4]>, _>>()
         .map_err(|_| StoreError::malformed(format!("bad did row {value:?}")))?;
      let [source, vendor, product, version] = fields[..] else {
         return Err(StoreError::malformed(format!("bad did row {value:?}")));
      };
      Ok(DeviceId {
         source,
         vendor,
         product,
         version,
      })
   }

   /// Device ID of the peer, from the `did` cache or from a cached PnP record.
   ///
   /// A miss is cached with source [`DID_SOURCE_NONE`] so the record scan
   /// runs once.
   pub fn read_device_id(&self, adapter: &Address, peer: &Address) -> StoreResult<DeviceId> {
      match self.read_cached_device_id(adapter, peer) {
         Ok(id) if id.source == DID_SOURCE_NONE => return Err(StoreError::NotFound),
         Ok(id) => return Ok(id),
         Err(StoreError::NotFound) => {},
         Err(e) => return Err(e),
      }

      let found = self
         .read_records(adapter, peer)?
         .iter()
         .find(|r| r.has_service_class(&bt_uuid::PNP_INFO))
         .map(DeviceId::from_pnp);

      let cached = found.unwrap_or(DeviceId {
         source: DID_SOURCE_NONE,
         vendor: 0,
         product: 0,
         version: 0,
      });
      self.store_device_id(adapter, peer, cached)?;
      found.ok_or(StoreError::NotFound)
   }
}

fn decode_record(value: &str) -> StoreResult<SdpRecord> {
   let bytes = hex::decode(value).map_err(|e| StoreError::malformed(format!("bad sdp hex: {e}")))?;
   SdpRecord::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   const ADAPTER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const PEER: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   fn create_storage() -> (Storage, TempDir) {
      let dir = TempDir::new().unwrap();
      (Storage::new(dir.path()), dir)
   }

   #[test]
   fn test_parse_known_pnp_record() {
      // handle 0x00010001, classes {0x1200}, vendor 0x004C, source 0x0002
      let raw = hex::decode(
         "351C\
          0900000A00010001\
          0900013503191200\
          090201 09004C\
          090205 090002"
            .replace(' ', ""),
      )
      .unwrap();
      let record = SdpRecord::from_bytes(&raw).unwrap();
      assert_eq!(record.handle, 0x0001_0001);
      assert!(record.has_service_class(&bt_uuid::PNP_INFO));
      assert_eq!(record.attribute_u16(ATTR_VENDOR_ID), 0x004C);
      assert_eq!(record.attribute_u16(ATTR_VENDOR_ID_SOURCE), 0x0002);
      assert_eq!(record.attribute_u16(ATTR_PRODUCT_ID), 0);
   }

   #[test]
   fn test_built_record_decodes() {
      let record = SdpRecord::pnp(0x10000, 0x0002, 0x054C, 0x0268, 0x0100);
      let decoded = SdpRecord::from_bytes(record.as_bytes()).unwrap();
      assert_eq!(decoded.handle, 0x10000);
      assert_eq!(decoded.attributes, record.attributes);
   }

   #[test]
   fn test_truncated_record_is_malformed() {
      assert!(matches!(
         SdpRecord::from_bytes(&[0x35, 0x10, 0x09, 0x00]),
         Err(StoreError::Malformed(_))
      ));
   }

   #[test]
   fn test_deep_nesting_is_malformed() {
      // 0x37: sequence with a 32-bit length, each wrapping the rest.
      let depth = 200_000;
      let mut raw = Vec::with_capacity(depth * 5);
      for level in 0..depth {
         raw.push(0x37);
         raw.extend_from_slice(&(((depth - level - 1) * 5) as u32).to_be_bytes());
      }
      assert!(matches!(SdpRecord::from_bytes(&raw), Err(StoreError::Malformed(_))));

      let mut shallow = Vec::new();
      for level in 0..4 {
         shallow.push(0x35);
         shallow.push(((3 - level) * 2) as u8);
      }
      assert!(DataElement::parse(&shallow).is_ok());
   }

   #[test]
   fn test_store_fetch_delete_records() {
      let (storage, _dir) = create_storage();
      let a = SdpRecord::pnp(0x10000, 1, 2, 3, 4);
      let b = SdpRecord::new(0x10001, vec![(
         ATTR_SERVICE_CLASS_IDS,
         DataElement::Seq(vec![DataElement::Uuid(bt_uuid::from_u16(0x110B))]),
      )]);
      storage.store_record(&ADAPTER, &PEER, &a).unwrap();
      storage.store_record(&ADAPTER, &PEER, &b).unwrap();

      let key = storage
         .table()
         .for_each(&ADAPTER, Category::Sdp, |k, _| {
            assert!(k == "AA:BB:CC:DD:EE:FF#00010000" || k == "AA:BB:CC:DD:EE:FF#00010001");
         });
      assert!(key.is_ok());

      assert_eq!(storage.fetch_record(&ADAPTER, &PEER, 0x10001).unwrap(), b);
      assert_eq!(storage.read_records(&ADAPTER, &PEER).unwrap().len(), 2);

      storage.delete_record(&ADAPTER, &PEER, 0x10001).unwrap();
      assert_eq!(storage.read_records(&ADAPTER, &PEER).unwrap().len(), 1);

      storage.delete_all_records(&ADAPTER, &PEER).unwrap();
      assert!(storage.read_records(&ADAPTER, &PEER).unwrap().is_empty());
   }

   #[test]
   fn test_read_records_ignores_address_case() {
      let (storage, _dir) = create_storage();
      let record = SdpRecord::pnp(0x10002, 1, 2, 3, 4);
      let key = format!("{}#{:08X}", PEER.to_string().to_lowercase(), record.handle);
      let value = hex::encode_upper(record.as_bytes());
      storage.table().put(&ADAPTER, Category::Sdp, &key, &value).unwrap();

      assert_eq!(storage.read_records(&ADAPTER, &PEER).unwrap(), vec![record.clone()]);
      assert_eq!(storage.fetch_record(&ADAPTER, &PEER, 0x10002).unwrap(), record);

      storage.store_record(&ADAPTER, &PEER, &record).unwrap();
      assert_eq!(storage.read_records(&ADAPTER, &PEER).unwrap().len(), 1);

      storage.delete_all_records(&ADAPTER, &PEER).unwrap();
      assert!(storage.read_records(&ADAPTER, &PEER).unwrap().is_empty());
   }

   #[test]
   fn test_device_id_from_pnp_record_is_cached() {
      let (storage, _dir) = create_storage();
      storage
         .store_record(&ADAPTER, &PEER, &SdpRecord::pnp(0x10000, 0x0002, 0x054C, 0x0268, 0x0100))
         .unwrap();

      let id = storage.read_device_id(&ADAPTER, &PEER).unwrap();
      assert_eq!(id, DeviceId {
         source: 0x0002,
         vendor: 0x054C,
         product: 0x0268,
         version: 0x0100,
      });
      assert_eq!(
         storage
            .table()
            .get(&ADAPTER, Category::Did, &PEER.to_string())
            .unwrap(),
         "0002 054C 0268 0100"
      );
   }

   #[test]
   fn test_device_id_miss_is_cached_as_sentinel() {
      let (storage, _dir) = create_storage();
      assert!(matches!(
         storage.read_device_id(&ADAPTER, &PEER),
         Err(StoreError::NotFound)
      ));
      assert_eq!(
         storage
            .table()
            .get(&ADAPTER, Category::Did, &PEER.to_string())
            .unwrap(),
         "FFFF 0000 0000 0000"
      );

      // The sentinel hides records stored afterwards until the cache row goes.
      storage
         .store_record(&ADAPTER, &PEER, &SdpRecord::pnp(0x10000, 1, 2, 3, 4))
         .unwrap();
      assert!(storage.read_device_id(&ADAPTER, &PEER).is_err());
   }
}
