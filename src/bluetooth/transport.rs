//! Seams towards the controller transport and the user agent.
//!
//! Inbound controller events arrive as [`TransportEvent`]s; outbound
//! commands go through the [`Transport`] trait. Authentication prompts are
//! forwarded to an [`Agent`] and answered later by token.

use serde::{Deserialize, Serialize};

use super::address::{Address, AddressType};
use crate::error::Result;

/// Passkey reply meaning "no passkey".
pub const INVALID_PASSKEY: u32 = 0xFFFF_FFFF;

/// Out-of-band pairing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobData {
   #[serde(with = "hex")]
   pub hash: [u8; 16],
   #[serde(with = "hex")]
   pub randomizer: [u8; 16],
}

/// A discrete event delivered by the controller transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransportEvent {
   DeviceFound {
      adapter: Address,
      peer: Address,
      #[serde(default)]
      addr_type: AddressType,
      #[serde(default)]
      le: bool,
      #[serde(default)]
      class: u32,
      rssi: i8,
      /// Raw EIR blob; empty when the result carried none.
      #[serde(default, with = "hex")]
      eir: Vec<u8>,
   },
   AdvertisingReport {
      adapter: Address,
      peer: Address,
      #[serde(default)]
      addr_type: AddressType,
      rssi: i8,
      #[serde(default, with = "hex")]
      data: Vec<u8>,
   },
   NameResolved {
      adapter: Address,
      peer: Address,
      status: u8,
      #[serde(default, with = "hex")]
      name: Vec<u8>,
   },
   RemoteClass {
      adapter: Address,
      peer: Address,
      class: u32,
   },
   LinkKeyNotify {
      adapter: Address,
      peer: Address,
      #[serde(default)]
      addr_type: AddressType,
      #[serde(with = "hex")]
      key: [u8; 16],
      key_type: u8,
      /// Absent when only the key changed and stored metadata is kept.
      #[serde(default)]
      pin_length: Option<u8>,
      #[serde(default)]
      auth: u8,
      /// Kind-specific LE key data.
      #[serde(default, with = "hex")]
      data: Vec<u8>,
   },
   ReturnedLinkKey {
      adapter: Address,
      peer: Address,
   },
   BondingComplete {
      adapter: Address,
      peer: Address,
      status: u8,
   },
   SimplePairingComplete {
      adapter: Address,
      peer: Address,
      status: u8,
   },
   ConnectionComplete {
      adapter: Address,
      peer: Address,
      #[serde(default)]
      le: bool,
   },
   ConnectionFailed {
      adapter: Address,
      peer: Address,
      status: u8,
   },
   DisconnectComplete {
      adapter: Address,
      peer: Address,
      reason: u8,
   },
   RssiUpdate {
      adapter: Address,
      peer: Address,
      rssi: i8,
   },
   LeConnParams {
      adapter: Address,
      peer: Address,
      interval: u16,
      latency: u16,
      timeout: u16,
   },
   LegacyPairing {
      adapter: Address,
      peer: Address,
      legacy: bool,
   },
   InquiryComplete {
      adapter: Address,
   },
   PinRequest {
      adapter: Address,
      peer: Address,
   },
   ConfirmRequest {
      adapter: Address,
      peer: Address,
      passkey: u32,
   },
   ConsentRequest {
      adapter: Address,
      peer: Address,
   },
   PasskeyRequest {
      adapter: Address,
      peer: Address,
   },
   PasskeyNotify {
      adapter: Address,
      peer: Address,
      passkey: u32,
   },
   OobRequest {
      adapter: Address,
      peer: Address,
   },
   SetTemporary {
      adapter: Address,
      peer: Address,
      temporary: bool,
   },
}

impl TransportEvent {
   pub const fn adapter(&self) -> &Address {
      match self {
         Self::DeviceFound { adapter, .. }
         | Self::AdvertisingReport { adapter, .. }
         | Self::NameResolved { adapter, .. }
         | Self::RemoteClass { adapter, .. }
         | Self::LinkKeyNotify { adapter, .. }
         | Self::ReturnedLinkKey { adapter, .. }
         | Self::BondingComplete { adapter, .. }
         | Self::SimplePairingComplete { adapter, .. }
         | Self::ConnectionComplete { adapter, .. }
         | Self::ConnectionFailed { adapter, .. }
         | Self::DisconnectComplete { adapter, .. }
         | Self::RssiUpdate { adapter, .. }
         | Self::LeConnParams { adapter, .. }
         | Self::LegacyPairing { adapter, .. }
         | Self::InquiryComplete { adapter }
         | Self::PinRequest { adapter, .. }
         | Self::ConfirmRequest { adapter, .. }
         | Self::ConsentRequest { adapter, .. }
         | Self::PasskeyRequest { adapter, .. }
         | Self::PasskeyNotify { adapter, .. }
         | Self::OobRequest { adapter, .. }
         | Self::SetTemporary { adapter, .. } => adapter,
      }
   }
}

/// Outbound controller commands.
pub trait Transport: Send + Sync {
   /// `None` is a negative reply.
   fn pincode_reply(&self, adapter: &Address, peer: &Address, pin: Option<&[u8]>) -> Result<()>;
   fn confirm_reply(&self, adapter: &Address, peer: &Address, accept: bool) -> Result<()>;
   fn passkey_reply(&self, adapter: &Address, peer: &Address, passkey: u32) -> Result<()>;
   fn oob_reply(&self, adapter: &Address, peer: &Address, data: Option<&OobData>) -> Result<()>;
   fn resolve_name(&self, adapter: &Address, peer: &Address) -> Result<()>;
   fn cancel_resolve_name(&self, adapter: &Address, peer: &Address) -> Result<()>;
   fn create_bonding(&self, adapter: &Address, peer: &Address) -> Result<()>;
   fn cancel_bonding(&self, adapter: &Address, peer: &Address) -> Result<()>;
   fn start_inquiry(&self, adapter: &Address) -> Result<()>;
   fn stop_inquiry(&self, adapter: &Address) -> Result<()>;
}

/// What the agent is asked to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthKind {
   Pincode,
   Confirm { passkey: u32 },
   Consent,
   Passkey,
   Notify { passkey: u32 },
   Oob,
}

impl AuthKind {
   /// Notifications are fire-and-forget.
   pub const fn expects_reply(&self) -> bool {
      !matches!(self, Self::Notify { .. })
   }
}

/// An authentication prompt handed to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
   pub token: u64,
   pub adapter: Address,
   pub peer: Address,
   #[serde(flatten)]
   pub kind: AuthKind,
}

/// The agent's answer to an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum AgentResponse {
   Pincode(String),
   Accepted,
   Passkey(u32),
   Oob(OobData),
   Failed(String),
}

/// User agent receiving authentication prompts.
pub trait Agent: Send + Sync {
   /// Delivers the prompt. The answer arrives later through the manager,
   /// tagged with `request.token`.
   fn request(&self, request: AuthRequest) -> Result<()>;
}
