//! Pairing and bonding: authentication prompts, key storage and bonding
//! completion.
//!
//! Agent prompts are asynchronous. Each one is registered in the
//! [`AuthTable`] under a token and the answer is matched back by
//! [`Host::agent_reply`]. Replies whose token is gone are stale and dropped.

use std::collections::HashMap;

use log::{debug, error, info, warn};
use smallvec::SmallVec;

use super::{
   address::{Address, AddressType},
   device::BondState,
   host::Host,
   transport::{AgentResponse, AuthKind, AuthRequest, INVALID_PASSKEY},
};
use crate::{
   error::{HostError, Result},
   event::HostEvent,
   storage::{
      OptionalExt, StoreError, StoreResult,
      lekeys::{LeKey, LeKeyKind},
      records::{MAX_PIN_LEN, PinLength},
   },
};

/// Status used when bonding is cancelled locally.
pub const HCI_OE_USER_ENDED_CONNECTION: u8 = 0x13;

/// An agent prompt waiting for its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAuth {
   pub adapter: Address,
   pub peer: Address,
   pub kind: AuthKind,
}

/// Outstanding agent prompts by token.
#[derive(Debug)]
pub struct AuthTable {
   next_token: u64,
   pending: HashMap<u64, PendingAuth>,
}

impl Default for AuthTable {
   fn default() -> Self {
      Self {
         next_token: 1,
         pending: HashMap::new(),
      }
   }
}

impl AuthTable {
   fn allocate(&mut self) -> u64 {
      let token = self.next_token;
      self.next_token = self.next_token.wrapping_add(1).max(1);
      token
   }

   /// Registers a prompt and returns its token. Prompts without a reply
   /// get a token but are not tracked.
   pub fn insert(&mut self, adapter: Address, peer: Address, kind: AuthKind) -> u64 {
      let token = self.allocate();
      if kind.expects_reply() {
         self.pending.insert(token, PendingAuth { adapter, peer, kind });
      }
      token
   }

   pub fn take(&mut self, token: u64) -> Option<PendingAuth> {
      self.pending.remove(&token)
   }

   /// Forgets every prompt for `peer`; later replies become stale.
   pub fn cancel_for(&mut self, adapter: &Address, peer: &Address) -> usize {
      let before = self.pending.len();
      self
         .pending
         .retain(|_, p| !(p.adapter == *adapter && p.peer == *peer));
      before - self.pending.len()
   }

   pub fn is_pending(&self, adapter: &Address, peer: &Address) -> bool {
      self
         .pending
         .values()
         .any(|p| p.adapter == *adapter && p.peer == *peer)
   }

   pub fn len(&self) -> usize {
      self.pending.len()
   }

   pub fn is_empty(&self) -> bool {
      self.pending.is_empty()
   }
}

/// Decodes PIN text into raw bytes. A leading `$` marks hex pairs;
/// anything else is taken literally. Both are capped at 16 bytes.
pub fn decode_pin(pin: &str) -> SmallVec<[u8; MAX_PIN_LEN]> {
   match pin.strip_prefix('$') {
      Some(hex) => hex
         .as_bytes()
         .chunks_exact(2)
         .take(MAX_PIN_LEN)
         .map_while(|pair| std::str::from_utf8(pair).ok().and_then(|p| u8::from_str_radix(p, 16).ok()))
         .collect(),
      None => pin.bytes().take(MAX_PIN_LEN).collect(),
   }
}

impl Host {
   // Authentication prompts

   pub fn request_pin(&mut self, adapter: &Address, peer: &Address) {
      if !matches!(self.resolve(adapter, peer, true), Ok(Some(_))) {
         return;
      }

      let stored = match self.storage.read_pin_code(adapter, peer).optional() {
         Ok(pin) => pin,
         Err(e) => {
            warn!("{peer}: failed to read stored PIN: {e}");
            None
         },
      };
      if let Some(pin) = stored {
         let raw = decode_pin(&pin);
         if !raw.is_empty() {
            debug!("{peer}: replying with stored PIN");
            self.send_pincode(adapter, peer, Some(&raw));
            return;
         }
      }

      self.request_auth(adapter, peer, AuthKind::Pincode);
   }

   pub fn user_confirm(&mut self, adapter: &Address, peer: &Address, passkey: u32) {
      self.prompt(adapter, peer, AuthKind::Confirm { passkey });
   }

   pub fn user_consent(&mut self, adapter: &Address, peer: &Address) {
      self.prompt(adapter, peer, AuthKind::Consent);
   }

   pub fn user_passkey(&mut self, adapter: &Address, peer: &Address) {
      self.prompt(adapter, peer, AuthKind::Passkey);
   }

   pub fn user_notify(&mut self, adapter: &Address, peer: &Address, passkey: u32) {
      self.prompt(adapter, peer, AuthKind::Notify { passkey });
   }

   pub fn request_oob(&mut self, adapter: &Address, peer: &Address) {
      self.prompt(adapter, peer, AuthKind::Oob);
   }

   fn prompt(&mut self, adapter: &Address, peer: &Address, kind: AuthKind) {
      if matches!(self.resolve(adapter, peer, true), Ok(Some(_))) {
         self.request_auth(adapter, peer, kind);
      }
   }

   /// Hands a prompt to the agent. If it cannot be delivered the
   /// controller gets a negative reply straight away.
   fn request_auth(&mut self, adapter: &Address, peer: &Address, kind: AuthKind) {
      let token = self.auth.insert(*adapter, *peer, kind);
      let request = AuthRequest {
         token,
         adapter: *adapter,
         peer: *peer,
         kind,
      };
      if let Err(e) = self.agent.request(request) {
         error!("{peer}: authentication request failed: {e}");
         self.auth.take(token);
         self.negative_reply(adapter, peer, kind);
      }
   }

   fn negative_reply(&self, adapter: &Address, peer: &Address, kind: AuthKind) {
      let result = match kind {
         AuthKind::Pincode => self.transport.pincode_reply(adapter, peer, None),
         AuthKind::Confirm { .. } | AuthKind::Consent => self.transport.confirm_reply(adapter, peer, false),
         AuthKind::Passkey => self.transport.passkey_reply(adapter, peer, INVALID_PASSKEY),
         AuthKind::Oob => self.transport.oob_reply(adapter, peer, None),
         AuthKind::Notify { .. } => Ok(()),
      };
      if let Err(e) = result {
         error!("{peer}: sending negative reply failed: {e}");
      }
   }

   fn send_pincode(&self, adapter: &Address, peer: &Address, pin: Option<&[u8]>) {
      if let Err(e) = self.transport.pincode_reply(adapter, peer, pin) {
         error!("Sending PIN code reply failed: {e}");
      }
   }

   /// Routes an agent answer to the controller. Returns false if the
   /// token was stale.
   pub fn agent_reply(&mut self, token: u64, response: AgentResponse) -> bool {
      let Some(PendingAuth { adapter, peer, kind }) = self.auth.take(token) else {
         debug!("Discarding stale agent reply {token}");
         return false;
      };
      if !matches!(self.resolve(&adapter, &peer, false), Ok(Some(_))) {
         debug!("{peer}: device gone, discarding agent reply {token}");
         return false;
      }

      let result = match (kind, response) {
         (AuthKind::Pincode, AgentResponse::Pincode(pin)) => {
            let raw = decode_pin(&pin);
            let pin = (!raw.is_empty()).then_some(&raw[..]);
            self.transport.pincode_reply(&adapter, &peer, pin)
         },
         (AuthKind::Confirm { .. } | AuthKind::Consent, AgentResponse::Accepted) => {
            self.transport.confirm_reply(&adapter, &peer, true)
         },
         (AuthKind::Passkey, AgentResponse::Passkey(passkey)) => {
            self.transport.passkey_reply(&adapter, &peer, passkey)
         },
         (AuthKind::Oob, AgentResponse::Oob(data)) => self.transport.oob_reply(&adapter, &peer, Some(&data)),
         (kind, AgentResponse::Failed(reason)) => {
            info!("{peer}: agent declined {kind:?}: {reason}");
            self.negative_reply(&adapter, &peer, kind);
            Ok(())
         },
         (kind, response) => {
            warn!("{peer}: agent answered {kind:?} with {response:?}");
            self.negative_reply(&adapter, &peer, kind);
            Ok(())
         },
      };
      if let Err(e) = result {
         error!("{peer}: sending agent reply failed: {e}");
      }
      true
   }

   // Keys

   /// Stores a key distributed during pairing. Types from
   /// [`LeKeyKind::Ltk`] up go to the LE key record.
   #[allow(clippy::too_many_arguments)]
   pub fn link_key_notify(
      &mut self,
      adapter: &Address,
      peer: &Address,
      addr_type: AddressType,
      key: [u8; 16],
      key_type: u8,
      pin_length: PinLength,
      auth: u8,
      data: &[u8],
   ) {
      let storage = &self.storage;
      let Some(entry) = self.adapters.get_mut(adapter) else {
         return;
      };
      let Some(device) = entry.resolve(storage, peer, true) else {
         return;
      };
      debug!("{peer}: storing link key of type {key_type:#04x}");

      let result: StoreResult<()> = if LeKeyKind::is_le(key_type) {
         let length = match pin_length {
            PinLength::Known(len) => len,
            PinLength::Refresh => 0,
         };
         LeKeyKind::from_repr(key_type)
            .ok_or(StoreError::InvalidInput("unknown LE key type"))
            .and_then(|kind| LeKey::from_wire(kind, key, data))
            .and_then(|le_key| storage.write_le_key(adapter, peer, addr_type, device.le_hash, le_key, length, auth))
            .map(|hash| {
               device.le_hash = Some(hash);
               device.addr_type = addr_type;
            })
      } else {
         storage.write_link_key(adapter, peer, &key, key_type, pin_length)
      };

      match result {
         Ok(()) => {
            device.bond = BondState::Bonded;
            device.paired = true;
            if device.temporary {
               device.temporary = false;
            }
         },
         Err(e) => warn!("{peer}: failed to store key: {e}"),
      }
   }

   // Bonding

   /// Starts outgoing bonding. Discovery is suspended until it ends.
   pub fn create_bonding(&mut self, adapter: &Address, peer: &Address) -> Result<()> {
      let storage = &self.storage;
      let entry = self
         .adapters
         .get_mut(adapter)
         .ok_or(HostError::AdapterNotFound(*adapter))?;
      let Some(device) = entry.resolve(storage, peer, true) else {
         return Err(HostError::DeviceNotFound(*peer));
      };
      if device.is_bonding() {
         return Err(HostError::AlreadyBonding(*peer));
      }
      if device.is_bonded() {
         info!("{peer}: already bonded");
         return Ok(());
      }

      let previous = device.bond;
      device.bond = BondState::Bonding;
      if let Err(e) = self.transport.create_bonding(adapter, peer) {
         error!("{peer}: unable to create bonding: {e}");
         device.bond = previous;
         return Err(e);
      }
      entry.discovery.suspend();
      info!("{peer}: bonding started");
      Ok(())
   }

   /// Cancels a bonding in progress.
   pub fn cancel_bonding(&mut self, adapter: &Address, peer: &Address) -> Result<()> {
      let bonding = self
         .resolve(adapter, peer, false)?
         .is_some_and(|device| device.is_bonding());
      if !bonding {
         return Err(HostError::DeviceNotFound(*peer));
      }
      if let Err(e) = self.transport.cancel_bonding(adapter, peer) {
         error!("{peer}: unable to cancel bonding: {e}");
      }
      self.fail_bonding(adapter, peer, HCI_OE_USER_ENDED_CONNECTION);
      Ok(())
   }

   /// Ends a bonding attempt with an error status.
   pub(super) fn fail_bonding(&mut self, adapter: &Address, peer: &Address, status: u8) {
      let Some(entry) = self.adapters.get_mut(adapter) else {
         return;
      };
      if let Some(device) = entry.devices.get_mut(peer)
         && !device.is_bonded()
      {
         device.bond = BondState::Failed(status);
      }
      entry.discovery.resume();
      self.auth.cancel_for(adapter, peer);
      info!("{peer}: bonding failed with status {status:#04x}");
      self.emit(adapter, HostEvent::PairingFailed { peer: *peer, status });
   }

   /// Bonding finished. Unknown peers are only created on success.
   pub fn bonding_complete(&mut self, adapter: &Address, peer: &Address, status: u8) {
      let create = status == 0;
      let Ok(Some(device)) = self.resolve(adapter, peer, create) else {
         return;
      };
      debug!("{peer}: bonding complete, status {status:#04x}");

      if status != 0 {
         self.fail_bonding(adapter, peer, status);
         return;
      }

      let bonded = match device.bond {
         BondState::Bonded => true,
         BondState::Bonding => {
            // No key arrived; the bond did not stick.
            device.bond = BondState::Unbonded;
            false
         },
         _ => false,
      };
      if let Some(entry) = self.adapters.get_mut(adapter) {
         entry.discovery.resume();
      }
      if bonded {
         info!("{peer}: bonded");
         self.emit(adapter, HostEvent::Bonded { peer: *peer });
      }
   }

   /// Simple pairing finished. Outstanding prompts for the peer are void
   /// either way.
   pub fn simple_pairing_complete(&mut self, adapter: &Address, peer: &Address, status: u8) {
      let create = status == 0;
      let Ok(Some(device)) = self.resolve(adapter, peer, create) else {
         return;
      };
      let bonding = device.is_bonding();
      debug!("{peer}: simple pairing complete, status {status:#04x}");

      self.auth.cancel_for(adapter, peer);
      if status != 0 && bonding {
         self.fail_bonding(adapter, peer, status);
      }
   }
}
