//! Host state: adapters, their peers, discovery and event handling.
//!
//! [`Host`] is driven by one task at a time (see
//! [`crate::bluetooth::manager`]). Handlers never fail outright: storage
//! problems are logged and the in-memory state still moves forward.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::{Duration, Instant},
};

use chrono::Utc;
use log::{debug, error, info, warn};
use smol_str::SmolStr;

use super::{
   address::{Address, AddressType},
   bonding::AuthTable,
   device::{ConnState, Device, LeConnParams},
   discovery::{Discovery, DiscoveryState, FoundDevice, NameStatus, Sighting},
   eir::{self, EirData},
   transport::{Agent, Transport, TransportEvent},
};
use crate::{
   config::{Config, ProvisionedDevice},
   error::{HostError, Result},
   event::{EventSender, HostEvent},
   storage::{
      OptionalExt, Storage, StoreError,
      records::{AdapterMode, EIR_LEN, PinLength},
      sdp::{DID_SOURCE_NONE, DeviceId, SdpRecord},
   },
};

/// Runtime knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct HostSettings {
   pub name_resolving: bool,
   pub found_device_keepalive: Duration,
}

impl From<&Config> for HostSettings {
   fn from(config: &Config) -> Self {
      Self {
         name_resolving: config.name_resolving,
         found_device_keepalive: config.found_device_keepalive(),
      }
   }
}

impl Default for HostSettings {
   fn default() -> Self {
      Self::from(&Config::default())
   }
}

/// One local controller and everything it knows.
#[derive(Debug)]
pub struct Adapter {
   address: Address,
   pub(super) discovery: Discovery,
   pub(super) devices: HashMap<Address, Device>,
   pub(super) connections: HashSet<Address>,
   mode: AdapterMode,
}

impl Adapter {
   fn new(address: Address, mode: AdapterMode) -> Self {
      Self {
         address,
         discovery: Discovery::new(),
         devices: HashMap::new(),
         connections: HashSet::new(),
         mode,
      }
   }

   pub const fn address(&self) -> &Address {
      &self.address
   }

   pub const fn mode(&self) -> AdapterMode {
      self.mode
   }

   pub const fn discovery(&self) -> &Discovery {
      &self.discovery
   }

   /// Looks up a peer, optionally creating it from stored state.
   pub(super) fn resolve(&mut self, storage: &Storage, peer: &Address, create: bool) -> Option<&mut Device> {
      if !self.devices.contains_key(peer) {
         if !create {
            return None;
         }
         let le = self.discovery.find(peer).is_some_and(|d| d.le);
         let device = Device::restore(storage, &self.address, *peer, le);
         debug!("{}: new device {peer} (temporary: {})", self.address, device.temporary);
         self.devices.insert(*peer, device);
      }
      self.devices.get_mut(peer)
   }
}

/// Replaces a name that is not valid UTF-8 by its ASCII bytes, with every
/// other byte turned into a space, then trims it.
fn decode_remote_name(raw: &[u8]) -> String {
   let raw = raw.split(|&b| b == 0).next().unwrap_or_default();
   match std::str::from_utf8(raw) {
      Ok(name) => name.to_string(),
      Err(_) => {
         let ascii: String = raw
            .iter()
            .map(|&b| if b.is_ascii() { char::from(b) } else { ' ' })
            .collect();
         ascii.trim().to_string()
      },
   }
}

fn pad_eir(data: &[u8]) -> [u8; EIR_LEN] {
   let mut blob = [0u8; EIR_LEN];
   let len = data.len().min(EIR_LEN);
   blob[..len].copy_from_slice(&data[..len]);
   blob
}

fn log_store<T>(what: &str, peer: &Address, result: std::result::Result<T, StoreError>) -> Option<T> {
   match result {
      Ok(v) => Some(v),
      Err(e) => {
         warn!("{peer}: failed to {what}: {e}");
         None
      },
   }
}

/// The Bluetooth host core.
pub struct Host {
   pub(super) settings: HostSettings,
   pub(super) storage: Storage,
   pub(super) transport: Arc<dyn Transport>,
   pub(super) agent: Arc<dyn Agent>,
   pub(super) events: EventSender,
   pub(super) adapters: HashMap<Address, Adapter>,
   pub(super) auth: AuthTable,
}

impl Host {
   pub fn new(
      settings: HostSettings,
      storage: Storage,
      transport: Arc<dyn Transport>,
      agent: Arc<dyn Agent>,
      events: EventSender,
   ) -> Self {
      Self {
         settings,
         storage,
         transport,
         agent,
         events,
         adapters: HashMap::new(),
         auth: AuthTable::default(),
      }
   }

   pub const fn storage(&self) -> &Storage {
      &self.storage
   }

   pub const fn settings(&self) -> &HostSettings {
      &self.settings
   }

   /// Registers a local adapter. Its stored mode is restored.
   pub fn add_adapter(&mut self, address: Address) {
      if self.adapters.contains_key(&address) {
         return;
      }
      let mode = self
         .storage
         .read_device_mode(&address)
         .optional()
         .unwrap_or_else(|e| {
            warn!("{address}: failed to read adapter mode: {e}");
            None
         })
         .unwrap_or(AdapterMode::Connectable);
      info!("Adapter {address} registered ({mode})");
      self.adapters.insert(address, Adapter::new(address, mode));
   }

   pub fn adapter(&self, address: &Address) -> Option<&Adapter> {
      self.adapters.get(address)
   }

   pub fn adapters(&self) -> impl Iterator<Item = &Adapter> {
      self.adapters.values()
   }

   /// Resolves `peer` on `adapter`, creating it when `create` is set.
   pub fn resolve(&mut self, adapter: &Address, peer: &Address, create: bool) -> Result<Option<&mut Device>> {
      let entry = self
         .adapters
         .get_mut(adapter)
         .ok_or(HostError::AdapterNotFound(*adapter))?;
      Ok(entry.resolve(&self.storage, peer, create))
   }

   pub(super) fn emit(&self, adapter: &Address, event: HostEvent) {
      self.events.emit(adapter, event);
   }

   /// Entry point for controller events.
   pub fn handle_event(&mut self, event: TransportEvent) {
      if !self.adapters.contains_key(event.adapter()) {
         error!("No matching adapter found for {}", event.adapter());
         return;
      }

      match event {
         TransportEvent::DeviceFound {
            adapter,
            peer,
            addr_type,
            le,
            class,
            rssi,
            eir,
         } => self.device_found(&adapter, &peer, addr_type, le, class, rssi, &eir),
         TransportEvent::AdvertisingReport {
            adapter,
            peer,
            addr_type,
            rssi,
            data,
         } => self.advertising_report(&adapter, &peer, addr_type, rssi, &data),
         TransportEvent::NameResolved {
            adapter,
            peer,
            status,
            name,
         } => self.remote_name(&adapter, &peer, status, &name),
         TransportEvent::RemoteClass { adapter, peer, class } => self.remote_class(&adapter, &peer, class),
         TransportEvent::LinkKeyNotify {
            adapter,
            peer,
            addr_type,
            key,
            key_type,
            pin_length,
            auth,
            data,
         } => {
            let pin_length = pin_length.map_or(PinLength::Refresh, PinLength::Known);
            self.link_key_notify(&adapter, &peer, addr_type, key, key_type, pin_length, auth, &data);
         },
         TransportEvent::ReturnedLinkKey { adapter, peer } => self.returned_link_key(&adapter, &peer),
         TransportEvent::BondingComplete { adapter, peer, status } => {
            self.bonding_complete(&adapter, &peer, status);
         },
         TransportEvent::SimplePairingComplete { adapter, peer, status } => {
            self.simple_pairing_complete(&adapter, &peer, status);
         },
         TransportEvent::ConnectionComplete { adapter, peer, le } => {
            self.connection_complete(&adapter, &peer, le);
         },
         TransportEvent::ConnectionFailed { adapter, peer, status } => {
            self.connection_failed(&adapter, &peer, status);
         },
         TransportEvent::DisconnectComplete { adapter, peer, reason } => {
            self.disconnect_complete(&adapter, &peer, reason);
         },
         TransportEvent::RssiUpdate { adapter, peer, rssi } => self.rssi_update(&adapter, &peer, rssi),
         TransportEvent::LeConnParams {
            adapter,
            peer,
            interval,
            latency,
            timeout,
         } => self.le_conn_params(&adapter, &peer, LeConnParams {
            interval,
            latency,
            timeout,
         }),
         TransportEvent::LegacyPairing { adapter, peer, legacy } => {
            self.set_legacy_pairing(&adapter, &peer, legacy);
         },
         TransportEvent::InquiryComplete { adapter } => self.inquiry_complete(&adapter),
         TransportEvent::PinRequest { adapter, peer } => self.request_pin(&adapter, &peer),
         TransportEvent::ConfirmRequest { adapter, peer, passkey } => {
            self.user_confirm(&adapter, &peer, passkey);
         },
         TransportEvent::ConsentRequest { adapter, peer } => self.user_consent(&adapter, &peer),
         TransportEvent::PasskeyRequest { adapter, peer } => self.user_passkey(&adapter, &peer),
         TransportEvent::PasskeyNotify { adapter, peer, passkey } => {
            self.user_notify(&adapter, &peer, passkey);
         },
         TransportEvent::OobRequest { adapter, peer } => self.request_oob(&adapter, &peer),
         TransportEvent::SetTemporary {
            adapter,
            peer,
            temporary,
         } => self.set_temporary(&adapter, &peer, temporary),
      }
   }

   // Discovery

   /// Inquiry result or LE device found.
   #[allow(clippy::too_many_arguments)]
   pub fn device_found(
      &mut self,
      adapter: &Address,
      peer: &Address,
      addr_type: AddressType,
      le: bool,
      class: u32,
      rssi: i8,
      eir_data: &[u8],
   ) {
      let storage = &self.storage;
      let Some(entry) = self.adapters.get_mut(adapter) else {
         error!("No matching adapter found for {adapter}");
         return;
      };

      log_store("update last seen", peer, storage.write_lastseen_info(adapter, peer, Utc::now()));
      log_store("write class", peer, storage.write_remote_class(adapter, peer, class));
      if !eir_data.is_empty() {
         log_store("write EIR", peer, storage.write_remote_eir(adapter, peer, &pad_eir(eir_data)));
      }

      let mut name_status = if !le && self.settings.name_resolving && entry.discovery.has_sessions() {
         NameStatus::Required
      } else {
         NameStatus::NotRequired
      };

      let alias = log_store("read alias", peer, storage.read_device_alias(adapter, peer).optional()).flatten();
      let stored_name = log_store("read name", peer, storage.read_device_name(adapter, peer).optional()).flatten();

      let legacy = if !eir_data.is_empty() || le {
         false
      } else if stored_name.is_none() {
         true
      } else {
         match storage.read_remote_features(adapter, peer) {
            Ok(features) => features.page2.is_none_or(|page| page[0] & 0x01 == 0),
            Err(_) => true,
         }
      };

      let eir = eir::parse(eir_data).unwrap_or_else(|e| {
         error!("{peer}: error parsing EIR data: {e}");
         EirData::default()
      });

      let mut name = stored_name.clone();
      if let Some(eir_name) = eir.name {
         if eir.name_complete {
            log_store("write name", peer, storage.write_device_name(adapter, peer, &eir_name));
            name_status = NameStatus::NotRequired;
            name = Some(eir_name);
         } else if stored_name.is_none() {
            name = Some(eir_name);
            if le {
               name_status = NameStatus::ShortName;
            }
         }
      }

      let found = entry
         .discovery
         .update_found(
            Sighting {
               address: *peer,
               addr_type,
               le,
               rssi,
               class,
               name,
               alias,
               legacy,
               flags: eir.flags,
               services: eir.services,
               name_status,
            },
            Instant::now(),
         )
         .clone();
      self.emit(adapter, HostEvent::DeviceFound(found));
   }

   pub fn advertising_report(
      &mut self,
      adapter: &Address,
      peer: &Address,
      addr_type: AddressType,
      rssi: i8,
      data: &[u8],
   ) {
      let Some(entry) = self.adapters.get_mut(adapter) else {
         error!("No matching adapter found for {adapter}");
         return;
      };

      let eir = eir::parse(data).unwrap_or_else(|e| {
         error!("{peer}: error parsing advertising data: {e}");
         EirData::default()
      });

      let found = entry
         .discovery
         .update_from_advertising(*peer, addr_type, rssi, eir.name, eir.services, eir.flags, Instant::now())
         .clone();
      self.emit(adapter, HostEvent::DeviceFound(found));
   }

   /// Remote name request finished.
   pub fn remote_name(&mut self, adapter: &Address, peer: &Address, status: u8, raw_name: &[u8]) {
      let name = (status == 0).then(|| decode_remote_name(raw_name));
      if let Some(name) = &name {
         log_store("write name", peer, self.storage.write_device_name(adapter, peer, name));
      }

      let Some(entry) = self.adapters.get_mut(adapter) else {
         debug!("Unable to find matching adapter");
         return;
      };

      let mut events = Vec::new();
      if let Some(name) = name {
         if let Some(found) = entry.discovery.find_mut(peer) {
            found.name = Some(name.clone());
            events.push(HostEvent::DeviceFound(found.clone()));
         }
         if let Some(device) = entry.devices.get_mut(peer) {
            let name = SmolStr::from(name);
            if device.name.as_ref() != Some(&name) {
               device.name = Some(name.clone());
               events.push(HostEvent::NameChanged { peer: *peer, name });
            }
         }
      } else {
         debug!("{peer}: name request failed with status {status:#04x}");
      }

      entry.discovery.remove(peer);
      for event in events {
         self.emit(adapter, event);
      }

      if !self.resolve_names(adapter)
         && let Some(entry) = self.adapters.get_mut(adapter)
         && entry.discovery.state() == DiscoveryState::ResolvingNames
      {
         entry.discovery.set_state(DiscoveryState::Idle);
      }
   }

   /// Requests the next pending name. Candidates whose request cannot be
   /// sent are dropped. Returns true if a request is in flight.
   pub fn resolve_names(&mut self, adapter: &Address) -> bool {
      let Some(entry) = self.adapters.get_mut(adapter) else {
         return false;
      };
      if entry.discovery.has_pending_request() {
         return true;
      }

      while let Some(peer) = entry.discovery.next_required() {
         match self.transport.resolve_name(adapter, &peer) {
            Ok(()) => {
               debug!("{peer}: name requested");
               entry.discovery.mark_requested(&peer);
               return true;
            },
            Err(e) => {
               error!("{peer}: unable to send name request: {e}");
               entry.discovery.remove(&peer);
            },
         }
      }
      false
   }

   pub fn set_legacy_pairing(&mut self, adapter: &Address, peer: &Address, legacy: bool) {
      let Some(entry) = self.adapters.get_mut(adapter) else {
         return;
      };
      let Some(found) = entry.discovery.find(peer) else {
         return;
      };
      if found.legacy == legacy {
         return;
      }
      entry.discovery.set_legacy(peer, legacy);
      if let Some(found) = entry.discovery.find(peer).cloned() {
         self.emit(adapter, HostEvent::DeviceFound(found));
      }
   }

   /// Persists and propagates a class change. An unchanged class is ignored.
   pub fn remote_class(&mut self, adapter: &Address, peer: &Address, class: u32) {
      let stored = log_store("read class", peer, self.storage.read_remote_class(adapter, peer).optional()).flatten();
      if stored == Some(class) {
         return;
      }
      log_store("write class", peer, self.storage.write_remote_class(adapter, peer, class));

      let Some(entry) = self.adapters.get_mut(adapter) else {
         return;
      };
      if let Some(device) = entry.devices.get_mut(peer) {
         device.class = class;
      }
      if let Some(found) = entry.discovery.find_mut(peer) {
         found.class = class;
      }
      self.emit(adapter, HostEvent::ClassChanged { peer: *peer, class });
   }

   /// Opens a discovery session, starting inquiry for the first one.
   pub fn start_discovery(&mut self, adapter: &Address) -> Result<()> {
      let entry = self
         .adapters
         .get_mut(adapter)
         .ok_or(HostError::AdapterNotFound(*adapter))?;
      if !entry.discovery.start_session() {
         return Ok(());
      }
      if let Err(e) = self.transport.start_inquiry(adapter) {
         error!("{adapter}: unable to start inquiry: {e}");
         entry.discovery.stop_session();
         return Err(e);
      }
      info!("{adapter}: discovery started");
      self.emit(adapter, HostEvent::DiscoveryStateChanged { discovering: true });
      Ok(())
   }

   /// Closes a discovery session, stopping inquiry with the last one.
   pub fn stop_discovery(&mut self, adapter: &Address) -> Result<()> {
      let entry = self
         .adapters
         .get_mut(adapter)
         .ok_or(HostError::AdapterNotFound(*adapter))?;

      let pending: Vec<_> = entry
         .discovery
         .found()
         .iter()
         .filter(|d| d.name_status == NameStatus::Requested)
         .map(|d| d.address)
         .collect();
      if !entry.discovery.stop_session() {
         return Ok(());
      }

      for peer in pending {
         if let Err(e) = self.transport.cancel_resolve_name(adapter, &peer) {
            error!("{peer}: unable to cancel name request: {e}");
         }
      }
      if let Err(e) = self.transport.stop_inquiry(adapter) {
         error!("{adapter}: unable to stop inquiry: {e}");
      }
      info!("{adapter}: discovery stopped");
      self.emit(adapter, HostEvent::DiscoveryStateChanged { discovering: false });
      Ok(())
   }

   /// Inquiry finished: move on to name resolution or go idle.
   pub fn inquiry_complete(&mut self, adapter: &Address) {
      let Some(entry) = self.adapters.get_mut(adapter) else {
         return;
      };
      if entry.discovery.state() == DiscoveryState::Suspended {
         return;
      }

      let resolving = self.settings.name_resolving && entry.discovery.has_sessions() && self.resolve_names(adapter);
      if let Some(entry) = self.adapters.get_mut(adapter) {
         entry.discovery.set_state(if resolving {
            DiscoveryState::ResolvingNames
         } else {
            DiscoveryState::Idle
         });
      }
   }

   /// Starts another inquiry round on every idle adapter with open sessions.
   pub fn restart_inquiry(&mut self) -> usize {
      let mut restarted = 0;
      for entry in self.adapters.values_mut() {
         if !entry.discovery.has_sessions() || entry.discovery.state() != DiscoveryState::Idle {
            continue;
         }
         match self.transport.start_inquiry(&entry.address) {
            Ok(()) => {
               entry.discovery.set_state(DiscoveryState::Discovering);
               restarted += 1;
            },
            Err(e) => error!("{}: unable to restart inquiry: {e}", entry.address),
         }
      }
      restarted
   }

   /// Drops candidates not seen within the keepalive window.
   pub fn expire_stale(&mut self, now: Instant) {
      let keepalive = self.settings.found_device_keepalive;
      let mut gone = Vec::new();
      for entry in self.adapters.values_mut() {
         for peer in entry.discovery.expire_stale(now, keepalive) {
            gone.push((entry.address, peer));
         }
      }
      for (adapter, peer) in gone {
         debug!("{peer}: no longer in range");
         self.emit(&adapter, HostEvent::DeviceDisappeared { peer });
      }
   }

   // Connections

   pub fn connection_complete(&mut self, adapter: &Address, peer: &Address, le: bool) {
      let storage = &self.storage;
      let Some(entry) = self.adapters.get_mut(adapter) else {
         debug!("Unable to find matching adapter");
         return;
      };
      let Some(device) = entry.resolve(storage, peer, true) else {
         return;
      };
      device.le |= le;
      device.conn = ConnState::Connected;
      entry.connections.insert(*peer);

      log_store("update last used", peer, storage.write_lastused_info(adapter, peer, Utc::now()));
      self.emit(adapter, HostEvent::Connected { peer: *peer, le });
   }

   pub fn connection_failed(&mut self, adapter: &Address, peer: &Address, status: u8) {
      let Some(device) = self.adapters.get(adapter).and_then(|a| a.devices.get(peer)) else {
         return;
      };
      let (bonding, temporary) = (device.is_bonding(), device.temporary);
      debug!("{peer}: connection failed with status {status:#04x}");

      if bonding {
         self.fail_bonding(adapter, peer, status);
      }
      if temporary {
         self.drop_device(adapter, peer);
      }
   }

   pub fn disconnect_complete(&mut self, adapter: &Address, peer: &Address, reason: u8) {
      let Some(entry) = self.adapters.get_mut(adapter) else {
         return;
      };
      let Some(device) = entry.devices.get_mut(peer) else {
         return;
      };
      device.conn = ConnState::Disconnected;
      let temporary = device.temporary;
      entry.connections.remove(peer);

      self.auth.cancel_for(adapter, peer);
      self.emit(adapter, HostEvent::Disconnected { peer: *peer, reason });
      if temporary {
         self.drop_device(adapter, peer);
      }
   }

   // Peer updates

   pub fn rssi_update(&mut self, adapter: &Address, peer: &Address, rssi: i8) {
      if let Ok(Some(device)) = self.resolve(adapter, peer, true) {
         device.rssi = Some(rssi);
      }
   }

   pub fn le_conn_params(&mut self, adapter: &Address, peer: &Address, params: LeConnParams) {
      if let Ok(Some(device)) = self.resolve(adapter, peer, true) {
         device.le_conn_params = Some(params);
      }
   }

   pub fn returned_link_key(&mut self, adapter: &Address, peer: &Address) {
      if let Ok(Some(device)) = self.resolve(adapter, peer, true) {
         device.paired = true;
      }
   }

   pub fn set_temporary(&mut self, adapter: &Address, peer: &Address, temporary: bool) {
      if let Ok(Some(device)) = self.resolve(adapter, peer, true)
         && device.temporary != temporary
      {
         debug!("{peer}: temporary = {temporary}");
         device.temporary = temporary;
      }
   }

   // Device management

   /// Forgets a peer and deletes everything stored for it.
   fn drop_device(&mut self, adapter: &Address, peer: &Address) {
      if let Err(e) = self.remove_device(adapter, peer) {
         warn!("{peer}: failed to remove device: {e}");
      }
   }

   /// Unpairs a peer: cancels its pending work and deletes its storage.
   pub fn remove_device(&mut self, adapter: &Address, peer: &Address) -> Result<()> {
      let entry = self
         .adapters
         .get_mut(adapter)
         .ok_or(HostError::AdapterNotFound(*adapter))?;

      if let Some(device) = entry.devices.remove(peer)
         && device.is_bonding()
      {
         if let Err(e) = self.transport.cancel_bonding(adapter, peer) {
            error!("{peer}: unable to cancel bonding: {e}");
         }
         entry.discovery.resume();
      }
      entry.connections.remove(peer);
      self.auth.cancel_for(adapter, peer);

      self.storage.remove_device_storage(adapter, peer)?;
      info!("{peer}: removed");
      self.emit(adapter, HostEvent::DeviceRemoved { peer: *peer });
      Ok(())
   }

   /// Installs a paired peer without radio pairing. Returns false if the
   /// peer was already known.
   pub fn provision(&mut self, adapter: &Address, provisioned: &ProvisionedDevice) -> Result<bool> {
      let peer = provisioned.address;
      let entry = self
         .adapters
         .get_mut(adapter)
         .ok_or(HostError::AdapterNotFound(*adapter))?;
      if entry.devices.contains_key(&peer) || self.storage.read_link_key(adapter, &peer).optional()?.is_some() {
         debug!("{peer}: already known, not provisioning");
         return Ok(false);
      }

      let storage = &self.storage;
      storage.write_device_name(adapter, &peer, &provisioned.name)?;
      if let Some(record) = &provisioned.record {
         let raw = hex::decode(record).map_err(|_| StoreError::InvalidInput("record is not hex"))?;
         storage.store_record(adapter, &peer, &SdpRecord::from_bytes(&raw)?)?;
      }
      storage.store_device_id(adapter, &peer, DeviceId {
         source: DID_SOURCE_NONE,
         vendor: provisioned.vendor,
         product: provisioned.product,
         version: provisioned.version,
      })?;
      storage.write_trust(adapter, &peer, "[all]", true)?;
      storage.write_link_key(adapter, &peer, &[0; 16], 0, PinLength::Known(4))?;

      let device = Device::restore(storage, adapter, peer, false);
      info!("{peer}: provisioned as {}", provisioned.name);
      entry.devices.insert(peer, device);
      Ok(true)
   }

   pub fn set_mode(&mut self, adapter: &Address, mode: AdapterMode) -> Result<()> {
      let entry = self
         .adapters
         .get_mut(adapter)
         .ok_or(HostError::AdapterNotFound(*adapter))?;
      self.storage.write_device_mode(adapter, mode)?;
      if entry.mode != mode {
         entry.mode = mode;
         self.emit(adapter, HostEvent::ModeChanged { mode });
      }
      Ok(())
   }

   pub fn set_trusted(&mut self, adapter: &Address, peer: &Address, service: &str, trusted: bool) -> Result<()> {
      self.adapter_checked(adapter)?;
      self.storage.write_trust(adapter, peer, service, trusted)?;
      Ok(())
   }

   pub fn set_blocked(&mut self, adapter: &Address, peer: &Address, blocked: bool) -> Result<()> {
      self.adapter_checked(adapter)?;
      self.storage.write_blocked(adapter, peer, blocked)?;
      if let Ok(Some(device)) = self.resolve(adapter, peer, false) {
         device.blocked = blocked;
      }
      Ok(())
   }

   fn adapter_checked(&self, adapter: &Address) -> Result<&Adapter> {
      self.adapters.get(adapter).ok_or(HostError::AdapterNotFound(*adapter))
   }

   pub fn get_device(&self, adapter: &Address, peer: &Address) -> Result<Device> {
      self
         .adapter_checked(adapter)?
         .devices
         .get(peer)
         .cloned()
         .ok_or(HostError::DeviceNotFound(*peer))
   }

   pub fn found_devices(&self, adapter: &Address) -> Result<Vec<FoundDevice>> {
      Ok(self.adapter_checked(adapter)?.discovery.found().to_vec())
   }
}
