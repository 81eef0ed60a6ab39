//! Discovery candidates and remote name resolution bookkeeping.
//!
//! The tracker is pure in-memory state for one adapter. Storage and radio
//! side effects are driven by [`crate::bluetooth::host::Host`].

use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use uuid::Uuid;

use super::address::{Address, AddressType};

/// Where a candidate stands in remote name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum NameStatus {
   NotRequired,
   Required,
   Requested,
   ShortName,
}

/// Discovery phase of an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display)]
pub enum DiscoveryState {
   #[default]
   Idle,
   Discovering,
   ResolvingNames,
   Suspended,
}

/// A peer seen during the current discovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoundDevice {
   pub address: Address,
   pub addr_type: AddressType,
   pub rssi: i8,
   pub class: u32,
   pub name: Option<String>,
   pub alias: Option<String>,
   pub legacy: bool,
   pub le: bool,
   pub name_status: NameStatus,
   pub services: Vec<Uuid>,
   pub flags: Option<u8>,
   #[serde(skip)]
   pub last_seen: Instant,
}

impl FoundDevice {
   pub fn new(address: Address, now: Instant) -> Self {
      Self {
         address,
         addr_type: AddressType::Public,
         rssi: 0,
         class: 0,
         name: None,
         alias: None,
         legacy: false,
         le: false,
         name_status: NameStatus::NotRequired,
         services: Vec::new(),
         flags: None,
         last_seen: now,
      }
   }
}

/// Inquiry sighting of a peer, already merged with stored name and alias.
#[derive(Debug, Clone)]
pub struct Sighting {
   pub address: Address,
   pub addr_type: AddressType,
   pub le: bool,
   pub rssi: i8,
   pub class: u32,
   pub name: Option<String>,
   pub alias: Option<String>,
   pub legacy: bool,
   pub flags: Option<u8>,
   pub services: Vec<Uuid>,
   pub name_status: NameStatus,
}

/// Per-adapter discovery state.
#[derive(Debug, Default)]
pub struct Discovery {
   state: DiscoveryState,
   sessions: usize,
   found: Vec<FoundDevice>,
}

impl Discovery {
   pub fn new() -> Self {
      Self::default()
   }

   pub const fn state(&self) -> DiscoveryState {
      self.state
   }

   pub fn set_state(&mut self, state: DiscoveryState) {
      if self.state != state {
         debug!("discovery: {} -> {state}", self.state);
         self.state = state;
      }
   }

   pub const fn has_sessions(&self) -> bool {
      self.sessions > 0
   }

   pub const fn sessions(&self) -> usize {
      self.sessions
   }

   /// Registers a discovery session; returns true if it is the first.
   pub fn start_session(&mut self) -> bool {
      self.sessions += 1;
      if self.sessions == 1 {
         self.set_state(DiscoveryState::Discovering);
         true
      } else {
         false
      }
   }

   /// Drops a discovery session; returns true if it was the last.
   ///
   /// The candidate list is cleared with the last session.
   pub fn stop_session(&mut self) -> bool {
      if self.sessions == 0 {
         return false;
      }
      self.sessions -= 1;
      if self.sessions == 0 {
         self.found.clear();
         self.set_state(DiscoveryState::Idle);
         true
      } else {
         false
      }
   }

   pub fn suspend(&mut self) {
      if self.state == DiscoveryState::Discovering || self.state == DiscoveryState::ResolvingNames {
         self.set_state(DiscoveryState::Suspended);
      }
   }

   pub fn resume(&mut self) {
      if self.state == DiscoveryState::Suspended {
         let next = if self.has_sessions() {
            DiscoveryState::Discovering
         } else {
            DiscoveryState::Idle
         };
         self.set_state(next);
      }
   }

   pub fn found(&self) -> &[FoundDevice] {
      &self.found
   }

   pub fn find(&self, address: &Address) -> Option<&FoundDevice> {
      self.found.iter().find(|d| d.address == *address)
   }

   pub fn find_mut(&mut self, address: &Address) -> Option<&mut FoundDevice> {
      self.found.iter_mut().find(|d| d.address == *address)
   }

   fn entry(&mut self, address: Address, now: Instant) -> &mut FoundDevice {
      let index = match self.found.iter().position(|d| d.address == address) {
         Some(index) => index,
         None => {
            self.found.push(FoundDevice::new(address, now));
            self.found.len() - 1
         },
      };
      &mut self.found[index]
   }

   /// Inserts or refreshes a candidate from an inquiry result.
   pub fn update_found(&mut self, sighting: Sighting, now: Instant) -> &FoundDevice {
      let dev = self.entry(sighting.address, now);
      dev.addr_type = sighting.addr_type;
      dev.le = sighting.le;
      dev.rssi = sighting.rssi;
      dev.class = sighting.class;
      dev.legacy = sighting.legacy;
      dev.alias = sighting.alias;
      if sighting.name.is_some() {
         dev.name = sighting.name;
      }
      if sighting.flags.is_some() {
         dev.flags = sighting.flags;
      }
      merge_services(&mut dev.services, sighting.services);
      // A name already in flight is not requested twice.
      if dev.name_status != NameStatus::Requested || sighting.name_status == NameStatus::NotRequired {
         dev.name_status = sighting.name_status;
      }
      dev.last_seen = now;
      dev
   }

   /// Inserts or refreshes an LE candidate from an advertising report.
   pub fn update_from_advertising(
      &mut self,
      address: Address,
      addr_type: AddressType,
      rssi: i8,
      name: Option<String>,
      services: Vec<Uuid>,
      flags: Option<u8>,
      now: Instant,
   ) -> &FoundDevice {
      let dev = self.entry(address, now);
      dev.addr_type = addr_type;
      dev.le = true;
      dev.rssi = rssi;
      if name.is_some() {
         dev.name = name;
      }
      merge_services(&mut dev.services, services);
      if flags.is_some() {
         dev.flags = flags;
      }
      dev.last_seen = now;
      dev
   }

   pub fn set_legacy(&mut self, address: &Address, legacy: bool) -> bool {
      match self.find_mut(address) {
         Some(dev) => {
            dev.legacy = legacy;
            true
         },
         None => false,
      }
   }

   pub fn remove(&mut self, address: &Address) -> Option<FoundDevice> {
      let index = self.found.iter().position(|d| d.address == *address)?;
      Some(self.found.remove(index))
   }

   /// Next candidate awaiting name resolution, in discovery order.
   pub fn next_required(&self) -> Option<Address> {
      self
         .found
         .iter()
         .find(|d| d.name_status == NameStatus::Required)
         .map(|d| d.address)
   }

   pub fn has_pending_request(&self) -> bool {
      self.found.iter().any(|d| d.name_status == NameStatus::Requested)
   }

   pub fn mark_requested(&mut self, address: &Address) {
      if let Some(dev) = self.find_mut(address) {
         dev.name_status = NameStatus::Requested;
      }
   }

   /// Drops candidates not seen within `keepalive`. Returns the dropped
   /// addresses; a second call at the same instant drops nothing.
   pub fn expire_stale(&mut self, now: Instant, keepalive: Duration) -> Vec<Address> {
      let mut expired = Vec::new();
      self.found.retain(|d| {
         let stale = now.saturating_duration_since(d.last_seen) > keepalive
            && d.name_status != NameStatus::Requested;
         if stale {
            expired.push(d.address);
         }
         !stale
      });
      expired
   }
}

/// Services accumulate across sightings, first-seen order.
fn merge_services(into: &mut Vec<Uuid>, services: Vec<Uuid>) {
   for uuid in services {
      if !into.contains(&uuid) {
         into.push(uuid);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::uuid as bt_uuid;

   fn sighting(address: Address, name_status: NameStatus) -> Sighting {
      Sighting {
         address,
         addr_type: AddressType::Public,
         le: false,
         rssi: -40,
         class: 0x5a020c,
         name: None,
         alias: None,
         legacy: true,
         flags: None,
         services: Vec::new(),
         name_status,
      }
   }

   const A: Address = Address([1, 0, 0, 0, 0, 1]);
   const B: Address = Address([1, 0, 0, 0, 0, 2]);

   #[test]
   fn test_sessions_drive_state() {
      let mut discovery = Discovery::new();
      assert!(discovery.start_session());
      assert!(!discovery.start_session());
      assert_eq!(discovery.state(), DiscoveryState::Discovering);

      discovery.update_found(sighting(A, NameStatus::Required), Instant::now());
      assert!(!discovery.stop_session());
      assert_eq!(discovery.found().len(), 1);
      assert!(discovery.stop_session());
      assert!(discovery.found().is_empty());
      assert_eq!(discovery.state(), DiscoveryState::Idle);
      assert!(!discovery.stop_session());
   }

   #[test]
   fn test_update_keeps_order_and_merges() {
      let mut discovery = Discovery::new();
      let now = Instant::now();
      discovery.update_found(sighting(A, NameStatus::Required), now);
      discovery.update_found(sighting(B, NameStatus::Required), now);

      let mut again = sighting(A, NameStatus::Required);
      again.name = Some("Phone".into());
      again.rssi = -70;
      discovery.update_found(again, now);

      let found = discovery.found();
      assert_eq!(found.len(), 2);
      assert_eq!(found[0].address, A);
      assert_eq!(found[0].name.as_deref(), Some("Phone"));
      assert_eq!(found[0].rssi, -70);
      assert_eq!(discovery.next_required(), Some(A));
   }

   #[test]
   fn test_services_accumulate_across_sightings() {
      let mut discovery = Discovery::new();
      let now = Instant::now();
      let mut first = sighting(A, NameStatus::NotRequired);
      first.services = vec![bt_uuid::from_u16(0x110A)];
      discovery.update_found(first, now);

      let mut second = sighting(A, NameStatus::NotRequired);
      second.services = vec![bt_uuid::from_u16(0x110B), bt_uuid::from_u16(0x110A)];
      discovery.update_found(second, now);
      discovery.update_found(sighting(A, NameStatus::NotRequired), now);
      discovery.update_from_advertising(
         A,
         AddressType::Public,
         -50,
         None,
         vec![bt_uuid::from_u16(0x180F)],
         None,
         now,
      );

      assert_eq!(discovery.find(&A).unwrap().services, vec![
         bt_uuid::from_u16(0x110A),
         bt_uuid::from_u16(0x110B),
         bt_uuid::from_u16(0x180F),
      ]);
   }

   #[test]
   fn test_requested_is_not_downgraded() {
      let mut discovery = Discovery::new();
      let now = Instant::now();
      discovery.update_found(sighting(A, NameStatus::Required), now);
      discovery.mark_requested(&A);
      discovery.update_found(sighting(A, NameStatus::Required), now);
      assert_eq!(discovery.find(&A).unwrap().name_status, NameStatus::Requested);
      assert!(discovery.has_pending_request());
      assert_eq!(discovery.next_required(), None);
   }

   #[test]
   fn test_advertising_report_adds_le_candidate() {
      let mut discovery = Discovery::new();
      let dev = discovery.update_from_advertising(
         B,
         AddressType::Random,
         -60,
         Some("Tag".into()),
         vec![],
         Some(0x06),
         Instant::now(),
      );
      assert!(dev.le);
      assert_eq!(dev.addr_type, AddressType::Random);
      assert_eq!(dev.flags, Some(0x06));
   }

   #[test]
   fn test_expire_stale_is_idempotent() {
      let mut discovery = Discovery::new();
      let start = Instant::now();
      discovery.update_found(sighting(A, NameStatus::NotRequired), start);
      discovery.update_found(sighting(B, NameStatus::NotRequired), start + Duration::from_secs(20));

      let now = start + Duration::from_secs(40);
      let keepalive = Duration::from_secs(30);
      assert_eq!(discovery.expire_stale(now, keepalive), vec![A]);
      assert!(discovery.expire_stale(now, keepalive).is_empty());
      assert_eq!(discovery.found().len(), 1);
   }

   #[test]
   fn test_suspend_resume() {
      let mut discovery = Discovery::new();
      discovery.suspend();
      assert_eq!(discovery.state(), DiscoveryState::Idle);

      discovery.start_session();
      discovery.suspend();
      assert_eq!(discovery.state(), DiscoveryState::Suspended);
      discovery.resume();
      assert_eq!(discovery.state(), DiscoveryState::Discovering);
   }

   #[test]
   fn test_set_legacy_only_for_candidates() {
      let mut discovery = Discovery::new();
      assert!(!discovery.set_legacy(&A, false));
      discovery.update_found(sighting(A, NameStatus::NotRequired), Instant::now());
      assert!(discovery.set_legacy(&A, false));
      assert!(!discovery.find(&A).unwrap().legacy);
   }
}
