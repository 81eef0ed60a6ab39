//! Event handling system for host state changes.
//!
//! Handlers in [`crate::bluetooth::host`] emit [`HostEvent`]s through an
//! [`EventBus`] for whatever front end is attached.

use std::sync::Arc;

use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   bluetooth::{address::Address, discovery::FoundDevice},
   storage::records::AdapterMode,
};

/// Events that can be emitted by the host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
   DeviceFound(FoundDevice),
   DeviceDisappeared { peer: Address },
   NameChanged { peer: Address, name: SmolStr },
   ClassChanged { peer: Address, class: u32 },
   Bonded { peer: Address },
   PairingFailed { peer: Address, status: u8 },
   Connected { peer: Address, le: bool },
   Disconnected { peer: Address, reason: u8 },
   DeviceRemoved { peer: Address },
   ModeChanged { mode: AdapterMode },
   DiscoveryStateChanged { discovering: bool },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, adapter: &Address, event: HostEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
