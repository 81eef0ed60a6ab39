//! Bluetooth host manager.
//!
//! A single actor owns the [`Host`] and processes controller events, agent
//! replies and user commands strictly one at a time. [`BluetoothManager`]
//! is the cloneable handle talking to it.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, MissedTickBehavior},
};

use super::{
   address::Address,
   device::Device,
   discovery::{DiscoveryState, FoundDevice},
   host::{Host, HostSettings},
   transport::{Agent, AgentResponse, Transport, TransportEvent},
};
use crate::{
   config::Config,
   error::{HostError, Result},
   event::EventSender,
   storage::{Storage, records::AdapterMode},
};

/// Interval to drop candidates that went out of range
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Controller input
   Event(TransportEvent),
   AgentReply(u64, AgentResponse, oneshot::Sender<bool>),

   // Timers
   RestartInquiry,

   // User commands
   StartDiscovery(Address, oneshot::Sender<Result<()>>),
   StopDiscovery(Address, oneshot::Sender<Result<()>>),
   Pair(Address, Address, oneshot::Sender<Result<()>>),
   CancelPairing(Address, Address, oneshot::Sender<Result<()>>),
   RemoveDevice(Address, Address, oneshot::Sender<Result<()>>),
   SetTrusted(Address, Address, SmolStr, bool, oneshot::Sender<Result<()>>),
   SetBlocked(Address, Address, bool, oneshot::Sender<Result<()>>),
   SetMode(Address, AdapterMode, oneshot::Sender<Result<()>>),
   GetDevice(Address, Address, oneshot::Sender<Result<Device>>),
   FoundDevices(Address, oneshot::Sender<Result<Vec<FoundDevice>>>),
}

// === Main Manager ===

/// Handle to the manager actor.
///
/// Dropping every handle shuts the actor down.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub async fn new(
      config: Config,
      storage: Storage,
      transport: Arc<dyn Transport>,
      agent: Arc<dyn Agent>,
      event_tx: EventSender,
   ) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let host = Host::new(HostSettings::from(&config), storage, transport, agent, event_tx);
      tokio::spawn(ManagerActor::new(config, host, command_rx).run());
      Ok(Self { inbox: command_tx })
   }

   async fn send(&self, cmd: ManagerCommand) -> Result<()> {
      self
         .inbox
         .send(cmd)
         .await
         .map_err(|_| HostError::ManagerShutdown)
   }

   async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self.send(make(tx)).await?;
      rx.await.map_err(|_| HostError::ManagerShutdown)?
   }

   /// Queues a controller event.
   pub async fn handle_event(&self, event: TransportEvent) -> Result<()> {
      self.send(ManagerCommand::Event(event)).await
   }

   /// Delivers an agent answer. Returns false if it was stale.
   pub async fn agent_reply(&self, token: u64, response: AgentResponse) -> Result<bool> {
      let (tx, rx) = oneshot::channel();
      self
         .send(ManagerCommand::AgentReply(token, response, tx))
         .await?;
      rx.await.map_err(|_| HostError::ManagerShutdown)
   }

   pub async fn start_discovery(&self, adapter: Address) -> Result<()> {
      self
         .call(|tx| ManagerCommand::StartDiscovery(adapter, tx))
         .await
   }

   pub async fn stop_discovery(&self, adapter: Address) -> Result<()> {
      self
         .call(|tx| ManagerCommand::StopDiscovery(adapter, tx))
         .await
   }

   pub async fn pair(&self, adapter: Address, peer: Address) -> Result<()> {
      self
         .call(|tx| ManagerCommand::Pair(adapter, peer, tx))
         .await
   }

   pub async fn cancel_pairing(&self, adapter: Address, peer: Address) -> Result<()> {
      self
         .call(|tx| ManagerCommand::CancelPairing(adapter, peer, tx))
         .await
   }

   pub async fn remove_device(&self, adapter: Address, peer: Address) -> Result<()> {
      self
         .call(|tx| ManagerCommand::RemoveDevice(adapter, peer, tx))
         .await
   }

   pub async fn set_trusted(
      &self,
      adapter: Address,
      peer: Address,
      service: &str,
      trusted: bool,
   ) -> Result<()> {
      let service = SmolStr::new(service);
      self
         .call(|tx| ManagerCommand::SetTrusted(adapter, peer, service, trusted, tx))
         .await
   }

   pub async fn set_blocked(&self, adapter: Address, peer: Address, blocked: bool) -> Result<()> {
      self
         .call(|tx| ManagerCommand::SetBlocked(adapter, peer, blocked, tx))
         .await
   }

   pub async fn set_mode(&self, adapter: Address, mode: AdapterMode) -> Result<()> {
      self
         .call(|tx| ManagerCommand::SetMode(adapter, mode, tx))
         .await
   }

   pub async fn get_device(&self, adapter: Address, peer: Address) -> Result<Device> {
      self
         .call(|tx| ManagerCommand::GetDevice(adapter, peer, tx))
         .await
   }

   pub async fn found_devices(&self, adapter: Address) -> Result<Vec<FoundDevice>> {
      self
         .call(|tx| ManagerCommand::FoundDevices(adapter, tx))
         .await
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   host: Host,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   restart_pending: bool,
}

impl ManagerActor {
   fn new(config: Config, host: Host, command_rx: mpsc::Receiver<ManagerCommand>) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         config,
         host,
         command_rx,
         loopback_rx,
         loopback_tx,
         restart_pending: false,
      }
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      self.initialize_adapters();

      let mut expiry_interval = time::interval(EXPIRY_CHECK_INTERVAL);
      expiry_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = expiry_interval.tick() => {
                 self.host.expire_stale(Instant::now());
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd);
             }
         }
      }

      self.cleanup();
   }

   fn initialize_adapters(&mut self) {
      for &adapter in &self.config.adapters {
         self.host.add_adapter(adapter);
         for provisioned in &self.config.provisioned_devices {
            match self.host.provision(&adapter, provisioned) {
               Ok(true) => {},
               Ok(false) => debug!("{}: already present", provisioned.address),
               Err(e) => warn!("Failed to provision {}: {e}", provisioned.address),
            }
         }
      }
      if self.config.adapters.is_empty() {
         warn!("No adapters configured");
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Event(event) => {
            let adapter = *event.adapter();
            self.host.handle_event(event);
            self.schedule_inquiry_restart(&adapter);
         },
         ManagerCommand::AgentReply(token, response, reply) => {
            let _ = reply.send(self.host.agent_reply(token, response));
         },
         ManagerCommand::RestartInquiry => {
            self.restart_pending = false;
            let restarted = self.host.restart_inquiry();
            debug!("Restarted inquiry on {restarted} adapter(s)");
         },
         ManagerCommand::StartDiscovery(adapter, reply) => {
            let _ = reply.send(self.host.start_discovery(&adapter));
         },
         ManagerCommand::StopDiscovery(adapter, reply) => {
            let _ = reply.send(self.host.stop_discovery(&adapter));
         },
         ManagerCommand::Pair(adapter, peer, reply) => {
            let _ = reply.send(self.host.create_bonding(&adapter, &peer));
         },
         ManagerCommand::CancelPairing(adapter, peer, reply) => {
            let _ = reply.send(self.host.cancel_bonding(&adapter, &peer));
         },
         ManagerCommand::RemoveDevice(adapter, peer, reply) => {
            let _ = reply.send(self.host.remove_device(&adapter, &peer));
         },
         ManagerCommand::SetTrusted(adapter, peer, service, trusted, reply) => {
            let _ = reply.send(self.host.set_trusted(&adapter, &peer, &service, trusted));
         },
         ManagerCommand::SetBlocked(adapter, peer, blocked, reply) => {
            let _ = reply.send(self.host.set_blocked(&adapter, &peer, blocked));
         },
         ManagerCommand::SetMode(adapter, mode, reply) => {
            let _ = reply.send(self.host.set_mode(&adapter, mode));
         },
         ManagerCommand::GetDevice(adapter, peer, reply) => {
            let _ = reply.send(self.host.get_device(&adapter, &peer));
         },
         ManagerCommand::FoundDevices(adapter, reply) => {
            let _ = reply.send(self.host.found_devices(&adapter));
         },
      }
   }

   /// Queues another inquiry round once the adapter has gone idle with
   /// discovery sessions still open, either after inquiry or after the
   /// last name request.
   fn schedule_inquiry_restart(&mut self, adapter: &Address) {
      let Some(entry) = self.host.adapter(adapter) else {
         return;
      };
      let discovery = entry.discovery();
      if self.restart_pending || !discovery.has_sessions() || discovery.state() != DiscoveryState::Idle {
         return;
      }

      self.restart_pending = true;
      let delay = calc_restart_delay(self.config.inquiry_interval());
      debug!("{adapter}: next inquiry in {delay:?}");
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         time::sleep(delay).await;
         if let Err(e) = loopback.send(ManagerCommand::RestartInquiry).await {
            warn!("Channel overflow sending inquiry restart: {e}");
         }
      });
   }

   fn cleanup(&mut self) {
      info!("Cleaning up Bluetooth manager");
      let adapters: Vec<Address> = self.host.adapters().map(|a| *a.address()).collect();
      for adapter in adapters {
         while self
            .host
            .adapter(&adapter)
            .is_some_and(|a| a.discovery().has_sessions())
         {
            if let Err(e) = self.host.stop_discovery(&adapter) {
               error!("{adapter}: failed to stop discovery: {e}");
               break;
            }
         }
      }
   }
}

fn calc_restart_delay(interval: Duration) -> Duration {
   let jitter = rand::thread_rng().gen_range(0..1000);
   interval + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::{
         address::AddressType,
         host::tests::{ADAPTER, MockAgent, MockBus, MockTransport, PEER},
      },
      config::ProvisionedDevice,
      event::HostEvent,
   };

   struct Harness {
      manager: BluetoothManager,
      transport: Arc<MockTransport>,
      agent: Arc<MockAgent>,
      bus: Arc<MockBus>,
      _dir: tempfile::TempDir,
   }

   async fn harness(config: Config) -> Harness {
      let dir = tempfile::TempDir::new().unwrap();
      let transport = Arc::new(MockTransport::default());
      let agent = Arc::new(MockAgent::default());
      let bus = Arc::new(MockBus::default());
      let manager = BluetoothManager::new(
         config,
         Storage::new(dir.path()),
         transport.clone(),
         agent.clone(),
         bus.clone(),
      )
      .await
      .unwrap();
      Harness {
         manager,
         transport,
         agent,
         bus,
         _dir: dir,
      }
   }

   fn config() -> Config {
      Config {
         adapters: vec![ADAPTER],
         ..Config::default()
      }
   }

   #[test]
   fn test_restart_delay_has_jitter() {
      let delay = calc_restart_delay(Duration::from_secs(10));
      assert!(delay >= Duration::from_secs(10));
      assert!(delay < Duration::from_secs(11));
   }

   #[tokio::test]
   async fn test_events_are_processed_in_order() {
      let h = harness(config()).await;
      h.manager.start_discovery(ADAPTER).await.unwrap();
      h.manager
         .handle_event(TransportEvent::DeviceFound {
            adapter: ADAPTER,
            peer: PEER,
            addr_type: AddressType::Public,
            le: false,
            class: 0x240404,
            rssi: -40,
            eir: vec![],
         })
         .await
         .unwrap();

      let found = h.manager.found_devices(ADAPTER).await.unwrap();
      assert_eq!(found.len(), 1);
      assert_eq!(found[0].class, 0x240404);
      assert!(
         h.bus
            .take()
            .iter()
            .any(|e| matches!(e, HostEvent::DeviceFound(d) if d.address == PEER))
      );
      assert_eq!(h.transport.take(), vec![format!("inquiry {ADAPTER}")]);
   }

   #[tokio::test]
   async fn test_agent_round_trip() {
      let h = harness(config()).await;
      h.manager
         .handle_event(TransportEvent::ConfirmRequest {
            adapter: ADAPTER,
            peer: PEER,
            passkey: 123456,
         })
         .await
         .unwrap();
      h.manager.get_device(ADAPTER, PEER).await.unwrap();

      let token = h.agent.requests.lock()[0].token;
      assert!(h.manager.agent_reply(token, AgentResponse::Accepted).await.unwrap());
      assert!(!h.manager.agent_reply(token, AgentResponse::Accepted).await.unwrap());
      assert_eq!(h.transport.take(), vec![format!("confirm {PEER} true")]);
   }

   #[tokio::test]
   async fn test_unknown_adapter_errors() {
      let h = harness(config()).await;
      let stranger = Address([9; 6]);
      assert!(matches!(
         h.manager.start_discovery(stranger).await,
         Err(HostError::AdapterNotFound(_))
      ));
      assert!(matches!(
         h.manager.get_device(ADAPTER, PEER).await,
         Err(HostError::DeviceNotFound(_))
      ));

      // Failed commands leave the actor serving.
      h.manager.start_discovery(ADAPTER).await.unwrap();
      assert!(h.manager.found_devices(ADAPTER).await.unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_provisioned_devices_on_startup() {
      let mut config = config();
      config.provisioned_devices.push(ProvisionedDevice {
         address: PEER,
         name: "Remote".into(),
         vendor: 1,
         product: 2,
         version: 3,
         record: None,
      });
      let h = harness(config).await;
      let device = h.manager.get_device(ADAPTER, PEER).await.unwrap();
      assert!(device.paired);
      assert_eq!(device.name.as_deref(), Some("Remote"));

      h.manager.remove_device(ADAPTER, PEER).await.unwrap();
      assert!(h.manager.get_device(ADAPTER, PEER).await.is_err());
   }

   #[tokio::test]
   async fn test_mode_and_pairing_commands() {
      let h = harness(config()).await;
      h.manager
         .set_mode(ADAPTER, AdapterMode::Discoverable)
         .await
         .unwrap();
      h.manager.set_trusted(ADAPTER, PEER, "[all]", true).await.unwrap();
      h.manager.set_blocked(ADAPTER, PEER, false).await.unwrap();
      h.manager.pair(ADAPTER, PEER).await.unwrap();
      h.manager.cancel_pairing(ADAPTER, PEER).await.unwrap();
      h.manager.stop_discovery(ADAPTER).await.unwrap();

      assert!(
         h.bus
            .take()
            .iter()
            .any(|e| matches!(e, HostEvent::ModeChanged { mode: AdapterMode::Discoverable }))
      );
      assert_eq!(h.transport.take(), vec![format!("bond {PEER}"), format!("cancel_bond {PEER}")]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_inquiry_restarts_after_complete() {
      let mut config = config();
      config.name_resolving = false;
      let h = harness(config).await;
      h.manager.start_discovery(ADAPTER).await.unwrap();
      h.manager
         .handle_event(TransportEvent::InquiryComplete { adapter: ADAPTER })
         .await
         .unwrap();
      h.manager.found_devices(ADAPTER).await.unwrap();
      assert_eq!(h.transport.take().len(), 1);

      time::sleep(Duration::from_secs(12)).await;
      h.manager.found_devices(ADAPTER).await.unwrap();
      assert_eq!(h.transport.take(), vec![format!("inquiry {ADAPTER}")]);
   }
}
