//! Bluetooth host daemon.
//!
//! Controller events, agent replies and user requests are read from stdin
//! as JSON lines. Controller commands, agent prompts, host events and
//! request responses are written to stdout the same way.

use std::{io, sync::Arc, time::Duration};

use bthostd::{
   bluetooth::{address::Address, manager::BluetoothManager},
   bridge::{Inbound, JsonLines},
   config::Config,
   error::Result,
   event::{EventBus, HostEvent},
   storage::Storage,
};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{
   io::{AsyncBufReadExt, BufReader},
   select, signal,
   sync::Notify,
   time,
};

type Bridge = JsonLines<io::Stdout>;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting bthostd...");

   // Load configuration
   let config = Config::load()?;
   let root = config.storage_root()?;
   info!(
      "Loaded configuration with {} adapters, storage at {}",
      config.adapters.len(),
      root.display()
   );

   let bridge = Arc::new(JsonLines::new(io::stdout()));
   let event_bus = EventProcessor::new();

   let manager = BluetoothManager::new(
      config,
      Storage::new(root),
      bridge.clone(),
      bridge.clone(),
      event_bus.clone(),
   )
   .await?;

   // Start event processor
   event_bus.spawn_dispatcher(bridge.clone());

   let mut lines = BufReader::new(tokio::io::stdin()).lines();
   loop {
      select! {
          line = lines.next_line() => {
              let Some(line) = line? else {
                  info!("Input closed");
                  break;
              };
              handle_line(&manager, &bridge, &line).await;
          }
          res = signal::ctrl_c() => {
              res?;
              break;
          }
      }
   }

   info!("Shutting down bthostd...");
   Ok(())
}

async fn handle_line(manager: &BluetoothManager, bridge: &Bridge, line: &str) {
   let line = line.trim();
   if line.is_empty() {
      return;
   }

   let inbound = match Inbound::parse(line) {
      Ok(inbound) => inbound,
      Err(e) => {
         warn!("Ignoring malformed input: {e}");
         return;
      },
   };

   let result = match inbound {
      Inbound::Event(event) => manager.handle_event(event).await,
      Inbound::Reply { token, response } => match manager.agent_reply(token, response).await {
         Ok(accepted) => {
            if !accepted {
               debug!("Agent reply {token} was not pending");
            }
            Ok(())
         },
         Err(e) => Err(e),
      },
      Inbound::Request(request) => {
         let name = request.name();
         let result = request.execute(manager).await;
         bridge.write_response(name, result)
      },
   };
   if let Err(e) = result {
      warn!("Error handling input: {e}");
   }
}

struct EventProcessor {
   queue: SegQueue<(Address, HostEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Address, HostEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn spawn_dispatcher(self: Arc<Self>, bridge: Arc<Bridge>) {
      tokio::spawn(async move {
         while let Some((adapter, event)) = self.recv().await {
            if let Err(e) = bridge.write_event(&adapter, &event) {
               warn!("Error dispatching event: {e}");
            }
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, adapter: &Address, event: HostEvent) {
      self.queue.push((*adapter, event));
      self.notifier.notify_waiters();
   }
}
