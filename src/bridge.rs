//! JSON-lines front end.
//!
//! Every line read is a controller event, an agent reply or a user
//! request. Everything going out is written as one JSON object per line
//! tagged with `type`: controller commands, agent prompts, host events and
//! request responses.

use std::io::Write;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::{
      address::Address,
      manager::BluetoothManager,
      transport::{Agent, AgentResponse, AuthRequest, OobData, Transport, TransportEvent},
   },
   error::Result,
   event::HostEvent,
   storage::records::AdapterMode,
};

/// One line of input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
   Event(TransportEvent),
   Reply { token: u64, response: AgentResponse },
   Request(Request),
}

impl Inbound {
   pub fn parse(line: &str) -> Result<Self> {
      Ok(serde_json::from_str(line)?)
   }
}

fn all_services() -> String {
   "[all]".to_string()
}

/// User requests, answered with a `response` line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "request", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Request {
   StartDiscovery {
      adapter: Address,
   },
   StopDiscovery {
      adapter: Address,
   },
   Pair {
      adapter: Address,
      peer: Address,
   },
   CancelPairing {
      adapter: Address,
      peer: Address,
   },
   RemoveDevice {
      adapter: Address,
      peer: Address,
   },
   SetTrusted {
      adapter: Address,
      peer: Address,
      #[serde(default = "all_services")]
      service: String,
      trusted: bool,
   },
   SetBlocked {
      adapter: Address,
      peer: Address,
      blocked: bool,
   },
   SetMode {
      adapter: Address,
      mode: AdapterMode,
   },
   GetDevice {
      adapter: Address,
      peer: Address,
   },
   FoundDevices {
      adapter: Address,
   },
}

impl Request {
   pub fn name(&self) -> &'static str {
      self.into()
   }

   /// Runs the request against the manager. Requests without a payload
   /// answer with `null`.
   pub async fn execute(self, manager: &BluetoothManager) -> Result<serde_json::Value> {
      match self {
         Self::StartDiscovery { adapter } => manager.start_discovery(adapter).await?,
         Self::StopDiscovery { adapter } => manager.stop_discovery(adapter).await?,
         Self::Pair { adapter, peer } => manager.pair(adapter, peer).await?,
         Self::CancelPairing { adapter, peer } => manager.cancel_pairing(adapter, peer).await?,
         Self::RemoveDevice { adapter, peer } => manager.remove_device(adapter, peer).await?,
         Self::SetTrusted {
            adapter,
            peer,
            service,
            trusted,
         } => {
            manager
               .set_trusted(adapter, peer, &service, trusted)
               .await?;
         },
         Self::SetBlocked {
            adapter,
            peer,
            blocked,
         } => manager.set_blocked(adapter, peer, blocked).await?,
         Self::SetMode { adapter, mode } => manager.set_mode(adapter, mode).await?,
         Self::GetDevice { adapter, peer } => {
            return Ok(serde_json::to_value(manager.get_device(adapter, peer).await?)?);
         },
         Self::FoundDevices { adapter } => {
            return Ok(serde_json::to_value(manager.found_devices(adapter).await?)?);
         },
      }
      Ok(serde_json::Value::Null)
   }
}

#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControllerCommand<'a> {
   PincodeReply {
      adapter: &'a Address,
      peer: &'a Address,
      /// Hex encoded; absent for a negative reply.
      #[serde(skip_serializing_if = "Option::is_none")]
      pin: Option<String>,
   },
   ConfirmReply {
      adapter: &'a Address,
      peer: &'a Address,
      accept: bool,
   },
   PasskeyReply {
      adapter: &'a Address,
      peer: &'a Address,
      passkey: u32,
   },
   OobReply {
      adapter: &'a Address,
      peer: &'a Address,
      #[serde(skip_serializing_if = "Option::is_none")]
      data: Option<&'a OobData>,
   },
   ResolveName {
      adapter: &'a Address,
      peer: &'a Address,
   },
   CancelResolveName {
      adapter: &'a Address,
      peer: &'a Address,
   },
   CreateBonding {
      adapter: &'a Address,
      peer: &'a Address,
   },
   CancelBonding {
      adapter: &'a Address,
      peer: &'a Address,
   },
   StartInquiry {
      adapter: &'a Address,
   },
   StopInquiry {
      adapter: &'a Address,
   },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
   Command(ControllerCommand<'a>),
   AuthRequest(&'a AuthRequest),
   Event {
      adapter: &'a Address,
      #[serde(flatten)]
      event: &'a HostEvent,
   },
   Response {
      request: &'a str,
      ok: bool,
      #[serde(skip_serializing_if = "Option::is_none")]
      data: Option<serde_json::Value>,
      #[serde(skip_serializing_if = "Option::is_none")]
      error: Option<String>,
   },
}

/// Line writer acting as both the controller transport and the agent.
pub struct JsonLines<W> {
   out: Mutex<W>,
}

impl<W: Write + Send> JsonLines<W> {
   pub fn new(out: W) -> Self {
      Self {
         out: Mutex::new(out),
      }
   }

   pub fn into_inner(self) -> W {
      self.out.into_inner()
   }

   fn write(&self, line: &Outbound<'_>) -> Result<()> {
      let mut out = self.out.lock();
      serde_json::to_writer(&mut *out, line)?;
      out.write_all(b"\n")?;
      out.flush()?;
      Ok(())
   }

   fn command(&self, command: ControllerCommand<'_>) -> Result<()> {
      self.write(&Outbound::Command(command))
   }

   pub fn write_event(&self, adapter: &Address, event: &HostEvent) -> Result<()> {
      self.write(&Outbound::Event { adapter, event })
   }

   pub fn write_response(&self, request: &str, result: Result<serde_json::Value>) -> Result<()> {
      let line = match result {
         Ok(value) => Outbound::Response {
            request,
            ok: true,
            data: (!value.is_null()).then_some(value),
            error: None,
         },
         Err(e) => {
            debug!("Request {request} failed: {e}");
            Outbound::Response {
               request,
               ok: false,
               data: None,
               error: Some(e.to_string()),
            }
         },
      };
      self.write(&line)
   }
}

impl<W: Write + Send> Transport for JsonLines<W> {
   fn pincode_reply(&self, adapter: &Address, peer: &Address, pin: Option<&[u8]>) -> Result<()> {
      self.command(ControllerCommand::PincodeReply {
         adapter,
         peer,
         pin: pin.map(hex::encode),
      })
   }

   fn confirm_reply(&self, adapter: &Address, peer: &Address, accept: bool) -> Result<()> {
      self.command(ControllerCommand::ConfirmReply {
         adapter,
         peer,
         accept,
      })
   }

   fn passkey_reply(&self, adapter: &Address, peer: &Address, passkey: u32) -> Result<()> {
      self.command(ControllerCommand::PasskeyReply {
         adapter,
         peer,
         passkey,
      })
   }

   fn oob_reply(&self, adapter: &Address, peer: &Address, data: Option<&OobData>) -> Result<()> {
      self.command(ControllerCommand::OobReply { adapter, peer, data })
   }

   fn resolve_name(&self, adapter: &Address, peer: &Address) -> Result<()> {
      self.command(ControllerCommand::ResolveName { adapter, peer })
   }

   fn cancel_resolve_name(&self, adapter: &Address, peer: &Address) -> Result<()> {
      self.command(ControllerCommand::CancelResolveName { adapter, peer })
   }

   fn create_bonding(&self, adapter: &Address, peer: &Address) -> Result<()> {
      self.command(ControllerCommand::CreateBonding { adapter, peer })
   }

   fn cancel_bonding(&self, adapter: &Address, peer: &Address) -> Result<()> {
      self.command(ControllerCommand::CancelBonding { adapter, peer })
   }

   fn start_inquiry(&self, adapter: &Address) -> Result<()> {
      self.command(ControllerCommand::StartInquiry { adapter })
   }

   fn stop_inquiry(&self, adapter: &Address) -> Result<()> {
      self.command(ControllerCommand::StopInquiry { adapter })
   }
}

impl<W: Write + Send> Agent for JsonLines<W> {
   fn request(&self, request: AuthRequest) -> Result<()> {
      self.write(&Outbound::AuthRequest(&request))
   }
}

#[cfg(test)]
mod tests {
   use serde_json::{Value, json};

   use super::*;
   use crate::{bluetooth::transport::AuthKind, error::HostError};

   const ADAPTER: &str = "00:11:22:33:44:55";
   const PEER: &str = "AA:BB:CC:DD:EE:FF";

   fn lines(bridge: JsonLines<Vec<u8>>) -> Vec<Value> {
      String::from_utf8(bridge.into_inner())
         .unwrap()
         .lines()
         .map(|l| serde_json::from_str(l).unwrap())
         .collect()
   }

   #[test]
   fn test_parse_inbound_kinds() {
      let event = Inbound::parse(&format!(
         r#"{{"event":"inquiry_complete","adapter":"{ADAPTER}"}}"#
      ))
      .unwrap();
      assert!(matches!(event, Inbound::Event(TransportEvent::InquiryComplete { .. })));

      let reply = Inbound::parse(r#"{"token":3,"response":{"result":"passkey","value":1234}}"#).unwrap();
      assert_eq!(reply, Inbound::Reply {
         token: 3,
         response: AgentResponse::Passkey(1234),
      });

      let request = Inbound::parse(&format!(
         r#"{{"request":"set_trusted","adapter":"{ADAPTER}","peer":"{PEER}","trusted":true}}"#
      ))
      .unwrap();
      let Inbound::Request(request) = request else {
         panic!("not a request: {request:?}");
      };
      assert_eq!(request.name(), "set_trusted");
      assert!(matches!(request, Request::SetTrusted { ref service, .. } if service == "[all]"));
   }

   #[test]
   fn test_parse_rejects_garbage() {
      assert!(matches!(Inbound::parse("{\"hello\":1}"), Err(HostError::Json(_))));
      assert!(Inbound::parse("not json").is_err());
   }

   #[test]
   fn test_outbound_lines() {
      let adapter: Address = ADAPTER.parse().unwrap();
      let peer: Address = PEER.parse().unwrap();
      let bridge = JsonLines::new(Vec::new());

      bridge.pincode_reply(&adapter, &peer, Some(b"0000".as_slice())).unwrap();
      bridge.pincode_reply(&adapter, &peer, None).unwrap();
      bridge
         .request(AuthRequest {
            token: 9,
            adapter,
            peer,
            kind: AuthKind::Notify { passkey: 42 },
         })
         .unwrap();
      bridge
         .write_event(&adapter, &HostEvent::Bonded { peer })
         .unwrap();
      bridge
         .write_response("pair", Err(HostError::AlreadyBonding(peer)))
         .unwrap();

      let out = lines(bridge);
      assert_eq!(
         out[0],
         json!({"type": "command", "command": "pincode_reply", "adapter": ADAPTER, "peer": PEER, "pin": "30303030"})
      );
      assert!(out[1].get("pin").is_none());
      assert_eq!(out[2]["type"], "auth_request");
      assert_eq!(out[2]["kind"], "notify");
      assert_eq!(out[2]["token"], 9);
      assert_eq!(out[3], json!({"type": "event", "adapter": ADAPTER, "event": "bonded", "peer": PEER}));
      assert_eq!(out[4]["ok"], false);
      assert!(out[4]["error"].as_str().unwrap().contains(PEER));
   }
}
