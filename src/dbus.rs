use std::str::FromStr;

use bluer::Address;
use log::info;
use smol_str::{SmolStr, ToSmolStr};
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   discovery::{registry::DiscoveredDevice, supervisor::ConnectionSupervisor},
   error::ReaderLinkError,
};

pub struct ReaderLinkService {
   supervisor: ConnectionSupervisor,
}

impl ReaderLinkService {
   pub const fn new(supervisor: ConnectionSupervisor) -> Self {
      Self { supervisor }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<SmolStr> {
   let addr =
      Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
   Ok(addr.to_smolstr())
}

fn failed(err: ReaderLinkError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(err.to_string())
}

#[interface(name = "org.readerlink.Supervisor")]
impl ReaderLinkService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .supervisor
         .devices()
         .await
         .iter()
         .map(DiscoveredDevice::to_json)
         .collect();
      serde_json::to_string(&devices).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn get_device(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let dev = self.supervisor.device(addr).await.map_err(failed)?;
      Ok(dev.to_json().to_string())
   }

   async fn get_state(&self) -> zbus::fdo::Result<String> {
      let state = self.supervisor.state().await.map_err(failed)?;
      Ok(state.to_string())
   }

   async fn select_device(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let selection = self
         .supervisor
         .select_device(addr.clone())
         .await
         .map_err(failed)?;

      info!("Selected {addr}: {selection}");
      Ok(selection.as_ref().to_owned())
   }

   async fn cancel_connect(&self) -> zbus::fdo::Result<bool> {
      self.supervisor.cancel_connect().await.map_err(failed)?;
      Ok(true)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.supervisor.disconnect().await.map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_discovered(
      emitter: &SignalEmitter<'_>,
      address: &str,
      device: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_resolved(
      emitter: &SignalEmitter<'_>,
      address: &str,
      result: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn registry_changed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }
}
