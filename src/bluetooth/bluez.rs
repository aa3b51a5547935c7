//! BlueZ implementation of the radio port.
//!
//! Discovery events are drained by a background task into a lock-free
//! queue, which `poll_next_sighting` pops without ever blocking. Connects
//! run in their own task so the caller only issues the command and polls
//! the link state afterwards.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, ErrorKind, Session,
};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr};
use tokio::task::JoinHandle;

use crate::{
   bluetooth::{RadioPort, RawSighting, SightingFeed, recognition},
   config::Config,
   error::{ReaderLinkError, Result},
};

/// An outstanding or established link.
struct Link {
   address: Address,
   pending: JoinHandle<()>,
}

/// Radio port backed by a single BlueZ adapter.
pub struct BluezRadio {
   adapter: Adapter,
   name_patterns: Arc<[SmolStr]>,
   sightings: Arc<SightingFeed>,
   discovery: Mutex<Option<JoinHandle<()>>>,
   link: Mutex<Option<Link>>,
}

impl BluezRadio {
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session
            .adapter(name)
            .map_err(|_| ReaderLinkError::AdapterNotFound)?,
         None => session.default_adapter().await?,
      };

      // Ensure adapter is powered on
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      info!("Using adapter: {}", adapter.name());

      Ok(Self {
         adapter,
         name_patterns: config.name_patterns.clone().into(),
         sightings: Arc::new(SightingFeed::new()),
         discovery: Mutex::new(None),
         link: Mutex::new(None),
      })
   }

   fn spawn_discovery(
      adapter: Adapter,
      patterns: Arc<[SmolStr]>,
      queue: Arc<SightingFeed>,
      events: impl futures::Stream<Item = AdapterEvent> + Send + 'static,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         pin_mut!(events);
         while let Some(event) = events.next().await {
            // Changed devices are reported as DeviceAdded again
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            match read_sighting(&adapter, addr).await {
               Ok(Some(sighting))
                  if recognition::is_compatible(sighting.name.as_deref(), &patterns) =>
               {
                  queue.push(sighting);
               },
               Ok(_) => {},
               Err(e) if is_permission_error(&e) => {
                  debug!("Dropping sighting of {addr}: permission denied");
               },
               Err(e) => {
                  debug!("Dropping sighting of {addr}: {e}");
               },
            }
         }
         debug!("Discovery stream ended");
      })
   }
}

fn is_permission_error(err: &bluer::Error) -> bool {
   matches!(err.kind, ErrorKind::NotPermitted | ErrorKind::NotAuthorized)
}

fn radio_error(err: bluer::Error) -> ReaderLinkError {
   if is_permission_error(&err) {
      ReaderLinkError::PermissionDenied
   } else {
      err.into()
   }
}

/// Reads the advertisement properties of a device.
///
/// Devices without an RSSI are cached entries that are not currently
/// advertising and produce no sighting.
async fn read_sighting(adapter: &Adapter, addr: Address) -> bluer::Result<Option<RawSighting>> {
   let device = adapter.device(addr)?;
   let Some(rssi) = device.rssi().await? else {
      return Ok(None);
   };

   let name = device.name().await?.map(SmolStr::from);
   let mut uuids: Vec<_> = device.uuids().await?.unwrap_or_default().into_iter().collect();
   uuids.sort_unstable();
   let manufacturer_data = device.manufacturer_data().await?.unwrap_or_default();

   Ok(Some(RawSighting {
      address: addr.to_smolstr(),
      name,
      rssi,
      service_signature: recognition::service_signature(&uuids, &manufacturer_data),
      raw_advertisement: recognition::flatten_manufacturer_data(&manufacturer_data),
   }))
}

#[async_trait]
impl RadioPort for BluezRadio {
   async fn start_scan(&self) -> Result<()> {
      // Nothing is feeding the queue between scans; what is left is stale
      if self.discovery.lock().is_none() {
         let dropped = self.sightings.discard();
         if dropped > 0 {
            debug!("Discarded {dropped} stale sighting(s)");
         }
      }

      let filter = DiscoveryFilter {
         transport: DiscoveryTransport::Le,
         duplicate_data: true,
         ..Default::default()
      };
      self
         .adapter
         .set_discovery_filter(filter)
         .await
         .map_err(radio_error)?;
      let events = self
         .adapter
         .discover_devices_with_changes()
         .await
         .map_err(radio_error)?;

      let handle = Self::spawn_discovery(
         self.adapter.clone(),
         self.name_patterns.clone(),
         self.sightings.clone(),
         events,
      );
      if let Some(previous) = self.discovery.lock().replace(handle) {
         previous.abort();
      }
      debug!("Discovery started on {}", self.adapter.name());
      Ok(())
   }

   async fn stop_scan(&self) -> Result<()> {
      // Dropping the event stream ends the discovery session
      if let Some(handle) = self.discovery.lock().take() {
         handle.abort();
         debug!("Discovery stopped on {}", self.adapter.name());
      }
      Ok(())
   }

   fn poll_next_sighting(&self) -> Option<RawSighting> {
      self.sightings.pop()
   }

   async fn connect(&self, address: &str) -> Result<()> {
      let addr = Address::from_str(address)
         .map_err(|_| ReaderLinkError::InvalidAddress(address.to_smolstr()))?;
      let device = self.adapter.device(addr).map_err(radio_error)?;

      let pending = tokio::spawn(async move {
         match device.connect().await {
            Ok(()) => debug!("Link to {addr} established"),
            Err(e) => warn!("Connect to {addr} failed: {e}"),
         }
      });
      if let Some(previous) = self.link.lock().replace(Link { address: addr, pending }) {
         previous.pending.abort();
      }
      Ok(())
   }

   async fn disconnect(&self, force: bool) -> Result<()> {
      let Some(link) = self.link.lock().take() else {
         return Ok(());
      };
      link.pending.abort();

      let device = self.adapter.device(link.address)?;
      if force || device.is_connected().await.unwrap_or(false) {
         match device.disconnect().await {
            Ok(()) => info!("Disconnected from {}", link.address),
            // Not connected is fine for a forced cleanup
            Err(e) if force => debug!("Forced disconnect of {}: {e}", link.address),
            Err(e) => return Err(e.into()),
         }
      }
      Ok(())
   }

   async fn is_connected(&self) -> bool {
      let Some(addr) = self.link.lock().as_ref().map(|l| l.address) else {
         return false;
      };
      match self.adapter.device(addr) {
         Ok(device) => device.is_connected().await.unwrap_or(false),
         Err(_) => false,
      }
   }
}
