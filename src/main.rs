//! BLE reader D-Bus service.
//!
//! This service keeps a BlueZ adapter scanning for compatible readers,
//! maintains the list of readers currently in range, and connects to the
//! one selected over D-Bus, one scan or connect at a time.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::bluez::BluezRadio;
use dbus::ReaderLinkService;
use discovery::supervisor::ConnectionSupervisor;
use event::{EventBus, ReaderEvent};

mod bluetooth;
mod config;
mod dbus;
mod discovery;
mod error;
mod event;

use crate::{dbus::ReaderLinkServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting readerlink D-Bus service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} name pattern(s)",
      config.name_patterns.len()
   );

   let event_bus = EventProcessor::new();

   let radio = Arc::new(BluezRadio::new(&config).await?);
   let supervisor = ConnectionSupervisor::new(radio, event_bus.clone(), config.timing());

   let service = ReaderLinkService::new(supervisor);

   let connection = connection::Builder::session()?
      .name("org.readerlink")?
      .serve_at("/org/readerlink/supervisor", service)?
      .build()
      .await?;

   info!("readerlink D-Bus service started at org.readerlink");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down readerlink service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<ReaderEvent>,
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
   async fn recv(self: &Arc<Self>) -> Option<ReaderEvent> {
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

   async fn dispatch(
      &self,
      iface: &InterfaceRef<ReaderLinkService>,
      event: ReaderEvent,
   ) -> Result<()> {
      match event {
         ReaderEvent::DeviceDiscovered(device) => {
            iface
               .device_discovered(&device.address, &device.to_json().to_string())
               .await?;
         },
         ReaderEvent::ConnectionResolved(address, result) => {
            iface.connection_resolved(&address, result.as_ref()).await?;
         },
         ReaderEvent::RegistryChanged => {
            iface.registry_changed().await?;
         },
         ReaderEvent::StateChanged(state) => {
            iface.state_changed(&state.to_string()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, ReaderLinkService>("/org/readerlink/supervisor")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: ReaderEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
