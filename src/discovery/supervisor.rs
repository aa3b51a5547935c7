//! Connection supervisor for reader discovery.
//!
//! This module owns the connection state machine. It runs as a single actor
//! that starts scan sessions and connection attempts as background tasks,
//! receives their results over a loopback channel, and restarts scanning
//! from a watchdog whenever nothing is active. Scanning and connecting are
//! never in flight against the radio at the same time.

use std::{fmt, time::Duration};

use log::{debug, info, warn};
use smol_str::SmolStr;
use strum::{AsRefStr, Display};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::RadioHandle,
   config::Timing,
   discovery::{
      connect::{ConnectResult, ConnectionAttempt},
      registry::{DeviceRegistry, DiscoveredDevice, SharedRegistry},
      scan::{ScanNotice, ScanSession},
   },
   error::{ReaderLinkError, Result},
   event::{EventSender, ReaderEvent},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Grace period for background tasks on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Supervisor state. Only the actor ever changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
   Idle,
   Scanning,
   Connecting(SmolStr),
   Connected(SmolStr),
}

impl fmt::Display for ConnectionState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Idle => f.write_str("idle"),
         Self::Scanning => f.write_str("scanning"),
         Self::Connecting(address) => write!(f, "connecting:{address}"),
         Self::Connected(address) => write!(f, "connected:{address}"),
      }
   }
}

/// What a device selection did.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Selection {
   /// A connection attempt was started.
   Connecting,
   /// The selected device was the connected one and has been released.
   Disconnected,
}

// === Commands ===

#[derive(Debug)]
enum SupervisorCommand {
   // Task reports
   ScanEnded(u64, Result<()>),
   AttemptResolved(u64, SmolStr, ConnectResult),

   // User commands
   SelectDevice(SmolStr, oneshot::Sender<Result<Selection>>),
   CancelConnect(oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<Result<()>>),
   GetDevice(SmolStr, oneshot::Sender<Option<DiscoveredDevice>>),
   GetAllDevices(oneshot::Sender<Vec<DiscoveredDevice>>),
   GetState(oneshot::Sender<ConnectionState>),
}

// === Supervisor handle ===

/// Handle to the connection supervisor.
///
/// The actor shuts down once every clone of the handle is dropped.
#[derive(Clone)]
pub struct ConnectionSupervisor {
   inbox: mpsc::Sender<SupervisorCommand>,
}

impl ConnectionSupervisor {
   pub fn new(radio: RadioHandle, event_tx: EventSender, timing: Timing) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(SupervisorActor::new(radio, event_tx, timing, command_rx).run());
      Self { inbox: command_tx }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| ReaderLinkError::SupervisorShutdown)?;
      rx.await.map_err(|_| ReaderLinkError::SupervisorShutdown)
   }

   /// Selects a device: connects to it, or releases it if it is the
   /// connected one.
   pub async fn select_device(&self, address: impl Into<SmolStr>) -> Result<Selection> {
      let address = address.into();
      self
         .request(|tx| SupervisorCommand::SelectDevice(address, tx))
         .await?
   }

   pub async fn cancel_connect(&self) -> Result<()> {
      self.request(SupervisorCommand::CancelConnect).await?
   }

   pub async fn disconnect(&self) -> Result<()> {
      self.request(SupervisorCommand::Disconnect).await?
   }

   pub async fn device(&self, address: impl Into<SmolStr>) -> Result<DiscoveredDevice> {
      let address = address.into();
      self
         .request(|tx| SupervisorCommand::GetDevice(address.clone(), tx))
         .await?
         .ok_or(ReaderLinkError::DeviceNotFound(address))
   }

   pub async fn devices(&self) -> Vec<DiscoveredDevice> {
      self
         .request(SupervisorCommand::GetAllDevices)
         .await
         .unwrap_or_default()
   }

   pub async fn state(&self) -> Result<ConnectionState> {
      self.request(SupervisorCommand::GetState).await
   }
}

// === Supervisor actor ===

struct ActiveScan {
   generation: u64,
   cancel: CancellationToken,
   handle: JoinHandle<()>,
}

struct ActiveAttempt {
   generation: u64,
   cancel: CancellationToken,
   handle: JoinHandle<()>,
}

struct SupervisorActor {
   timing: Timing,
   radio: RadioHandle,
   event_tx: EventSender,
   registry: SharedRegistry,
   command_rx: mpsc::Receiver<SupervisorCommand>,
   loopback_rx: mpsc::Receiver<SupervisorCommand>,
   loopback_tx: mpsc::Sender<SupervisorCommand>,
   notice_rx: mpsc::Receiver<ScanNotice>,
   notice_tx: mpsc::Sender<ScanNotice>,

   // State
   state: ConnectionState,
   scan: Option<ActiveScan>,
   attempt: Option<ActiveAttempt>,
   generation: u64,
}

impl SupervisorActor {
   fn new(
      radio: RadioHandle,
      event_tx: EventSender,
      timing: Timing,
      command_rx: mpsc::Receiver<SupervisorCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (notice_tx, notice_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         timing,
         radio,
         event_tx,
         registry: DeviceRegistry::shared(),
         command_rx,
         loopback_rx,
         loopback_tx,
         notice_rx,
         notice_tx,
         state: ConnectionState::Idle,
         scan: None,
         attempt: None,
         generation: 0,
      }
   }

   async fn run(mut self) {
      info!("Connection supervisor starting up");

      let mut watchdog_interval = time::interval(self.timing.watchdog_interval);
      watchdog_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      // Task reports are handled before the watchdog can look at the tasks
      loop {
         select! {
             biased;
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
             Some(notice) = self.notice_rx.recv() => {
                 self.handle_notice(notice);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Connection supervisor shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             _ = watchdog_interval.tick() => {
                 self.watchdog().await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: SupervisorCommand) {
      match cmd {
         SupervisorCommand::ScanEnded(generation, result) => {
            self.handle_scan_ended(generation, result);
         },
         SupervisorCommand::AttemptResolved(generation, target, result) => {
            self.handle_attempt_resolved(generation, target, result);
         },
         SupervisorCommand::SelectDevice(address, reply) => {
            let result = self.select_device(address).await;
            let _ = reply.send(result);
         },
         SupervisorCommand::CancelConnect(reply) => {
            let _ = reply.send(self.cancel_connect());
         },
         SupervisorCommand::Disconnect(reply) => {
            let result = self.disconnect().await;
            let _ = reply.send(result);
         },
         SupervisorCommand::GetDevice(address, reply) => {
            let device = self.registry.lock().get(&address).cloned();
            let _ = reply.send(device);
         },
         SupervisorCommand::GetAllDevices(reply) => {
            let devices = self.registry.lock().snapshot();
            let _ = reply.send(devices);
         },
         SupervisorCommand::GetState(reply) => {
            let _ = reply.send(self.state.clone());
         },
      }
   }

   fn handle_notice(&self, notice: ScanNotice) {
      match notice {
         ScanNotice::DeviceDiscovered(device) => {
            info!(
               "Discovered {} ({}, {})",
               device.address,
               device.name.as_deref().unwrap_or("unnamed"),
               device.reader_kind()
            );
            self.event_tx.emit(ReaderEvent::DeviceDiscovered(device));
         },
         ScanNotice::RegistryChanged => {
            self.event_tx.emit(ReaderEvent::RegistryChanged);
         },
      }
   }

   fn handle_scan_ended(&mut self, generation: u64, result: Result<()>) {
      if self.scan.as_ref().is_none_or(|s| s.generation != generation) {
         debug!("Ignoring end of superseded scan session {generation}");
         return;
      }
      self.scan = None;

      if let Err(e) = result {
         warn!("Scan session failed: {e}. Watchdog will retry.");
      }
      if self.state == ConnectionState::Scanning {
         self.transition(ConnectionState::Idle);
      }
   }

   fn handle_attempt_resolved(&mut self, generation: u64, target: SmolStr, result: ConnectResult) {
      if self.attempt.as_ref().is_none_or(|a| a.generation != generation) {
         debug!("Ignoring result of superseded attempt {generation}");
         return;
      }
      self.attempt = None;

      self
         .event_tx
         .emit(ReaderEvent::ConnectionResolved(target.clone(), result));
      match result.into_result(&target) {
         Ok(()) => {
            self.event_tx.emit(ReaderEvent::RegistryChanged);
            self.transition(ConnectionState::Connected(target));
         },
         Err(e) => {
            // The registry is kept; only an explicit disconnect clears it
            warn!("{e}");
            self.transition(ConnectionState::Idle);
         },
      }
   }

   async fn select_device(&mut self, address: SmolStr) -> Result<Selection> {
      match self.state.clone() {
         ConnectionState::Connected(current) if current == address => {
            self.release_link().await;
            return Ok(Selection::Disconnected);
         },
         ConnectionState::Connected(_) => return Err(ReaderLinkError::AlreadyConnected),
         ConnectionState::Connecting(_) => return Err(ReaderLinkError::AlreadyConnecting),
         ConnectionState::Idle | ConnectionState::Scanning => {},
      }

      let (known, linked) = {
         let registry = self.registry.lock();
         (registry.get(&address).is_some(), registry.connected_address())
      };
      if !known {
         return Err(ReaderLinkError::DeviceNotFound(address));
      }
      if let Some(linked) = linked {
         debug!("{linked} is still marked connected");
         return Err(ReaderLinkError::AlreadyConnected);
      }
      if self.radio.is_connected().await {
         return Err(ReaderLinkError::AlreadyConnected);
      }

      self.start_attempt(address);
      Ok(Selection::Connecting)
   }

   fn cancel_connect(&self) -> Result<()> {
      let attempt = self
         .attempt
         .as_ref()
         .ok_or(ReaderLinkError::NoActiveAttempt)?;
      attempt.cancel.cancel();
      Ok(())
   }

   async fn disconnect(&mut self) -> Result<()> {
      match self.state {
         ConnectionState::Connected(_) => {
            self.release_link().await;
            Ok(())
         },
         ConnectionState::Connecting(_) => self.cancel_connect(),
         ConnectionState::Idle | ConnectionState::Scanning => {
            Err(ReaderLinkError::DeviceNotConnected)
         },
      }
   }

   /// Drops the link and forgets every discovered device.
   ///
   /// The release always takes effect; a failed disconnect is only logged.
   async fn release_link(&mut self) {
      if let Err(e) = self.radio.disconnect(false).await {
         warn!("Disconnect failed: {e}");
      }

      {
         let mut registry = self.registry.lock();
         if !registry.is_empty() {
            info!("Forgetting {} discovered device(s)", registry.len());
            registry.clear_all();
         }
      }
      self.event_tx.emit(ReaderEvent::RegistryChanged);
      self.transition(ConnectionState::Idle);
   }

   fn start_scan(&mut self) {
      let generation = self.next_generation();
      let cancel = CancellationToken::new();
      let mut session = ScanSession::new(
         self.radio.clone(),
         self.registry.clone(),
         self.notice_tx.clone(),
         &self.timing,
      );

      let loopback = self.loopback_tx.clone();
      let token = cancel.clone();
      let handle = tokio::spawn(async move {
         let result = session.run(&token).await;
         if let Err(e) = loopback
            .send(SupervisorCommand::ScanEnded(generation, result))
            .await
         {
            warn!("Channel overflow sending scan ended: {e}");
         }
      });

      self.scan = Some(ActiveScan {
         generation,
         cancel,
         handle,
      });
      self.transition(ConnectionState::Scanning);
   }

   fn start_attempt(&mut self, target: SmolStr) {
      let generation = self.next_generation();
      let cancel = CancellationToken::new();
      let attempt = ConnectionAttempt::new(
         self.radio.clone(),
         self.registry.clone(),
         target.clone(),
         &self.timing,
      );

      let scan = self.scan.take();
      if let Some(scan) = &scan {
         scan.cancel.cancel();
      }

      let loopback = self.loopback_tx.clone();
      let token = cancel.clone();
      let handle = tokio::spawn(async move {
         // The radio must have stopped scanning before it is asked to connect
         if let Some(scan) = scan
            && let Err(e) = scan.handle.await
         {
            warn!("Scan session {} panicked: {e}", scan.generation);
         }

         let target = attempt.target().clone();
         let result = attempt.run(&token).await;
         if let Err(e) = loopback
            .send(SupervisorCommand::AttemptResolved(generation, target, result))
            .await
         {
            warn!("Channel overflow sending attempt result: {e}");
         }
      });

      self.attempt = Some(ActiveAttempt {
         generation,
         cancel,
         handle,
      });
      self.transition(ConnectionState::Connecting(target));
   }

   async fn watchdog(&mut self) {
      let scan_done = self.scan.as_ref().is_some_and(|s| s.handle.is_finished());
      let attempt_done = self.attempt.as_ref().is_some_and(|a| a.handle.is_finished());
      if scan_done || attempt_done {
         // A task sends its report before it finishes
         while let Ok(cmd) = self.loopback_rx.try_recv() {
            self.handle_command(cmd).await;
         }
      }

      // Whatever is still finished died without reporting
      if self.scan.as_ref().is_some_and(|s| s.handle.is_finished()) {
         warn!("Scan session ended without reporting");
         self.scan = None;
         if self.state == ConnectionState::Scanning {
            self.transition(ConnectionState::Idle);
         }
      }
      if self.attempt.as_ref().is_some_and(|a| a.handle.is_finished()) {
         warn!("Connection attempt ended without reporting");
         self.attempt = None;
         if let Err(e) = self.radio.disconnect(true).await {
            warn!("Cleanup disconnect failed: {e}");
         }
         if matches!(self.state, ConnectionState::Connecting(_)) {
            self.transition(ConnectionState::Idle);
         }
      }

      if self.scan.is_some() || self.attempt.is_some() {
         return;
      }

      if let ConnectionState::Connected(address) = self.state.clone() {
         if self.radio.is_connected().await {
            return;
         }
         warn!("Link to {address} lost");
         if let Err(e) = self.radio.disconnect(true).await {
            debug!("Cleanup disconnect failed: {e}");
         }
         self.registry.lock().mark_connected(&address, false);
         self.event_tx.emit(ReaderEvent::RegistryChanged);
         self.transition(ConnectionState::Idle);
      }

      debug!("Watchdog: nothing active, starting scan");
      self.start_scan();
   }

   fn transition(&mut self, next: ConnectionState) {
      if self.state == next {
         return;
      }
      info!("State {} -> {next}", self.state);
      self.state = next.clone();
      self.event_tx.emit(ReaderEvent::StateChanged(next));
   }

   fn next_generation(&mut self) -> u64 {
      self.generation += 1;
      self.generation
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up connection supervisor");

      if let Some(scan) = self.scan.take() {
         scan.cancel.cancel();
         let _ = time::timeout(SHUTDOWN_TIMEOUT, scan.handle).await;
      }
      if let Some(attempt) = self.attempt.take() {
         attempt.cancel.cancel();
         let _ = time::timeout(SHUTDOWN_TIMEOUT, attempt.handle).await;
      }
      if matches!(self.state, ConnectionState::Connected(_))
         && let Err(e) = self.radio.disconnect(false).await
      {
         warn!("Disconnect on shutdown failed: {e}");
      }
   }
}
