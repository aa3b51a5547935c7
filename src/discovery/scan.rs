//! Scan session: keeps the radio scanning and feeds the registry.
//!
//! A session drains at most one sighting per tick, scores one aging window
//! at a time, and bounces the radio scan at every window boundary. A session
//! runs once; the supervisor creates a fresh one for every restart.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::{
   select,
   sync::mpsc,
   time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{RadioHandle, RawSighting},
   config::Timing,
   discovery::registry::{DiscoveredDevice, ScanSweep, SharedRegistry, UpsertOutcome},
   error::{ReaderLinkError, Result},
};

/// Notices sent from a scan session to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanNotice {
   DeviceDiscovered(DiscoveredDevice),
   RegistryChanged,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanState {
   NotStarted,
   Scanning,
   Stopped,
}

pub struct ScanSession {
   radio: RadioHandle,
   registry: SharedRegistry,
   notices: mpsc::Sender<ScanNotice>,
   sweep: ScanSweep,
   state: ScanState,
   tick: Duration,
   aging_window: Duration,
}

fn scan_start_failed(err: ReaderLinkError) -> ReaderLinkError {
   match err {
      ReaderLinkError::ScanStartFailed(_) => err,
      other => ReaderLinkError::ScanStartFailed(other.to_string()),
   }
}

impl ScanSession {
   pub fn new(
      radio: RadioHandle,
      registry: SharedRegistry,
      notices: mpsc::Sender<ScanNotice>,
      timing: &Timing,
   ) -> Self {
      Self {
         radio,
         registry,
         notices,
         sweep: ScanSweep::new(),
         state: ScanState::NotStarted,
         tick: timing.scan_tick,
         aging_window: timing.aging_window,
      }
   }

   pub const fn state(&self) -> ScanState {
      self.state
   }

   /// Runs the session until it is cancelled or the radio refuses to scan.
   ///
   /// The radio scan is always stopped before returning, once started.
   pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
      if self.state != ScanState::NotStarted {
         return Err(ReaderLinkError::ScanStartFailed(
            "scan session already ran".into(),
         ));
      }

      if let Err(e) = self.radio.start_scan().await {
         self.state = ScanState::Stopped;
         return Err(scan_start_failed(e));
      }
      self.state = ScanState::Scanning;
      info!("Scan session started");

      let result = self.drive(cancel).await;

      if let Err(e) = self.radio.stop_scan().await {
         warn!("Failed to stop scan: {e}");
      }
      self.state = ScanState::Stopped;
      info!("Scan session stopped");
      result
   }

   async fn drive(&mut self, cancel: &CancellationToken) -> Result<()> {
      let mut ticker = time::interval(self.tick);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut window_start = Instant::now();

      loop {
         select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
         }

         if let Some(sighting) = self.radio.poll_next_sighting() {
            self.ingest(sighting).await;
         }

         if window_start.elapsed() >= self.aging_window {
            self.close_window().await?;
            window_start = Instant::now();
         }
      }
   }

   async fn ingest(&mut self, sighting: RawSighting) {
      let address = sighting.address.clone();
      let (outcome, device) = {
         let mut registry = self.registry.lock();
         let outcome = registry.upsert(sighting);
         (outcome, registry.get(&address).cloned())
      };

      match (outcome, device) {
         (UpsertOutcome::Inserted, Some(device)) => {
            debug!("New device {address} (rssi {})", device.rssi);
            self.notify(ScanNotice::DeviceDiscovered(device)).await;
            self.notify(ScanNotice::RegistryChanged).await;
         },
         (UpsertOutcome::Updated, _) => {
            self.notify(ScanNotice::RegistryChanged).await;
         },
         (UpsertOutcome::Rejected, _) => {
            debug!("Dropped malformed sighting");
         },
         (UpsertOutcome::Inserted, None) => {},
      }
   }

   /// Scores the window and restarts the radio scan.
   ///
   /// The scan is stopped first so the queue stops growing, then every
   /// sighting already queued is applied before the window is reconciled.
   async fn close_window(&mut self) -> Result<()> {
      if let Err(e) = self.radio.stop_scan().await {
         warn!("Failed to stop scan for restart: {e}");
      }

      while let Some(sighting) = self.radio.poll_next_sighting() {
         self.ingest(sighting).await;
      }

      let evicted = self.registry.lock().reconcile(&mut self.sweep);
      debug!("Aging window closed, {} device(s) tracked", self.sweep.len());
      if !evicted.is_empty() {
         info!("Evicted {} stale device(s): {evicted:?}", evicted.len());
         self.notify(ScanNotice::RegistryChanged).await;
      }

      self.radio.start_scan().await.map_err(scan_start_failed)
   }

   async fn notify(&self, notice: ScanNotice) {
      if let Err(e) = self.notices.send(notice).await {
         debug!("Scan notice dropped: {e}");
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;
   use crate::{
      bluetooth::{
         RadioPort,
         fake::{FakeRadio, RadioOp, sighting},
      },
      discovery::registry::DeviceRegistry,
   };

   struct Harness {
      radio: Arc<FakeRadio>,
      registry: SharedRegistry,
      notices: mpsc::Receiver<ScanNotice>,
      cancel: CancellationToken,
      handle: tokio::task::JoinHandle<(Result<()>, ScanState)>,
   }

   fn start(radio: Arc<FakeRadio>) -> Harness {
      let registry = DeviceRegistry::shared();
      let (tx, notices) = mpsc::channel(4096);
      let mut session = ScanSession::new(radio.clone(), registry.clone(), tx, &Timing::default());
      assert_eq!(session.state(), ScanState::NotStarted);

      let cancel = CancellationToken::new();
      let token = cancel.clone();
      let handle = tokio::spawn(async move {
         let result = session.run(&token).await;
         (result, session.state())
      });
      Harness {
         radio,
         registry,
         notices,
         cancel,
         handle,
      }
   }

   fn discovered(notices: &mut mpsc::Receiver<ScanNotice>) -> Vec<DiscoveredDevice> {
      let mut found = Vec::new();
      while let Ok(notice) = notices.try_recv() {
         if let ScanNotice::DeviceDiscovered(device) = notice {
            found.push(device);
         }
      }
      found
   }

   #[tokio::test(start_paused = true)]
   async fn test_discovery_notified_once_per_address() {
      let radio = Arc::new(FakeRadio::new());
      radio.push_sighting(sighting("AA:BB", Some("reader"), -60));
      let mut h = start(radio);

      time::sleep(Duration::from_millis(200)).await;
      let found = discovered(&mut h.notices);
      assert_eq!(found.len(), 1);
      assert_eq!(found[0].address, "AA:BB");

      // Seen again in the next window
      time::sleep(Duration::from_secs(10)).await;
      h.radio.push_sighting(sighting("AA:BB", None, -55));
      time::sleep(Duration::from_millis(200)).await;

      assert!(discovered(&mut h.notices).is_empty());
      assert_eq!(h.registry.lock().get("AA:BB").unwrap().sighting_count, 2);
      h.cancel.cancel();
   }

   #[tokio::test(start_paused = true)]
   async fn test_silent_device_evicted_after_two_windows() {
      let radio = Arc::new(FakeRadio::new());
      radio.push_sighting(sighting("AA:BB", None, -60));
      let h = start(radio);

      // Silent for part of a window only: still present
      time::sleep(Duration::from_secs(15)).await;
      assert!(h.registry.lock().get("AA:BB").is_some());

      time::sleep(Duration::from_secs(6)).await;
      assert!(h.registry.lock().get("AA:BB").is_none());
      h.cancel.cancel();
   }

   #[tokio::test(start_paused = true)]
   async fn test_advertising_device_survives() {
      let radio = Arc::new(FakeRadio::new());
      let h = start(radio.clone());

      for _ in 0..8 {
         radio.push_sighting(sighting("AA:BB", None, -60));
         time::sleep(Duration::from_secs(5)).await;
      }
      let device = h.registry.lock().get("AA:BB").cloned().unwrap();
      assert_eq!(device.sighting_count, 8);
      h.cancel.cancel();
   }

   #[tokio::test(start_paused = true)]
   async fn test_window_bounces_radio_scan() {
      let radio = Arc::new(FakeRadio::new());
      let h = start(radio.clone());

      time::sleep(Duration::from_millis(10_100)).await;
      assert_eq!(
         radio.ops(),
         vec![RadioOp::StartScan, RadioOp::StopScan, RadioOp::StartScan]
      );
      assert!(radio.is_scanning());
      h.cancel.cancel();
   }

   #[tokio::test(start_paused = true)]
   async fn test_queued_sightings_scored_in_their_window() {
      let radio = Arc::new(FakeRadio::new());
      // More sightings than ticks in one window
      for _ in 0..300 {
         radio.push_sighting(sighting("AA:BB", None, -60));
      }
      let h = start(radio.clone());

      time::sleep(Duration::from_millis(10_010)).await;
      assert_eq!(h.registry.lock().get("AA:BB").unwrap().sighting_count, 300);
      assert!(radio.poll_next_sighting().is_none());
      h.cancel.cancel();
   }

   #[tokio::test(start_paused = true)]
   async fn test_backlog_scored_before_reconcile() {
      let radio = Arc::new(FakeRadio::new());
      radio.push_sighting(sighting("AA:BB", None, -60));
      let h = start(radio.clone());

      // AA:BB is in the shadow after the first window
      time::sleep(Duration::from_millis(10_010)).await;
      assert!(h.registry.lock().get("AA:BB").is_some());

      // Far more sightings than ticks, with AA:BB at the back
      for i in 0..1300 {
         radio.push_sighting(sighting(&format!("X{}", i % 5), None, -70));
      }
      radio.push_sighting(sighting("AA:BB", None, -60));
      time::sleep(Duration::from_secs(10)).await;

      let device = h.registry.lock().get("AA:BB").cloned();
      assert_eq!(device.map(|d| d.sighting_count), Some(2));
      assert!(radio.poll_next_sighting().is_none());
      h.cancel.cancel();
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_at_window_boundary_stops_scan() {
      let radio = Arc::new(FakeRadio::new());
      let h = start(radio.clone());

      time::sleep(Duration::from_secs(10)).await;
      h.cancel.cancel();
      let (result, state) = h.handle.await.unwrap();

      assert!(result.is_ok());
      assert_eq!(state, ScanState::Stopped);
      assert_eq!(radio.ops().last(), Some(&RadioOp::StopScan));
      assert!(!radio.is_scanning());
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_stops_radio_scan() {
      let radio = Arc::new(FakeRadio::new());
      let h = start(radio.clone());

      time::sleep(Duration::from_secs(3)).await;
      h.cancel.cancel();
      let (result, state) = time::timeout(Duration::from_millis(50), h.handle)
         .await
         .expect("cancel observed within one tick")
         .unwrap();

      assert!(result.is_ok());
      assert_eq!(state, ScanState::Stopped);
      assert!(!radio.is_scanning());
      assert_eq!(radio.ops().last(), Some(&RadioOp::StopScan));
   }

   #[tokio::test(start_paused = true)]
   async fn test_refused_start_fails_session() {
      let radio = Arc::new(FakeRadio::new());
      radio.refuse_scans(true);
      let h = start(radio.clone());

      let (result, state) = h.handle.await.unwrap();
      assert!(matches!(result, Err(ReaderLinkError::ScanStartFailed(_))));
      assert_eq!(state, ScanState::Stopped);
      assert_eq!(radio.count(&RadioOp::StopScan), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_refused_restart_stops_session() {
      let radio = Arc::new(FakeRadio::new());
      let h = start(radio.clone());

      time::sleep(Duration::from_secs(5)).await;
      radio.refuse_scans(true);
      let (result, state) = h.handle.await.unwrap();

      assert!(matches!(result, Err(ReaderLinkError::ScanStartFailed(_))));
      assert_eq!(state, ScanState::Stopped);
      assert!(!radio.is_scanning());
   }

   #[tokio::test(start_paused = true)]
   async fn test_session_runs_only_once() {
      let radio = Arc::new(FakeRadio::new());
      let (tx, _rx) = mpsc::channel(8);
      let mut session =
         ScanSession::new(radio.clone(), DeviceRegistry::shared(), tx, &Timing::default());
      let cancel = CancellationToken::new();
      cancel.cancel();

      assert!(session.run(&cancel).await.is_ok());
      assert!(session.run(&cancel).await.is_err());
      assert_eq!(radio.count(&RadioOp::StartScan), 1);
   }
}
