//! Scripted radio used by the discovery tests.
//!
//! Every operation is recorded, and any overlap between an active scan
//! and an outstanding link is counted as a violation. Like a real radio,
//! sightings still queued when a scan stops are gone once scanning resumes.

use async_trait::async_trait;
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   bluetooth::{RadioPort, RawSighting, SightingFeed},
   error::{ReaderLinkError, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
   StartScan,
   StopScan,
   Connect(SmolStr),
   Disconnect(bool),
}

#[derive(Default)]
struct FakeState {
   scanning: bool,
   link_active: bool,
   connected: bool,
   connect_after: Option<u32>,
   polls_since_connect: u32,
   refuse_start: bool,
   fail_disconnect: bool,
   scan_stopped: bool,
   ops: Vec<RadioOp>,
   violations: u32,
}

#[derive(Default)]
pub struct FakeRadio {
   state: Mutex<FakeState>,
   sightings: SightingFeed,
}

pub fn sighting(address: &str, name: Option<&str>, rssi: i16) -> RawSighting {
   RawSighting {
      address: address.into(),
      name: name.map(SmolStr::from),
      rssi,
      service_signature: None,
      raw_advertisement: vec![],
   }
}

impl FakeRadio {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn push_sighting(&self, sighting: RawSighting) {
      self.sightings.push(sighting);
   }

   /// Makes the link report connected on the `n`th poll after `connect`.
   pub fn connect_on_poll(&self, n: u32) {
      self.state.lock().connect_after = Some(n);
   }

   pub fn refuse_scans(&self, refuse: bool) {
      self.state.lock().refuse_start = refuse;
   }

   pub fn fail_disconnects(&self, fail: bool) {
      self.state.lock().fail_disconnect = fail;
   }

   pub fn drop_link(&self) {
      let mut state = self.state.lock();
      state.connected = false;
      state.link_active = false;
   }

   pub fn ops(&self) -> Vec<RadioOp> {
      self.state.lock().ops.clone()
   }

   pub fn count(&self, op: &RadioOp) -> usize {
      self.state.lock().ops.iter().filter(|o| *o == op).count()
   }

   pub fn disconnects(&self) -> usize {
      self
         .state
         .lock()
         .ops
         .iter()
         .filter(|o| matches!(o, RadioOp::Disconnect(_)))
         .count()
   }

   pub fn is_scanning(&self) -> bool {
      self.state.lock().scanning
   }

   pub fn polls(&self) -> u32 {
      self.state.lock().polls_since_connect
   }

   pub fn violations(&self) -> u32 {
      self.state.lock().violations
   }
}

#[async_trait]
impl RadioPort for FakeRadio {
   async fn start_scan(&self) -> Result<()> {
      let mut state = self.state.lock();
      state.ops.push(RadioOp::StartScan);
      if state.refuse_start {
         return Err(ReaderLinkError::ScanStartFailed("refused".into()));
      }
      if state.link_active {
         state.violations += 1;
      }
      if state.scan_stopped {
         self.sightings.discard();
         state.scan_stopped = false;
      }
      state.scanning = true;
      Ok(())
   }

   async fn stop_scan(&self) -> Result<()> {
      let mut state = self.state.lock();
      state.ops.push(RadioOp::StopScan);
      state.scan_stopped |= state.scanning;
      state.scanning = false;
      Ok(())
   }

   fn poll_next_sighting(&self) -> Option<RawSighting> {
      self.sightings.pop()
   }

   async fn connect(&self, address: &str) -> Result<()> {
      let mut state = self.state.lock();
      state.ops.push(RadioOp::Connect(address.into()));
      if state.scanning {
         state.violations += 1;
      }
      state.link_active = true;
      state.polls_since_connect = 0;
      Ok(())
   }

   async fn disconnect(&self, force: bool) -> Result<()> {
      let mut state = self.state.lock();
      state.ops.push(RadioOp::Disconnect(force));
      state.link_active = false;
      state.connected = false;
      if state.fail_disconnect {
         return Err(ReaderLinkError::DeviceNotConnected);
      }
      Ok(())
   }

   async fn is_connected(&self) -> bool {
      let mut state = self.state.lock();
      if state.link_active && !state.connected {
         state.polls_since_connect += 1;
         if state
            .connect_after
            .is_some_and(|n| state.polls_since_connect >= n)
         {
            state.connected = true;
         }
      }
      state.connected
   }
}
