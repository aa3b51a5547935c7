//! Single bounded connection attempt.
//!
//! The attempt issues one connect command, then polls the link on a fixed
//! period until it is confirmed, the poll budget runs out, or the attempt is
//! cancelled. Any outcome other than success leaves the radio disconnected.

use std::time::Duration;

use log::{debug, info, warn};
use smol_str::SmolStr;
use strum::{AsRefStr, Display};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::RadioHandle,
   config::Timing,
   discovery::registry::SharedRegistry,
   error::{ReaderLinkError, Result},
};

/// Terminal result of a connection attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectResult {
   Success,
   TimedOut,
   Cancelled,
}

impl ConnectResult {
   pub fn into_result(self, address: &SmolStr) -> Result<()> {
      match self {
         Self::Success => Ok(()),
         Self::TimedOut => Err(ReaderLinkError::ConnectTimedOut(address.clone())),
         Self::Cancelled => Err(ReaderLinkError::ConnectCancelled(address.clone())),
      }
   }
}

pub struct ConnectionAttempt {
   radio: RadioHandle,
   registry: SharedRegistry,
   target: SmolStr,
   poll_interval: Duration,
   budget: u32,
}

impl ConnectionAttempt {
   pub fn new(
      radio: RadioHandle,
      registry: SharedRegistry,
      target: SmolStr,
      timing: &Timing,
   ) -> Self {
      Self {
         radio,
         registry,
         target,
         poll_interval: timing.connect_poll,
         budget: timing.connect_budget,
      }
   }

   pub fn target(&self) -> &SmolStr {
      &self.target
   }

   pub async fn run(self, cancel: &CancellationToken) -> ConnectResult {
      if cancel.is_cancelled() {
         return self.abandon(ConnectResult::Cancelled).await;
      }

      info!("Connecting to {}", self.target);
      if let Err(e) = self.radio.connect(&self.target).await {
         // The radio may still bring the link up; the budget decides
         warn!("Connect command for {} rejected: {e}", self.target);
      }

      for poll in 1..=self.budget {
         select! {
            biased;
            () = cancel.cancelled() => {
               // A link confirmed by the radio is never abandoned
               if self.radio.is_connected().await {
                  return self.succeed(poll);
               }
               return self.abandon(ConnectResult::Cancelled).await;
            }
            () = time::sleep(self.poll_interval) => {}
         }

         if self.radio.is_connected().await {
            return self.succeed(poll);
         }
         debug!("{} not connected yet ({poll}/{})", self.target, self.budget);
      }

      self.abandon(ConnectResult::TimedOut).await
   }

   fn succeed(&self, poll: u32) -> ConnectResult {
      info!("Connected to {} after {poll} poll(s)", self.target);
      if !self.registry.lock().mark_connected(&self.target, true) {
         warn!("Connected device {} is no longer in the registry", self.target);
      }
      ConnectResult::Success
   }

   async fn abandon(&self, result: ConnectResult) -> ConnectResult {
      if let Err(e) = self.radio.disconnect(true).await {
         warn!("Cleanup disconnect of {} failed: {e}", self.target);
      }
      info!("Connection attempt to {} ended: {result}", self.target);
      result
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;
   use crate::{
      bluetooth::fake::{FakeRadio, RadioOp, sighting},
      discovery::registry::DeviceRegistry,
   };

   fn registry_with(address: &str) -> SharedRegistry {
      let registry = DeviceRegistry::shared();
      registry.lock().upsert(sighting(address, None, -60));
      registry
   }

   fn attempt(radio: &Arc<FakeRadio>, registry: &SharedRegistry) -> ConnectionAttempt {
      ConnectionAttempt::new(
         radio.clone(),
         registry.clone(),
         "AA:BB".into(),
         &Timing::default(),
      )
   }

   #[tokio::test(start_paused = true)]
   async fn test_success_on_third_poll() {
      let radio = Arc::new(FakeRadio::new());
      radio.connect_on_poll(3);
      let registry = registry_with("AA:BB");

      let start = time::Instant::now();
      let result = attempt(&radio, &registry).run(&CancellationToken::new()).await;

      assert_eq!(result, ConnectResult::Success);
      assert!(start.elapsed() >= Duration::from_millis(1500));
      assert!(start.elapsed() < Duration::from_millis(2000));
      assert_eq!(radio.polls(), 3);
      assert_eq!(radio.disconnects(), 0);
      assert!(registry.lock().get("AA:BB").unwrap().connected);
   }

   #[tokio::test(start_paused = true)]
   async fn test_times_out_after_exact_budget() {
      let radio = Arc::new(FakeRadio::new());
      let registry = registry_with("AA:BB");

      let start = time::Instant::now();
      let result = attempt(&radio, &registry).run(&CancellationToken::new()).await;

      assert_eq!(result, ConnectResult::TimedOut);
      // Never earlier than the full budget, never a poll later
      assert!(start.elapsed() >= Duration::from_secs(15));
      assert!(start.elapsed() < Duration::from_millis(15_500));
      assert_eq!(radio.polls(), 30);
      assert_eq!(radio.disconnects(), 1);
      assert_eq!(radio.ops().last(), Some(&RadioOp::Disconnect(true)));
      assert!(!registry.lock().get("AA:BB").unwrap().connected);
      assert!(matches!(
         result.into_result(&"AA:BB".into()),
         Err(ReaderLinkError::ConnectTimedOut(_))
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_disconnects() {
      let radio = Arc::new(FakeRadio::new());
      let registry = registry_with("AA:BB");
      let cancel = CancellationToken::new();

      let task = tokio::spawn({
         let attempt = attempt(&radio, &registry);
         let cancel = cancel.clone();
         async move { attempt.run(&cancel).await }
      });
      time::sleep(Duration::from_millis(1200)).await;
      cancel.cancel();

      assert_eq!(task.await.unwrap(), ConnectResult::Cancelled);
      assert_eq!(radio.disconnects(), 1);
      assert!(!registry.lock().get("AA:BB").unwrap().connected);
   }

   #[tokio::test(start_paused = true)]
   async fn test_success_wins_over_simultaneous_cancel() {
      let radio = Arc::new(FakeRadio::new());
      let registry = registry_with("AA:BB");
      let cancel = CancellationToken::new();

      let task = tokio::spawn({
         let attempt = attempt(&radio, &registry);
         let cancel = cancel.clone();
         async move { attempt.run(&cancel).await }
      });
      time::sleep(Duration::from_millis(700)).await;

      // The radio confirms the link and the cancel lands before the next poll
      radio.connect_on_poll(1);
      cancel.cancel();

      assert_eq!(task.await.unwrap(), ConnectResult::Success);
      assert_eq!(radio.disconnects(), 0);
      assert!(registry.lock().get("AA:BB").unwrap().connected);
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancelled_before_start_never_connects() {
      let radio = Arc::new(FakeRadio::new());
      let registry = registry_with("AA:BB");
      let cancel = CancellationToken::new();
      cancel.cancel();

      let result = attempt(&radio, &registry).run(&cancel).await;
      assert_eq!(result, ConnectResult::Cancelled);
      assert_eq!(radio.ops(), vec![RadioOp::Disconnect(true)]);
   }
}
