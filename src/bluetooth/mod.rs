//! Radio layer for reader discovery.
//!
//! This module defines the `RadioPort` boundary the discovery core drives,
//! along with the BlueZ implementation and reader recognition.

use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use smol_str::SmolStr;

use crate::error::Result;

pub mod bluez;
#[cfg(test)]
pub mod fake;
pub mod recognition;

/// One advertisement as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSighting {
   pub address: SmolStr,
   pub name: Option<SmolStr>,
   pub rssi: i16,
   pub service_signature: Option<SmolStr>,
   pub raw_advertisement: Vec<u8>,
}

/// Lock-free queue of sightings between the radio feed and the scan loop.
#[derive(Debug, Default)]
pub struct SightingFeed {
   queue: SegQueue<RawSighting>,
}

impl SightingFeed {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn push(&self, sighting: RawSighting) {
      self.queue.push(sighting);
   }

   pub fn pop(&self) -> Option<RawSighting> {
      self.queue.pop()
   }

   /// Drops every queued sighting, returning how many were discarded.
   pub fn discard(&self) -> usize {
      let mut dropped = 0;
      while self.queue.pop().is_some() {
         dropped += 1;
      }
      dropped
   }
}

/// The single shared radio handle.
///
/// Implementations perform no coordination of their own; the supervisor
/// guarantees that scanning and connecting never overlap.
#[async_trait]
pub trait RadioPort: Send + Sync {
   /// Starts scanning. Sightings left over from an earlier, stopped scan
   /// are discarded and never reported.
   async fn start_scan(&self) -> Result<()>;

   async fn stop_scan(&self) -> Result<()>;

   /// Pops the next pending sighting. Never blocks.
   fn poll_next_sighting(&self) -> Option<RawSighting>;

   /// Begins connecting to `address`. Completion is observed through
   /// [`RadioPort::is_connected`].
   async fn connect(&self, address: &str) -> Result<()>;

   async fn disconnect(&self, force: bool) -> Result<()>;

   async fn is_connected(&self) -> bool;
}

/// Type alias for a shareable radio handle.
pub type RadioHandle = Arc<dyn RadioPort>;
