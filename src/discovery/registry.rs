//! Table of currently known readers.
//!
//! The registry deduplicates sightings by address and evicts devices that
//! stop advertising. Eviction compares the live sighting counters against a
//! shadow snapshot taken at the end of the previous aging window: a device
//! must go one full window without a single new sighting before it is
//! removed, and a device new to the shadow always survives its first window.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde_json::json;
use smol_str::SmolStr;

use crate::bluetooth::{
   RawSighting,
   recognition::{self, ReaderKind},
};

/// One physical reader as currently known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
   pub address: SmolStr,
   pub name: Option<SmolStr>,
   pub rssi: i16,
   pub sighting_count: u64,
   pub connected: bool,
   pub service_signature: Option<SmolStr>,
   pub raw_advertisement: Vec<u8>,
}

impl DiscoveredDevice {
   fn from_sighting(sighting: RawSighting) -> Self {
      Self {
         address: sighting.address,
         name: sighting.name,
         rssi: sighting.rssi,
         sighting_count: 1,
         connected: false,
         service_signature: sighting.service_signature,
         raw_advertisement: sighting.raw_advertisement,
      }
   }

   fn absorb(&mut self, sighting: RawSighting) {
      self.sighting_count += 1;
      self.rssi = sighting.rssi;
      if sighting.name.is_some() {
         self.name = sighting.name;
      }
      // Captured at first sighting, only filled in if it was missing
      if self.service_signature.is_none() {
         self.service_signature = sighting.service_signature;
      }
      if !sighting.raw_advertisement.is_empty() {
         self.raw_advertisement = sighting.raw_advertisement;
      }
   }

   pub fn reader_kind(&self) -> ReaderKind {
      recognition::classify(self.service_signature.as_deref())
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.as_str(),
         "name": self.name.as_deref(),
         "rssi": self.rssi,
         "sighting_count": self.sighting_count,
         "connected": self.connected,
         "service_signature": self.service_signature.as_deref(),
         "reader_kind": self.reader_kind().as_ref(),
         "raw_advertisement": hex::encode(&self.raw_advertisement),
      })
   }
}

/// Result of feeding one sighting to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
   /// First sighting of this address.
   Inserted,
   Updated,
   /// Malformed sighting, dropped.
   Rejected,
}

/// Shadow snapshot of sighting counters from the previous aging window.
#[derive(Debug, Default, Clone)]
pub struct ScanSweep {
   shadow: HashMap<SmolStr, u64>,
}

impl ScanSweep {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn len(&self) -> usize {
      self.shadow.len()
   }

   #[cfg(test)]
   pub fn recorded(&self, address: &str) -> Option<u64> {
      self.shadow.get(address).copied()
   }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
   devices: HashMap<SmolStr, DiscoveredDevice>,
}

/// Registry shared between the scan session, connection attempts and the
/// supervisor. The mutex is the single-writer discipline.
pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

impl DeviceRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn shared() -> SharedRegistry {
      Arc::new(Mutex::new(Self::new()))
   }

   pub fn upsert(&mut self, sighting: RawSighting) -> UpsertOutcome {
      if sighting.address.trim().is_empty() {
         return UpsertOutcome::Rejected;
      }

      match self.devices.get_mut(&sighting.address) {
         Some(device) => {
            device.absorb(sighting);
            UpsertOutcome::Updated
         },
         None => {
            let device = DiscoveredDevice::from_sighting(sighting);
            self.devices.insert(device.address.clone(), device);
            UpsertOutcome::Inserted
         },
      }
   }

   /// Scores the aging window that just ended and returns evicted addresses.
   pub fn reconcile(&mut self, sweep: &mut ScanSweep) -> Vec<SmolStr> {
      let mut evicted = Vec::new();

      for (address, device) in &self.devices {
         match sweep.shadow.get_mut(address) {
            // A linked device may legitimately stop advertising
            Some(recorded) if device.connected => *recorded = device.sighting_count,
            Some(recorded) if device.sighting_count <= *recorded => evicted.push(address.clone()),
            Some(recorded) => *recorded = device.sighting_count,
            None => {
               sweep.shadow.insert(address.clone(), device.sighting_count);
            },
         }
      }

      for address in &evicted {
         self.devices.remove(address);
      }
      sweep.shadow.retain(|address, _| self.devices.contains_key(address));

      evicted
   }

   /// Returns false if the address is unknown.
   pub fn mark_connected(&mut self, address: &str, connected: bool) -> bool {
      match self.devices.get_mut(address) {
         Some(device) => {
            device.connected = connected;
            true
         },
         None => false,
      }
   }

   pub fn clear_all(&mut self) {
      self.devices.clear();
   }

   pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
      self.devices.get(address)
   }

   pub fn connected_address(&self) -> Option<SmolStr> {
      self
         .devices
         .values()
         .find(|d| d.connected)
         .map(|d| d.address.clone())
   }

   /// Copies the table, strongest signal first.
   pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
      let mut devices: Vec<_> = self.devices.values().cloned().collect();
      devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.address.cmp(&b.address)));
      devices
   }

   pub fn len(&self) -> usize {
      self.devices.len()
   }

   pub fn is_empty(&self) -> bool {
      self.devices.is_empty()
   }
}
