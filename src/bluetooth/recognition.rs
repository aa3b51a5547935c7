//! Reader recognition logic.
//!
//! This module derives the service signature of an advertising device,
//! classifies the kind of reader behind it, and decides whether a device
//! is compatible at all before its sightings are handed to the core.

use std::collections::HashMap;

use smol_str::{SmolStr, format_smolstr};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Nordic UART service, used by serial-over-BLE RFID sleds
const SERIAL_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// HID over GATT, used by readers running in keyboard-wedge mode
const HID_SERVICE: Uuid = Uuid::from_u128(0x00001812_0000_1000_8000_00805f9b34fb);

/// Prefix of signatures built from manufacturer data
const MANUFACTURER_PREFIX: &str = "mfg:";

/// Coarse classification of a reader from its service signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ReaderKind {
   Serial,
   Hid,
   Unknown,
}

/// Builds the service signature of a device.
///
/// A known reader service wins, then the lowest advertised service UUID,
/// then the lowest manufacturer company id.
pub fn service_signature(
   uuids: &[Uuid],
   manufacturer_data: &HashMap<u16, Vec<u8>>,
) -> Option<SmolStr> {
   if let Some(known) = uuids
      .iter()
      .find(|u| **u == SERIAL_SERVICE || **u == HID_SERVICE)
   {
      return Some(format_smolstr!("{known}"));
   }
   if let Some(first) = uuids.iter().min() {
      return Some(format_smolstr!("{first}"));
   }
   manufacturer_data
      .keys()
      .min()
      .map(|cid| format_smolstr!("{MANUFACTURER_PREFIX}{cid:04x}"))
}

/// Classifies a reader from its service signature.
pub fn classify(signature: Option<&str>) -> ReaderKind {
   match signature.and_then(|s| Uuid::parse_str(s).ok()) {
      Some(uuid) if uuid == SERIAL_SERVICE => ReaderKind::Serial,
      Some(uuid) if uuid == HID_SERVICE => ReaderKind::Hid,
      _ => ReaderKind::Unknown,
   }
}

/// Checks the device name against the configured patterns (case-insensitive).
///
/// An empty pattern list accepts every device.
pub fn is_compatible(name: Option<&str>, patterns: &[SmolStr]) -> bool {
   if patterns.is_empty() {
      return true;
   }
   let Some(name) = name else {
      return false;
   };
   let name = name.to_ascii_lowercase();
   patterns
      .iter()
      .any(|p| name.contains(p.to_ascii_lowercase().as_str()))
}

/// Flattens manufacturer data into `[cid_lo, cid_hi, payload...]` records,
/// ordered by company id.
pub fn flatten_manufacturer_data(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Vec<u8> {
   let mut cids: Vec<_> = manufacturer_data.keys().copied().collect();
   cids.sort_unstable();

   let mut raw = Vec::new();
   for cid in cids {
      raw.extend_from_slice(&cid.to_le_bytes());
      raw.extend_from_slice(&manufacturer_data[&cid]);
   }
   raw
}
