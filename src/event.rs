//! Event handling system for discovery and connection updates.
//!
//! This module provides the event infrastructure for notifying the
//! presentation layer about discovered readers, connection results, and
//! changes of the visible device list.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::discovery::{
   connect::ConnectResult, registry::DiscoveredDevice, supervisor::ConnectionState,
};

/// Events that can be emitted by the discovery core.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
   /// Fired once per newly known address.
   DeviceDiscovered(DiscoveredDevice),
   /// Fired once per connection attempt.
   ConnectionResolved(SmolStr, ConnectResult),
   /// The visible device set changed (new, evicted, updated or cleared).
   RegistryChanged,
   StateChanged(ConnectionState),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: ReaderEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
