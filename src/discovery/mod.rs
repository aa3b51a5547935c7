//! Reader discovery and connection supervision.
//!
//! This module contains the device registry, the scan session, the
//! connection attempt, and the supervisor that coordinates them.

pub mod connect;
pub mod registry;
pub mod scan;
pub mod supervisor;
