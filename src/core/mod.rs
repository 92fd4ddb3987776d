//! Core types for the mesh coordinator
//!
//! This module contains the error taxonomy, identifiers and configuration
//! shared by every other module.

use std::ops::RangeInclusive;
use std::time::Duration;

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{ControllerConfig, NodeId};

/// Default serial baud rate of controller sticks
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default TCP port of serial-over-network bridges
pub const DEFAULT_BRIDGE_PORT: u16 = 2540;

/// Default wait for a transaction to complete
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Accepted range for the configured response timeout
pub const RESPONSE_TIMEOUT_RANGE: RangeInclusive<Duration> =
    Duration::from_millis(1500)..=Duration::from_millis(10_000);

/// Retry budget of a freshly created message
pub const MAX_ATTEMPTS: u8 = 3;

/// Consecutive send failures after which a node is considered dead
pub const DEAD_NODE_THRESHOLD: u32 = 3;
