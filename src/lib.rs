//! meshcoord: coordinator for a low-power mesh network of home-automation nodes
//!
//! The crate drives a controller stick over a serial port or a TCP bridge.
//! It frames and acknowledges messages on the link, keeps a single
//! transaction in flight, discovers every node in the network and walks each
//! one through its initialization stages until its classes and values are
//! known.
pub mod commandclass;
pub mod controller;
pub mod core;
pub mod dispatch;
pub mod network;
pub mod node;
pub mod protocol;
pub mod store;
pub mod util;

// Re-export commonly used items
pub use crate::controller::{ChannelListener, Controller, ControllerBuilder, Event, EventListener, NodeStatus};
pub use crate::core::{ControllerConfig, Error, NodeId, Result};
pub use crate::node::{Node, NodeStage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
