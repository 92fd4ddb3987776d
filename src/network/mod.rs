//! Link to the controller stick
//!
//! This module opens the byte stream to the stick and runs the two workers
//! that share it: the send worker, which keeps exactly one transaction in
//! flight, and the receive worker, which acknowledges frames and hands
//! decoded messages to the controller.

mod connection;
mod transport;

pub use self::connection::{Link, LinkEvents, LinkStats, StatsSnapshot, TransactionGate, Workers};
pub use self::transport::{transport_for, DuplexTransport, SerialTransport, TcpTransport};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::Result;

/// Read half of an open link
pub type LinkReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of an open link
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Provides the byte stream to the stick
pub trait Transport: Send + Sync {
    /// Opens the link, returning its two halves
    fn open(&self) -> BoxFuture<'_, Result<(LinkReader, LinkWriter)>>;

    /// Releases whatever `open` acquired
    fn close(&self) {}

    /// Human readable address for logs
    fn describe(&self) -> String;
}
