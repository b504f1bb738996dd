//! Transport boundary
//!
//! The pipeline never talks to bus hardware directly. A [`Connector`] opens a
//! [`Transport`] from a [`BusConfig`]; the bus controller then receives from it
//! on one worker thread and sends to it from any number of callers.
//!
//! Drivers must tolerate one concurrent receiver alongside one sender; the bus
//! controller serializes senders among themselves.

use crate::config::BusConfig;
use crate::types::{Frame, Result};
use std::time::Duration;

pub mod virtual_bus;

pub use virtual_bus::{VirtualBus, VirtualTransport};

/// An open bus handle
pub trait Transport: Send + Sync {
    /// Wait up to `timeout` for the next frame; `Ok(None)` on timeout
    fn receive(&self, timeout: Duration) -> Result<Option<Frame>>;

    /// Transmit one frame
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Release the bus; further calls fail
    fn shutdown(&self);
}

/// Factory for transports
pub trait Connector: Send + Sync {
    /// Open a transport or fail with a transport/configuration error
    fn open(&self, config: &BusConfig) -> Result<Box<dyn Transport>>;
}
