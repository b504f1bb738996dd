//! In-process virtual bus
//!
//! Loopback bus for running the pipeline without hardware. Every endpoint
//! opened on the same channel name sees the frames sent by all other endpoints
//! on that channel, never its own.

use super::{Connector, Transport};
use crate::config::BusConfig;
use crate::types::{Frame, PipelineError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Interface name accepted by [`VirtualBus`]
pub const VIRTUAL_INTERFACE: &str = "virtual";

/// Frames buffered per endpoint before the oldest are dropped
const ENDPOINT_QUEUE_LIMIT: usize = 10_000;

/// Classic CAN payload limit
const CLASSIC_PAYLOAD_LEN: usize = 8;

struct Endpoint {
    id: u64,
    queue: Mutex<VecDeque<Frame>>,
    available: Condvar,
    closed: AtomicBool,
}

impl Endpoint {
    fn push(&self, frame: Frame) {
        let mut queue = self.queue.lock();
        if queue.len() >= ENDPOINT_QUEUE_LIMIT {
            queue.pop_front();
            log::warn!("Virtual endpoint {} overflowed, dropping oldest frame", self.id);
        }
        queue.push_back(frame);
        self.available.notify_one();
    }
}

/// A set of named virtual channels
#[derive(Clone, Default)]
pub struct VirtualBus {
    channels: Arc<Mutex<HashMap<String, Vec<Weak<Endpoint>>>>>,
    next_id: Arc<AtomicU64>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an endpoint on the configured channel
    pub fn connect(&self, config: &BusConfig) -> Result<VirtualTransport> {
        config.validate()?;
        if config.interface != VIRTUAL_INTERFACE {
            return Err(PipelineError::ConfigurationError(format!(
                "unsupported interface '{}' (expected '{}')",
                config.interface, VIRTUAL_INTERFACE
            )));
        }

        let endpoint = Arc::new(Endpoint {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let mut channels = self.channels.lock();
        let members = channels.entry(config.channel.clone()).or_default();
        members.retain(|m| m.strong_count() > 0);
        members.push(Arc::downgrade(&endpoint));

        log::info!(
            "Virtual endpoint {} joined channel '{}' ({} members)",
            endpoint.id,
            config.channel,
            members.len()
        );

        Ok(VirtualTransport {
            bus: self.clone(),
            channel: config.channel.clone(),
            fd: config.fd,
            endpoint,
        })
    }

    /// Number of open endpoints on a channel
    pub fn member_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .filter_map(Weak::upgrade)
                    .filter(|m| !m.closed.load(Ordering::Acquire))
                    .count()
            })
            .unwrap_or(0)
    }

    fn broadcast(&self, channel: &str, sender: u64, frame: &Frame) {
        let peers: Vec<Arc<Endpoint>> = self
            .channels
            .lock()
            .get(channel)
            .map(|members| members.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default();

        for peer in peers {
            if peer.id != sender && !peer.closed.load(Ordering::Acquire) {
                peer.push(frame.clone());
            }
        }
    }

    fn leave(&self, channel: &str, endpoint: u64) {
        let mut channels = self.channels.lock();
        if let Some(members) = channels.get_mut(channel) {
            members.retain(|m| m.upgrade().is_some_and(|m| m.id != endpoint));
            if members.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

impl Connector for VirtualBus {
    fn open(&self, config: &BusConfig) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.connect(config)?))
    }
}

/// One endpoint on a virtual channel
pub struct VirtualTransport {
    bus: VirtualBus,
    channel: String,
    fd: bool,
    endpoint: Arc<Endpoint>,
}

impl VirtualTransport {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn ensure_open(&self) -> Result<()> {
        if self.endpoint.closed.load(Ordering::Acquire) {
            return Err(PipelineError::TransportError(format!(
                "virtual endpoint on '{}' is shut down",
                self.channel
            )));
        }
        Ok(())
    }
}

impl Transport for VirtualTransport {
    fn receive(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.ensure_open()?;

        let deadline = Instant::now() + timeout;
        let mut queue = self.endpoint.queue.lock();
        loop {
            if let Some(frame) = queue.pop_front() {
                return Ok(Some(frame));
            }
            if self.endpoint.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            if self
                .endpoint
                .available
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return Ok(queue.pop_front());
            }
        }
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        self.ensure_open()?;
        if !self.fd && frame.dlc() > CLASSIC_PAYLOAD_LEN {
            return Err(PipelineError::TransmitError(format!(
                "{} byte payload requires CAN-FD",
                frame.dlc()
            )));
        }
        self.bus.broadcast(&self.channel, self.endpoint.id, frame);
        Ok(())
    }

    fn shutdown(&self) {
        if !self.endpoint.closed.swap(true, Ordering::AcqRel) {
            self.bus.leave(&self.channel, self.endpoint.id);
            // Wake a receiver blocked on this endpoint
            let _queue = self.endpoint.queue.lock();
            self.endpoint.available.notify_all();
            log::info!("Virtual endpoint {} left channel '{}'", self.endpoint.id, self.channel);
        }
    }
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
