//! Bus controller
//!
//! Owns the transport lifecycle and the background receive loop. The worker
//! polls the transport with a short timeout so that `close()` can stop it
//! within one timeout interval; every received frame is stamped with its
//! capture time and handed to the sink in receive order.

use crate::config::{BusConfig, PipelineConfig};
use crate::sink::SharedSink;
use crate::transport::{Connector, Transport};
use crate::types::{now_seconds, Frame, PipelineError, Result};
use crate::worker::Worker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outbound frame path used by transmit jobs
pub trait FrameSender: Send + Sync {
    /// Transmit one frame
    fn send(&self, id: u32, payload: &[u8], extended: bool) -> Result<()>;
}

/// An open transport with its receive worker
struct Connection {
    transport: Arc<dyn Transport>,
    worker: Worker,
    config: BusConfig,
}

/// Counters for the current controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub receive_errors: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    receive_errors: AtomicU64,
}

/// Lifecycle owner of one transport
pub struct BusController {
    connector: Arc<dyn Connector>,
    sink: SharedSink,
    receive_timeout: Duration,
    stop_timeout: Duration,
    /// The lock doubles as the sender critical section
    connection: Mutex<Option<Connection>>,
    counters: Arc<Counters>,
}

impl BusController {
    /// Create a controller that delivers received frames to `sink`
    pub fn new(connector: Arc<dyn Connector>, sink: SharedSink, config: &PipelineConfig) -> Self {
        Self {
            connector,
            sink,
            receive_timeout: config.receive_timeout(),
            stop_timeout: config.stop_timeout(),
            connection: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Open the transport and start the receive worker
    ///
    /// Setup failures are returned to the caller and never retried.
    pub fn open(&self, config: &BusConfig) -> Result<()> {
        let mut connection = self.connection.lock();
        if let Some(existing) = connection.as_ref() {
            return Err(PipelineError::ConfigurationError(format!(
                "bus already open on channel '{}'",
                existing.config.channel
            )));
        }

        config.validate()?;
        log::info!(
            "Opening CAN bus: interface={} channel={} bitrate={} fd={}",
            config.interface,
            config.channel,
            config.bitrate,
            config.fd
        );

        let transport: Arc<dyn Transport> = match self.connector.open(config) {
            Ok(transport) => Arc::from(transport),
            Err(e @ PipelineError::ConfigurationError(_)) => return Err(e),
            Err(e @ PipelineError::TransportError(_)) => return Err(e),
            Err(e) => return Err(PipelineError::TransportError(e.to_string())),
        };

        let worker = match self.spawn_receiver(Arc::clone(&transport)) {
            Ok(worker) => worker,
            Err(e) => {
                transport.shutdown();
                return Err(e.into());
            }
        };

        *connection = Some(Connection {
            transport,
            worker,
            config: config.clone(),
        });
        log::info!("CAN bus connected on '{}'", config.channel);
        Ok(())
    }

    fn spawn_receiver(&self, transport: Arc<dyn Transport>) -> std::io::Result<Worker> {
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let timeout = self.receive_timeout;

        Worker::spawn("can-rx", move |token| {
            log::debug!("Receive loop started (timeout {:?})", timeout);

            while !token.is_cancelled() {
                match transport.receive(timeout) {
                    Ok(Some(frame)) => {
                        let frame = frame.restamped(now_seconds());
                        log::trace!("RX {}", frame);
                        counters.received.fetch_add(1, Ordering::Relaxed);
                        if !token.deliver(|| sink.on_frame(frame)) {
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Receive failed: {}", e);
                        if !token.sleep(timeout) {
                            break;
                        }
                    }
                }
            }

            log::debug!("Receive loop stopped");
        })
    }

    /// Stop the receive worker and release the transport
    ///
    /// Calling this while closed is a no-op. Once it returns the sink is not
    /// invoked again by this controller.
    pub fn close(&self) {
        let Some(mut connection) = self.connection.lock().take() else {
            return;
        };

        connection.worker.stop(self.stop_timeout);
        connection.transport.shutdown();
        log::info!("CAN bus disconnected from '{}'", connection.config.channel);
    }

    pub fn is_open(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Configuration of the open transport
    pub fn bus_config(&self) -> Option<BusConfig> {
        self.connection.lock().as_ref().map(|c| c.config.clone())
    }

    /// Transmit a frame through the open transport
    pub fn send(&self, id: u32, payload: &[u8], extended: bool) -> Result<()> {
        let connection = self.connection.lock();
        let connection = connection.as_ref().ok_or(PipelineError::NotConnectedError)?;

        let frame = Frame::now(id, payload.to_vec(), extended)?;

        connection.transport.send(&frame).map_err(|e| match e {
            PipelineError::TransmitError(_) => e,
            other => PipelineError::TransmitError(other.to_string()),
        })?;

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("TX {}", frame);
        Ok(())
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            frames_received: self.counters.received.load(Ordering::Relaxed),
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            receive_errors: self.counters.receive_errors.load(Ordering::Relaxed),
        }
    }
}

impl FrameSender for BusController {
    fn send(&self, id: u32, payload: &[u8], extended: bool) -> Result<()> {
        BusController::send(self, id, payload, extended)
    }
}

impl Drop for BusController {
    fn drop(&mut self) {
        self.close();
    }
}
