//! Core types for the CAN frame pipeline
//!
//! This module defines the frame model shared by every producer and consumer in
//! the pipeline, together with the error taxonomy. Frames are immutable once
//! constructed; decoded frames are derived views and are never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp type used for human-readable output
pub type Timestamp = DateTime<Utc>;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Decoded signal values keyed by signal name
pub type SignalValues = HashMap<String, f64>;

/// Maximum payload length (CAN-FD)
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest extended (29-bit) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Current wall-clock time in seconds since the UNIX epoch
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One CAN bus transmission unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    timestamp: f64,
    id: u32,
    payload: Vec<u8>,
    extended: bool,
}

impl Frame {
    /// Create a frame, validating the identifier width and payload length
    pub fn new(timestamp: f64, id: u32, payload: Vec<u8>, extended: bool) -> Result<Self> {
        let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if id > max_id {
            return Err(PipelineError::ConfigurationError(format!(
                "CAN ID 0x{:X} does not fit a {} identifier",
                id,
                if extended { "29-bit" } else { "11-bit" }
            )));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PipelineError::ConfigurationError(format!(
                "Payload of {} bytes exceeds the {} byte maximum",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        Ok(Self {
            timestamp,
            id,
            payload,
            extended,
        })
    }

    /// Create a frame stamped with the current wall-clock time
    pub fn now(id: u32, payload: Vec<u8>, extended: bool) -> Result<Self> {
        Self::new(now_seconds(), id, payload, extended)
    }

    /// Copy of this frame carrying a different timestamp
    pub fn restamped(&self, timestamp: f64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// Capture time in seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Capture time as a UTC date
    pub fn datetime(&self) -> Timestamp {
        let secs = self.timestamp.floor();
        let nanos = ((self.timestamp - secs) * 1e9).round().min(999_999_999.0) as u32;
        DateTime::from_timestamp(secs as i64, nanos).unwrap_or_else(Utc::now)
    }

    /// CAN identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True if this frame uses a 29-bit identifier
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Data length code - number of payload bytes
    pub fn dlc(&self) -> usize {
        self.payload.len()
    }

    /// Payload formatted as space-separated uppercase hex pairs
    pub fn data_hex(&self) -> String {
        format_hex(&self.payload)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} 0x{:X}{} [{}] {}",
            self.timestamp,
            self.id,
            if self.extended { "x" } else { "" },
            self.dlc(),
            self.data_hex()
        )
    }
}

/// Format bytes as space-separated uppercase hex pairs
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A frame together with its interpretation against the loaded database
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedFrame {
    /// The source frame
    pub frame: Frame,
    /// Message name from the database (if the ID is known)
    pub message_name: Option<String>,
    /// Decoded signal values (empty if the ID is unknown)
    pub signals: SignalValues,
}

impl DecodedFrame {
    /// Wrap a frame without any interpretation
    pub fn raw(frame: Frame) -> Self {
        Self {
            frame,
            message_name: None,
            signals: SignalValues::new(),
        }
    }

    /// True if a message definition matched this frame
    pub fn is_decoded(&self) -> bool {
        self.message_name.is_some()
    }
}

/// Errors that can occur in the pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transmit failed: {0}")]
    TransmitError(String),

    #[error("CAN bus not connected")]
    NotConnectedError,

    #[error("Unknown message: {0}")]
    UnknownMessageError(String),

    #[error("Signal '{signal}' of message '{message}': {reason}")]
    SignalRangeError {
        message: String,
        signal: String,
        reason: String,
    },

    #[error("Corrupt recording at line {line}: {reason}")]
    CorruptRecordingError { line: usize, reason: String },

    #[error("Cannot start {requested}: {active} is already active")]
    SourceConflictError {
        active: FrameSourceKind,
        requested: FrameSourceKind,
    },

    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The producers that can feed the shared frame sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameSourceKind {
    /// Live bus traffic through the bus controller
    Bus,
    /// Synthesized traffic from the virtual generator
    Virtual,
    /// Recorded traffic from a replay
    Replay,
}

impl fmt::Display for FrameSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSourceKind::Bus => write!(f, "bus"),
            FrameSourceKind::Virtual => write!(f, "virtual generator"),
            FrameSourceKind::Replay => write!(f, "replay"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_validation() {
        assert!(Frame::new(0.0, 0x7FF, vec![0; 8], false).is_ok());
        assert!(Frame::new(0.0, 0x800, vec![0; 8], false).is_err());
        assert!(Frame::new(0.0, 0x800, vec![0; 8], true).is_ok());
        assert!(Frame::new(0.0, 0x2000_0000, vec![], true).is_err());
        assert!(Frame::new(0.0, 0x100, vec![0; 64], false).is_ok());
        assert!(Frame::new(0.0, 0x100, vec![0; 65], false).is_err());
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::new(1.5, 0x123, vec![0xDE, 0xAD, 0x01], false).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data_hex(), "DE AD 01");
        assert_eq!(format!("{}", frame), "1.500000 0x123 [3] DE AD 01");
    }

    #[test]
    fn test_restamped_keeps_content() {
        let frame = Frame::new(1.0, 0x10, vec![1, 2], false).unwrap();
        let copy = frame.restamped(2.0);
        assert_eq!(copy.timestamp(), 2.0);
        assert_eq!(copy.id(), 0x10);
        assert_eq!(copy.payload(), &[1, 2]);
    }

    #[test]
    fn test_datetime_conversion() {
        let frame = Frame::new(1_700_000_000.25, 0x1, vec![], false).unwrap();
        let dt = frame.datetime();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::SourceConflictError {
            active: FrameSourceKind::Bus,
            requested: FrameSourceKind::Replay,
        };
        assert_eq!(err.to_string(), "Cannot start replay: bus is already active");
        assert_eq!(
            PipelineError::NotConnectedError.to_string(),
            "CAN bus not connected"
        );
    }
}
