//! Recording row format
//!
//! One header line followed by one row per frame:
//!
//! ```text
//! timestamp,id,dlc,data
//! 1700000000.123456,0x123,8,DE AD BE EF 00 01 02 03
//! ```
//!
//! Timestamps carry six fractional digits, IDs are `0x`-prefixed hex, the DLC
//! is decimal and the data column holds space-separated hex byte pairs.

use crate::types::{format_hex, Frame, PipelineError, Result};

/// Column header written at the top of every recording
pub const HEADER: &str = "timestamp,id,dlc,data";

/// The on-disk unit of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub timestamp: f64,
    pub id: u32,
    pub payload: Vec<u8>,
}

impl RecordedEvent {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            timestamp: frame.timestamp(),
            id: frame.id(),
            payload: frame.payload().to_vec(),
        }
    }
}

/// Format one frame as a recording row (without line terminator)
pub fn format_row(frame: &Frame) -> String {
    format!(
        "{:.6},0x{:x},{},{}",
        frame.timestamp(),
        frame.id(),
        frame.dlc(),
        format_hex(frame.payload())
    )
}

/// True if `line` is the column header
pub fn is_header(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(HEADER)
}

/// Parse one recording row; `line_no` is 1-based and used for error reports
pub fn parse_row(line: &str, line_no: usize) -> Result<RecordedEvent> {
    let corrupt = |reason: String| PipelineError::CorruptRecordingError {
        line: line_no,
        reason,
    };

    let columns: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if columns.len() != 4 {
        return Err(corrupt(format!("expected 4 columns, found {}", columns.len())));
    }

    let timestamp: f64 = columns[0]
        .parse()
        .map_err(|_| corrupt(format!("invalid timestamp '{}'", columns[0])))?;
    if !timestamp.is_finite() {
        return Err(corrupt(format!("invalid timestamp '{}'", columns[0])));
    }

    let id_text = columns[1]
        .strip_prefix("0x")
        .or_else(|| columns[1].strip_prefix("0X"))
        .unwrap_or(columns[1]);
    let id = u32::from_str_radix(id_text, 16)
        .map_err(|_| corrupt(format!("invalid id '{}'", columns[1])))?;

    let dlc: usize = columns[2]
        .parse()
        .map_err(|_| corrupt(format!("invalid dlc '{}'", columns[2])))?;

    let payload = columns[3]
        .split_whitespace()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(corrupt(format!("invalid data byte '{}'", pair)));
            }
            u8::from_str_radix(pair, 16).map_err(|_| corrupt(format!("invalid data byte '{}'", pair)))
        })
        .collect::<Result<Vec<u8>>>()?;

    if payload.len() != dlc {
        return Err(corrupt(format!(
            "dlc {} does not match {} data bytes",
            dlc,
            payload.len()
        )));
    }

    Ok(RecordedEvent {
        timestamp,
        id,
        payload,
    })
}
