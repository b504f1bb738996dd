//! Signal codec
//!
//! Packs physical signal values into frame payloads and extracts them again,
//! based on the signal definitions of the loaded database. Handles bit
//! placement, endianness, sign extension and physical value conversion.

use crate::signals::database::{ByteOrder, MessageDefinition, SignalDatabase, SignalDefinition, ValueType};
use crate::types::{DecodedFrame, Frame, PipelineError, Result, SignalValues};

/// Encode/decode contract shared by every pipeline component
pub trait FrameCodec: Send + Sync {
    /// Decode a payload; unknown IDs yield an empty mapping
    ///
    /// The ID width is not known here, so a standard definition is preferred
    /// over an extended one with the same numeric ID.
    fn decode(&self, frame_id: u32, payload: &[u8]) -> SignalValues;

    /// Encode signal values of a named message into a payload
    fn encode(&self, message_name: &str, values: &SignalValues) -> Result<Vec<u8>>;

    /// Message definition for a CAN ID of the given width
    fn message_by_id(&self, frame_id: u32, extended: bool) -> Option<&MessageDefinition>;

    /// Message definition by name
    fn message_by_name(&self, name: &str) -> Option<&MessageDefinition>;

    /// All message definitions
    fn messages(&self) -> &[MessageDefinition];

    /// Interpret a frame against this codec
    fn decode_frame(&self, frame: &Frame) -> DecodedFrame {
        match self.message_by_id(frame.id(), frame.is_extended()) {
            Some(message) => DecodedFrame {
                frame: frame.clone(),
                message_name: Some(message.name.clone()),
                signals: MessageCodec::decode(message, frame.payload()),
            },
            None => DecodedFrame::raw(frame.clone()),
        }
    }
}

impl FrameCodec for SignalDatabase {
    fn decode(&self, frame_id: u32, payload: &[u8]) -> SignalValues {
        match self.get_message(frame_id) {
            Some(message) => MessageCodec::decode(message, payload),
            None => {
                log::trace!("Unknown CAN ID: 0x{:X}, nothing to decode", frame_id);
                SignalValues::new()
            }
        }
    }

    fn encode(&self, message_name: &str, values: &SignalValues) -> Result<Vec<u8>> {
        let message = self
            .get_message_by_name(message_name)
            .ok_or_else(|| PipelineError::UnknownMessageError(message_name.to_string()))?;
        MessageCodec::encode(message, values)
    }

    fn message_by_id(&self, frame_id: u32, extended: bool) -> Option<&MessageDefinition> {
        self.get_message_for(frame_id, extended)
    }

    fn message_by_name(&self, name: &str) -> Option<&MessageDefinition> {
        self.get_message_by_name(name)
    }

    fn messages(&self) -> &[MessageDefinition] {
        SignalDatabase::messages(self)
    }
}

/// Per-message packing and unpacking
pub struct MessageCodec;

impl MessageCodec {
    /// Decode every signal that fits within the payload
    pub fn decode(message: &MessageDefinition, data: &[u8]) -> SignalValues {
        let mut values = SignalValues::new();
        for signal in &message.signals {
            if let Some(raw) = Self::extract_signal_value(data, signal) {
                values.insert(signal.name.clone(), signal.offset + signal.factor * raw as f64);
            }
        }
        values
    }

    /// Encode values into a payload of the message's declared size
    ///
    /// Keys that are not signals of the message are rejected; signals missing
    /// from `values` are packed as raw zero.
    pub fn encode(message: &MessageDefinition, values: &SignalValues) -> Result<Vec<u8>> {
        if let Some(unknown) = values.keys().find(|name| message.signal(name).is_none()) {
            return Err(PipelineError::SignalRangeError {
                message: message.name.clone(),
                signal: unknown.clone(),
                reason: "not defined in message".to_string(),
            });
        }

        let mut data = vec![0u8; message.size];
        for signal in &message.signals {
            let raw = match values.get(&signal.name) {
                Some(&value) => Self::physical_to_raw(message, signal, value)?,
                None => 0,
            };
            Self::insert_signal_value(&mut data, signal, raw).map_err(|reason| {
                PipelineError::SignalRangeError {
                    message: message.name.clone(),
                    signal: signal.name.clone(),
                    reason,
                }
            })?;
        }
        Ok(data)
    }

    /// Convert a physical value to the raw integer, checking declared bounds
    fn physical_to_raw(
        message: &MessageDefinition,
        signal: &SignalDefinition,
        value: f64,
    ) -> Result<i64> {
        let range_error = |reason: String| PipelineError::SignalRangeError {
            message: message.name.clone(),
            signal: signal.name.clone(),
            reason,
        };

        if !value.is_finite() {
            return Err(range_error(format!("value {} is not finite", value)));
        }
        if let Some((min, max)) = signal.bounds() {
            if value < min || value > max {
                return Err(range_error(format!(
                    "value {} outside [{}, {}]",
                    value, min, max
                )));
            }
        }
        if signal.factor == 0.0 {
            return Err(range_error("scale factor is zero".to_string()));
        }

        let raw = ((value - signal.offset) / signal.factor).round();
        let (raw_min, raw_max) = signal.raw_range();
        if raw < raw_min as f64 || raw > raw_max as f64 {
            return Err(range_error(format!(
                "value {} does not fit in {} bits",
                value, signal.length
            )));
        }
        Ok(raw as i64)
    }

    /// Extract raw signal value from CAN frame data
    ///
    /// Returns None when the signal extends past the end of the payload.
    fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
        let start_bit = signal.start_bit as usize;
        let length = signal.length as usize;
        if length == 0 || length > 64 {
            return None;
        }

        let positions = Self::bit_positions(signal.byte_order, start_bit, length)?;
        if positions.iter().any(|&pos| pos / 8 >= data.len()) {
            log::trace!(
                "Signal '{}' extends past the {} byte payload",
                signal.name,
                data.len()
            );
            return None;
        }

        // positions are ordered LSB first
        let mut raw: u64 = 0;
        for (i, &pos) in positions.iter().enumerate() {
            let bit = (data[pos / 8] >> (pos % 8)) & 0x01;
            raw |= (bit as u64) << i;
        }

        let value = match signal.value_type {
            ValueType::Unsigned => raw as i64,
            ValueType::Signed => Self::sign_extend(raw, length),
        };
        Some(value)
    }

    /// Write a raw value into the payload at the signal's bit positions
    fn insert_signal_value(
        data: &mut [u8],
        signal: &SignalDefinition,
        raw: i64,
    ) -> std::result::Result<(), String> {
        let length = signal.length as usize;
        if length == 0 || length > 64 {
            return Err(format!("unsupported length of {} bits", length));
        }
        let positions = Self::bit_positions(signal.byte_order, signal.start_bit as usize, length)
            .ok_or_else(|| "invalid bit layout".to_string())?;
        if positions.iter().any(|&pos| pos / 8 >= data.len()) {
            return Err(format!("does not fit in {} byte payload", data.len()));
        }

        let bits = raw as u64;
        for (i, &pos) in positions.iter().enumerate() {
            let mask = 1u8 << (pos % 8);
            if (bits >> i) & 0x01 == 1 {
                data[pos / 8] |= mask;
            } else {
                data[pos / 8] &= !mask;
            }
        }
        Ok(())
    }

    /// Absolute bit positions (byte * 8 + bit, bit 0 = LSB) of a signal, LSB first
    ///
    /// Little-endian (Intel): the start bit is the LSB and bits count upwards.
    /// Big-endian (Motorola): the start bit is the MSB; bits walk down within a
    /// byte and continue at bit 7 of the next byte.
    fn bit_positions(byte_order: ByteOrder, start_bit: usize, length: usize) -> Option<Vec<usize>> {
        if length == 0 {
            return None;
        }
        match byte_order {
            ByteOrder::LittleEndian => Some((start_bit..start_bit + length).collect()),
            ByteOrder::BigEndian => {
                let mut msb_first = Vec::with_capacity(length);
                let mut pos = start_bit;
                for _ in 0..length {
                    msb_first.push(pos);
                    pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
                }
                msb_first.reverse();
                Some(msb_first)
            }
        }
    }

    /// Sign-extend a value from N bits to 64 bits
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}
