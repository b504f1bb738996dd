//! DBC file loader
//!
//! Parses Vector DBC files with the `can-dbc` crate and converts them into the
//! pipeline's message definitions.

use crate::signals::database::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{PipelineError, Result};
use std::path::Path;

/// Bit 31 of a DBC message ID marks a 29-bit identifier
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|e| {
        PipelineError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    let messages = parse_dbc_bytes(&bytes).map_err(|e| match e {
        PipelineError::DbcParseError(msg) => {
            PipelineError::DbcParseError(format!("{:?}: {}", path, msg))
        }
        other => other,
    })?;

    log::info!("Parsed {} messages from {:?}", messages.len(), path);
    Ok(messages)
}

/// Parse DBC content held in memory
pub fn parse_dbc_bytes(bytes: &[u8]) -> Result<Vec<MessageDefinition>> {
    // Latin-1 fallback for files exported by Windows tools
    let content: String = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            log::warn!("DBC content is not UTF-8, trying Latin-1 encoding");
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| PipelineError::DbcParseError(format!("{:?}", e)))?;

    Ok(dbc.messages().iter().map(convert_message).collect())
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(dbc_msg: &can_dbc::Message) -> MessageDefinition {
    let raw_id = dbc_msg.message_id().0;
    let extended = raw_id & EXTENDED_ID_FLAG != 0;

    MessageDefinition {
        id: raw_id & !EXTENDED_ID_FLAG,
        extended,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals: dbc_msg.signals().iter().map(convert_signal).collect(),
    }
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(dbc_sig: &can_dbc::Signal) -> SignalDefinition {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) const VEHICLE_DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ Speed : 0|16@1+ (1,0) [0|300] "km/h" ECU2
 SG_ Rpm : 16|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 32|8@1+ (1,-40) [-40|215] "C" ECU2

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2

BO_ 2147484160 BodyExtended: 4 ECU2
 SG_ DoorState : 7|8@0+ (1,0) [0|0] "" ECU1
"#;

    #[test]
    fn test_parse_simple_dbc() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(VEHICLE_DBC.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let messages = parse_dbc_file(temp_file.path()).unwrap();
        assert_eq!(messages.len(), 3);

        let msg1 = &messages[0];
        assert_eq!(msg1.id, 291);
        assert!(!msg1.extended);
        assert_eq!(msg1.name, "EngineData");
        assert_eq!(msg1.size, 8);
        assert_eq!(msg1.sender, Some("ECU1".to_string()));
        assert_eq!(msg1.signals.len(), 3);

        let sig1 = &msg1.signals[0];
        assert_eq!(sig1.name, "Speed");
        assert_eq!(sig1.start_bit, 0);
        assert_eq!(sig1.length, 16);
        assert_eq!(sig1.byte_order, ByteOrder::LittleEndian);
        assert_eq!(sig1.unit, Some("km/h".to_string()));
        assert_eq!(sig1.max, 300.0);

        let temp = &msg1.signals[2];
        assert_eq!(temp.offset, -40.0);
    }

    #[test]
    fn test_extended_id_flag_is_stripped() {
        let messages = parse_dbc_bytes(VEHICLE_DBC.as_bytes()).unwrap();
        let body = messages.iter().find(|m| m.name == "BodyExtended").unwrap();
        assert!(body.extended);
        assert_eq!(body.id, 0x200);
        assert_eq!(body.signals[0].byte_order, ByteOrder::BigEndian);
    }

    #[test]
    fn test_missing_file() {
        let result = parse_dbc_file(Path::new("/nonexistent/file.dbc"));
        assert!(matches!(result, Err(PipelineError::DbcParseError(_))));
    }
}
