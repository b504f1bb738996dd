//! Frame and database printing (text or JSON lines)

use anyhow::Result;
use can_pipeline::{DecodedFrame, SignalDatabase};
use serde::Serialize;
use std::collections::BTreeMap;

/// One printed frame
#[derive(Debug, Serialize)]
pub struct FrameLine {
    pub timestamp: f64,
    pub datetime: String,
    pub id: String,
    pub extended: bool,
    pub dlc: usize,
    pub data: String,
    pub message: Option<String>,
    pub signals: BTreeMap<String, f64>,
}

impl FrameLine {
    pub fn from_decoded(decoded: &DecodedFrame) -> Self {
        let frame = &decoded.frame;
        Self {
            timestamp: frame.timestamp(),
            datetime: frame.datetime().to_rfc3339(),
            id: format!("0x{:X}", frame.id()),
            extended: frame.is_extended(),
            dlc: frame.dlc(),
            data: frame.data_hex(),
            message: decoded.message_name.clone(),
            signals: decoded
                .signals
                .iter()
                .map(|(name, value)| (name.clone(), *value))
                .collect(),
        }
    }

    pub fn to_text(&self) -> String {
        let name = self.message.as_deref().unwrap_or("?");
        let signals = self
            .signals
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} {:>10} [{}] {:<23} {} {}",
            self.datetime, self.id, self.dlc, self.data, name, signals
        )
    }
}

/// Render one decoded frame as a single output line
pub fn render_frame(decoded: &DecodedFrame, json: bool) -> Result<String> {
    let line = FrameLine::from_decoded(decoded);
    if json {
        Ok(serde_json::to_string(&line)?)
    } else {
        Ok(line.to_text())
    }
}

#[derive(Debug, Serialize)]
struct SignalSummary<'a> {
    name: &'a str,
    start_bit: u16,
    length: u16,
    factor: f64,
    offset: f64,
    min: f64,
    max: f64,
    unit: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct MessageSummary<'a> {
    id: String,
    extended: bool,
    name: &'a str,
    size: usize,
    signals: Vec<SignalSummary<'a>>,
}

/// Render the contents of a signal database
pub fn render_database(db: &SignalDatabase, json: bool) -> Result<Vec<String>> {
    let summaries: Vec<MessageSummary> = db
        .messages()
        .iter()
        .map(|message| MessageSummary {
            id: format!("0x{:X}", message.id),
            extended: message.extended,
            name: &message.name,
            size: message.size,
            signals: message
                .signals
                .iter()
                .map(|s| SignalSummary {
                    name: &s.name,
                    start_bit: s.start_bit,
                    length: s.length,
                    factor: s.factor,
                    offset: s.offset,
                    min: s.min,
                    max: s.max,
                    unit: s.unit.as_deref(),
                })
                .collect(),
        })
        .collect();

    if json {
        return summaries
            .iter()
            .map(|summary| serde_json::to_string(summary).map_err(anyhow::Error::from))
            .collect();
    }

    let mut lines = Vec::new();
    for message in &summaries {
        lines.push(format!(
            "{} {}{} ({} bytes, {} signals)",
            message.id,
            message.name,
            if message.extended { " [ext]" } else { "" },
            message.size,
            message.signals.len()
        ));
        for signal in &message.signals {
            lines.push(format!(
                "    {:<24} {}|{} ({},{}) [{}|{}] {}",
                signal.name,
                signal.start_bit,
                signal.length,
                signal.factor,
                signal.offset,
                signal.min,
                signal.max,
                signal.unit.unwrap_or("")
            ));
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_pipeline::{Frame, SignalValues};

    fn decoded() -> DecodedFrame {
        DecodedFrame {
            frame: Frame::new(1_700_000_000.5, 0x123, vec![0x10, 0x00], false).unwrap(),
            message_name: Some("EngineData".to_string()),
            signals: SignalValues::from([("Speed".to_string(), 16.0)]),
        }
    }

    #[test]
    fn test_text_line() {
        let line = render_frame(&decoded(), false).unwrap();
        assert!(line.contains("0x123"));
        assert!(line.contains("10 00"));
        assert!(line.contains("EngineData Speed=16"));
    }

    #[test]
    fn test_json_line() {
        let line = render_frame(&decoded(), true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], "0x123");
        assert_eq!(value["dlc"], 2);
        assert_eq!(value["message"], "EngineData");
        assert_eq!(value["signals"]["Speed"], 16.0);
    }

    #[test]
    fn test_unknown_frame_has_no_message() {
        let raw = DecodedFrame::raw(Frame::new(0.0, 0x7FF, vec![], false).unwrap());
        let line = render_frame(&raw, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(value["message"].is_null());
        assert_eq!(value["data"], "");
    }
}
