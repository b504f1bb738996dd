//! Signal database
//!
//! Holds the message definitions loaded from DBC files and answers lookups by
//! CAN ID and by message name. The database is read-only once built; the
//! [`DatabaseSlot`] lets a running session swap it for another one.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// CAN message ID (without the extended flag bit)
    pub id: u32,
    /// True if the message uses a 29-bit identifier
    pub extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
}

impl MessageDefinition {
    /// Find a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name (unique within its message)
    pub name: String,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
}

impl SignalDefinition {
    /// Physical bounds, or None when the DBC leaves them undefined (`[0|0]`)
    pub fn bounds(&self) -> Option<(f64, f64)> {
        if self.min == 0.0 && self.max == 0.0 {
            None
        } else {
            Some((self.min, self.max))
        }
    }

    /// Range of raw integers that fit in the signal's bit width
    pub fn raw_range(&self) -> (i64, i64) {
        let bits = u32::from(self.length.clamp(1, 64));
        match self.value_type {
            ValueType::Unsigned if bits >= 63 => (0, i64::MAX),
            ValueType::Unsigned => (0, (1i64 << bits) - 1),
            ValueType::Signed if bits >= 64 => (i64::MIN, i64::MAX),
            ValueType::Signed => (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1),
        }
    }

    /// Physical values reachable through the raw range, lowest first
    pub fn physical_range(&self) -> (f64, f64) {
        let (raw_min, raw_max) = self.raw_range();
        let a = self.offset + self.factor * raw_min as f64;
        let b = self.offset + self.factor * raw_max as f64;
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

/// Byte order for signal packing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// The loaded signal database
pub struct SignalDatabase {
    /// Message definitions in load order
    messages: Vec<MessageDefinition>,

    /// Key: (CAN ID, extended), Value: index into `messages` (first definition wins)
    id_lookup: HashMap<(u32, bool), usize>,

    /// Key: message name, Value: index into `messages`
    name_lookup: HashMap<String, usize>,

    /// File the definitions came from (if loaded from disk)
    source: Option<PathBuf>,
}

impl SignalDatabase {
    /// Create a new empty signal database
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            id_lookup: HashMap::new(),
            name_lookup: HashMap::new(),
            source: None,
        }
    }

    /// Build a database from a list of messages
    pub fn from_messages(messages: impl IntoIterator<Item = MessageDefinition>) -> Self {
        let mut db = Self::new();
        for message in messages {
            db.add_message(message);
        }
        db
    }

    /// Load all message definitions of a DBC file
    pub fn from_dbc_file(path: &Path) -> crate::types::Result<Self> {
        let messages = crate::signals::dbc::parse_dbc_file(path)?;
        let mut db = Self::from_messages(messages);
        db.source = Some(path.to_path_buf());
        Ok(db)
    }

    /// Add a message definition to the database
    pub fn add_message(&mut self, message: MessageDefinition) {
        let idx = self.messages.len();

        let key = (message.id, message.extended);
        if self.id_lookup.contains_key(&key) {
            log::warn!(
                "Duplicate definition for CAN ID 0x{:X} ({}), keeping the first one",
                message.id,
                message.name
            );
        } else {
            self.id_lookup.insert(key, idx);
        }
        self.name_lookup.insert(message.name.clone(), idx);
        self.messages.push(message);
    }

    /// Get the message definition for a CAN ID of unknown width
    ///
    /// A standard definition takes precedence over an extended one.
    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.get_message_for(can_id, false)
            .or_else(|| self.get_message_for(can_id, true))
    }

    /// Get the message definition for a CAN ID of the given width
    pub fn get_message_for(&self, can_id: u32, extended: bool) -> Option<&MessageDefinition> {
        self.id_lookup
            .get(&(can_id, extended))
            .map(|&idx| &self.messages[idx])
    }

    /// Get a message definition by name
    pub fn get_message_by_name(&self, name: &str) -> Option<&MessageDefinition> {
        self.name_lookup.get(name).map(|&idx| &self.messages[idx])
    }

    /// All message definitions in load order
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    /// Path of the DBC file this database was loaded from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.iter().map(|m| m.signals.len()).sum(),
        }
    }

    /// Get all unique CAN IDs in the database
    pub fn get_all_can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.id_lookup.keys().map(|&(id, _)| id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

impl Default for SignalDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

/// Shared handle to the currently loaded database
///
/// Workers read the slot once per cycle, so loading or unloading a database
/// takes effect on their next iteration.
#[derive(Clone, Default)]
pub struct DatabaseSlot {
    inner: Arc<RwLock<Option<Arc<SignalDatabase>>>>,
}

impl DatabaseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current database
    pub fn load(&self, db: SignalDatabase) -> Arc<SignalDatabase> {
        let db = Arc::new(db);
        *self.inner.write() = Some(Arc::clone(&db));
        db
    }

    /// Drop the current database
    pub fn unload(&self) {
        *self.inner.write() = None;
    }

    /// The current database, if any
    pub fn current(&self) -> Option<Arc<SignalDatabase>> {
        self.inner.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn signal(name: &str, start_bit: u16, length: u16) -> SignalDefinition {
        SignalDefinition {
            name: name.to_string(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
        }
    }

    pub(crate) fn engine_data() -> MessageDefinition {
        MessageDefinition {
            id: 0x123,
            extended: false,
            name: "EngineData".to_string(),
            size: 8,
            sender: Some("ECU1".to_string()),
            signals: vec![signal("Speed", 0, 16), signal("Rpm", 16, 16)],
        }
    }

    #[test]
    fn test_empty_database() {
        let db = SignalDatabase::new();
        let stats = db.stats();
        assert_eq!(stats.num_messages, 0);
        assert_eq!(stats.num_signals, 0);
    }

    #[test]
    fn test_add_message() {
        let db = SignalDatabase::from_messages(vec![engine_data()]);

        let stats = db.stats();
        assert_eq!(stats.num_messages, 1);
        assert_eq!(stats.num_signals, 2);

        let msg = db.get_message(0x123).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert!(msg.signal("Rpm").is_some());
        assert!(db.get_message_by_name("EngineData").is_some());
        assert!(db.get_message(0x124).is_none());
        assert_eq!(db.get_all_can_ids(), vec![0x123]);
    }

    #[test]
    fn test_duplicate_id_keeps_first() {
        let mut other = engine_data();
        other.name = "EngineDataCopy".to_string();
        let db = SignalDatabase::from_messages(vec![engine_data(), other]);
        assert_eq!(db.get_message(0x123).unwrap().name, "EngineData");
        assert!(db.get_message_by_name("EngineDataCopy").is_some());
    }

    #[test]
    fn test_width_is_part_of_the_key() {
        let mut extended = engine_data();
        extended.name = "EngineDataExt".to_string();
        extended.extended = true;
        let db = SignalDatabase::from_messages(vec![extended, engine_data()]);

        assert_eq!(db.get_message_for(0x123, false).unwrap().name, "EngineData");
        assert_eq!(db.get_message_for(0x123, true).unwrap().name, "EngineDataExt");
        assert_eq!(db.get_message(0x123).unwrap().name, "EngineData");
        assert!(db.get_message_for(0x124, true).is_none());
        assert_eq!(db.get_all_can_ids(), vec![0x123]);
    }

    #[test]
    fn test_signal_ranges() {
        let mut sig = signal("Temp", 0, 8);
        assert_eq!(sig.bounds(), None);
        assert_eq!(sig.raw_range(), (0, 255));

        sig.offset = -40.0;
        assert_eq!(sig.physical_range(), (-40.0, 215.0));

        sig.value_type = ValueType::Signed;
        assert_eq!(sig.raw_range(), (-128, 127));

        sig.min = -40.0;
        sig.max = 100.0;
        assert_eq!(sig.bounds(), Some((-40.0, 100.0)));
    }

    #[test]
    fn test_database_slot() {
        let slot = DatabaseSlot::new();
        assert!(!slot.is_loaded());

        slot.load(SignalDatabase::from_messages(vec![engine_data()]));
        let reader = slot.clone();
        assert!(reader.is_loaded());
        assert_eq!(reader.current().unwrap().stats().num_messages, 1);

        slot.unload();
        assert!(reader.current().is_none());
    }
}
