//! Signal database, DBC loader and codec
//!
//! This module contains the DBC loader, the signal database built from it and
//! the codec that packs and unpacks signal values.

pub mod codec;
pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use codec::{FrameCodec, MessageCodec};
pub use database::{
    ByteOrder, DatabaseSlot, DatabaseStats, MessageDefinition, SignalDatabase,
    SignalDefinition, ValueType,
};
