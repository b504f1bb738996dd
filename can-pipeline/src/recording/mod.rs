//! Session recording and replay
//!
//! Frames are persisted as newline-delimited rows (see [`csv`]); the recorder
//! writes them and the replay source reads them back with their original
//! timing.

pub mod csv;
pub mod recorder;
pub mod replay;

pub use csv::RecordedEvent;
pub use recorder::SessionRecorder;
pub use replay::{Replay, ReplayCanceller, ReplayPlayer, ReplaySource};
