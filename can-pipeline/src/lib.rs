//! CAN Frame Pipeline Library
//!
//! Acquires CAN frames from a bus, a virtual generator or a recorded session,
//! decodes them against a DBC signal database and fans them out to a bounded
//! history, an optional on-disk recording and an observer. Messages can also be
//! encoded from signal values and transmitted once or cyclically.
//!
//! # Architecture
//!
//! Every frame source runs on its own worker thread and delivers into a single
//! [`FrameSink`]:
//! - [`BusController`] owns a [`Transport`] and its receive loop
//! - [`VirtualGenerator`] synthesizes frames for the loaded database
//! - [`ReplayPlayer`] re-emits a recording with its original pacing
//!
//! On the way out, [`CyclicTransmitSet`] keeps at most one periodic job per
//! message name and sends through the bus controller.
//!
//! [`Session`] ties the pieces together and enforces that only one source is
//! active at a time.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_pipeline::{BusConfig, PipelineConfig, Session, SignalValues, VirtualBus};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let session = Session::new(Arc::new(VirtualBus::new()), PipelineConfig::new()).unwrap();
//! session.load_dbc(Path::new("vehicle.dbc")).unwrap();
//! session.connect(&BusConfig::new().with_channel("vcan0")).unwrap();
//!
//! session.set_observer(|frame: &can_pipeline::DecodedFrame| {
//!     println!("{} {:?}", frame.frame, frame.signals);
//! });
//!
//! let values = SignalValues::from([("Speed".to_string(), 88.0)]);
//! session.set_cyclic("EngineData", &values, 100, true).unwrap();
//! ```

// Public modules
pub mod bus;
pub mod config;
pub mod cyclic;
pub mod generator;
pub mod history;
pub mod recording;
pub mod session;
pub mod signals;
pub mod sink;
pub mod transport;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use bus::{BusController, BusStats, FrameSender};
pub use config::{BusConfig, PipelineConfig};
pub use cyclic::{CyclicTransmitSet, TxJob};
pub use generator::{GeneratorSettings, SynthesisMode, VirtualGenerator};
pub use history::RxHistory;
pub use recording::{RecordedEvent, Replay, ReplayPlayer, ReplaySource, SessionRecorder};
pub use session::{FrameObserver, Session};
pub use signals::{
    DatabaseSlot, DatabaseStats, FrameCodec, MessageDefinition, SignalDatabase, SignalDefinition,
};
pub use sink::{FrameSink, NullSink, SharedSink};
pub use transport::{Connector, Transport, VirtualBus, VirtualTransport};
pub use types::{
    DecodedFrame, Frame, FrameSourceKind, PipelineError, Result, SignalValues, Timestamp,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
