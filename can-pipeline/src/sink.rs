//! Frame sink
//!
//! The single consumer interface shared by every frame source. The bus
//! controller, the virtual generator and the replay player all hold a reference
//! to the same sink and call it on their own worker thread, once per frame, in
//! production order. Sinks that need thread affinity must re-marshal.

use crate::types::Frame;
use std::sync::Arc;

/// Consumer of observed frames
pub trait FrameSink: Send + Sync {
    /// Called once per observed frame on the producing worker's thread
    fn on_frame(&self, frame: Frame);
}

impl<F> FrameSink for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn on_frame(&self, frame: Frame) {
        self(frame)
    }
}

/// Shared handle to a sink
pub type SharedSink = Arc<dyn FrameSink>;

/// Sink that drops every frame
pub struct NullSink;

impl FrameSink for NullSink {
    fn on_frame(&self, _frame: Frame) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::clone(&seen);
        let sink: SharedSink = Arc::new(move |frame: Frame| collector.lock().push(frame.id()));

        sink.on_frame(Frame::new(0.0, 0x1, vec![], false).unwrap());
        sink.on_frame(Frame::new(0.0, 0x2, vec![], false).unwrap());
        NullSink.on_frame(Frame::new(0.0, 0x3, vec![], false).unwrap());

        assert_eq!(*seen.lock(), vec![0x1, 0x2]);
    }
}
