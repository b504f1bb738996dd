//! Recording replay
//!
//! [`ReplaySource`] loads a recording into memory and turns it into a lazy,
//! time-paced [`Replay`] sequence. Event *i* is emitted at
//! `start + (ts[i] - ts[0]) / speed`, where `start` is taken when the replay is
//! created (and again each time a looping replay wraps around), so pacing does
//! not drift with the time spent by the consumer.
//!
//! [`ReplayPlayer`] runs a replay on a worker thread and feeds the shared sink,
//! making a recording a frame source like the bus or the virtual generator.

use super::csv::{is_header, parse_row, RecordedEvent};
use crate::sink::SharedSink;
use crate::types::{Frame, PipelineError, Result, MAX_EXTENDED_ID, MAX_PAYLOAD_LEN, MAX_STANDARD_ID};
use crate::worker::{CancelToken, Worker};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A recording loaded into memory
#[derive(Debug, Clone)]
pub struct ReplaySource {
    path: Option<PathBuf>,
    events: Arc<[RecordedEvent]>,
}

impl ReplaySource {
    /// Parse every row of a recording
    ///
    /// Fails as a whole on the first malformed row.
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("Loading recording: {:?}", path);
        let content = fs::read(path)?;

        let mut events = Vec::new();
        for (idx, raw) in content.split(|&b| b == b'\n').enumerate() {
            let line_no = idx + 1;
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = std::str::from_utf8(raw).map_err(|_| PipelineError::CorruptRecordingError {
                line: line_no,
                reason: "row is not valid UTF-8".to_string(),
            })?;
            if line.trim().is_empty() || (events.is_empty() && is_header(line)) {
                continue;
            }
            let event = parse_row(line, line_no)?;
            Self::check_event(&event, line_no)?;
            events.push(event);
        }

        log::info!("Loaded {} events from {:?}", events.len(), path);
        Ok(Self {
            path: Some(path.to_path_buf()),
            events: events.into(),
        })
    }

    /// Build a source from events already in memory
    pub fn from_events(events: Vec<RecordedEvent>) -> Result<Self> {
        for (idx, event) in events.iter().enumerate() {
            Self::check_event(event, idx + 1)?;
        }
        Ok(Self {
            path: None,
            events: events.into(),
        })
    }

    fn check_event(event: &RecordedEvent, line_no: usize) -> Result<()> {
        if event.id > MAX_EXTENDED_ID {
            return Err(PipelineError::CorruptRecordingError {
                line: line_no,
                reason: format!("id 0x{:X} exceeds 29 bits", event.id),
            });
        }
        if event.payload.len() > MAX_PAYLOAD_LEN {
            return Err(PipelineError::CorruptRecordingError {
                line: line_no,
                reason: format!("{} data bytes exceed the maximum", event.payload.len()),
            });
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Time between the first and the last event at speed 1.0
    pub fn duration(&self) -> Duration {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => {
                Duration::try_from_secs_f64((last.timestamp - first.timestamp).max(0.0))
                    .unwrap_or(Duration::MAX)
            }
            _ => Duration::ZERO,
        }
    }

    /// Start a paced replay; `speed` must be positive and finite
    pub fn replay(&self, speed: f64, looping: bool) -> Result<Replay> {
        self.check_pacing(speed)?;
        Ok(self.replay_with_token(speed, looping, CancelToken::new()))
    }

    fn replay_with_token(&self, speed: f64, looping: bool, token: Arc<CancelToken>) -> Replay {
        log::debug!(
            "Replay of {} events at {}x{}",
            self.events.len(),
            speed,
            if looping { " (looping)" } else { "" }
        );
        Replay {
            events: Arc::clone(&self.events),
            speed,
            looping,
            index: 0,
            base: Instant::now(),
            token,
        }
    }

    /// Reject speeds whose scaled timeline does not fit a monotonic deadline
    fn check_pacing(&self, speed: f64) -> Result<()> {
        validate_speed(speed)?;

        let Some(first) = self.events.first().map(|e| e.timestamp) else {
            return Ok(());
        };
        let span = self
            .events
            .iter()
            .map(|e| e.timestamp - first)
            .fold(0.0, f64::max)
            / speed;
        let fits = Duration::try_from_secs_f64(span)
            .ok()
            .and_then(|span| Instant::now().checked_add(span))
            .is_some();
        if fits {
            Ok(())
        } else {
            Err(PipelineError::ConfigurationError(format!(
                "replay at {}x would span {:e} seconds",
                speed, span
            )))
        }
    }
}

fn validate_speed(speed: f64) -> Result<()> {
    if speed > 0.0 && speed.is_finite() {
        Ok(())
    } else {
        Err(PipelineError::ConfigurationError(format!(
            "replay speed must be positive, got {}",
            speed
        )))
    }
}

/// Lazy, time-paced sequence of replayed frames
///
/// Each call to `next` blocks until the event is due. Emitted frames carry the
/// emission time; IDs above 0x7FF are emitted as extended frames.
pub struct Replay {
    events: Arc<[RecordedEvent]>,
    speed: f64,
    looping: bool,
    index: usize,
    base: Instant,
    token: Arc<CancelToken>,
}

impl Replay {
    /// Handle that stops the sequence from another thread
    pub fn canceller(&self) -> ReplayCanceller {
        ReplayCanceller(Arc::clone(&self.token))
    }

    fn due_time(&self, event: &RecordedEvent) -> Option<Instant> {
        let first = self.events[0].timestamp;
        let offset = ((event.timestamp - first) / self.speed).max(0.0);
        Duration::try_from_secs_f64(offset)
            .ok()
            .and_then(|offset| self.base.checked_add(offset))
    }
}

impl Iterator for Replay {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if self.events.is_empty() || self.token.is_cancelled() {
                return None;
            }

            if self.index >= self.events.len() {
                if !self.looping {
                    return None;
                }
                log::debug!("Replay wrapped around");
                self.index = 0;
                self.base = Instant::now();
            }

            let event = self.events[self.index].clone();
            let Some(due) = self.due_time(&event) else {
                log::warn!("Replay event at {}s is out of schedulable range", event.timestamp);
                return None;
            };
            if !self.token.sleep_until(due) {
                return None;
            }
            self.index += 1;

            match Frame::now(event.id, event.payload, event.id > MAX_STANDARD_ID) {
                Ok(frame) => return Some(frame),
                Err(e) => log::warn!("Skipping replay event: {}", e),
            }
        }
    }
}

/// Cancels a [`Replay`] between events
#[derive(Clone)]
pub struct ReplayCanceller(Arc<CancelToken>);

impl ReplayCanceller {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// Runs replays on a worker thread into the shared sink
pub struct ReplayPlayer {
    sink: SharedSink,
    stop_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl ReplayPlayer {
    pub fn new(sink: SharedSink, stop_timeout: Duration) -> Self {
        Self {
            sink,
            stop_timeout,
            worker: Mutex::new(None),
        }
    }

    /// Start replaying `source`, stopping any replay already running
    pub fn start(&self, source: &ReplaySource, speed: f64, looping: bool) -> Result<()> {
        source.check_pacing(speed)?;
        self.stop();

        let source = source.clone();
        let sink = Arc::clone(&self.sink);
        let worker = Worker::spawn("can-replay", move |token| {
            log::info!("Replay started ({} events)", source.len());
            let mut emitted = 0u64;
            for frame in source.replay_with_token(speed, looping, Arc::clone(&token)) {
                if !token.deliver(|| sink.on_frame(frame)) {
                    break;
                }
                emitted += 1;
            }
            log::info!("Replay finished after {} frames", emitted);
        })?;

        let displaced = self.worker.lock().replace(worker);
        if let Some(mut previous) = displaced {
            previous.stop(self.stop_timeout);
        }
        Ok(())
    }

    /// Stop the running replay; no-op when idle
    ///
    /// May be called from the sink callback of the replay itself.
    pub fn stop(&self) {
        let running = self.worker.lock().take();
        if let Some(mut worker) = running {
            worker.stop(self.stop_timeout);
        }
    }

    /// True while a replay is still emitting
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

impl Drop for ReplayPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
