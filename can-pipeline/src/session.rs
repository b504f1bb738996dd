//! Session orchestration
//!
//! A [`Session`] wires the frame sources, the signal database, the receive
//! history, the recorder and the cyclic transmit jobs together. Every source
//! feeds the same fan-out sink, which decodes each frame against the current
//! database, stores it in the history, records it if a recording is open and
//! finally forwards it to the observer.
//!
//! Only one frame source may be active at a time; starting a second one fails
//! with [`PipelineError::SourceConflictError`].

use crate::bus::{BusController, BusStats};
use crate::config::{BusConfig, PipelineConfig};
use crate::cyclic::{CyclicTransmitSet, TxJob};
use crate::generator::{GeneratorSettings, VirtualGenerator};
use crate::history::RxHistory;
use crate::recording::{ReplayPlayer, ReplaySource, SessionRecorder};
use crate::signals::{DatabaseSlot, DatabaseStats, FrameCodec, SignalDatabase};
use crate::sink::{FrameSink, SharedSink};
use crate::transport::Connector;
use crate::types::{DecodedFrame, Frame, FrameSourceKind, PipelineError, Result, SignalValues};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Consumer of decoded frames
pub trait FrameObserver: Send + Sync {
    fn on_decoded(&self, frame: &DecodedFrame);
}

impl<F> FrameObserver for F
where
    F: Fn(&DecodedFrame) + Send + Sync,
{
    fn on_decoded(&self, frame: &DecodedFrame) {
        self(frame)
    }
}

type SharedObserver = Arc<dyn FrameObserver>;

/// The sink every source delivers into
struct FanOut {
    database: DatabaseSlot,
    history: RxHistory,
    recorder: SessionRecorder,
    observer: RwLock<Option<SharedObserver>>,
}

impl FrameSink for FanOut {
    fn on_frame(&self, frame: Frame) {
        let decoded = match self.database.current() {
            Some(db) => db.decode_frame(&frame),
            None => DecodedFrame::raw(frame),
        };

        self.history.append(decoded.clone());

        if let Err(e) = self.recorder.record(&decoded.frame) {
            log::warn!("Failed to record frame: {}", e);
        }

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_decoded(&decoded);
        }
    }
}

/// Top-level handle over one pipeline
pub struct Session {
    config: PipelineConfig,
    database: DatabaseSlot,
    fan_out: Arc<FanOut>,
    bus: Arc<BusController>,
    generator: VirtualGenerator,
    replay: ReplayPlayer,
    cyclic: CyclicTransmitSet,
    /// Serializes the claim-then-start of a source
    control: Mutex<()>,
}

impl Session {
    /// Build a session whose bus connects through `connector`
    pub fn new(connector: Arc<dyn Connector>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let database = DatabaseSlot::new();
        let fan_out = Arc::new(FanOut {
            database: database.clone(),
            history: RxHistory::new(config.history_capacity),
            recorder: SessionRecorder::new(),
            observer: RwLock::new(None),
        });
        let sink: SharedSink = fan_out.clone();

        let bus = Arc::new(BusController::new(connector, Arc::clone(&sink), &config));
        let generator = VirtualGenerator::new(
            database.clone(),
            Arc::clone(&sink),
            config.min_generator_period(),
            config.stop_timeout(),
        );
        let replay = ReplayPlayer::new(sink, config.stop_timeout());
        let cyclic = CyclicTransmitSet::new(database.clone(), bus.clone(), config.stop_timeout());

        Ok(Self {
            config,
            database,
            fan_out,
            bus,
            generator,
            replay,
            cyclic,
            control: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ---- Signal database ----

    /// Load a DBC file, replacing the current database
    pub fn load_dbc(&self, path: &Path) -> Result<DatabaseStats> {
        let db = SignalDatabase::from_dbc_file(path)?;
        let stats = db.stats();
        self.database.load(db);
        log::info!(
            "Loaded {:?}: {} messages, {} signals",
            path,
            stats.num_messages,
            stats.num_signals
        );
        Ok(stats)
    }

    /// Drop the database; the generator and all cyclic jobs stop with it
    pub fn unload_dbc(&self) {
        self.generator.stop();
        self.cyclic.stop_all();
        self.database.unload();
        log::info!("Signal database unloaded");
    }

    pub fn database(&self) -> Option<Arc<SignalDatabase>> {
        self.database.current()
    }

    // ---- Frame sources ----

    /// Source currently feeding the sink
    ///
    /// A replay that ran to completion no longer counts as active.
    pub fn active_source(&self) -> Option<FrameSourceKind> {
        if self.bus.is_open() {
            Some(FrameSourceKind::Bus)
        } else if self.generator.is_running() {
            Some(FrameSourceKind::Virtual)
        } else if self.replay.is_running() {
            Some(FrameSourceKind::Replay)
        } else {
            None
        }
    }

    fn claim(&self, requested: FrameSourceKind) -> Result<()> {
        match self.active_source() {
            Some(active) if active != requested => {
                Err(PipelineError::SourceConflictError { active, requested })
            }
            _ => Ok(()),
        }
    }

    /// Open the bus and start receiving
    pub fn connect(&self, config: &BusConfig) -> Result<()> {
        let _guard = self.control.lock();
        self.claim(FrameSourceKind::Bus)?;
        self.bus.open(config)
    }

    /// Close the bus; no-op when not connected
    pub fn disconnect(&self) {
        self.bus.close();
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_open()
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Start the virtual generator; a DBC must be loaded
    pub fn start_virtual<I, S>(&self, period_ms: u64, messages: I, randomize: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // Not under `control`: the old worker's observer may re-enter the session
        self.generator.stop();

        let _guard = self.control.lock();
        self.claim(FrameSourceKind::Virtual)?;
        if !self.database.is_loaded() {
            return Err(PipelineError::ConfigurationError(
                "load a DBC before starting the virtual generator".to_string(),
            ));
        }
        self.generator.start(period_ms, messages, randomize)
    }

    pub fn stop_virtual(&self) {
        self.generator.stop();
    }

    pub fn generator_settings(&self) -> Option<GeneratorSettings> {
        self.generator.settings()
    }

    /// Load a recording and replay it into the sink
    ///
    /// Returns the number of events in the recording.
    pub fn start_replay(&self, path: &Path, speed: f64, looping: bool) -> Result<usize> {
        let source = ReplaySource::load(path)?;
        self.play(&source, speed, looping)?;
        Ok(source.len())
    }

    /// Replay a recording already in memory
    pub fn play(&self, source: &ReplaySource, speed: f64, looping: bool) -> Result<()> {
        self.replay.stop();

        let _guard = self.control.lock();
        self.claim(FrameSourceKind::Replay)?;
        self.replay.start(source, speed, looping)
    }

    pub fn stop_replay(&self) {
        self.replay.stop();
    }

    // ---- Recording ----

    /// Record every observed frame to `path`
    pub fn start_recording(&self, path: &Path) -> Result<()> {
        self.fan_out.recorder.open(path)
    }

    /// Record into a new timestamped file inside `dir`
    pub fn start_recording_in(&self, dir: &Path) -> Result<PathBuf> {
        self.fan_out.recorder.open_in_dir(dir)
    }

    pub fn stop_recording(&self) {
        self.fan_out.recorder.close();
    }

    pub fn recording_path(&self) -> Option<PathBuf> {
        self.fan_out.recorder.path()
    }

    // ---- Transmit ----

    /// Encode and send one message on the bus
    pub fn send_message(&self, name: &str, values: &SignalValues) -> Result<()> {
        self.cyclic.send_once(name, values)
    }

    /// Start, replace or cancel the cyclic job for `name`
    pub fn set_cyclic(&self, name: &str, values: &SignalValues, period_ms: u64, active: bool) -> Result<()> {
        self.cyclic.set_job(name, values, period_ms, active)
    }

    pub fn cyclic_jobs(&self) -> Vec<TxJob> {
        self.cyclic.jobs()
    }

    // ---- Observation ----

    /// Newest-first copy of the receive history
    pub fn history(&self) -> Vec<DecodedFrame> {
        self.fan_out.history.snapshot()
    }

    /// History entry at `index`, 0 being the newest
    pub fn selected(&self, index: usize) -> Option<DecodedFrame> {
        self.fan_out.history.get(index)
    }

    pub fn clear_history(&self) {
        self.fan_out.history.clear();
    }

    /// Receive every decoded frame after it has been stored
    pub fn set_observer(&self, observer: impl FrameObserver + 'static) {
        *self.fan_out.observer.write() = Some(Arc::new(observer));
    }

    pub fn clear_observer(&self) {
        *self.fan_out.observer.write() = None;
    }

    /// Stop every source and job and close the recording
    ///
    /// Sources may be stopped from inside the observer callback.
    pub fn shutdown(&self) {
        self.replay.stop();
        self.generator.stop();
        self.cyclic.stop_all();
        self.bus.close();
        self.fan_out.recorder.close();
        log::info!("Session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordedEvent;
    use crate::signals::dbc::tests::VEHICLE_DBC;
    use crate::transport::VirtualBus;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn session_with_dbc() -> (Session, TempDir) {
        let dir = TempDir::new().unwrap();
        let dbc = dir.path().join("vehicle.dbc");
        fs::write(&dbc, VEHICLE_DBC).unwrap();

        let session = Session::new(Arc::new(VirtualBus::new()), PipelineConfig::new()).unwrap();
        session.load_dbc(&dbc).unwrap();
        (session, dir)
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_virtual_requires_database() {
        let session = Session::new(Arc::new(VirtualBus::new()), PipelineConfig::new()).unwrap();
        assert!(matches!(
            session.start_virtual(10, Vec::<String>::new(), false),
            Err(PipelineError::ConfigurationError(_))
        ));
        assert_eq!(session.active_source(), None);
    }

    #[test]
    fn test_source_conflict() {
        let (session, _dir) = session_with_dbc();
        session.connect(&BusConfig::new()).unwrap();

        let result = session.start_virtual(10, ["EngineData"], false);
        assert!(matches!(
            result,
            Err(PipelineError::SourceConflictError {
                active: FrameSourceKind::Bus,
                requested: FrameSourceKind::Virtual,
            })
        ));

        session.disconnect();
        session.start_virtual(10, ["EngineData"], false).unwrap();
        assert_eq!(session.active_source(), Some(FrameSourceKind::Virtual));
        assert!(session.connect(&BusConfig::new()).is_err());
    }

    #[test]
    fn test_generated_frames_are_decoded_into_history() {
        let (session, _dir) = session_with_dbc();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::clone(&observed);
        session.set_observer(move |frame: &DecodedFrame| {
            collector.lock().push(frame.message_name.clone());
        });

        session.start_virtual(10, ["EngineData"], false).unwrap();
        assert!(wait_until(|| session.history().len() >= 2));
        session.stop_virtual();

        let newest = session.selected(0).unwrap();
        assert_eq!(newest.message_name.as_deref(), Some("EngineData"));
        assert!(newest.signals.contains_key("Speed"));
        assert!(observed
            .lock()
            .iter()
            .all(|name| name.as_deref() == Some("EngineData")));
    }

    #[test]
    fn test_unload_stops_generator() {
        let (session, _dir) = session_with_dbc();
        session.start_virtual(10, Vec::<String>::new(), true).unwrap();
        session.unload_dbc();

        assert!(session.database().is_none());
        assert_eq!(session.active_source(), None);
    }

    #[test]
    fn test_replay_is_recorded() {
        let (session, dir) = session_with_dbc();
        let output = dir.path().join("out.csv");
        session.start_recording(&output).unwrap();

        let source = ReplaySource::from_events(vec![
            RecordedEvent {
                timestamp: 0.0,
                id: 0x123,
                payload: vec![0x10, 0x00, 0x20, 0x00, 0, 0, 0, 0],
            },
            RecordedEvent {
                timestamp: 0.01,
                id: 0x7AB,
                payload: vec![0xFF],
            },
        ])
        .unwrap();
        session.play(&source, 1.0, false).unwrap();
        assert!(wait_until(|| session.active_source().is_none()));
        session.stop_recording();

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].frame.id(), 0x7AB);
        assert!(!history[0].is_decoded());
        assert_eq!(history[1].signals["Speed"], 16.0);

        let content = fs::read_to_string(&output).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    /// Installs an observer that runs `action` on the first frame only
    fn act_on_first_frame(session: &Arc<Session>, action: fn(&Session)) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let weak = Arc::downgrade(session);
        session.set_observer(move |_frame: &DecodedFrame| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(session) = weak.upgrade() {
                    action(&session);
                }
            }
        });
        calls
    }

    /// Run `f` on another thread, failing the test if it does not return in time
    fn within<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("session call did not return")
    }

    #[test]
    fn test_observer_can_stop_replay() {
        let (session, _dir) = session_with_dbc();
        let session = Arc::new(session);
        let calls = act_on_first_frame(&session, |session| session.stop_replay());

        let source = ReplaySource::from_events(vec![
            RecordedEvent {
                timestamp: 0.0,
                id: 0x123,
                payload: vec![0; 8],
            },
            RecordedEvent {
                timestamp: 0.001,
                id: 0x123,
                payload: vec![0; 8],
            },
        ])
        .unwrap();
        session.play(&source, 1.0, true).unwrap();
        assert!(wait_until(|| calls.load(Ordering::SeqCst) > 0));

        let remote = Arc::clone(&session);
        let active = within(move || {
            remote.stop_replay();
            remote.active_source()
        });
        assert_eq!(active, None);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_can_shut_down_session() {
        let (session, _dir) = session_with_dbc();
        let session = Arc::new(session);
        let calls = act_on_first_frame(&session, |session| session.shutdown());

        session.start_virtual(10, ["EngineData"], false).unwrap();
        assert!(wait_until(|| calls.load(Ordering::SeqCst) > 0));

        let remote = Arc::clone(&session);
        assert_eq!(within(move || remote.active_source()), None);

        // The session is usable again afterwards
        let before = calls.load(Ordering::SeqCst);
        let remote = Arc::clone(&session);
        within(move || remote.start_virtual(10, ["EngineData"], false)).unwrap();
        assert!(wait_until(|| calls.load(Ordering::SeqCst) > before));
        let remote = Arc::clone(&session);
        within(move || remote.stop_virtual());
    }

    #[test]
    fn test_send_requires_connection() {
        let (session, _dir) = session_with_dbc();
        let values = SignalValues::from([("Speed".to_string(), 10.0)]);
        assert!(matches!(
            session.send_message("EngineData", &values),
            Err(PipelineError::NotConnectedError)
        ));
        session.connect(&BusConfig::new()).unwrap();
        session.send_message("EngineData", &values).unwrap();
        assert_eq!(session.bus_stats().frames_sent, 1);
    }

    #[test]
    fn test_shutdown_stops_cyclic_jobs() {
        let (session, _dir) = session_with_dbc();
        session.connect(&BusConfig::new()).unwrap();
        session
            .set_cyclic("EngineData", &SignalValues::new(), 10, true)
            .unwrap();
        assert_eq!(session.cyclic_jobs().len(), 1);

        session.shutdown();
        assert!(session.cyclic_jobs().is_empty());
        assert!(!session.is_connected());
    }
}
