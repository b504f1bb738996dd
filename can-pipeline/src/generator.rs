//! Virtual frame generator
//!
//! Synthesizes frames for the messages of the loaded database so the rest of
//! the pipeline can run without a bus. Each cycle sweeps the selected messages
//! once, encodes synthesized signal values and delivers the frames to the
//! shared sink, then sleeps for one period.

use crate::signals::{DatabaseSlot, FrameCodec, MessageDefinition, SignalDefinition};
use crate::sink::SharedSink;
use crate::types::{Frame, Result, SignalValues};
use crate::worker::Worker;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Counter values wrap at this modulus
const COUNTER_MODULUS: u64 = 1000;

/// Width of the random range when a signal declares no bounds
const DEFAULT_RANDOM_SPAN: f64 = 100.0;

/// How signal values are synthesized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    /// Uniform random values within the signal bounds
    Random,
    /// Per-signal counter incremented each cycle, modulo 1000
    Counter,
}

impl SynthesisMode {
    pub fn from_randomize(randomize: bool) -> Self {
        if randomize {
            SynthesisMode::Random
        } else {
            SynthesisMode::Counter
        }
    }
}

/// Active generator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorSettings {
    pub period: Duration,
    /// Message names to synthesize; empty means all
    pub messages: HashSet<String>,
    pub mode: SynthesisMode,
}

/// Produces values for one sweep; owns the per-signal counters
struct Synthesizer {
    mode: SynthesisMode,
    counters: HashMap<(String, String), u64>,
}

impl Synthesizer {
    fn new(mode: SynthesisMode) -> Self {
        Self {
            mode,
            counters: HashMap::new(),
        }
    }

    fn values_for(&mut self, message: &MessageDefinition) -> SignalValues {
        let mut rng = rand::rng();
        message
            .signals
            .iter()
            .map(|signal| {
                let value = match self.mode {
                    SynthesisMode::Random => random_value(&mut rng, signal),
                    SynthesisMode::Counter => {
                        let key = (message.name.clone(), signal.name.clone());
                        let step = self.counters.entry(key).or_insert(0);
                        let value = *step as f64;
                        *step = (*step + 1) % COUNTER_MODULUS;
                        value
                    }
                };
                (signal.name.clone(), value)
            })
            .collect()
    }
}

/// Uniform value within the signal bounds, or `[0, min + 100]` when undefined,
/// limited to what the signal's bit width can carry
fn random_value<R: Rng>(rng: &mut R, signal: &SignalDefinition) -> f64 {
    let (low, high) = signal
        .bounds()
        .unwrap_or((0.0, signal.min + DEFAULT_RANDOM_SPAN));
    let (phys_low, phys_high) = signal.physical_range();
    let low = low.clamp(phys_low, phys_high);
    let high = high.clamp(phys_low, phys_high);

    if high > low {
        rng.random_range(low..=high)
    } else {
        low
    }
}

/// Background synthesizer feeding the shared sink
pub struct VirtualGenerator {
    database: DatabaseSlot,
    sink: SharedSink,
    min_period: Duration,
    stop_timeout: Duration,
    state: Mutex<Option<(Worker, GeneratorSettings)>>,
}

impl VirtualGenerator {
    pub fn new(
        database: DatabaseSlot,
        sink: SharedSink,
        min_period: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            database,
            sink,
            min_period,
            stop_timeout,
            state: Mutex::new(None),
        }
    }

    /// Start synthesizing; a running generator is stopped first
    ///
    /// `period_ms` is clamped to the configured minimum. An empty `messages`
    /// selects every message of the database.
    pub fn start<I, S>(&self, period_ms: u64, messages: I, randomize: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let settings = GeneratorSettings {
            period: Duration::from_millis(period_ms).max(self.min_period),
            messages: messages.into_iter().map(Into::into).collect(),
            mode: SynthesisMode::from_randomize(randomize),
        };

        // Not under `state`: the old worker's delivery may re-enter `stop`
        self.stop();

        let worker = self.spawn(settings.clone())?;
        log::info!(
            "Virtual generator running every {:?} for {} messages ({:?})",
            settings.period,
            if settings.messages.is_empty() {
                "all".to_string()
            } else {
                settings.messages.len().to_string()
            },
            settings.mode
        );
        let displaced = self.state.lock().replace((worker, settings));
        if let Some((mut worker, _)) = displaced {
            worker.stop(self.stop_timeout);
        }
        Ok(())
    }

    fn spawn(&self, settings: GeneratorSettings) -> std::io::Result<Worker> {
        let database = self.database.clone();
        let sink = Arc::clone(&self.sink);

        Worker::spawn("can-virtual", move |token| {
            let mut synthesizer = Synthesizer::new(settings.mode);

            loop {
                if let Some(db) = database.current() {
                    for message in db.messages() {
                        if !settings.messages.is_empty() && !settings.messages.contains(&message.name) {
                            continue;
                        }
                        let Some(frame) = synthesize(db.as_ref(), message, &mut synthesizer) else {
                            continue;
                        };
                        if !token.deliver(|| sink.on_frame(frame)) {
                            return;
                        }
                    }
                } else {
                    log::trace!("No database loaded, generator idle");
                }

                if !token.sleep(settings.period) {
                    return;
                }
            }
        })
    }

    /// Stop the generator; no frame is delivered after this returns
    pub fn stop(&self) {
        let running = self.state.lock().take();
        if let Some((mut worker, _)) = running {
            worker.stop(self.stop_timeout);
            log::info!("Virtual generator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Settings of the running generator
    pub fn settings(&self) -> Option<GeneratorSettings> {
        self.state.lock().as_ref().map(|(_, settings)| settings.clone())
    }
}

impl Drop for VirtualGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build one frame for `message`; failures are logged and skipped
fn synthesize(
    codec: &dyn FrameCodec,
    message: &MessageDefinition,
    synthesizer: &mut Synthesizer,
) -> Option<Frame> {
    let values = synthesizer.values_for(message);
    let payload = match codec.encode(&message.name, &values) {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("Skipping synthesized {}: {}", message.name, e);
            return None;
        }
    };
    match Frame::now(message.id, payload, message.extended) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::warn!("Skipping synthesized {}: {}", message.name, e);
            None
        }
    }
}
