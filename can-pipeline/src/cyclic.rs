//! Cyclic transmit jobs
//!
//! A registry of periodic transmit tasks, one per message name. Each job runs
//! on its own worker, encodes a snapshot of the signal values taken when the
//! job was set and sends it every period. Replacing a job stops the old worker
//! before the new one starts, so two timers never fire for the same name.

use crate::bus::FrameSender;
use crate::signals::{DatabaseSlot, FrameCodec};
use crate::types::{PipelineError, Result, SignalValues};
use crate::worker::Worker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Description of one periodic transmit job
#[derive(Debug, Clone, PartialEq)]
pub struct TxJob {
    pub message_name: String,
    pub signal_values: SignalValues,
    pub period_ms: u64,
    pub running: bool,
}

struct JobHandle {
    job: TxJob,
    worker: Worker,
    sent: Arc<AtomicU64>,
}

/// Encode `values` for `message_name` and send it once
pub fn encode_and_send(
    database: &DatabaseSlot,
    sender: &dyn FrameSender,
    message_name: &str,
    values: &SignalValues,
) -> Result<()> {
    let db = database.current().ok_or_else(|| {
        PipelineError::ConfigurationError("no signal database loaded".to_string())
    })?;
    let message = db
        .message_by_name(message_name)
        .ok_or_else(|| PipelineError::UnknownMessageError(message_name.to_string()))?;
    let payload = db.encode(message_name, values)?;
    sender.send(message.id, &payload, message.extended)
}

/// Registry of named periodic transmit jobs
pub struct CyclicTransmitSet {
    database: DatabaseSlot,
    sender: Arc<dyn FrameSender>,
    stop_timeout: Duration,
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl CyclicTransmitSet {
    pub fn new(database: DatabaseSlot, sender: Arc<dyn FrameSender>, stop_timeout: Duration) -> Self {
        Self {
            database,
            sender,
            stop_timeout,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start, replace or cancel the job for `name`
    ///
    /// With `active`, any existing job for `name` is cancelled first and a new
    /// one starts sending a snapshot of `values` every `period_ms`. Without
    /// `active`, the job is cancelled and removed; unknown names are ignored.
    pub fn set_job(&self, name: &str, values: &SignalValues, period_ms: u64, active: bool) -> Result<()> {
        if !active {
            self.cancel(name);
            return Ok(());
        }
        if period_ms == 0 {
            return Err(PipelineError::ConfigurationError(format!(
                "period of cyclic job '{}' must be positive",
                name
            )));
        }

        let mut jobs = self.jobs.lock();
        if let Some(mut previous) = jobs.remove(name) {
            previous.worker.stop(self.stop_timeout);
            log::debug!("Replaced cyclic job '{}'", name);
        }

        let job = TxJob {
            message_name: name.to_string(),
            signal_values: values.clone(),
            period_ms,
            running: true,
        };
        let sent = Arc::new(AtomicU64::new(0));
        let worker = self.spawn(job.clone(), Arc::clone(&sent))?;
        log::info!("Cyclic job '{}' started ({} ms)", name, period_ms);
        jobs.insert(name.to_string(), JobHandle { job, worker, sent });
        Ok(())
    }

    fn spawn(&self, job: TxJob, sent: Arc<AtomicU64>) -> std::io::Result<Worker> {
        let database = self.database.clone();
        let sender = Arc::clone(&self.sender);
        let period = Duration::from_millis(job.period_ms);

        Worker::spawn(format!("can-tx-{}", job.message_name), move |token| {
            let mut next_tick = Instant::now();
            loop {
                let result = token.deliver(|| {
                    match encode_and_send(&database, sender.as_ref(), &job.message_name, &job.signal_values) {
                        Ok(()) => {
                            sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => log::warn!("Cyclic job '{}' skipped a tick: {}", job.message_name, e),
                    }
                });
                if !result {
                    return;
                }

                next_tick += period;
                let now = Instant::now();
                if next_tick < now {
                    // Overran by more than a period; restart the schedule
                    next_tick = now;
                }
                if !token.sleep_until(next_tick) {
                    return;
                }
            }
        })
    }

    fn cancel(&self, name: &str) {
        if let Some(mut handle) = self.jobs.lock().remove(name) {
            handle.worker.stop(self.stop_timeout);
            log::info!(
                "Cyclic job '{}' stopped after {} sends",
                name,
                handle.sent.load(Ordering::Relaxed)
            );
        }
    }

    /// Cancel every job
    pub fn stop_all(&self) {
        let drained: Vec<(String, JobHandle)> = self.jobs.lock().drain().collect();
        for (name, mut handle) in drained {
            handle.worker.stop(self.stop_timeout);
            log::debug!("Cyclic job '{}' stopped", name);
        }
    }

    /// Encode and transmit a single frame
    pub fn send_once(&self, name: &str, values: &SignalValues) -> Result<()> {
        encode_and_send(&self.database, self.sender.as_ref(), name, values)?;
        log::info!("Sent {}", name);
        Ok(())
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.jobs.lock().contains_key(name)
    }

    /// All jobs, sorted by message name
    pub fn jobs(&self) -> Vec<TxJob> {
        let mut jobs: Vec<TxJob> = self.jobs.lock().values().map(|h| h.job.clone()).collect();
        jobs.sort_by(|a, b| a.message_name.cmp(&b.message_name));
        jobs
    }

    /// Successful sends of the job for `name`
    pub fn sends(&self, name: &str) -> Option<u64> {
        self.jobs
            .lock()
            .get(name)
            .map(|h| h.sent.load(Ordering::Relaxed))
    }
}

impl Drop for CyclicTransmitSet {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::database::tests::engine_data;
    use crate::signals::SignalDatabase;

    /// Records send times
    #[derive(Default)]
    struct RecordingSender {
        sends: Mutex<Vec<(Instant, u32, Vec<u8>)>>,
    }

    impl FrameSender for RecordingSender {
        fn send(&self, id: u32, payload: &[u8], _extended: bool) -> Result<()> {
            self.sends.lock().push((Instant::now(), id, payload.to_vec()));
            Ok(())
        }
    }

    fn setup() -> (CyclicTransmitSet, Arc<RecordingSender>) {
        let slot = DatabaseSlot::new();
        slot.load(SignalDatabase::from_messages(vec![engine_data()]));
        let sender = Arc::new(RecordingSender::default());
        let set = CyclicTransmitSet::new(slot, sender.clone(), Duration::from_secs(1));
        (set, sender)
    }

    fn values(speed: f64) -> SignalValues {
        SignalValues::from([("Speed".to_string(), speed)])
    }

    #[test]
    fn test_zero_period_rejected() {
        let (set, _) = setup();
        assert!(matches!(
            set.set_job("EngineData", &values(1.0), 0, true),
            Err(PipelineError::ConfigurationError(_))
        ));
        assert!(!set.is_active("EngineData"));
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let (set, _) = setup();
        assert!(set.set_job("Nothing", &SignalValues::new(), 10, false).is_ok());
        assert!(set.jobs().is_empty());
    }

    #[test]
    fn test_job_sends_snapshot() {
        let (set, sender) = setup();
        let mut edited = values(7.0);
        set.set_job("EngineData", &edited, 20, true).unwrap();
        edited.insert("Speed".to_string(), 99.0);

        std::thread::sleep(Duration::from_millis(70));
        set.set_job("EngineData", &edited, 20, false).unwrap();

        let sends = sender.sends.lock();
        assert!(sends.len() >= 2);
        assert!(sends.iter().all(|(_, id, payload)| *id == 0x123 && payload[0] == 7));
        assert!(set.jobs().is_empty());
    }

    #[test]
    fn test_encode_failure_keeps_job_alive() {
        let (set, sender) = setup();
        let bad = SignalValues::from([("Unknown".to_string(), 1.0)]);
        set.set_job("EngineData", &bad, 10, true).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert!(set.is_active("EngineData"));
        assert_eq!(set.sends("EngineData"), Some(0));
        assert!(sender.sends.lock().is_empty());
    }

    #[test]
    fn test_stop_all() {
        let (set, sender) = setup();
        set.set_job("EngineData", &values(1.0), 10, true).unwrap();
        set.set_job("Other", &values(1.0), 10, true).unwrap();
        assert_eq!(set.jobs().len(), 2);

        set.stop_all();
        assert!(set.jobs().is_empty());
        let count = sender.sends.lock().len();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sender.sends.lock().len(), count);
    }

    #[test]
    fn test_send_once() {
        let (set, sender) = setup();
        set.send_once("EngineData", &values(3.0)).unwrap();
        assert_eq!(sender.sends.lock().len(), 1);
        assert!(matches!(
            set.send_once("Missing", &SignalValues::new()),
            Err(PipelineError::UnknownMessageError(_))
        ));
    }
}
