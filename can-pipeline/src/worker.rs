//! Background worker lifecycle
//!
//! Every producer in the pipeline runs on its own thread. A [`CancelToken`]
//! carries the stop request: workers sleep on it (so cancellation wakes them
//! immediately) and deliver frames through it (so cancellation waits for an
//! in-flight delivery and no delivery starts afterwards). [`Worker`] pairs the
//! token with the thread handle and a bounded join.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Polling step while waiting for a cancelled thread to exit
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    /// Thread currently inside [`CancelToken::deliver`]
    delivering: Option<ThreadId>,
}

/// Cooperative cancellation flag with interruptible sleep
#[derive(Default)]
pub struct CancelToken {
    state: Mutex<TokenState>,
    wakeup: Condvar,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request cancellation
    ///
    /// Blocks until a delivery running under [`CancelToken::deliver`] on another
    /// thread has returned. Called from inside a delivery it returns at once;
    /// the delivering thread finishes its callback and delivers nothing more.
    pub fn cancel(&self) {
        let current = thread::current().id();
        let mut state = self.state.lock();
        state.cancelled = true;
        self.wakeup.notify_all();
        while state.delivering.is_some_and(|id| id != current) {
            self.wakeup.wait(&mut state);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Sleep for `duration` or until cancelled
    ///
    /// Returns false if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        match Instant::now().checked_add(duration) {
            Some(deadline) => self.sleep_until(deadline),
            None => self.wait_cancelled(),
        }
    }

    /// Sleep until `deadline` or until cancelled
    ///
    /// Returns false if the token was cancelled.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while !state.cancelled {
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !state.cancelled
    }

    fn wait_cancelled(&self) -> bool {
        let mut state = self.state.lock();
        while !state.cancelled {
            self.wakeup.wait(&mut state);
        }
        false
    }

    /// Run `f` unless cancelled, holding off cancellation while it runs
    ///
    /// Returns false (without running `f`) if the token was cancelled.
    pub fn deliver<F: FnOnce()>(&self, f: F) -> bool {
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return false;
            }
            state.delivering = Some(thread::current().id());
        }
        let _delivery = Delivery(self);
        f();
        true
    }
}

/// Clears the in-flight marker, also when the callback panics
struct Delivery<'a>(&'a CancelToken);

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.delivering = None;
        self.0.wakeup.notify_all();
    }
}

/// A named background thread with a cancellation token
pub struct Worker {
    name: String,
    token: Arc<CancelToken>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread running `body` with its cancellation token
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Arc<CancelToken>) + Send + 'static,
    {
        let name = name.into();
        let token = CancelToken::new();
        let thread_token = Arc::clone(&token);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(thread_token))?;

        log::debug!("Worker '{}' started", name);
        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &Arc<CancelToken> {
        &self.token
    }

    /// True once the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel the worker and wait up to `timeout` for its thread to exit
    ///
    /// Returns false if the thread was still running at the deadline; it is
    /// then detached. Either way the worker delivers nothing after this
    /// returns, since delivery goes through the cancelled token.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.token.cancel();

        let Some(handle) = self.handle.take() else {
            return true;
        };

        // Stopped from inside its own delivery: the body exits once the
        // callback returns, so there is nothing to wait for
        if handle.thread().id() == thread::current().id() {
            log::debug!("Worker '{}' stopped from its own thread", self.name);
            return true;
        }

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Worker '{}' did not stop within {:?}, detaching",
                    self.name,
                    timeout
                );
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if handle.join().is_err() {
            log::error!("Worker '{}' panicked", self.name);
        }
        log::debug!("Worker '{}' stopped", self.name);
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sleep_is_interrupted_by_cancel() {
        let token = CancelToken::new();
        let sleeper = Arc::clone(&token);
        let started = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(!handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_sleep_runs_to_deadline() {
        let token = CancelToken::new();
        let started = Instant::now();
        assert!(token.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_no_delivery_after_cancel() {
        let token = CancelToken::new();
        assert!(token.deliver(|| {}));
        token.cancel();
        assert!(!token.deliver(|| panic!("must not run")));
    }

    #[test]
    fn test_worker_stop_is_bounded() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut worker = Worker::spawn("test-worker", move |token| {
            while token.sleep(Duration::from_millis(5)) {
                token.deliver(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(worker.stop(Duration::from_secs(1)));
        assert!(worker.is_finished());

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);

        // Stopping twice is harmless
        assert!(worker.stop(Duration::from_secs(1)));
    }

    #[test]
    fn test_cancel_inside_delivery_returns() {
        let token = CancelToken::new();
        let inner = Arc::clone(&token);
        assert!(token.deliver(|| inner.cancel()));
        assert!(token.is_cancelled());
        assert!(!token.deliver(|| panic!("must not run")));
    }

    #[test]
    fn test_cancel_waits_for_delivery_on_other_thread() {
        let token = CancelToken::new();
        let delivering = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let worker_token = Arc::clone(&token);
        let flag = Arc::clone(&delivering);
        let handle = thread::spawn(move || {
            worker_token.deliver(|| {
                flag.store(1, Ordering::SeqCst);
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                flag.store(2, Ordering::SeqCst);
            })
        });

        entered_rx.recv().unwrap();
        token.cancel();
        assert_eq!(delivering.load(Ordering::SeqCst), 2);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_worker_stopped_from_its_own_delivery() {
        let slot: Arc<Mutex<Option<Worker>>> = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let late = Arc::new(AtomicUsize::new(0));

        let own = Arc::clone(&slot);
        let counter = Arc::clone(&late);
        let mut stopped = false;
        let worker = Worker::spawn("self-stop", move |token| {
            while token.sleep(Duration::from_millis(2)) {
                token.deliver(|| {
                    if stopped {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    let worker = own.lock().take();
                    if let Some(mut worker) = worker {
                        stopped = true;
                        done_tx.send(worker.stop(Duration::from_secs(1))).unwrap();
                    }
                });
            }
        })
        .unwrap();
        *slot.lock() = Some(worker);

        let stopped = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(stopped);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }
}
