//! Acquisition loop: one dedicated OS thread per stage
//!
//! The worker repeatedly fetches one item from its source with a bounded
//! wait, processes it, and polls the stop and flush flags once per
//! iteration. Flushes run on the worker thread so that resources it owns
//! (device buffers, output files) are never touched from the caller's thread.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use super::errors::ErrorReporter;
use super::queue::WaitStatus;
use super::signal::Signal;
use super::stage::ImageQueue;
use crate::error::StageError;
use crate::utils::{self, ThreadPriority};

/// Result of one bounded fetch from a stage's source
#[derive(Debug)]
pub enum Fetch<T> {
    Item(T),
    /// Nothing arrived in time; loop again
    Timeout,
    /// The source reported a failure; recorded, followed by a backoff sleep
    Failed(String),
}

/// Stage-specific half of the acquisition loop.
pub trait StageWorker: Send + 'static {
    type Input: Send;

    /// Wait up to `timeout` for the next input item.
    fn fetch(&mut self, timeout: Duration) -> Fetch<Self::Input>;

    /// Handle one item. Failures are reported on `errors`; the loop goes on.
    fn process(&mut self, input: Self::Input, errors: &mut ErrorReporter);

    /// Discard in-flight state on the worker thread, upstream included.
    /// Returns false if the flush failed (details go to `errors`).
    fn flush(&mut self, _errors: &mut ErrorReporter) -> bool {
        true
    }

    /// Called once on the worker thread after the loop exits.
    fn finish(&mut self) {}
}

/// Fetch one item from an upstream stage: wait for it, then pop it.
pub fn fetch_upstream<Q>(upstream: &Q, timeout: Duration) -> Fetch<Q::Item>
where
    Q: ImageQueue + ?Sized,
{
    match upstream.wait_images(1, timeout) {
        WaitStatus::Satisfied => match upstream.get_image() {
            Some(item) => Fetch::Item(item),
            None => Fetch::Failed(
                "Wait operation succeeded but the queue pop operation failed.".into(),
            ),
        },
        WaitStatus::TimedOut => Fetch::Timeout,
        WaitStatus::Failed => Fetch::Failed("Queue wait operation failed.".into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    Flushing = 2,
    Stopping = 3,
    Stopped = 4,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Flushing,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Bound on each fetch; also the worst-case stop latency
    pub wait_timeout: Duration,
    /// Sleep after a failed fetch, to avoid a hot spin
    pub error_backoff: Duration,
    pub priority: ThreadPriority,
    pub core: Option<usize>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_millis(1),
            priority: ThreadPriority::Normal,
            core: None,
        }
    }
}

/// Flags shared between the owning stage and its worker thread
struct LoopControl {
    stop: AtomicBool,
    flush: AtomicBool,
    flush_ok: AtomicBool,
    flush_done: Signal,
    state: AtomicU8,
}

impl LoopControl {
    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Handle to a running acquisition loop.
pub struct AcquisitionLoop {
    name: String,
    control: Arc<LoopControl>,
    handle: Option<JoinHandle<()>>,
    exited: flume::Receiver<()>,
}

impl AcquisitionLoop {
    pub fn spawn<W: StageWorker>(
        name: impl Into<String>,
        worker: W,
        errors: ErrorReporter,
        options: LoopOptions,
    ) -> Result<Self, StageError> {
        let name = name.into();
        let control = Arc::new(LoopControl {
            stop: AtomicBool::new(false),
            flush: AtomicBool::new(false),
            flush_ok: AtomicBool::new(true),
            flush_done: Signal::new(),
            state: AtomicU8::new(LoopState::Idle as u8),
        });
        let (exit_tx, exited) = flume::bounded(1);

        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                run(worker, &thread_control, errors, &options);
                let _ = exit_tx.send(());
            })
            .map_err(|source| StageError::ThreadSpawn {
                stage: name.clone(),
                source,
            })?;

        info!(stage = %name, "Worker started");

        Ok(Self {
            name,
            control,
            handle: Some(handle),
            exited,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.control.state.load(Ordering::Acquire))
    }

    /// True until the worker thread has exited.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the worker to flush and wait for it to report completion.
    pub fn flush(&self, timeout: Duration) -> Result<(), StageError> {
        if !self.is_running() {
            return Err(StageError::NotRunning {
                stage: self.name.clone(),
            });
        }

        self.control.flush_done.reset();
        self.control.flush.store(true, Ordering::Release);

        if !self.control.flush_done.take(timeout) {
            return Err(StageError::FlushTimeout {
                stage: self.name.clone(),
                timeout,
            });
        }

        if self.control.flush_ok.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StageError::FlushFailed {
                stage: self.name.clone(),
            })
        }
    }

    /// Set the stop flag and join the worker within `timeout`.
    ///
    /// On timeout the thread is detached and reported; it only holds
    /// reference-counted state, so it cannot outlive anything it touches.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), StageError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.control.stop.store(true, Ordering::Release);

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {}
            Err(flume::RecvTimeoutError::Timeout) => {
                error!(stage = %self.name, ?timeout, "Worker thread does not respond");
                return Err(StageError::ShutdownTimeout {
                    stage: self.name.clone(),
                    timeout,
                });
            }
        }

        handle.join().map_err(|_| StageError::WorkerPanicked {
            stage: self.name.clone(),
        })?;

        info!(stage = %self.name, "Worker stopped");
        Ok(())
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if let Err(e) = self.stop(Duration::from_secs(10)) {
            error!("{}", e);
        }
    }
}

fn run<W: StageWorker>(
    mut worker: W,
    control: &LoopControl,
    mut errors: ErrorReporter,
    options: &LoopOptions,
) {
    utils::configure_current_thread(options.priority, options.core);
    control.set_state(LoopState::Running);

    while !control.stop.load(Ordering::Acquire) {
        if control.flush.swap(false, Ordering::AcqRel) {
            control.set_state(LoopState::Flushing);
            let ok = worker.flush(&mut errors);
            debug!(stage = errors.stage(), ok, "Flush complete");
            control.flush_ok.store(ok, Ordering::Release);
            control.flush_done.set();
            control.set_state(LoopState::Running);
        }

        match worker.fetch(options.wait_timeout) {
            Fetch::Item(input) => worker.process(input, &mut errors),
            Fetch::Timeout => {}
            // aborted buffers surface as failures while a flush is pending
            Fetch::Failed(_) if control.flush.load(Ordering::Acquire) => {}
            Fetch::Failed(message) => {
                errors.report(message);
                thread::sleep(options.error_backoff);
            }
        }
    }

    control.set_state(LoopState::Stopping);
    worker.finish();
    control.set_state(LoopState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::errors;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Produces `Timeout` forever, counts flushes
    struct IdleWorker {
        flushes: Arc<AtomicUsize>,
        flush_result: bool,
    }

    impl StageWorker for IdleWorker {
        type Input = ();

        fn fetch(&mut self, timeout: Duration) -> Fetch<()> {
            thread::sleep(timeout);
            Fetch::Timeout
        }

        fn process(&mut self, _input: (), _errors: &mut ErrorReporter) {}

        fn flush(&mut self, _errors: &mut ErrorReporter) -> bool {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.flush_result
        }
    }

    /// Alternates failing fetches and items that fail to process
    struct FlakyWorker {
        calls: u32,
        processed: Arc<AtomicUsize>,
    }

    impl StageWorker for FlakyWorker {
        type Input = u32;

        fn fetch(&mut self, _timeout: Duration) -> Fetch<u32> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                Fetch::Failed(format!("fetch {} failed", self.calls))
            } else {
                Fetch::Item(self.calls)
            }
        }

        fn process(&mut self, input: u32, errors: &mut ErrorReporter) {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if input == 1 {
                errors.report("bad item");
            }
        }
    }

    fn reporter() -> ErrorReporter {
        errors::channel("test", 1024).unwrap().0
    }

    #[test]
    fn test_stop_observed_within_wait_timeout() {
        let wait_timeout = Duration::from_millis(100);
        let options = LoopOptions {
            wait_timeout,
            ..Default::default()
        };
        let worker = IdleWorker {
            flushes: Arc::new(AtomicUsize::new(0)),
            flush_result: true,
        };
        let mut lp = AcquisitionLoop::spawn("idle", worker, reporter(), options).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(lp.is_running());
        assert_eq!(lp.state(), LoopState::Running);

        let start = Instant::now();
        lp.stop(wait_timeout * 5).unwrap();
        assert!(start.elapsed() < wait_timeout * 5);
        assert_eq!(lp.state(), LoopState::Stopped);
        assert!(!lp.is_running());

        // second stop is a no-op
        lp.stop(Duration::ZERO).unwrap();
    }

    #[test]
    fn test_flush_runs_on_worker() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let worker = IdleWorker {
            flushes: Arc::clone(&flushes),
            flush_result: true,
        };
        let options = LoopOptions {
            wait_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut lp = AcquisitionLoop::spawn("flush", worker, reporter(), options).unwrap();

        lp.flush(Duration::from_secs(5)).unwrap();
        lp.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 2);

        lp.stop(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            lp.flush(Duration::from_secs(1)),
            Err(StageError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_failed_flush_is_reported() {
        let worker = IdleWorker {
            flushes: Arc::new(AtomicUsize::new(0)),
            flush_result: false,
        };
        let options = LoopOptions {
            wait_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let lp = AcquisitionLoop::spawn("flush", worker, reporter(), options).unwrap();

        assert!(matches!(
            lp.flush(Duration::from_secs(5)),
            Err(StageError::FlushFailed { .. })
        ));
    }

    #[test]
    fn test_failures_are_recorded_and_loop_continues() {
        let processed = Arc::new(AtomicUsize::new(0));
        let worker = FlakyWorker {
            calls: 0,
            processed: Arc::clone(&processed),
        };
        let (reporter, errors) = errors::channel("flaky", 1024).unwrap();
        let mut lp =
            AcquisitionLoop::spawn("flaky", worker, reporter, LoopOptions::default()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while processed.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        lp.stop(Duration::from_secs(5)).unwrap();

        assert!(processed.load(Ordering::SeqCst) >= 5);
        let messages = errors.drain();
        assert_eq!(messages[0], "bad item");
        assert_eq!(messages[1], "fetch 2 failed");
    }
}
