//! The worker thread.
//!
//! ```text
//!  caller threads                      worker thread
//!  --------------                      -------------
//!  execute_all() --push--> [ sync  ] --+
//!                          [ async ] --+--> sign on -> run -> flush -> notify
//!  open_serial() --------> pending ----+
//!  write()  ----> [ serial out ] -----------> port
//!  read()   <---- [ serial in  ] <----------- port
//! ```
//!
//! Every iteration the worker applies a pending link change, then pumps the
//! passthrough buffers when the serial pipe is open, otherwise runs the next
//! task (synchronous before asynchronous). With nothing to do it pings the
//! device every [`EngineConfig::keep_alive`] and sleeps on the condition
//! variable for at most [`EngineConfig::poll_interval`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fs::FatFs;
use crate::port::Port;
use crate::protocol::session::{STK500_CMD_MIN_INTERVAL, Session, SessionConfig};
use crate::task::{Task, TaskContext, TaskHandle, lock};

/// Idle interval between keep-alive pings.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Synchronous submissions stay silent for this long.
pub const PROGRESS_GRACE: Duration = Duration::from_millis(400);

/// Read slice used while pumping the serial pipe.
const PUMP_READ: Duration = Duration::from_millis(10);

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Baud rate for command mode.
    pub baud_rate: u32,
    /// Idle keep-alive interval.
    pub keep_alive: Duration,
    /// Longest idle sleep between queue checks.
    pub poll_interval: Duration,
    /// Delay before synchronous callers start seeing progress.
    pub progress_grace: Duration,
    /// Protocol timing.
    pub session: SessionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            keep_alive: KEEP_ALIVE_INTERVAL,
            poll_interval: STK500_CMD_MIN_INTERVAL,
            progress_grace: PROGRESS_GRACE,
            session: SessionConfig::default(),
        }
    }
}

/// Notifications for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A running task changed its status line.
    Status {
        /// Task title.
        title: String,
        /// New status.
        status: String,
    },
    /// A task finished.
    TaskFinished {
        /// Task title.
        title: String,
        /// Failure message, if it failed.
        error: Option<String>,
    },
    /// Bytes arrived on the serial pipe.
    SerialData(Vec<u8>),
    /// The engine shut down.
    Closed,
}

/// Snapshot passed to the callback of
/// [`TaskEngine::execute_all_with_progress`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    /// Overall fraction in `[0, 1]`.
    pub fraction: f32,
    /// Tasks finished so far.
    pub completed: usize,
    /// Tasks in the batch.
    pub total: usize,
    /// Title of the task running now.
    pub title: String,
    /// Its status line.
    pub status: String,
}

struct Job {
    task: Box<dyn Task>,
    handle: Arc<TaskHandle>,
    batch: u64,
    synchronous: bool,
}

#[derive(Debug, Clone, Copy)]
enum LinkChange {
    OpenSerial(u32),
    CloseSerial,
}

#[derive(Default)]
struct Queues {
    synchronous: VecDeque<Job>,
    asynchronous: VecDeque<Job>,
    current: Option<Arc<TaskHandle>>,
    pending: Option<LinkChange>,
    passthrough: bool,
    closing: bool,
}

struct Shared {
    queues: Mutex<Queues>,
    wake: Condvar,
    serial_in: Mutex<VecDeque<u8>>,
    serial_out: Mutex<VecDeque<u8>>,
    subscribers: Mutex<Vec<Sender<Event>>>,
    next_batch: AtomicU64,
}

impl Shared {
    fn emit(&self, event: &Event) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

enum Action {
    Link(LinkChange),
    Pump,
    Run(Job),
    Idle,
    Close,
}

/// Runs tasks against one device on a dedicated thread.
pub struct TaskEngine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    config: EngineConfig,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("config", &self.config)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl TaskEngine {
    /// Take ownership of `port` and start the worker.
    pub fn open(mut port: Box<dyn Port>, config: EngineConfig) -> Result<Self> {
        port.set_baud_rate(config.baud_rate)?;
        let session = Session::new(port, config.session);
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            wake: Condvar::new(),
            serial_in: Mutex::new(VecDeque::new()),
            serial_out: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
            next_batch: AtomicU64::new(1),
        });
        let worker = Worker {
            shared: Arc::clone(&shared),
            fs: FatFs::new(session),
            config,
            last_ping: Instant::now(),
        };
        let handle = thread::Builder::new()
            .name("sdlink-worker".into())
            .spawn(move || worker.run())?;
        info!("Task engine started");
        Ok(Self {
            shared,
            worker: Some(handle),
            config,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Receive notifications from now on.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// Submit one task. Synchronous submission blocks until it finished.
    pub fn execute(&self, task: impl Task + 'static, asynchronous: bool) -> Arc<TaskHandle> {
        let mut handles = self.submit(vec![Box::new(task)], !asynchronous);
        let handle = handles.remove(0);
        if !asynchronous {
            handle.wait();
        }
        handle
    }

    /// Submit a batch. Synchronous submission blocks until all finished; if
    /// one fails, the rest of the batch is cancelled.
    pub fn execute_all(&self, tasks: Vec<Box<dyn Task>>, asynchronous: bool) -> Vec<Arc<TaskHandle>> {
        if asynchronous {
            return self.submit(tasks, false);
        }
        self.execute_all_with_progress(tasks, &mut |_| {})
    }

    /// Synchronous batch with progress reporting.
    ///
    /// `callback` is first called once the batch ran longer than the grace
    /// period, then at every poll until the batch finished. Reported
    /// fractions never decrease.
    pub fn execute_all_with_progress(
        &self,
        tasks: Vec<Box<dyn Task>>,
        callback: &mut dyn FnMut(&BatchProgress),
    ) -> Vec<Arc<TaskHandle>> {
        let handles = self.submit(tasks, true);
        let total = handles.len();
        let started = Instant::now();
        let mut last = 0.0f32;
        loop {
            let completed = handles
                .iter()
                .filter(|h| h.is_finished())
                .count();
            let Some(current) = handles.iter().find(|h| !h.is_finished()) else {
                break;
            };
            if started.elapsed() >= self.config.progress_grace {
                let fraction = (completed as f32 + current.progress().max(0.0)) / total as f32;
                last = last.max(fraction.min(1.0));
                callback(&BatchProgress {
                    fraction: last,
                    completed,
                    total,
                    title: current.title().to_string(),
                    status: current.status(),
                });
            }
            current.wait_timeout(self.config.poll_interval.min(Duration::from_millis(50)));
        }
        handles
    }

    fn submit(&self, tasks: Vec<Box<dyn Task>>, synchronous: bool) -> Vec<Arc<TaskHandle>> {
        let batch = self
            .shared
            .next_batch
            .fetch_add(1, Ordering::Relaxed);
        let mut handles = Vec::with_capacity(tasks.len());
        let mut queues = lock(&self.shared.queues);
        for task in tasks {
            let handle = Arc::new(TaskHandle::new(task.title()));
            if queues.closing {
                handle.finish(Some(Error::Unsupported("task engine is closed".into())));
                handles.push(handle);
                continue;
            }
            let job = Job {
                task,
                handle: Arc::clone(&handle),
                batch,
                synchronous,
            };
            if synchronous {
                queues.synchronous.push_back(job);
            } else {
                queues.asynchronous.push_back(job);
            }
            handles.push(handle);
        }
        drop(queues);
        self.shared.wake.notify_all();
        handles
    }

    /// Cancel every queued task and the one running now.
    pub fn cancel_tasks(&self) {
        let queues = lock(&self.shared.queues);
        for job in queues.synchronous.iter().chain(&queues.asynchronous) {
            job.handle.cancel();
        }
        if let Some(current) = &queues.current {
            current.cancel();
        }
        drop(queues);
        self.shared.wake.notify_all();
    }

    /// Start the user program and open the raw serial pipe at `baud`.
    pub fn open_serial(&self, baud: u32) {
        lock(&self.shared.queues).pending = Some(LinkChange::OpenSerial(baud));
        self.shared.wake.notify_all();
    }

    /// Close the raw serial pipe; the next task returns to command mode.
    pub fn close_serial(&self) {
        lock(&self.shared.queues).pending = Some(LinkChange::CloseSerial);
        self.shared.wake.notify_all();
    }

    /// Whether the serial pipe is open.
    pub fn is_serial_open(&self) -> bool {
        lock(&self.shared.queues).passthrough
    }

    /// Move received pipe bytes into `buf`; returns how many.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut input = lock(&self.shared.serial_in);
        let n = buf.len().min(input.len());
        for (slot, b) in buf.iter_mut().zip(input.drain(..n)) {
            *slot = b;
        }
        n
    }

    /// Queue bytes for the serial pipe.
    pub fn write(&self, data: &[u8]) {
        lock(&self.shared.serial_out).extend(data);
        self.shared.wake.notify_all();
    }

    /// Stop the worker after the running task, flushing and signing off.
    /// Queued tasks finish as cancelled.
    pub fn close(&mut self) {
        {
            let mut queues = lock(&self.shared.queues);
            queues.closing = true;
            for job in queues.synchronous.iter().chain(&queues.asynchronous) {
                job.handle.cancel();
            }
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Task worker panicked");
            }
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    shared: Arc<Shared>,
    fs: FatFs<Session>,
    config: EngineConfig,
    last_ping: Instant,
}

impl Worker {
    fn run(mut self) {
        loop {
            match self.next_action() {
                Action::Close => break,
                Action::Link(change) => self.apply(change),
                Action::Pump => self.pump(),
                Action::Run(job) => self.run_job(job),
                Action::Idle => self.idle(),
            }
        }
        self.shutdown();
    }

    fn next_action(&self) -> Action {
        let mut queues = lock(&self.shared.queues);
        let mut waited = false;
        loop {
            if let Some(change) = queues.pending.take() {
                return Action::Link(change);
            }
            let has_task = !queues.synchronous.is_empty() || !queues.asynchronous.is_empty();
            if queues.closing && queues.passthrough {
                return Action::Close;
            }
            if queues.passthrough && has_task {
                // Tasks need command mode.
                return Action::Link(LinkChange::CloseSerial);
            }
            if queues.passthrough {
                return Action::Pump;
            }
            if let Some(job) = queues
                .synchronous
                .pop_front()
                .or_else(|| queues.asynchronous.pop_front())
            {
                queues.current = Some(Arc::clone(&job.handle));
                return Action::Run(job);
            }
            if queues.closing {
                return Action::Close;
            }
            if waited {
                return Action::Idle;
            }
            let (guard, _) = self
                .shared
                .wake
                .wait_timeout(queues, self.config.poll_interval)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queues = guard;
            waited = true;
        }
    }

    fn apply(&mut self, change: LinkChange) {
        let result = match change {
            LinkChange::OpenSerial(baud) => self.open_serial(baud),
            LinkChange::CloseSerial => self.close_serial(),
        };
        if let Err(e) = result {
            warn!("Serial mode change failed: {e}");
            self.shared.emit(&Event::Status {
                title: "serial".into(),
                status: e.to_string(),
            });
        }
    }

    fn open_serial(&mut self, baud: u32) -> Result<()> {
        self.fs.flush()?;
        self.fs.invalidate();
        let session = self.fs.device_mut();
        session.set_sketch_mode()?;
        session.set_baud_rate(baud)?;
        lock(&self.shared.serial_in).clear();
        lock(&self.shared.queues).passthrough = true;
        info!("Serial pipe open at {baud} baud");
        Ok(())
    }

    fn close_serial(&mut self) -> Result<()> {
        lock(&self.shared.queues).passthrough = false;
        lock(&self.shared.serial_out).clear();
        self.fs.device_mut().set_baud_rate(self.config.baud_rate)?;
        info!("Serial pipe closed");
        Ok(())
    }

    fn pump(&mut self) {
        let outgoing: Vec<u8> = lock(&self.shared.serial_out)
            .drain(..)
            .collect();
        let port = self.fs.device_mut().port_mut();
        if !outgoing.is_empty() {
            if let Err(e) = port.write_all_bytes(&outgoing) {
                warn!("Serial write failed: {e}");
            }
        }
        let mut buf = [0u8; 256];
        match port.read_timeout(&mut buf, PUMP_READ) {
            Ok(0) => {},
            Ok(n) => {
                lock(&self.shared.serial_in).extend(&buf[..n]);
                self.shared.emit(&Event::SerialData(buf[..n].to_vec()));
            },
            Err(e) => {
                warn!("Serial read failed: {e}");
                thread::sleep(PUMP_READ);
            },
        }
    }

    fn run_job(&mut self, mut job: Job) {
        let handle = Arc::clone(&job.handle);
        let title = handle.title().to_string();
        let error = if handle.is_cancelled() {
            debug!("Skipping cancelled task '{title}'");
            None
        } else {
            info!("Running task '{title}'");
            self.execute(&mut job)
        };

        match &error {
            Some(e) => warn!("Task '{title}' failed: {e}"),
            None => debug!("Task '{title}' finished"),
        }
        let message = error.as_ref().map(ToString::to_string);
        let failed = error.is_some();
        let mut queues = lock(&self.shared.queues);
        queues.current = None;
        handle.finish(error);

        // Fail fast: drop what is left of a failed synchronous batch.
        let mut skipped = Vec::new();
        if failed && job.synchronous {
            let (rest, keep): (VecDeque<Job>, VecDeque<Job>) = queues
                .synchronous
                .drain(..)
                .partition(|j| j.batch == job.batch);
            queues.synchronous = keep;
            skipped = rest.into_iter().collect();
        }
        drop(queues);

        self.shared.emit(&Event::TaskFinished {
            title,
            error: message,
        });
        for rest in skipped {
            rest.handle.cancel();
            rest.handle.finish(None);
            self.shared.emit(&Event::TaskFinished {
                title: rest.handle.title().to_string(),
                error: None,
            });
        }
        self.last_ping = Instant::now();
    }

    fn execute(&mut self, job: &mut Job) -> Option<Error> {
        let result = (|| -> Result<()> {
            if job.task.requires_sign_on() {
                self.fs.device_mut().ensure_signed_on()?;
            }
            let shared = Arc::clone(&self.shared);
            let notify = move |event: Event| shared.emit(&event);
            let mut ctx = TaskContext::new(&mut self.fs, &job.handle, &notify);
            job.task.run(&mut ctx)
        })();
        // Whatever happened, written blocks reach the card.
        let flushed = self.flush_if_possible();
        match result.and(flushed) {
            Ok(()) | Err(Error::Cancelled) => None,
            Err(e) => {
                if e.is_transport() {
                    self.fs.invalidate();
                }
                Some(e)
            },
        }
    }

    fn flush_if_possible(&mut self) -> Result<()> {
        if self.fs.cache().dirty_count() == 0 {
            return Ok(());
        }
        self.fs.flush()
    }

    fn idle(&mut self) {
        if self.last_ping.elapsed() < self.config.keep_alive {
            return;
        }
        self.last_ping = Instant::now();
        if let Err(e) = self.fs.device_mut().ping() {
            warn!("Keep-alive failed: {e}");
            self.shared.emit(&Event::Status {
                title: "keep-alive".into(),
                status: e.to_string(),
            });
        }
    }

    fn shutdown(&mut self) {
        let leftovers: Vec<Job> = {
            let mut queues = lock(&self.shared.queues);
            let mut jobs: Vec<Job> = queues
                .synchronous
                .drain(..)
                .collect();
            jobs.extend(queues.asynchronous.drain(..));
            jobs
        };
        for job in leftovers {
            job.handle.cancel();
            job.handle.finish(None);
        }
        if let Err(e) = self.flush_if_possible() {
            warn!("Final flush failed: {e}");
        }
        if let Err(e) = self.fs.device_mut().close() {
            debug!("Closing the port failed: {e}");
        }
        self.shared.emit(&Event::Closed);
        info!("Task engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::{FormatOptions, MemoryCard};
    use crate::port::VirtualDevice;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            keep_alive: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            progress_grace: Duration::ZERO,
            session: SessionConfig {
                read_timeout: Duration::from_millis(200),
                device_timeout: Duration::from_secs(60),
                reset_settle: Duration::from_millis(20),
            },
            ..EngineConfig::default()
        }
    }

    fn engine() -> (TaskEngine, VirtualDevice) {
        let device = VirtualDevice::new(MemoryCard::format(&FormatOptions::fat16(2048, 1)));
        let engine = TaskEngine::open(Box::new(device.clone()), fast_config()).unwrap();
        (engine, device)
    }

    struct Step {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Task for Step {
        fn title(&self) -> String {
            self.name.to_string()
        }

        fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
            ctx.set_progress(0.5);
            lock(&self.log).push(self.name);
            if self.fail {
                return Err(Error::NotFound(self.name.into()));
            }
            Ok(())
        }

        fn requires_sign_on(&self) -> bool {
            false
        }
    }

    fn step(name: &'static str, fail: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Box<dyn Task> {
        Box::new(Step {
            name,
            fail,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn test_sync_batch_runs_in_order() {
        let (engine, _device) = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles = engine.execute_all(vec![step("a", false, &log), step("b", false, &log)], false);
        assert!(handles.iter().all(|h| h.is_finished() && !h.has_failed()));
        assert_eq!(*lock(&log), vec!["a", "b"]);
    }

    #[test]
    fn test_sync_batch_fails_fast() {
        let (engine, _device) = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles = engine.execute_all(
            vec![step("a", false, &log), step("b", true, &log), step("c", false, &log)],
            false,
        );
        assert!(!handles[0].has_failed());
        assert_eq!(handles[1].error().as_deref(), Some("Not found: b"));
        assert!(handles[2].is_finished());
        assert!(handles[2].cancel_requested());
        assert_eq!(*lock(&log), vec!["a", "b"]);
    }

    #[test]
    fn test_async_failure_does_not_cancel_others() {
        let (engine, _device) = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles = engine.execute_all(vec![step("x", true, &log), step("y", false, &log)], true);
        for h in &handles {
            h.wait();
        }
        assert!(handles[0].has_failed());
        assert!(!handles[1].has_failed());
    }

    #[test]
    fn test_progress_callback_is_monotonic() {
        let (engine, _device) = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut seen = Vec::new();
        engine.execute_all_with_progress(
            vec![step("a", false, &log), step("b", false, &log), step("c", false, &log)],
            &mut |p| seen.push(p.fraction),
        );
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|f| (0.0..=1.0).contains(f)));
    }

    #[test]
    fn test_events_and_close() {
        let (mut engine, _device) = engine();
        let events = engine.subscribe();
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.execute_all(vec![step("a", false, &log)], false);
        engine.close();
        let received: Vec<Event> = events.try_iter().collect();
        assert!(received.contains(&Event::TaskFinished {
            title: "a".into(),
            error: None
        }));
        assert_eq!(received.last(), Some(&Event::Closed));
    }

    #[test]
    fn test_serial_passthrough_echo() {
        let (engine, device) = engine();
        engine.open_serial(9600);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !engine.is_serial_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(device.sketch_running());
        engine.write(b"hello");
        let mut got = Vec::new();
        let mut buf = [0u8; 16];
        while got.len() < 5 && Instant::now() < deadline {
            let n = engine.read(&mut buf);
            got.extend_from_slice(&buf[..n]);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got, b"hello");
        engine.close_serial();
    }

    #[test]
    fn test_closed_engine_rejects_tasks() {
        let (mut engine, _device) = engine();
        engine.close();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = engine.execute(
            Step {
                name: "late",
                fail: false,
                log,
            },
            false,
        );
        assert!(handle.has_failed());
    }
}
