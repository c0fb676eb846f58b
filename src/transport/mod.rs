//! Transport runtime: public facade, shared state, and worker lifecycle.
//!
//! A running transport owns exactly three long-lived threads (reader,
//! writer, and deadline timer) plus short-lived detached threads for
//! request handlers. Shutdown is cooperative: `close` flips the atomic
//! `connected` flag, signals the wakeup primitive, broadcasts every
//! condition variable, and gives each worker a bounded grace period
//! before detaching it.

mod pending;
mod queue;
mod reader;
mod sys;
mod wakeup;
mod writer;

pub use pending::ResponseSlot;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::fd::RawFd;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::protocol::{encode_frame, Notification, Request, RequestId, Response};

use pending::{ready_slot, response_slot, PendingTable};
use queue::WriteQueue;
use wakeup::Wakeup;

/// Grace period granted to each worker during `close`.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Error type request handlers may return; it is translated into a
/// JSON-RPC internal-error response carrying the handler's message.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type RequestHandler =
    Arc<dyn Fn(Request) -> std::result::Result<Response, HandlerError> + Send + Sync>;
pub(crate) type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;
pub(crate) type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// State shared between the facade and the worker threads.
pub(crate) struct Inner {
    pub(crate) connected: Arc<AtomicBool>,
    pub(crate) reader_exited: AtomicBool,
    pub(crate) writer_exited: AtomicBool,
    exit_lock: Mutex<()>,
    cv_reader_exit: Condvar,
    cv_writer_exit: Condvar,

    session_id: String,
    request_counter: AtomicU64,

    pub(crate) queue: WriteQueue,
    pub(crate) table: PendingTable,
    pub(crate) wakeup: Option<Wakeup>,

    pub(crate) request_handler: OnceLock<RequestHandler>,
    pub(crate) notification_handler: OnceLock<NotificationHandler>,
    error_handler: OnceLock<ErrorHandler>,

    pub(crate) request_timeout_ms: AtomicU64,
    pub(crate) idle_read_timeout_ms: AtomicU64,
    pub(crate) write_timeout_ms: AtomicU64,
    pub(crate) write_queue_max_bytes: AtomicUsize,

    #[cfg(unix)]
    pub(crate) stdin_fd: RawFd,
    #[cfg(unix)]
    pub(crate) stdout_fd: RawFd,

    /// One-way latch: cleared on the first overlapped-write failure that
    /// indicates the handle cannot do overlapped I/O.
    #[cfg(windows)]
    pub(crate) use_overlapped_write: AtomicBool,
}

impl Inner {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flip to disconnected and wake everything that might be waiting.
    pub(crate) fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(wakeup) = &self.wakeup {
            wakeup.signal();
        }
        self.queue.notify_all();
        self.table.notify();
    }

    /// Surface an error to the registered handler (if any).
    pub(crate) fn report_error(&self, message: &str) {
        if let Some(handler) = self.error_handler.get() {
            handler(message);
        }
    }

    /// Report a fatal error and tear the connection down.
    pub(crate) fn fatal(&self, message: &str) {
        self.report_error(message);
        self.disconnect();
    }

    /// Frame a payload and push it onto the bounded write queue.
    ///
    /// Overflow is fatal: the error handler fires, the transport
    /// disconnects, and `false` is returned. Frames queued before the
    /// overflow are not guaranteed delivery.
    pub(crate) fn enqueue_frame(&self, payload: &[u8]) -> bool {
        let frame = encode_frame(payload);
        let cap = self.write_queue_max_bytes.load(Ordering::Relaxed);
        let size = frame.len();
        if self.queue.enqueue(frame, cap) {
            return true;
        }
        tracing::error!(
            queued = self.queue.queued_bytes(),
            add = size,
            max = cap,
            "write queue overflow"
        );
        self.fatal("write queue overflow");
        false
    }

    /// Serialize and enqueue a response produced by a request handler.
    pub(crate) fn enqueue_response(&self, response: &Response) {
        match serde_json::to_vec(response) {
            Ok(bytes) => {
                let _ = self.enqueue_frame(&bytes);
            }
            Err(err) => tracing::error!(error = %err, "failed to serialize response"),
        }
    }

    pub(crate) fn generate_request_id(&self) -> String {
        format!("req-{}", self.request_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn mark_reader_exited(&self) {
        self.reader_exited.store(true, Ordering::Release);
        drop(self.lock_exit());
        self.cv_reader_exit.notify_all();
    }

    pub(crate) fn mark_writer_exited(&self) {
        self.writer_exited.store(true, Ordering::Release);
        drop(self.lock_exit());
        self.cv_writer_exit.notify_all();
    }

    fn lock_exit(&self) -> MutexGuard<'_, ()> {
        match self.exit_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait up to [`CLOSE_GRACE`] for a worker's exit flag.
    fn wait_exit(&self, flag: &AtomicBool, cv: &Condvar) -> bool {
        let deadline = Instant::now() + CLOSE_GRACE;
        let mut guard = self.lock_exit();
        while !flag.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match cv.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[derive(Default)]
struct Workers {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

/// Bidirectional, message-framed JSON-RPC 2.0 transport over a process's
/// standard streams.
///
/// Register handlers, then [`start`](Self::start); outstanding requests
/// are correlated by id and always resolve: with the peer's response, a
/// timeout error, or a transport-closed error.
///
/// # Example
///
/// ```no_run
/// use stdiowire::{Request, StdioTransport};
///
/// let transport = StdioTransport::new();
/// transport.set_notification_handler(|note| {
///     eprintln!("notification: {}", note.method);
/// });
/// transport.start().unwrap();
///
/// let slot = transport.send_request(Request::new("ping", None));
/// let response = slot.recv();
/// eprintln!("response for {}", response.id);
/// transport.close();
/// ```
pub struct StdioTransport {
    inner: Arc<Inner>,
    workers: Mutex<Workers>,
}

impl StdioTransport {
    /// Transport over the process's own stdin/stdout.
    pub fn new() -> Self {
        Self::with_config(&TransportConfig::from_env())
    }

    /// Transport over the process streams with explicit configuration.
    pub fn with_config(config: &TransportConfig) -> Self {
        #[cfg(unix)]
        {
            Self::build(config, libc::STDIN_FILENO, libc::STDOUT_FILENO)
        }
        #[cfg(windows)]
        {
            Self::build(config)
        }
    }

    /// Transport configured from a `key=value` string (see
    /// [`TransportConfig::parse`]).
    pub fn from_config_str(config: &str) -> Self {
        Self::with_config(&TransportConfig::parse(config))
    }

    /// Transport over caller-supplied descriptors instead of the process
    /// streams. The transport puts them into non-blocking mode on start
    /// and never closes them; the caller keeps ownership.
    #[cfg(unix)]
    pub fn with_raw_fds(stdin_fd: RawFd, stdout_fd: RawFd) -> Self {
        Self::build(&TransportConfig::from_env(), stdin_fd, stdout_fd)
    }

    fn build(config: &TransportConfig, #[cfg(unix)] stdin_fd: RawFd, #[cfg(unix)] stdout_fd: RawFd) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let wakeup = match Wakeup::new() {
            Ok(wakeup) => Some(wakeup),
            Err(err) => {
                tracing::error!(error = %err, "failed to create wakeup primitive");
                None
            }
        };

        let inner = Inner {
            connected: connected.clone(),
            reader_exited: AtomicBool::new(false),
            writer_exited: AtomicBool::new(false),
            exit_lock: Mutex::new(()),
            cv_reader_exit: Condvar::new(),
            cv_writer_exit: Condvar::new(),
            session_id: generate_session_id(),
            request_counter: AtomicU64::new(0),
            queue: WriteQueue::new(connected),
            table: PendingTable::new(),
            wakeup,
            request_handler: OnceLock::new(),
            notification_handler: OnceLock::new(),
            error_handler: OnceLock::new(),
            request_timeout_ms: AtomicU64::new(config.request_timeout_ms),
            idle_read_timeout_ms: AtomicU64::new(config.idle_read_timeout_ms),
            write_timeout_ms: AtomicU64::new(config.write_timeout_ms),
            write_queue_max_bytes: AtomicUsize::new(config.write_queue_max_bytes.max(1)),
            #[cfg(unix)]
            stdin_fd,
            #[cfg(unix)]
            stdout_fd,
            #[cfg(windows)]
            use_overlapped_write: AtomicBool::new(true),
        };

        Self {
            inner: Arc::new(inner),
            workers: Mutex::new(Workers::default()),
        }
    }

    /// Spawn the reader, writer, and timer threads. Call once, after the
    /// handlers are registered.
    pub fn start(&self) -> Result<()> {
        tracing::info!(session = %self.inner.session_id, "starting transport");
        self.inner.connected.store(true, Ordering::Release);

        let mut workers = self.lock_workers();
        workers.reader = Some(
            thread::Builder::new().name("stdiowire-reader".into()).spawn({
                let inner = self.inner.clone();
                move || reader::run(inner)
            })?,
        );
        workers.writer = Some(
            thread::Builder::new().name("stdiowire-writer".into()).spawn({
                let inner = self.inner.clone();
                move || writer::run(inner)
            })?,
        );
        workers.timer = Some(
            thread::Builder::new().name("stdiowire-timer".into()).spawn({
                let inner = self.inner.clone();
                move || inner.table.run_timeout_loop(&inner.connected)
            })?,
        );
        Ok(())
    }

    /// Shut the transport down.
    ///
    /// Disconnects, wakes every worker, waits up to 500 ms per worker for
    /// a graceful exit (detaching any straggler stuck in a blocking
    /// primitive), then fails all outstanding requests with
    /// `"Transport closed"`. Never closes the underlying descriptors.
    /// Safe to call from a handler running on a worker thread: the join
    /// of that thread is skipped.
    pub fn close(&self) {
        tracing::info!(session = %self.inner.session_id, "closing transport");
        self.inner.disconnect();

        let (reader, writer, timer) = {
            let mut workers = self.lock_workers();
            (workers.reader.take(), workers.writer.take(), workers.timer.take())
        };

        if let Some(handle) = reader {
            self.join_worker(
                handle,
                &self.inner.reader_exited,
                &self.inner.cv_reader_exit,
                "reader",
            );
        }
        if let Some(handle) = writer {
            self.inner.queue.notify_all();
            self.join_worker(
                handle,
                &self.inner.writer_exited,
                &self.inner.cv_writer_exit,
                "writer",
            );
        }
        if let Some(handle) = timer {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!("close called from timer thread; skipping join");
            } else {
                let _ = handle.join();
            }
        }

        self.inner.table.fail_all("Transport closed");
    }

    fn join_worker(&self, handle: JoinHandle<()>, flag: &AtomicBool, cv: &Condvar, name: &str) {
        if handle.thread().id() == thread::current().id() {
            tracing::warn!(worker = name, "close called from worker thread; skipping join");
            return;
        }
        if self.inner.wait_exit(flag, cv) {
            let _ = handle.join();
        } else {
            // Dropping the handle detaches the thread; a worker stuck in
            // a blocking primitive must not be allowed to hang close.
            tracing::warn!(worker = name, "worker appears blocked; detaching to avoid hang");
        }
    }

    /// Send a request and receive a slot that always resolves.
    ///
    /// A caller-set id (non-empty string or integer) is preserved;
    /// otherwise a `req-N` id is generated. When the transport is not
    /// connected the slot resolves immediately with an internal error.
    pub fn send_request(&self, mut request: Request) -> ResponseSlot {
        if !self.inner.is_connected() {
            tracing::debug!("send_request while disconnected; returning error");
            return ready_slot(Response::internal_error(
                RequestId::Str(self.inner.generate_request_id()),
                "Transport not connected",
            ));
        }

        if !request.id.is_set() {
            request.id = RequestId::Str(self.inner.generate_request_id());
        }
        let key = request.id.key();

        let (sender, slot) = response_slot();
        let timeout_ms = self.inner.request_timeout_ms.load(Ordering::Relaxed);
        let deadline = if timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        };
        self.inner.table.insert(key, request.id.clone(), sender, deadline);

        match serde_json::to_vec(&request) {
            Ok(bytes) => {
                tracing::debug!(bytes = bytes.len(), "sending framed request");
                let _ = self.inner.enqueue_frame(&bytes);
            }
            Err(err) => tracing::error!(error = %err, "failed to serialize request"),
        }
        slot
    }

    /// Send a notification (fire-and-forget). On a disconnected transport
    /// this is a silent no-op; enqueue failures surface through the error
    /// handler, not to the caller.
    pub fn send_notification(&self, notification: Notification) {
        if !self.inner.is_connected() {
            tracing::debug!("send_notification while disconnected; ignoring");
            return;
        }
        match serde_json::to_vec(&notification) {
            Ok(bytes) => {
                tracing::debug!(bytes = bytes.len(), "sending framed notification");
                let _ = self.inner.enqueue_frame(&bytes);
            }
            Err(err) => tracing::error!(error = %err, "failed to serialize notification"),
        }
    }

    /// Register the inbound-request handler. Runs on a detached
    /// per-request thread; panics and `Err` returns become internal-error
    /// responses. Configure before [`start`](Self::start); only the first
    /// registration takes effect.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: Fn(Request) -> std::result::Result<Response, HandlerError> + Send + Sync + 'static,
    {
        if self.inner.request_handler.set(Arc::new(handler)).is_err() {
            tracing::warn!("request handler already set; ignoring");
        }
    }

    /// Register the notification handler. Runs synchronously on the
    /// reader thread and must not block. Configure before
    /// [`start`](Self::start); only the first registration takes effect.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        if self.inner.notification_handler.set(Arc::new(handler)).is_err() {
            tracing::warn!("notification handler already set; ignoring");
        }
    }

    /// Register the error handler invoked with every transport error
    /// message. Configure before [`start`](Self::start); only the first
    /// registration takes effect.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if self.inner.error_handler.set(Arc::new(handler)).is_err() {
            tracing::warn!("error handler already set; ignoring");
        }
    }

    /// Per-request deadline in milliseconds; 0 disables request timeouts.
    pub fn set_request_timeout_ms(&self, timeout_ms: u64) {
        self.inner.request_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Abort the transport when no bytes arrive for this long; 0 disables.
    pub fn set_idle_read_timeout_ms(&self, timeout_ms: u64) {
        self.inner.idle_read_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Per-frame write deadline in milliseconds; 0 disables.
    pub fn set_write_timeout_ms(&self, timeout_ms: u64) {
        self.inner.write_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Write-queue byte budget; clamped to at least 1.
    pub fn set_write_queue_max_bytes(&self, max_bytes: usize) {
        self.inner
            .write_queue_max_bytes
            .store(max_bytes.max(1), Ordering::Relaxed);
    }

    /// Whether the transport is connected. Terminal once false.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Opaque per-instance session id (`stdio-NNNN`).
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        let running = {
            let workers = self.lock_workers();
            workers.reader.is_some() || workers.writer.is_some() || workers.timer.is_some()
        };
        if running || self.inner.is_connected() {
            self.close();
        }
    }
}

/// Pseudo-random u64 from the clock and the process id.
fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid
}

/// `stdio-NNNN` with a random 4-digit suffix, fixed at construction.
fn generate_session_id() -> String {
    format!("stdio-{}", 1000 + rand_u64() % 9000)
}
