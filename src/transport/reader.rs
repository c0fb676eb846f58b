//! Reader worker: waits on stdin plus the wakeup primitive, reassembles
//! frames, and dispatches each message.
//!
//! Requests are handed to detached per-request threads so the reader can
//! keep delivering notifications (cancellations in particular) while a
//! handler runs. Responses complete the correlation table. Notifications
//! run inline on this thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::protocol::{Extracted, FrameBuffer, FrameError, Message, Request, Response};
use crate::transport::Inner;

/// Scratch size for a single read.
const READ_CHUNK: usize = 4096;

/// Ceiling on one blocking wait, so shutdown is observed promptly even
/// without a wakeup source.
const WAIT_TIMEOUT_MS: u32 = 100;

pub(crate) fn run(inner: Arc<Inner>) {
    #[cfg(unix)]
    unix_loop::run_loop(&inner);
    #[cfg(windows)]
    windows_loop::run_loop(&inner);

    inner.disconnect();
    inner.mark_reader_exited();
}

/// Pull every complete frame out of the buffer and dispatch it.
fn drain_frames(inner: &Arc<Inner>, frames: &mut FrameBuffer) {
    while inner.is_connected() {
        match frames.extract() {
            Extracted::Frame(payload) => process_message(inner, &payload),
            Extracted::NeedMore => break,
            Extracted::Malformed(FrameError::BodyTooLarge(length)) => {
                tracing::warn!(length, "frame body too large; skipping header region");
                inner.report_error("body too large");
            }
            Extracted::Malformed(FrameError::MissingLength) => {
                tracing::warn!("missing Content-Length header; dropping header region");
            }
        }
    }
}

fn process_message(inner: &Arc<Inner>, payload: &[u8]) {
    let text = String::from_utf8_lossy(payload);
    tracing::debug!(bytes = payload.len(), "received message");

    match Message::classify(&text) {
        Some(Message::Request(request)) => dispatch_request(inner, request),
        Some(Message::Response(response)) => {
            let key = response.id.key();
            if !inner.table.complete(&key, response) {
                tracing::debug!(id = %key, "response for unknown request id; dropping");
            }
        }
        Some(Message::Notification(notification)) => {
            if let Some(handler) = inner.notification_handler.get() {
                handler(notification);
            }
        }
        None => tracing::warn!(payload = %text, "failed to parse message; dropping"),
    }
}

/// Run the request handler off-thread, detached. Whatever the handler
/// does (responds, errors, or panics), exactly one response carrying the
/// request's id is enqueued.
fn dispatch_request(inner: &Arc<Inner>, request: Request) {
    let Some(handler) = inner.request_handler.get().cloned() else {
        tracing::warn!(method = %request.method, "no request handler registered; dropping request");
        return;
    };

    let inner = inner.clone();
    let spawned = thread::Builder::new()
        .name("stdiowire-request".into())
        .spawn(move || {
            let id = request.id.clone();
            let response = match catch_unwind(AssertUnwindSafe(|| handler(request))) {
                Ok(Ok(mut response)) => {
                    response.id = id;
                    response
                }
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "request handler error");
                    Response::internal_error(id, err.to_string())
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(message = %message, "request handler panicked");
                    Response::internal_error(id, message)
                }
            };
            inner.enqueue_response(&response);
        });
    if let Err(err) = spawned {
        tracing::error!(error = %err, "failed to spawn request handler thread");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}

#[cfg(unix)]
mod unix_loop {
    use super::*;

    use std::io;
    use std::time::{Duration, Instant};

    use crate::transport::sys::set_nonblocking;

    /// What one wait observed.
    #[derive(Default)]
    struct Readiness {
        readable: bool,
        hangup: bool,
        woke: bool,
        failed: bool,
    }

    pub(super) fn run_loop(inner: &Arc<Inner>) {
        let fd = inner.stdin_fd;
        if let Err(err) = set_nonblocking(fd) {
            tracing::warn!(error = %err, "failed to set stdin non-blocking");
        }
        let wake_fd = inner.wakeup.as_ref().map(|w| w.wait_fd());

        #[cfg(target_os = "linux")]
        let epoll = match EpollWaiter::new(fd, wake_fd) {
            Ok(waiter) => Some(waiter),
            Err(err) => {
                tracing::warn!(error = %err, "epoll unavailable; falling back to poll");
                None
            }
        };

        let mut frames = FrameBuffer::new();
        let mut scratch = [0u8; READ_CHUNK];
        let mut last_read = Instant::now();

        while inner.is_connected() {
            #[cfg(target_os = "linux")]
            let ready = match &epoll {
                Some(waiter) => waiter.wait(fd, inner),
                None => poll_wait(fd, wake_fd, inner),
            };
            #[cfg(not(target_os = "linux"))]
            let ready = poll_wait(fd, wake_fd, inner);

            if ready.failed {
                break;
            }
            if ready.woke {
                if let Some(wakeup) = &inner.wakeup {
                    wakeup.drain();
                }
                if !inner.is_connected() {
                    break;
                }
            }

            // A hangup still gets a read attempt: data queued before the
            // peer closed must drain, and a clean end then reads as EOF.
            let mut had_data = false;
            if ready.readable || ready.hangup {
                let n = unsafe {
                    libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
                };
                if n > 0 {
                    frames.extend(&scratch[..n as usize]);
                    had_data = true;
                } else if n == 0 {
                    tracing::info!("EOF on stdin");
                    inner.report_error("EOF on stdin");
                    break;
                } else {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                            if ready.hangup {
                                tracing::info!("stdin closed");
                                inner.report_error("stdin closed");
                                break;
                            }
                        }
                        _ => {
                            tracing::error!(error = %err, "read error on stdin");
                            inner.report_error("read error");
                            break;
                        }
                    }
                }
            }

            if had_data {
                last_read = Instant::now();
                drain_frames(inner, &mut frames);
            }

            let idle_ms = inner.idle_read_timeout_ms.load(std::sync::atomic::Ordering::Relaxed);
            if idle_ms > 0 && last_read.elapsed() >= Duration::from_millis(idle_ms) {
                tracing::error!(timeout_ms = idle_ms, "idle read timeout");
                inner.report_error("idle read timeout");
                break;
            }
        }
    }

    /// One `poll` round over stdin and the wakeup descriptor.
    fn poll_wait(fd: i32, wake_fd: Option<i32>, inner: &Inner) -> Readiness {
        let mut pfds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wake_fd.unwrap_or(-1),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let nfds: libc::nfds_t = if wake_fd.is_some() { 2 } else { 1 };

        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), nfds, WAIT_TIMEOUT_MS as i32) };
        let mut ready = Readiness::default();
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return ready;
            }
            tracing::error!(error = %err, "poll failed");
            inner.report_error("poll failed");
            ready.failed = true;
            return ready;
        }
        if rc == 0 {
            return ready;
        }
        if pfds[0].revents & libc::POLLIN != 0 {
            ready.readable = true;
        }
        if pfds[0].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            ready.hangup = true;
        }
        if wake_fd.is_some() && pfds[1].revents & libc::POLLIN != 0 {
            ready.woke = true;
        }
        ready
    }

    /// Persistent epoll instance over stdin and the wakeup eventfd.
    #[cfg(target_os = "linux")]
    struct EpollWaiter {
        epoll: std::os::fd::OwnedFd,
        wake_fd: Option<i32>,
    }

    #[cfg(target_os = "linux")]
    impl EpollWaiter {
        fn new(fd: i32, wake_fd: Option<i32>) -> io::Result<Self> {
            use std::os::fd::FromRawFd;

            let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if ep < 0 {
                return Err(io::Error::last_os_error());
            }
            let epoll = unsafe { std::os::fd::OwnedFd::from_raw_fd(ep) };

            let mut ev = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLERR) as u32,
                u64: fd as u64,
            };
            if unsafe { libc::epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0 {
                return Err(io::Error::last_os_error());
            }
            if let Some(wfd) = wake_fd {
                let mut ev = libc::epoll_event {
                    events: libc::EPOLLIN as u32,
                    u64: wfd as u64,
                };
                if unsafe { libc::epoll_ctl(ep, libc::EPOLL_CTL_ADD, wfd, &mut ev) } < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(Self { epoll, wake_fd })
        }

        fn wait(&self, fd: i32, inner: &Inner) -> Readiness {
            use std::os::fd::AsRawFd;

            let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    WAIT_TIMEOUT_MS as i32,
                )
            };
            let mut ready = Readiness::default();
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return ready;
                }
                tracing::error!(error = %err, "epoll_wait failed");
                inner.report_error("epoll_wait failed");
                ready.failed = true;
                return ready;
            }
            for ev in events.iter().take(rc as usize) {
                if ev.u64 == fd as u64 {
                    if ev.events & libc::EPOLLIN as u32 != 0 {
                        ready.readable = true;
                    }
                    if ev.events & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
                    {
                        ready.hangup = true;
                    }
                } else if Some(ev.u64 as i32) == self.wake_fd {
                    ready.woke = true;
                }
            }
            ready
        }
    }
}

#[cfg(windows)]
mod windows_loop {
    use super::*;

    use std::io;
    use std::ptr;
    use std::time::{Duration, Instant};

    use windows_sys::Win32::Foundation::{
        GetLastError, ERROR_BROKEN_PIPE, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
        WAIT_TIMEOUT,
    };
    use windows_sys::Win32::Storage::FileSystem::{GetFileType, ReadFile, FILE_TYPE_PIPE};
    use windows_sys::Win32::System::Console::{GetStdHandle, STD_INPUT_HANDLE};
    use windows_sys::Win32::System::Pipes::PeekNamedPipe;
    use windows_sys::Win32::System::Threading::{WaitForMultipleObjects, WaitForSingleObject};

    enum WaitOutcome {
        Stop,
        Ready,
        Timeout,
        Failed,
    }

    /// Wait on {stop event, handle}; the stop event, when present, wins.
    fn wait_stop_or_ready(stop: Option<HANDLE>, handle: HANDLE, timeout_ms: u32) -> WaitOutcome {
        unsafe {
            match stop {
                Some(stop) => {
                    let handles = [stop, handle];
                    let rc = WaitForMultipleObjects(2, handles.as_ptr(), 0, timeout_ms);
                    if rc == WAIT_OBJECT_0 {
                        WaitOutcome::Stop
                    } else if rc == WAIT_OBJECT_0 + 1 {
                        WaitOutcome::Ready
                    } else if rc == WAIT_TIMEOUT {
                        WaitOutcome::Timeout
                    } else {
                        WaitOutcome::Failed
                    }
                }
                None => {
                    let rc = WaitForSingleObject(handle, timeout_ms);
                    if rc == WAIT_OBJECT_0 {
                        WaitOutcome::Ready
                    } else if rc == WAIT_TIMEOUT {
                        WaitOutcome::Timeout
                    } else {
                        WaitOutcome::Failed
                    }
                }
            }
        }
    }

    fn read_some(inner: &Arc<Inner>, stdin: HANDLE, scratch: &mut [u8], limit: u32) -> Option<u32> {
        let mut read = 0u32;
        let ok = unsafe {
            ReadFile(
                stdin,
                scratch.as_mut_ptr() as *mut _,
                limit,
                &mut read,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_BROKEN_PIPE {
                tracing::info!("EOF on stdin");
                inner.report_error("EOF on stdin");
            } else {
                tracing::error!(error = %io::Error::from_raw_os_error(err as i32), "ReadFile failed");
                inner.report_error("ReadFile failed");
            }
            return None;
        }
        if read == 0 {
            tracing::info!("EOF on stdin");
            inner.report_error("EOF on stdin");
            return None;
        }
        Some(read)
    }

    pub(super) fn run_loop(inner: &Arc<Inner>) {
        let mut frames = FrameBuffer::new();
        let mut scratch = [0u8; READ_CHUNK];
        let mut last_read = Instant::now();

        while inner.is_connected() {
            let stdin = unsafe { GetStdHandle(STD_INPUT_HANDLE) };
            if stdin.is_null() || stdin == INVALID_HANDLE_VALUE {
                inner.report_error("invalid stdin handle");
                break;
            }
            let stop = inner.wakeup.as_ref().map(|w| w.raw_handle());
            let file_type = unsafe { GetFileType(stdin) };
            let mut had_data = false;

            if file_type == FILE_TYPE_PIPE {
                let mut available = 0u32;
                if unsafe {
                    PeekNamedPipe(
                        stdin,
                        ptr::null_mut(),
                        0,
                        ptr::null_mut(),
                        &mut available,
                        ptr::null_mut(),
                    )
                } == 0
                {
                    tracing::error!(error = %io::Error::last_os_error(), "PeekNamedPipe failed");
                    inner.report_error("PeekNamedPipe failed");
                    break;
                }
                if available == 0 {
                    match wait_stop_or_ready(stop, stdin, WAIT_TIMEOUT_MS) {
                        WaitOutcome::Stop => {
                            if let Some(wakeup) = &inner.wakeup {
                                wakeup.drain();
                            }
                            break;
                        }
                        WaitOutcome::Ready => {
                            let _ = unsafe {
                                PeekNamedPipe(
                                    stdin,
                                    ptr::null_mut(),
                                    0,
                                    ptr::null_mut(),
                                    &mut available,
                                    ptr::null_mut(),
                                )
                            };
                        }
                        WaitOutcome::Timeout => {}
                        WaitOutcome::Failed => {
                            inner.report_error("WaitForMultipleObjects failed");
                            break;
                        }
                    }
                }
                if available > 0 {
                    let limit = available.min(scratch.len() as u32);
                    match read_some(inner, stdin, &mut scratch, limit) {
                        Some(read) => {
                            frames.extend(&scratch[..read as usize]);
                            had_data = true;
                        }
                        None => break,
                    }
                }
            } else {
                match wait_stop_or_ready(stop, stdin, WAIT_TIMEOUT_MS) {
                    WaitOutcome::Stop => {
                        if let Some(wakeup) = &inner.wakeup {
                            wakeup.drain();
                        }
                        break;
                    }
                    WaitOutcome::Ready => {
                        match read_some(inner, stdin, &mut scratch, READ_CHUNK as u32) {
                            Some(read) => {
                                frames.extend(&scratch[..read as usize]);
                                had_data = true;
                            }
                            None => break,
                        }
                    }
                    WaitOutcome::Timeout => {}
                    WaitOutcome::Failed => {
                        inner.report_error("WaitForMultipleObjects failed");
                        break;
                    }
                }
            }

            if had_data {
                last_read = Instant::now();
                drain_frames(inner, &mut frames);
            }

            let idle_ms = inner.idle_read_timeout_ms.load(std::sync::atomic::Ordering::Relaxed);
            if idle_ms > 0 && last_read.elapsed() >= Duration::from_millis(idle_ms) {
                tracing::error!(timeout_ms = idle_ms, "idle read timeout");
                inner.report_error("idle read timeout");
                break;
            }
        }
    }
}
