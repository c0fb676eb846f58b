//! Writer worker: drains the bounded queue and writes each frame to
//! stdout in full, with non-blocking I/O and an optional per-frame
//! deadline.

use std::sync::Arc;

use crate::transport::Inner;

pub(crate) fn run(inner: Arc<Inner>) {
    #[cfg(unix)]
    if let Err(err) = crate::transport::sys::set_nonblocking(inner.stdout_fd) {
        tracing::warn!(error = %err, "failed to set stdout non-blocking");
    }

    while inner.is_connected() {
        let Some(frame) = inner.queue.dequeue_blocking() else {
            break;
        };
        if frame.is_empty() {
            continue;
        }
        write_frame(&inner, &frame);
        // Account the full frame whether it was written or abandoned;
        // abandoned bytes are gone either way.
        inner.queue.account_written(frame.len());
    }

    inner.mark_writer_exited();
}

/// Write one frame to completion, or abandon it on a fatal error or
/// write-timeout expiry.
fn write_frame(inner: &Inner, frame: &[u8]) {
    let start = std::time::Instant::now();
    let mut total = 0usize;
    while inner.is_connected() && total < frame.len() {
        if !write_chunk(inner, frame, &mut total, start) {
            break;
        }
    }
}

/// Bound one blocked-output wait, honoring the remaining write deadline.
/// Returns `None` when the deadline has already expired.
fn bounded_wait_ms(inner: &Inner, start: std::time::Instant, default_ms: u64) -> Option<u64> {
    let timeout_ms = inner
        .write_timeout_ms
        .load(std::sync::atomic::Ordering::Relaxed);
    if timeout_ms == 0 {
        return Some(default_ms);
    }
    let elapsed_ms = start.elapsed().as_millis() as u64;
    if elapsed_ms >= timeout_ms {
        return None;
    }
    Some((timeout_ms - elapsed_ms).min(default_ms))
}

#[cfg(unix)]
fn write_chunk(inner: &Inner, frame: &[u8], total: &mut usize, start: std::time::Instant) -> bool {
    use std::io;

    use crate::transport::sys::poll_one;

    let fd = inner.stdout_fd;
    let n = unsafe {
        libc::write(
            fd,
            frame[*total..].as_ptr() as *const libc::c_void,
            frame.len() - *total,
        )
    };
    if n > 0 {
        *total += n as usize;
        return true;
    }
    if n == 0 {
        // Temporarily unavailable; wait briefly for writability.
        let _ = poll_one(fd, libc::POLLOUT, 10);
        return true;
    }

    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::Interrupted => true,
        io::ErrorKind::WouldBlock => {
            let Some(wait_ms) = bounded_wait_ms(inner, start, 50) else {
                tracing::error!(
                    timeout_ms = inner
                        .write_timeout_ms
                        .load(std::sync::atomic::Ordering::Relaxed),
                    "write timeout"
                );
                inner.fatal("write timeout");
                return false;
            };
            match poll_one(fd, libc::POLLOUT, wait_ms as i32) {
                Ok(_) => true,
                Err(err) => {
                    tracing::error!(error = %err, "poll(stdout) failed");
                    inner.fatal("write wait failed");
                    false
                }
            }
        }
        _ => {
            tracing::error!(error = %err, "write error on stdout");
            inner.fatal("write error");
            false
        }
    }
}

#[cfg(windows)]
fn write_chunk(inner: &Inner, frame: &[u8], total: &mut usize, start: std::time::Instant) -> bool {
    use std::io;
    use std::ptr;
    use std::sync::atomic::Ordering;

    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, ERROR_IO_PENDING,
        ERROR_NOT_SUPPORTED, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
    };
    use windows_sys::Win32::Storage::FileSystem::WriteFile;
    use windows_sys::Win32::System::Console::{GetStdHandle, STD_OUTPUT_HANDLE};
    use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
    use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

    let stdout = unsafe { GetStdHandle(STD_OUTPUT_HANDLE) };
    if stdout.is_null() || stdout == INVALID_HANDLE_VALUE {
        inner.report_error("invalid stdout handle");
        inner.disconnect();
        return false;
    }

    if inner.use_overlapped_write.load(Ordering::Acquire) {
        let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if event.is_null() {
            inner.use_overlapped_write.store(false, Ordering::Release);
        } else {
            let mut ovl: OVERLAPPED = unsafe { std::mem::zeroed() };
            ovl.hEvent = event;
            let mut written = 0u32;
            let ok = unsafe {
                WriteFile(
                    stdout,
                    frame.as_ptr().add(*total),
                    (frame.len() - *total) as u32,
                    &mut written,
                    &mut ovl,
                )
            };
            if ok == 0 {
                let err = unsafe { GetLastError() };
                if err == ERROR_IO_PENDING {
                    loop {
                        let Some(wait_ms) = bounded_wait_ms(inner, start, 50) else {
                            tracing::error!(
                                timeout_ms = inner.write_timeout_ms.load(Ordering::Relaxed),
                                "write timeout"
                            );
                            unsafe {
                                CancelIoEx(stdout, &ovl);
                                CloseHandle(event);
                            }
                            inner.fatal("write timeout");
                            return false;
                        };
                        let rc = unsafe { WaitForSingleObject(event, wait_ms as u32) };
                        if rc == WAIT_OBJECT_0 {
                            let mut transferred = 0u32;
                            if unsafe { GetOverlappedResult(stdout, &ovl, &mut transferred, 0) }
                                == 0
                            {
                                tracing::error!(
                                    error = %io::Error::last_os_error(),
                                    "GetOverlappedResult failed"
                                );
                                unsafe { CloseHandle(event) };
                                inner.fatal("write failed");
                                return false;
                            }
                            written = transferred;
                            break;
                        } else if rc == WAIT_TIMEOUT {
                            continue;
                        } else {
                            tracing::error!(
                                error = %io::Error::last_os_error(),
                                "WaitForSingleObject failed"
                            );
                            unsafe { CloseHandle(event) };
                            inner.fatal("write wait failed");
                            return false;
                        }
                    }
                } else if err == ERROR_INVALID_PARAMETER
                    || err == ERROR_INVALID_HANDLE
                    || err == ERROR_NOT_SUPPORTED
                {
                    // Handle cannot do overlapped I/O; latch to synchronous
                    // writes for the rest of the process and retry.
                    inner.use_overlapped_write.store(false, Ordering::Release);
                    unsafe { CloseHandle(event) };
                    return write_chunk(inner, frame, total, start);
                } else {
                    tracing::error!(
                        error = %io::Error::from_raw_os_error(err as i32),
                        "WriteFile(overlapped) failed"
                    );
                    unsafe { CloseHandle(event) };
                    inner.fatal("write failed");
                    return false;
                }
            }
            unsafe { CloseHandle(event) };
            *total += written as usize;
            return true;
        }
    }

    // Synchronous fallback.
    let mut written = 0u32;
    let ok = unsafe {
        WriteFile(
            stdout,
            frame.as_ptr().add(*total),
            (frame.len() - *total) as u32,
            &mut written,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        tracing::error!(error = %io::Error::last_os_error(), "WriteFile failed");
        inner.fatal("write failed");
        return false;
    }
    *total += written as usize;
    true
}
