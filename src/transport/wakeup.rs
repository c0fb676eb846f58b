//! Wakeup primitive for interrupting the reader's blocking wait.
//!
//! An edge-style signal the reader can watch in the same wait call as
//! stdin, used solely to break out of the wait during shutdown or on a
//! fatal error from another thread:
//!
//! - Linux: `eventfd` (non-blocking, cloexec), watched by epoll/poll.
//! - Other POSIX: a non-blocking self-pipe, read end watched by poll.
//! - Windows: a manual-reset event alongside stdin in
//!   `WaitForMultipleObjects`.
//!
//! `signal` is idempotent and never blocks; a full pipe or saturated
//! counter simply means the wakeup is already pending.

#[cfg(unix)]
pub(crate) use unix_impl::Wakeup;
#[cfg(windows)]
pub(crate) use windows_impl::Wakeup;

#[cfg(unix)]
mod unix_impl {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    #[cfg(not(target_os = "linux"))]
    use crate::transport::sys::set_nonblocking;

    pub(crate) struct Wakeup {
        #[cfg(target_os = "linux")]
        event: OwnedFd,
        #[cfg(not(target_os = "linux"))]
        read_end: OwnedFd,
        #[cfg(not(target_os = "linux"))]
        write_end: OwnedFd,
    }

    impl Wakeup {
        #[cfg(target_os = "linux")]
        pub(crate) fn new() -> io::Result<Self> {
            let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                event: unsafe { OwnedFd::from_raw_fd(fd) },
            })
        }

        #[cfg(not(target_os = "linux"))]
        pub(crate) fn new() -> io::Result<Self> {
            let mut fds = [0; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
            let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
            set_nonblocking(read_end.as_raw_fd())?;
            set_nonblocking(write_end.as_raw_fd())?;
            Ok(Self {
                read_end,
                write_end,
            })
        }

        /// Descriptor to include in the reader's wait set.
        pub(crate) fn wait_fd(&self) -> RawFd {
            #[cfg(target_os = "linux")]
            {
                self.event.as_raw_fd()
            }
            #[cfg(not(target_os = "linux"))]
            {
                self.read_end.as_raw_fd()
            }
        }

        /// Make the wait descriptor readable. Never blocks.
        pub(crate) fn signal(&self) {
            #[cfg(target_os = "linux")]
            {
                let one = 1u64.to_ne_bytes();
                write_wakeup_byte(self.event.as_raw_fd(), &one);
            }
            #[cfg(not(target_os = "linux"))]
            {
                write_wakeup_byte(self.write_end.as_raw_fd(), b"x");
            }
        }

        /// Discard all pending wakeup bytes.
        pub(crate) fn drain(&self) {
            let fd = self.wait_fd();
            let mut scratch = [0u8; 64];
            loop {
                let n = unsafe {
                    libc::read(
                        fd,
                        scratch.as_mut_ptr() as *mut libc::c_void,
                        scratch.len(),
                    )
                };
                if n > 0 {
                    continue;
                }
                if n == 0 {
                    return;
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return,
                    _ => {
                        tracing::warn!(error = %err, "wakeup drain failed");
                        return;
                    }
                }
            }
        }
    }

    fn write_wakeup_byte(fd: RawFd, buf: &[u8]) {
        loop {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                // Already pending; the wakeup is level-readable.
                io::ErrorKind::WouldBlock => return,
                _ => {
                    tracing::warn!(error = %err, "wakeup signal failed");
                    return;
                }
            }
        }
    }

}

#[cfg(windows)]
mod windows_impl {
    use std::io;
    use std::ptr;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent};

    pub(crate) struct Wakeup {
        event: HANDLE,
    }

    // The event handle is only passed to thread-safe Win32 calls.
    unsafe impl Send for Wakeup {}
    unsafe impl Sync for Wakeup {}

    impl Wakeup {
        pub(crate) fn new() -> io::Result<Self> {
            // Manual-reset so every waiter observes the stop signal.
            let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
            if event.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { event })
        }

        pub(crate) fn raw_handle(&self) -> HANDLE {
            self.event
        }

        pub(crate) fn signal(&self) {
            if unsafe { SetEvent(self.event) } == 0 {
                tracing::warn!(error = %io::Error::last_os_error(), "wakeup signal failed");
            }
        }

        /// Manual-reset events stay signaled; nothing to drain.
        pub(crate) fn drain(&self) {}
    }

    impl Drop for Wakeup {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.event) };
        }
    }
}
