//! Shared raw Bluetooth socket plumbing
//!
//! File descriptor ownership, the poll loop every blocking reader uses, and
//! the eventfd wake-up that makes `close()` unblock a pending reader. The
//! wake-up descriptor is merged into the poll set, so no signals are
//! involved.

/// Transport errors shared by the socket-bearing components
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Error {
    /// The socket is closed, locally or by the peer
    NotConnected,
    /// The deadline of a blocking read elapsed
    Timeout,
    /// An `is_interrupted` query asked the operation to stop
    Interrupted,
    /// An OS level error, carrying the errno value
    Io(i32),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match *self {
            Error::NotConnected => write!(f, "disconnected"),
            Error::Timeout => write!(f, "read timeout"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::Io(errno) => write!(f, "io error, errno {}", errno),
        }
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "linux")]
mod linux {
    use super::Error;
    use nix::libc;
    use std::os::unix::io::RawFd;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug,PartialEq,Eq)]
    pub struct FileDesc(RawFd);

    impl FileDesc {
        pub fn new(fd: RawFd) -> Self { FileDesc(fd) }
    }

    impl Drop for FileDesc {
        fn drop(&mut self) {
            nix::unistd::close(self.0).ok();
        }
    }

    #[derive(Clone,Debug,PartialEq,Eq)]
    pub struct ArcFileDesc(Arc<FileDesc>);

    impl From<RawFd> for ArcFileDesc {
        fn from(rfd: RawFd) -> Self {
            ArcFileDesc(Arc::new(FileDesc(rfd)))
        }
    }

    impl ArcFileDesc {
        pub fn raw_fd(&self) -> RawFd {
            (*self.0).0
        }
    }

    pub fn last_errno() -> i32 {
        nix::errno::errno()
    }

    /// Event-file-descriptor based reader wake-up
    ///
    /// Readers poll this descriptor next to their socket; `notify` makes the
    /// poll return without any socket traffic.
    #[derive(Clone,Debug)]
    pub struct Wake {
        fd: ArcFileDesc,
    }

    impl Wake {
        pub fn new() -> Result<Self, Error> {
            use nix::sys::eventfd::{eventfd, EfdFlags};

            let fd = eventfd(0, EfdFlags::EFD_CLOEXEC)
                .map_err(|_| Error::Io(last_errno()))?;

            Ok(Wake { fd: ArcFileDesc::from(fd) })
        }

        pub fn notify(&self) {
            // Any 8 byte value other than zero wakes the poll
            nix::unistd::write(self.fd.raw_fd(), &1u64.to_ne_bytes()).ok();
        }

        pub fn drain(&self) {
            let mut buf = [0u8; 8];
            nix::unistd::read(self.fd.raw_fd(), &mut buf).ok();
        }

        pub fn raw_fd(&self) -> RawFd {
            self.fd.raw_fd()
        }
    }

    /// What made a poll return
    #[derive(Clone,Copy,Debug,PartialEq,Eq)]
    pub enum PollOutcome {
        /// The socket has data
        Readable,
        /// The wake-up descriptor fired
        Woken,
    }

    /// Block until the socket is readable, the wake-up fires, or the
    /// timeout elapses
    ///
    /// `EINTR` restarts the poll with the remaining time; socket error and
    /// hang-up conditions surface as [`Error::NotConnected`].
    pub fn poll_read(fd: RawFd, wake: &Wake, timeout: Duration) -> Result<PollOutcome, Error> {
        let deadline = std::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let timeout_ms = remaining.as_millis().min(i32::max_value() as u128) as libc::c_int;

            let mut fds = [
                libc::pollfd { fd, events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: wake.raw_fd(), events: libc::POLLIN, revents: 0 },
            ];

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

            if rc < 0 {
                let errno = last_errno();
                if errno == libc::EINTR || errno == libc::EAGAIN {
                    continue;
                }
                return Err(Error::Io(errno));
            }
            if rc == 0 {
                return Err(Error::Timeout);
            }

            if fds[1].revents & libc::POLLIN != 0 {
                wake.drain();
                return Ok(PollOutcome::Woken);
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return Err(Error::NotConnected);
            }
            if fds[0].revents & libc::POLLIN != 0 {
                return Ok(PollOutcome::Readable);
            }
        }
    }
}
