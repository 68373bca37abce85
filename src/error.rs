//! The error taxonomy surfaced by every fallible operation in this crate.
//!
//! Every variant corresponds to one row of spec.md's error taxonomy: wrong
//! lifecycle state, a bad argument, a privilege failure, an unsupported PMU
//! feature, "try again later", or "the kernel said no, here's the errno".

use nix::errno::Errno;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    /// Operation called while the Channel/ChannelSet was in the wrong
    /// lifecycle state (e.g. `read_sample` before `bind`, `init` twice).
    #[fail(display = "invalid operation for the current lifecycle state")]
    InvalidState,

    /// A bad argument was supplied: an empty event-class set, or a sample
    /// period below the hardware-enforced minimum.
    #[fail(display = "invalid argument: {}", reason)]
    InvalidArgument { reason: &'static str },

    /// The kernel refused to open a counter for privilege reasons (no
    /// `CAP_SYS_ADMIN`, or a restrictive `perf_event_paranoid` setting).
    #[fail(display = "permission denied opening a performance counter")]
    PermissionDenied,

    /// The requested PMU feature (event selector, PEBS, ...) is not
    /// supported by this CPU/kernel combination.
    #[fail(display = "requested PMU feature is not supported on this host")]
    Unsupported,

    /// A non-blocking read found nothing available. Not a real failure;
    /// callers use this to know when to stop draining a ring.
    #[fail(display = "would block: no sample currently available")]
    WouldBlock,

    /// Failure mapping or unmapping a ring buffer.
    #[fail(display = "failed to map the ring buffer (errno {})", _0)]
    Mmap(i32),

    /// Any other system call failure, carrying the raw errno.
    #[fail(display = "OS error (errno {})", _0)]
    OsError(i32),
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EACCES | Errno::EPERM => Error::PermissionDenied,
            Errno::ENODEV | Errno::EOPNOTSUPP | Errno::ENOSYS => Error::Unsupported,
            Errno::EAGAIN => Error::WouldBlock,
            other => Error::OsError(other as i32),
        }
    }
}

impl From<::nix::Error> for Error {
    fn from(err: ::nix::Error) -> Self {
        match err.as_errno() {
            Some(errno) => Error::from(errno),
            None => Error::OsError(-1),
        }
    }
}

impl From<::std::io::Error> for Error {
    fn from(err: ::std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Error::from(Errno::from_i32(code)),
            None => Error::OsError(-1),
        }
    }
}

/// Classifies the errno left behind by a failed `perf_event_open(2)` call.
pub(crate) fn from_open_errno(errno: Errno) -> Error {
    match errno {
        Errno::EACCES | Errno::EPERM => Error::PermissionDenied,
        Errno::ENODEV | Errno::EOPNOTSUPP => Error::Unsupported,
        other => Error::OsError(other as i32),
    }
}

/// Classifies the errno left behind by a failed `PERF_EVENT_IOC_PERIOD`,
/// which the kernel rejects with `EINVAL` when the period is below the
/// hardware-dependent minimum (spec.md §4.1: "reported as a configuration
/// error, not silently clamped").
pub(crate) fn from_period_errno(errno: Errno) -> Error {
    match errno {
        Errno::EINVAL => Error::InvalidArgument {
            reason: "sample period below the hardware minimum",
        },
        other => Error::from(other),
    }
}
