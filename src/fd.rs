//! Thin wrapper around the `perf_event_open(2)` file descriptor: opening a
//! counter and the handful of ioctls this crate needs to drive it.

use std::fs::File;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use libc::{c_int, pid_t, syscall, SYS_perf_event_open};
use nix::errno::Errno;

use crate::error::{from_open_errno, from_period_errno, Error, Result};
use crate::raw::perf_event_attr;
use crate::sample::EventClass;

const PERF_EVENT_IOC_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE_NR: u8 = 0;
const PERF_EVENT_IOC_DISABLE_NR: u8 = 1;
const PERF_EVENT_IOC_PERIOD_NR: u8 = 4;
const PERF_EVENT_IOC_ID_NR: u8 = 7;

ioctl!(none perf_event_ioc_enable with PERF_EVENT_IOC_MAGIC, PERF_EVENT_IOC_ENABLE_NR);
ioctl!(none perf_event_ioc_disable with PERF_EVENT_IOC_MAGIC, PERF_EVENT_IOC_DISABLE_NR);
ioctl!(write_ptr perf_event_ioc_period with PERF_EVENT_IOC_MAGIC, PERF_EVENT_IOC_PERIOD_NR; u64);
ioctl!(read perf_event_ioc_id with PERF_EVENT_IOC_MAGIC, PERF_EVENT_IOC_ID_NR; u64);

/// The open counter fd for one (pid, event class) pair.
///
/// `PerfFile` owns exactly the fd; the ring buffer it backs is mapped and
/// owned separately by `ring_buffer::RingBuffer`, mirroring the original
/// `Channel`'s split between `m_fd` and `m_buffer`.
#[derive(Debug)]
pub(crate) struct PerfFile(File);

impl PerfFile {
    /// Opens a counter for `pid`, scoped to all CPUs and user-mode-only
    /// execution, with sampling metadata enabled so every record carries
    /// tid, cpu, and the sampled address (spec.md §4.1/§6).
    pub(crate) fn open(pid: pid_t, class: EventClass) -> Result<Self> {
        let mut attr: perf_event_attr = unsafe { ::std::mem::zeroed() };
        attr.size = size_of::<perf_event_attr>() as u32;
        attr.type_ = class.perf_type();
        attr.config = class.raw_config();
        attr.set_disabled(1);
        attr.set_exclude_kernel(1);
        attr.set_exclude_hv(1);

        use crate::raw::perf_event_sample_format::*;
        attr.sample_type =
            (PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_TID | PERF_SAMPLE_ADDR | PERF_SAMPLE_CPU) as u64;
        attr.__bindgen_anon_2 = crate::raw::perf_event_attr__bindgen_ty_2 { wakeup_events: 1 };
        // request skid-free PEBS sampling, the original motivation for the
        // 0x81D0/0x82D0 selectors (spec.md §4.1).
        attr.set_precise_ip(2);

        // NOTE(unsafe): the kernel rejects a malformed attr with an errno;
        // it cannot corrupt memory on either side of this call.
        let fd = unsafe {
            syscall(
                SYS_perf_event_open,
                &attr,
                pid as c_int,
                -1 as c_int, // any CPU
                -1 as c_int, // no group leader
                0 as ::libc::c_ulong,
            )
        };

        if fd == -1 {
            let e = from_open_errno(Errno::last());
            debug!("perf_event_open({:?}, pid={}) failed: {:?}", class, pid, e);
            return Err(e);
        }

        // SAFETY: a non-negative return from the syscall is a valid,
        // exclusively-owned fd.
        Ok(PerfFile(unsafe { File::from_raw_fd(fd as i32) }))
    }

    pub(crate) fn enable(&self) -> Result<()> {
        unsafe { perf_event_ioc_enable(self.0.as_raw_fd()) }
            .map(|_| ())
            .map_err(Error::from)
    }

    pub(crate) fn disable(&self) -> Result<()> {
        unsafe { perf_event_ioc_disable(self.0.as_raw_fd()) }
            .map(|_| ())
            .map_err(Error::from)
    }

    pub(crate) fn set_period(&self, period: u64) -> Result<()> {
        unsafe { perf_event_ioc_period(self.0.as_raw_fd(), &period) }
            .map(|_| ())
            .map_err(|e| match e {
                ::nix::Error::Sys(errno) => from_period_errno(errno),
                other => Error::from(other),
            })
    }

    pub(crate) fn sample_id(&self) -> Result<u64> {
        let mut id: u64 = 0;
        unsafe { perf_event_ioc_id(self.0.as_raw_fd(), &mut id) }.map_err(Error::from)?;
        Ok(id)
    }
}

impl AsRawFd for PerfFile {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
