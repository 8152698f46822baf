//! Demux device access.
//!
//! The hardware section filter contract: given a PID, an optional table-id
//! match byte and an optional two-byte table-id-extension match, the driver
//! delivers exactly one CRC-verified section per read of adequate buffer
//! size. The [`Demux`] trait captures that contract so the filter pool can
//! run against scripted sections in tests; [`LinuxDemux`] is the real thing
//! over `/dev/dvb/adapterN/demuxN`.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, trace};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

pub const DMX_FILTER_SIZE: usize = 16;
pub const DMX_CHECK_CRC: u32 = 1;
pub const DMX_IMMEDIATE_START: u32 = 4;

/// What a hardware section filter should match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterParams {
    pub pid: u16,
    pub table_id: Option<u8>,
    pub table_id_ext: Option<u16>,
    pub check_crc: bool,
}

/// Result of one non-blocking section read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// One complete section of this many bytes.
    Section(usize),
    /// Nothing buffered right now.
    WouldBlock,
    /// The driver's circular buffer overflowed; a retry may still succeed.
    Overflow,
}

pub trait Demux {
    type Handle;

    fn open_filter(&mut self, params: &FilterParams) -> Result<Self::Handle>;

    /// Wait up to `timeout` for any of `handles` to become readable.
    /// Returns one readiness flag per handle, in order.
    fn poll(&mut self, handles: &[&Self::Handle], timeout: Duration) -> Result<Vec<bool>>;

    fn read_section(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> Result<ReadOutcome>;

    fn close_filter(&mut self, handle: Self::Handle);
}

// Demux filter structs matching kernel layout
#[repr(C)]
struct DmxFilter {
    filter: [u8; DMX_FILTER_SIZE],
    mask: [u8; DMX_FILTER_SIZE],
    mode: [u8; DMX_FILTER_SIZE],
}

#[repr(C)]
struct DmxSctFilterParams {
    pid: u16,
    filter: DmxFilter,
    timeout: u32,
    flags: u32,
}

nix::ioctl_write_ptr!(dmx_set_filter, b'o', 43, DmxSctFilterParams);
nix::ioctl_none_bad!(dmx_stop, nix::request_code_none!(b'o', 42));

/// One demux device node; every filter opens its own file description.
pub struct LinuxDemux {
    path: String,
}

impl LinuxDemux {
    pub fn new(adapter: u32, demux: u32) -> LinuxDemux {
        LinuxDemux {
            path: format!("/dev/dvb/adapter{adapter}/demux{demux}"),
        }
    }
}

impl Demux for LinuxDemux {
    type Handle = File;

    fn open_filter(&mut self, params: &FilterParams) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path))?;

        let mut filter = DmxFilter {
            filter: [0u8; DMX_FILTER_SIZE],
            mask: [0u8; DMX_FILTER_SIZE],
            mode: [0u8; DMX_FILTER_SIZE],
        };
        if let Some(table_id) = params.table_id {
            filter.filter[0] = table_id;
            filter.mask[0] = 0xFF;
        }
        if let Some(ext) = params.table_id_ext {
            filter.filter[1] = (ext >> 8) as u8;
            filter.filter[2] = (ext & 0xFF) as u8;
            filter.mask[1] = 0xFF;
            filter.mask[2] = 0xFF;
        }

        let mut flags = DMX_IMMEDIATE_START;
        if params.check_crc {
            flags |= DMX_CHECK_CRC;
        }
        let sct = DmxSctFilterParams {
            pid: params.pid,
            filter,
            timeout: 0,
            flags,
        };
        unsafe {
            dmx_set_filter(file.as_raw_fd(), &sct).context("DMX_SET_FILTER failed")?;
        }
        trace!(
            "hardware filter pid 0x{:04x} tid {:?} ext {:?}",
            params.pid, params.table_id, params.table_id_ext
        );
        Ok(file)
    }

    fn poll(&mut self, handles: &[&File], timeout: Duration) -> Result<Vec<bool>> {
        if handles.is_empty() {
            return Ok(Vec::new());
        }
        let mut fds: Vec<PollFd> = handles
            .iter()
            .map(|f| {
                PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(f.as_raw_fd()) },
                    PollFlags::POLLIN,
                )
            })
            .collect();
        let timeout =
            PollTimeout::try_from(timeout.as_millis().min(i32::MAX as u128) as i32)
                .unwrap_or(PollTimeout::NONE);
        poll(&mut fds, timeout).context("poll failed")?;
        Ok(fds
            .iter()
            .map(|fd| fd.revents().is_some_and(|r| !r.is_empty()))
            .collect())
    }

    fn read_section(&mut self, handle: &mut File, buf: &mut [u8]) -> Result<ReadOutcome> {
        match handle.read(buf) {
            Ok(n) => Ok(ReadOutcome::Section(n)),
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN) => Ok(ReadOutcome::WouldBlock),
                Some(libc::EOVERFLOW) => Ok(ReadOutcome::Overflow),
                _ => Err(e).context("demux read failed"),
            },
        }
    }

    fn close_filter(&mut self, handle: File) {
        if let Err(e) = unsafe { dmx_stop(handle.as_raw_fd()) } {
            debug!("DMX_STOP failed: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A demux whose filters replay pre-scripted sections.

    use std::collections::VecDeque;

    use super::*;

    struct Script {
        pid: u16,
        table_id: u8,
        sections: VecDeque<Vec<u8>>,
        overflow_first: bool,
    }

    pub(crate) struct ScriptedHandle {
        sections: VecDeque<Vec<u8>>,
        overflow_first: bool,
    }

    #[derive(Default)]
    pub(crate) struct ScriptedDemux {
        scripts: Vec<Script>,
        pub opened: usize,
        pub closed: usize,
    }

    impl ScriptedDemux {
        pub fn new() -> ScriptedDemux {
            ScriptedDemux::default()
        }

        /// Queue one raw section for delivery on `pid`.
        pub fn script(&mut self, pid: u16, section: Vec<u8>) {
            self.script_inner(pid, section, false);
        }

        /// Same, but the first read on the filter reports an overflow.
        pub fn script_with_overflow(&mut self, pid: u16, section: Vec<u8>) {
            self.script_inner(pid, section, true);
        }

        fn script_inner(&mut self, pid: u16, section: Vec<u8>, overflow_first: bool) {
            let table_id = section.first().copied().unwrap_or(0);
            if let Some(s) = self
                .scripts
                .iter_mut()
                .find(|s| s.pid == pid && s.table_id == table_id)
            {
                s.sections.push_back(section);
                s.overflow_first |= overflow_first;
                return;
            }
            let mut sections = VecDeque::new();
            sections.push_back(section);
            self.scripts.push(Script {
                pid,
                table_id,
                sections,
                overflow_first,
            });
        }
    }

    impl Demux for ScriptedDemux {
        type Handle = ScriptedHandle;

        fn open_filter(&mut self, params: &FilterParams) -> Result<ScriptedHandle> {
            self.opened += 1;
            let mut handle = ScriptedHandle {
                sections: VecDeque::new(),
                overflow_first: false,
            };
            // a hardware filter only sees sections matching its table id
            if let Some(idx) = self.scripts.iter().position(|s| {
                s.pid == params.pid && params.table_id.is_none_or(|t| t == s.table_id)
            }) {
                let script = self.scripts.remove(idx);
                handle.sections = script.sections;
                handle.overflow_first = script.overflow_first;
            }
            Ok(handle)
        }

        fn poll(&mut self, handles: &[&ScriptedHandle], timeout: Duration) -> Result<Vec<bool>> {
            let flags: Vec<bool> = handles.iter().map(|h| !h.sections.is_empty()).collect();
            if !flags.contains(&true) {
                // nothing to deliver; let deadlines advance without spinning
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
            }
            Ok(flags)
        }

        fn read_section(
            &mut self,
            handle: &mut ScriptedHandle,
            buf: &mut [u8],
        ) -> Result<ReadOutcome> {
            if handle.overflow_first {
                handle.overflow_first = false;
                return Ok(ReadOutcome::Overflow);
            }
            match handle.sections.pop_front() {
                Some(section) => {
                    let n = section.len().min(buf.len());
                    buf[..n].copy_from_slice(&section[..n]);
                    Ok(ReadOutcome::Section(n))
                }
                None => Ok(ReadOutcome::WouldBlock),
            }
        }

        fn close_filter(&mut self, _handle: ScriptedHandle) {
            self.closed += 1;
        }
    }
}
