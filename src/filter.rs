//! Section filters: reassembly state and the bounded filter pool.
//!
//! One [`SectionFilter`] tracks one table acquisition on one PID: which
//! section numbers of which version have arrived, and, for segmented tables
//! (NIT-other, SDT-other), one such state per table-id-extension, since a
//! single PID carries many sub-tables there. The [`FilterPool`] owns up to
//! [`MAX_RUNNING`] live demux filters, multiplexes their readiness with one
//! poll call, enforces per-filter deadlines and admits queued filters as
//! capacity frees up.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::demux::{Demux, FilterParams, ReadOutcome};
use crate::section::{SECTION_BUF_SIZE, SectionHeader};

/// Ceiling on concurrently scheduled hardware filters (and poll slots).
pub const MAX_RUNNING: usize = 27;

/// Upper bound for one poll call inside `tick`.
pub const POLL_CEILING: Duration = Duration::from_secs(1);

/// Default per-filter deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSpec {
    pub pid: u16,
    pub table_id: u8,
    pub table_id_ext: Option<u16>,
    pub run_once: bool,
    pub segmented: bool,
    pub timeout: Duration,
}

impl FilterSpec {
    pub fn new(pid: u16, table_id: u8) -> FilterSpec {
        FilterSpec {
            pid,
            table_id,
            table_id_ext: None,
            run_once: true,
            segmented: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_ext(mut self, table_id_ext: u16) -> FilterSpec {
        self.table_id_ext = Some(table_id_ext);
        self
    }

    pub fn segmented(mut self) -> FilterSpec {
        self.segmented = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> FilterSpec {
        self.timeout = timeout;
        self
    }

    fn same_target(&self, other: &FilterSpec) -> bool {
        self.pid == other.pid
            && self.table_id == other.table_id
            && self.table_id_ext == other.table_id_ext
    }
}

/// Reassembly state for one (table_id, table_id_ext) pair.
#[derive(Debug, Clone)]
struct TableState {
    table_id_ext: u16,
    version: u8,
    section_done: [u8; 32],
    complete: bool,
}

impl TableState {
    fn new(table_id_ext: u16, version: u8) -> TableState {
        TableState {
            table_id_ext,
            version,
            section_done: [0; 32],
            complete: false,
        }
    }

    fn reset(&mut self, version: u8) {
        self.version = version;
        self.section_done = [0; 32];
        self.complete = false;
    }

    /// Mark a section as received; true when it was not seen before.
    fn mark(&mut self, section_number: u8, last_section_number: u8) -> bool {
        let bit = section_number as usize;
        if self.section_done[bit / 8] & (1 << (bit % 8)) != 0 {
            return false;
        }
        self.section_done[bit / 8] |= 1 << (bit % 8);
        self.complete = (0..=last_section_number as usize)
            .all(|i| self.section_done[i / 8] & (1 << (i % 8)) != 0);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// First sighting of this section number (for the current version).
    New,
    Duplicate,
    /// Wrong table id for this filter.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct SectionFilter {
    pub spec: FilterSpec,
    tables: Vec<TableState>,
}

impl SectionFilter {
    pub fn new(spec: FilterSpec) -> SectionFilter {
        SectionFilter {
            spec,
            tables: Vec::new(),
        }
    }

    /// Account for one received section header.
    pub fn feed(&mut self, hdr: &SectionHeader) -> FeedOutcome {
        if hdr.table_id != self.spec.table_id {
            return FeedOutcome::Rejected;
        }

        let state = if self.spec.segmented {
            // one reassembly state per table_id_ext on this PID
            match self
                .tables
                .iter()
                .position(|t| t.table_id_ext == hdr.table_id_ext)
            {
                Some(idx) => {
                    let state = &mut self.tables[idx];
                    if state.version != hdr.version {
                        debug!(
                            "tid 0x{:02x} ext 0x{:04x}: version {} -> {}",
                            hdr.table_id, hdr.table_id_ext, state.version, hdr.version
                        );
                        state.reset(hdr.version);
                    }
                    state
                }
                None => {
                    self.tables.push(TableState::new(hdr.table_id_ext, hdr.version));
                    self.tables.last_mut().unwrap()
                }
            }
        } else {
            match self.tables.first_mut() {
                None => {
                    self.tables.push(TableState::new(hdr.table_id_ext, hdr.version));
                    self.tables.last_mut().unwrap()
                }
                Some(state) => {
                    if state.version != hdr.version || state.table_id_ext != hdr.table_id_ext {
                        debug!(
                            "tid 0x{:02x}: version/ext changed {}/0x{:04x} -> {}/0x{:04x}",
                            hdr.table_id,
                            state.version,
                            state.table_id_ext,
                            hdr.version,
                            hdr.table_id_ext
                        );
                        state.table_id_ext = hdr.table_id_ext;
                        state.reset(hdr.version);
                    }
                    state
                }
            }
        };

        if state.mark(hdr.section_number, hdr.last_section_number) {
            FeedOutcome::New
        } else {
            FeedOutcome::Duplicate
        }
    }

    /// Whether every section of the table has arrived. Segmented filters
    /// never report completion: the number of sub-tables is unknown, they
    /// run until their deadline.
    pub fn table_complete(&self) -> bool {
        !self.spec.segmented && self.tables.first().is_some_and(|t| t.complete)
    }

    /// Number of distinct table-id-extensions seen so far.
    pub fn segment_count(&self) -> usize {
        self.tables.len()
    }
}

/// One section handed out of the pool, ready for a table decoder.
#[derive(Debug, Clone)]
pub struct DeliveredSection {
    pub pid: u16,
    pub table_id: u8,
    pub table_id_ext: u16,
    pub version: u8,
    pub payload: Vec<u8>,
}

struct Scheduled<H> {
    handle: H,
    filter: SectionFilter,
    deadline: Instant,
    failed: bool,
}

pub struct FilterPool<D: Demux> {
    demux: D,
    running: Vec<Scheduled<D::Handle>>,
    waiting: VecDeque<SectionFilter>,
    timeout_factor: u32,
}

impl<D: Demux> FilterPool<D> {
    /// `long_timeout` multiplies every deadline by 5, for transmitters with
    /// non-compliant section repetition rates.
    pub fn new(demux: D, long_timeout: bool) -> FilterPool<D> {
        FilterPool {
            demux,
            running: Vec::new(),
            waiting: VecDeque::new(),
            timeout_factor: if long_timeout { 5 } else { 1 },
        }
    }

    pub fn scheduled_len(&self) -> usize {
        self.running.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty() && self.waiting.is_empty()
    }

    /// Enqueue a filter: scheduled right away when a slot is free, else
    /// appended to the FIFO waiting queue. A filter for a (pid, table id,
    /// extension) already in flight is dropped.
    pub fn submit(&mut self, spec: FilterSpec) {
        let duplicate = self
            .running
            .iter()
            .any(|s| s.filter.spec.same_target(&spec))
            || self.waiting.iter().any(|f| f.spec.same_target(&spec));
        if duplicate {
            trace!(
                "filter pid 0x{:04x} tid 0x{:02x} already in flight",
                spec.pid, spec.table_id
            );
            return;
        }
        let filter = SectionFilter::new(spec);
        if self.running.len() < MAX_RUNNING {
            self.schedule(filter);
        } else {
            debug!(
                "filter pool full, queueing pid 0x{:04x} tid 0x{:02x}",
                spec.pid, spec.table_id
            );
            self.waiting.push_back(filter);
        }
    }

    fn schedule(&mut self, filter: SectionFilter) {
        let spec = filter.spec;
        let params = FilterParams {
            pid: spec.pid,
            table_id: Some(spec.table_id),
            table_id_ext: spec.table_id_ext,
            check_crc: true,
        };
        match self.demux.open_filter(&params) {
            Ok(handle) => {
                trace!(
                    "start filter pid 0x{:04x} table_id 0x{:02x}",
                    spec.pid, spec.table_id
                );
                self.running.push(Scheduled {
                    handle,
                    filter,
                    deadline: Instant::now() + spec.timeout * self.timeout_factor,
                    failed: false,
                });
                debug_assert!(self.running.len() <= MAX_RUNNING);
            }
            Err(e) => {
                warn!(
                    "failed to start filter pid 0x{:04x} tid 0x{:02x}: {e:#}",
                    spec.pid, spec.table_id
                );
            }
        }
    }

    /// One multiplexing round: poll every scheduled filter (1 s ceiling),
    /// hand readable sections through reassembly, retire what is complete,
    /// failed or past its deadline, then admit waiting filters.
    pub fn tick(&mut self) -> Vec<DeliveredSection> {
        let mut delivered = Vec::new();

        if !self.running.is_empty() {
            let handles: Vec<&D::Handle> = self.running.iter().map(|s| &s.handle).collect();
            match self.demux.poll(&handles, POLL_CEILING) {
                Ok(readable) => {
                    for idx in 0..self.running.len() {
                        if readable.get(idx).copied().unwrap_or(false) {
                            self.service_filter(idx, &mut delivered);
                        }
                    }
                }
                Err(e) => warn!("poll failed: {e:#}"),
            }
        }

        let now = Instant::now();
        let mut idx = 0;
        while idx < self.running.len() {
            let entry = &self.running[idx];
            let done = entry.filter.table_complete();
            let expired = now >= entry.deadline;
            if entry.failed || expired || (done && entry.filter.spec.run_once) {
                if expired && !done {
                    warn!(
                        "filter timeout pid 0x{:04x} tid 0x{:02x}",
                        entry.filter.spec.pid, entry.filter.spec.table_id
                    );
                } else if done {
                    trace!("filter done pid 0x{:04x}", entry.filter.spec.pid);
                }
                let entry = self.running.swap_remove(idx);
                self.demux.close_filter(entry.handle);
            } else {
                idx += 1;
            }
        }

        while self.running.len() < MAX_RUNNING {
            match self.waiting.pop_front() {
                Some(filter) => self.schedule(filter),
                None => break,
            }
        }

        delivered
    }

    fn service_filter(&mut self, idx: usize, delivered: &mut Vec<DeliveredSection>) {
        let mut buf = [0u8; SECTION_BUF_SIZE];
        let entry = &mut self.running[idx];

        let count = match self.demux.read_section(&mut entry.handle, &mut buf) {
            Ok(ReadOutcome::Section(n)) => n,
            Ok(ReadOutcome::WouldBlock) => return,
            Ok(ReadOutcome::Overflow) => {
                // one retry, then give the filter up
                match self.demux.read_section(&mut entry.handle, &mut buf) {
                    Ok(ReadOutcome::Section(n)) => n,
                    _ => {
                        warn!("filter pid 0x{:04x}: buffer overflow", entry.filter.spec.pid);
                        entry.failed = true;
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("filter pid 0x{:04x}: read error: {e:#}", entry.filter.spec.pid);
                entry.failed = true;
                return;
            }
        };

        let Some(hdr) = SectionHeader::parse(&buf[..count]) else {
            trace!("short read on pid 0x{:04x}, dropped", entry.filter.spec.pid);
            return;
        };
        if count != hdr.total_len() {
            trace!(
                "pid 0x{:04x}: read {} bytes but section says {}, dropped",
                entry.filter.spec.pid,
                count,
                hdr.total_len()
            );
            return;
        }
        let Some(payload) = hdr.payload(&buf[..count]) else {
            warn!(
                "truncated section on pid 0x{:04x} (length {})",
                entry.filter.spec.pid, hdr.section_length
            );
            return;
        };

        match entry.filter.feed(&hdr) {
            FeedOutcome::New => {
                trace!(
                    "pid 0x{:04x} tid 0x{:02x} ext 0x{:04x} {}/{} (version {})",
                    entry.filter.spec.pid,
                    hdr.table_id,
                    hdr.table_id_ext,
                    hdr.section_number,
                    hdr.last_section_number,
                    hdr.version
                );
                delivered.push(DeliveredSection {
                    pid: entry.filter.spec.pid,
                    table_id: hdr.table_id,
                    table_id_ext: hdr.table_id_ext,
                    version: hdr.version,
                    payload: payload.to_vec(),
                });
            }
            FeedOutcome::Duplicate | FeedOutcome::Rejected => {}
        }
    }

    /// Run `tick` until both queues are empty, feeding every delivered
    /// section to `decode`, which may request follow-up filters.
    pub fn drain(&mut self, mut decode: impl FnMut(DeliveredSection) -> Vec<FilterSpec>) {
        while !self.is_empty() {
            for section in self.tick() {
                for spec in decode(section) {
                    self.submit(spec);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::testing::ScriptedDemux;

    fn header(
        table_id: u8,
        table_id_ext: u16,
        version: u8,
        section_number: u8,
        last_section_number: u8,
    ) -> SectionHeader {
        SectionHeader {
            table_id,
            section_length: 9,
            table_id_ext,
            version,
            current_next: true,
            section_number,
            last_section_number,
        }
    }

    /// Full section bytes with an empty payload (header + CRC only).
    fn section_bytes(table_id: u8, ext: u16, version: u8, num: u8, last: u8) -> Vec<u8> {
        section_with_payload(table_id, ext, version, num, last, &[])
    }

    fn section_with_payload(
        table_id: u8,
        ext: u16,
        version: u8,
        num: u8,
        last: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let section_length = 5 + payload.len() + 4;
        let mut buf = vec![
            table_id,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            section_length as u8,
            (ext >> 8) as u8,
            ext as u8,
            0xC0 | (version << 1) | 1,
            num,
            last,
        ];
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&[0; 4]); // CRC, checked by the driver
        buf
    }

    #[test]
    fn test_single_section_completes_immediately() {
        let mut f = SectionFilter::new(FilterSpec::new(0, 0x00));
        assert_eq!(f.feed(&header(0x00, 1, 0, 0, 0)), FeedOutcome::New);
        assert!(f.table_complete());
    }

    #[test]
    fn test_multi_section_completion_out_of_order() {
        let mut f = SectionFilter::new(FilterSpec::new(0, 0x00));
        assert_eq!(f.feed(&header(0x00, 1, 0, 2, 2)), FeedOutcome::New);
        assert!(!f.table_complete());
        assert_eq!(f.feed(&header(0x00, 1, 0, 0, 2)), FeedOutcome::New);
        assert!(!f.table_complete());
        assert_eq!(f.feed(&header(0x00, 1, 0, 1, 2)), FeedOutcome::New);
        assert!(f.table_complete());
    }

    #[test]
    fn test_duplicate_section_not_redelivered() {
        let mut f = SectionFilter::new(FilterSpec::new(0, 0x00));
        assert_eq!(f.feed(&header(0x00, 1, 0, 0, 1)), FeedOutcome::New);
        assert_eq!(f.feed(&header(0x00, 1, 0, 0, 1)), FeedOutcome::Duplicate);
    }

    #[test]
    fn test_wrong_table_id_rejected() {
        let mut f = SectionFilter::new(FilterSpec::new(0x11, 0x42));
        assert_eq!(f.feed(&header(0x46, 1, 0, 0, 0)), FeedOutcome::Rejected);
        assert!(!f.table_complete());
    }

    #[test]
    fn test_version_change_resets_bitmap() {
        let mut f = SectionFilter::new(FilterSpec::new(0, 0x00));
        assert_eq!(f.feed(&header(0x00, 1, 3, 0, 2)), FeedOutcome::New);
        assert_eq!(f.feed(&header(0x00, 1, 3, 1, 2)), FeedOutcome::New);
        // new version before section 2 arrives: collection starts over
        assert_eq!(f.feed(&header(0x00, 1, 4, 0, 2)), FeedOutcome::New);
        assert!(!f.table_complete());
        assert_eq!(f.feed(&header(0x00, 1, 4, 1, 2)), FeedOutcome::New);
        assert_eq!(f.feed(&header(0x00, 1, 4, 2, 2)), FeedOutcome::New);
        assert!(f.table_complete());
    }

    #[test]
    fn test_segmented_fans_out_per_extension() {
        let mut f = SectionFilter::new(FilterSpec::new(0x10, 0x41).segmented());
        assert_eq!(f.feed(&header(0x41, 0x1001, 0, 0, 0)), FeedOutcome::New);
        assert_eq!(f.feed(&header(0x41, 0x1002, 0, 0, 0)), FeedOutcome::New);
        assert_eq!(f.segment_count(), 2);
        // segmented filters wait for their deadline, never complete
        assert!(!f.table_complete());
    }

    #[test]
    fn test_segmented_same_extension_does_not_fan_out() {
        let mut f = SectionFilter::new(FilterSpec::new(0x10, 0x41).segmented());
        assert_eq!(f.feed(&header(0x41, 0x1001, 0, 0, 1)), FeedOutcome::New);
        assert_eq!(f.feed(&header(0x41, 0x1001, 0, 1, 1)), FeedOutcome::New);
        assert_eq!(f.feed(&header(0x41, 0x1001, 0, 0, 1)), FeedOutcome::Duplicate);
        assert_eq!(f.segment_count(), 1);
    }

    #[test]
    fn test_pool_delivers_and_retires_run_once() {
        let mut demux = ScriptedDemux::new();
        demux.script(0x0000, section_with_payload(0x00, 1, 0, 0, 0, &[0, 1, 0xE1, 0]));
        let mut pool = FilterPool::new(demux, false);
        pool.submit(FilterSpec::new(0x0000, 0x00));
        assert_eq!(pool.scheduled_len(), 1);

        let delivered = pool.tick();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].table_id, 0x00);
        assert_eq!(delivered[0].payload, vec![0, 1, 0xE1, 0]);
        assert_eq!(pool.scheduled_len(), 0);
        assert!(pool.is_empty());
        // the hardware filter was opened once and released on completion
        assert_eq!(pool.demux.opened, 1);
        assert_eq!(pool.demux.closed, 1);
    }

    #[test]
    fn test_pool_duplicate_submit_ignored() {
        let mut pool = FilterPool::new(ScriptedDemux::new(), false);
        pool.submit(FilterSpec::new(0x100, 0x02).with_ext(1));
        pool.submit(FilterSpec::new(0x100, 0x02).with_ext(1));
        assert_eq!(pool.scheduled_len(), 1);
        // a different extension on the same PID is a different filter
        pool.submit(FilterSpec::new(0x100, 0x02).with_ext(2));
        assert_eq!(pool.scheduled_len(), 2);
    }

    #[test]
    fn test_pool_capacity_and_waiting_queue() {
        let mut pool = FilterPool::new(ScriptedDemux::new(), false);
        for pid in 0..30u16 {
            pool.submit(FilterSpec::new(pid, 0x02).with_timeout(Duration::ZERO));
        }
        assert_eq!(pool.scheduled_len(), MAX_RUNNING);
        assert_eq!(pool.waiting_len(), 3);

        // zero deadlines: the first tick retires all 27 and admits the rest
        pool.tick();
        assert_eq!(pool.waiting_len(), 0);
        assert!(pool.scheduled_len() <= MAX_RUNNING);
        while !pool.is_empty() {
            pool.tick();
        }
    }

    #[test]
    fn test_pool_filter_timeout_retired_without_data() {
        let mut pool = FilterPool::new(ScriptedDemux::new(), false);
        pool.submit(FilterSpec::new(0x0300, 0x02).with_timeout(Duration::from_secs(1)));
        assert_eq!(pool.scheduled_len(), 1);

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(1100) {
            pool.tick();
        }
        assert_eq!(pool.scheduled_len(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_long_timeout_factor() {
        let mut pool = FilterPool::new(ScriptedDemux::new(), true);
        pool.submit(FilterSpec::new(0x0300, 0x02).with_timeout(Duration::from_millis(100)));
        // 100 ms deadline is stretched to 500 ms
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(300) {
            pool.tick();
        }
        assert_eq!(pool.scheduled_len(), 1);
        while start.elapsed() < Duration::from_millis(600) {
            pool.tick();
        }
        assert_eq!(pool.scheduled_len(), 0);
    }

    #[test]
    fn test_pool_overflow_retry_once() {
        let mut demux = ScriptedDemux::new();
        demux.script_with_overflow(0x0000, section_bytes(0x00, 1, 0, 0, 0));
        let mut pool = FilterPool::new(demux, false);
        pool.submit(FilterSpec::new(0x0000, 0x00));
        let delivered = pool.tick();
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn test_pool_drops_section_with_bad_length() {
        let mut demux = ScriptedDemux::new();
        let mut bytes = section_bytes(0x00, 1, 0, 0, 0);
        bytes.pop(); // one byte short of the declared section_length
        demux.script(0x0000, bytes);
        let mut pool = FilterPool::new(demux, false);
        pool.submit(FilterSpec::new(0x0000, 0x00).with_timeout(Duration::from_millis(50)));
        let delivered = pool.tick();
        assert!(delivered.is_empty());
    }

    #[test]
    fn test_pool_drain_schedules_follow_ups() {
        let mut demux = ScriptedDemux::new();
        demux.script(0x0000, section_with_payload(0x00, 1, 0, 0, 0, &[0, 1, 0xE1, 0]));
        demux.script(0x0100, section_with_payload(0x02, 1, 0, 0, 0, &[0xE0, 0x20, 0xF0, 0x00]));
        let mut pool = FilterPool::new(demux, false);
        pool.submit(FilterSpec::new(0x0000, 0x00).with_timeout(Duration::from_millis(100)));

        let mut seen = Vec::new();
        pool.drain(|section| {
            seen.push(section.table_id);
            if section.table_id == 0x00 {
                vec![
                    FilterSpec::new(0x0100, 0x02)
                        .with_ext(1)
                        .with_timeout(Duration::from_millis(100)),
                ]
            } else {
                Vec::new()
            }
        });
        assert_eq!(seen, vec![0x00, 0x02]);
        assert!(pool.is_empty());
    }
}
