//! In-memory transponder and service model.
//!
//! Transponders are deduplicated by frequency rather than by network/TS id:
//! broadcasters do not coordinate their numbering, and different NITs may
//! list the same multiplex with slightly different frequencies, so equality
//! is "within 2 MHz".

use log::{debug, warn};

use crate::tuner::TuningParams;

pub const AUDIO_CHAN_MAX: usize = 32;
pub const CA_SYSTEM_ID_MAX: usize = 16;

/// Frequencies closer than this refer to the same multiplex.
pub const FREQUENCY_TOLERANCE_HZ: u32 = 2_000_000;

pub fn same_frequency(f1: u32, f2: u32) -> bool {
    f1.abs_diff(f2) < FREQUENCY_TOLERANCE_HZ
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunningStatus {
    #[default]
    Undefined,
    NotRunning,
    StartsSoon,
    Pausing,
    Running,
}

impl RunningStatus {
    pub fn from_bits(bits: u8) -> RunningStatus {
        match bits {
            0x01 => RunningStatus::NotRunning,
            0x02 => RunningStatus::StartsSoon,
            0x03 => RunningStatus::Pausing,
            0x04 => RunningStatus::Running,
            _ => RunningStatus::Undefined,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RunningStatus::Undefined => "???",
            RunningStatus::NotRunning => "not running",
            RunningStatus::StartsSoon => "starts soon",
            RunningStatus::Pausing => "pausing",
            RunningStatus::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTrack {
    pub pid: u16,
    pub lang: [u8; 3],
}

impl AudioTrack {
    pub fn new(pid: u16) -> AudioTrack {
        AudioTrack { pid, lang: [0; 3] }
    }

    pub fn lang_str(&self) -> &str {
        if self.lang[0] == 0 {
            ""
        } else {
            std::str::from_utf8(&self.lang).unwrap_or("")
        }
    }
}

/// One virtual channel within a multiplex, keyed by service_id.
#[derive(Debug, Clone, Default)]
pub struct Service {
    pub service_id: u16,
    pub transport_stream_id: u16,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub video_pid: u16,
    pub audio: Vec<AudioTrack>,
    pub ca_ids: Vec<u16>,
    pub teletext_pid: u16,
    pub subtitling_pid: u16,
    pub ac3_pid: u16,
    pub provider_name: Option<String>,
    pub service_name: Option<String>,
    pub service_type: u8,
    pub scrambled: bool,
    pub running: RunningStatus,
    /// ATSC major/minor packed as `(major << 10) | minor`.
    pub channel_num: Option<u16>,
    /// A PMT filter has already been requested for this service.
    pub pmt_requested: bool,
}

impl Service {
    pub fn new(service_id: u16, transport_stream_id: u16) -> Service {
        Service {
            service_id,
            transport_stream_id,
            ..Service::default()
        }
    }

    /// Add an audio track, up to [`AUDIO_CHAN_MAX`]. Returns the slot just
    /// filled, or `None` when the table carries more tracks than we keep.
    pub fn push_audio(&mut self, pid: u16) -> Option<&mut AudioTrack> {
        if self.audio.len() >= AUDIO_CHAN_MAX {
            warn!(
                "service 0x{:04x}: more than {AUDIO_CHAN_MAX} audio channels, truncating",
                self.service_id
            );
            return None;
        }
        self.audio.push(AudioTrack::new(pid));
        self.audio.last_mut()
    }

    /// Record CA system ids, truncating past [`CA_SYSTEM_ID_MAX`].
    pub fn set_ca_ids(&mut self, ids: &[u16]) {
        let keep = ids.len().min(CA_SYSTEM_ID_MAX);
        if keep < ids.len() {
            warn!("service 0x{:04x}: too many CA system ids", self.service_id);
        }
        self.ca_ids = ids[..keep].to_vec();
    }

    pub fn display_name(&self) -> String {
        match &self.service_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("[{:04x}]", self.service_id),
        }
    }
}

/// One tuned (or tunable) multiplex with the services found on it.
#[derive(Debug, Clone, Default)]
pub struct Transponder {
    pub params: TuningParams,
    pub network_id: u16,
    pub original_network_id: u16,
    pub transport_stream_id: u16,
    pub services: Vec<Service>,
    pub scan_done: bool,
    pub last_tuning_failed: bool,
    pub other_frequency_flag: bool,
    /// Stub recording a frequency that turned out to be wrong for this TS.
    pub wrong_frequency: bool,
    /// Alternate frequencies from the NIT frequency-list descriptor.
    pub other_frequencies: Vec<u32>,
}

impl Transponder {
    pub fn new(params: TuningParams) -> Transponder {
        Transponder {
            params,
            ..Transponder::default()
        }
    }

    pub fn find_service(&self, service_id: u16) -> Option<&Service> {
        self.services.iter().find(|s| s.service_id == service_id)
    }

    pub fn find_service_mut(&mut self, service_id: u16) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.service_id == service_id)
    }

    /// Service allocation; service_ids are unique within one transponder.
    pub fn ensure_service(&mut self, service_id: u16) -> &mut Service {
        if let Some(idx) = self.services.iter().position(|s| s.service_id == service_id) {
            return &mut self.services[idx];
        }
        debug!(
            "new service 0x{service_id:04x} on f={} Hz",
            self.params.frequency
        );
        self.services
            .push(Service::new(service_id, self.transport_stream_id));
        self.services.last_mut().unwrap()
    }

    /// Take over identity and delivery parameters from `src`, typically a
    /// scratch transponder decoded out of a NIT. A transport_stream_id
    /// change is propagated to already allocated services, since SDT or NIT
    /// may arrive before the correct TSID is known. Scan state flags are
    /// not touched.
    pub fn absorb(&mut self, src: &Transponder) {
        if self.transport_stream_id != src.transport_stream_id {
            for service in &mut self.services {
                service.transport_stream_id = src.transport_stream_id;
            }
        }
        self.network_id = src.network_id;
        self.original_network_id = src.original_network_id;
        self.transport_stream_id = src.transport_stream_id;
        self.params = src.params.clone();
        self.other_frequency_flag = src.other_frequency_flag;
        self.other_frequencies = src.other_frequencies.clone();
    }
}

/// The whole scan state: what has been visited, what is still queued, and
/// the multiplex currently under the tuner.
#[derive(Debug, Default)]
pub struct Scanner {
    pub scanned: Vec<Transponder>,
    pub pending: Vec<Transponder>,
    current: Option<Transponder>,
    current_only: bool,
}

impl Scanner {
    pub fn new(current_only: bool) -> Scanner {
        Scanner {
            current_only,
            ..Scanner::default()
        }
    }

    pub fn alloc_pending(&mut self, params: TuningParams) -> &mut Transponder {
        debug!("queueing transponder f={} Hz", params.frequency);
        self.pending.push(Transponder::new(params));
        self.pending.last_mut().unwrap()
    }

    pub fn pop_pending(&mut self) -> Option<Transponder> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    /// Start scanning `tp`: it is counted as visited from this point on,
    /// whether or not tuning succeeds.
    pub fn begin(&mut self, mut tp: Transponder) {
        tp.scan_done = true;
        self.current = Some(tp);
    }

    /// File the transponder under scanned and leave no current multiplex.
    pub fn finish(&mut self) {
        if let Some(tp) = self.current.take() {
            self.scanned.push(tp);
        }
    }

    pub fn current(&self) -> Option<&Transponder> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Transponder> {
        self.current.as_mut()
    }

    pub fn has_transponder(&self, frequency: u32) -> bool {
        if self.current_only {
            return true;
        }
        self.current
            .iter()
            .chain(self.scanned.iter())
            .chain(self.pending.iter())
            .any(|tp| same_frequency(tp.params.frequency, frequency))
    }

    /// Fold a scratch transponder decoded from a NIT into the store: update
    /// the equivalent known transponder if there is one, else queue it.
    pub fn reconcile(&mut self, scratch: Transponder) {
        let frequency = scratch.params.frequency;
        if let Some(tp) = self.find_transponder_mut(frequency) {
            tp.absorb(&scratch);
            return;
        }
        debug!("NIT names unknown transponder f={frequency} Hz");
        self.alloc_pending(scratch.params.clone()).absorb(&scratch);
    }

    fn find_transponder_mut(&mut self, frequency: u32) -> Option<&mut Transponder> {
        if self.current_only {
            return self.current.as_mut();
        }
        self.current
            .iter_mut()
            .chain(self.scanned.iter_mut())
            .chain(self.pending.iter_mut())
            .find(|tp| same_frequency(tp.params.frequency, frequency))
    }

    /// Service lookup/allocation on the multiplex currently being scanned.
    /// `None` when no scan is in progress (a stray late section).
    pub fn ensure_service(&mut self, service_id: u16) -> Option<&mut Service> {
        match self.current.as_mut() {
            Some(tp) => Some(tp.ensure_service(service_id)),
            None => {
                warn!("service 0x{service_id:04x} seen outside any transponder scan");
                None
            }
        }
    }

    pub fn find_service_mut(&mut self, service_id: u16) -> Option<&mut Service> {
        self.current.as_mut()?.find_service_mut(service_id)
    }

    /// Logical channel number assignment; applies to every service with a
    /// matching id on any visited multiplex.
    pub fn assign_channel_number(&mut self, service_id: u16, channel_num: u16) {
        for tp in self.current.iter_mut().chain(self.scanned.iter_mut()) {
            for service in &mut tp.services {
                if service.service_id == service_id {
                    service.channel_num = Some(channel_num);
                }
            }
        }
    }

    /// Remember that the current transponder was broadcast with a frequency
    /// that did not lock, before retrying on an alternate: a stub keeps the
    /// bad frequency out of future dedup decisions.
    pub fn record_wrong_frequency(&mut self, old_frequency: u32) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        let mut stub = Transponder::new(current.params.clone());
        stub.params.frequency = old_frequency;
        stub.network_id = current.network_id;
        stub.original_network_id = current.original_network_id;
        stub.transport_stream_id = current.transport_stream_id;
        stub.scan_done = true;
        stub.wrong_frequency = true;
        self.scanned.push(stub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::Modulation;

    fn atsc_tp(frequency: u32) -> Transponder {
        Transponder::new(TuningParams::atsc(frequency, Modulation::Vsb8))
    }

    #[test]
    fn test_same_frequency_tolerance() {
        assert!(same_frequency(473_000_000, 473_000_000));
        assert!(same_frequency(473_000_000, 474_999_999));
        assert!(!same_frequency(473_000_000, 475_000_000));
        assert!(same_frequency(474_999_999, 473_000_000));
    }

    #[test]
    fn test_ensure_service_allocates_once() {
        let mut tp = atsc_tp(473_000_000);
        tp.transport_stream_id = 0x0042;
        tp.ensure_service(3).video_pid = 0x31;
        let s = tp.ensure_service(3);
        assert_eq!(s.video_pid, 0x31);
        assert_eq!(s.transport_stream_id, 0x0042);
        assert_eq!(tp.services.len(), 1);
    }

    #[test]
    fn test_audio_track_cap() {
        let mut s = Service::new(1, 0);
        for pid in 0..AUDIO_CHAN_MAX as u16 {
            assert!(s.push_audio(0x100 + pid).is_some());
        }
        assert!(s.push_audio(0x200).is_none());
        assert_eq!(s.audio.len(), AUDIO_CHAN_MAX);
    }

    #[test]
    fn test_ca_id_cap() {
        let mut s = Service::new(1, 0);
        let ids: Vec<u16> = (0..20).collect();
        s.set_ca_ids(&ids);
        assert_eq!(s.ca_ids.len(), CA_SYSTEM_ID_MAX);
        assert_eq!(s.ca_ids[15], 15);
    }

    #[test]
    fn test_absorb_propagates_tsid_to_services() {
        let mut tp = atsc_tp(473_000_000);
        tp.transport_stream_id = 1;
        tp.ensure_service(7);
        let mut src = atsc_tp(473_100_000);
        src.transport_stream_id = 9;
        tp.absorb(&src);
        assert_eq!(tp.transport_stream_id, 9);
        assert_eq!(tp.services[0].transport_stream_id, 9);
    }

    #[test]
    fn test_absorb_keeps_scan_flags() {
        let mut tp = atsc_tp(473_000_000);
        tp.scan_done = true;
        tp.last_tuning_failed = true;
        let src = atsc_tp(473_000_000);
        tp.absorb(&src);
        assert!(tp.scan_done);
        assert!(tp.last_tuning_failed);
    }

    #[test]
    fn test_reconcile_updates_near_match() {
        let mut scanner = Scanner::new(false);
        scanner.alloc_pending(TuningParams::atsc(473_000_000, Modulation::Vsb8));
        let mut scratch = atsc_tp(473_500_000);
        scratch.network_id = 0x11;
        scanner.reconcile(scratch);
        assert_eq!(scanner.pending.len(), 1);
        assert_eq!(scanner.pending[0].network_id, 0x11);
    }

    #[test]
    fn test_reconcile_queues_new_transponder() {
        let mut scanner = Scanner::new(false);
        scanner.alloc_pending(TuningParams::atsc(473_000_000, Modulation::Vsb8));
        scanner.reconcile(atsc_tp(479_000_000));
        assert_eq!(scanner.pending.len(), 2);
        assert!(!scanner.pending[1].scan_done);
    }

    #[test]
    fn test_pairwise_distinct_frequencies_after_reconcile() {
        let mut scanner = Scanner::new(false);
        for mhz in [473, 479, 485] {
            scanner.reconcile(atsc_tp(mhz * 1_000_000));
        }
        scanner.reconcile(atsc_tp(473_900_000)); // dup of the first
        let freqs: Vec<u32> = scanner.pending.iter().map(|t| t.params.frequency).collect();
        assert_eq!(freqs.len(), 3);
        for (i, a) in freqs.iter().enumerate() {
            for b in &freqs[i + 1..] {
                assert!(a.abs_diff(*b) >= FREQUENCY_TOLERANCE_HZ);
            }
        }
    }

    #[test]
    fn test_begin_marks_scan_done_and_finish_files_it() {
        let mut scanner = Scanner::new(false);
        scanner.begin(atsc_tp(473_000_000));
        assert!(scanner.current().unwrap().scan_done);
        scanner.finish();
        assert!(scanner.current().is_none());
        assert_eq!(scanner.scanned.len(), 1);
        assert!(scanner.scanned[0].scan_done);
        for tp in &scanner.pending {
            assert!(!tp.scan_done);
        }
    }

    #[test]
    fn test_current_only_maps_everything_to_current() {
        let mut scanner = Scanner::new(true);
        scanner.begin(atsc_tp(0));
        let mut scratch = atsc_tp(575_000_000);
        scratch.transport_stream_id = 0x77;
        scanner.reconcile(scratch);
        assert!(scanner.pending.is_empty());
        assert_eq!(scanner.current().unwrap().transport_stream_id, 0x77);
        assert!(scanner.has_transponder(999_000_000));
    }

    #[test]
    fn test_record_wrong_frequency_stub() {
        let mut scanner = Scanner::new(false);
        let mut tp = atsc_tp(575_000_000);
        tp.other_frequencies = vec![569_000_000];
        scanner.begin(tp);
        scanner.record_wrong_frequency(575_000_000);
        assert_eq!(scanner.scanned.len(), 1);
        let stub = &scanner.scanned[0];
        assert!(stub.wrong_frequency);
        assert!(stub.scan_done);
        assert_eq!(stub.params.frequency, 575_000_000);
    }

    #[test]
    fn test_assign_channel_number_across_transponders() {
        let mut scanner = Scanner::new(false);
        let mut done = atsc_tp(473_000_000);
        done.ensure_service(0x200);
        done.scan_done = true;
        scanner.scanned.push(done);
        scanner.begin(atsc_tp(479_000_000));
        let _ = scanner.ensure_service(0x200);
        scanner.assign_channel_number(0x200, 12);
        assert_eq!(scanner.scanned[0].services[0].channel_num, Some(12));
        assert_eq!(scanner.current().unwrap().services[0].channel_num, Some(12));
    }
}
