//! The scan loop.
//!
//! Seed the ATSC channel plan, then for every pending transponder: tune,
//! wait for a lock, seed the initial filter set and drain the pool while
//! table decoders grow the store (and sometimes the pending queue). The
//! controller is generic over the frontend and demux surfaces so the whole
//! cycle runs against scripted devices in tests.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};

use crate::demux::Demux;
use crate::filter::{FilterPool, FilterSpec};
use crate::plan;
use crate::store::{Scanner, Transponder};
use crate::tables::{self, CVCT_TID, DecodeOptions, PAT_PID, PAT_TID, PSIP_PID, TVCT_TID};
use crate::tuner::{FeStatus, Frontend, Modulation, SignalStats, TuningParams};

pub const LOCK_POLL_ATTEMPTS: u32 = 10;
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub const ATSC_TYPE_TERRESTRIAL: u8 = 0x1;
pub const ATSC_TYPE_CABLE: u8 = 0x2;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Multiply all filter timeouts by 5 (non-compliant repetition rates).
    pub long_timeout: bool,
    /// Scan with PAT/PMT only, skipping the PSIP tables.
    pub no_psip: bool,
    /// Which VCT flavours to ask for: terrestrial, cable or both.
    pub atsc_type_mask: u8,
    /// Harvest whatever the frontend is currently tuned to, nothing else.
    pub current_tp_only: bool,
    /// Honour the user-private logical-channel-number descriptor.
    pub uk_channel_numbers: bool,
}

impl Default for ScanOptions {
    fn default() -> ScanOptions {
        ScanOptions {
            long_timeout: false,
            no_psip: false,
            atsc_type_mask: ATSC_TYPE_TERRESTRIAL,
            current_tp_only: false,
            uk_channel_numbers: false,
        }
    }
}

/// Signal snapshot of one locked multiplex, for the report.
#[derive(Debug, Clone)]
pub struct MultiplexReading {
    pub frequency: u32,
    pub rf_channel: Option<u32>,
    pub stats: SignalStats,
}

pub struct ScanController<F: Frontend, D: Demux> {
    frontend: F,
    pool: FilterPool<D>,
    pub scanner: Scanner,
    pub readings: Vec<MultiplexReading>,
    opts: ScanOptions,
}

impl<F: Frontend, D: Demux> ScanController<F, D> {
    pub fn new(frontend: F, demux: D, opts: ScanOptions) -> ScanController<F, D> {
        ScanController {
            frontend,
            pool: FilterPool::new(demux, opts.long_timeout),
            scanner: Scanner::new(opts.current_tp_only),
            readings: Vec::new(),
            opts,
        }
    }

    /// Queue one pending transponder per RF channel of the ATSC plan.
    pub fn seed_channel_plan(&mut self) {
        for chan in plan::channels() {
            if let Some(mhz) = plan::channel_to_mhz(chan) {
                self.scanner
                    .alloc_pending(TuningParams::atsc(mhz * 1_000_000, Modulation::Vsb8));
            }
        }
        info!("seeded {} candidate channels", self.scanner.pending.len());
    }

    /// Scan everything: the channel plan plus whatever the NIT adds along
    /// the way. With `current_tp_only` the tuner is left alone and only the
    /// already tuned multiplex is harvested.
    pub fn run(&mut self) -> Result<()> {
        if self.opts.current_tp_only {
            self.scanner
                .begin(Transponder::new(TuningParams::atsc(0, Modulation::Vsb8)));
            self.harvest_current();
            self.scanner.finish();
            return Ok(());
        }

        self.seed_channel_plan();
        while let Some(tp) = self.scanner.pop_pending() {
            self.scan_transponder(tp);
        }
        Ok(())
    }

    pub(crate) fn scan_transponder(&mut self, tp: Transponder) {
        self.scanner.begin(tp);
        loop {
            if self.tune_current() {
                self.take_reading();
                self.harvest_current();
                break;
            }
            if !self.retry_on_alternate() {
                break;
            }
        }
        self.scanner.finish();
    }

    fn tune_current(&mut self) -> bool {
        let Some(params) = self.scanner.current().map(|tp| tp.params.clone()) else {
            return false;
        };
        info!(
            ">>> tune to {} Hz ({})",
            params.frequency,
            params.modulation.name()
        );

        if params.delivery != self.frontend.delivery_system() {
            if let Err(e) = self.frontend.set_delivery_system(params.delivery) {
                warn!("failed to switch delivery system: {e:#}");
            }
        }
        if params.delivery != self.frontend.delivery_system() {
            warn!(
                "frontend type ({}) is not compatible with requested tuning type ({})",
                self.frontend.delivery_system().name(),
                params.delivery.name()
            );
            if let Some(tp) = self.scanner.current_mut() {
                tp.last_tuning_failed = true;
            }
            return false;
        }

        // one immediate re-try, a marginal signal sometimes locks second time
        for _ in 0..2 {
            if self.try_lock(&params) {
                if let Some(tp) = self.scanner.current_mut() {
                    tp.last_tuning_failed = false;
                }
                return true;
            }
        }
        warn!(">>> tuning failed");
        if let Some(tp) = self.scanner.current_mut() {
            tp.last_tuning_failed = true;
        }
        false
    }

    fn try_lock(&mut self, params: &TuningParams) -> bool {
        if let Err(e) = self.frontend.tune(params) {
            warn!("setting frontend parameters failed: {e:#}");
            return false;
        }
        for _ in 0..LOCK_POLL_ATTEMPTS {
            thread::sleep(LOCK_POLL_INTERVAL);
            match self.frontend.read_status() {
                Ok(status) if status.contains(FeStatus::HAS_LOCK) => return true,
                Ok(_) => {}
                Err(e) => {
                    warn!("FE_READ_STATUS failed: {e:#}");
                    return false;
                }
            }
        }
        false
    }

    /// On a failed lock with the other-frequency flag set, move the current
    /// transponder to its next alternate frequency and signal a retry. A
    /// stub entry remembers the frequency that did not work.
    fn retry_on_alternate(&mut self) -> bool {
        loop {
            let Some(tp) = self.scanner.current_mut() else {
                return false;
            };
            if !tp.other_frequency_flag {
                return false;
            }
            let Some(freq) = tp.other_frequencies.pop() else {
                return false;
            };
            if self.scanner.has_transponder(freq) {
                continue;
            }
            let old = self
                .scanner
                .current()
                .map(|t| t.params.frequency)
                .unwrap_or(0);
            self.scanner.record_wrong_frequency(old);
            if let Some(tp) = self.scanner.current_mut() {
                tp.params.frequency = freq;
                info!("retrying with f={freq}");
            }
            return true;
        }
    }

    /// Seed the initial filters for the tuned multiplex and drain them to
    /// completion; PMT filters join dynamically as PAT entries arrive.
    fn harvest_current(&mut self) {
        if self.opts.no_psip {
            self.pool.submit(FilterSpec::new(PAT_PID, PAT_TID));
        } else {
            if self.opts.atsc_type_mask & ATSC_TYPE_TERRESTRIAL != 0 {
                self.pool.submit(FilterSpec::new(PSIP_PID, TVCT_TID));
            }
            if self.opts.atsc_type_mask & ATSC_TYPE_CABLE != 0 {
                self.pool.submit(FilterSpec::new(PSIP_PID, CVCT_TID));
            }
            self.pool.submit(FilterSpec::new(PAT_PID, PAT_TID));
        }

        let fe_delivery = self.frontend.delivery_system();
        let decode_opts = DecodeOptions {
            uk_channel_numbers: self.opts.uk_channel_numbers,
        };
        let scanner = &mut self.scanner;
        self.pool
            .drain(|section| tables::decode_section(scanner, fe_delivery, &decode_opts, &section));
    }

    fn take_reading(&mut self) {
        let Some(frequency) = self.scanner.current().map(|tp| tp.params.frequency) else {
            return;
        };
        let stats = self.frontend.signal_stats();
        debug!(
            "signal f={frequency}: strength {:?} snr {:?} ber {:?} unc {:?}",
            stats.signal_strength, stats.snr, stats.ber, stats.uncorrected_blocks
        );
        self.readings.push(MultiplexReading {
            frequency,
            rf_channel: plan::mhz_to_channel(frequency / 1_000_000),
            stats,
        });
    }

    pub fn into_results(self) -> (Scanner, Vec<MultiplexReading>) {
        (self.scanner, self.readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::testing::ScriptedDemux;
    use crate::tuner::DeliverySystem;
    use anyhow::bail;

    struct ScriptedFrontend {
        delivery: DeliverySystem,
        locks: bool,
        tune_fails: bool,
        switch_fails: bool,
        tune_calls: usize,
    }

    impl ScriptedFrontend {
        fn locking() -> ScriptedFrontend {
            ScriptedFrontend {
                delivery: DeliverySystem::Atsc,
                locks: true,
                tune_fails: false,
                switch_fails: false,
                tune_calls: 0,
            }
        }

        fn dead() -> ScriptedFrontend {
            ScriptedFrontend {
                tune_fails: true,
                ..ScriptedFrontend::locking()
            }
        }
    }

    impl Frontend for ScriptedFrontend {
        fn delivery_system(&self) -> DeliverySystem {
            self.delivery
        }

        fn set_delivery_system(&mut self, delivery: DeliverySystem) -> Result<()> {
            if self.switch_fails {
                bail!("delivery system rejected");
            }
            self.delivery = delivery;
            Ok(())
        }

        fn tune(&mut self, _params: &TuningParams) -> Result<()> {
            self.tune_calls += 1;
            if self.tune_fails {
                bail!("tuner gone");
            }
            Ok(())
        }

        fn read_status(&mut self) -> Result<FeStatus> {
            Ok(if self.locks {
                FeStatus::HAS_LOCK | FeStatus::HAS_SIGNAL
            } else {
                FeStatus::empty()
            })
        }

        fn signal_stats(&mut self) -> SignalStats {
            SignalStats {
                signal_strength: Some(0x7000),
                snr: Some(220),
                ber: Some(0),
                uncorrected_blocks: Some(0),
            }
        }
    }

    fn section(table_id: u8, ext: u16, payload: &[u8]) -> Vec<u8> {
        let section_length = 5 + payload.len() + 4;
        let mut buf = vec![
            table_id,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            section_length as u8,
            (ext >> 8) as u8,
            ext as u8,
            0xC1,
            0,
            0,
        ];
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&[0; 4]);
        buf
    }

    fn atsc_tp(frequency: u32) -> Transponder {
        Transponder::new(TuningParams::atsc(frequency, Modulation::Vsb8))
    }

    fn fast_options() -> ScanOptions {
        ScanOptions {
            no_psip: true,
            ..ScanOptions::default()
        }
    }

    #[test]
    fn test_locked_multiplex_is_harvested() {
        let mut demux = ScriptedDemux::new();
        demux.script(PAT_PID, section(PAT_TID, 1, &[0x00, 0x03, 0xE1, 0x00]));
        demux.script(0x0100, section(0x02, 3, &[0xE0, 0x40, 0xF0, 0x00, 0x02, 0xE2, 0x00, 0xF0, 0x00]));

        let mut ctl = ScanController::new(ScriptedFrontend::locking(), demux, fast_options());
        ctl.scan_transponder(atsc_tp(551_000_000));

        assert_eq!(ctl.scanner.scanned.len(), 1);
        let tp = &ctl.scanner.scanned[0];
        assert!(tp.scan_done);
        assert!(!tp.last_tuning_failed);
        assert_eq!(tp.services.len(), 1);
        let s = &tp.services[0];
        assert_eq!(s.service_id, 3);
        assert_eq!(s.pmt_pid, 0x0100);
        assert_eq!(s.pcr_pid, 0x0040);
        assert_eq!(s.video_pid, 0x0200);

        assert_eq!(ctl.readings.len(), 1);
        assert_eq!(ctl.readings[0].frequency, 551_000_000);
        assert_eq!(ctl.readings[0].rf_channel, Some(27));
    }

    #[test]
    fn test_tuning_failure_marks_transponder() {
        let mut ctl = ScanController::new(
            ScriptedFrontend::dead(),
            ScriptedDemux::new(),
            fast_options(),
        );
        ctl.scan_transponder(atsc_tp(563_000_000));

        assert_eq!(ctl.scanner.scanned.len(), 1);
        assert!(ctl.scanner.scanned[0].last_tuning_failed);
        assert!(ctl.scanner.scanned[0].scan_done);
        assert!(ctl.readings.is_empty());
    }

    #[test]
    fn test_alternate_frequency_retry_leaves_stub() {
        let mut tp = atsc_tp(575_000_000);
        tp.other_frequency_flag = true;
        tp.other_frequencies = vec![581_000_000];

        let mut ctl = ScanController::new(
            ScriptedFrontend::dead(),
            ScriptedDemux::new(),
            fast_options(),
        );
        ctl.scan_transponder(tp);

        // the failed frequency is remembered as a wrong-frequency stub and
        // the transponder itself ends up on the alternate
        assert_eq!(ctl.scanner.scanned.len(), 2);
        let stub = &ctl.scanner.scanned[0];
        assert!(stub.wrong_frequency);
        assert_eq!(stub.params.frequency, 575_000_000);
        let tp = &ctl.scanner.scanned[1];
        assert_eq!(tp.params.frequency, 581_000_000);
        assert!(tp.last_tuning_failed);
    }

    #[test]
    fn test_alternate_already_known_is_skipped() {
        let mut tp = atsc_tp(575_000_000);
        tp.other_frequency_flag = true;
        // both alternates equivalent to an already scanned transponder
        tp.other_frequencies = vec![551_500_000, 551_000_000];

        let mut ctl = ScanController::new(
            ScriptedFrontend::dead(),
            ScriptedDemux::new(),
            fast_options(),
        );
        let mut known = atsc_tp(551_000_000);
        known.scan_done = true;
        ctl.scanner.scanned.push(known);
        ctl.scan_transponder(tp);

        // no usable alternate: no stub, just the failed transponder
        assert_eq!(ctl.scanner.scanned.len(), 2);
        assert!(ctl.scanner.scanned[1].last_tuning_failed);
        assert!(!ctl.scanner.scanned.iter().any(|t| t.wrong_frequency));
    }

    #[test]
    fn test_current_tp_only_run_skips_tuner() {
        let mut demux = ScriptedDemux::new();
        demux.script(PAT_PID, section(PAT_TID, 1, &[0x00, 0x07, 0xE0, 0x90]));
        demux.script(0x0090, section(0x02, 7, &[0xE0, 0x91, 0xF0, 0x00]));

        let opts = ScanOptions {
            current_tp_only: true,
            no_psip: true,
            ..ScanOptions::default()
        };
        let mut ctl = ScanController::new(ScriptedFrontend::dead(), demux, opts);
        ctl.run().unwrap();

        // never touched the tuner
        let (scanner, readings) = {
            assert_eq!(ctl.frontend.tune_calls, 0);
            ctl.into_results()
        };
        assert!(readings.is_empty());
        assert_eq!(scanner.scanned.len(), 1);
        assert_eq!(scanner.scanned[0].services.len(), 1);
        assert_eq!(scanner.scanned[0].services[0].service_id, 7);
    }

    #[test]
    fn test_psip_seeding_respects_type_mask() {
        // both VCT flavours requested: cable VCT arrives, terrestrial times
        // out quietly; the cable channel still lands in the store
        let mut descs = vec![
            0xA1, 0x09, 0xE0, 0x51, 1, 0x02, 0xE0, 0x52, 0x00, 0x00, 0x00,
        ];
        descs[1] = (descs.len() - 2) as u8;
        let mut rec = vec![0u8; 32];
        for (i, unit) in "HBO".encode_utf16().enumerate() {
            rec[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        rec[14] = 0xF0;
        rec[15] = 2 << 2; // major 2, minor 0 high bits
        rec[16] = 1;
        rec[24..26].copy_from_slice(&9u16.to_be_bytes());
        rec[27] = 0xC0 | 0x02;
        rec[30] = 0xFC;
        rec[31] = descs.len() as u8;
        let mut vct = vec![0x00, 1];
        vct.extend_from_slice(&rec);
        vct.extend_from_slice(&descs);

        let mut demux = ScriptedDemux::new();
        demux.script(PSIP_PID, section(CVCT_TID, 1, &vct));
        demux.script(PAT_PID, section(PAT_TID, 1, &[0x00, 0x09, 0xE0, 0x90]));
        demux.script(0x0090, section(0x02, 9, &[0xE0, 0x51, 0xF0, 0x00]));

        let opts = ScanOptions {
            atsc_type_mask: ATSC_TYPE_TERRESTRIAL | ATSC_TYPE_CABLE,
            ..ScanOptions::default()
        };
        let mut ctl = ScanController::new(ScriptedFrontend::locking(), demux, opts);
        ctl.scan_transponder(atsc_tp(605_000_000));

        let tp = &ctl.scanner.scanned[0];
        let s = tp.find_service(9).unwrap();
        assert_eq!(s.service_name.as_deref(), Some("HBO"));
        assert_eq!(s.channel_num, Some((2 << 10) | 1));
        assert_eq!(s.video_pid, 0x52);
        assert_eq!(s.pmt_pid, 0x0090);
    }
}
