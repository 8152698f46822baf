//! Frontend (tuner) device access.
//!
//! The scan loop only needs a narrow surface: switch delivery system, tune,
//! poll the status word for a lock, and read the optional signal statistics
//! for the report. [`LinuxFrontend`] implements it over the DVBv5 property
//! API of `/dev/dvb/adapterN/frontendN`.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result, bail};
use bitflags::bitflags;
use log::{debug, warn};

// DVB v5 API property command IDs
const DTV_TUNE: u32 = 1;
const DTV_CLEAR: u32 = 2;
const DTV_FREQUENCY: u32 = 3;
const DTV_MODULATION: u32 = 4;
const DTV_DELIVERY_SYSTEM: u32 = 17;

// Delivery system API values
const SYS_DVBC_ANNEX_A: u32 = 1;
const SYS_DVBT: u32 = 3;
const SYS_DVBS: u32 = 5;
const SYS_ATSC: u32 = 11;

bitflags! {
    /// Frontend status word as reported by `FE_READ_STATUS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeStatus: u32 {
        const HAS_SIGNAL  = 0x01;
        const HAS_CARRIER = 0x02;
        const HAS_VITERBI = 0x04;
        const HAS_SYNC    = 0x08;
        const HAS_LOCK    = 0x10;
        const TIMEDOUT    = 0x20;
        const REINIT      = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverySystem {
    #[default]
    Undefined,
    Atsc,
    Satellite,
    Cable,
    Terrestrial,
}

impl DeliverySystem {
    fn to_api(self) -> u32 {
        match self {
            DeliverySystem::Undefined => 0,
            DeliverySystem::Atsc => SYS_ATSC,
            DeliverySystem::Satellite => SYS_DVBS,
            DeliverySystem::Cable => SYS_DVBC_ANNEX_A,
            DeliverySystem::Terrestrial => SYS_DVBT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeliverySystem::Undefined => "UNDEFINED",
            DeliverySystem::Atsc => "ATSC",
            DeliverySystem::Satellite => "QPSK",
            DeliverySystem::Cable => "QAM",
            DeliverySystem::Terrestrial => "OFDM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modulation {
    Qpsk,
    Qam16,
    Qam32,
    Qam64,
    Qam128,
    Qam256,
    #[default]
    QamAuto,
    Vsb8,
    Vsb16,
}

impl Modulation {
    fn to_api(self) -> u32 {
        match self {
            Modulation::Qpsk => 0,
            Modulation::Qam16 => 1,
            Modulation::Qam32 => 2,
            Modulation::Qam64 => 3,
            Modulation::Qam128 => 4,
            Modulation::Qam256 => 5,
            Modulation::QamAuto => 6,
            Modulation::Vsb8 => 7,
            Modulation::Vsb16 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Modulation::Qpsk => "QPSK",
            Modulation::Qam16 => "QAM_16",
            Modulation::Qam32 => "QAM_32",
            Modulation::Qam64 => "QAM_64",
            Modulation::Qam128 => "QAM_128",
            Modulation::Qam256 => "QAM_256",
            Modulation::QamAuto => "QAM_AUTO",
            Modulation::Vsb8 => "VSB_8",
            Modulation::Vsb16 => "VSB_16",
        }
    }

    /// QAM constellation from the cable delivery descriptor nibble.
    pub fn from_qam_index(idx: u8) -> Modulation {
        match idx {
            1 => Modulation::Qam16,
            2 => Modulation::Qam32,
            3 => Modulation::Qam64,
            4 => Modulation::Qam128,
            5 => Modulation::Qam256,
            _ => Modulation::QamAuto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeRate {
    None,
    Fec12,
    Fec23,
    Fec34,
    Fec56,
    Fec78,
    #[default]
    Auto,
}

impl CodeRate {
    /// Inner FEC from a delivery descriptor's 3-bit field.
    pub fn from_inner_fec(bits: u8) -> CodeRate {
        match bits {
            1 => CodeRate::Fec12,
            2 => CodeRate::Fec23,
            3 => CodeRate::Fec34,
            4 => CodeRate::Fec56,
            5 => CodeRate::Fec78,
            _ => CodeRate::Auto,
        }
    }

    /// HP/LP code rate from the terrestrial delivery descriptor.
    pub fn from_ofdm_bits(bits: u8) -> CodeRate {
        match bits {
            0 => CodeRate::Fec12,
            1 => CodeRate::Fec23,
            2 => CodeRate::Fec34,
            3 => CodeRate::Fec56,
            4 => CodeRate::Fec78,
            _ => CodeRate::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardInterval {
    G1_32,
    G1_16,
    G1_8,
    G1_4,
    #[default]
    Auto,
}

impl GuardInterval {
    /// Terrestrial delivery descriptor 2-bit field.
    pub fn from_ofdm_bits(bits: u8) -> GuardInterval {
        match bits & 0x3 {
            0 => GuardInterval::G1_32,
            1 => GuardInterval::G1_16,
            2 => GuardInterval::G1_8,
            _ => GuardInterval::G1_4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmissionMode {
    Mode2k,
    Mode8k,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hierarchy {
    #[default]
    None,
    H1,
    H2,
    H4,
    Auto,
}

impl Hierarchy {
    pub fn from_ofdm_bits(bits: u8) -> Hierarchy {
        match bits & 0x3 {
            0 => Hierarchy::None,
            1 => Hierarchy::H1,
            2 => Hierarchy::H2,
            _ => Hierarchy::H4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarisation {
    #[default]
    Horizontal,
    Vertical,
    CircularLeft,
    CircularRight,
}

impl Polarisation {
    pub fn from_bits(bits: u8) -> Polarisation {
        match bits & 0x3 {
            0 => Polarisation::Horizontal,
            1 => Polarisation::Vertical,
            2 => Polarisation::CircularLeft,
            _ => Polarisation::CircularRight,
        }
    }
}

/// Everything needed to tune one multiplex.
///
/// The non-ATSC fields are filled from NIT delivery descriptors and carried
/// along for the record; only ATSC parameter sets are ever handed to the
/// frontend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TuningParams {
    pub delivery: DeliverySystem,
    /// Hz for ATSC, terrestrial and cable; kHz as broadcast for satellite.
    pub frequency: u32,
    pub modulation: Modulation,
    pub symbol_rate: u32,
    pub fec_inner: CodeRate,
    pub bandwidth_hz: u32,
    pub code_rate_hp: CodeRate,
    pub code_rate_lp: CodeRate,
    pub guard_interval: GuardInterval,
    pub transmission_mode: TransmissionMode,
    pub hierarchy: Hierarchy,
    pub polarisation: Polarisation,
    pub orbital_pos: u16,
    pub west_east: bool,
}

impl TuningParams {
    pub fn atsc(frequency: u32, modulation: Modulation) -> TuningParams {
        TuningParams {
            delivery: DeliverySystem::Atsc,
            frequency,
            modulation,
            ..TuningParams::default()
        }
    }
}

/// Signal quality snapshot; readings the driver refuses stay `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalStats {
    pub signal_strength: Option<u16>,
    pub snr: Option<u16>,
    pub ber: Option<u32>,
    pub uncorrected_blocks: Option<u32>,
}

/// The tuner surface the scan loop depends on.
pub trait Frontend {
    fn delivery_system(&self) -> DeliverySystem;
    fn set_delivery_system(&mut self, delivery: DeliverySystem) -> Result<()>;
    fn tune(&mut self, params: &TuningParams) -> Result<()>;
    fn read_status(&mut self) -> Result<FeStatus>;
    fn signal_stats(&mut self) -> SignalStats;
}

// Kernel struct: dtv_property (76 bytes, packed)
//   cmd: u32, reserved: [u32; 3], u: union(56 bytes), result: i32
#[repr(C, packed)]
struct DtvProperty {
    cmd: u32,
    reserved: [u32; 3],
    data: u32,
    _padding: [u8; 52], // remaining union space (56 - 4)
    result: i32,
}

// Kernel struct: dtv_properties
#[repr(C)]
struct DtvProperties {
    num: u32,
    props: *mut DtvProperty,
}

// Kernel struct: dvb_frontend_info
#[repr(C)]
struct FeInfoRaw {
    name: [u8; 128],
    fe_type: u32,
    frequency_min: u32,
    frequency_max: u32,
    frequency_stepsize: u32,
    frequency_tolerance: u32,
    symbol_rate_min: u32,
    symbol_rate_max: u32,
    symbol_rate_tolerance: u32,
    notifier_delay: u32,
    caps: u32,
}

nix::ioctl_write_ptr!(fe_set_property, b'o', 82, DtvProperties);
nix::ioctl_read!(fe_read_status, b'o', 69, u32);
nix::ioctl_read!(fe_get_info, b'o', 61, FeInfoRaw);
nix::ioctl_read!(fe_read_ber, b'o', 70, u32);
nix::ioctl_read!(fe_read_signal_strength, b'o', 71, u16);
nix::ioctl_read!(fe_read_snr, b'o', 72, u16);
nix::ioctl_read!(fe_read_uncorrected_blocks, b'o', 73, u32);

impl DtvProperty {
    fn new(cmd: u32, data: u32) -> Self {
        DtvProperty {
            cmd,
            reserved: [0; 3],
            data,
            _padding: [0; 52],
            result: 0,
        }
    }
}

pub struct LinuxFrontend {
    fe_file: std::fs::File,
    delivery: DeliverySystem,
    name: String,
    caps: u32,
}

impl LinuxFrontend {
    pub fn open(adapter: u32, frontend: u32) -> Result<Self> {
        let path = format!("/dev/dvb/adapter{adapter}/frontend{frontend}");
        let fe_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {path}"))?;

        let fd = fe_file.as_raw_fd();
        let mut info: FeInfoRaw = unsafe { std::mem::zeroed() };
        unsafe {
            fe_get_info(fd, &mut info).context("FE_GET_INFO failed")?;
        }

        let name_len = info.name.iter().position(|&b| b == 0).unwrap_or(0);
        let name = String::from_utf8_lossy(&info.name[..name_len]).into_owned();
        // legacy fe_type: 0 QPSK, 1 QAM, 2 OFDM, 3 ATSC
        let delivery = match info.fe_type {
            0 => DeliverySystem::Satellite,
            1 => DeliverySystem::Cable,
            2 => DeliverySystem::Terrestrial,
            3 => DeliverySystem::Atsc,
            _ => DeliverySystem::Undefined,
        };
        debug!(
            "frontend '{name}' type {} caps 0x{:08x}",
            delivery.name(),
            info.caps
        );

        Ok(LinuxFrontend {
            fe_file,
            delivery,
            name,
            caps: info.caps,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caps(&self) -> u32 {
        self.caps
    }

    fn set_properties(&self, props: &mut [DtvProperty]) -> Result<()> {
        let mut dtv_props = DtvProperties {
            num: props.len() as u32,
            props: props.as_mut_ptr(),
        };
        unsafe {
            fe_set_property(self.fe_file.as_raw_fd(), &mut dtv_props)
                .context("FE_SET_PROPERTY failed")?;
        }
        Ok(())
    }
}

impl Frontend for LinuxFrontend {
    fn delivery_system(&self) -> DeliverySystem {
        self.delivery
    }

    fn set_delivery_system(&mut self, delivery: DeliverySystem) -> Result<()> {
        self.set_properties(&mut [DtvProperty::new(DTV_DELIVERY_SYSTEM, delivery.to_api())])?;
        self.delivery = delivery;
        Ok(())
    }

    fn tune(&mut self, params: &TuningParams) -> Result<()> {
        if params.delivery != DeliverySystem::Atsc {
            bail!(
                "tuning {} multiplexes is not supported, only ATSC",
                params.delivery.name()
            );
        }

        self.set_properties(&mut [DtvProperty::new(DTV_CLEAR, 0)])?;
        self.set_properties(&mut [
            DtvProperty::new(DTV_DELIVERY_SYSTEM, SYS_ATSC),
            DtvProperty::new(DTV_FREQUENCY, params.frequency),
            DtvProperty::new(DTV_MODULATION, params.modulation.to_api()),
            DtvProperty::new(DTV_TUNE, 0),
        ])
    }

    fn read_status(&mut self) -> Result<FeStatus> {
        let mut status: u32 = 0;
        unsafe {
            fe_read_status(self.fe_file.as_raw_fd(), &mut status)
                .context("FE_READ_STATUS failed")?;
        }
        Ok(FeStatus::from_bits_truncate(status))
    }

    fn signal_stats(&mut self) -> SignalStats {
        let fd = self.fe_file.as_raw_fd();
        let mut stats = SignalStats::default();

        let mut signal: u16 = 0;
        if unsafe { fe_read_signal_strength(fd, &mut signal) }.is_ok() {
            stats.signal_strength = Some(signal);
        }
        let mut snr: u16 = 0;
        if unsafe { fe_read_snr(fd, &mut snr) }.is_ok() {
            stats.snr = Some(snr);
        }
        let mut ber: u32 = 0;
        if unsafe { fe_read_ber(fd, &mut ber) }.is_ok() {
            stats.ber = Some(ber);
        }
        let mut unc: u32 = 0;
        if unsafe { fe_read_uncorrected_blocks(fd, &mut unc) }.is_ok() {
            stats.uncorrected_blocks = Some(unc);
        }

        if stats.signal_strength.is_none() && stats.snr.is_none() {
            warn!("frontend reports no signal statistics");
        }
        stats
    }
}
