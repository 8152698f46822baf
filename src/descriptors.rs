//! Descriptor loop parsing.
//!
//! A descriptor loop is a run of TLV records: tag, length, payload. The same
//! tag means different things in different tables, so each table context
//! gets its own typed decode function and the table decoders pattern-match
//! on the result. Unknown tags are skipped by length; a zero-length record
//! means the loop is garbage and the rest of it is abandoned.

use log::{trace, warn};

use crate::text;
use crate::tuner::{
    CodeRate, DeliverySystem, GuardInterval, Hierarchy, Modulation, Polarisation,
    TransmissionMode, TuningParams,
};

pub const TAG_ISO639_LANGUAGE: u8 = 0x0A;
pub const TAG_NETWORK_NAME: u8 = 0x40;
pub const TAG_SATELLITE_DELIVERY: u8 = 0x43;
pub const TAG_CABLE_DELIVERY: u8 = 0x44;
pub const TAG_SERVICE: u8 = 0x48;
pub const TAG_CA_IDENTIFIER: u8 = 0x53;
pub const TAG_TELETEXT: u8 = 0x56;
pub const TAG_SUBTITLING: u8 = 0x59;
pub const TAG_TERRESTRIAL_DELIVERY: u8 = 0x5A;
pub const TAG_FREQUENCY_LIST: u8 = 0x62;
pub const TAG_AC3: u8 = 0x6A;
pub const TAG_LOGICAL_CHANNEL: u8 = 0x83;
pub const TAG_ATSC_EXTENDED_CHANNEL_NAME: u8 = 0xA0;
pub const TAG_ATSC_SERVICE_LOCATION: u8 = 0xA1;

/// Raw walk over a descriptor loop, yielding `(tag, payload)` records.
pub fn walk(buf: &[u8]) -> DescriptorIter<'_> {
    DescriptorIter { buf }
}

pub struct DescriptorIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < 2 {
            return None;
        }
        let tag = self.buf[0];
        let len = self.buf[1] as usize;
        if len == 0 {
            warn!("descriptor 0x{tag:02x} has zero length, abandoning loop");
            self.buf = &[];
            return None;
        }
        if 2 + len > self.buf.len() {
            warn!("descriptor 0x{tag:02x} overruns its loop, abandoning");
            self.buf = &[];
            return None;
        }
        let payload = &self.buf[2..2 + len];
        self.buf = &self.buf[2 + len..];
        Some((tag, payload))
    }
}

/// 8-digit BCD as used by the DVB delivery descriptors.
pub fn bcd32(b: [u8; 4]) -> u32 {
    let mut v = 0u32;
    for byte in b {
        v = v * 100 + ((byte >> 4) & 0x0F) as u32 * 10 + (byte & 0x0F) as u32;
    }
    v
}

// ---- PMT context -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmtDescriptor {
    Iso639Language { lang: [u8; 3], audio_type: u8 },
    Teletext,
    Subtitling,
    Ac3,
    Other(u8),
}

pub fn pmt_descriptor(tag: u8, payload: &[u8]) -> PmtDescriptor {
    match tag {
        TAG_ISO639_LANGUAGE if payload.len() >= 4 => PmtDescriptor::Iso639Language {
            lang: [payload[0], payload[1], payload[2]],
            audio_type: payload[3],
        },
        TAG_TELETEXT => PmtDescriptor::Teletext,
        TAG_SUBTITLING => PmtDescriptor::Subtitling,
        TAG_AC3 => PmtDescriptor::Ac3,
        _ => PmtDescriptor::Other(tag),
    }
}

// ---- SDT context -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdtDescriptor {
    Service {
        service_type: u8,
        provider_name: String,
        service_name: String,
    },
    CaIdentifier(Vec<u16>),
    Other(u8),
}

pub fn sdt_descriptor(tag: u8, payload: &[u8]) -> SdtDescriptor {
    match tag {
        TAG_SERVICE => match service_descriptor(payload) {
            Some(d) => d,
            None => {
                warn!("truncated service descriptor");
                SdtDescriptor::Other(tag)
            }
        },
        TAG_CA_IDENTIFIER => SdtDescriptor::CaIdentifier(
            payload
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ),
        _ => SdtDescriptor::Other(tag),
    }
}

fn service_descriptor(p: &[u8]) -> Option<SdtDescriptor> {
    let service_type = *p.first()?;
    let provider_len = *p.get(1)? as usize;
    let provider = p.get(2..2 + provider_len)?;
    let name_len = *p.get(2 + provider_len)? as usize;
    let name = p.get(3 + provider_len..3 + provider_len + name_len)?;
    Some(SdtDescriptor::Service {
        service_type,
        provider_name: text::decode_dvb_text(provider),
        service_name: text::decode_dvb_text(name),
    })
}

// ---- NIT context -----------------------------------------------------------

/// Tuning parameters extracted from a delivery system descriptor, plus the
/// terrestrial other-frequency flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub params: TuningParams,
    pub other_frequency_flag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NitDescriptor {
    NetworkName(String),
    Delivery(DeliveryUpdate),
    FrequencyList(Vec<u32>),
    LogicalChannelNumbers(Vec<(u16, u16)>),
    Other(u8),
}

pub fn nit_descriptor(tag: u8, payload: &[u8]) -> NitDescriptor {
    let delivery = match tag {
        TAG_SATELLITE_DELIVERY => satellite_delivery(payload),
        TAG_CABLE_DELIVERY => cable_delivery(payload),
        TAG_TERRESTRIAL_DELIVERY => terrestrial_delivery(payload),
        TAG_NETWORK_NAME => {
            return NitDescriptor::NetworkName(text::decode_dvb_text(payload));
        }
        TAG_FREQUENCY_LIST => {
            return NitDescriptor::FrequencyList(frequency_list(payload));
        }
        TAG_LOGICAL_CHANNEL => {
            return NitDescriptor::LogicalChannelNumbers(logical_channel_numbers(payload));
        }
        _ => return NitDescriptor::Other(tag),
    };
    match delivery {
        Some(d) => NitDescriptor::Delivery(d),
        None => {
            warn!("truncated delivery system descriptor 0x{tag:02x}");
            NitDescriptor::Other(tag)
        }
    }
}

fn satellite_delivery(p: &[u8]) -> Option<DeliveryUpdate> {
    if p.len() < 11 {
        return None;
    }
    let mut params = TuningParams {
        delivery: DeliverySystem::Satellite,
        // BCD in 10 kHz units, kept in kHz as broadcast
        frequency: 10 * bcd32([p[0], p[1], p[2], p[3]]),
        ..TuningParams::default()
    };
    params.orbital_pos = bcd32([0, 0, p[4], p[5]]) as u16;
    params.west_east = p[6] >> 7 != 0;
    params.polarisation = Polarisation::from_bits((p[6] >> 5) & 0x03);
    params.symbol_rate = 10 * bcd32([p[7], p[8], p[9], p[10] & 0xF0]);
    params.fec_inner = CodeRate::from_inner_fec(p[10] & 0x07);
    Some(DeliveryUpdate {
        params,
        other_frequency_flag: false,
    })
}

fn cable_delivery(p: &[u8]) -> Option<DeliveryUpdate> {
    if p.len() < 11 {
        return None;
    }
    let mut params = TuningParams {
        delivery: DeliverySystem::Cable,
        // BCD in 100 Hz units
        frequency: 100 * bcd32([p[0], p[1], p[2], p[3]]),
        ..TuningParams::default()
    };
    params.modulation = Modulation::from_qam_index(p[6] & 0x0F);
    params.symbol_rate = 10 * bcd32([p[7], p[8], p[9], p[10] & 0xF0]);
    params.fec_inner = CodeRate::from_inner_fec(p[10] & 0x07);
    Some(DeliveryUpdate {
        params,
        other_frequency_flag: false,
    })
}

fn terrestrial_delivery(p: &[u8]) -> Option<DeliveryUpdate> {
    if p.len() < 7 {
        return None;
    }
    let mut params = TuningParams {
        delivery: DeliverySystem::Terrestrial,
        // centre frequency in 10 Hz units
        frequency: u32::from_be_bytes([p[0], p[1], p[2], p[3]]).saturating_mul(10),
        ..TuningParams::default()
    };
    params.bandwidth_hz = match (p[4] >> 5) & 0x07 {
        0 => 8_000_000,
        1 => 7_000_000,
        2 => 6_000_000,
        3 => 5_000_000,
        _ => 0,
    };
    params.modulation = match (p[5] >> 6) & 0x03 {
        0 => Modulation::Qpsk,
        1 => Modulation::Qam16,
        2 => Modulation::Qam64,
        _ => Modulation::QamAuto,
    };
    params.hierarchy = Hierarchy::from_ofdm_bits((p[5] >> 3) & 0x03);
    params.code_rate_hp = CodeRate::from_ofdm_bits(p[5] & 0x07);
    params.code_rate_lp = CodeRate::from_ofdm_bits((p[6] >> 5) & 0x07);
    params.guard_interval = GuardInterval::from_ofdm_bits((p[6] >> 3) & 0x03);
    params.transmission_mode = if p[6] & 0x02 != 0 {
        TransmissionMode::Mode8k
    } else {
        TransmissionMode::Mode2k
    };
    Some(DeliveryUpdate {
        params,
        other_frequency_flag: p[6] & 0x01 != 0,
    })
}

fn frequency_list(p: &[u8]) -> Vec<u32> {
    // coding_type 3 = terrestrial centre frequencies in 10 Hz units
    let Some(&coding) = p.first() else {
        return Vec::new();
    };
    if coding & 0x03 != 3 {
        trace!("frequency list with coding type {} ignored", coding & 0x03);
        return Vec::new();
    }
    p[1..]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]).saturating_mul(10))
        .collect()
}

fn logical_channel_numbers(p: &[u8]) -> Vec<(u16, u16)> {
    p.chunks_exact(4)
        .map(|c| {
            let service_id = u16::from_be_bytes([c[0], c[1]]);
            let channel_num = (((c[2] & 0x03) as u16) << 8) | c[3] as u16;
            (service_id, channel_num)
        })
        .collect()
}

// ---- ATSC PSIP context -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceLocationElement {
    pub stream_type: u8,
    pub pid: u16,
    pub lang: [u8; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsipDescriptor {
    ServiceLocation {
        pcr_pid: u16,
        elements: Vec<ServiceLocationElement>,
    },
    ExtendedChannelName(String),
    Other(u8),
}

pub fn psip_descriptor(tag: u8, payload: &[u8]) -> PsipDescriptor {
    match tag {
        TAG_ATSC_SERVICE_LOCATION => match service_location(payload) {
            Some(d) => d,
            None => {
                warn!("truncated service location descriptor");
                PsipDescriptor::Other(tag)
            }
        },
        TAG_ATSC_EXTENDED_CHANNEL_NAME => match text::decode_atsc_string(payload) {
            Some(name) => PsipDescriptor::ExtendedChannelName(name),
            None => PsipDescriptor::Other(tag),
        },
        _ => PsipDescriptor::Other(tag),
    }
}

fn service_location(p: &[u8]) -> Option<PsipDescriptor> {
    if p.len() < 3 {
        return None;
    }
    let pcr_pid = u16::from_be_bytes([p[0], p[1]]) & 0x1FFF;
    let count = p[2] as usize;
    let mut elements = Vec::with_capacity(count);
    let mut pos = 3;
    for _ in 0..count {
        let e = p.get(pos..pos + 6)?;
        elements.push(ServiceLocationElement {
            stream_type: e[0],
            pid: u16::from_be_bytes([e[1], e[2]]) & 0x1FFF,
            lang: [e[3], e[4], e[5]],
        });
        pos += 6;
    }
    Some(PsipDescriptor::ServiceLocation { pcr_pid, elements })
}
