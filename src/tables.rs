//! PSI/PSIP table decoders.
//!
//! Each decoder consumes the payload of one reassembled section and mutates
//! the scan store. Decoders never talk to devices; when a table implies
//! more acquisition work (a PAT entry needs its PMT), they return filter
//! requests for the pool instead.

use log::{debug, info, trace, warn};

use crate::descriptors::{
    self, NitDescriptor, PmtDescriptor, PsipDescriptor, SdtDescriptor, walk,
};
use crate::filter::{DeliveredSection, FilterSpec};
use crate::store::{RunningStatus, Scanner, Transponder};
use crate::text;
use crate::tuner::DeliverySystem;

pub const PAT_PID: u16 = 0x0000;
pub const NIT_PID: u16 = 0x0010;
pub const SDT_PID: u16 = 0x0011;
pub const PSIP_PID: u16 = 0x1FFB;

pub const PAT_TID: u8 = 0x00;
pub const PMT_TID: u8 = 0x02;
pub const NIT_ACTUAL_TID: u8 = 0x40;
pub const NIT_OTHER_TID: u8 = 0x41;
pub const SDT_ACTUAL_TID: u8 = 0x42;
pub const SDT_OTHER_TID: u8 = 0x46;
pub const TVCT_TID: u8 = 0xC8;
pub const CVCT_TID: u8 = 0xC9;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Honour the user-private logical-channel-number descriptor (0x83).
    /// Off unless asked for: the tag collides with other private uses.
    pub uk_channel_numbers: bool,
}

/// Dispatch one delivered section to its table decoder. Returns follow-up
/// filter requests (PMT filters discovered through the PAT).
pub fn decode_section(
    scanner: &mut Scanner,
    fe_delivery: DeliverySystem,
    opts: &DecodeOptions,
    section: &DeliveredSection,
) -> Vec<FilterSpec> {
    match section.table_id {
        PAT_TID => {
            debug!("PAT");
            return parse_pat(scanner, &section.payload);
        }
        PMT_TID => {
            debug!(
                "PMT 0x{:04x} for service 0x{:04x}",
                section.pid, section.table_id_ext
            );
            parse_pmt(scanner, &section.payload, section.table_id_ext);
        }
        NIT_ACTUAL_TID | NIT_OTHER_TID => {
            debug!(
                "NIT ({} TS)",
                if section.table_id == NIT_ACTUAL_TID { "actual" } else { "other" }
            );
            parse_nit(scanner, fe_delivery, opts, &section.payload, section.table_id_ext);
        }
        SDT_ACTUAL_TID | SDT_OTHER_TID => {
            debug!(
                "SDT ({} TS)",
                if section.table_id == SDT_ACTUAL_TID { "actual" } else { "other" }
            );
            parse_sdt(scanner, &section.payload);
        }
        TVCT_TID | CVCT_TID => {
            debug!("ATSC VCT");
            parse_vct(scanner, &section.payload);
        }
        other => trace!("ignoring table 0x{other:02x}"),
    }
    Vec::new()
}

/// PAT: (program_number, PMT PID) pairs. Creates services and requests one
/// PMT filter per program.
fn parse_pat(scanner: &mut Scanner, payload: &[u8]) -> Vec<FilterSpec> {
    let mut follow_ups = Vec::new();
    for entry in payload.chunks_exact(4) {
        let service_id = u16::from_be_bytes([entry[0], entry[1]]);
        if service_id == 0 {
            continue; // NIT pid entry
        }
        let pmt_pid = (((entry[2] & 0x1F) as u16) << 8) | entry[3] as u16;

        // SDT or VCT might have been parsed first
        let Some(service) = scanner.ensure_service(service_id) else {
            return follow_ups;
        };
        service.pmt_pid = pmt_pid;
        if !service.pmt_requested && pmt_pid != 0 {
            service.pmt_requested = true;
            follow_ups.push(FilterSpec::new(pmt_pid, PMT_TID).with_ext(service_id));
        }
    }
    follow_ups
}

/// PMT: PCR PID plus the elementary stream loop.
fn parse_pmt(scanner: &mut Scanner, payload: &[u8], service_id: u16) {
    let Some(service) = scanner.find_service_mut(service_id) else {
        warn!("PMT for service_id 0x{service_id:04x} which was not in the PAT");
        return;
    };
    if payload.len() < 4 {
        warn!("PMT for service_id 0x{service_id:04x} too short");
        return;
    }
    service.pcr_pid = u16::from_be_bytes([payload[0], payload[1]]) & 0x1FFF;

    let program_info_len = (((payload[2] & 0x0F) as usize) << 8) | payload[3] as usize;
    let es_start = 4 + program_info_len;
    if es_start > payload.len() {
        warn!("PMT for service_id 0x{service_id:04x}: program info overruns section");
        return;
    }
    for (tag, desc) in walk(&payload[4..es_start]) {
        match descriptors::pmt_descriptor(tag, desc) {
            // stream markers only mean something on an elementary stream
            PmtDescriptor::Other(tag) => trace!("skip program descriptor 0x{tag:02x}"),
            other => trace!("program level descriptor {other:?}"),
        }
    }

    let mut pos = es_start;
    while pos + 5 <= payload.len() {
        let stream_type = payload[pos];
        let elementary_pid =
            (((payload[pos + 1] & 0x1F) as u16) << 8) | payload[pos + 2] as u16;
        let es_info_len = (((payload[pos + 3] & 0x0F) as usize) << 8) | payload[pos + 4] as usize;
        let es_end = pos + 5 + es_info_len;
        if es_end > payload.len() {
            warn!("PMT for service_id 0x{service_id:04x}: ES info overruns section");
            break;
        }
        let es_desc = &payload[pos + 5..es_end];

        match stream_type {
            // MPEG-1/2 and H.264 video
            0x01 | 0x02 | 0x1B => {
                trace!("  VIDEO     : PID 0x{elementary_pid:04x}");
                if service.video_pid == 0 {
                    service.video_pid = elementary_pid;
                }
            }
            // MPEG audio, AC-3 per A/53 annex B, ADTS AAC, LATM AAC
            0x03 | 0x04 | 0x0F | 0x11 | 0x81 => {
                trace!("  AUDIO     : PID 0x{elementary_pid:04x}");
                if let Some(track) = service.push_audio(elementary_pid) {
                    for (tag, desc) in walk(es_desc) {
                        if let PmtDescriptor::Iso639Language { lang, .. } =
                            descriptors::pmt_descriptor(tag, desc)
                        {
                            track.lang = lang;
                        }
                    }
                }
            }
            0x07 => trace!("  MHEG      : PID 0x{elementary_pid:04x}"),
            0x0B => trace!("  DSM-CC    : PID 0x{elementary_pid:04x}"),
            0x06 => {
                // private data; the descriptors say what it actually is
                let mut teletext = false;
                let mut subtitling = false;
                let mut ac3 = false;
                for (tag, desc) in walk(es_desc) {
                    match descriptors::pmt_descriptor(tag, desc) {
                        PmtDescriptor::Teletext => teletext = true,
                        PmtDescriptor::Subtitling => subtitling = true,
                        PmtDescriptor::Ac3 => ac3 = true,
                        _ => {}
                    }
                }
                if teletext {
                    trace!("  TELETEXT  : PID 0x{elementary_pid:04x}");
                    service.teletext_pid = elementary_pid;
                } else if subtitling {
                    // teletext subtitling also carries the teletext
                    // descriptor, so only plain DVB subtitling lands here
                    trace!("  SUBTITLING: PID 0x{elementary_pid:04x}");
                    service.subtitling_pid = elementary_pid;
                } else if ac3 {
                    trace!("  AC3       : PID 0x{elementary_pid:04x}");
                    service.ac3_pid = elementary_pid;
                } else {
                    trace!("  OTHER     : PID 0x{elementary_pid:04x} TYPE 0x06");
                }
            }
            other => {
                trace!("  OTHER     : PID 0x{elementary_pid:04x} TYPE 0x{other:02x}");
            }
        }
        pos = es_end;
    }

    debug!(
        "0x{:04x} 0x{:04x}: pmt_pid 0x{:04x}, vpid 0x{:04x}, {} audio",
        service.transport_stream_id,
        service.service_id,
        service.pmt_pid,
        service.video_pid,
        service.audio.len()
    );
}

/// SDT: running state, scrambling and names per service.
fn parse_sdt(scanner: &mut Scanner, payload: &[u8]) {
    if payload.len() < 3 {
        return;
    }
    // skip original_network_id + reserved
    let mut pos = 3;
    while pos + 5 <= payload.len() {
        let service_id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        let running = (payload[pos + 3] >> 5) & 0x07;
        let scrambled = (payload[pos + 3] >> 4) & 0x01 != 0;
        let loop_len = (((payload[pos + 3] & 0x0F) as usize) << 8) | payload[pos + 4] as usize;
        let end = pos + 5 + loop_len;
        if end > payload.len() {
            warn!(
                "SDT section too short: service_id 0x{service_id:04x}, \
                 descriptors_loop_len {loop_len}"
            );
            break;
        }

        // maybe the PAT has not been parsed yet
        let Some(service) = scanner.ensure_service(service_id) else {
            return;
        };
        service.running = RunningStatus::from_bits(running);
        service.scrambled = scrambled;

        for (tag, desc) in walk(&payload[pos + 5..end]) {
            match descriptors::sdt_descriptor(tag, desc) {
                SdtDescriptor::Service {
                    service_type,
                    provider_name,
                    service_name,
                } => {
                    service.service_type = service_type;
                    service.provider_name = Some(provider_name);
                    service.service_name = Some(service_name);
                    info!(
                        "0x{:04x} 0x{:04x}: pmt_pid 0x{:04x} {} -- {} ({}{})",
                        service.transport_stream_id,
                        service.service_id,
                        service.pmt_pid,
                        service.provider_name.as_deref().unwrap_or(""),
                        service.service_name.as_deref().unwrap_or(""),
                        service.running.name(),
                        if service.scrambled { ", scrambled" } else { "" }
                    );
                }
                SdtDescriptor::CaIdentifier(ids) => {
                    for id in &ids {
                        trace!("  CA ID 0x{id:04x}");
                    }
                    service.set_ca_ids(&ids);
                }
                SdtDescriptor::Other(tag) => trace!("skip descriptor 0x{tag:02x}"),
            }
        }
        pos = end;
    }
}

/// NIT: the network loop, then one descriptor loop per transport stream.
/// Transport streams whose delivery system matches the frontend are folded
/// into the transponder store.
fn parse_nit(
    scanner: &mut Scanner,
    fe_delivery: DeliverySystem,
    opts: &DecodeOptions,
    payload: &[u8],
    network_id: u16,
) {
    if payload.len() < 2 {
        return;
    }
    let network_loop_len = (((payload[0] & 0x0F) as usize) << 8) | payload[1] as usize;
    let network_end = 2 + network_loop_len;
    if network_end > payload.len() {
        warn!(
            "NIT section too short: network_id 0x{network_id:04x}, \
             descriptors_loop_len {network_loop_len}"
        );
        return;
    }
    for (tag, desc) in walk(&payload[2..network_end]) {
        match descriptors::nit_descriptor(tag, desc) {
            NitDescriptor::NetworkName(name) => info!("Network Name '{name}'"),
            NitDescriptor::Delivery(_) => {
                warn!("delivery system descriptor outside transport stream definition (ignored)");
            }
            NitDescriptor::FrequencyList(_) => {
                warn!("frequency list descriptor outside transport stream definition (ignored)");
            }
            NitDescriptor::LogicalChannelNumbers(nums) => {
                apply_channel_numbers(scanner, opts, &nums);
            }
            NitDescriptor::Other(tag) => trace!("skip descriptor 0x{tag:02x}"),
        }
    }

    // the 2 skipped bytes are the transport_stream_loop_length
    let mut pos = network_end + 2;
    while pos + 6 <= payload.len() {
        let transport_stream_id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        let original_network_id = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]);
        let loop_len = (((payload[pos + 4] & 0x0F) as usize) << 8) | payload[pos + 5] as usize;
        let end = pos + 6 + loop_len;
        if end > payload.len() {
            warn!(
                "NIT section too short: transport_stream_id 0x{transport_stream_id:04x}, \
                 descriptors_loop_len {loop_len}"
            );
            break;
        }
        trace!("transport_stream_id 0x{transport_stream_id:04x}");

        let mut scratch = Transponder {
            network_id,
            original_network_id,
            transport_stream_id,
            ..Transponder::default()
        };

        for (tag, desc) in walk(&payload[pos + 6..end]) {
            match descriptors::nit_descriptor(tag, desc) {
                NitDescriptor::Delivery(update) => {
                    scratch.params = update.params;
                    scratch.other_frequency_flag = update.other_frequency_flag;
                }
                NitDescriptor::FrequencyList(freqs) => {
                    if scratch.other_frequencies.is_empty() {
                        scratch.other_frequencies = freqs;
                    }
                }
                NitDescriptor::NetworkName(name) => info!("Network Name '{name}'"),
                NitDescriptor::LogicalChannelNumbers(nums) => {
                    apply_channel_numbers(scanner, opts, &nums);
                }
                NitDescriptor::Other(tag) => trace!("skip descriptor 0x{tag:02x}"),
            }
        }

        // only delivery descriptors for the tuner we actually have are usable
        if scratch.params.delivery == fe_delivery {
            scanner.reconcile(scratch);
        }
        pos = end;
    }
}

fn apply_channel_numbers(scanner: &mut Scanner, opts: &DecodeOptions, nums: &[(u16, u16)]) {
    if !opts.uk_channel_numbers {
        trace!("ignoring logical channel numbers (not enabled)");
        return;
    }
    for &(service_id, channel_num) in nums {
        trace!("service 0x{service_id:04x} has channel number {channel_num}");
        scanner.assign_channel_number(service_id, channel_num);
    }
}

/// ATSC VCT: per-channel records with UTF-16 short names, major/minor
/// numbers and a descriptor loop carrying the stream PIDs.
fn parse_vct(scanner: &mut Scanner, payload: &[u8]) {
    if payload.len() < 2 {
        return;
    }
    // payload[0] is protocol_version
    let num_channels = payload[1] as usize;
    let mut pos = 2;
    // data-less channels still need unique service ids
    let mut pseudo_id: u16 = 0xFFFF;

    for _ in 0..num_channels {
        let Some(rec) = payload.get(pos..pos + 32) else {
            warn!("VCT channel record overruns section");
            break;
        };
        let desc_len = (((rec[30] & 0x03) as usize) << 8) | rec[31] as usize;
        let Some(desc_buf) = payload.get(pos + 32..pos + 32 + desc_len) else {
            warn!("VCT descriptor loop overruns section");
            break;
        };
        pos += 32 + desc_len;

        let major = (((rec[14] & 0x0F) as u16) << 6) | (rec[15] >> 2) as u16;
        let minor = (((rec[15] & 0x03) as u16) << 8) | rec[16] as u16;
        let mut program_number = u16::from_be_bytes([rec[24], rec[25]]);
        let hidden = rec[26] & 0x10 != 0;
        let service_type = rec[27] & 0x3F;

        match service_type {
            0x01 => {
                info!("analog channel {major}.{minor} won't be put into the channel list");
                continue;
            }
            0x02 | 0x03 => {} // ATSC digital TV / audio
            other => {
                trace!("skipping channel {major}.{minor} with service_type 0x{other:02x}");
                continue;
            }
        }

        if program_number == 0 {
            program_number = pseudo_id;
            pseudo_id -= 1;
        }

        let Some(service) = scanner.ensure_service(program_number) else {
            return;
        };
        service.service_type = service_type;
        service.service_name = Some(text::decode_utf16_short_name(&rec[0..14]));

        for (tag, desc) in walk(desc_buf) {
            match descriptors::psip_descriptor(tag, desc) {
                PsipDescriptor::ServiceLocation { pcr_pid, elements } => {
                    service.pcr_pid = pcr_pid;
                    for e in elements {
                        match e.stream_type {
                            0x02 => {
                                trace!("  VIDEO     : PID 0x{:04x}", e.pid);
                                service.video_pid = e.pid;
                            }
                            0x81 => {
                                trace!("  AUDIO     : PID 0x{:04x}", e.pid);
                                if let Some(track) = service.push_audio(e.pid) {
                                    track.lang = e.lang;
                                }
                            }
                            other => warn!("unhandled stream_type: 0x{other:02x}"),
                        }
                    }
                }
                // the extended name wins over the 7-character short name
                PsipDescriptor::ExtendedChannelName(name) => {
                    service.service_name = Some(name);
                }
                PsipDescriptor::Other(tag) => warn!("unhandled psip descriptor: 0x{tag:02x}"),
            }
        }

        service.channel_num = Some((major << 10) | minor);
        service.running = if hidden {
            RunningStatus::NotRunning
        } else {
            RunningStatus::Running
        };
        info!(
            "Channel number: {major}:{minor}. Name: '{}'",
            service.service_name.as_deref().unwrap_or("")
        );
    }
}
