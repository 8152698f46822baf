//! Text decoding for service names.
//!
//! DVB strings carry an optional charset prefix byte (EN 300 468 annex A);
//! ATSC uses UTF-16 short names and the multiple-string structure of A/65.
//! Everything decodes to UTF-8 `String`s, best effort.

use log::warn;

/// Decode DVB text with its charset selection prefix.
pub fn decode_dvb_text(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    match data[0] {
        0x11 | 0x14 => {
            // ISO/IEC 10646 BMP (UCS-2) / Big5 subset: UTF-16 BE
            if data.len() < 3 {
                return String::new();
            }
            let pairs: Vec<u16> = data[1..]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&pairs)
        }
        0x15 => {
            // UTF-8
            String::from_utf8_lossy(&data[1..]).to_string()
        }
        0x10 => {
            // ISO 8859-N: two more selection bytes follow
            if data.len() > 3 {
                String::from_utf8_lossy(&data[3..]).to_string()
            } else {
                String::new()
            }
        }
        0x01..=0x05 => {
            // ISO 8859 tables: skip prefix byte
            String::from_utf8_lossy(&data[1..]).to_string()
        }
        0x20..=0xFF => {
            // Default table (ISO 6937), treat as best-effort
            String::from_utf8_lossy(data).to_string()
        }
        _ => String::new(),
    }
}

/// Decode the fixed 7-code-unit UTF-16 BE short name of a VCT channel
/// record. Unused positions are NUL padded; trailing spaces are noise.
pub fn decode_utf16_short_name(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .take(7)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units).trim_end().to_string()
}

/// Decode an ATSC multiple-string structure (A/65 §6.10): a list of
/// language-tagged strings, each split into segments. Segments using
/// compression are skipped. Returns the first string, or `None` when
/// nothing decodable is present.
pub fn decode_atsc_string(data: &[u8]) -> Option<String> {
    let num_strings = *data.first()? as usize;
    let mut pos = 1;
    for _ in 0..num_strings {
        // 3-byte language code, then the segment count
        if pos + 4 > data.len() {
            return None;
        }
        let num_segments = data[pos + 3] as usize;
        pos += 4;

        let mut text = String::new();
        for _ in 0..num_segments {
            if pos + 3 > data.len() {
                return None;
            }
            let compression_type = data[pos];
            let mode = data[pos + 1];
            let num_bytes = data[pos + 2] as usize;
            pos += 3;
            if pos + num_bytes > data.len() {
                return None;
            }
            let bytes = &data[pos..pos + num_bytes];
            pos += num_bytes;

            if compression_type != 0x00 {
                warn!("compressed channel name segments are not supported");
                continue;
            }
            match mode {
                // mode selects the high byte of 16-bit code points
                0x00 => text.extend(bytes.iter().map(|&b| b as char)),
                // full UTF-16 BE representation
                0x3F => {
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                    text.push_str(&String::from_utf16_lossy(&units));
                }
                _ => warn!("unhandled channel name segment mode 0x{mode:02x}"),
            }
        }
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}
