//! ATSC RF channel plan.
//!
//! Broadcast channels 2..51 sit in four bands of fixed 6 MHz slots; there is
//! no blind frequency scanning, every candidate frequency comes from here.

pub const FIRST_CHANNEL: u32 = 2;
pub const LAST_CHANNEL: u32 = 51;

/// Center frequency in MHz for an ATSC RF channel number.
pub fn channel_to_mhz(channel: u32) -> Option<u32> {
    match channel {
        2..=4 => Some(57 + (channel - 2) * 6),
        5..=6 => Some(79 + (channel - 5) * 6),
        7..=13 => Some(177 + (channel - 7) * 6),
        14..=51 => Some(473 + (channel - 14) * 6),
        _ => None,
    }
}

/// Inverse of [`channel_to_mhz`].
pub fn mhz_to_channel(freq_mhz: u32) -> Option<u32> {
    match freq_mhz {
        57..=69 => Some(2 + (freq_mhz - 57) / 6),
        79..=85 => Some(5 + (freq_mhz - 79) / 6),
        177..=213 => Some(7 + (freq_mhz - 177) / 6),
        473..=695 => Some(14 + (freq_mhz - 473) / 6),
        _ => None,
    }
}

/// All RF channel numbers of the plan, in scan order.
pub fn channels() -> impl Iterator<Item = u32> {
    FIRST_CHANNEL..=LAST_CHANNEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_to_mhz_band_edges() {
        assert_eq!(channel_to_mhz(2), Some(57));
        assert_eq!(channel_to_mhz(4), Some(69));
        assert_eq!(channel_to_mhz(5), Some(79));
        assert_eq!(channel_to_mhz(6), Some(85));
        assert_eq!(channel_to_mhz(7), Some(177));
        assert_eq!(channel_to_mhz(13), Some(213));
        assert_eq!(channel_to_mhz(14), Some(473));
        assert_eq!(channel_to_mhz(51), Some(695));
    }

    #[test]
    fn test_channel_to_mhz_out_of_plan() {
        assert_eq!(channel_to_mhz(0), None);
        assert_eq!(channel_to_mhz(1), None);
        assert_eq!(channel_to_mhz(52), None);
    }

    #[test]
    fn test_mhz_to_channel_between_bands() {
        assert_eq!(mhz_to_channel(56), None);
        assert_eq!(mhz_to_channel(70), None);
        assert_eq!(mhz_to_channel(100), None);
        assert_eq!(mhz_to_channel(214), None);
        assert_eq!(mhz_to_channel(696), None);
    }

    #[test]
    fn test_channel_frequency_roundtrip() {
        for chan in channels() {
            let mhz = channel_to_mhz(chan).unwrap();
            assert_eq!(mhz_to_channel(mhz), Some(chan), "channel {chan}");
        }
    }
}
