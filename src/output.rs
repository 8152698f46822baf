//! Scan results on disk: the azap-style channel list and the signal report.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::scan::MultiplexReading;
use crate::store::{Scanner, Service, Transponder, same_frequency};

/// One azap channel list line: `name:frequency:modulation:vpid:apid:sid`.
pub fn zap_line(tp: &Transponder, service: &Service) -> String {
    let audio_pid = service
        .audio
        .first()
        .map(|t| t.pid)
        .unwrap_or(service.ac3_pid);
    format!(
        "{}:{}:{}:{}:{}:{}",
        service.display_name(),
        tp.params.frequency,
        tp.params.modulation.name(),
        service.video_pid,
        audio_pid,
        service.service_id
    )
}

/// Write the channel list for every service found. An existing file is
/// kept as `<path>.old`. Returns the number of channels written.
pub fn write_channels(path: &Path, scanner: &Scanner) -> Result<usize> {
    let mut content = String::new();
    let mut count = 0;
    for tp in &scanner.scanned {
        if tp.wrong_frequency {
            continue;
        }
        for service in &tp.services {
            content.push_str(&zap_line(tp, service));
            content.push('\n');
            count += 1;
        }
    }

    if path.exists() {
        let backup = std::path::PathBuf::from(format!("{}.old", path.display()));
        fs::rename(path, &backup)
            .with_context(|| format!("failed to back up {}", path.display()))?;
        info!("backed up existing {} to {}", path.display(), backup.display());
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(count)
}

fn format_local_time(ts: i64) -> String {
    let time_t = ts as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe { libc::localtime_r(&time_t, &mut tm) };
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
    )
}

fn fmt_opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Tab-separated report: one row per locked RF channel with its signal
/// readings, followed by the virtual channels found on it.
pub fn write_report(
    path: &Path,
    scanner: &Scanner,
    readings: &[MultiplexReading],
    description: &str,
) -> Result<()> {
    let now = unsafe { libc::time(std::ptr::null_mut()) };

    let mut out = String::new();
    let _ = writeln!(out, "{}\t{}", format_local_time(now), description);
    let _ = writeln!(
        out,
        "chan_num\tchan_MHz\tlock\trssi_dBm\tsnr_dB\tber\tunc\tvirtual_channels"
    );

    let mut rf_channels = 0;
    let mut virtual_channels = 0;
    for reading in readings {
        let rssi = reading
            .stats
            .signal_strength
            .map(|s| (s as i16 as i32) / 100);
        let snr = reading.stats.snr.map(|s| s as f32 / 10.0);

        rf_channels += 1;
        let _ = write!(
            out,
            "{}\t{}\t1\t{}\t{}\t{}\t{}",
            fmt_opt(reading.rf_channel),
            reading.frequency / 1_000_000,
            fmt_opt(rssi),
            snr.map(|s| format!("{s:.1}")).unwrap_or_else(|| "-".to_string()),
            fmt_opt(reading.stats.ber),
            fmt_opt(reading.stats.uncorrected_blocks),
        );

        let tp = scanner
            .scanned
            .iter()
            .find(|tp| !tp.wrong_frequency && same_frequency(tp.params.frequency, reading.frequency));
        if let Some(tp) = tp {
            for service in &tp.services {
                virtual_channels += 1;
                let (major, minor) = match service.channel_num {
                    Some(num) => (num >> 10, num & 0x3FF),
                    None => (0, service.service_id),
                };
                let audio_pid = service.audio.first().map(|t| t.pid).unwrap_or(0);
                let _ = write!(
                    out,
                    "\t{}.{}\t{}\t{}\t{}",
                    major,
                    minor,
                    service.display_name(),
                    service.video_pid,
                    audio_pid,
                );
            }
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "Total locked\t{rf_channels} RF channels\t{virtual_channels} virtual channels"
    );

    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
