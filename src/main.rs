use std::path::PathBuf;
use std::process;

use atscscan::demux::LinuxDemux;
use atscscan::dvb_device;
use atscscan::output;
use atscscan::scan::{ATSC_TYPE_CABLE, ATSC_TYPE_TERRESTRIAL, ScanController, ScanOptions};
use atscscan::tuner::{DeliverySystem, Frontend as _, LinuxFrontend};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("scan") => cmd_scan(&args[2..]),
        Some("doctor") => cmd_doctor(),
        _ => print_usage(),
    }
}

fn print_usage() {
    eprintln!("Usage: atscscan <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  scan             Scan the ATSC channel plan for services");
    eprintln!("  doctor           Check system readiness");
    eprintln!();
    eprintln!("Scan options:");
    eprintln!("  -a N             use DVB /dev/dvb/adapterN/ (default: first usable)");
    eprintln!("  -f N             use frontendN (default 0)");
    eprintln!("  -d N             use demuxN (default 0)");
    eprintln!("  -5               multiply all filter timeouts by 5,");
    eprintln!("                   for non-compliant section repetition rates");
    eprintln!("  -P               do not use ATSC PSIP tables (PAT and PMT only)");
    eprintln!("  -A N             ATSC type: 1=terrestrial [default], 2=cable, 3=both");
    eprintln!("  -c               scan on the currently tuned transponder only");
    eprintln!("  -u               honour UK Freeview channel numbers (NIT 0x83)");
    eprintln!("  -o FILE          channel list output (default: channels.conf)");
    eprintln!("  -r FILE          also write a tab-separated signal report");
    eprintln!("  -l TEXT          antenna location noted in the report");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  atscscan scan");
    eprintln!("  atscscan scan -A 3 -o channels.conf -r scan-report.txt");
    eprintln!("  atscscan doctor");
    process::exit(1);
}

struct ScanArgs {
    adapter: Option<u32>,
    frontend: u32,
    demux: u32,
    options: ScanOptions,
    output: PathBuf,
    report: Option<PathBuf>,
    description: String,
}

fn parse_scan_args(args: &[String]) -> ScanArgs {
    let mut parsed = ScanArgs {
        adapter: None,
        frontend: 0,
        demux: 0,
        options: ScanOptions::default(),
        output: PathBuf::from("channels.conf"),
        report: None,
        description: "Living room".to_string(),
    };

    let mut i = 0;
    let value = |args: &[String], i: usize| -> String {
        args.get(i + 1).cloned().unwrap_or_else(|| {
            eprintln!("Error: missing value for {}", args[i]);
            process::exit(1);
        })
    };
    while i < args.len() {
        match args[i].as_str() {
            "-a" => {
                parsed.adapter = Some(parse_u32(&args[i], &value(args, i)));
                i += 2;
            }
            "-f" => {
                parsed.frontend = parse_u32(&args[i], &value(args, i));
                i += 2;
            }
            "-d" => {
                parsed.demux = parse_u32(&args[i], &value(args, i));
                i += 2;
            }
            "-5" => {
                parsed.options.long_timeout = true;
                i += 1;
            }
            "-P" => {
                parsed.options.no_psip = true;
                i += 1;
            }
            "-A" => {
                let mask = parse_u32(&args[i], &value(args, i));
                if mask == 0 || mask > (ATSC_TYPE_TERRESTRIAL | ATSC_TYPE_CABLE) as u32 {
                    eprintln!("Error: -A takes 1 (terrestrial), 2 (cable) or 3 (both)");
                    process::exit(1);
                }
                parsed.options.atsc_type_mask = mask as u8;
                i += 2;
            }
            "-c" => {
                parsed.options.current_tp_only = true;
                i += 1;
            }
            "-u" => {
                parsed.options.uk_channel_numbers = true;
                i += 1;
            }
            "-o" => {
                parsed.output = PathBuf::from(value(args, i));
                i += 2;
            }
            "-r" => {
                parsed.report = Some(PathBuf::from(value(args, i)));
                i += 2;
            }
            "-l" => {
                parsed.description = value(args, i);
                i += 2;
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
            }
        }
    }
    parsed
}

fn parse_u32(flag: &str, value: &str) -> u32 {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value '{value}' for {flag}");
        process::exit(1);
    })
}

fn cmd_scan(args: &[String]) {
    let parsed = parse_scan_args(args);

    let adapter = match parsed.adapter.or_else(dvb_device::default_adapter) {
        Some(adapter) => adapter,
        None => {
            eprintln!("No DVB adapters found.");
            process::exit(1);
        }
    };
    for dev in dvb_device::detect_adapters() {
        println!("{}", dev.describe());
    }

    let frontend = match LinuxFrontend::open(adapter, parsed.frontend) {
        Ok(fe) => fe,
        Err(e) => {
            eprintln!("Failed to open frontend: {e:#}");
            process::exit(1);
        }
    };
    println!(
        "Using adapter{adapter} frontend{} ({}), demux{}",
        parsed.frontend,
        frontend.name(),
        parsed.demux
    );

    let demux = LinuxDemux::new(adapter, parsed.demux);
    let mut controller = ScanController::new(frontend, demux, parsed.options.clone());
    if let Err(e) = controller.run() {
        eprintln!("Scan failed: {e:#}");
        process::exit(1);
    }
    let (scanner, readings) = controller.into_results();

    // summary on stdout, one line per virtual channel
    let mut found = 0;
    for tp in &scanner.scanned {
        if tp.wrong_frequency || tp.services.is_empty() {
            continue;
        }
        println!(
            "\n{} MHz ({} services):",
            tp.params.frequency / 1_000_000,
            tp.services.len()
        );
        for service in &tp.services {
            found += 1;
            let channel = match service.channel_num {
                Some(num) => format!("{}.{}", num >> 10, num & 0x3FF),
                None => "-".to_string(),
            };
            println!(
                "  {channel} {} (SID={}, video=0x{:04x}, audio=0x{:04x})",
                service.display_name(),
                service.service_id,
                service.video_pid,
                service.audio.first().map(|t| t.pid).unwrap_or(0),
            );
        }
    }
    if found == 0 {
        println!("No channels found.");
        return;
    }

    match output::write_channels(&parsed.output, &scanner) {
        Ok(count) => println!("\nWrote {count} channels to {}", parsed.output.display()),
        Err(e) => {
            eprintln!("{e:#}");
            process::exit(1);
        }
    }
    if let Some(report) = &parsed.report {
        match output::write_report(report, &scanner, &readings, &parsed.description) {
            Ok(()) => println!("Wrote signal report to {}", report.display()),
            Err(e) => {
                eprintln!("{e:#}");
                process::exit(1);
            }
        }
    }
}

fn cmd_doctor() {
    const GREEN: &str = "\x1b[32m";
    const RED: &str = "\x1b[31m";
    const BOLD: &str = "\x1b[1m";
    const RESET: &str = "\x1b[0m";

    let mut ok = true;

    print!("DVB adapters ... ");
    let adapters = dvb_device::detect_adapters();
    if adapters.is_empty() {
        println!("{RED}{BOLD}NOT FOUND{RESET}");
        ok = false;
    } else {
        println!("{GREEN}OK{RESET}");
        for dev in &adapters {
            println!("  {}", dev.describe());
        }
    }

    print!("frontend device ... ");
    match dvb_device::default_adapter() {
        Some(adapter) => match LinuxFrontend::open(adapter, 0) {
            Ok(fe) => {
                println!(
                    "{GREEN}OK{RESET} ({}, {})",
                    fe.name(),
                    fe.delivery_system().name()
                );
                if fe.delivery_system() != DeliverySystem::Atsc {
                    println!("  Note: frontend is not in ATSC mode; the scan will switch it.");
                }
            }
            Err(e) => {
                println!("{RED}{BOLD}FAILED{RESET}");
                println!("  {e:#}");
                ok = false;
            }
        },
        None => {
            println!("{RED}{BOLD}NO USABLE ADAPTER{RESET}");
            ok = false;
        }
    }

    println!();
    if ok {
        println!("{GREEN}{BOLD}All checks passed.{RESET}");
    } else {
        println!("{RED}{BOLD}Some checks failed.{RESET}");
        process::exit(1);
    }
}
