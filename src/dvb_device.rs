//! DVB adapter discovery via sysfs.
//!
//! Walks `/sys/class/dvb`, groups the device nodes per adapter and resolves
//! the USB vendor/product strings from the usb.ids database when the tuner
//! hangs off a USB parent. Used by `doctor` and to default the adapter
//! number when none is given.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

const USB_IDS_PATHS: &[&str] = &["/usr/share/misc/usb.ids", "/usr/share/hwdata/usb.ids"];

#[derive(Debug, Default)]
pub struct TunerAdapter {
    pub adapter: u32,
    pub frontends: u32,
    pub demuxes: u32,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub vendor_name: Option<String>,
    pub product_name: Option<String>,
}

impl TunerAdapter {
    pub fn describe(&self) -> String {
        let vendor = self.vendor_name.as_deref().unwrap_or("Unknown vendor");
        let product = self.product_name.as_deref().unwrap_or("Unknown device");
        format!(
            "adapter{}: {} - {} ({} frontend(s), {} demux(es))",
            self.adapter, vendor, product, self.frontends, self.demuxes
        )
    }
}

/// Split a `/sys/class/dvb` entry name like `dvb0.frontend1` into its
/// adapter number and node kind.
fn parse_node_name(name: &str) -> Option<(u32, &str, u32)> {
    let rest = name.strip_prefix("dvb")?;
    let (adapter, node) = rest.split_once('.')?;
    let adapter = adapter.parse().ok()?;
    let split = node.find(|c: char| c.is_ascii_digit())?;
    let (kind, index) = node.split_at(split);
    Some((adapter, kind, index.parse().ok()?))
}

fn find_usb_parent(path: &Path) -> Option<(String, String)> {
    let mut current = path.to_path_buf();
    loop {
        let vendor_path = current.join("idVendor");
        let product_path = current.join("idProduct");
        if vendor_path.exists() && product_path.exists() {
            let vendor = fs::read_to_string(&vendor_path).ok()?.trim().to_string();
            let product = fs::read_to_string(&product_path).ok()?.trim().to_string();
            return Some((vendor, product));
        }
        if !current.pop() {
            return None;
        }
    }
}

fn lookup_usb_names(vendor_id: &str, product_id: &str) -> (Option<String>, Option<String>) {
    let Some(file) = USB_IDS_PATHS.iter().find_map(|p| fs::File::open(p).ok()) else {
        return (None, None);
    };

    let reader = BufReader::new(file);
    let mut vendor_name = None;
    let mut in_target_vendor = false;

    for line in reader.lines() {
        let Ok(line) = line else { continue };
        if line.starts_with('#') || line.is_empty() {
            continue;
        }

        if !line.starts_with('\t') {
            // vendor line: "VVVV  Vendor Name"
            if in_target_vendor {
                break; // left our vendor's section without a product match
            }
            if line.len() >= 4 && &line[..4] == vendor_id {
                vendor_name = Some(line[4..].trim().to_string());
                in_target_vendor = true;
            }
        } else if in_target_vendor && !line.starts_with("\t\t") {
            // product line: "\tPPPP  Product Name"
            let trimmed = line.trim_start_matches('\t');
            if trimmed.len() >= 4 && &trimmed[..4] == product_id {
                let product_name = trimmed[4..].trim().to_string();
                return (vendor_name, Some(product_name));
            }
        }
    }

    (vendor_name, None)
}

pub fn detect_adapters() -> Vec<TunerAdapter> {
    let dvb_class = Path::new("/sys/class/dvb");
    let Ok(entries) = fs::read_dir(dvb_class) else {
        return Vec::new();
    };

    let mut adapters: Vec<TunerAdapter> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name_lossy = name.to_string_lossy();
        let Some((adapter, kind, _)) = parse_node_name(&name_lossy) else {
            continue;
        };

        let slot = match adapters.iter().position(|a| a.adapter == adapter) {
            Some(idx) => &mut adapters[idx],
            None => {
                adapters.push(TunerAdapter {
                    adapter,
                    ..TunerAdapter::default()
                });
                adapters.last_mut().unwrap()
            }
        };
        match kind {
            "frontend" => slot.frontends += 1,
            "demux" => slot.demuxes += 1,
            _ => {}
        }

        if slot.vendor_id.is_none() {
            if let Ok(real_path) = fs::canonicalize(entry.path()) {
                if let Some((vendor_id, product_id)) = find_usb_parent(&real_path) {
                    let (vendor_name, product_name) = lookup_usb_names(&vendor_id, &product_id);
                    slot.vendor_id = Some(vendor_id);
                    slot.product_id = Some(product_id);
                    slot.vendor_name = vendor_name;
                    slot.product_name = product_name;
                }
            }
        }
    }

    adapters.sort_by_key(|a| a.adapter);
    adapters
}

/// First adapter that has both a frontend and a demux node.
pub fn default_adapter() -> Option<u32> {
    detect_adapters()
        .iter()
        .find(|a| a.frontends > 0 && a.demuxes > 0)
        .map(|a| a.adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_name() {
        assert_eq!(parse_node_name("dvb0.frontend0"), Some((0, "frontend", 0)));
        assert_eq!(parse_node_name("dvb2.demux1"), Some((2, "demux", 1)));
        assert_eq!(parse_node_name("dvb10.dvr0"), Some((10, "dvr", 0)));
    }

    #[test]
    fn test_parse_node_name_rejects_garbage() {
        assert_eq!(parse_node_name("video0"), None);
        assert_eq!(parse_node_name("dvb.frontend0"), None);
        assert_eq!(parse_node_name("dvb0"), None);
        assert_eq!(parse_node_name("dvb0.frontend"), None);
    }

    #[test]
    fn test_describe_without_usb_names() {
        let adapter = TunerAdapter {
            adapter: 1,
            frontends: 1,
            demuxes: 2,
            ..TunerAdapter::default()
        };
        let text = adapter.describe();
        assert!(text.contains("adapter1"));
        assert!(text.contains("Unknown vendor"));
        assert!(text.contains("1 frontend(s)"));
        assert!(text.contains("2 demux(es)"));
    }
}
