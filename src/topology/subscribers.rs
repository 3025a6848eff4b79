//! Subscriber table loading and validation.
//!
//! The table is a header-bearing CSV with 13 columns: circuitID,
//! circuitName, deviceID, deviceName, ParentNode, mac, ipv4, ipv6,
//! downloadMin, uploadMin, downloadMax, uploadMax, comment. Lines starting
//! with `#` are comments. Multiple rows may share a circuitID; they become
//! one circuit with multiple devices.

use super::{Circuit, Device};
use crate::error::{Error, Result};
use ipnet::IpNet;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

/// Number of columns every data row must have
const COLUMN_COUNT: usize = 13;

/// Validate the subscriber table without building circuits.
///
/// All-or-nothing: every problem in the file is collected and reported in a
/// single [`Error::Validation`]. Checks per row: non-empty circuitID, all
/// IPv4/IPv6 entries parse as host or CIDR, no IP appears twice anywhere in
/// the file, `min >= 1`, `max >= 2` and `min <= max` in both directions,
/// and rows sharing a circuitID agree on the parent node.
pub fn validate_subscriber_table(path: &Path) -> Result<()> {
    let mut failures = Vec::new();
    let mut seen_ips: HashSet<String> = HashSet::new();
    let mut parent_by_circuit: HashMap<String, String> = HashMap::new();

    let mut reader = csv_reader(path)?;
    // Header is row 1
    let mut row_num = 1;
    for record in reader.records() {
        let record = record?;
        row_num += 1;
        if record.len() != COLUMN_COUNT {
            failures.push(format!(
                "row {row_num}: expected {COLUMN_COUNT} columns, found {}",
                record.len()
            ));
            continue;
        }
        let circuit_id = record[0].trim();
        let parent_node = normalize_parent(&record[4]);
        if circuit_id.is_empty() {
            failures.push(format!("row {row_num}: no circuit ID provided"));
        } else {
            match parent_by_circuit.get(circuit_id) {
                Some(previous) if *previous != "none" && *previous != parent_node => {
                    failures.push(format!(
                        "row {row_num}: circuit ID '{circuit_id}' has parent node \
                         '{parent_node}' but an earlier row used '{previous}'"
                    ));
                }
                Some(_) => {}
                None => {
                    parent_by_circuit.insert(circuit_id.to_string(), parent_node.clone());
                }
            }
        }

        for (field, want_v4, label) in [(&record[6], true, "IPv4"), (&record[7], false, "IPv6")] {
            for entry in split_ip_field(field) {
                if !seen_ips.insert(entry.clone()) {
                    failures.push(format!("row {row_num}: {label} '{entry}' is duplicate"));
                } else if !ip_entry_is_valid(&entry, want_v4) {
                    failures.push(format!("row {row_num}: {label} '{entry}' is not valid"));
                }
            }
        }

        let download_min = check_rate(&record[8], 1, "downloadMin", row_num, &mut failures);
        let upload_min = check_rate(&record[9], 1, "uploadMin", row_num, &mut failures);
        let download_max = check_rate(&record[10], 2, "downloadMax", row_num, &mut failures);
        let upload_max = check_rate(&record[11], 2, "uploadMax", row_num, &mut failures);
        if let (Some(min), Some(max)) = (download_min, download_max)
            && min > max
        {
            failures.push(format!(
                "row {row_num}: downloadMin {min} is greater than downloadMax {max}"
            ));
        }
        if let (Some(min), Some(max)) = (upload_min, upload_max)
            && min > max
        {
            failures.push(format!(
                "row {row_num}: uploadMin {min} is greater than uploadMax {max}"
            ));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation { failures })
    }
}

/// Load the subscriber table into the canonical circuit list.
///
/// Rows are grouped by circuitID; the first row's bandwidth values win and
/// later disagreements only warn. The configured overhead factor is applied
/// to all four plan numbers here, once, at load time. Rows with a blank
/// circuitID (only reachable through a pre-validation last-good fallback)
/// each become their own circuit under a synthetic per-row id.
pub fn load_subscriber_table(path: &Path, overhead_factor: f64) -> Result<Vec<Circuit>> {
    let mut circuits: Vec<Circuit> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    let mut reader = csv_reader(path)?;
    let mut row_num = 1;
    for record in reader.records() {
        let record = record?;
        row_num += 1;
        if record.len() != COLUMN_COUNT {
            return Err(Error::Validation {
                failures: vec![format!(
                    "row {row_num}: expected {COLUMN_COUNT} columns, found {}",
                    record.len()
                )],
            });
        }

        let circuit_id = record[0].trim().to_string();
        let circuit_name = record[1].trim().to_string();
        let device = Device {
            device_id: record[2].trim().to_string(),
            device_name: record[3].trim().to_string(),
            mac: record[5].trim().to_string(),
            ipv4s: split_ip_field(&record[6]),
            ipv6s: split_ip_field(&record[7]),
            comment: record[12].to_string(),
        };
        let parent_node = normalize_parent(&record[4]);
        let min_download = rate_with_overhead(&record[8], overhead_factor, row_num)?;
        let min_upload = rate_with_overhead(&record[9], overhead_factor, row_num)?;
        let max_download = rate_with_overhead(&record[10], overhead_factor, row_num)?;
        let max_upload = rate_with_overhead(&record[11], overhead_factor, row_num)?;

        if !circuit_id.is_empty()
            && let Some(&existing) = index_by_id.get(&circuit_id)
        {
            let circuit = &mut circuits[existing];
            if circuit.parent_node != "none" && circuit.parent_node != parent_node {
                return Err(Error::Validation {
                    failures: vec![format!(
                        "device '{}' ({}) has a different parent node than other \
                         devices of circuit ID '{circuit_id}'",
                        device.device_name, device.device_id
                    )],
                });
            }
            if circuit.min_download != min_download
                || circuit.min_upload != min_upload
                || circuit.max_download != max_download
                || circuit.max_upload != max_upload
            {
                warn!(
                    device = %device.device_name,
                    circuit = %circuit_id,
                    "device has different bandwidth parameters than other devices \
                     on this circuit; keeping the first device's parameters"
                );
            }
            circuit.devices.push(device);
            continue;
        }

        let effective_id = if circuit_id.is_empty() {
            format!("anon-row-{row_num}")
        } else {
            circuit_id.clone()
        };
        let effective_name = if circuit_name.is_empty() {
            device.device_name.clone()
        } else {
            circuit_name
        };
        if !circuit_id.is_empty() {
            index_by_id.insert(circuit_id, circuits.len());
        }
        circuits.push(Circuit {
            circuit_id: effective_id,
            circuit_name: effective_name,
            parent_node,
            devices: vec![device],
            min_download,
            min_upload,
            max_download,
            max_upload,
            comment: record[12].to_string(),
        });
    }

    Ok(circuits)
}

fn csv_reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)?)
}

fn normalize_parent(field: &str) -> String {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        "none".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Split a comma-separated IP field, dropping whitespace
fn split_ip_field(field: &str) -> Vec<String> {
    let cleaned: String = field.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Vec::new();
    }
    cleaned.split(',').map(str::to_string).collect()
}

/// A single entry is valid as a bare host address or a CIDR network of the
/// expected family
fn ip_entry_is_valid(entry: &str, want_v4: bool) -> bool {
    if let Ok(addr) = entry.parse::<IpAddr>() {
        return addr.is_ipv4() == want_v4;
    }
    if let Ok(net) = entry.parse::<IpNet>() {
        return matches!(net, IpNet::V4(_)) == want_v4;
    }
    false
}

fn check_rate(
    field: &str,
    floor: u64,
    label: &str,
    row_num: usize,
    failures: &mut Vec<String>,
) -> Option<u64> {
    match field.trim().parse::<u64>() {
        Ok(value) if value >= floor => Some(value),
        Ok(value) => {
            failures.push(format!(
                "row {row_num}: {label} '{value}' is < {floor} Mbps"
            ));
            None
        }
        Err(_) => {
            failures.push(format!(
                "row {row_num}: {label} '{}' is not a valid integer",
                field.trim()
            ));
            None
        }
    }
}

fn rate_with_overhead(field: &str, overhead_factor: f64, row_num: usize) -> Result<u64> {
    let plan: u64 = field.trim().parse().map_err(|_| Error::Validation {
        failures: vec![format!(
            "row {row_num}: '{}' is not a valid integer rate",
            field.trim()
        )],
    })?;
    Ok((plan as f64 * overhead_factor).round() as u64)
}
