//! Parser for `netstat -tn` output.
//!
//! Linux prints `host:port`, BSD-derived systems print `host.port`; both are
//! accepted.

use crate::engine::census::CensusSample;

fn address_has_port(address: &str, port: u16) -> bool {
    let suffix = port.to_string();
    match address.strip_suffix(suffix.as_str()) {
        Some(rest) => rest.ends_with(':') || rest.ends_with('.'),
        None => false,
    }
}

/// Counts `tcp`/`tcp6` rows whose local or foreign address uses `port`.
pub fn parse_netstat(output: &str, port: u16) -> CensusSample {
    let mut sample = CensusSample::default();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || !fields[0].starts_with("tcp") {
            continue;
        }

        if !address_has_port(fields[3], port) && !address_has_port(fields[4], port) {
            continue;
        }

        sample.total += 1;
        if fields[5] == "ESTABLISHED" {
            sample.established += 1;
        }
    }

    sample
}
