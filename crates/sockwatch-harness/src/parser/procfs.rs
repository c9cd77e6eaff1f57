//! Parser for the kernel socket tables in `/proc/net/tcp` and `/proc/net/tcp6`.
//!
//! ## Line Format
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue ...
//!    0: 0100007F:1F90 0100007F:D2A4 01 00000000:00000000 ...
//! ```
//! Addresses end in a hex port; `st` is the hex TCP state.

use crate::engine::census::CensusSample;

/// `TCP_ESTABLISHED` in the kernel state enum.
const STATE_ESTABLISHED: &str = "01";
/// `TCP_LISTEN`. Listening sockets are not connections and are skipped.
const STATE_LISTEN: &str = "0A";

/// Extracts the port of a `HEXADDR:HEXPORT` column.
fn hex_port(column: &str) -> Option<u16> {
    let (_, port) = column.rsplit_once(':')?;
    u16::from_str_radix(port, 16).ok()
}

/// Counts the connections in one table whose local or remote port is `port`.
///
/// Malformed rows and the header line are ignored.
pub fn parse_tcp_table(table: &str, port: u16) -> CensusSample {
    let mut sample = CensusSample::default();

    for line in table.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || !fields[0].ends_with(':') {
            continue;
        }

        let local = hex_port(fields[1]);
        let remote = hex_port(fields[2]);
        if local != Some(port) && remote != Some(port) {
            continue;
        }

        let state = fields[3];
        if state.eq_ignore_ascii_case(STATE_LISTEN) {
            continue;
        }

        sample.total += 1;
        if state == STATE_ESTABLISHED {
            sample.established += 1;
        }
    }

    sample
}
