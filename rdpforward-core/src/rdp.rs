//! Heuristic recovery of the client computer name from unencrypted RDP
//! traffic.
//!
//! The MCS Connect-Initial PDU embeds the client computer name as a
//! UTF-16-LE string. A full ASN.1 decoder is not warranted for an admission
//! key that fails closed on mismatch, so this module scans for a printable
//! UTF-16-LE run instead.

/// TPKT framing marker: version 3, reserved 0.
const TPKT_VERSION: u8 = 0x03;

/// Offsets scanned for a candidate name. The name sits past the TPKT and
/// X.224 headers and well before the end of the Connect-Initial payload.
const SCAN_START: usize = 10;
const SCAN_LIMIT: usize = 600;

/// Longest candidate run consumed, in bytes (32 UTF-16 code units).
const MAX_RUN_BYTES: usize = 64;

/// Shortest name accepted, in characters.
const MIN_NAME_LEN: usize = 3;

/// Attempts to recover the client computer name from a non-TLS RDP packet.
///
/// Scans the buffer for a run of UTF-16-LE printable ASCII: even offsets in
/// `0x20..=0x7E`, odd offsets zero. A run ends at a `0x00 0x00` code unit or
/// any non-conforming pair; the first run longer than three characters wins.
/// Returns `None` for buffers that are too short or lack the TPKT signature.
pub fn extract_client_name(data: &[u8]) -> Option<String> {
    if data.len() < 20 {
        return None;
    }

    if data[0] != TPKT_VERSION || data[1] != 0x00 {
        return None;
    }

    let scan_end = (data.len() - 20).min(SCAN_LIMIT);
    for start in SCAN_START..scan_end {
        if !is_printable(data[start]) || data[start + 1] != 0x00 {
            continue;
        }

        let mut name = Vec::new();
        let mut pos = start;
        while pos + 1 < data.len() && pos < start + MAX_RUN_BYTES {
            if data[pos] == 0x00 && data[pos + 1] == 0x00 {
                break;
            }
            if is_printable(data[pos]) && data[pos + 1] == 0x00 {
                name.push(data[pos]);
                pos += 2;
            } else {
                break;
            }
        }

        if name.len() > MIN_NAME_LEN {
            return String::from_utf8(name).ok();
        }
    }

    None
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte)
}
