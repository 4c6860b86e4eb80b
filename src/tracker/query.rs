//! Raw query-string parsing for announce requests.
//!
//! Announce parameters cannot go through a typed query extractor because
//! `info_hash` and `peer_id` are percent-encoded binary, not UTF-8. The
//! decoder here undoes the standard encoding byte by byte.

use super::registry::{Announce, InfoHash, DEFAULT_NUMWANT, MAX_NUMWANT};

/// Parses an announce query string.
///
/// `remote_ip` is the textual address of the requesting socket, used when
/// the client does not pass an explicit `ip` parameter. The error values
/// are the literal plain-text bodies the tracker responds with.
pub(crate) fn parse_announce(raw: &str, remote_ip: String) -> Result<Announce, &'static str> {
    let mut info_hash = None;
    let mut peer_id = None;
    let mut port = None;
    let mut ip = None;
    let mut event = None;
    let mut numwant = None;

    for pair in raw.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value);
        match key {
            "info_hash" => info_hash = Some(value),
            "peer_id" => peer_id = Some(value),
            "port" => port = Some(value),
            "ip" => ip = Some(String::from_utf8_lossy(&value).into_owned()),
            "event" => event = Some(String::from_utf8_lossy(&value).into_owned()),
            "numwant" => numwant = Some(value),
            _ => {}
        }
    }

    let (Some(info_hash), Some(peer_id), Some(port)) = (info_hash, peer_id, port) else {
        return Err("missing required argument");
    };

    let port: u16 = std::str::from_utf8(&port)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or("port invalid")?;

    let numwant = match numwant {
        None => DEFAULT_NUMWANT,
        Some(raw) => match std::str::from_utf8(&raw).ok().and_then(|s| s.parse::<i64>().ok()) {
            Some(n) if (1..=MAX_NUMWANT as i64).contains(&n) => n as usize,
            Some(_) => MAX_NUMWANT,
            None => DEFAULT_NUMWANT,
        },
    };

    Ok(Announce {
        info_hash: InfoHash::new(info_hash),
        peer_id,
        ip: ip.unwrap_or(remote_ip),
        port,
        event,
        numwant,
    })
}

/// Decodes percent escapes (and `+` as space) into raw bytes. Malformed
/// escapes pass through literally rather than failing the request.
pub(crate) fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            byte => out.push(byte),
        }
        i += 1;
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
