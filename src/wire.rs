//! wardgate/src/wire.rs
//! Text-framed update protocol between the judge and the learning backend.
//!
//! The " # " section framing and the list-of-lists-of-base64 payload form
//! are wire contract; every producer and consumer of them lives here so the
//! framing could be swapped without touching judge or backend logic.

use crate::error::ProxyError;
use crate::types::{DEFAULT_TCP_BUFFSIZE, Mode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

pub const SECTION_DELIMITER: &str = " # ";

/// A parsed `centroids # mode # blocked` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub centroids: Vec<Vec<f64>>,
    pub mode: Mode,
    pub blocked: Vec<usize>,
}

/// Reads a framed message: chunks of [`DEFAULT_TCP_BUFFSIZE`] until a short
/// chunk or EOF ends the frame, each read bounded by `limit`. The protocol
/// is ASCII only.
pub async fn read_framed<R>(reader: &mut R, limit: Duration) -> Result<String, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut chunk = [0u8; DEFAULT_TCP_BUFFSIZE];
    loop {
        let n = timeout(limit, reader.read(&mut chunk))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        collected.extend_from_slice(&chunk[..n]);
        if n < DEFAULT_TCP_BUFFSIZE {
            break;
        }
    }
    if !collected.is_ascii() {
        return Err(ProxyError::Decode(
            "non-ascii bytes in framed message".to_string(),
        ));
    }
    String::from_utf8(collected).map_err(|e| ProxyError::Decode(e.to_string()))
}

/// `[['<b64>', '<b64>'], ['<b64>'], ...]` — one inner list per connection,
/// one base64 string per recorded packet.
pub fn encode_dataset(dataset: &[Vec<Vec<u8>>]) -> String {
    let conversations: Vec<String> = dataset
        .iter()
        .map(|conversation| {
            let packets: Vec<String> = conversation
                .iter()
                .map(|packet| format!("'{}'", STANDARD.encode(packet)))
                .collect();
            format!("[{}]", packets.join(", "))
        })
        .collect();
    format!("[{}]", conversations.join(", "))
}

/// Inverse of [`encode_dataset`]. A small bracket/quote scanner rather than
/// delimiter splitting, so `[[]]` and stray whitespace decode cleanly.
pub fn decode_dataset(payload: &str) -> Result<Vec<Vec<Vec<u8>>>, ProxyError> {
    let bytes = payload.as_bytes();
    let mut conversations: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut current: Option<Vec<Vec<u8>>> = None;
    let mut quote_start: Option<usize> = None;
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(start) = quote_start {
            if b == b'\'' {
                let decoded = STANDARD
                    .decode(&bytes[start..i])
                    .map_err(|e| ProxyError::Decode(format!("bad base64 packet: {e}")))?;
                match current.as_mut() {
                    Some(conversation) => conversation.push(decoded),
                    None => {
                        return Err(ProxyError::Decode(
                            "packet outside a conversation list".to_string(),
                        ));
                    }
                }
                quote_start = None;
            }
            continue;
        }
        match b {
            b'[' => {
                depth += 1;
                if depth == 2 {
                    current = Some(Vec::new());
                }
            }
            b']' => {
                if depth == 0 {
                    return Err(ProxyError::Decode("unbalanced brackets".to_string()));
                }
                if depth == 2 {
                    conversations.push(current.take().unwrap_or_default());
                }
                depth -= 1;
            }
            b'\'' => quote_start = Some(i + 1),
            _ => {}
        }
    }
    Ok(conversations)
}

/// `UPDATE # <service_id> # <payload>`.
pub fn encode_update(service_id: &str, dataset: &[Vec<Vec<u8>>]) -> String {
    format!(
        "UPDATE{SECTION_DELIMITER}{service_id}{SECTION_DELIMITER}{}",
        encode_dataset(dataset)
    )
}

/// `<centroids> # <mode> # <blocked>`.
pub fn encode_model_reply(centroids: &[Vec<f64>], mode: Mode, blocked: &[usize]) -> String {
    format!(
        "{}{SECTION_DELIMITER}{mode}{SECTION_DELIMITER}{}",
        fmt_float_lists(centroids),
        fmt_index_list(blocked)
    )
}

/// Parses an update reply. `Ok(None)` is the bootstrap case: an empty
/// frame, an empty centroid list, or fewer than two sections mean "no model
/// yet", and the round is skipped without touching state.
pub fn parse_model_reply(reply: &str) -> Result<Option<ModelReply>, ProxyError> {
    let sections: Vec<&str> = reply.trim().split(SECTION_DELIMITER).collect();
    if sections[0].is_empty() || sections[0] == "[]" || sections.len() < 2 {
        return Ok(None);
    }
    let centroids = parse_float_lists(sections[0])?;
    // Anything other than the literal ACTIVE_MODE keeps the judge simulating.
    let mode = sections[1].trim().parse().unwrap_or(Mode::Simulation);
    let blocked = match sections.get(2) {
        Some(section) => parse_index_list(section)?,
        None => Vec::new(),
    };
    Ok(Some(ModelReply {
        centroids,
        mode,
        blocked,
    }))
}

/// `[f, f, ..., f]` with shortest-roundtrip floats (always a decimal point).
pub fn fmt_float_list(values: &[f64]) -> String {
    let rendered: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
    format!("[{}]", rendered.join(", "))
}

/// `[[f, ...], [f, ...]]`.
pub fn fmt_float_lists(rows: &[Vec<f64>]) -> String {
    let rendered: Vec<String> = rows.iter().map(|row| fmt_float_list(row)).collect();
    format!("[{}]", rendered.join(", "))
}

pub fn fmt_index_list(indices: &[usize]) -> String {
    let rendered: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
    format!("[{}]", rendered.join(", "))
}

pub fn parse_float_lists(blob: &str) -> Result<Vec<Vec<f64>>, ProxyError> {
    let mut rows = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in blob.char_indices() {
        match c {
            '[' => {
                depth += 1;
                if depth == 2 {
                    start = i + 1;
                }
            }
            ']' => {
                if depth == 0 {
                    return Err(ProxyError::Decode("unbalanced brackets".to_string()));
                }
                if depth == 2 {
                    rows.push(parse_float_list(&blob[start..i])?);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Ok(rows)
}

/// Parses one float row, with or without its surrounding brackets.
pub fn parse_float_list(row: &str) -> Result<Vec<f64>, ProxyError> {
    row.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse()
                .map_err(|_| ProxyError::Decode(format!("bad float {token:?}")))
        })
        .collect()
}

pub fn parse_index_list(blob: &str) -> Result<Vec<usize>, ProxyError> {
    blob.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse()
                .map_err(|_| ProxyError::Decode(format!("bad index {token:?}")))
        })
        .collect()
}

/// Display form of one conversation: a list of single-quoted packet
/// strings, printable ASCII kept as-is, everything else `\xNN`-escaped.
/// This is both the convs-file line format and what CHECK_EXAMPLES prints.
pub fn fmt_conv_line(packets: &[Vec<u8>]) -> String {
    let rendered: Vec<String> = packets
        .iter()
        .map(|packet| {
            let mut out = String::with_capacity(packet.len() + 2);
            out.push('\'');
            for &b in packet {
                match b {
                    b'\'' => out.push_str("\\'"),
                    b'\\' => out.push_str("\\\\"),
                    0x20..=0x7E => out.push(b as char),
                    _ => out.push_str(&format!("\\x{b:02x}")),
                }
            }
            out.push('\'');
            out
        })
        .collect();
    format!("[{}]", rendered.join(", "))
}
