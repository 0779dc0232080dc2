use tracing::debug;

use super::error::DecodeError;
use super::probe::probe_len;

/// Tag of frames whose payload is raw text with a declared hex length.
pub const TEXT_TAG: &str = "T";

/// Characters that begin a JSON value and so end a type tag.
const VALUE_START: &[char] = &['"', '{', '[', 'n'];

/// Bytes past a text frame's value that are searched for a resync marker.
const RESYNC_LOOKAHEAD: usize = 20;

/// A marker that betrays the true start of the record following a text frame.
/// Markers begin with the id delimiter so a text value that merely contains the
/// object does not match. The cursor is moved to `offset` bytes before the marker.
#[derive(Debug, Clone, Copy)]
pub struct ResyncSignature {
    pub marker: &'static str,
    pub offset: usize,
}

/// Checked in order; the first marker found wins.
pub const RESYNC_SIGNATURES: &[ResyncSignature] = &[
    ResyncSignature { marker: r#":{"__typename"#, offset: 1 },
    ResyncSignature { marker: r#":["$","$L1f","#, offset: 1 },
];

/// One decoded unit of the combined buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: String,
    pub type_tag: String,
    pub declared_length: Option<usize>,
    pub value: String,
}

impl Frame {
    pub fn is_text(&self) -> bool {
        self.type_tag == TEXT_TAG
    }
}

/// Split the combined buffer into frames, left to right.
pub fn decode_frames(buffer: &str) -> Result<Vec<Frame>, DecodeError> {
    let mut frames = Vec::new();
    let mut cursor = 0;

    while cursor < buffer.len() {
        match next_frame(buffer, cursor)? {
            Some((frame, next)) => {
                frames.push(frame);
                cursor = next;
            }
            None => break,
        }
    }

    Ok(frames)
}

/// Decode the frame starting at `cursor`, returning it with the cursor of the next one.
/// `Ok(None)` is the normal end of the stream.
pub fn next_frame(buffer: &str, cursor: usize) -> Result<Option<(Frame, usize)>, DecodeError> {
    let id = hex_run(&buffer[cursor..]);
    if id.is_empty() {
        debug!("No frame id at byte {}, stopping", cursor);
        return Ok(None);
    }
    let id = id.to_string();
    let mut pos = skip_char(buffer, cursor + id.len());

    let type_tag = type_tag(&buffer[pos..]).to_string();
    let mut declared_length = None;

    if type_tag == TEXT_TAG {
        let length_hex = hex_run(&buffer[pos + 1..]);
        if length_hex.is_empty() {
            debug!("No length after text tag in frame {:?}, stopping", id);
            return Ok(None);
        }
        // The run is hex digits only, so it parses unless it overflows usize.
        let Ok(length) = usize::from_str_radix(length_hex, 16) else {
            debug!("Length {:?} of frame {:?} overflows, stopping", length_hex, id);
            return Ok(None);
        };
        declared_length = Some(length);
        pos = skip_char(buffer, pos + 1 + length_hex.len());
    } else {
        pos += type_tag.len();
    }

    let rest = &buffer[pos..];
    let len = match declared_length {
        Some(declared) => probe_len(rest).unwrap_or(declared),
        None => probe_len(rest).map_err(|source| DecodeError::Probe {
            id: id.clone(),
            offset: pos,
            source,
        })?,
    };
    let mut len = ceil_boundary(rest, len);

    if type_tag == TEXT_TAG {
        if let Some(resynced) = resync(rest, len) {
            debug!("Resynced text frame {:?}: {} -> {} bytes", id, len, resynced);
            len = resynced;
        }
    }

    let frame = Frame {
        id,
        type_tag,
        declared_length,
        value: rest[..len].to_string(),
    };
    Ok(Some((frame, pos + len)))
}

/// Where the record after a text frame really starts, if a known marker shows up
/// within the value or just past it.
fn resync(rest: &str, len: usize) -> Option<usize> {
    let window = &rest[..ceil_boundary(rest, len + RESYNC_LOOKAHEAD)];
    RESYNC_SIGNATURES.iter().find_map(|sig| {
        let at = window.find(sig.marker)?;
        Some(floor_boundary(rest, at.saturating_sub(sig.offset)))
    })
}

/// Leading run of lowercase hex digits.
fn hex_run(s: &str) -> &str {
    let end = s
        .bytes()
        .position(|b| !matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        .unwrap_or(s.len());
    &s[..end]
}

/// The tag between the id delimiter and the value. Not consumed here.
fn type_tag(s: &str) -> &str {
    if s.starts_with(TEXT_TAG) {
        return TEXT_TAG;
    }
    let end = s
        .find(|c: char| VALUE_START.contains(&c) || c == 'T')
        .unwrap_or(s.len());
    &s[..end]
}

/// Step over one character at `pos`, if any.
fn skip_char(s: &str, pos: usize) -> usize {
    s[pos..].chars().next().map_or(pos, |c| pos + c.len_utf8())
}

/// Clamp `n` to `s` and move it forward onto a char boundary.
fn ceil_boundary(s: &str, n: usize) -> usize {
    let mut n = n.min(s.len());
    while !s.is_char_boundary(n) {
        n += 1;
    }
    n
}

fn floor_boundary(s: &str, n: usize) -> usize {
    let mut n = n.min(s.len());
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    n
}
