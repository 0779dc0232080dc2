use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, trace};

use super::error::DecodeError;
use super::scripts::ScriptBlock;

static PUSH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"self\.__next_f\.push\(\s*(\[[\s\S]*?\])\s*\)").unwrap());

/// Push records with this type code carry chunks of the combined buffer.
pub const TEXT_CHUNK: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub type_code: i64,
    pub payload: String,
}

/// All push records after the marker script, in page order.
///
/// `Ok(None)` means the marker script is not on the page, which happens on pages that
/// carry no streamed payload at all.
pub fn push_records(
    scripts: &[ScriptBlock],
    marker: &str,
) -> Result<Option<Vec<PushRecord>>, DecodeError> {
    let Some(marker_idx) = scripts
        .iter()
        .position(|s| s.src.as_deref().is_some_and(|src| src.contains(marker)))
    else {
        debug!("Marker script not found (marker={})", marker);
        return Ok(None);
    };

    let mut records = Vec::new();
    for script in &scripts[marker_idx + 1..] {
        for caps in PUSH_RE.captures_iter(&script.text) {
            let index = records.len();
            records.push(parse_record(index, caps[1].trim())?);
        }
    }
    Ok(Some(records))
}

/// Concatenation of every text-chunk payload, or `None` without a marker script.
pub fn combined_buffer(
    scripts: &[ScriptBlock],
    marker: &str,
) -> Result<Option<String>, DecodeError> {
    let Some(records) = push_records(scripts, marker)? else {
        return Ok(None);
    };

    let mut combined = String::new();
    for rec in records {
        if rec.type_code == TEXT_CHUNK {
            combined.push_str(&rec.payload);
        } else {
            trace!("Dropping push record of type {}", rec.type_code);
        }
    }
    Ok(Some(combined))
}

fn parse_record(index: usize, raw: &str) -> Result<PushRecord, DecodeError> {
    let malformed = |reason: String| DecodeError::MalformedPush { index, reason };

    let value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(malformed("not an array".into()));
    };
    let [code, payload] = items.as_slice() else {
        return Err(malformed(format!("expected 2 elements, got {}", items.len())));
    };
    let type_code = code
        .as_i64()
        .ok_or_else(|| malformed(format!("type code {} is not an integer", code)))?;

    let payload = match payload {
        Value::String(s) => s.clone(),
        _ if type_code == TEXT_CHUNK => {
            return Err(malformed("text chunk payload is not a string".into()));
        }
        other => other.to_string(),
    };

    Ok(PushRecord { type_code, payload })
}
