use thiserror::Error;

/// Why the lenient probe could not find a JSON value at the anchor.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no JSON value at this position")]
    NoValue,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// A `self.__next_f.push(...)` literal that is not a `[type, payload]` array.
    #[error("malformed push record #{index}: {reason}")]
    MalformedPush { index: usize, reason: String },

    /// A frame without a declared length whose value is not JSON.
    #[error("frame {id:?} at byte {offset}: {source}")]
    Probe {
        id: String,
        offset: usize,
        #[source]
        source: ProbeError,
    },

    /// A located frame whose JSON does not have the expected shape.
    #[error("unexpected shape in frame {id:?}: {reason}")]
    Shape { id: String, reason: &'static str },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
