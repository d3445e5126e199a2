//! Trace wire protocol shared between the driver and the runtime probes.
//!
//! A probe writes exactly one line per record:
//! `LX_TRACE_START_<token><json>LX_TRACE_END_<token>\n`, where `<token>` is
//! the 32-char lowercase hex of a per-child 128-bit secret. Anything on
//! stdout that does not carry both markers is opaque program output.

use crate::util::truncate;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::path::PathBuf;

/// Upper bound on one serialized trace record. The runner exports this to
/// the child as `LX_TRACE_MAX_BYTES`; the probe library substitutes an
/// omitted-placeholder value when a record would exceed it.
pub const TRACE_MAX_BYTES: usize = 64 * 1024;

/// Parent-side cap on a single stdout line: the payload bound plus slack
/// for the two framing markers. Lines longer than this are discarded whole.
pub const LINE_BUFFER_CAP: usize = TRACE_MAX_BYTES + 256;

const START_MARKER_PREFIX: &str = "LX_TRACE_START_";
const END_MARKER_PREFIX: &str = "LX_TRACE_END_";

pub const KIND_INPUT: &str = "INPUT";
pub const KIND_OUTPUT: &str = "OUTPUT";

/// One dynamic observation decoded from the trace stream. `value` is kept
/// as a raw JSON document and decoded lazily by the merger.
#[derive(Debug, Deserialize)]
pub struct TraceRecord {
    pub kind: String,
    pub function: String,
    pub value: Box<RawValue>,
    #[serde(default)]
    pub file: PathBuf,
    #[serde(default)]
    pub line: u32,
}

/// The per-child start/end markers, built once per spawned process.
pub struct Framing {
    start: String,
    end: String,
}

impl Framing {
    pub fn new(token: &str) -> Self {
        Self {
            start: format!("{START_MARKER_PREFIX}{token}"),
            end: format!("{END_MARKER_PREFIX}{token}"),
        }
    }

    /// The JSON payload of `line`, if the line carries both markers.
    pub fn payload<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.strip_prefix(self.start.as_str())?
            .strip_suffix(self.end.as_str())
    }
}

/// Decode one stdout line into a record. Lines without the framing return
/// `None`; framed lines with malformed JSON are silently dropped too.
pub fn parse_line(framing: &Framing, line: &str) -> Option<TraceRecord> {
    let payload = framing.payload(line)?;
    serde_json::from_str(payload).ok()
}

/// Strip package and receiver qualification: `main.(*T).Get` -> `Get`.
pub fn normalize_function_name(full: &str) -> String {
    match full.rfind('.') {
        Some(idx) => full[idx + 1..].to_string(),
        None => full.to_string(),
    }
}

/// Short human preview of a raw JSON value for progress lines.
pub fn value_preview(raw: &RawValue, max: usize) -> String {
    let text = match serde_json::from_str::<serde_json::Value>(raw.get()) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(v) => v.to_string(),
        Err(_) => raw.get().to_string(),
    };
    truncate(&text, max)
}
