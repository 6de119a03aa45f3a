//! Textual sentinels multiplexed into a subprocess's output stream.
//!
//! Sentinels are plain strings chosen to be vanishingly unlikely in real
//! program output. User output is not escaped against them: a program that
//! prints one verbatim will confuse the stream demultiplexer.

use std::time::{SystemTime, UNIX_EPOCH};

/// Opens an input request. The prompt follows.
pub const INPUT_START: &str = "__POLYBOOK_INPUT_START__";

/// Closes an input request.
pub const INPUT_END: &str = "__POLYBOOK_INPUT_END__";

/// Opens a base64-encoded image payload.
pub const PLOT_START: &str = "__POLYBOOK_PLOT_START__";

/// Closes an image payload.
pub const PLOT_END: &str = "__POLYBOOK_PLOT_END__";

/// Printed once by the interpreter preamble when it is ready for submissions.
pub const READY: &str = "__POLYBOOK_READY__";

const COMPLETION_PREFIX: &str = "__POLYBOOK_END_";

/// Per-execution sentinel signalling the end of one submission's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompletionMarker(String);

impl CompletionMarker {
    /// Mint a fresh marker from the current time and a random suffix.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{COMPLETION_PREFIX}{millis}_{}__", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CompletionMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length of the longest suffix of `text` that is a strict prefix of `sentinel`.
///
/// Such a suffix may still complete into the sentinel once more output
/// arrives, so it must not be flushed yet.
pub fn partial_suffix_len(text: &str, sentinel: &str) -> usize {
    let max = sentinel.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&len| {
            text.is_char_boundary(text.len() - len) && sentinel.starts_with(&text[text.len() - len..])
        })
        .unwrap_or(0)
}

/// Extract every complete image payload from a raw capture, in order.
pub fn plot_payloads(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find(PLOT_START) {
        let after = &rest[start + PLOT_START.len()..];
        let Some(end) = after.find(PLOT_END) else {
            break;
        };
        let payload = after[..end].trim();
        if !payload.is_empty() {
            payloads.push(payload.to_string());
        }
        rest = &after[end + PLOT_END.len()..];
    }
    payloads
}

/// Remove every complete image payload (sentinels included) from `text`.
pub fn strip_plot_payloads(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(PLOT_START) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PLOT_START.len()..];
        match after.find(PLOT_END) {
            Some(end) => rest = &after[end + PLOT_END.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
