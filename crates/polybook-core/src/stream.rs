//! Demultiplexing of a subprocess output stream against the marker protocol.
//!
//! A [`StreamDemux`] receives output in arbitrary chunks and turns it into
//! [`StreamEvent`]s. Chunk boundaries never change what is observed: text
//! that could still grow into a sentinel is held back until the next chunk
//! confirms or rules it out.
//!
//! ```text
//! bytes ──► Utf8Decoder ──► StreamDemux ──┬─► Display("...")
//!                                         ├─► InputRequest { prompt }
//!                                         ├─► Started
//!                                         └─► Completed(ExecutionResult)
//! ```

use crate::execute::ExecutionResult;
use crate::markers::{
    self, CompletionMarker, INPUT_END, INPUT_START, PLOT_END, PLOT_START,
};

/// Something the demultiplexer observed in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Sentinel-free text to append to the display.
    Display(String),
    /// The start marker was seen; subsequent output is genuine.
    Started,
    /// The program is blocked waiting for one line of input.
    InputRequest { request_id: String, prompt: String },
    /// The armed completion marker was seen.
    Completed(ExecutionResult),
}

#[derive(Debug, Clone, Copy)]
enum Sentinel {
    InputStart,
    InputEnd,
    PlotStart,
    PlotEnd,
    Completion,
}

/// Marker-aware accumulator for one output stream.
#[derive(Debug)]
pub struct StreamDemux {
    /// Received text not yet consumed (lookahead).
    pending: String,
    /// Consumed stdout text for the current execution.
    raw: String,
    /// Text presented for the current execution.
    displayed: String,
    /// Marker that must be seen before any output counts.
    start_marker: Option<String>,
    started: bool,
    completion: Option<CompletionMarker>,
    in_plot: bool,
    /// Drop one line break right after a start or completion marker.
    skip_newline: bool,
}

impl Default for StreamDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDemux {
    /// Demultiplexer that treats all output as genuine from the first byte.
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            raw: String::new(),
            displayed: String::new(),
            start_marker: None,
            started: true,
            completion: None,
            in_plot: false,
            skip_newline: false,
        }
    }

    /// Demultiplexer that discards everything up to and including `marker`.
    pub fn with_start_marker(marker: impl Into<String>) -> Self {
        Self {
            start_marker: Some(marker.into()),
            started: false,
            ..Self::new()
        }
    }

    /// Whether the start marker has been seen.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Bind the demultiplexer to a new execution ending with `marker`.
    ///
    /// Output left over from a previous execution is discarded. A line break
    /// still owed by the previous marker is dropped when it arrives.
    pub fn arm(&mut self, marker: CompletionMarker) {
        if !self.pending.is_empty() || !self.displayed.is_empty() {
            tracing::debug!(
                stale = self.pending.len() + self.displayed.len(),
                "discarding output received between executions"
            );
        }
        self.pending.clear();
        self.raw.clear();
        self.displayed.clear();
        self.in_plot = false;
        self.completion = Some(marker);
    }

    /// Feed one chunk of stdout text.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();
        self.drain(&mut events);
        events
    }

    /// Feed one chunk of stderr text.
    ///
    /// Stderr carries no sentinels; it goes straight to the display once the
    /// stream has started.
    pub fn push_stderr(&mut self, chunk: &str) -> Option<StreamEvent> {
        if !self.started {
            return None;
        }
        let text = strip_sentinels(chunk);
        if text.is_empty() {
            return None;
        }
        self.displayed.push_str(&text);
        Some(StreamEvent::Display(text))
    }

    /// Append text to the display without it having been produced by the
    /// program (input echo).
    pub fn annotate(&mut self, text: &str) -> StreamEvent {
        self.displayed.push_str(text);
        StreamEvent::Display(text.to_string())
    }

    /// Text displayed so far for the current execution.
    pub fn displayed(&self) -> &str {
        &self.displayed
    }

    /// The stream has ended: flush held-back text and return the capture.
    pub fn finish(&mut self) -> (Option<StreamEvent>, ExecutionResult) {
        let tail = std::mem::take(&mut self.pending);
        let mut event = None;
        if self.started {
            self.raw.push_str(&tail);
            if !self.in_plot {
                let text = strip_sentinels(&markers::strip_plot_payloads(&tail));
                if !text.is_empty() {
                    self.displayed.push_str(&text);
                    event = Some(StreamEvent::Display(text));
                }
            }
        }
        self.in_plot = false;
        self.completion = None;
        let result = ExecutionResult {
            raw: std::mem::take(&mut self.raw),
            displayed: std::mem::take(&mut self.displayed),
        };
        (event, result)
    }

    fn drain(&mut self, events: &mut Vec<StreamEvent>) {
        loop {
            if self.skip_newline {
                if self.pending.starts_with("\r\n") {
                    self.pending.drain(..2);
                } else if self.pending.starts_with('\n') {
                    self.pending.drain(..1);
                } else if self.pending.is_empty() || self.pending == "\r" {
                    return;
                }
                self.skip_newline = false;
            }

            if !self.started {
                let Some(marker) = self.start_marker.as_deref() else {
                    self.started = true;
                    continue;
                };
                match self.pending.find(marker) {
                    Some(i) => {
                        self.pending.drain(..i + marker.len());
                        self.started = true;
                        self.skip_newline = true;
                        events.push(StreamEvent::Started);
                        continue;
                    }
                    None => {
                        let keep = markers::partial_suffix_len(&self.pending, marker);
                        let noise = self.pending.len() - keep;
                        if noise > 0 {
                            tracing::trace!(noise, "dropping output before start marker");
                            self.pending.drain(..noise);
                        }
                        return;
                    }
                }
            }

            if self.in_plot {
                match self.pending.find(PLOT_END) {
                    Some(i) => {
                        self.consume_raw(i + PLOT_END.len());
                        self.in_plot = false;
                        continue;
                    }
                    None => {
                        let keep = markers::partial_suffix_len(&self.pending, PLOT_END);
                        self.consume_raw(self.pending.len() - keep);
                        return;
                    }
                }
            }

            match self.earliest_sentinel() {
                Some((i, Sentinel::InputStart)) => {
                    let after = i + INPUT_START.len();
                    let Some(j) = self.pending[after..].find(INPUT_END) else {
                        // Hold everything from the sentinel until the end tag arrives.
                        self.emit_display(i, events);
                        return;
                    };
                    self.emit_display(i, events);
                    let prompt_start = INPUT_START.len();
                    let prompt = self.pending[prompt_start..prompt_start + j].to_string();
                    self.consume_raw(prompt_start + j + INPUT_END.len());
                    let request_id = uuid::Uuid::new_v4().to_string();
                    tracing::debug!(%request_id, %prompt, "input requested");
                    events.push(StreamEvent::InputRequest { request_id, prompt });
                }
                Some((i, Sentinel::PlotStart)) => {
                    self.emit_display(i, events);
                    self.consume_raw(PLOT_START.len());
                    self.in_plot = true;
                }
                Some((i, Sentinel::InputEnd)) => {
                    self.emit_display(i, events);
                    self.consume_raw(INPUT_END.len());
                }
                Some((i, Sentinel::PlotEnd)) => {
                    self.emit_display(i, events);
                    self.consume_raw(PLOT_END.len());
                }
                Some((i, Sentinel::Completion)) => {
                    self.emit_display(i, events);
                    let marker_len = self
                        .completion
                        .take()
                        .map(|m| m.as_str().len())
                        .unwrap_or_default();
                    self.pending.drain(..marker_len);
                    self.skip_newline = true;
                    events.push(StreamEvent::Completed(ExecutionResult {
                        raw: std::mem::take(&mut self.raw),
                        displayed: std::mem::take(&mut self.displayed),
                    }));
                }
                None => {
                    let keep = self.longest_partial_sentinel();
                    self.emit_display(self.pending.len() - keep, events);
                    return;
                }
            }
        }
    }

    fn earliest_sentinel(&self) -> Option<(usize, Sentinel)> {
        let mut candidates = vec![
            (INPUT_START, Sentinel::InputStart),
            (INPUT_END, Sentinel::InputEnd),
            (PLOT_START, Sentinel::PlotStart),
            (PLOT_END, Sentinel::PlotEnd),
        ];
        if let Some(marker) = &self.completion {
            candidates.push((marker.as_str(), Sentinel::Completion));
        }
        candidates
            .into_iter()
            .filter_map(|(text, kind)| self.pending.find(text).map(|i| (i, kind)))
            .min_by_key(|(i, _)| *i)
    }

    fn longest_partial_sentinel(&self) -> usize {
        let mut keep = [INPUT_START, INPUT_END, PLOT_START, PLOT_END]
            .into_iter()
            .map(|s| markers::partial_suffix_len(&self.pending, s))
            .max()
            .unwrap_or(0);
        if let Some(marker) = &self.completion {
            keep = keep.max(markers::partial_suffix_len(&self.pending, marker.as_str()));
        }
        keep
    }

    /// Move `len` bytes of pending text to the display (and the raw capture).
    fn emit_display(&mut self, len: usize, events: &mut Vec<StreamEvent>) {
        if len == 0 {
            return;
        }
        let text: String = self.pending.drain(..len).collect();
        self.raw.push_str(&text);
        self.displayed.push_str(&text);
        events.push(StreamEvent::Display(text));
    }

    /// Move `len` bytes of pending text to the raw capture only.
    fn consume_raw(&mut self, len: usize) {
        let text: String = self.pending.drain(..len).collect();
        self.raw.push_str(&text);
    }
}

fn strip_sentinels(text: &str) -> String {
    let mut out = text.to_string();
    for sentinel in [INPUT_START, INPUT_END, PLOT_START, PLOT_END] {
        if out.contains(sentinel) {
            out = out.replace(sentinel, "");
        }
    }
    out
}

/// Incremental UTF-8 decoder that tolerates code points split across reads.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` (plus any carried tail) as is complete.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(text) => {
                    out.push_str(text);
                    self.carry.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match err.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.carry.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// End of stream: anything still carried is invalid.
    pub fn flush(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display_of(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Display(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_text_flushes_immediately() {
        let mut demux = StreamDemux::new();
        let events = demux.push("hello\n");
        assert_eq!(events, vec![StreamEvent::Display("hello\n".to_string())]);
    }

    #[test]
    fn test_partial_input_sentinel_is_withheld() {
        let mut demux = StreamDemux::new();
        let events = demux.push("abc__POLYBOOK_IN");
        assert_eq!(display_of(&events), "abc");

        let events = demux.push("PUT_START__Name: __POLYBOOK_INPUT_END__rest");
        assert!(matches!(
            &events[0],
            StreamEvent::InputRequest { prompt, .. } if prompt == "Name: "
        ));
        assert_eq!(display_of(&events), "rest");
    }

    #[test]
    fn test_input_request_waits_for_end_tag() {
        let mut demux = StreamDemux::new();
        let events = demux.push("x__POLYBOOK_INPUT_START__Age?");
        assert_eq!(display_of(&events), "x");
        assert_eq!(events.len(), 1);

        let events = demux.push(" __POLYBOOK_INPUT_END__");
        assert!(matches!(
            &events[..],
            [StreamEvent::InputRequest { prompt, .. }] if prompt == "Age? "
        ));
    }

    #[test]
    fn test_completion_marker_splits_result() {
        let marker = CompletionMarker::generate();
        let mut demux = StreamDemux::new();
        demux.arm(marker.clone());

        let events = demux.push(&format!("hi\n{marker}\n"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Display("hi\n".to_string()));
        match &events[1] {
            StreamEvent::Completed(result) => {
                assert_eq!(result.displayed, "hi\n");
                assert_eq!(result.raw, "hi\n");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        // The newline after the marker belongs to no execution.
        assert!(demux.push("").is_empty());
        assert_eq!(demux.displayed(), "");
    }

    #[test]
    fn test_arm_keeps_pending_newline_skip() {
        let first = CompletionMarker::generate();
        let second = CompletionMarker::generate();
        let mut demux = StreamDemux::with_start_marker("READY");

        assert_eq!(demux.push("READY"), vec![StreamEvent::Started]);
        demux.arm(first.clone());
        assert!(demux.push("\n").is_empty());
        demux.push("hi\n");
        let events = demux.push(first.as_str());
        assert!(matches!(
            &events[..],
            [StreamEvent::Completed(result)] if result.displayed == "hi\n"
        ));

        demux.arm(second.clone());
        let events = demux.push(&format!("\nthere\n{second}\n"));
        assert_eq!(events[0], StreamEvent::Display("there\n".to_string()));
        assert!(matches!(
            &events[1],
            StreamEvent::Completed(result) if result.displayed == "there\n"
        ));
    }

    #[test]
    fn test_unarmed_marker_is_plain_text() {
        let marker = CompletionMarker::generate();
        let mut demux = StreamDemux::new();
        let events = demux.push(&format!("{marker}\n"));
        assert_eq!(display_of(&events), format!("{marker}\n"));
    }

    #[test]
    fn test_start_marker_suppresses_banner() {
        let mut demux = StreamDemux::with_start_marker("READY");
        assert!(demux.push("Python 3.11 banner\n>>> ").is_empty());
        let events = demux.push("REA");
        assert!(events.is_empty());
        let events = demux.push("DY\r\nfirst");
        assert_eq!(
            events,
            vec![
                StreamEvent::Started,
                StreamEvent::Display("first".to_string())
            ]
        );
        assert!(demux.is_started());
    }

    #[test]
    fn test_stderr_ignored_before_start() {
        let mut demux = StreamDemux::with_start_marker("READY");
        assert!(demux.push_stderr(">>> ").is_none());
        demux.push("READY\n");
        assert_eq!(
            demux.push_stderr("warn\n"),
            Some(StreamEvent::Display("warn\n".to_string()))
        );
    }

    #[test]
    fn test_plot_payload_never_displayed() {
        let mut demux = StreamDemux::new();
        let mut events = demux.push("a__POLYBOOK_PLOT_START__iVBOR");
        events.extend(demux.push("w0KGgo__POLYBOOK_PLOT_END__b"));
        assert_eq!(display_of(&events), "ab");

        let (_, result) = demux.finish();
        assert_eq!(result.displayed, "ab");
        assert_eq!(
            markers::plot_payloads(&result.raw),
            vec!["iVBORw0KGgo".to_string()]
        );
    }

    #[test]
    fn test_annotate_affects_display_only() {
        let mut demux = StreamDemux::new();
        demux.push("Name: ");
        demux.annotate("Ada\n");
        let (_, result) = demux.finish();
        assert_eq!(result.displayed, "Name: Ada\n");
        assert_eq!(result.raw, "Name: ");
    }

    #[test]
    fn test_finish_flushes_withheld_suffix() {
        let mut demux = StreamDemux::new();
        let events = demux.push("tail__POLY");
        assert_eq!(display_of(&events), "tail");
        let (event, result) = demux.finish();
        assert_eq!(event, Some(StreamEvent::Display("__POLY".to_string())));
        assert_eq!(result.displayed, "tail__POLY");
    }

    #[test]
    fn test_stray_end_tags_are_dropped() {
        let mut demux = StreamDemux::new();
        let events = demux.push("a__POLYBOOK_INPUT_END__b__POLYBOOK_PLOT_END__c");
        assert_eq!(display_of(&events), "abc");
    }

    #[test]
    fn test_utf8_decoder_handles_split_code_points() {
        let bytes = "héllo 日本".as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        out.push_str(&decoder.flush());
        assert_eq!(out, "héllo 日本");
    }

    #[test]
    fn test_utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(&[b'a', 0xff, b'b']);
        assert_eq!(out, "a\u{fffd}b");
    }
}
