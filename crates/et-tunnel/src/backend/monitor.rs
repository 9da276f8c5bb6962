//! Helper output parsing
//!
//! The helper reports progress only through free-form text. Output is split
//! into whole lines (partial reads are buffered), each line is checked for
//! sentinel tokens, and a small state machine decides whether the helper is
//! still starting, ready, or failed on a port conflict.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use et_core::config::ProcessBackendConfig;

/// Longest line kept before it is cut and emitted as is
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Output lines kept for error reports
const TAIL_LINES: usize = 8;

/// Sentinel a line may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The forward is established
    Ready,
    /// The local port was already taken
    AddressInUse,
}

/// Sentinel tokens to look for in helper output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    ready: String,
    address_in_use: String,
}

impl Sentinels {
    /// Create a sentinel set
    pub fn new(ready: impl Into<String>, address_in_use: impl Into<String>) -> Self {
        Self {
            ready: ready.into(),
            address_in_use: address_in_use.into(),
        }
    }

    /// Sentinels configured for a process backend
    pub fn from_config(config: &ProcessBackendConfig) -> Self {
        Self::new(&config.ready_marker, &config.address_in_use_marker)
    }

    /// Which sentinel, if any, appears in `line`
    pub fn classify(&self, line: &str) -> Option<Marker> {
        if contains_token(line, &self.address_in_use) {
            Some(Marker::AddressInUse)
        } else if contains_token(line, &self.ready) {
            Some(Marker::Ready)
        } else {
            None
        }
    }
}

impl Default for Sentinels {
    fn default() -> Self {
        Self::from_config(&ProcessBackendConfig::default())
    }
}

/// Whether `token` occurs in `line` with no word character directly around it
fn contains_token(line: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }

    line.match_indices(token).any(|(start, _)| {
        let before = line[..start].chars().next_back();
        let after = line[start + token.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// One complete line of helper output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperLine {
    /// Line text without the terminator
    pub text: String,
    /// Sentinel found in the line
    pub marker: Option<Marker>,
}

/// Splits a helper's byte stream into classified lines
#[derive(Debug, Clone)]
pub struct HelperLineCodec {
    sentinels: Arc<Sentinels>,
}

impl HelperLineCodec {
    /// Create a codec matching `sentinels`
    pub fn new(sentinels: Arc<Sentinels>) -> Self {
        Self { sentinels }
    }

    fn line(&self, raw: &[u8]) -> HelperLine {
        let text = String::from_utf8_lossy(raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        let marker = self.sentinels.classify(&text);
        HelperLine { text, marker }
    }
}

impl Decoder for HelperLineCodec {
    type Item = HelperLine;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(newline) = src.iter().position(|b| *b == b'\n') {
            let raw = src.split_to(newline + 1);
            return Ok(Some(self.line(&raw)));
        }

        if src.len() > MAX_LINE_LENGTH {
            let raw = src.split_to(MAX_LINE_LENGTH);
            return Ok(Some(self.line(&raw)));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let raw = src.split();
                Ok(Some(self.line(&raw)))
            }
        }
    }
}

/// Startup state of a helper process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    /// No sentinel seen yet
    Starting,
    /// Ready sentinel seen
    Ready,
    /// Address-in-use sentinel seen before ready
    Failed,
}

/// Tracks a helper's startup from its output lines
#[derive(Debug)]
pub struct HelperMonitor {
    state: HelperState,
    tail: VecDeque<String>,
}

impl HelperMonitor {
    /// Create a monitor in the starting state
    pub fn new() -> Self {
        Self {
            state: HelperState::Starting,
            tail: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    /// Current state
    pub fn state(&self) -> HelperState {
        self.state
    }

    /// Feed one line; returns the new state if it changed
    pub fn observe(&mut self, line: &HelperLine) -> Option<HelperState> {
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.text.clone());

        let next = match (self.state, line.marker) {
            (HelperState::Starting, Some(Marker::Ready)) => HelperState::Ready,
            (HelperState::Starting, Some(Marker::AddressInUse)) => HelperState::Failed,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    /// Last few lines of output, oldest first
    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join(" | ")
    }
}

impl Default for HelperMonitor {
    fn default() -> Self {
        Self::new()
    }
}
