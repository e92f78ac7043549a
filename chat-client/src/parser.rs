//! Incremental decoder for the chat event stream.
//!
//! Bytes may arrive in any split: one delivery with the whole body, one byte
//! at a time, or a frame separator cut across two deliveries. The parser
//! only ever appends to its buffer and cuts complete frames off the front.

use service_core::chat::{Frame, FrameError, FrameEvent, DONE_SENTINEL};

const SEPARATOR: &[u8] = b"\n\n";

/// Event name used when a frame has no `event:` line.
const DEFAULT_EVENT: &str = "message";

/// An undecoded frame: event name and data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    pub data: String,
}

impl RawFrame {
    fn done() -> Self {
        RawFrame {
            event: FrameEvent::Done.as_str().to_string(),
            data: DONE_SENTINEL.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        FrameEvent::parse(&self.event).is_some_and(|event| event.is_terminal())
    }

    /// Typed frame, or `None` for event names this client does not know.
    pub fn decode(&self) -> Result<Option<Frame>, FrameError> {
        Frame::decode(&self.event, &self.data)
    }

    /// Split one frame's text into event name and data.
    ///
    /// Several `data:` lines are joined with newlines in order. Returns
    /// `None` when the text has neither an event nor a data line.
    fn parse(text: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim());
            } else if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        if event.is_none() && data.is_empty() {
            return None;
        }

        Some(RawFrame {
            event: event.unwrap_or(DEFAULT_EVENT).to_string(),
            data: data.join("\n"),
        })
    }
}

/// Frame parser for one response. Create a new one per request.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    saw_terminal: bool,
    finished: bool,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes and return every frame they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<RawFrame> {
        if self.finished {
            return Vec::new();
        }

        self.buffer
            .extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = find(&self.buffer, SEPARATOR) {
            let chunk: Vec<u8> = self.buffer.drain(..end + SEPARATOR.len()).collect();
            let text = String::from_utf8_lossy(&chunk[..end]);
            if let Some(frame) = RawFrame::parse(&text) {
                self.observe(&frame);
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush at end of body.
    ///
    /// Leftover text becomes one last frame, and a `done` frame is
    /// synthesized when no terminal frame was seen.
    pub fn finish(&mut self) -> Vec<RawFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut frames = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        if !text.trim().is_empty() {
            if let Some(frame) = RawFrame::parse(&text) {
                self.observe(&frame);
                frames.push(frame);
            }
        }

        if !self.saw_terminal {
            self.saw_terminal = true;
            frames.push(RawFrame::done());
        }
        frames
    }

    pub fn saw_terminal(&self) -> bool {
        self.saw_terminal
    }

    fn observe(&mut self, frame: &RawFrame) {
        if frame.is_terminal() {
            self.saw_terminal = true;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Adapter for transports that report the whole body received so far
/// instead of the newly arrived part.
///
/// Only the suffix past the already processed length is fed to the parser,
/// so replaying a snapshot never duplicates frames.
#[derive(Debug, Default)]
pub struct SnapshotFeed {
    parser: FrameParser,
    processed: usize,
}

impl SnapshotFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_snapshot(&mut self, snapshot: &[u8]) -> Vec<RawFrame> {
        if snapshot.len() <= self.processed {
            return Vec::new();
        }
        let fresh = &snapshot[self.processed..];
        self.processed = snapshot.len();
        self.parser.push(fresh)
    }

    pub fn finish(&mut self) -> Vec<RawFrame> {
        self.parser.finish()
    }
}
