// src/supervise/queue.rs

//! Fan-in queue between the two stream drainers and the controller loop.
//!
//! Both drainers write into one unbounded channel; the controller is the
//! single consumer and polls it with a timed `recv` (see
//! [`crate::supervise::controller`]). An elapsed poll is the "no output this
//! tick" condition, not an error.

use tokio::sync::mpsc;

/// Which pipe of the child a queue entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn label(self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

/// One entry in the line queue.
///
/// - `Line` is a raw output line (trailing `\r`/`\n` stripped, not assumed to
///   be valid UTF-8).
/// - `Closed` is the per-stream end-of-stream sentinel; each drainer pushes
///   exactly one before returning.
/// - `Fatal` reports an unexpected OS-level read error. The controller treats
///   it as fatal for the whole execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    Line {
        bytes: Vec<u8>,
        source: StreamSource,
    },
    Closed(StreamSource),
    Fatal(String),
}

impl QueueEntry {
    /// Lossy UTF-8 view of a `Line` entry, empty for the other variants.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            QueueEntry::Line { bytes, .. } => String::from_utf8_lossy(bytes),
            _ => std::borrow::Cow::Borrowed(""),
        }
    }
}

pub type LineSender = mpsc::UnboundedSender<QueueEntry>;
pub type LineReceiver = mpsc::UnboundedReceiver<QueueEntry>;

/// Channel carrying queue entries from the drainers to the controller.
/// Unbounded so a producer never blocks behind a slow consumer.
pub fn channel() -> (LineSender, LineReceiver) {
    mpsc::unbounded_channel()
}
