//! Outbound stream frames and their server-sent-events encoding

use bytes::{BufMut, Bytes, BytesMut};

use crate::registry::LogMessage;

/// Sent when the prompt is empty or whitespace-only
pub const EMPTY_PROMPT: &str = "Empty prompt provided.";
/// Logged when a background task is launched
pub const PROCESSING: &str = "Processing your request...";
/// Terminal frame of a successful stream
pub const COMPLETED: &str = "Request processing completed.";

/// What produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A log line relayed from the bridge queue
    Log,
    /// The request was rejected before any work started
    Rejected,
    /// The stream finished successfully
    Completed,
    /// The stream finished with an error
    Error,
}

/// One outbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    text: LogMessage,
}

impl Frame {
    /// Relay a log line
    pub fn log(text: LogMessage) -> Self {
        Self {
            kind: FrameKind::Log,
            text,
        }
    }

    /// Rejection notice for an invalid request
    pub fn rejected(reason: impl AsRef<str>) -> Self {
        Self {
            kind: FrameKind::Rejected,
            text: LogMessage::from(reason.as_ref()),
        }
    }

    /// Terminal success frame
    pub fn completed() -> Self {
        Self {
            kind: FrameKind::Completed,
            text: LogMessage::from(COMPLETED),
        }
    }

    /// Terminal error frame
    pub fn error(error: impl std::fmt::Display) -> Self {
        Self {
            kind: FrameKind::Error,
            text: LogMessage::from(format!("An error occurred: {}", error)),
        }
    }

    /// Frame kind
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Frame text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this frame ends the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, FrameKind::Log)
    }

    /// Encode as `data: <text>\n\n`.
    ///
    /// Multi-line text becomes one `data:` line per line so clients
    /// reassemble it with the original line breaks. `\r\n`, `\n` and a lone
    /// `\r` all end a line.
    pub fn encode(&self) -> Bytes {
        let text = self.text.replace("\r\n", "\n").replace('\r', "\n");
        let mut buf = BytesMut::with_capacity(text.len() + 8);
        for line in text.split('\n') {
            buf.put_slice(b"data: ");
            buf.put_slice(line.as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_encoding() {
        let frame = Frame::log(LogMessage::from("Fetching AAPL"));
        assert_eq!(&frame.encode()[..], b"data: Fetching AAPL\n\n");
        assert!(!frame.is_terminal());
    }

    #[test]
    fn test_multi_line_encoding() {
        let frame = Frame::log(LogMessage::from("Price: 10\r\nVolume: 3"));
        assert_eq!(&frame.encode()[..], b"data: Price: 10\ndata: Volume: 3\n\n");
    }

    #[test]
    fn test_carriage_return_ends_a_line() {
        let frame = Frame::log(LogMessage::from("progress 50%\rprogress 100%"));
        assert_eq!(
            &frame.encode()[..],
            b"data: progress 50%\ndata: progress 100%\n\n"
        );
        let frame = Frame::log(LogMessage::from("a\rb\r\nc"));
        assert_eq!(&frame.encode()[..], b"data: a\ndata: b\ndata: c\n\n");
    }

    #[test]
    fn test_status_frames() {
        assert_eq!(
            &Frame::rejected(EMPTY_PROMPT).encode()[..],
            b"data: Empty prompt provided.\n\n"
        );
        assert_eq!(Frame::completed().text(), COMPLETED);
        assert_eq!(Frame::error("boom").text(), "An error occurred: boom");
        assert!(Frame::error("boom").is_terminal());
    }
}
