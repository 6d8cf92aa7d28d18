//! Demux — splits the daemon's log byte stream into lines.
//!
//! Non-TTY containers use multiplexed framing: every frame starts with an
//! 8-byte header `[stream, 0, 0, 0, len (u32 big-endian)]` followed by
//! exactly `len` payload bytes. TTY containers send one raw,
//! newline-delimited stream with no headers.
//!
//! The [`Demuxer`] is fed byte chunks in arrival order and buffers across
//! chunk boundaries, so a frame split anywhere (inside the header or the
//! payload) yields the same lines as if it had arrived in one piece.

use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

/// Size of a multiplexed frame header.
pub const HEADER_LEN: usize = 8;

/// Largest payload accepted in a single frame. Anything above this is
/// treated as a corrupt header rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Held partial lines are flushed once they reach this size.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

impl StreamTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamTag::Stdout => "stdout",
            StreamTag::Stderr => "stderr",
        }
    }

    /// Stream byte from a frame header. stdin (0) is folded into stdout.
    fn from_header_byte(b: u8) -> Self {
        match b {
            2 => StreamTag::Stderr,
            _ => StreamTag::Stdout,
        }
    }

    fn header_byte(&self) -> u8 {
        match self {
            StreamTag::Stdout => 1,
            StreamTag::Stderr => 2,
        }
    }
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing used by a container's log stream, decided by its TTY flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Multiplexed,
    Tty,
}

impl FrameMode {
    pub fn from_tty(tty: bool) -> Self {
        if tty {
            FrameMode::Tty
        } else {
            FrameMode::Multiplexed
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid frame header: {0:02x?}")]
    InvalidHeader([u8; 4]),
    #[error("Frame length {0} exceeds limit of {limit} bytes", limit = MAX_FRAME_LEN)]
    OversizedFrame(usize),
    #[error("Stream ended inside a frame ({missing} bytes missing)")]
    TruncatedFrame { missing: usize },
}

/// One newline-delimited line, still carrying the daemon's timestamp prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub stream: StreamTag,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    Line(RawLine),
    /// A frame was discarded; parsing resumed at the next plausible header.
    Malformed(FrameError),
}

pub struct Demuxer {
    mode: FrameMode,
    buf: BytesMut,
    stdout_partial: BytesMut,
    stderr_partial: BytesMut,
    events: VecDeque<DemuxEvent>,
}

impl Demuxer {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            mode,
            buf: BytesMut::new(),
            stdout_partial: BytesMut::new(),
            stderr_partial: BytesMut::new(),
            events: VecDeque::new(),
        }
    }

    /// Feed the next chunk read from the connection.
    pub fn push(&mut self, chunk: Bytes) {
        match self.mode {
            FrameMode::Tty => self.split_lines(StreamTag::Stdout, chunk),
            FrameMode::Multiplexed => {
                self.buf.extend_from_slice(&chunk);
                self.drain_frames();
            }
        }
    }

    /// Next parsed event, in stream order.
    pub fn pop(&mut self) -> Option<DemuxEvent> {
        self.events.pop_front()
    }

    /// The stream ended: report any half-received frame and release held
    /// partial lines, which are complete now that no more bytes will come.
    pub fn finish(&mut self) {
        if !self.buf.is_empty() {
            let missing = if self.buf.len() >= HEADER_LEN {
                HEADER_LEN + payload_len(&self.buf) - self.buf.len()
            } else {
                HEADER_LEN - self.buf.len()
            };
            self.buf.clear();
            self.events
                .push_back(DemuxEvent::Malformed(FrameError::TruncatedFrame { missing }));
        }
        for stream in [StreamTag::Stdout, StreamTag::Stderr] {
            let partial = self.partial_mut(stream);
            if !partial.is_empty() {
                let bytes = partial.split().freeze();
                self.emit(stream, bytes);
            }
        }
    }

    fn drain_frames(&mut self) {
        while self.buf.len() >= HEADER_LEN {
            if !is_valid_header(&self.buf[..HEADER_LEN]) {
                let mut prefix = [0u8; 4];
                prefix.copy_from_slice(&self.buf[..4]);
                self.events
                    .push_back(DemuxEvent::Malformed(FrameError::InvalidHeader(prefix)));
                self.resync();
                continue;
            }

            let len = payload_len(&self.buf);
            if len > MAX_FRAME_LEN {
                self.events
                    .push_back(DemuxEvent::Malformed(FrameError::OversizedFrame(len)));
                self.resync();
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                return;
            }

            let stream = StreamTag::from_header_byte(self.buf[0]);
            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(len).freeze();
            self.split_lines(stream, payload);
        }
    }

    /// Drop the offending header byte and skip ahead to the next offset
    /// that could start a header. A plausible prefix at the very end of the
    /// buffer is kept until more bytes arrive.
    fn resync(&mut self) {
        let skip = (1..self.buf.len())
            .find(|&i| is_plausible_header_prefix(&self.buf[i..]))
            .unwrap_or(self.buf.len());
        self.buf.advance(skip);
    }

    fn split_lines(&mut self, stream: StreamTag, mut payload: Bytes) {
        while let Some(pos) = payload.iter().position(|&b| b == b'\n') {
            let mut line = payload.split_to(pos + 1);
            line.truncate(pos);

            let partial = self.partial_mut(stream);
            let bytes = if partial.is_empty() {
                line
            } else {
                partial.extend_from_slice(&line);
                partial.split().freeze()
            };
            self.emit(stream, bytes);
        }

        if payload.is_empty() {
            return;
        }
        let partial = self.partial_mut(stream);
        partial.extend_from_slice(&payload);
        if partial.len() >= MAX_LINE_LEN {
            let bytes = partial.split().freeze();
            self.emit(stream, bytes);
        }
    }

    fn emit(&mut self, stream: StreamTag, mut bytes: Bytes) {
        if bytes.last() == Some(&b'\r') {
            bytes.truncate(bytes.len() - 1);
        }
        self.events.push_back(DemuxEvent::Line(RawLine { stream, bytes }));
    }

    fn partial_mut(&mut self, stream: StreamTag) -> &mut BytesMut {
        match stream {
            StreamTag::Stdout => &mut self.stdout_partial,
            StreamTag::Stderr => &mut self.stderr_partial,
        }
    }
}

fn payload_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize
}

fn is_valid_header(header: &[u8]) -> bool {
    header[0] <= 2 && header[1..4] == [0, 0, 0]
}

fn is_plausible_header_prefix(bytes: &[u8]) -> bool {
    match bytes.split_first() {
        Some((&stream, rest)) => stream <= 2 && rest.iter().take(3).all(|&b| b == 0),
        None => false,
    }
}

/// Encode one payload as a multiplexed frame, the way the daemon writes it.
pub fn encode_frame(stream: StreamTag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(stream.header_byte());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
