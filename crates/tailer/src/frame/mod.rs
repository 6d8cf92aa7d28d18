//! Frame module — raw daemon log bytes to timestamped lines.

pub mod demux;
pub mod timestamp;

pub use demux::{encode_frame, DemuxEvent, Demuxer, FrameError, FrameMode, RawLine, StreamTag};
pub use timestamp::{split_timestamp, ParsedLine, TimestampError};
