//! Emit module — label sets, relabeling and the hand-off to the
//! downstream entry handler.

pub mod emitter;
pub mod entry;
pub mod relabel;

pub use emitter::{Emitter, Forwarded, CONTAINER_ID_LABEL, CONTAINER_NAME_LABEL, STREAM_LABEL};
pub use entry::{LabelSet, LogEntry};
pub use relabel::{NoRelabel, RelabelAction, RelabelError, RelabelPipeline, RelabelRuleConfig, RuleSet};
