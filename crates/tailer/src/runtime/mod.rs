//! Runtime module — process lifecycle: boot, event watching, sink, shutdown.

pub mod boot;
pub mod events;
pub mod sink;
pub mod stop;
