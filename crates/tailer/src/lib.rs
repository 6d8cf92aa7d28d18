// Module layout for the container log tailer.

// Wire format and daemon access
pub mod frame;
pub mod source;

// Tailing core
pub mod emit;
pub mod metrics;
pub mod positions;
pub mod target;
pub mod manager;

// Process
pub mod conf;
pub mod runtime;
