//! Health and metrics probe for CernVM-FS mounts.
//!
//! Repositories mounted under `/cvmfs` are probed on a schedule: a
//! timeout-bounded directory listing measures mount liveness and latency,
//! the FUSE driver process is inspected for memory usage, and named
//! counters exposed through extended attributes are sampled. Every
//! measurement is dispatched to a metric sink (OTLP when an endpoint is
//! configured).

pub mod config;
pub mod probe;
pub mod scheduler;
pub mod settings;
pub mod telemetry;
