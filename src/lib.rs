//! Socket media streaming core.
//!
//! All session-visible state lives on one logical consumer task: worker
//! tasks decode incoming socket bytes and enqueue the results on a
//! [`dispatch::DispatchQueue`], while outgoing samples are muxed and sent on
//! ordered [`lanes`] so one writer's bytes hit the wire in acceptance order.
//!
//! The building blocks, bottom up:
//!
//! - [`dispatch`]: multi-producer/single-consumer work queue plus wake signal
//! - [`lanes`]: per-target ordered execution lanes over the tokio runtime
//! - [`bytesio`]: byte cursor used by wire-format state machines
//! - [`transport`]: socket acquisition, TLS injection seam, HTTP preamble
//! - [`format`]: pluggable demuxers/muxers and the format registry
//! - [`media`]: sample model and the session-facing traits
//! - [`stream`]: socket readers/writers and their listening variants

pub mod bytesio;
pub mod config;
pub mod dispatch;
pub mod format;
pub mod lanes;
pub mod logging;
pub mod media;
pub mod statistics;
pub mod stream;
pub mod transport;

pub use config::CoreConfig;
pub use dispatch::{Consumer, DispatchQueue, Job, Signal};
pub use lanes::{LaneId, LanePool};
pub use media::{MediaKind, MediaSample, OutletReject, SampleOutlet, SampleSink};
pub use stream::{MediaStream, StreamKind, StreamState};
