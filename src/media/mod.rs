//! Sample model and the two session-facing capabilities: [`SampleSink`]
//! (decoded samples flowing *into* session logic) and [`SampleOutlet`]
//! (samples the session wants sent *out*).

use {
    crate::stream::errors::StreamError,
    async_trait::async_trait,
    bytes::Bytes,
    std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Data,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Data => "data",
        }
    }
}

/// One decoded media sample.
///
/// Payloads are `Bytes`: cloning for fan-out bumps a refcount, it never
/// copies the media data.
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub kind: MediaKind,
    pub track: u8,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl MediaSample {
    #[must_use]
    pub fn new(kind: MediaKind, track: u8, timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind,
            track,
            timestamp,
            payload,
        }
    }

    #[must_use]
    pub fn audio(track: u8, timestamp: u32, payload: Bytes) -> Self {
        Self::new(MediaKind::Audio, track, timestamp, payload)
    }

    #[must_use]
    pub fn video(track: u8, timestamp: u32, payload: Bytes) -> Self {
        Self::new(MediaKind::Video, track, timestamp, payload)
    }

    #[must_use]
    pub fn data(track: u8, timestamp: u32, payload: Bytes) -> Self {
        Self::new(MediaKind::Data, track, timestamp, payload)
    }
}

/// Session-side consumer of decoded samples and lifecycle notifications.
///
/// Every method runs on the consumer task, inside a dispatch drain, in
/// per-stream receipt order. Implementations need no internal locking.
pub trait SampleSink: Send {
    fn begin(&mut self, name: &str);
    fn sample(&mut self, sample: MediaSample);
    fn end(&mut self);
    fn error(&mut self, error: StreamError);
}

/// How readers and queued jobs share a sink. The mutex is uncontended by
/// construction: only the consumer task ever locks it.
pub type SharedSink = Arc<parking_lot::Mutex<Box<dyn SampleSink>>>;

#[must_use]
pub fn shared_sink(sink: impl SampleSink + 'static) -> SharedSink {
    Arc::new(parking_lot::Mutex::new(Box::new(sink)))
}

/// Why an outlet call was rejected. Ordinary status values: an ejected or
/// not-yet-begun target is an expected runtime condition, not a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OutletReject {
    /// Write attempted outside the `begin_media` .. `end_media` bracket.
    #[error("media not begun")]
    NotBegun,
    /// The stream is stopped or still starting.
    #[error("stream not started")]
    NotStarted,
    /// Lazy connect on the first accepted call failed; nothing was queued.
    #[error("connect failed")]
    ConnectFailed,
}

/// The writer surface handed to session logic. Callable only from the
/// consumer task; accepted calls are flushed to the transport in acceptance
/// order.
#[async_trait]
pub trait SampleOutlet: Send {
    async fn begin_media(&mut self, name: &str) -> Result<(), OutletReject>;
    async fn write_audio(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject>;
    async fn write_video(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject>;
    async fn write_data(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject>;
    async fn end_media(&mut self) -> Result<(), OutletReject>;

    /// Bytes accepted but not yet flushed to the transport; the caller's
    /// backpressure observable. The outlet itself never sheds samples.
    fn queued_bytes(&self) -> u64;
}
