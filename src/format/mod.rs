//! Pluggable wire formats.
//!
//! A [`MediaDemuxer`] is a per-socket state machine: it is fed whatever
//! partial buffers the socket produces, keeps residual state internally,
//! and yields zero or more complete samples per call. A [`MediaMuxer`] is
//! its outgoing counterpart. The [`FormatRegistry`] resolves formats by
//! name, by first-bytes probe, or by HTTP content type.

pub mod errors;
pub mod flv;

use {
    self::errors::FormatError,
    crate::media::MediaSample,
    bytes::Bytes,
    indexmap::IndexMap,
};

/// Incoming byte-stream to sample conversion. One instance per socket,
/// never shared across streams, never reused across reconnects.
pub trait MediaDemuxer: Send {
    fn format(&self) -> &'static str;

    /// Consume a chunk of wire bytes and return the samples completed by it.
    ///
    /// A **zero-length** input signals end-of-stream: the demuxer flushes or
    /// discards any buffered partial sample (demuxer-defined) and returns
    /// whatever it flushed.
    fn demux(&mut self, data: &[u8]) -> Result<Vec<MediaSample>, FormatError>;
}

/// Outgoing sample to byte-stream conversion.
pub trait MediaMuxer: Send {
    fn format(&self) -> &'static str;

    fn mux_header(&mut self, name: &str) -> Result<Bytes, FormatError>;
    fn mux_sample(&mut self, sample: &MediaSample) -> Result<Bytes, FormatError>;
    fn mux_trailer(&mut self) -> Result<Bytes, FormatError>;
}

type DemuxerFactory = Box<dyn Fn() -> Box<dyn MediaDemuxer> + Send + Sync>;
type MuxerFactory = Box<dyn Fn() -> Box<dyn MediaMuxer> + Send + Sync>;
type ProbeFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct FormatEntry {
    content_type: &'static str,
    probe: ProbeFn,
    demuxer: DemuxerFactory,
    muxer: MuxerFactory,
}

/// Format registry. Probe order is registration order.
pub struct FormatRegistry {
    entries: IndexMap<String, FormatEntry>,
}

impl FormatRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        content_type: &'static str,
        probe: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
        demuxer: impl Fn() -> Box<dyn MediaDemuxer> + Send + Sync + 'static,
        muxer: impl Fn() -> Box<dyn MediaMuxer> + Send + Sync + 'static,
    ) {
        self.entries.insert(
            name.to_owned(),
            FormatEntry {
                content_type,
                probe: Box::new(probe),
                demuxer: Box::new(demuxer),
                muxer: Box::new(muxer),
            },
        );
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn demuxer(&self, name: &str) -> Option<Box<dyn MediaDemuxer>> {
        self.entries.get(name).map(|e| (e.demuxer)())
    }

    #[must_use]
    pub fn muxer(&self, name: &str) -> Option<Box<dyn MediaMuxer>> {
        self.entries.get(name).map(|e| (e.muxer)())
    }

    #[must_use]
    pub fn content_type(&self, name: &str) -> Option<&'static str> {
        self.entries.get(name).map(|e| e.content_type)
    }

    /// Resolve a format from the first bytes of a stream, trying probes in
    /// registration order.
    #[must_use]
    pub fn probe(&self, data: &[u8]) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, e)| (e.probe)(data))
            .map(|(name, _)| name.as_str())
    }

    /// Resolve a format from an HTTP `Content-Type` value.
    #[must_use]
    pub fn by_content_type(&self, mime: &str) -> Option<&str> {
        let mime = mime.split(';').next().unwrap_or(mime).trim();
        self.entries
            .iter()
            .find(|(_, e)| e.content_type.eq_ignore_ascii_case(mime))
            .map(|(name, _)| name.as_str())
    }
}

impl Default for FormatRegistry {
    /// Registry with the built-in FLV tag framing registered.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            flv::FORMAT_NAME,
            flv::CONTENT_TYPE,
            flv::probe,
            || Box::new(flv::FlvDemuxer::new()),
            || Box::new(flv::FlvMuxer::new()),
        );
        registry
    }
}
