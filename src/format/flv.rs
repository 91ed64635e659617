//! FLV tag framing.
//!
//! Only the tag layer is interpreted here; codec payloads pass through as
//! opaque bytes. Tag stream ids are repurposed to carry the sample track
//! (real FLV writes zero there, which maps back to track 0).
//!
//! ```text
//! header:  "FLV" | version(1) | flags(1) | data offset(4)
//! body:    PreviousTagSize0 | Tag1 | PreviousTagSize1 | Tag2 | ...
//! tag:     type(1) | data size(3) | timestamp(3) | ts-extended(1) | stream id(3) | data
//! ```

use {
    super::errors::{FormatError, FormatErrorValue},
    super::{MediaDemuxer, MediaMuxer},
    crate::bytesio::BytesReader,
    crate::media::{MediaKind, MediaSample},
    byteorder::{BigEndian, ByteOrder},
    bytes::{BufMut, Bytes, BytesMut},
};

pub const FORMAT_NAME: &str = "flv";
pub const CONTENT_TYPE: &str = "video/x-flv";

const SIGNATURE: &[u8; 3] = b"FLV";
const HEADER_LEN: usize = 9;
const TAG_HEADER_LEN: usize = 11;
const PREV_TAG_SIZE_LEN: usize = 4;

/// Upper bound on one tag body, against malicious or corrupt size fields.
const MAX_TAG_SIZE: usize = 10 * 1024 * 1024;

mod tag_type {
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const SCRIPT: u8 = 18;
}

/// First-bytes probe used for AUTO format resolution.
#[must_use]
pub fn probe(data: &[u8]) -> bool {
    data.len() >= SIGNATURE.len() && &data[..SIGNATURE.len()] == SIGNATURE
}

#[derive(Debug, Clone, Copy)]
enum DemuxState {
    Signature,
    TagHeader,
    TagBody {
        kind: MediaKind,
        track: u8,
        timestamp: u32,
        size: usize,
    },
}

pub struct FlvDemuxer {
    reader: BytesReader,
    state: DemuxState,
    // bytes still to skip when the header claims a data offset beyond 9
    skip: usize,
}

impl Default for FlvDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvDemuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reader: BytesReader::default(),
            state: DemuxState::Signature,
            skip: 0,
        }
    }
}

impl MediaDemuxer for FlvDemuxer {
    fn format(&self) -> &'static str {
        FORMAT_NAME
    }

    fn demux(&mut self, data: &[u8]) -> Result<Vec<MediaSample>, FormatError> {
        if data.is_empty() {
            // end of stream: an incomplete trailing tag is not a sample
            if !self.reader.is_empty() {
                tracing::debug!(
                    leftover = self.reader.len(),
                    "discarding incomplete flv tag at end of stream"
                );
                self.reader.clear();
            }
            return Ok(Vec::new());
        }

        self.reader.extend_from_slice(data);
        let mut samples = Vec::new();
        loop {
            match self.state {
                DemuxState::Signature => {
                    if self.reader.len() < HEADER_LEN {
                        break;
                    }
                    let head = self.reader.read_bytes(HEADER_LEN)?;
                    if &head[..SIGNATURE.len()] != SIGNATURE {
                        return Err(FormatErrorValue::BadSignature.into());
                    }
                    let data_offset = BigEndian::read_u32(&head[5..9]) as usize;
                    self.skip = data_offset.saturating_sub(HEADER_LEN);
                    self.state = DemuxState::TagHeader;
                }
                DemuxState::TagHeader => {
                    if self.skip > 0 {
                        let n = self.skip.min(self.reader.len());
                        self.reader.read_bytes(n)?;
                        self.skip -= n;
                        if self.skip > 0 {
                            break;
                        }
                    }
                    if self.reader.len() < PREV_TAG_SIZE_LEN + TAG_HEADER_LEN {
                        break;
                    }
                    self.reader.read_u32()?; // previous tag size, unchecked
                    let kind = match self.reader.read_u8()? {
                        tag_type::AUDIO => MediaKind::Audio,
                        tag_type::VIDEO => MediaKind::Video,
                        tag_type::SCRIPT => MediaKind::Data,
                        other => return Err(FormatErrorValue::UnknownTagType(other).into()),
                    };
                    let size = self.reader.read_u24()? as usize;
                    if size > MAX_TAG_SIZE {
                        return Err(FormatErrorValue::TagTooLarge {
                            size,
                            limit: MAX_TAG_SIZE,
                        }
                        .into());
                    }
                    let mut timestamp = self.reader.read_u24()?;
                    timestamp |= u32::from(self.reader.read_u8()?) << 24;
                    let track = (self.reader.read_u24()? & 0xFF) as u8;
                    self.state = DemuxState::TagBody {
                        kind,
                        track,
                        timestamp,
                        size,
                    };
                }
                DemuxState::TagBody {
                    kind,
                    track,
                    timestamp,
                    size,
                } => {
                    if self.reader.len() < size {
                        break;
                    }
                    let payload = self.reader.read_bytes(size)?.freeze();
                    samples.push(MediaSample::new(kind, track, timestamp, payload));
                    self.state = DemuxState::TagHeader;
                }
            }
        }
        Ok(samples)
    }
}

#[derive(Default)]
pub struct FlvMuxer {
    last_tag_size: u32,
}

impl FlvMuxer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaMuxer for FlvMuxer {
    fn format(&self) -> &'static str {
        FORMAT_NAME
    }

    fn mux_header(&mut self, name: &str) -> Result<Bytes, FormatError> {
        tracing::debug!(stream = name, "writing flv header");
        self.last_tag_size = 0;
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(SIGNATURE);
        buf.put_u8(1); // version
        buf.put_u8(0x05); // audio + video present
        buf.put_u32(HEADER_LEN as u32);
        Ok(buf.freeze())
    }

    fn mux_sample(&mut self, sample: &MediaSample) -> Result<Bytes, FormatError> {
        let size = sample.payload.len();
        if size > MAX_TAG_SIZE {
            return Err(FormatErrorValue::TagTooLarge {
                size,
                limit: MAX_TAG_SIZE,
            }
            .into());
        }
        let tag = match sample.kind {
            MediaKind::Audio => tag_type::AUDIO,
            MediaKind::Video => tag_type::VIDEO,
            MediaKind::Data => tag_type::SCRIPT,
        };
        let mut buf =
            BytesMut::with_capacity(PREV_TAG_SIZE_LEN + TAG_HEADER_LEN + size);
        buf.put_u32(self.last_tag_size);
        buf.put_u8(tag);
        buf.put_uint(size as u64, 3);
        buf.put_uint(u64::from(sample.timestamp & 0x00FF_FFFF), 3);
        buf.put_u8((sample.timestamp >> 24) as u8);
        buf.put_uint(u64::from(sample.track), 3);
        buf.put_slice(&sample.payload);
        self.last_tag_size = (TAG_HEADER_LEN + size) as u32;
        Ok(buf.freeze())
    }

    fn mux_trailer(&mut self) -> Result<Bytes, FormatError> {
        let mut buf = BytesMut::with_capacity(PREV_TAG_SIZE_LEN);
        buf.put_u32(self.last_tag_size);
        self.last_tag_size = 0;
        Ok(buf.freeze())
    }
}
