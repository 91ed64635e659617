use crate::bytesio::errors::BytesReadError;

#[derive(Debug, thiserror::Error)]
pub enum FormatErrorValue {
    #[error("bad signature")]
    BadSignature,
    #[error("unknown tag type {0}")]
    UnknownTagType(u8),
    #[error("tag size {size} exceeds limit {limit}")]
    TagTooLarge { size: usize, limit: usize },
    #[error("unknown format '{0}'")]
    UnknownFormat(String),
    #[error("bytes read error")]
    BytesRead(BytesReadError),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct FormatError {
    pub value: FormatErrorValue,
}

impl From<FormatErrorValue> for FormatError {
    fn from(value: FormatErrorValue) -> Self {
        Self { value }
    }
}

impl From<BytesReadError> for FormatError {
    fn from(error: BytesReadError) -> Self {
        Self {
            value: FormatErrorValue::BytesRead(error),
        }
    }
}
