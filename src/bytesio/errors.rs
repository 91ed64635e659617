#[derive(Debug, thiserror::Error)]
pub enum BytesReadErrorValue {
    #[error("not enough bytes: need {needed}, have {have}")]
    NotEnoughBytes { needed: usize, have: usize },
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct BytesReadError {
    pub value: BytesReadErrorValue,
}

impl From<BytesReadErrorValue> for BytesReadError {
    fn from(value: BytesReadErrorValue) -> Self {
        Self { value }
    }
}
