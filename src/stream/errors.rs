use {
    crate::format::errors::FormatError,
    crate::transport::errors::TransportError,
    std::io,
};

#[derive(Debug, thiserror::Error)]
pub enum StreamErrorValue {
    #[error("stream already active")]
    AlreadyActive,
    #[error("unknown format '{0}'")]
    UnknownFormat(String),
    #[error("could not resolve format from first bytes")]
    FormatUnresolved,
    #[error("transport error")]
    Transport(TransportError),
    #[error("format error")]
    Format(FormatError),
    #[error("io error")]
    Io(io::Error),
    #[error("disconnected")]
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct StreamError {
    pub value: StreamErrorValue,
}

impl From<StreamErrorValue> for StreamError {
    fn from(value: StreamErrorValue) -> Self {
        Self { value }
    }
}

impl From<TransportError> for StreamError {
    fn from(error: TransportError) -> Self {
        Self {
            value: StreamErrorValue::Transport(error),
        }
    }
}

impl From<FormatError> for StreamError {
    fn from(error: FormatError) -> Self {
        Self {
            value: StreamErrorValue::Format(error),
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(error: io::Error) -> Self {
        Self {
            value: StreamErrorValue::Io(error),
        }
    }
}
