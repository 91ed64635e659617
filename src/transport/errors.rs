use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransportErrorValue {
    #[error("io error")]
    Io(io::Error),
    #[error("timed out")]
    Timeout(tokio::time::error::Elapsed),
    #[error("no tls wrapper configured")]
    TlsUnavailable,
    #[error("http head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct TransportError {
    pub value: TransportErrorValue,
}

impl From<TransportErrorValue> for TransportError {
    fn from(value: TransportErrorValue) -> Self {
        Self { value }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        Self {
            value: TransportErrorValue::Io(error),
        }
    }
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self {
            value: TransportErrorValue::Timeout(error),
        }
    }
}
