//! Media stream lifecycle.
//!
//! A stream is a lifecycle wrapper around a socket-bound media endpoint.
//! State moves `Idle -> Starting -> Started -> Stopping -> Idle`; media
//! operations are only valid while `Started`, `stop` is idempotent from any
//! state, and dropping a stream forces a stop so no live socket registration
//! outlives its owner.

pub mod errors;
pub mod reader;
pub mod server;
pub mod writer;

use {
    self::errors::StreamError,
    async_trait::async_trait,
    std::fmt,
    std::sync::Arc,
};

/// Protocol flavor of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Tls,
    Http,
}

impl StreamKind {
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Http => "http",
        }
    }

    #[must_use]
    pub const fn is_secure(self) -> bool {
        matches!(self, Self::Tls)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Out-of-band failure channel for writers: invoked on the consumer task,
/// never from a worker.
pub type ErrorHook = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Capability set shared by every stream variant.
#[async_trait]
pub trait MediaStream: Send {
    fn kind(&self) -> StreamKind;
    fn state(&self) -> StreamState;

    /// `"stream source tcp://127.0.0.1:1935/live/cam|FLV"` style diagnostic
    /// line; the format reads `AUTO` until resolved.
    fn describe(&self) -> String;

    /// Valid only from `Idle`. On failure the state is back to `Idle` and
    /// the error is returned.
    async fn run(&mut self) -> Result<(), StreamError>;

    /// Idempotent; safe to call from the consumer task at any time. Cancels
    /// the stream's liveness token synchronously, so no new work touching
    /// the stream is enqueued; work already queued degrades to a no-op.
    fn stop(&mut self);
}

pub(crate) fn describe_stream(
    role: &str,
    kind: StreamKind,
    addr: impl fmt::Display,
    path: &str,
    format: Option<&str>,
) -> String {
    format!(
        "stream {role} {}://{addr}/{path}|{}",
        kind.scheme(),
        format.unwrap_or("auto").to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_shows_auto_until_resolved() {
        let line = describe_stream("source", StreamKind::Tcp, "127.0.0.1:1935", "live/cam", None);
        assert_eq!(line, "stream source tcp://127.0.0.1:1935/live/cam|AUTO");
        let line = describe_stream(
            "target",
            StreamKind::Http,
            "127.0.0.1:8080",
            "live/cam",
            Some("flv"),
        );
        assert_eq!(line, "stream target http://127.0.0.1:8080/live/cam|FLV");
    }
}
