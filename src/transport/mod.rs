//! Socket plumbing shared by readers and writers: connection setup with an
//! injectable TLS seam, the minimal HTTP preamble used by the HTTP stream
//! variant (head line + headers, then a raw media body), and the send half
//! with its queued-bytes gauge.

pub mod errors;

use {
    self::errors::{TransportError, TransportErrorValue},
    async_trait::async_trait,
    bytes::BytesMut,
    std::io,
    std::net::SocketAddr,
    std::sync::atomic::{AtomicU64, Ordering},
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf},
    tokio::net::TcpStream,
    tokio::sync::Mutex,
};

/// Erased bidirectional byte stream; plain TCP and TLS-wrapped sockets both
/// end up here.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// Transport-security injection point. Handshake internals stay outside this
/// crate; a secure stream kind without a wrapper fails at `run`.
#[async_trait]
pub trait TlsWrap: Send + Sync {
    async fn wrap_client(&self, tcp: TcpStream, host: &str) -> io::Result<Box<dyn Conn>>;
    async fn wrap_server(&self, tcp: TcpStream) -> io::Result<Box<dyn Conn>>;
}

/// Connect with a deadline, optionally wrapping the socket in TLS.
pub async fn connect(
    addr: SocketAddr,
    tls_host: &str,
    tls: Option<&std::sync::Arc<dyn TlsWrap>>,
    timeout: Duration,
) -> Result<Box<dyn Conn>, TransportError> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr)).await??;
    tcp.set_nodelay(true).ok();
    match tls {
        Some(wrap) => Ok(wrap.wrap_client(tcp, tls_host).await?),
        None => Ok(Box::new(tcp)),
    }
}

/// Write side of one socket plus the gauge backing writer backpressure.
///
/// `credit` is called on the consumer task when a send is accepted; the
/// matching debit happens after the wire write (or on encode failure), so
/// `queued_bytes` tracks payload bytes accepted but not yet flushed.
pub struct SendHalf {
    writer: Mutex<Option<WriteHalf<Box<dyn Conn>>>>,
    queued: AtomicU64,
    peer: SocketAddr,
}

impl SendHalf {
    #[must_use]
    pub fn new(writer: WriteHalf<Box<dyn Conn>>, peer: SocketAddr) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            queued: AtomicU64::new(0),
            peer,
        }
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn credit(&self, bytes: u64) {
        self.queued.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn debit(&self, bytes: u64) {
        self.queued.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn queued_bytes(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Write `data` fully, then flush. Debits `credited` whether or not the
    /// write succeeds, so the gauge drains even on a dying socket.
    pub async fn send(&self, data: &[u8], credited: u64) -> Result<(), TransportError> {
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => async {
                    writer.write_all(data).await?;
                    writer.flush().await?;
                    Ok(())
                }
                .await
                .map_err(|e: io::Error| TransportError::from(e)),
                None => Err(TransportErrorValue::Closed.into()),
            }
        };
        if credited > 0 {
            self.debit(credited);
        }
        result
    }

    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
    }
}

/// Read an HTTP head (request or status line plus headers) up to the blank
/// line. Body bytes that arrived in the same chunks are left in `buf`.
pub async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_head: usize,
) -> Result<String, TransportError> {
    loop {
        if let Some(end) = find_blank_line(buf) {
            let head = buf.split_to(end + 4);
            return Ok(String::from_utf8_lossy(&head).into_owned());
        }
        if buf.len() > max_head {
            return Err(TransportErrorValue::HeadTooLarge { limit: max_head }.into());
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(TransportErrorValue::Closed.into());
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Extract the `Content-Type` header value from a raw head.
#[must_use]
pub fn content_type_of(head: &str) -> Option<&str> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-type")
            .then(|| value.trim())
    })
}

/// Minimal response head preceding a streamed media body.
#[must_use]
pub fn response_head(content_type: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {content_type}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\r\n"
    )
}

/// Minimal request head preceding a streamed media body (or requesting one).
#[must_use]
pub fn request_head(method: &str, path: &str, host: &str, content_type: Option<&str>) -> String {
    let content_type = content_type
        .map(|ct| format!("Content-Type: {ct}\r\n"))
        .unwrap_or_default();
    format!(
        "{method} {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         {content_type}\
         Connection: close\r\n\r\n"
    )
}
