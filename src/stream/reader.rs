//! Socket reader: turns one socket's incoming byte stream into samples
//! delivered to a [`SampleSink`] on the consumer task.
//!
//! Demuxing is CPU work done where the bytes arrive (the read task); every
//! observable effect (`begin`, each sample, `end`, errors) is pushed as a
//! dispatch job and applied later on the consumer task, in receipt order.

use {
    super::{
        describe_stream,
        errors::{StreamError, StreamErrorValue},
        MediaStream, StreamKind, StreamState,
    },
    crate::config::TransportConfig,
    crate::dispatch::{DispatchQueue, Job},
    crate::format::{FormatRegistry, MediaDemuxer},
    crate::media::{MediaSample, SampleSink, SharedSink},
    crate::statistics::StreamStatistics,
    crate::transport::{self, errors::TransportErrorValue, Conn, TlsWrap},
    async_trait::async_trait,
    bytes::BytesMut,
    std::net::SocketAddr,
    std::sync::{Arc, OnceLock},
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

/// Bytes to accumulate before giving up on a first-bytes probe.
const PROBE_WINDOW: usize = 16;

pub struct SocketReader {
    id: Uuid,
    kind: StreamKind,
    path: String,
    addr: SocketAddr,
    state: StreamState,
    sink: SharedSink,
    dispatch: Arc<DispatchQueue>,
    registry: Arc<FormatRegistry>,
    transport_config: TransportConfig,
    explicit_format: Option<String>,
    resolved_format: Arc<OnceLock<String>>,
    tls: Option<Arc<dyn TlsWrap>>,
    stats: Arc<StreamStatistics>,
    cancel: CancellationToken,
    adopted: Option<Box<dyn Conn>>,
}

impl SocketReader {
    /// Reader that connects to `addr` when run.
    #[must_use]
    pub fn new(
        kind: StreamKind,
        path: impl Into<String>,
        addr: SocketAddr,
        sink: SharedSink,
        dispatch: Arc<DispatchQueue>,
        registry: Arc<FormatRegistry>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            path: path.into(),
            addr,
            state: StreamState::Idle,
            sink,
            dispatch,
            registry,
            transport_config: TransportConfig::default(),
            explicit_format: None,
            resolved_format: Arc::new(OnceLock::new()),
            tls: None,
            stats: Arc::new(StreamStatistics::new()),
            cancel: CancellationToken::new(),
            adopted: None,
        }
    }

    /// Reader around an already-accepted socket (server handoff). Converges
    /// on the same decode/dispatch contract once run.
    #[must_use]
    pub fn adopt(
        kind: StreamKind,
        path: impl Into<String>,
        conn: Box<dyn Conn>,
        peer: SocketAddr,
        sink: SharedSink,
        dispatch: Arc<DispatchQueue>,
        registry: Arc<FormatRegistry>,
    ) -> Self {
        let mut reader = Self::new(kind, path, peer, sink, dispatch, registry);
        reader.adopted = Some(conn);
        reader
    }

    /// Pin the wire format instead of resolving it from first bytes.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.explicit_format = Some(format.into());
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Arc<dyn TlsWrap>) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Count traffic into a shared statistics block (listening endpoints
    /// aggregate their accepted publishers this way).
    #[must_use]
    pub fn with_statistics(mut self, stats: Arc<StreamStatistics>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<StreamStatistics> {
        self.stats.clone()
    }

    fn format_name(&self) -> Option<&str> {
        self.resolved_format
            .get()
            .map(String::as_str)
            .or(self.explicit_format.as_deref())
    }
}

#[async_trait]
impl MediaStream for SocketReader {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn describe(&self) -> String {
        describe_stream("source", self.kind, self.addr, &self.path, self.format_name())
    }

    async fn run(&mut self) -> Result<(), StreamError> {
        if self.state != StreamState::Idle {
            return Err(StreamErrorValue::AlreadyActive.into());
        }
        self.state = StreamState::Starting;

        if let Some(format) = &self.explicit_format {
            if !self.registry.contains(format) {
                self.state = StreamState::Idle;
                return Err(StreamErrorValue::UnknownFormat(format.clone()).into());
            }
        }

        let server_side = self.adopted.is_some();
        let conn = match self.adopted.take() {
            Some(conn) => conn,
            None => {
                let tls = if self.kind.is_secure() {
                    match self.tls.as_ref() {
                        Some(tls) => Some(tls),
                        None => {
                            self.state = StreamState::Idle;
                            return Err(StreamError::from(transport::errors::TransportError::from(
                                TransportErrorValue::TlsUnavailable,
                            )));
                        }
                    }
                } else {
                    None
                };
                match transport::connect(
                    self.addr,
                    &self.addr.ip().to_string(),
                    tls,
                    self.transport_config.connect_timeout(),
                )
                .await
                {
                    Ok(conn) => conn,
                    Err(err) => {
                        self.state = StreamState::Idle;
                        return Err(err.into());
                    }
                }
            }
        };

        let http = if self.kind == StreamKind::Http {
            if server_side {
                let content_type = self
                    .explicit_format
                    .as_deref()
                    .and_then(|f| self.registry.content_type(f))
                    .unwrap_or("application/octet-stream");
                HttpRole::Server { content_type }
            } else {
                HttpRole::Client {
                    path: format!("/{}", self.path),
                    host: self.addr.to_string(),
                }
            }
        } else {
            HttpRole::None
        };

        self.cancel = CancellationToken::new();
        let pipeline = DecodePipeline {
            label: format!("{}://{}/{}", self.kind.scheme(), self.addr, self.path),
            name: self.path.clone(),
            http,
            sink: self.sink.clone(),
            dispatch: self.dispatch.clone(),
            registry: self.registry.clone(),
            explicit: self.explicit_format.clone(),
            resolved: self.resolved_format.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
            chunk_size: self.transport_config.read_chunk_size,
            max_head: self.transport_config.max_head_bytes,
        };
        tokio::spawn(pipeline.drive(conn));

        self.state = StreamState::Started;
        log::info!("{} running", self.describe());
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == StreamState::Idle {
            return;
        }
        self.state = StreamState::Stopping;
        self.cancel.cancel();
        log::info!("{} stopped", self.describe());
        self.state = StreamState::Idle;
    }
}

impl Drop for SocketReader {
    fn drop(&mut self) {
        self.stop();
    }
}

enum HttpRole {
    None,
    Client { path: String, host: String },
    Server { content_type: &'static str },
}

enum Resolve {
    Ready(Box<dyn MediaDemuxer>),
    NeedMoreBytes,
    Failed(StreamError),
}

/// Everything the read task needs; runs on an I/O worker until disconnect,
/// decode failure, or `stop`.
struct DecodePipeline {
    label: String,
    name: String,
    http: HttpRole,
    sink: SharedSink,
    dispatch: Arc<DispatchQueue>,
    registry: Arc<FormatRegistry>,
    explicit: Option<String>,
    resolved: Arc<OnceLock<String>>,
    stats: Arc<StreamStatistics>,
    cancel: CancellationToken,
    chunk_size: usize,
    max_head: usize,
}

impl DecodePipeline {
    async fn drive(self, conn: Box<dyn Conn>) {
        let (mut rd, mut wr) = tokio::io::split(conn);
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let mut format_hint = None;

        match &self.http {
            HttpRole::Client { path, host } => {
                let request = transport::request_head("GET", path, host, None);
                if let Err(err) = wr.write_all(request.as_bytes()).await {
                    self.fail(err.into());
                    return;
                }
                match transport::read_head(&mut rd, &mut buf, self.max_head).await {
                    Ok(head) => {
                        format_hint = transport::content_type_of(&head)
                            .and_then(|ct| self.registry.by_content_type(ct))
                            .map(str::to_owned);
                    }
                    Err(err) => {
                        self.fail(err.into());
                        return;
                    }
                }
            }
            HttpRole::Server { content_type } => {
                match transport::read_head(&mut rd, &mut buf, self.max_head).await {
                    Ok(head) => {
                        tracing::debug!(stream = %self.label, head = %head.lines().next().unwrap_or(""), "inbound http publisher");
                    }
                    Err(err) => {
                        self.fail(err.into());
                        return;
                    }
                }
                let response = transport::response_head(content_type);
                if let Err(err) = wr.write_all(response.as_bytes()).await {
                    self.fail(err.into());
                    return;
                }
            }
            HttpRole::None => {}
        }
        drop(wr);

        let explicit = self.explicit.clone().or(format_hint);
        let mut demuxer: Option<Box<dyn MediaDemuxer>> = None;
        let mut begun = false;

        loop {
            if demuxer.is_none() && !buf.is_empty() {
                match self.resolve(explicit.as_deref(), &buf) {
                    Resolve::Ready(d) => demuxer = Some(d),
                    Resolve::NeedMoreBytes => {}
                    Resolve::Failed(err) => {
                        self.fail(err);
                        return;
                    }
                }
            }

            if let Some(demuxer) = demuxer.as_mut() {
                if !buf.is_empty() {
                    let chunk = buf.split();
                    match demuxer.demux(&chunk) {
                        Ok(samples) => {
                            for sample in samples {
                                if !begun {
                                    self.queue_begin();
                                    begun = true;
                                }
                                self.queue_sample(sample);
                            }
                        }
                        Err(err) => {
                            self.fail(err.into());
                            if begun {
                                self.queue_end();
                            }
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return,
                read = rd.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        if let Some(demuxer) = demuxer.as_mut() {
                            match demuxer.demux(&[]) {
                                Ok(samples) => {
                                    for sample in samples {
                                        if !begun {
                                            self.queue_begin();
                                            begun = true;
                                        }
                                        self.queue_sample(sample);
                                    }
                                }
                                Err(err) => self.fail(err.into()),
                            }
                        }
                        self.queue_end();
                        return;
                    }
                    Ok(n) => self.stats.add_recv_bytes(n as u64),
                    Err(err) => {
                        self.fail(err.into());
                        if begun {
                            self.queue_end();
                        }
                        return;
                    }
                }
            }
        }
    }

    fn resolve(&self, explicit: Option<&str>, first: &[u8]) -> Resolve {
        let name = match explicit {
            Some(name) => name.to_owned(),
            None => match self.registry.probe(first) {
                Some(name) => name.to_owned(),
                None if first.len() < PROBE_WINDOW => return Resolve::NeedMoreBytes,
                None => return Resolve::Failed(StreamErrorValue::FormatUnresolved.into()),
            },
        };
        match self.registry.demuxer(&name) {
            Some(demuxer) => {
                // AUTO placeholder replaced exactly once; immutable afterwards
                let _ = self.resolved.set(name);
                Resolve::Ready(demuxer)
            }
            None => Resolve::Failed(StreamErrorValue::UnknownFormat(name).into()),
        }
    }

    /// Push a sink invocation onto the dispatch queue. The liveness check
    /// runs on the consumer task: a job outliving `stop` degrades to a
    /// no-op instead of touching a stopped stream's session state.
    fn queue_sink_call(
        &self,
        tag: &str,
        call: impl FnOnce(&mut dyn SampleSink) + Send + 'static,
    ) {
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        self.dispatch.push(Job::new(format!("{}::{tag}", self.label), move || {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let mut sink = sink.lock();
            call(&mut **sink);
            Ok(())
        }));
    }

    fn queue_begin(&self) {
        let name = self.name.clone();
        self.queue_sink_call("begin", move |sink| sink.begin(&name));
    }

    fn queue_sample(&self, sample: MediaSample) {
        self.stats.count_sample(sample.kind);
        self.queue_sink_call("sample", move |sink| sink.sample(sample));
    }

    fn queue_end(&self) {
        self.queue_sink_call("end", |sink| sink.end());
    }

    fn fail(&self, error: StreamError) {
        tracing::warn!(stream = %self.label, "stream failed: {error}");
        self.queue_sink_call("error", move |sink| sink.error(error));
    }
}
