//! Listening stream variants.
//!
//! [`ServerReader`] accepts inbound publisher connections and adopts each as
//! a socket reader feeding the shared sink; the newest publisher replaces
//! the previous one. [`ServerWriter`] is a listening sample outlet: every
//! accepted subscriber gets its own muxer and its own lane, so each client's
//! byte stream is ordered independently while samples fan out to all of
//! them.

use {
    super::{
        describe_stream,
        errors::{StreamError, StreamErrorValue},
        reader::SocketReader,
        writer::{submit_mux_op, MuxOp},
        ErrorHook, MediaStream, StreamKind, StreamState,
    },
    crate::config::{ServerConfig, TransportConfig},
    crate::dispatch::DispatchQueue,
    crate::format::{FormatRegistry, MediaMuxer},
    crate::lanes::{LaneId, LanePool},
    crate::media::{MediaSample, OutletReject, SampleOutlet, SharedSink},
    crate::statistics::StreamStatistics,
    crate::transport::{self, Conn, SendHalf, TlsWrap},
    async_trait::async_trait,
    bytes::{Bytes, BytesMut},
    dashmap::DashMap,
    parking_lot::Mutex,
    std::net::SocketAddr,
    std::sync::Arc,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::{TcpListener, TcpStream},
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

async fn wrap_accepted(
    tcp: TcpStream,
    kind: StreamKind,
    tls: Option<&Arc<dyn TlsWrap>>,
) -> std::io::Result<Box<dyn Conn>> {
    tcp.set_nodelay(true).ok();
    match (kind.is_secure(), tls) {
        (true, Some(tls)) => tls.wrap_server(tcp).await,
        // run() refuses a secure kind without a wrapper, so plain is correct here
        _ => Ok(Box::new(tcp)),
    }
}

/// Listening media source: `address + accept`, one adopted reader per
/// inbound connection, all feeding one sink.
pub struct ServerReader {
    id: Uuid,
    kind: StreamKind,
    path: String,
    addr: SocketAddr,
    bound: Option<SocketAddr>,
    state: StreamState,
    sink: SharedSink,
    dispatch: Arc<DispatchQueue>,
    registry: Arc<FormatRegistry>,
    transport_config: TransportConfig,
    explicit_format: Option<String>,
    tls: Option<Arc<dyn TlsWrap>>,
    stats: Arc<StreamStatistics>,
    cancel: CancellationToken,
    active: Arc<Mutex<Option<SocketReader>>>,
}

impl ServerReader {
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
            bound: None,
            state: StreamState::Idle,
            sink,
            dispatch,
            registry,
            transport_config: TransportConfig::default(),
            explicit_format: None,
            tls: None,
            stats: Arc::new(StreamStatistics::new()),
            cancel: CancellationToken::new(),
            active: Arc::new(Mutex::new(None)),
        }
    }

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

    /// Actual bound address, once running (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<StreamStatistics> {
        self.stats.clone()
    }
}

#[async_trait]
impl MediaStream for ServerReader {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn describe(&self) -> String {
        describe_stream(
            "server source",
            self.kind,
            self.bound.unwrap_or(self.addr),
            &self.path,
            self.explicit_format.as_deref(),
        )
    }

    async fn run(&mut self) -> Result<(), StreamError> {
        if self.state != StreamState::Idle {
            return Err(StreamErrorValue::AlreadyActive.into());
        }
        self.state = StreamState::Starting;

        if self.kind.is_secure() && self.tls.is_none() {
            self.state = StreamState::Idle;
            return Err(StreamError::from(transport::errors::TransportError::from(
                transport::errors::TransportErrorValue::TlsUnavailable,
            )));
        }
        if let Some(format) = &self.explicit_format {
            if !self.registry.contains(format) {
                self.state = StreamState::Idle;
                return Err(StreamErrorValue::UnknownFormat(format.clone()).into());
            }
        }

        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(err) => {
                self.state = StreamState::Idle;
                return Err(err.into());
            }
        };
        self.bound = listener.local_addr().ok();

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let kind = self.kind;
        let path = self.path.clone();
        let sink = self.sink.clone();
        let dispatch = self.dispatch.clone();
        let registry = self.registry.clone();
        let tls = self.tls.clone();
        let explicit = self.explicit_format.clone();
        let transport_config = self.transport_config.clone();
        let stats = self.stats.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let (tcp, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                log::warn!("accept failed: {err}");
                                continue;
                            }
                        };
                        let conn = match wrap_accepted(tcp, kind, tls.as_ref()).await {
                            Ok(conn) => conn,
                            Err(err) => {
                                log::warn!("tls accept from {peer} failed: {err}");
                                continue;
                            }
                        };
                        let mut child = SocketReader::adopt(
                            kind,
                            path.clone(),
                            conn,
                            peer,
                            sink.clone(),
                            dispatch.clone(),
                            registry.clone(),
                        )
                        .with_transport(transport_config.clone())
                        .with_statistics(stats.clone());
                        if let Some(format) = &explicit {
                            child = child.with_format(format.clone());
                        }
                        match child.run().await {
                            Ok(()) => {
                                if cancel.is_cancelled() {
                                    // lost the race with stop()
                                    child.stop();
                                    return;
                                }
                                log::info!("media publisher connected from {peer}");
                                let mut slot = active.lock();
                                // one active publisher; the newest wins
                                if let Some(mut old) = slot.take() {
                                    old.stop();
                                }
                                *slot = Some(child);
                            }
                            Err(err) => log::warn!("publisher from {peer} rejected: {err}"),
                        }
                    }
                }
            }
        });

        self.state = StreamState::Started;
        log::info!("{} listening", self.describe());
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == StreamState::Idle {
            return;
        }
        self.state = StreamState::Stopping;
        self.cancel.cancel();
        if let Some(mut child) = self.active.lock().take() {
            child.stop();
        }
        self.bound = None;
        log::info!("{} stopped", self.describe());
        self.state = StreamState::Idle;
    }
}

impl Drop for ServerReader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WriterClient {
    lane: LaneId,
    send: Arc<SendHalf>,
    muxer: Arc<tokio::sync::Mutex<Box<dyn MediaMuxer>>>,
}

/// Listening sample outlet: fans accepted calls out to every connected
/// subscriber, each on its own ordered lane.
pub struct ServerWriter {
    id: Uuid,
    kind: StreamKind,
    path: String,
    addr: SocketAddr,
    bound: Option<SocketAddr>,
    state: StreamState,
    format: String,
    registry: Arc<FormatRegistry>,
    lanes: Arc<LanePool>,
    dispatch: Arc<DispatchQueue>,
    transport_config: TransportConfig,
    server_config: ServerConfig,
    tls: Option<Arc<dyn TlsWrap>>,
    error_hook: Option<ErrorHook>,
    stats: Arc<StreamStatistics>,
    cancel: CancellationToken,
    clients: Arc<DashMap<Uuid, WriterClient>>,
    // current begin_media bracket, shared with the accept task so a late
    // joiner gets the header before any fan-out sample
    name: Arc<Mutex<Option<Arc<str>>>>,
}

impl ServerWriter {
    #[must_use]
    pub fn new(
        kind: StreamKind,
        path: impl Into<String>,
        addr: SocketAddr,
        format: impl Into<String>,
        registry: Arc<FormatRegistry>,
        lanes: Arc<LanePool>,
        dispatch: Arc<DispatchQueue>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            path: path.into(),
            addr,
            bound: None,
            state: StreamState::Idle,
            format: format.into(),
            registry,
            lanes,
            dispatch,
            transport_config: TransportConfig::default(),
            server_config: ServerConfig::default(),
            tls: None,
            error_hook: None,
            stats: Arc::new(StreamStatistics::new()),
            cancel: CancellationToken::new(),
            clients: Arc::new(DashMap::new()),
            name: Arc::new(Mutex::new(None)),
        }
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

    #[must_use]
    pub fn with_limits(mut self, config: ServerConfig) -> Self {
        self.server_config = config;
        self
    }

    pub fn set_error_hook(&mut self, hook: ErrorHook) {
        self.error_hook = Some(hook);
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<StreamStatistics> {
        self.stats.clone()
    }

    fn label(&self) -> Arc<str> {
        Arc::from(format!(
            "{}://{}/{}",
            self.kind.scheme(),
            self.bound.unwrap_or(self.addr),
            self.path
        ))
    }

    async fn ensure_started(&mut self) -> Result<(), OutletReject> {
        match self.state {
            StreamState::Started => Ok(()),
            StreamState::Idle => match self.run().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.stats.count_rejected_write();
                    if let Some(hook) = &self.error_hook {
                        hook(&err);
                    }
                    Err(OutletReject::ConnectFailed)
                }
            },
            _ => Err(OutletReject::NotStarted),
        }
    }

    /// Fan one op out to every connected client; clients whose lane is gone
    /// are pruned.
    fn fan_out(&self, tag: &'static str, credited: u64, op: &impl Fn() -> MuxOp) {
        let label = self.label();
        let mut dead = Vec::new();
        for client in self.clients.iter() {
            let accepted = submit_mux_op(
                &self.lanes,
                client.lane,
                tag,
                credited,
                op(),
                client.send.clone(),
                client.muxer.clone(),
                self.stats.clone(),
                self.dispatch.clone(),
                self.error_hook.clone(),
                self.cancel.clone(),
                label.clone(),
            );
            if !accepted {
                dead.push(*client.key());
            }
        }
        for id in dead {
            self.clients.remove(&id);
            tracing::debug!(client = %id, "pruned dead subscriber");
        }
    }
}

#[async_trait]
impl MediaStream for ServerWriter {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn describe(&self) -> String {
        describe_stream(
            "server target",
            self.kind,
            self.bound.unwrap_or(self.addr),
            &self.path,
            Some(&self.format),
        )
    }

    async fn run(&mut self) -> Result<(), StreamError> {
        if self.state != StreamState::Idle {
            return Err(StreamErrorValue::AlreadyActive.into());
        }
        self.state = StreamState::Starting;

        if !self.registry.contains(&self.format) {
            self.state = StreamState::Idle;
            return Err(StreamErrorValue::UnknownFormat(self.format.clone()).into());
        }
        if self.kind.is_secure() && self.tls.is_none() {
            self.state = StreamState::Idle;
            return Err(StreamError::from(transport::errors::TransportError::from(
                transport::errors::TransportErrorValue::TlsUnavailable,
            )));
        }

        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(err) => {
                self.state = StreamState::Idle;
                return Err(err.into());
            }
        };
        self.bound = listener.local_addr().ok();

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let kind = self.kind;
        let format = self.format.clone();
        let registry = self.registry.clone();
        let lanes = self.lanes.clone();
        let dispatch = self.dispatch.clone();
        let tls = self.tls.clone();
        let hook = self.error_hook.clone();
        let stats = self.stats.clone();
        let clients = self.clients.clone();
        let name = self.name.clone();
        let max_clients = self.server_config.max_clients;
        let max_head = self.transport_config.max_head_bytes;
        let label = self.label();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let (tcp, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                log::warn!("accept failed: {err}");
                                continue;
                            }
                        };
                        if clients.len() >= max_clients {
                            log::warn!(
                                "subscriber from {peer} rejected: at capacity ({}/{max_clients})",
                                clients.len(),
                            );
                            continue;
                        }
                        let conn = match wrap_accepted(tcp, kind, tls.as_ref()).await {
                            Ok(conn) => conn,
                            Err(err) => {
                                log::warn!("tls accept from {peer} failed: {err}");
                                continue;
                            }
                        };
                        let (mut rd, mut wr) = tokio::io::split(conn);
                        if kind == StreamKind::Http {
                            let mut head_buf = BytesMut::new();
                            if let Err(err) =
                                transport::read_head(&mut rd, &mut head_buf, max_head).await
                            {
                                log::warn!("http request from {peer} rejected: {err}");
                                continue;
                            }
                            let content_type = registry
                                .content_type(&format)
                                .unwrap_or("application/octet-stream");
                            let response = transport::response_head(content_type);
                            if wr.write_all(response.as_bytes()).await.is_err() {
                                continue;
                            }
                        }

                        let Some(muxer) = registry.muxer(&format) else { continue };
                        let client_id = Uuid::new_v4();
                        let lane = lanes.open_lane();
                        let send = Arc::new(SendHalf::new(wr, peer));
                        let muxer = Arc::new(tokio::sync::Mutex::new(muxer));

                        // late joiner: header first, before any fan-out sample
                        if let Some(current) = name.lock().clone() {
                            submit_mux_op(
                                &lanes,
                                lane,
                                "begin media",
                                0,
                                MuxOp::Header(current),
                                send.clone(),
                                muxer.clone(),
                                stats.clone(),
                                dispatch.clone(),
                                hook.clone(),
                                cancel.clone(),
                                label.clone(),
                            );
                        }

                        // prune on subscriber disconnect
                        {
                            let cancel = cancel.clone();
                            let clients = clients.clone();
                            let lanes = lanes.clone();
                            tokio::spawn(async move {
                                let mut scratch = [0u8; 1024];
                                loop {
                                    tokio::select! {
                                        () = cancel.cancelled() => return,
                                        read = rd.read(&mut scratch) => match read {
                                            Ok(n) if n > 0 => {}
                                            _ => {
                                                clients.remove(&client_id);
                                                lanes.close_lane(lane);
                                                log::info!("subscriber {client_id} disconnected");
                                                return;
                                            }
                                        }
                                    }
                                }
                            });
                        }

                        clients.insert(client_id, WriterClient { lane, send, muxer });
                        log::info!("subscriber {client_id} connected from {peer}");
                    }
                }
            }
        });

        self.state = StreamState::Started;
        log::info!("{} listening", self.describe());
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == StreamState::Idle {
            return;
        }
        self.state = StreamState::Stopping;
        self.cancel.cancel();
        for client in self.clients.iter() {
            self.lanes.close_lane(client.lane);
        }
        self.clients.clear();
        *self.name.lock() = None;
        self.bound = None;
        log::info!("{} stopped", self.describe());
        self.state = StreamState::Idle;
    }
}

impl Drop for ServerWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl SampleOutlet for ServerWriter {
    async fn begin_media(&mut self, media_name: &str) -> Result<(), OutletReject> {
        self.ensure_started().await?;
        let media_name: Arc<str> = Arc::from(media_name);
        *self.name.lock() = Some(media_name.clone());
        self.fan_out("begin media", 0, &|| MuxOp::Header(media_name.clone()));
        Ok(())
    }

    async fn write_audio(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject> {
        self.fan_out_sample(MediaSample::audio(track, timestamp, payload)).await
    }

    async fn write_video(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject> {
        self.fan_out_sample(MediaSample::video(track, timestamp, payload)).await
    }

    async fn write_data(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject> {
        self.fan_out_sample(MediaSample::data(track, timestamp, payload)).await
    }

    async fn end_media(&mut self) -> Result<(), OutletReject> {
        if self.name.lock().is_none() {
            self.stats.count_rejected_write();
            return Err(OutletReject::NotBegun);
        }
        if self.state != StreamState::Started {
            return Err(OutletReject::NotStarted);
        }
        *self.name.lock() = None;
        self.fan_out("end media", 0, &|| MuxOp::Trailer);
        Ok(())
    }

    fn queued_bytes(&self) -> u64 {
        self.clients
            .iter()
            .map(|client| client.send.queued_bytes())
            .sum()
    }
}

impl ServerWriter {
    async fn fan_out_sample(&mut self, sample: MediaSample) -> Result<(), OutletReject> {
        if self.name.lock().is_none() {
            self.stats.count_rejected_write();
            return Err(OutletReject::NotBegun);
        }
        self.ensure_started().await?;
        let credited = sample.payload.len() as u64;
        self.stats.count_sample(sample.kind);
        self.fan_out("write sample", credited, &|| MuxOp::Sample(sample.clone()));
        Ok(())
    }
}
