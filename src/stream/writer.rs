//! Socket writer: accepts samples from the consumer task and gets their
//! muxed bytes onto the wire without reordering and without blocking the
//! consumer on I/O.
//!
//! Every accepted call becomes one job on the writer's lane; the lane is
//! opened fresh for each socket, so a restarted writer starts a new ordering
//! domain. Muxing and the wire write happen inside the lane job, off the
//! consumer task, in acceptance order.

use {
    super::{
        describe_stream,
        errors::{StreamError, StreamErrorValue},
        ErrorHook, MediaStream, StreamKind, StreamState,
    },
    crate::config::TransportConfig,
    crate::dispatch::{DispatchQueue, Job},
    crate::format::{FormatRegistry, MediaMuxer},
    crate::lanes::{LaneId, LanePool},
    crate::media::{MediaSample, OutletReject, SampleOutlet},
    crate::statistics::StreamStatistics,
    crate::transport::{self, errors::TransportErrorValue, Conn, SendHalf, TlsWrap},
    async_trait::async_trait,
    bytes::Bytes,
    std::net::SocketAddr,
    std::sync::Arc,
    tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf},
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

pub(super) enum MuxOp {
    Header(Arc<str>),
    Sample(MediaSample),
    Trailer,
}

/// Shared by the socket writer and the listening writer's per-client fan-out:
/// one accepted call becomes one lane job that muxes and writes through the
/// send half. Returns `false` if the lane is closed.
#[allow(clippy::too_many_arguments)]
pub(super) fn submit_mux_op(
    lanes: &LanePool,
    lane: LaneId,
    tag: &'static str,
    credited: u64,
    op: MuxOp,
    send: Arc<SendHalf>,
    muxer: Arc<tokio::sync::Mutex<Box<dyn MediaMuxer>>>,
    stats: Arc<StreamStatistics>,
    dispatch: Arc<DispatchQueue>,
    hook: Option<ErrorHook>,
    cancel: CancellationToken,
    label: Arc<str>,
) -> bool {
    send.credit(credited);
    lanes.submit(lane, tag, async move {
        let muxed = {
            let mut muxer = muxer.lock().await;
            match op {
                MuxOp::Header(name) => muxer.mux_header(&name),
                MuxOp::Sample(sample) => muxer.mux_sample(&sample),
                MuxOp::Trailer => muxer.mux_trailer(),
            }
        };
        match muxed {
            Ok(bytes) => match send.send(&bytes, credited).await {
                Ok(()) => {
                    stats.add_send_bytes(bytes.len() as u64);
                    Ok(())
                }
                Err(err) => {
                    let message = err.to_string();
                    report(&dispatch, &hook, &cancel, &label, err.into());
                    Err(anyhow::anyhow!("send failed: {message}"))
                }
            },
            Err(err) => {
                send.debit(credited);
                let message = err.to_string();
                report(&dispatch, &hook, &cancel, &label, err.into());
                Err(anyhow::anyhow!("mux failed: {message}"))
            }
        }
    })
}

pub struct SocketWriter {
    id: Uuid,
    kind: StreamKind,
    path: String,
    addr: SocketAddr,
    state: StreamState,
    format: String,
    registry: Arc<FormatRegistry>,
    lanes: Arc<LanePool>,
    dispatch: Arc<DispatchQueue>,
    transport_config: TransportConfig,
    tls: Option<Arc<dyn TlsWrap>>,
    error_hook: Option<ErrorHook>,
    stats: Arc<StreamStatistics>,
    cancel: CancellationToken,
    lane: Option<LaneId>,
    send: Option<Arc<SendHalf>>,
    muxer: Option<Arc<tokio::sync::Mutex<Box<dyn MediaMuxer>>>>,
    // begin_media .. end_media bracket; None means writes are rejected
    name: Option<Arc<str>>,
}

impl SocketWriter {
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
            state: StreamState::Idle,
            format: format.into(),
            registry,
            lanes,
            dispatch,
            transport_config: TransportConfig::default(),
            tls: None,
            error_hook: None,
            stats: Arc::new(StreamStatistics::new()),
            cancel: CancellationToken::new(),
            lane: None,
            send: None,
            muxer: None,
            name: None,
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

    pub fn set_error_hook(&mut self, hook: ErrorHook) {
        self.error_hook = Some(hook);
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<StreamStatistics> {
        self.stats.clone()
    }

    /// Lazy connect: the first accepted call runs the stream before queuing.
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

    /// One accepted call, one lane job. Encode failure debits the gauge
    /// and reports without killing the writer; only `stop` or a disconnect
    /// ends it.
    fn queue_op(&self, tag: &'static str, credited: u64, op: MuxOp) {
        let (Some(lane), Some(send), Some(muxer)) = (self.lane, &self.send, &self.muxer) else {
            return;
        };
        let label: Arc<str> =
            Arc::from(format!("{}://{}/{}", self.kind.scheme(), self.addr, self.path));
        submit_mux_op(
            &self.lanes,
            lane,
            tag,
            credited,
            op,
            send.clone(),
            muxer.clone(),
            self.stats.clone(),
            self.dispatch.clone(),
            self.error_hook.clone(),
            self.cancel.clone(),
            label,
        );
    }

    async fn write_sample(&mut self, sample: MediaSample) -> Result<(), OutletReject> {
        if self.name.is_none() {
            self.stats.count_rejected_write();
            return Err(OutletReject::NotBegun);
        }
        self.ensure_started().await?;
        let credited = sample.payload.len() as u64;
        self.stats.count_sample(sample.kind);
        self.queue_op("write sample", credited, MuxOp::Sample(sample));
        Ok(())
    }

    fn spawn_disconnect_watcher(&self, rd: ReadHalf<Box<dyn Conn>>) {
        let cancel = self.cancel.clone();
        let dispatch = self.dispatch.clone();
        let hook = self.error_hook.clone();
        let label = format!("{}://{}/{}", self.kind.scheme(), self.addr, self.path);
        tokio::spawn(async move {
            let mut rd = rd;
            let mut scratch = [0u8; 1024];
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    read = rd.read(&mut scratch) => match read {
                        // inbound bytes on a write-only stream are discarded
                        Ok(n) if n > 0 => {}
                        _ => {
                            if !cancel.is_cancelled() {
                                tracing::warn!(stream = %label, "peer disconnected");
                                report(
                                    &dispatch,
                                    &hook,
                                    &cancel,
                                    &label,
                                    StreamErrorValue::Disconnected.into(),
                                );
                            }
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Report a worker-side failure on the consumer task via the dispatch queue.
fn report(
    dispatch: &Arc<DispatchQueue>,
    hook: &Option<ErrorHook>,
    cancel: &CancellationToken,
    label: &str,
    error: StreamError,
) {
    let Some(hook) = hook.clone() else {
        return;
    };
    let cancel = cancel.clone();
    dispatch.push(Job::new(format!("{label}::error"), move || {
        if cancel.is_cancelled() {
            return Ok(());
        }
        hook(&error);
        Ok(())
    }));
}

#[async_trait]
impl MediaStream for SocketWriter {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn describe(&self) -> String {
        describe_stream("target", self.kind, self.addr, &self.path, Some(&self.format))
    }

    async fn run(&mut self) -> Result<(), StreamError> {
        if self.state != StreamState::Idle {
            return Err(StreamErrorValue::AlreadyActive.into());
        }
        self.state = StreamState::Starting;

        let Some(muxer) = self.registry.muxer(&self.format) else {
            self.state = StreamState::Idle;
            return Err(StreamErrorValue::UnknownFormat(self.format.clone()).into());
        };

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

        let conn = match transport::connect(
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
        };

        let (rd, mut wr) = tokio::io::split(conn);

        if self.kind == StreamKind::Http {
            let content_type = self
                .registry
                .content_type(&self.format)
                .unwrap_or("application/octet-stream");
            let head = transport::request_head(
                "POST",
                &format!("/{}", self.path),
                &self.addr.to_string(),
                Some(content_type),
            );
            if let Err(err) = wr.write_all(head.as_bytes()).await {
                self.state = StreamState::Idle;
                return Err(StreamError::from(err));
            }
        }

        self.cancel = CancellationToken::new();
        self.spawn_disconnect_watcher(rd);
        self.send = Some(Arc::new(SendHalf::new(wr, self.addr)));
        self.muxer = Some(Arc::new(tokio::sync::Mutex::new(muxer)));
        // fresh lane per socket: a restarted writer is a new ordering domain
        self.lane = Some(self.lanes.open_lane());

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
        if let Some(lane) = self.lane.take() {
            // queued sends still drain; the lane exits after the last one
            self.lanes.close_lane(lane);
        }
        // lane jobs hold their own Arc; the socket closes after the last send
        self.send = None;
        self.muxer = None;
        self.name = None;
        log::info!("{} stopped", self.describe());
        self.state = StreamState::Idle;
    }
}

impl Drop for SocketWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl SampleOutlet for SocketWriter {
    async fn begin_media(&mut self, name: &str) -> Result<(), OutletReject> {
        self.ensure_started().await?;
        let name: Arc<str> = Arc::from(name);
        self.name = Some(name.clone());
        self.queue_op("begin media", 0, MuxOp::Header(name));
        Ok(())
    }

    async fn write_audio(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject> {
        self.write_sample(MediaSample::audio(track, timestamp, payload)).await
    }

    async fn write_video(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject> {
        self.write_sample(MediaSample::video(track, timestamp, payload)).await
    }

    async fn write_data(
        &mut self,
        track: u8,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<(), OutletReject> {
        self.write_sample(MediaSample::data(track, timestamp, payload)).await
    }

    async fn end_media(&mut self) -> Result<(), OutletReject> {
        if self.name.is_none() {
            self.stats.count_rejected_write();
            return Err(OutletReject::NotBegun);
        }
        if self.state != StreamState::Started {
            return Err(OutletReject::NotStarted);
        }
        self.name = None;
        self.queue_op("end media", 0, MuxOp::Trailer);
        Ok(())
    }

    fn queued_bytes(&self) -> u64 {
        self.send.as_ref().map_or(0, |send| send.queued_bytes())
    }
}
