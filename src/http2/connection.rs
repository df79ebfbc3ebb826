//! The multiplexed connection: one transport, many concurrent streams.
//!
//! Concurrency shape: a single reader task consumes frames in order and
//! dispatches payloads to streams; the writer lock serializes frame
//! emission. When a function needs both the writer lock and the connection
//! state lock, the writer lock is taken first. Streams never touch the
//! transport directly.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, trace, warn};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::connect::BoxedIo;
use crate::sync::Mutex;

use super::frame::{
    ErrorCode, Frame, FrameReader, FrameWriter, Settings, DEFAULT_INITIAL_WINDOW_SIZE,
    MAX_WINDOW_SIZE,
};
use super::hpack;
use super::stream::{H2Stream, StreamInner};
use super::H2Error;

/// Knobs the client passes down to each new multiplexed connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct H2Settings {
    /// Keepalive PING cadence; `ZERO` disables keepalive.
    pub ping_interval: Duration,
}

/// Callback invoked (outside all locks) when the peer's SETTINGS change the
/// number of streams this connection may carry.
pub(crate) type OnMaxConcurrentStreams = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct H2Connection {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(super) writer: tokio::sync::Mutex<FrameWriter<WriteHalf<BoxedIo>>>,
    pub(super) state: Mutex<State>,
    // Signaled whenever the connection-level send window grows.
    pub(super) write_notify: Notify,
    degraded: AtomicBool,
    closed_tx: watch::Sender<bool>,
    on_max_concurrent_streams: OnMaxConcurrentStreams,
}

pub(crate) struct State {
    pub(super) streams: HashMap<u32, Arc<StreamInner>>,
    next_stream_id: u32,
    local_settings: Settings,
    pub(super) peer_settings: Settings,
    /// Connection-level send window, debited before each DATA frame.
    pub(super) send_window: i64,
    /// Bytes received but not yet returned to the peer's connection window.
    unacked_read: u64,
    goaway_received: Option<u32>,
    goaway_sent: bool,
    /// Highest peer-initiated stream id processed; reported in GOAWAY.
    last_peer_stream_id: u32,
    awaiting_pong: bool,
}

impl H2Connection {
    /// Send the client preface and our SETTINGS, then start the reader and
    /// keepalive tasks. The peer's SETTINGS arrive asynchronously and are
    /// surfaced through `on_max_concurrent_streams`.
    pub(crate) async fn handshake(
        io: BoxedIo,
        settings: H2Settings,
        on_max_concurrent_streams: OnMaxConcurrentStreams,
    ) -> Result<H2Connection, H2Error> {
        let (read_half, write_half) = tokio::io::split(io);
        let mut writer = FrameWriter::new(write_half);
        let local_settings = Settings::client_default();
        writer.connection_preface(&local_settings).await?;
        writer.flush().await?;

        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(State {
                streams: HashMap::new(),
                next_stream_id: 1,
                local_settings,
                peer_settings: Settings::default(),
                send_window: DEFAULT_INITIAL_WINDOW_SIZE as i64,
                unacked_read: 0,
                goaway_received: None,
                goaway_sent: false,
                last_peer_stream_id: 0,
                awaiting_pong: false,
            }),
            write_notify: Notify::new(),
            degraded: AtomicBool::new(false),
            closed_tx,
            on_max_concurrent_streams,
        });

        tokio::spawn(read_loop(
            shared.clone(),
            FrameReader::new(read_half),
            closed_rx.clone(),
        ));

        if settings.ping_interval > Duration::ZERO {
            tokio::spawn(ping_loop(
                shared.clone(),
                settings.ping_interval,
                closed_rx,
            ));
        }

        Ok(H2Connection { shared })
    }

    /// Open the next stream. Stream ids are odd, strictly increasing, and
    /// never reused; allocation and HEADERS emission happen under the
    /// writer lock so ids appear on the wire in allocation order.
    pub(crate) async fn new_stream(
        &self,
        headers: &[hpack::Header],
        end_stream: bool,
    ) -> Result<H2Stream, H2Error> {
        let mut writer = self.shared.writer.lock().await;

        let (id, inner) = {
            let mut state = self.shared.state.lock();
            if state.goaway_received.is_some() || state.goaway_sent {
                return Err(H2Error::Shutdown);
            }
            let id = state.next_stream_id;
            state.next_stream_id += 2;
            let inner = Arc::new(StreamInner::new(
                id,
                state.peer_settings.initial_window_size() as i64,
            ));
            state.streams.insert(id, inner.clone());
            (id, inner)
        };

        if let Err(e) = writer.headers(id, headers, end_stream).await {
            self.shared.state.lock().streams.remove(&id);
            return Err(e);
        }
        writer.flush().await?;
        drop(writer);

        if end_stream {
            inner.close_local();
        }

        trace!("opened http2 stream {id}");
        Ok(H2Stream::new(inner, self.shared.clone()))
    }

    /// Streams currently carrying an exchange.
    pub(crate) fn open_stream_count(&self) -> usize {
        self.shared.state.lock().streams.len()
    }

    /// False once a keepalive PING went unanswered, the peer told us to go
    /// away, or the transport failed.
    pub(crate) fn is_healthy(&self) -> bool {
        if self.shared.degraded.load(Ordering::Relaxed) {
            return false;
        }
        if *self.shared.closed_tx.borrow() {
            return false;
        }
        let state = self.shared.state.lock();
        state.goaway_received.is_none()
    }

    /// True once GOAWAY was sent or received.
    pub(crate) fn is_shutdown(&self) -> bool {
        let state = self.shared.state.lock();
        state.goaway_received.is_some() || state.goaway_sent
    }

    /// The peer's advertised concurrent-stream ceiling.
    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        self.shared.state.lock().peer_settings.max_concurrent_streams()
    }

    /// Send GOAWAY once; later calls are no-ops.
    pub(crate) async fn shutdown(&self, error_code: ErrorCode) {
        let last_peer_stream_id = {
            let mut state = self.shared.state.lock();
            if state.goaway_sent {
                return;
            }
            state.goaway_sent = true;
            state.last_peer_stream_id
        };
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.goaway(last_peer_stream_id, error_code, b"").await {
            debug!("goaway write failed: {e}");
            return;
        }
        let _ = writer.flush().await;
    }

    /// Tear the connection down: fail every stream, stop the background
    /// tasks, and shut the transport's write side.
    pub(crate) async fn close(&self) {
        let streams = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.streams)
        };
        for stream in streams.values() {
            stream.close_with_error(H2Error::Shutdown);
        }
        let _ = self.shared.closed_tx.send(true);
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connection")
            .field("open_streams", &self.open_stream_count())
            .finish()
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: FrameReader<ReadHalf<BoxedIo>>,
    mut closed: watch::Receiver<bool>,
) {
    let error = loop {
        let frame = tokio::select! {
            frame = reader.read_frame() => frame,
            _ = closed.changed() => break H2Error::Shutdown,
        };
        match frame {
            Ok(frame) => {
                if let Err(e) = dispatch_frame(&shared, &mut reader, frame).await {
                    break e;
                }
            }
            Err(e) => break e,
        }
    };

    match &error {
        H2Error::Shutdown => debug!("http2 reader finished: connection closed"),
        other => debug!("http2 reader finished: {other}"),
    }

    // A protocol violation tears the whole connection down with GOAWAY.
    if !matches!(error, H2Error::Io(_) | H2Error::Shutdown) {
        let code = error.connection_error_code();
        let last = shared.state.lock().last_peer_stream_id;
        let mut writer = shared.writer.lock().await;
        let _ = writer.goaway(last, code, b"").await;
        let _ = writer.flush().await;
    }

    let streams = {
        let mut state = shared.state.lock();
        state.goaway_sent = true;
        std::mem::take(&mut state.streams)
    };
    for stream in streams.values() {
        stream.close_with_error(H2Error::Shutdown);
    }
    let _ = shared.closed_tx.send(true);
}

async fn dispatch_frame(
    shared: &Arc<Shared>,
    reader: &mut FrameReader<ReadHalf<BoxedIo>>,
    frame: Frame,
) -> Result<(), H2Error> {
    match frame {
        Frame::Data {
            stream_id,
            end_stream,
            data,
        } => {
            let len = data.len() as u64;
            let stream = {
                let mut state = shared.state.lock();
                state.unacked_read += len;
                state.streams.get(&stream_id).cloned()
            };
            match stream {
                Some(stream) => {
                    stream.receive_data(data, end_stream);
                    if end_stream {
                        finish_stream_if_done(shared, stream_id);
                    }
                }
                None => {
                    trace!("data for unknown stream {stream_id}");
                    let mut writer = shared.writer.lock().await;
                    writer
                        .rst_stream(stream_id, ErrorCode::STREAM_CLOSED)
                        .await?;
                    writer.flush().await?;
                }
            }
            ack_connection_window(shared).await?;
            Ok(())
        }
        Frame::Headers {
            stream_id,
            end_stream,
            block,
        } => {
            let headers = reader.hpack_mut().decode(&block)?;
            let stream = shared.state.lock().streams.get(&stream_id).cloned();
            match stream {
                Some(stream) => {
                    stream.receive_headers(headers, end_stream);
                    if end_stream {
                        finish_stream_if_done(shared, stream_id);
                    }
                }
                None => {
                    trace!("headers for unknown stream {stream_id}");
                    let mut writer = shared.writer.lock().await;
                    writer
                        .rst_stream(stream_id, ErrorCode::STREAM_CLOSED)
                        .await?;
                    writer.flush().await?;
                }
            }
            Ok(())
        }
        Frame::Priority { .. } => Ok(()),
        Frame::RstStream {
            stream_id,
            error_code,
        } => {
            let stream = shared.state.lock().streams.remove(&stream_id);
            if let Some(stream) = stream {
                debug!("stream {stream_id} reset by peer: {error_code}");
                stream.receive_reset(error_code);
            }
            Ok(())
        }
        Frame::Settings { ack, settings } => {
            if ack {
                trace!("peer acknowledged our settings");
                return Ok(());
            }
            let (old_initial, new_initial, max_streams) = {
                let mut state = shared.state.lock();
                let old_initial = state.peer_settings.initial_window_size() as i64;
                state.peer_settings.apply(&settings);
                let new_initial = state.peer_settings.initial_window_size() as i64;
                // A change to the initial window retroactively adjusts every
                // open stream's send window.
                let delta = new_initial - old_initial;
                if delta != 0 {
                    for stream in state.streams.values() {
                        stream.adjust_send_window(delta);
                    }
                }
                (old_initial, new_initial, state.peer_settings.max_concurrent_streams())
            };
            if new_initial != old_initial {
                shared.write_notify.notify_waiters();
            }

            {
                let mut writer = shared.writer.lock().await;
                if let Some(size) = settings.max_frame_size {
                    writer.set_max_frame_size(size);
                }
                if let Some(size) = settings.header_table_size {
                    writer.set_header_table_size(size);
                }
                writer.settings_ack().await?;
                writer.flush().await?;
            }

            if settings.max_concurrent_streams.is_some() {
                (shared.on_max_concurrent_streams)(max_streams);
            }
            Ok(())
        }
        Frame::PushPromise { stream_id, .. } => {
            warn!("push promise on stream {stream_id} despite ENABLE_PUSH=0");
            Err(H2Error::protocol("push is disabled"))
        }
        Frame::Ping { ack, payload } => {
            if ack {
                shared.state.lock().awaiting_pong = false;
                return Ok(());
            }
            let mut writer = shared.writer.lock().await;
            writer.ping(true, payload).await?;
            writer.flush().await?;
            Ok(())
        }
        Frame::GoAway {
            last_stream_id,
            error_code,
            ..
        } => {
            debug!("goaway received: last={last_stream_id} code={error_code}");
            let refused = {
                let mut state = shared.state.lock();
                state.goaway_received = Some(last_stream_id);
                let refused: Vec<u32> = state
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_stream_id && id % 2 == 1)
                    .collect();
                refused
                    .iter()
                    .filter_map(|id| state.streams.remove(id))
                    .collect::<Vec<_>>()
            };
            for stream in refused {
                stream.receive_reset(ErrorCode::REFUSED_STREAM);
            }
            Ok(())
        }
        Frame::WindowUpdate {
            stream_id,
            increment,
        } => {
            if stream_id == 0 {
                let mut state = shared.state.lock();
                state.send_window += increment as i64;
                if state.send_window > MAX_WINDOW_SIZE as i64 {
                    return Err(H2Error::protocol("connection window overflow"));
                }
                drop(state);
                shared.write_notify.notify_waiters();
            } else {
                let stream = shared.state.lock().streams.get(&stream_id).cloned();
                if let Some(stream) = stream {
                    stream.grow_send_window(increment)?;
                }
            }
            Ok(())
        }
    }
}

/// Drop a stream from the table once both halves finished cleanly.
fn finish_stream_if_done(shared: &Arc<Shared>, stream_id: u32) {
    let mut state = shared.state.lock();
    let done = state
        .streams
        .get(&stream_id)
        .map(|s| s.is_done())
        .unwrap_or(false);
    if done {
        state.streams.remove(&stream_id);
    }
}

/// Return consumed bytes to the peer's connection-level window once half of
/// it is unacknowledged.
async fn ack_connection_window(shared: &Arc<Shared>) -> Result<(), H2Error> {
    let ack = {
        let mut state = shared.state.lock();
        let threshold = (state.local_settings.initial_window_size() / 2) as u64;
        if state.unacked_read >= threshold {
            let ack = state.unacked_read;
            state.unacked_read = 0;
            Some(ack)
        } else {
            None
        }
    };
    if let Some(ack) = ack {
        let mut writer = shared.writer.lock().await;
        writer.window_update(0, ack as u32).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn ping_loop(shared: Arc<Shared>, interval: Duration, mut closed: watch::Receiver<bool>) {
    let mut next = Instant::now() + interval;
    let mut nonce: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            _ = closed.changed() => return,
        }
        next += interval;

        let missed = {
            let mut state = shared.state.lock();
            if state.awaiting_pong {
                true
            } else {
                state.awaiting_pong = true;
                false
            }
        };

        if missed {
            // The previous ping's echo never arrived within an interval.
            warn!("http2 keepalive ping went unanswered");
            shared.degraded.store(true, Ordering::Relaxed);
            return;
        }

        nonce = nonce.wrapping_add(1);
        let mut writer = shared.writer.lock().await;
        if writer.ping(false, nonce.to_be_bytes()).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::frame::{Frame, FrameReader, FrameWriter, CONNECTION_PREFACE};
    use crate::http2::hpack::Header;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    struct Peer {
        reader: FrameReader<ReadHalf<BoxedIo>>,
        writer: FrameWriter<WriteHalf<BoxedIo>>,
    }

    impl Peer {
        /// Read frames until one matches; panics on connection teardown.
        async fn next_frame(&mut self) -> Frame {
            self.reader.read_frame().await.expect("peer read")
        }

        async fn read_headers_frame(&mut self) -> (u32, Vec<Header>, bool) {
            loop {
                match self.next_frame().await {
                    Frame::Headers {
                        stream_id,
                        end_stream,
                        block,
                    } => {
                        let headers = self.reader.hpack_mut().decode(&block).unwrap();
                        return (stream_id, headers, end_stream);
                    }
                    Frame::Settings { .. } | Frame::WindowUpdate { .. } => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        }

        async fn respond(&mut self, stream_id: u32, status: &str, body: &[u8]) {
            self.writer
                .headers(stream_id, &[Header::new(":status", status)], body.is_empty())
                .await
                .unwrap();
            if !body.is_empty() {
                self.writer.data(stream_id, true, body).await.unwrap();
            }
            self.writer.flush().await.unwrap();
        }
    }

    async fn connect(
        settings: H2Settings,
        hook: OnMaxConcurrentStreams,
    ) -> (H2Connection, Peer) {
        let (client_io, mut server_io) = tokio::io::duplex(1 << 20);
        let conn_fut = H2Connection::handshake(Box::new(client_io), settings, hook);

        // The peer consumes the preface magic before framing starts.
        let mut magic = [0u8; CONNECTION_PREFACE.len()];
        let (conn, _) = tokio::join!(conn_fut, async {
            server_io.read_exact(&mut magic).await.unwrap();
        });
        assert_eq!(&magic[..], CONNECTION_PREFACE);

        let (read_half, write_half) = tokio::io::split(Box::new(server_io) as BoxedIo);
        let mut peer = Peer {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        };
        // The client leads with its SETTINGS.
        match peer.next_frame().await {
            Frame::Settings { ack: false, settings } => {
                assert_eq!(settings.enable_push, Some(false));
            }
            other => panic!("expected settings, got {other:?}"),
        }
        (conn.unwrap(), peer)
    }

    fn request_headers() -> Vec<Header> {
        vec![
            Header::new(":method", "GET"),
            Header::new(":scheme", "https"),
            Header::new(":path", "/"),
            Header::new(":authority", "h2.example"),
        ]
    }

    #[tokio::test]
    async fn stream_ids_are_odd_and_increasing() {
        let (conn, mut peer) = connect(H2Settings::default(), Box::new(|_| {})).await;

        let mut streams = Vec::new();
        for _ in 0..8 {
            streams.push(conn.new_stream(&request_headers(), true).await.unwrap());
        }
        let ids: Vec<u32> = streams.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![1, 3, 5, 7, 9, 11, 13, 15]);

        for expected in [1u32, 3, 5, 7, 9, 11, 13, 15] {
            let (stream_id, headers, end_stream) = peer.read_headers_frame().await;
            assert_eq!(stream_id, expected);
            assert!(end_stream);
            assert_eq!(&headers[0].value[..], b"GET");
        }

        for stream in &streams {
            peer.respond(stream.id(), "200", b"hi").await;
        }
        for stream in &streams {
            let headers = stream.read_headers().await.unwrap();
            assert_eq!(&headers[0].value[..], b"200");
            let mut body = Vec::new();
            while let Some(chunk) = stream.read_data(1024).await.unwrap() {
                body.extend_from_slice(&chunk);
            }
            assert_eq!(body, b"hi");
        }
        assert_eq!(conn.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn refused_stream_reaches_the_reader() {
        let (conn, mut peer) = connect(H2Settings::default(), Box::new(|_| {})).await;
        let stream = conn.new_stream(&request_headers(), true).await.unwrap();
        let (stream_id, _, _) = peer.read_headers_frame().await;

        peer.writer
            .rst_stream(stream_id, ErrorCode::REFUSED_STREAM)
            .await
            .unwrap();
        peer.writer.flush().await.unwrap();

        match stream.read_headers().await {
            Err(H2Error::Reset(code)) => assert_eq!(code, ErrorCode::REFUSED_STREAM),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn goaway_refuses_later_streams_and_finishes_earlier_ones() {
        let (conn, mut peer) = connect(H2Settings::default(), Box::new(|_| {})).await;

        let survivor = conn.new_stream(&request_headers(), true).await.unwrap();
        let refused = conn.new_stream(&request_headers(), true).await.unwrap();
        assert_eq!((survivor.id(), refused.id()), (1, 3));
        let _ = peer.read_headers_frame().await;
        let _ = peer.read_headers_frame().await;

        peer.writer
            .goaway(survivor.id(), ErrorCode::NO_ERROR, b"")
            .await
            .unwrap();
        peer.writer.flush().await.unwrap();

        // In-flight above the cutoff: refused, retryable elsewhere.
        match refused.read_headers().await {
            Err(H2Error::Reset(code)) => assert_eq!(code, ErrorCode::REFUSED_STREAM),
            other => panic!("expected refusal, got {other:?}"),
        }

        // New streams cannot start at all.
        match conn.new_stream(&request_headers(), true).await {
            Err(H2Error::Shutdown) => {}
            other => panic!("expected shutdown, got {other:?}"),
        }
        assert!(conn.is_shutdown());

        // Below the cutoff: completes normally.
        peer.respond(survivor.id(), "200", b"done").await;
        let headers = survivor.read_headers().await.unwrap();
        assert_eq!(&headers[0].value[..], b"200");
        let chunk = survivor.read_data(64).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"done");
    }

    #[tokio::test]
    async fn settings_update_reaches_the_hook() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (conn, mut peer) = connect(
            H2Settings::default(),
            Box::new(move |max| {
                let _ = tx.send(max);
            }),
        )
        .await;

        let settings = crate::http2::frame::Settings {
            max_concurrent_streams: Some(7),
            ..Default::default()
        };
        peer.writer.settings(&settings).await.unwrap();
        peer.writer.flush().await.unwrap();

        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(conn.max_concurrent_streams(), 7);

        // The engine acknowledges the peer's settings.
        loop {
            match peer.next_frame().await {
                Frame::Settings { ack: true, .. } => break,
                Frame::Settings { ack: false, .. } => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn data_writes_respect_flow_control_windows() {
        let (conn, mut peer) = connect(H2Settings::default(), Box::new(|_| {})).await;
        let stream = conn.new_stream(&request_headers(), false).await.unwrap();
        let (stream_id, _, end_stream) = peer.read_headers_frame().await;
        assert!(!end_stream);

        let payload = vec![0x42u8; 80_000];
        let writer_stream = stream;
        let write_task = tokio::spawn(async move {
            writer_stream.write_data(&payload, true).await.unwrap();
            writer_stream
        });

        // The initial windows admit exactly 65535 bytes; the sender must
        // then stall until credit returns.
        let mut received = 0u64;
        while received < 65_535 {
            match peer.next_frame().await {
                Frame::Data { data, .. } => received += data.len() as u64,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(received, 65_535);
        assert!(!write_task.is_finished());

        peer.writer.window_update(0, 20_000).await.unwrap();
        peer.writer.window_update(stream_id, 20_000).await.unwrap();
        peer.writer.flush().await.unwrap();

        let mut saw_end = false;
        while !saw_end {
            match peer.next_frame().await {
                Frame::Data {
                    data, end_stream, ..
                } => {
                    received += data.len() as u64;
                    saw_end = end_stream;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(received, 80_000);
        let _stream = write_task.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_keepalive_ping_degrades_the_connection() {
        let (conn, mut peer) = connect(
            H2Settings {
                ping_interval: Duration::from_millis(40),
            },
            Box::new(|_| {}),
        )
        .await;
        assert!(conn.is_healthy());

        // First ping arrives and is answered; the connection stays
        // healthy.
        match peer.next_frame().await {
            Frame::Ping { ack: false, payload } => {
                peer.writer.ping(true, payload).await.unwrap();
                peer.writer.flush().await.unwrap();
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.is_healthy());

        // Leave the next ping unanswered past a full interval.
        match peer.next_frame().await {
            Frame::Ping { ack: false, .. } => {}
            other => panic!("unexpected frame: {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn frames_for_unknown_streams_are_reset() {
        let (conn, mut peer) = connect(H2Settings::default(), Box::new(|_| {})).await;
        let stream = conn.new_stream(&request_headers(), true).await.unwrap();
        let _ = peer.read_headers_frame().await;

        // Data for a stream that was never opened gets a reset, and the
        // live stream is unaffected.
        peer.writer.data(99, false, b"stray").await.unwrap();
        peer.writer.flush().await.unwrap();

        loop {
            match peer.next_frame().await {
                Frame::RstStream {
                    stream_id,
                    error_code,
                } => {
                    assert_eq!(stream_id, 99);
                    assert_eq!(error_code, ErrorCode::STREAM_CLOSED);
                    break;
                }
                Frame::WindowUpdate { .. } => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        peer.respond(stream.id(), "200", b"").await;
        let headers = stream.read_headers().await.unwrap();
        assert_eq!(&headers[0].value[..], b"200");
    }
}
