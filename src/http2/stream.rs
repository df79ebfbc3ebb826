//! One multiplexed stream: the per-stream state machine and the blocking
//! read/write surface the codec drives.
//!
//! States: idle → open → half-closed (local or remote) → closed, with a
//! distinct reset terminal carrying the peer's error code. Reads wait for
//! the reader task's signal; writes wait for flow-control credit.

use std::{
    collections::VecDeque,
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use log::trace;
use tokio::sync::Notify;

use crate::sync::Mutex;

use super::connection::Shared;
use super::frame::{ErrorCode, DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};
use super::hpack;
use super::H2Error;

#[derive(Debug, Clone, Copy)]
enum StreamFailure {
    Reset(ErrorCode),
    Shutdown,
}

impl StreamFailure {
    fn to_error(self) -> H2Error {
        match self {
            StreamFailure::Reset(code) => H2Error::Reset(code),
            StreamFailure::Shutdown => H2Error::Shutdown,
        }
    }
}

pub(crate) struct StreamInner {
    id: u32,
    state: Mutex<StreamState>,
    read_notify: Notify,
    pub(super) write_notify: Notify,
}

struct StreamState {
    headers: VecDeque<Vec<hpack::Header>>,
    read_buf: BytesMut,
    /// Flow-control credit for DATA we may still send.
    send_window: i64,
    /// Bytes handed to the application but not yet returned to the peer's
    /// stream window.
    unacked_read: u64,
    local_closed: bool,
    remote_closed: bool,
    failure: Option<StreamFailure>,
}

impl StreamInner {
    pub(super) fn new(id: u32, send_window: i64) -> StreamInner {
        StreamInner {
            id,
            state: Mutex::new(StreamState {
                headers: VecDeque::new(),
                read_buf: BytesMut::new(),
                send_window,
                unacked_read: 0,
                local_closed: false,
                remote_closed: false,
                failure: None,
            }),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
        }
    }

    pub(super) fn receive_headers(&self, headers: Vec<hpack::Header>, end_stream: bool) {
        let mut state = self.state.lock();
        if state.failure.is_some() {
            return;
        }
        state.headers.push_back(headers);
        if end_stream {
            state.remote_closed = true;
        }
        drop(state);
        self.read_notify.notify_one();
    }

    pub(super) fn receive_data(&self, data: Bytes, end_stream: bool) {
        let mut state = self.state.lock();
        if state.failure.is_some() || state.remote_closed && !end_stream {
            return;
        }
        state.read_buf.extend_from_slice(&data);
        if end_stream {
            state.remote_closed = true;
        }
        drop(state);
        self.read_notify.notify_one();
    }

    pub(super) fn receive_reset(&self, error_code: ErrorCode) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(StreamFailure::Reset(error_code));
        }
        drop(state);
        self.read_notify.notify_one();
        self.write_notify.notify_one();
    }

    pub(super) fn close_with_error(&self, error: H2Error) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(match error {
                H2Error::Reset(code) => StreamFailure::Reset(code),
                _ => StreamFailure::Shutdown,
            });
        }
        drop(state);
        self.read_notify.notify_one();
        self.write_notify.notify_one();
    }

    pub(super) fn close_local(&self) {
        self.state.lock().local_closed = true;
    }

    pub(super) fn adjust_send_window(&self, delta: i64) {
        let mut state = self.state.lock();
        state.send_window += delta;
        drop(state);
        if delta > 0 {
            self.write_notify.notify_one();
        }
    }

    pub(super) fn grow_send_window(&self, increment: u32) -> Result<(), H2Error> {
        let mut state = self.state.lock();
        state.send_window += increment as i64;
        if state.send_window > MAX_WINDOW_SIZE as i64 {
            return Err(H2Error::protocol("stream window overflow"));
        }
        drop(state);
        self.write_notify.notify_one();
        Ok(())
    }

    pub(super) fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.local_closed && state.remote_closed && state.read_buf.is_empty()
    }
}

/// The handle a codec holds while an exchange runs on this stream.
pub(crate) struct H2Stream {
    inner: Arc<StreamInner>,
    conn: Arc<Shared>,
}

impl H2Stream {
    pub(super) fn new(inner: Arc<StreamInner>, conn: Arc<Shared>) -> H2Stream {
        H2Stream { inner, conn }
    }

    pub(crate) fn id(&self) -> u32 {
        self.inner.id
    }

    /// Wait for the next block of headers from the peer.
    pub(crate) async fn read_headers(&self) -> Result<Vec<hpack::Header>, H2Error> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(headers) = state.headers.pop_front() {
                    return Ok(headers);
                }
                if let Some(failure) = state.failure {
                    return Err(failure.to_error());
                }
                if state.remote_closed {
                    return Err(H2Error::protocol("stream closed without headers"));
                }
            }
            self.inner.read_notify.notified().await;
        }
    }

    /// Read up to `max` bytes of the peer's DATA. `Ok(None)` is clean end
    /// of stream. Returning bytes to the application also returns stream
    /// window to the peer once half the initial window is unacknowledged.
    pub(crate) async fn read_data(&self, max: usize) -> Result<Option<Bytes>, H2Error> {
        let (chunk, ack) = loop {
            {
                let mut state = self.inner.state.lock();
                if !state.read_buf.is_empty() {
                    let take = state.read_buf.len().min(max);
                    let chunk = state.read_buf.split_to(take).freeze();
                    state.unacked_read += take as u64;
                    let threshold = (DEFAULT_INITIAL_WINDOW_SIZE / 2) as u64;
                    let ack = if state.unacked_read >= threshold && !state.remote_closed {
                        let ack = state.unacked_read;
                        state.unacked_read = 0;
                        Some(ack as u32)
                    } else {
                        None
                    };
                    break (chunk, ack);
                }
                if let Some(failure) = state.failure {
                    return Err(failure.to_error());
                }
                if state.remote_closed {
                    return Ok(None);
                }
            }
            self.inner.read_notify.notified().await;
        };

        if let Some(increment) = ack {
            let mut writer = self.conn.writer.lock().await;
            writer.window_update(self.inner.id, increment).await?;
            writer.flush().await?;
        }

        if self.inner.is_done() {
            self.remove_from_table();
        }

        Ok(Some(chunk))
    }

    /// Write `data`, respecting min(stream window, connection window) and
    /// the peer's frame-size limit. Blocks while both windows are empty.
    pub(crate) async fn write_data(&self, data: &[u8], end_stream: bool) -> Result<(), H2Error> {
        let mut remaining = data;
        loop {
            if remaining.is_empty() {
                break;
            }

            // Register for connection-window growth before checking, so a
            // WINDOW_UPDATE between check and await is not lost.
            let conn_grew = self.conn.write_notify.notified();
            tokio::pin!(conn_grew);
            conn_grew.as_mut().enable();

            let allowance = {
                let mut conn = self.conn.state.lock();
                let mut state = self.inner.state.lock();
                if let Some(failure) = state.failure {
                    return Err(failure.to_error());
                }
                let frame_limit = conn.peer_settings.max_frame_size() as i64;
                let allowance = conn
                    .send_window
                    .min(state.send_window)
                    .min(frame_limit)
                    .min(remaining.len() as i64);
                if allowance > 0 {
                    conn.send_window -= allowance;
                    state.send_window -= allowance;
                }
                allowance
            };

            if allowance <= 0 {
                tokio::select! {
                    _ = &mut conn_grew => {}
                    _ = self.inner.write_notify.notified() => {}
                }
                continue;
            }

            let (chunk, rest) = remaining.split_at(allowance as usize);
            remaining = rest;
            let last = end_stream && remaining.is_empty();
            let mut writer = self.conn.writer.lock().await;
            writer.data(self.inner.id, last, chunk).await?;
            writer.flush().await?;
            if last {
                self.inner.close_local();
            }
        }

        if end_stream {
            self.finish().await?;
        }
        Ok(())
    }

    /// Close the request half. Idempotent.
    pub(crate) async fn finish(&self) -> Result<(), H2Error> {
        let already = {
            let state = self.inner.state.lock();
            state.local_closed || state.failure.is_some()
        };
        if !already {
            let mut writer = self.conn.writer.lock().await;
            writer.data(self.inner.id, true, b"").await?;
            writer.flush().await?;
            self.inner.close_local();
        }
        if self.inner.is_done() {
            self.remove_from_table();
        }
        Ok(())
    }

    /// Abort from a non-async context (cancellation).
    pub(crate) fn cancel(&self) {
        trace!("canceling http2 stream {}", self.inner.id);
        self.inner.receive_reset(ErrorCode::CANCEL);
        self.remove_from_table();
        spawn_reset(self.conn.clone(), self.inner.id);
    }

    fn remove_from_table(&self) {
        self.conn.state.lock().streams.remove(&self.inner.id);
    }
}

/// Send RST_STREAM(CANCEL) from wherever the caller happens to be; without
/// a runtime (teardown on a foreign thread) the peer learns from the socket
/// close instead.
fn spawn_reset(conn: Arc<Shared>, id: u32) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        let mut writer = conn.writer.lock().await;
        if writer.rst_stream(id, ErrorCode::CANCEL).await.is_ok() {
            let _ = writer.flush().await;
        }
    });
}

impl Drop for H2Stream {
    fn drop(&mut self) {
        if self.inner.is_done() {
            return;
        }
        let failed = self.inner.state.lock().failure.is_some();
        self.remove_from_table();
        if !failed {
            // Abandoned with halves still open: tell the peer to stop.
            self.inner.receive_reset(ErrorCode::CANCEL);
            spawn_reset(self.conn.clone(), self.inner.id);
        }
    }
}

impl std::fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Stream").field("id", &self.inner.id).finish()
    }
}
