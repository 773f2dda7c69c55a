//! Virtual connections multiplexed over a session
//!
//! A [`SessionConn`] is a byte stream identified by a connection id inside one
//! session. Inbound bytes arrive through a per-connection channel fed by the
//! session's reader task; outbound bytes are framed and queued on the
//! session's shared frame channel.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::PollSender;
use tracing::trace;
use tunnelmesh_proto::{ConnId, Frame, CONN_WINDOW, MAX_DATA_PAYLOAD};

/// Events delivered to a virtual connection by the session reader
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// The far side reached its target
    Connected,
    Data(Bytes),
    /// The far side finished writing
    Eof,
    /// The far side tore the connection down, with an optional error
    Closed(Option<String>),
}

/// Credit this end may still send on a connection
#[derive(Debug)]
pub(crate) struct SendWindow {
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    credit: usize,
    closed: bool,
    waker: Option<Waker>,
}

impl SendWindow {
    fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                credit: CONN_WINDOW,
                closed: false,
                waker: None,
            }),
        }
    }

    fn grant(&self, credit: usize) {
        let waker = {
            let mut state = self.lock();
            state.credit = state.credit.saturating_add(credit);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn close(&self) {
        let waker = {
            let mut state = self.lock();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Available credit, or `None` once the connection is gone
    fn poll_credit(&self, cx: &mut Context<'_>) -> Poll<Option<usize>> {
        let mut state = self.lock();
        if state.closed {
            return Poll::Ready(None);
        }
        if state.credit > 0 {
            return Poll::Ready(Some(state.credit));
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn consume(&self, n: usize) {
        let mut state = self.lock();
        state.credit = state.credit.saturating_sub(n);
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The session reader's handle on one connection
#[derive(Debug, Clone)]
pub(crate) struct ConnSlot {
    events: mpsc::UnboundedSender<ConnEvent>,
    window: Arc<SendWindow>,
    /// Bytes delivered but not yet read
    buffered: Arc<AtomicUsize>,
}

impl ConnSlot {
    /// Queue inbound bytes. Returns `false` if the far side has sent past the
    /// window it was granted.
    pub(crate) fn deliver(&self, data: Bytes) -> bool {
        let len = data.len();
        if self.buffered.fetch_add(len, Ordering::AcqRel) + len > CONN_WINDOW {
            return false;
        }
        let _ = self.events.send(ConnEvent::Data(data));
        true
    }

    pub(crate) fn notify(&self, event: ConnEvent) {
        let _ = self.events.send(event);
    }

    /// Return send credit granted by the far side
    pub(crate) fn grant(&self, credit: usize) {
        self.window.grant(credit);
    }

    /// Tear the local end down. Pending writes fail.
    pub(crate) fn close(&self, reason: Option<String>) {
        self.window.close();
        let _ = self.events.send(ConnEvent::Closed(reason));
    }
}

/// Routing table from connection id to the connection's inbound side
#[derive(Debug, Default)]
pub(crate) struct ConnTable {
    conns: Mutex<HashMap<ConnId, ConnSlot>>,
}

impl ConnTable {
    fn insert(&self, id: ConnId, slot: ConnSlot) {
        self.lock().insert(id, slot);
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<ConnSlot> {
        self.lock().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: ConnId) -> Option<ConnSlot> {
        self.lock().remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<ConnSlot> {
        self.lock().drain().map(|(_, slot)| slot).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, ConnSlot>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A byte stream carried inside a session
pub struct SessionConn {
    id: ConnId,
    events: mpsc::UnboundedReceiver<ConnEvent>,
    frames: PollSender<Frame>,
    /// Unwrapped sender for frames emitted outside of a poll context
    frame_tx: mpsc::Sender<Frame>,
    table: Arc<ConnTable>,
    window: Arc<SendWindow>,
    buffered: Arc<AtomicUsize>,
    /// Bytes read since credit was last returned to the far side
    unacked: usize,
    pending: Bytes,
    read_closed: bool,
    write_closed: bool,
    /// Set once the far side has forgotten this connection
    remote_closed: bool,
}

impl std::fmt::Debug for SessionConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConn")
            .field("id", &self.id)
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

impl SessionConn {
    /// Register connection `id` in `table`
    pub(crate) fn open(id: ConnId, frame_tx: mpsc::Sender<Frame>, table: Arc<ConnTable>) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let window = Arc::new(SendWindow::new());
        let buffered = Arc::new(AtomicUsize::new(0));
        table.insert(
            id,
            ConnSlot {
                events: events_tx,
                window: window.clone(),
                buffered: buffered.clone(),
            },
        );

        Self {
            id,
            events,
            frames: PollSender::new(frame_tx.clone()),
            frame_tx,
            table,
            window,
            buffered,
            unacked: 0,
            pending: Bytes::new(),
            read_closed: false,
            write_closed: false,
            remote_closed: false,
        }
    }

    /// Connection id within the session
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Wait for the far side to acknowledge a dial.
    ///
    /// Returns the far side's error text if it refused.
    pub(crate) async fn wait_connected(&mut self) -> Result<(), String> {
        loop {
            match self.events.recv().await {
                Some(ConnEvent::Connected) => return Ok(()),
                Some(ConnEvent::Closed(reason)) => {
                    self.remote_closed = true;
                    self.read_closed = true;
                    self.write_closed = true;
                    return Err(reason.unwrap_or_else(|| "closed before connect".to_string()));
                }
                Some(ConnEvent::Data(data)) => {
                    trace!(conn_id = self.id, "Data before connect acknowledgement");
                    self.pending = if self.pending.is_empty() {
                        data
                    } else {
                        let mut joined = BytesMut::with_capacity(self.pending.len() + data.len());
                        joined.extend_from_slice(&self.pending);
                        joined.extend_from_slice(&data);
                        joined.freeze()
                    };
                }
                Some(ConnEvent::Eof) => self.read_closed = true,
                None => return Err("session closed".to_string()),
            }
        }
    }

    /// Acknowledge an inbound connect request
    pub(crate) async fn acknowledge(&self) -> io::Result<()> {
        self.frame_tx
            .send(Frame::connected(self.id))
            .await
            .map_err(|_| session_closed())
    }

    /// Tear the connection down, reporting `reason` to the far side
    pub(crate) fn abort(mut self, reason: &str) {
        self.remote_closed = true;
        self.send_detached(Frame::close(self.id, Some(reason)));
    }

    /// Account for `n` bytes handed to the reader, returning credit once
    /// half the window has been read
    fn release(&mut self, n: usize) {
        self.buffered.fetch_sub(n, Ordering::AcqRel);
        self.unacked += n;
        if self.unacked >= CONN_WINDOW / 2 && !self.remote_closed {
            let credit = std::mem::take(&mut self.unacked);
            self.send_detached(Frame::window(self.id, credit as u32));
        }
    }

    fn send_detached(&self, frame: Frame) {
        match self.frame_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.frame_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "session closed")
}

impl AsyncRead for SessionConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                this.release(n);
                return Poll::Ready(Ok(()));
            }

            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.events.poll_recv(cx)) {
                Some(ConnEvent::Data(data)) => this.pending = data,
                Some(ConnEvent::Connected) => {}
                Some(ConnEvent::Eof) => this.read_closed = true,
                Some(ConnEvent::Closed(reason)) => {
                    this.read_closed = true;
                    this.write_closed = true;
                    this.remote_closed = true;
                    if let Some(reason) = reason {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            reason,
                        )));
                    }
                }
                None => {
                    this.read_closed = true;
                    return Poll::Ready(Err(session_closed()));
                }
            }
        }
    }
}

impl AsyncWrite for SessionConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let Some(credit) = ready!(this.window.poll_credit(cx)) else {
            this.write_closed = true;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        };
        if ready!(this.frames.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(session_closed()));
        }

        let n = data.len().min(MAX_DATA_PAYLOAD).min(credit);
        this.window.consume(n);
        let frame = Frame::data(this.id, Bytes::copy_from_slice(&data[..n]));
        this.frames.send_item(frame).map_err(|_| session_closed())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task as soon as they are queued
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.frames.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(session_closed()));
        }
        this.frames
            .send_item(Frame::fin(this.id))
            .map_err(|_| session_closed())?;
        this.write_closed = true;

        Poll::Ready(Ok(()))
    }
}

impl Drop for SessionConn {
    fn drop(&mut self) {
        self.table.remove(self.id);
        if !self.remote_closed {
            self.send_detached(Frame::close(self.id, None));
        }
    }
}
