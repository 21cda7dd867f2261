//! Channel multiplexer over a single [`Transport`].
//!
//! Frame layout: `[u8 type][u32 BE channel][u32 BE length][payload]`.
//!
//! Channel 0 is the control channel and is open from the start. Every other
//! channel begins with OPEN (carrying a CBOR [`TunnelOpen`]) and is answered by
//! OPEN_OK or OPEN_FAIL. Data flows in DATA frames; EOF half-closes one
//! direction, RESET aborts both. A [`MuxStream`] that is dropped flushes what
//! was written, sends EOF and then RESET, so the peer learns that nobody
//! reads the channel anymore and releases it. Each direction has a credit window of
//! [`WINDOW`] bytes which the receiver replenishes with WINDOW frames after
//! the bytes were handed to the application, so a stalled channel never
//! blocks the shared transport.
//!
//! Each channel is served by one task that is tracked by the connection and
//! joined by [`MuxConn::wait`]. The channel table is only locked for short
//! bookkeeping, never across I/O.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::{ImpError, ImpResult};
use crate::messages::{RemoteError, RemoteErrorKind, TunnelOpen, TunnelReply};
use crate::transport::Transport;

/// Id of the control channel.
pub const CONTROL_CHANNEL: u32 = 0;

/// Largest payload of a single frame (64 KiB).
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Credit window per channel and direction (256 KiB).
pub const WINDOW: u32 = 256 * 1024;

const HEADER_LEN: usize = 9;

// ── Frames ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    Open = 1,
    OpenOk = 2,
    OpenFail = 3,
    Data = 4,
    Eof = 5,
    Reset = 6,
    Window = 7,
}

impl TryFrom<u8> for FrameType {
    type Error = ImpError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::OpenOk),
            3 => Ok(FrameType::OpenFail),
            4 => Ok(FrameType::Data),
            5 => Ok(FrameType::Eof),
            6 => Ok(FrameType::Reset),
            7 => Ok(FrameType::Window),
            other => Err(ImpError::Protocol(format!("unknown frame type {other:#04x}"))),
        }
    }
}

#[derive(Debug)]
struct Frame {
    kind: FrameType,
    channel: u32,
    payload: Vec<u8>,
}

impl Frame {
    fn new(kind: FrameType, channel: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            channel,
            payload,
        }
    }

    fn empty(kind: FrameType, channel: u32) -> Self {
        Self::new(kind, channel, Vec::new())
    }

    fn window(channel: u32, credit: u32) -> Self {
        Self::new(FrameType::Window, channel, credit.to_be_bytes().to_vec())
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0] = self.kind as u8;
        h[1..5].copy_from_slice(&self.channel.to_be_bytes());
        h[5..9].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        h
    }

    async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.header()).await?;
        w.write_all(&self.payload).await
    }

    /// Read the next frame; `None` on a clean EOF between frames.
    async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> ImpResult<Option<Frame>> {
        let mut h = [0u8; HEADER_LEN];
        if r.read(&mut h[..1]).await? == 0 {
            return Ok(None);
        }
        r.read_exact(&mut h[1..]).await?;

        let kind = FrameType::try_from(h[0])?;
        let channel = u32::from_be_bytes([h[1], h[2], h[3], h[4]]);
        let len = u32::from_be_bytes([h[5], h[6], h[7], h[8]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(ImpError::Protocol(format!(
                "frame payload of {len} bytes exceeds limit of {MAX_PAYLOAD}"
            )));
        }
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        Ok(Some(Frame::new(kind, channel, payload)))
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// Which end of the connection this is; decides channel id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Allocates odd channel ids.
    Master,
    /// Allocates even channel ids.
    Imp,
}

impl Side {
    fn first_id(self) -> u32 {
        match self {
            Side::Master => 1,
            Side::Imp => 2,
        }
    }

    fn owns(self, id: u32) -> bool {
        id != CONTROL_CHANNEL && (id % 2 == 1) == (self == Side::Master)
    }
}

enum Inbound {
    Data(Vec<u8>),
    Eof,
    Reset,
}

type OpenResult = Result<TunnelReply, RemoteError>;

struct ChannelEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    credit: Arc<Semaphore>,
    outstanding: Arc<AtomicI64>,
    cancel: CancellationToken,
    /// Stops sending once the peer reset the channel; child of `cancel`.
    outbound: CancellationToken,
    pending_open: Option<oneshot::Sender<OpenResult>>,
}

/// What a channel task needs once the channel is established.
struct ChannelParts {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    credit: Arc<Semaphore>,
    outstanding: Arc<AtomicI64>,
    cancel: CancellationToken,
    outbound: CancellationToken,
}

struct Inner {
    side: Side,
    next_id: AtomicU32,
    channels: Mutex<HashMap<u32, ChannelEntry>>,
    frames: mpsc::UnboundedSender<Frame>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<IncomingChannel>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingChannel>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    torn_down: AtomicBool,
    remote: String,
}

/// A multiplexed connection. Cheap to clone; all clones share one transport.
#[derive(Clone)]
pub struct MuxConn {
    inner: Arc<Inner>,
}

impl fmt::Debug for MuxConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConn")
            .field("side", &self.inner.side)
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MuxConn {
    /// Start multiplexing over `transport`.
    ///
    /// Returns the connection and the stream of the control channel. The
    /// connection is torn down when `parent` is cancelled.
    pub fn start(transport: Transport, side: Side, parent: &CancellationToken) -> (Self, MuxStream) {
        let remote = transport.remote().to_string();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            side,
            next_id: AtomicU32::new(side.first_id()),
            channels: Mutex::new(HashMap::new()),
            frames: frames_tx,
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
            torn_down: AtomicBool::new(false),
            remote,
        });
        let conn = MuxConn { inner };

        let (reader, writer) = tokio::io::split(transport);
        conn.inner.tracker.spawn(conn.clone().read_loop(reader));
        conn.inner.tracker.spawn(conn.clone().write_loop(writer, frames_rx));

        let control = match conn.register(CONTROL_CHANNEL, None) {
            Ok(parts) => conn.run_channel(CONTROL_CHANNEL, parts),
            // A fresh connection cannot be torn down yet; hand out a dead stream anyway.
            Err(_) => MuxStream::detached(CONTROL_CHANNEL),
        };
        debug!(side = ?side, remote = %conn.inner.remote, "multiplexer started");
        (conn, control)
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Description of the transport's remote end.
    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn is_closed(&self) -> bool {
        self.inner.torn_down.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Number of channels currently registered, the control channel included.
    pub fn channel_count(&self) -> usize {
        self.lock_channels().len()
    }

    /// Open a new channel towards the peer.
    ///
    /// Fails with the peer's error when it rejects the channel and with
    /// `ConnectionLost` when the connection goes away first.
    pub async fn open(&self, open: TunnelOpen) -> ImpResult<(TunnelReply, MuxStream)> {
        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let payload = cbor_encode(&open)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let parts = self.register(id, Some(reply_tx))?;

        debug!(channel = id, kind = %open.kind(), "opening channel");
        self.send(Frame::new(FrameType::Open, id, payload))?;

        let reply = tokio::select! {
            _ = self.inner.cancel.cancelled() => None,
            r = reply_rx => r.ok(),
        };
        match reply {
            Some(Ok(reply)) => Ok((reply, self.run_channel(id, parts))),
            Some(Err(remote)) => {
                debug!(channel = id, error = %remote.message, "channel rejected by peer");
                Err(remote.into())
            }
            None => {
                self.forget(id);
                Err(ImpError::ConnectionLost)
            }
        }
    }

    /// Wait for the next channel opened by the peer.
    ///
    /// Returns `None` once the connection is torn down.
    pub async fn accept(&self) -> Option<IncomingChannel> {
        let mut rx = self.inner.incoming_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => {
                reject_queued(&mut rx);
                None
            }
            ch = rx.recv() => ch,
        }
    }

    /// Tear the connection down. Frames queued so far are still written.
    pub fn close(&self) {
        self.teardown("closed locally");
    }

    /// Wait until every task of this connection has finished.
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    // ── internals ────────────────────────────────────────────────────

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<u32, ChannelEntry>> {
        self.inner.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, frame: Frame) -> ImpResult<()> {
        self.inner
            .frames
            .send(frame)
            .map_err(|_| ImpError::ConnectionLost)
    }

    fn register(
        &self,
        id: u32,
        pending_open: Option<oneshot::Sender<OpenResult>>,
    ) -> ImpResult<ChannelParts> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(WINDOW as usize));
        let outstanding = Arc::new(AtomicI64::new(0));
        let cancel = self.inner.cancel.child_token();
        let outbound = cancel.child_token();

        let mut channels = self.lock_channels();
        if self.is_closed() {
            return Err(ImpError::ConnectionLost);
        }
        channels.insert(
            id,
            ChannelEntry {
                inbound: inbound_tx,
                credit: credit.clone(),
                outstanding: outstanding.clone(),
                cancel: cancel.clone(),
                outbound: outbound.clone(),
                pending_open,
            },
        );
        Ok(ChannelParts {
            inbound: inbound_rx,
            credit,
            outstanding,
            cancel,
            outbound,
        })
    }

    fn forget(&self, id: u32) {
        if let Some(entry) = self.lock_channels().remove(&id) {
            entry.cancel.cancel();
        }
    }

    /// Spawn the task serving an established channel and return its user end.
    fn run_channel(&self, id: u32, parts: ChannelParts) -> MuxStream {
        let (user, mux_end) = tokio::io::duplex(MAX_PAYLOAD);
        let released = CancellationToken::new();
        let conn = self.clone();
        let dropped = released.clone();
        self.inner.tracker.spawn(async move {
            let (rd, wr) = tokio::io::split(mux_end);
            let ChannelParts {
                inbound,
                credit,
                outstanding,
                cancel,
                outbound,
            } = parts;
            tokio::join!(
                conn.pump_out(id, rd, credit, &outbound),
                conn.pump_in(id, wr, inbound, outstanding, &cancel, &dropped),
            );
            if dropped.is_cancelled() && !cancel.is_cancelled() {
                // Queued after the final EOF, so everything written still arrives.
                let _ = conn.send(Frame::empty(FrameType::Reset, id));
                debug!(channel = id, "stream dropped, channel reset");
            }
            conn.forget(id);
            trace!(channel = id, "channel finished");
        });
        MuxStream {
            id,
            inner: user,
            _release: released.drop_guard(),
        }
    }

    /// Application → peer.
    async fn pump_out(
        &self,
        id: u32,
        mut rd: ReadHalf<DuplexStream>,
        credit: Arc<Semaphore>,
        cancel: &CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                r = rd.read(&mut buf) => r,
            };
            let n = match read {
                Ok(0) => {
                    let _ = self.send(Frame::empty(FrameType::Eof, id));
                    return;
                }
                Ok(n) => n,
                Err(_) => {
                    let _ = self.send(Frame::empty(FrameType::Reset, id));
                    return;
                }
            };
            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                p = credit.acquire_many(n as u32) => p,
            };
            match permit {
                Ok(p) => p.forget(),
                Err(_) => return,
            }
            if self
                .send(Frame::new(FrameType::Data, id, buf[..n].to_vec()))
                .is_err()
            {
                return;
            }
        }
    }

    /// Peer → application.
    async fn pump_in(
        &self,
        id: u32,
        mut wr: WriteHalf<DuplexStream>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        outstanding: Arc<AtomicI64>,
        cancel: &CancellationToken,
        dropped: &CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                // Nobody reads anymore.
                _ = dropped.cancelled() => return,
                m = inbound.recv() => m,
            };
            match next {
                Some(Inbound::Data(bytes)) => {
                    let written = tokio::select! {
                        _ = cancel.cancelled() => return,
                        r = wr.write_all(&bytes) => r,
                    };
                    if written.is_err() {
                        // The application dropped its end; the channel task resets.
                        return;
                    }
                    outstanding.fetch_sub(bytes.len() as i64, Ordering::AcqRel);
                    let _ = self.send(Frame::window(id, bytes.len() as u32));
                }
                Some(Inbound::Eof) => {
                    let _ = wr.shutdown().await;
                    return;
                }
                Some(Inbound::Reset) | None => {
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    async fn read_loop(self, mut reader: ReadHalf<Transport>) {
        let reason = loop {
            let frame = tokio::select! {
                _ = self.inner.cancel.cancelled() => break None,
                f = Frame::read_from(&mut reader) => f,
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = self.dispatch(frame) {
                        warn!(remote = %self.inner.remote, error = %e, "multiplexer protocol violation");
                        break Some("protocol violation");
                    }
                }
                Ok(None) => break Some("transport reached EOF"),
                Err(ImpError::Io(e)) if crate::error::is_closed_error(&e) => {
                    break Some("transport closed")
                }
                Err(e) => {
                    warn!(remote = %self.inner.remote, error = %e, "cannot read from transport");
                    break Some("transport failed");
                }
            }
        };
        self.teardown(reason.unwrap_or("cancelled"));
    }

    async fn write_loop(
        self,
        writer: WriteHalf<Transport>,
        mut frames: mpsc::UnboundedReceiver<Frame>,
    ) {
        let mut writer = BufWriter::new(writer);
        let result: io::Result<()> = async {
            loop {
                let frame = tokio::select! {
                    biased;
                    f = frames.recv() => match f {
                        Some(f) => f,
                        None => return Ok(()),
                    },
                    _ = self.inner.cancel.cancelled() => break,
                };
                frame.write_to(&mut writer).await?;
                while let Ok(more) = frames.try_recv() {
                    more.write_to(&mut writer).await?;
                }
                writer.flush().await?;
            }
            // Torn down: write out whatever was queued before, then half-close.
            while let Ok(frame) = frames.try_recv() {
                frame.write_to(&mut writer).await?;
            }
            writer.flush().await?;
            writer.shutdown().await
        }
        .await;

        match result {
            Ok(()) => {}
            Err(e) if crate::error::is_closed_error(&e) => {
                debug!(remote = %self.inner.remote, "transport closed while writing");
            }
            Err(e) => warn!(remote = %self.inner.remote, error = %e, "cannot write to transport"),
        }
        self.teardown("transport write side finished");
    }

    fn dispatch(&self, frame: Frame) -> ImpResult<()> {
        trace!(kind = ?frame.kind, channel = frame.channel, len = frame.payload.len(), "frame");
        let id = frame.channel;
        match frame.kind {
            FrameType::Open => self.on_open(id, &frame.payload),
            FrameType::OpenOk => {
                let reply: TunnelReply = cbor_decode(&frame.payload)?;
                let pending = self
                    .lock_channels()
                    .get_mut(&id)
                    .and_then(|e| e.pending_open.take());
                let Some(pending) = pending else {
                    return Err(ImpError::Protocol(format!(
                        "OPEN_OK for channel {id} which is not being opened"
                    )));
                };
                if pending.send(Ok(reply)).is_err() {
                    // The opener gave up in the meantime.
                    self.forget(id);
                    let _ = self.send(Frame::empty(FrameType::Reset, id));
                }
                Ok(())
            }
            FrameType::OpenFail => {
                let error: RemoteError = cbor_decode(&frame.payload)?;
                let entry = self.lock_channels().remove(&id);
                match entry.and_then(|mut e| e.pending_open.take()) {
                    Some(pending) => {
                        let _ = pending.send(Err(error));
                        Ok(())
                    }
                    None => Err(ImpError::Protocol(format!(
                        "OPEN_FAIL for channel {id} which is not being opened"
                    ))),
                }
            }
            FrameType::Data => {
                let channels = self.lock_channels();
                let Some(entry) = channels.get(&id) else {
                    trace!(channel = id, "data for unknown channel dropped");
                    return Ok(());
                };
                let len = frame.payload.len() as i64;
                if entry.outstanding.fetch_add(len, Ordering::AcqRel) + len > WINDOW as i64 {
                    return Err(ImpError::Protocol(format!(
                        "peer exceeded the window of channel {id}"
                    )));
                }
                let _ = entry.inbound.send(Inbound::Data(frame.payload));
                Ok(())
            }
            FrameType::Eof => {
                if let Some(entry) = self.lock_channels().get(&id) {
                    let _ = entry.inbound.send(Inbound::Eof);
                }
                Ok(())
            }
            FrameType::Reset => {
                if let Some(entry) = self.lock_channels().get(&id) {
                    // Data queued before the reset is still handed to the reader.
                    entry.outbound.cancel();
                    let _ = entry.inbound.send(Inbound::Reset);
                }
                Ok(())
            }
            FrameType::Window => {
                let credit = <[u8; 4]>::try_from(frame.payload.as_slice())
                    .map(u32::from_be_bytes)
                    .map_err(|_| ImpError::Protocol("malformed WINDOW frame".into()))?;
                if let Some(entry) = self.lock_channels().get(&id) {
                    if entry.credit.available_permits() + credit as usize > WINDOW as usize {
                        return Err(ImpError::Protocol(format!(
                            "window of channel {id} overflowed"
                        )));
                    }
                    entry.credit.add_permits(credit as usize);
                }
                Ok(())
            }
        }
    }

    fn on_open(&self, id: u32, payload: &[u8]) -> ImpResult<()> {
        if id == CONTROL_CHANNEL || self.inner.side.owns(id) {
            return Err(ImpError::Protocol(format!(
                "peer opened channel {id} outside its id range"
            )));
        }
        if self.lock_channels().contains_key(&id) {
            return Err(ImpError::Protocol(format!("channel {id} opened twice")));
        }
        let open: TunnelOpen = cbor_decode(payload)?;
        let parts = self.register(id, None)?;
        debug!(channel = id, kind = %open.kind(), "peer opened channel");

        let incoming = IncomingChannel {
            id,
            open,
            conn: self.clone(),
            parts: Some(parts),
        };
        let tx = self
            .inner
            .incoming_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match tx {
            // A failed send drops the channel, which rejects it.
            Some(tx) => {
                let _ = tx.send(incoming);
            }
            None => drop(incoming),
        }
        Ok(())
    }

    fn teardown(&self, reason: &str) {
        if self.inner.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(remote = %self.inner.remote, reason, "tearing down multiplexer");
        self.inner.cancel.cancel();

        let entries: Vec<ChannelEntry> = self.lock_channels().drain().map(|(_, e)| e).collect();
        for entry in entries {
            // Dropping a pending opener makes it fail with ConnectionLost.
            entry.cancel.cancel();
        }
        self.inner
            .incoming_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // A pending accept drains the queue itself once it sees the cancellation.
        if let Ok(mut rx) = self.inner.incoming_rx.try_lock() {
            reject_queued(&mut rx);
        }
    }
}

/// Drop channels nobody will accept anymore; each one rejects itself.
fn reject_queued(rx: &mut mpsc::UnboundedReceiver<IncomingChannel>) {
    while let Ok(incoming) = rx.try_recv() {
        drop(incoming);
    }
}

// ── Incoming channels ────────────────────────────────────────────────

/// A channel the peer wants to open. Dropping it rejects the channel.
pub struct IncomingChannel {
    id: u32,
    open: TunnelOpen,
    conn: MuxConn,
    parts: Option<ChannelParts>,
}

impl IncomingChannel {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// What the peer asked for.
    pub fn request(&self) -> &TunnelOpen {
        &self.open
    }

    /// Confirm the channel and start moving bytes.
    pub fn accept(mut self, reply: TunnelReply) -> ImpResult<MuxStream> {
        let parts = self.parts.take().ok_or(ImpError::ConnectionLost)?;
        let payload = cbor_encode(&reply)?;
        self.conn.send(Frame::new(FrameType::OpenOk, self.id, payload))?;
        Ok(self.conn.run_channel(self.id, parts))
    }

    /// Refuse the channel with `error`.
    pub fn reject(mut self, error: RemoteError) {
        self.parts.take();
        self.send_reject(&error);
    }

    fn send_reject(&self, error: &RemoteError) {
        self.conn.forget(self.id);
        if let Ok(payload) = cbor_encode(error) {
            let _ = self
                .conn
                .send(Frame::new(FrameType::OpenFail, self.id, payload));
        }
    }
}

impl Drop for IncomingChannel {
    fn drop(&mut self) {
        if self.parts.take().is_some() {
            self.send_reject(&RemoteError::new(
                RemoteErrorKind::Unsupported,
                format!("{} channels are not accepted here", self.open.kind()),
            ));
        }
    }
}

impl fmt::Debug for IncomingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingChannel")
            .field("id", &self.id)
            .field("open", &self.open)
            .finish()
    }
}

// ── Streams ──────────────────────────────────────────────────────────

/// The application end of one channel.
///
/// `shutdown` half-closes (the peer reads EOF, reading continues). Dropping
/// the stream delivers what was already written, then resets the channel on
/// both sides. Once the channel is reset or the connection is torn down,
/// reads return EOF and writes fail with `BrokenPipe`.
pub struct MuxStream {
    id: u32,
    inner: DuplexStream,
    _release: DropGuard,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// A stream whose other end is already gone.
    fn detached(id: u32) -> Self {
        let (inner, _) = tokio::io::duplex(1);
        Self {
            id,
            inner,
            _release: CancellationToken::new().drop_guard(),
        }
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).finish()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
