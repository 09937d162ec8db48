//! Mux session: one physical connection, many logical streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::common::{Address, Conn, Stream};
use crate::error::{Error, Result};

use super::frame::{Cmd, Frame, StreamId};
use super::stream::MuxStream;
use super::Config;

const ACCEPT_BACKLOG: usize = 1024;
const DATA_QUEUE_SIZE: usize = 64;
/// Window assumed for the peer until its first UPD arrives.
const INITIAL_PEER_WINDOW: u32 = 262_144;

/// Buffered data waiting to be read from a stream.
pub(super) struct Chunk {
    pub data: Bytes,
    /// Receive-buffer tokens to return once the chunk is fully read
    pub tokens: u32,
}

#[derive(Default)]
pub(super) struct RecvState {
    pub chunks: VecDeque<Chunk>,
    /// Peer sent FIN
    pub fin: bool,
    pub reader: Option<Waker>,
    /// Total bytes read, wrapping (version 2 accounting)
    pub num_read: u32,
    /// Bytes read since the last window update
    pub incr: u32,
}

/// State of one stream shared between the recv loop and the [`MuxStream`] handle.
pub(super) struct StreamState {
    pub recv: Mutex<RecvState>,
    pub num_written: AtomicU32,
    pub peer_consumed: AtomicU32,
    pub peer_window: AtomicU32,
    pub write_waker: AtomicWaker,
}

impl StreamState {
    fn new() -> Self {
        Self {
            recv: Mutex::new(RecvState::default()),
            num_written: AtomicU32::new(0),
            peer_consumed: AtomicU32::new(0),
            peer_window: AtomicU32::new(INITIAL_PEER_WINDOW),
            write_waker: AtomicWaker::new(),
        }
    }

    /// Bytes the peer is still willing to take (version 2).
    pub fn send_window(&self) -> usize {
        let inflight = self
            .num_written
            .load(Ordering::Acquire)
            .wrapping_sub(self.peer_consumed.load(Ordering::Acquire)) as i32;
        let win = self.peer_window.load(Ordering::Acquire) as i32 - inflight;
        win.max(0) as usize
    }

    fn push(&self, chunk: Chunk) {
        let mut recv = self.recv.lock();
        recv.chunks.push_back(chunk);
        if let Some(w) = recv.reader.take() {
            w.wake();
        }
    }

    fn finish(&self) {
        let mut recv = self.recv.lock();
        recv.fin = true;
        if let Some(w) = recv.reader.take() {
            w.wake();
        }
    }

    fn wake_all(&self) {
        if let Some(w) = self.recv.lock().reader.take() {
            w.wake();
        }
        self.write_waker.wake();
    }
}

/// Session state shared by the background loops and every stream.
pub(super) struct Shared {
    pub config: Config,
    pub streams: Mutex<HashMap<StreamId, Arc<StreamState>>>,
    /// Session-wide receive buffer, one permit per byte
    pub bucket: Semaphore,
    /// NOP and UPD frames, sent ahead of queued data
    pub ctrl_tx: mpsc::UnboundedSender<Frame>,
    /// SYN, PSH and FIN frames, in stream order
    pub data_tx: mpsc::Sender<Frame>,
    pub die: CancellationToken,
    pub local: Address,
    pub peer: Address,
    data_ready: AtomicBool,
}

impl Shared {
    pub fn close(&self) {
        if self.die.is_cancelled() {
            return;
        }
        self.die.cancel();
        let streams: Vec<_> = self.streams.lock().values().cloned().collect();
        for s in streams {
            s.wake_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.die.is_cancelled()
    }

    /// Forget a stream and give back the tokens of its unread data.
    pub fn remove_stream(&self, id: StreamId) {
        let state = self.streams.lock().remove(&id);
        if let Some(state) = state {
            let tokens: usize = state
                .recv
                .lock()
                .chunks
                .drain(..)
                .map(|c| c.tokens as usize)
                .sum();
            if tokens > 0 {
                self.bucket.add_permits(tokens);
            }
        }
    }

    fn new_stream(self: &Arc<Self>, id: StreamId) -> MuxStream {
        let state = Arc::new(StreamState::new());
        self.streams.lock().insert(id, state.clone());
        MuxStream::new(id, state, self.clone(), PollSender::new(self.data_tx.clone()))
    }
}

/// A multiplexed session over one physical connection.
///
/// Dropping the session closes the physical connection and every stream on it.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_id: AtomicU32,
}

impl Session {
    /// Start the server side of a session.
    ///
    /// With a `handshake_timeout`, the peer must send its first frame within
    /// that time or the session is torn down.
    pub fn server(conn: Conn, config: &Config, handshake_timeout: Option<Duration>) -> Result<Self> {
        Self::start(conn, config, false, handshake_timeout)
    }

    /// Start the client side of a session.
    pub fn client(conn: Conn, config: &Config) -> Result<Self> {
        Self::start(conn, config, true, None)
    }

    fn start(
        conn: Conn,
        config: &Config,
        client: bool,
        handshake_timeout: Option<Duration>,
    ) -> Result<Self> {
        config.verify()?;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_SIZE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            config: config.clone(),
            streams: Mutex::new(HashMap::new()),
            bucket: Semaphore::new(config.max_receive_buffer),
            ctrl_tx,
            data_tx,
            die: CancellationToken::new(),
            local: conn.local,
            peer: conn.peer,
            data_ready: AtomicBool::new(false),
        });

        let (reader, writer) = tokio::io::split(conn.stream);
        tokio::spawn(recv_loop(shared.clone(), reader, accept_tx, handshake_timeout));
        tokio::spawn(send_loop(shared.clone(), writer, ctrl_rx, data_rx));
        if !config.keepalive_disabled {
            tokio::spawn(keepalive(shared.clone()));
        }

        Ok(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_id: AtomicU32::new(if client { 1 } else { 0 }),
        })
    }

    /// Wait for the peer to open a stream.
    ///
    /// Fails once the session is closed, whatever the cause.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            stream = rx.recv() => stream.ok_or_else(|| Error::Mux("session closed".into())),
            _ = self.shared.die.cancelled() => Err(Error::Mux("session closed".into())),
        }
    }

    /// Open a new stream to the peer.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.shared.is_closed() {
            return Err(Error::Mux("session closed".into()));
        }
        let id = self.next_id.fetch_add(2, Ordering::Relaxed).wrapping_add(2);
        let stream = self.shared.new_stream(id);

        let syn = Frame::new(self.shared.config.version, Cmd::Syn, id);
        tokio::select! {
            r = self.shared.data_tx.send(syn) => r.map_err(|_| Error::Mux("session closed".into()))?,
            _ = self.shared.die.cancelled() => return Err(Error::Mux("session closed".into())),
        }
        Ok(stream)
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves when the session has been closed.
    pub async fn closed(&self) {
        self.shared.die.cancelled().await
    }

    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }

    pub fn local_addr(&self) -> &Address {
        &self.shared.local
    }

    pub fn peer_addr(&self) -> &Address {
        &self.shared.peer
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn recv_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<Stream>,
    accept_tx: mpsc::Sender<MuxStream>,
    handshake_timeout: Option<Duration>,
) {
    let result = tokio::select! {
        _ = shared.die.cancelled() => Ok(()),
        r = recv_frames(&shared, &mut reader, &accept_tx, handshake_timeout) => r,
    };
    if let Err(e) = result {
        debug!(peer = %shared.peer, "mux session ended: {}", e);
    }
    shared.close();
}

async fn recv_frames(
    shared: &Arc<Shared>,
    reader: &mut ReadHalf<Stream>,
    accept_tx: &mpsc::Sender<MuxStream>,
    handshake_timeout: Option<Duration>,
) -> Result<()> {
    if let Some(t) = handshake_timeout.filter(|t| !t.is_zero()) {
        let handshake = async {
            let frame = tokio::time::timeout(t, Frame::read_from(reader))
                .await
                .map_err(|_| Error::Mux("handshake timeout".into()))??;
            handle_frame(shared, frame, accept_tx).await
        };
        if let Err(e) = handshake.await {
            warn!(peer = %shared.peer, "mux handshake failed: {}", e);
            return Err(e);
        }
    }

    loop {
        let frame = Frame::read_from(reader).await?;
        handle_frame(shared, frame, accept_tx).await?;
    }
}

async fn handle_frame(
    shared: &Arc<Shared>,
    frame: Frame,
    accept_tx: &mpsc::Sender<MuxStream>,
) -> Result<()> {
    if frame.version != shared.config.version {
        return Err(Error::Mux(format!(
            "invalid protocol version {}, expected {}",
            frame.version, shared.config.version
        )));
    }
    shared.data_ready.store(true, Ordering::Release);
    trace!(cmd = ?frame.cmd, sid = frame.sid, len = frame.data.len(), "mux frame");

    match frame.cmd {
        Cmd::Nop => {}
        Cmd::Syn => {
            if shared.streams.lock().contains_key(&frame.sid) {
                return Ok(());
            }
            let stream = shared.new_stream(frame.sid);
            // Nobody accepting (client side): the stream is dropped and FIN'd
            let _ = accept_tx.send(stream).await;
        }
        Cmd::Fin => {
            let state = shared.streams.lock().get(&frame.sid).cloned();
            if let Some(state) = state {
                state.finish();
            }
        }
        Cmd::Psh => {
            if frame.data.is_empty() {
                return Ok(());
            }
            let state = shared.streams.lock().get(&frame.sid).cloned();
            if let Some(state) = state {
                let tokens = frame.data.len().min(shared.config.max_receive_buffer) as u32;
                shared
                    .bucket
                    .acquire_many(tokens)
                    .await
                    .map_err(|_| Error::Mux("receive buffer closed".into()))?
                    .forget();
                state.push(Chunk {
                    data: frame.data,
                    tokens,
                });
            }
        }
        Cmd::Upd => {
            let (consumed, window) = frame.parse_update()?;
            let state = shared.streams.lock().get(&frame.sid).cloned();
            if let Some(state) = state {
                state.peer_consumed.store(consumed, Ordering::Release);
                state.peer_window.store(window, Ordering::Release);
                state.write_waker.wake();
            }
        }
    }
    Ok(())
}

async fn send_loop(
    shared: Arc<Shared>,
    mut writer: WriteHalf<Stream>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Frame>,
    mut data_rx: mpsc::Receiver<Frame>,
) {
    let mut buf = BytesMut::new();
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.die.cancelled() => break,
            Some(f) = ctrl_rx.recv() => f,
            Some(f) = data_rx.recv() => f,
            else => break,
        };

        buf.clear();
        frame.encode(&mut buf);
        // Coalesce whatever else is already queued into one write
        while buf.len() < shared.config.max_frame_size {
            match data_rx.try_recv() {
                Ok(f) => f.encode(&mut buf),
                Err(_) => break,
            }
        }

        let written = tokio::select! {
            _ = shared.die.cancelled() => break,
            r = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => r,
        };
        if let Err(e) = written {
            debug!(peer = %shared.peer, "mux write: {}", e);
            break;
        }
    }

    shared.close();
    let _ = writer.shutdown().await;
}

async fn keepalive(shared: Arc<Shared>) {
    let cfg = &shared.config;
    let mut ping = interval_at(Instant::now() + cfg.keepalive_interval, cfg.keepalive_interval);
    let mut check = interval_at(Instant::now() + cfg.keepalive_timeout, cfg.keepalive_timeout);

    loop {
        tokio::select! {
            _ = shared.die.cancelled() => return,
            _ = ping.tick() => {
                let _ = shared.ctrl_tx.send(Frame::new(cfg.version, Cmd::Nop, 0));
            }
            _ = check.tick() => {
                // A full receive buffer stalls reading; that is not a dead peer
                let stalled = shared.bucket.available_permits() == 0;
                if !shared.data_ready.swap(false, Ordering::AcqRel) && !stalled {
                    debug!(peer = %shared.peer, "mux keep-alive timeout");
                    shared.close();
                    return;
                }
            }
        }
    }
}
