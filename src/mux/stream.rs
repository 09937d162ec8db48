use std::io;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::PollSender;

use crate::common::Address;

use super::frame::{Cmd, Frame, StreamId};
use super::session::{Shared, StreamState};

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mux session closed")
}

/// A logical stream inside a mux [`Session`](super::Session).
///
/// Shutting down the write side sends FIN; the peer then reads EOF.
/// Dropping the stream also sends FIN if it was not sent yet.
pub struct MuxStream {
    id: StreamId,
    state: Arc<StreamState>,
    shared: Arc<Shared>,
    data_tx: PollSender<Frame>,
    fin_sent: bool,
}

impl MuxStream {
    pub(super) fn new(
        id: StreamId,
        state: Arc<StreamState>,
        shared: Arc<Shared>,
        data_tx: PollSender<Frame>,
    ) -> Self {
        Self {
            id,
            state,
            shared,
            data_tx,
            fin_sent: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Local address of the physical connection.
    pub fn local_addr(&self) -> &Address {
        &self.shared.local
    }

    /// Peer address of the physical connection.
    pub fn peer_addr(&self) -> &Address {
        &self.shared.peer
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let config = &this.shared.config;
        let mut recv = this.state.recv.lock();

        if let Some(chunk) = recv.chunks.front_mut() {
            let n = chunk.data.len().min(buf.remaining());
            buf.put_slice(&chunk.data[..n]);
            chunk.data.advance(n);

            let tokens = if chunk.data.is_empty() {
                let tokens = chunk.tokens;
                recv.chunks.pop_front();
                tokens
            } else {
                0
            };

            recv.num_read = recv.num_read.wrapping_add(n as u32);
            recv.incr = recv.incr.saturating_add(n as u32);
            let update = if config.version == 2 && recv.incr as usize >= config.max_stream_buffer / 2 {
                recv.incr = 0;
                Some(recv.num_read)
            } else {
                None
            };
            drop(recv);

            if tokens > 0 {
                this.shared.bucket.add_permits(tokens as usize);
            }
            if let Some(consumed) = update {
                let _ = this.shared.ctrl_tx.send(Frame::update(
                    config.version,
                    this.id,
                    consumed,
                    config.max_stream_buffer as u32,
                ));
            }
            return Poll::Ready(Ok(()));
        }

        if recv.fin {
            return Poll::Ready(Ok(()));
        }
        if this.shared.is_closed() {
            return Poll::Ready(Err(session_closed()));
        }
        recv.reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fin_sent || this.shared.is_closed() {
            return Poll::Ready(Err(session_closed()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let config = &this.shared.config;
        let mut n = buf.len().min(config.max_frame_size);
        if config.version == 2 {
            let mut window = this.state.send_window();
            if window == 0 {
                this.state.write_waker.register(cx.waker());
                window = this.state.send_window();
                if window == 0 {
                    if this.shared.is_closed() {
                        return Poll::Ready(Err(session_closed()));
                    }
                    return Poll::Pending;
                }
            }
            n = n.min(window);
        }

        ready!(this.data_tx.poll_reserve(cx)).map_err(|_| session_closed())?;
        let frame = Frame::data(config.version, this.id, Bytes::copy_from_slice(&buf[..n]));
        this.data_tx.send_item(frame).map_err(|_| session_closed())?;
        this.state.num_written.fetch_add(n as u32, Ordering::AcqRel);

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }
        ready!(this.data_tx.poll_reserve(cx)).map_err(|_| session_closed())?;
        let fin = Frame::new(this.shared.config.version, Cmd::Fin, this.id);
        this.data_tx.send_item(fin).map_err(|_| session_closed())?;
        this.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.remove_stream(self.id);
        if self.fin_sent || self.shared.is_closed() {
            return;
        }

        let fin = Frame::new(self.shared.config.version, Cmd::Fin, self.id);
        let tx = self.shared.data_tx.clone();
        if let Err(tokio::sync::mpsc::error::TrySendError::Full(fin)) = tx.try_send(fin) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = tx.send(fin).await;
                });
            }
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("peer", &self.shared.peer)
            .finish()
    }
}
