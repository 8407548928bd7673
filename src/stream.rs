use crate::{
    error::{Result, SmuxError},
    frame::Frame,
    session::SessionInner,
};
use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, ready},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

/// Lifecycle of a stream as seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open.
    Open,
    /// We sent CLOSE (via `write_once` or `shutdown`); reads continue.
    HalfClosedLocal,
    /// The peer sent CLOSE; buffered data can still be read and we may
    /// still write.
    HalfClosedRemote,
    /// Terminal.
    Closed,
}

/// Flags shared between a [`Stream`] and the session's demultiplexer.
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    released: AtomicBool,
}

impl StreamShared {
    /// Must be called before the stream's data sender is dropped, so a reader
    /// that sees the channel end knows it was a peer CLOSE.
    pub(crate) fn mark_read_closed(&self) {
        self.read_closed.store(true, Ordering::Release);
    }

    fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    fn is_write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    /// Returns true if the write side was still open.
    fn close_write(&self) -> bool {
        !self.write_closed.swap(true, Ordering::AcqRel)
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// A multiplexed stream within a smux session.
///
/// Reading and writing go through [`AsyncRead`] and [`AsyncWrite`]; every
/// `poll_write` emits at most one DATA frame of up to `max_frame_size`
/// bytes. `shutdown` and [`Stream::write_once`] send CLOSE, after which
/// further writes fail with [`SmuxError::StreamClosed`].
///
/// Reads return 0 once the peer's CLOSE has been consumed or after
/// [`Stream::close`]. If the session is torn down first, reads fail with
/// [`SmuxError::SessionClosed`] wrapped in an [`io::Error`].
pub struct Stream {
    stream_id: u32,
    data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Chunk being read and the offset of its first unread byte.
    pending: Option<(Vec<u8>, usize)>,
    sink: PollSender<Frame>,
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
}

impl Stream {
    pub(crate) fn new(
        stream_id: u32,
        data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        shared: Arc<StreamShared>,
        session: Arc<SessionInner>,
    ) -> Self {
        let sink = PollSender::new(session.frame_tx.clone());
        Self {
            stream_id,
            data_rx,
            pending: None,
            sink,
            shared,
            session,
        }
    }

    /// Get the stream ID
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Current lifecycle state. Every stream of a closed session is `Closed`.
    pub fn state(&self) -> StreamState {
        if self.shared.is_released() || self.session.is_closed() {
            return StreamState::Closed;
        }
        match (self.shared.is_write_closed(), self.shared.is_read_closed()) {
            (false, false) => StreamState::Open,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) => StreamState::Closed,
        }
    }

    /// Writes all of `data` and then half-closes the stream with a CLOSE
    /// frame, so the peer reads exactly `data` followed by end-of-stream.
    ///
    /// Fails with [`SmuxError::StreamClosed`] if the write side is already
    /// closed.
    pub async fn write_once(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;

        for chunk in data.chunks(self.session.config.max_frame_size) {
            let frame = self.data_frame(chunk)?;
            self.send_frame(frame).await?;
        }

        self.shared.close_write();
        self.send_frame(Frame::new_close(self.stream_id)).await
    }

    /// Closes the stream. Sends CLOSE if the write side is still open,
    /// discards unread inbound data and detaches from the session.
    /// Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.shared.is_released() {
            return Ok(());
        }

        if self.shared.close_write() && !self.session.is_closed() {
            // The session may go away underneath us; the peer then sees
            // teardown instead of CLOSE.
            let _ = self.send_frame(Frame::new_close(self.stream_id)).await;
        }

        self.release();
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.shared.is_released() || self.shared.is_write_closed() {
            return Err(SmuxError::StreamClosed(self.stream_id));
        }
        if self.session.is_closed() {
            return Err(SmuxError::SessionClosed);
        }
        Ok(())
    }

    fn data_frame(&self, chunk: &[u8]) -> Result<Frame> {
        let mut buf = self.session.config.allocator.get(chunk.len())?;
        buf.copy_from_slice(chunk);
        Ok(Frame::new_data(self.stream_id, buf))
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.session
            .frame_tx
            .send(frame)
            .await
            .map_err(|_| SmuxError::SessionClosed)
    }

    fn release(&mut self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.session.detach(self.stream_id);
        self.data_rx.close();
        while let Ok(chunk) = self.data_rx.try_recv() {
            self.session.recycle(chunk);
        }
        if let Some((chunk, _)) = self.pending.take() {
            self.session.recycle(chunk);
        }
        tracing::trace!("stream {} released", self.stream_id);
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.shared.is_released() || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some((chunk, offset)) = this.pending.as_mut() {
                let n = buf.remaining().min(chunk.len() - *offset);
                buf.put_slice(&chunk[*offset..*offset + n]);
                *offset += n;
                if *offset == chunk.len() {
                    if let Some((chunk, _)) = this.pending.take() {
                        this.session.recycle(chunk);
                    }
                }
                return Poll::Ready(Ok(()));
            }

            match ready!(this.data_rx.poll_recv(cx)) {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => this.pending = Some((chunk, 0)),
                None if this.shared.is_read_closed() => return Poll::Ready(Ok(())),
                None => return Poll::Ready(Err(SmuxError::SessionClosed.into())),
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.ensure_writable()?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.sink.poll_reserve(cx)).map_err(|_| SmuxError::SessionClosed)?;

        let n = buf.len().min(this.session.config.max_frame_size);
        let frame = match this.data_frame(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                this.sink.abort_send();
                return Poll::Ready(Err(e.into()));
            }
        };
        this.sink
            .send_item(frame)
            .map_err(|_| SmuxError::SessionClosed)?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are owned by the session writer once queued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.shared.is_released() || this.shared.is_write_closed() {
            return Poll::Ready(Ok(()));
        }

        ready!(this.sink.poll_reserve(cx)).map_err(|_| SmuxError::SessionClosed)?;
        this.shared.close_write();
        this.sink
            .send_item(Frame::new_close(this.stream_id))
            .map_err(|_| SmuxError::SessionClosed)?;

        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.shared.is_released() {
            return;
        }
        if self.shared.close_write() && !self.session.is_closed() {
            match self
                .session
                .frame_tx
                .try_send(Frame::new_close(self.stream_id))
            {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    // Queue is busy; deliver the CLOSE once it drains.
                    let frame_tx = self.session.frame_tx.clone();
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move {
                                let _ = frame_tx.send(frame).await;
                            });
                        }
                        Err(_) => tracing::debug!(
                            "stream {} dropped outside a runtime, CLOSE not sent",
                            self.stream_id
                        ),
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        self.release();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("stream_id", &self.stream_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_flags() {
        let shared = StreamShared::default();
        assert!(!shared.is_read_closed());
        assert!(!shared.is_write_closed());

        assert!(shared.close_write());
        assert!(!shared.close_write());
        assert!(shared.is_write_closed());

        shared.mark_read_closed();
        assert!(shared.is_read_closed());
        assert!(!shared.is_released());
    }
}
