use crate::{
    Command,
    codec::Codec,
    config::Config,
    error::{Result, SmuxError},
    frame::Frame,
    stream::{Stream, StreamShared},
    stream_id::{Role, StreamIdGenerator, validate_peer_stream_id},
};
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{
    codec::Framed,
    sync::{CancellationToken, DropGuard},
};

/// Session-side end of a stream.
#[derive(Debug)]
enum StreamSlot {
    /// Where the demultiplexer delivers payload.
    Live {
        data_tx: mpsc::UnboundedSender<Vec<u8>>,
        shared: Arc<StreamShared>,
    },
    /// A peer-opened stream released locally before the peer's CLOSE.
    /// Frames for it are discarded until that CLOSE arrives.
    Finished,
}

impl StreamSlot {
    fn is_live(&self) -> bool {
        matches!(self, StreamSlot::Live { .. })
    }
}

/// A multiplexed session that manages multiple streams over a single connection
///
/// Handles are cheap to clone. Dropping the last one closes the session,
/// as [`Session::close`] does.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    _guard: Arc<DropGuard>,
}

/// Internal session state shared between the session's tasks and its streams
#[derive(Debug)]
pub(crate) struct SessionInner {
    /// Live streams by ID
    streams: DashMap<u32, StreamSlot>,
    pub(crate) config: Arc<Config>,
    /// Peer-opened streams waiting for accept_stream
    incoming_streams_tx: flume::Sender<Stream>,
    incoming_streams_rx: flume::Receiver<Stream>,
    ids: StreamIdGenerator,
    role: Role,
    /// Outgoing frames, drained by send_loop
    pub(crate) frame_tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

impl Session {
    /// Create a new client session
    pub async fn client<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, Role::Client).await
    }

    /// Create a new server session
    pub async fn server<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, Role::Server).await
    }

    async fn new<T>(transport: T, config: Config, role: Role) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let config = Arc::new(config);
        let codec = Codec::new(Arc::clone(&config.allocator));
        let (sink, stream) = Framed::new(transport, codec).split();

        let (frame_tx, frame_rx) = mpsc::channel(config.max_send_queue);
        let (incoming_streams_tx, incoming_streams_rx) = flume::bounded(config.accept_backlog);

        let inner = Arc::new(SessionInner {
            streams: DashMap::new(),
            ids: StreamIdGenerator::for_role(role, &config),
            config,
            incoming_streams_tx,
            incoming_streams_rx,
            role,
            frame_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(recv_loop(stream, Arc::clone(&inner)));
        tokio::spawn(send_loop(sink, frame_rx, Arc::clone(&inner)));

        let guard = Arc::new(inner.shutdown.clone().drop_guard());
        Ok(Session {
            inner,
            _guard: guard,
        })
    }

    /// Open a new outgoing stream. An OPEN frame announces it to the peer.
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(SmuxError::SessionClosed);
        }

        let stream_id = self.inner.ids.next()?;
        let stream = self.inner.register(stream_id, None)?;

        // Teardown may have cleared the map before the insert landed.
        if self.is_closed() {
            return Err(SmuxError::SessionClosed);
        }

        self.inner
            .frame_tx
            .send(Frame::new_open(stream_id))
            .await
            .map_err(|_| SmuxError::SessionClosed)?;

        tracing::trace!("opened stream {}", stream_id);
        Ok(stream)
    }

    /// Accept an incoming stream initiated by the peer. Fails with
    /// `SessionClosed` once the session is torn down.
    pub async fn accept_stream(&self) -> Result<Stream> {
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(SmuxError::SessionClosed),
            result = self.inner.incoming_streams_rx.recv_async() => {
                result.map_err(|_| SmuxError::SessionClosed)
            }
        }
    }

    /// Stops both session tasks, detaches every stream and drops the
    /// transport. Idempotent.
    pub fn close(&self) {
        self.inner.teardown();
    }

    /// Check if the session is closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Resolves once the session has been torn down, by `close` or by a
    /// transport or protocol failure.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Whether this end is the client or the server.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Number of streams the demultiplexer is still delivering to.
    pub fn num_streams(&self) -> usize {
        self.inner
            .streams
            .iter()
            .filter(|slot| slot.value().is_live())
            .count()
    }
}

impl SessionInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Creates the stream and its slot. `initial` is queued ahead of any
    /// later payload.
    fn register(self: &Arc<Self>, stream_id: u32, initial: Option<Vec<u8>>) -> Result<Stream> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        if let Some(data) = initial.filter(|d| !d.is_empty()) {
            let _ = data_tx.send(data);
        }
        let shared = Arc::new(StreamShared::default());

        match self.streams.entry(stream_id) {
            Entry::Occupied(_) => return Err(SmuxError::InvalidStreamId(stream_id)),
            Entry::Vacant(entry) => {
                entry.insert(StreamSlot::Live {
                    data_tx,
                    shared: Arc::clone(&shared),
                });
            }
        }

        Ok(Stream::new(stream_id, data_rx, shared, Arc::clone(self)))
    }

    /// Stops delivery to a released stream. A peer-opened stream whose CLOSE
    /// has not arrived yet keeps a `Finished` slot, so its late frames cannot
    /// open it again.
    pub(crate) fn detach(&self, stream_id: u32) {
        let Entry::Occupied(mut entry) = self.streams.entry(stream_id) else {
            return;
        };
        if self.ids.contains(stream_id) || self.is_closed() {
            entry.remove();
        } else if entry.get().is_live() {
            entry.insert(StreamSlot::Finished);
        }
    }

    /// Hands a payload buffer back to the allocator.
    pub(crate) fn recycle(&self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        if let Err(e) = self.config.allocator.put(buf) {
            tracing::trace!("payload buffer not returned to pool: {}", e);
        }
    }

    fn teardown(&self) {
        self.shutdown.cancel();
        // Dropping the slots ends every stream's data channel.
        self.streams.clear();
        for stream in self.incoming_streams_rx.drain() {
            drop(stream);
        }
    }
}

/// Background task that reads frames from the transport and dispatches them
async fn recv_loop<T>(mut stream: SplitStream<Framed<T, Codec>>, inner: Arc<SessionInner>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                tracing::debug!("recv_loop shutting down");
                break;
            }
            frame_result = stream.next() => match frame_result {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::error!("Frame decode error: {}", e);
                    break;
                }
                None => {
                    tracing::debug!("Transport closed");
                    break;
                }
            },
        };

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = handle_frame(frame, &inner) => {
                if let Err(e) = result {
                    tracing::debug!("Error handling frame: {}", e);
                }
            }
        }
    }

    inner.teardown();
}

/// Background task that owns the write half of the transport
async fn send_loop<T>(
    mut sink: SplitSink<Framed<T, Codec>, Frame>,
    mut frame_rx: mpsc::Receiver<Frame>,
    inner: Arc<SessionInner>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => {
                tracing::debug!("send_loop shutting down");
                break;
            }
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Encode everything already queued, then flush once.
        let write = async {
            sink.feed(frame).await?;
            while let Ok(frame) = frame_rx.try_recv() {
                sink.feed(frame).await?;
            }
            sink.flush().await
        };

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = write => {
                if let Err(e) = result {
                    tracing::error!("Frame send error: {}", e);
                    break;
                }
            }
        }
    }

    inner.teardown();
}

/// Handle an incoming frame based on its command type
async fn handle_frame(frame: Frame, inner: &Arc<SessionInner>) -> Result<()> {
    match frame.cmd {
        Command::Open => handle_new_stream(frame.stream_id, Vec::new(), inner).await,
        Command::Data => handle_data_frame(frame, inner).await,
        Command::Close => {
            handle_close_frame(frame.stream_id, inner);
            Ok(())
        }
    }
}

/// Handle DATA: append to a known stream, or implicitly open a new one
async fn handle_data_frame(frame: Frame, inner: &Arc<SessionInner>) -> Result<()> {
    let stream_id = frame.stream_id;

    let data = match inner.streams.get(&stream_id).as_deref() {
        Some(StreamSlot::Live { data_tx, .. }) => match data_tx.send(frame.data) {
            Ok(()) => return Ok(()),
            // The reader is being released; detach settles the slot.
            Err(mpsc::error::SendError(data)) => {
                inner.recycle(data);
                return Ok(());
            }
        },
        Some(StreamSlot::Finished) => {
            tracing::trace!("dropping DATA for released stream {}", stream_id);
            inner.recycle(frame.data);
            return Ok(());
        }
        None => frame.data,
    };

    handle_new_stream(stream_id, data, inner).await
}

/// Surface a stream the peer opened, by OPEN or by its first DATA
async fn handle_new_stream(
    stream_id: u32,
    data: Vec<u8>,
    inner: &Arc<SessionInner>,
) -> Result<()> {
    if inner.ids.contains(stream_id) {
        // One of ours that has already been closed locally.
        tracing::trace!("dropping frame for finished local stream {}", stream_id);
        inner.recycle(data);
        return Ok(());
    }

    if let Err(e) = validate_peer_stream_id(inner.role, &inner.config, stream_id) {
        inner.recycle(data);
        return Err(e);
    }

    if inner.streams.contains_key(&stream_id) {
        // Duplicate OPEN, or a frame for a stream already released here.
        tracing::trace!("dropping frame for known stream {}", stream_id);
        inner.recycle(data);
        return Ok(());
    }

    let stream = inner.register(stream_id, Some(data))?;
    inner
        .incoming_streams_tx
        .send_async(stream)
        .await
        .map_err(|_| SmuxError::SessionClosed)?;

    tracing::trace!("accepted stream {} from peer", stream_id);
    Ok(())
}

/// Handle CLOSE: the peer will send nothing more on this stream
fn handle_close_frame(stream_id: u32, inner: &Arc<SessionInner>) {
    match inner.streams.remove(&stream_id) {
        Some((_, StreamSlot::Live { data_tx, shared })) => {
            shared.mark_read_closed();
            drop(data_tx);
        }
        Some((_, StreamSlot::Finished)) => {
            tracing::trace!("stream {} finished on both sides", stream_id);
        }
        None => tracing::trace!("CLOSE for unknown stream {}", stream_id),
    }
}
