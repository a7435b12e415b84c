//! Byte streams bridged over session chunk frames.
//!
//! - [`ByteStream`]: inbound side, fed by `StreamPush` frames through a bounded
//!   channel. A slow consumer delays the push responses, which throttles the peer.
//! - [`StreamSink`]: outbound side, every write becomes a non-terminal chunk frame;
//!   finishing or aborting emits the terminal frame.
//! - [`InboundStreams`]: per-connection registry routing chunk frames by stream id.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::bridge::protocol::{RequestBody, StreamId, StreamPushRequest};
use crate::session::{ResponseError, Session, SessionError, expect_response};

/// Chunks buffered per inbound stream before pushes start waiting on the consumer.
pub const INBOUND_STREAM_CAPACITY: usize = 16;

/// Boxed source of outbound body chunks.
pub type BodySource = futures::stream::BoxStream<'static, Result<Bytes, StreamError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The other side went away. Consumers should treat this as a clean end.
    #[error("peer closed")]
    PeerClosed,
    /// The producer signalled an error mid-stream.
    #[error("peer reset")]
    PeerReset,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl StreamError {
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

#[derive(Default)]
struct Destroyed {
    error: StdMutex<Option<StreamError>>,
    token: CancellationToken,
}

impl Destroyed {
    fn set(&self, error: StreamError) {
        let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.token.cancel();
    }

    fn take(&self) -> StreamError {
        self.error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .unwrap_or(StreamError::PeerClosed)
    }
}

/// Inbound byte stream.
///
/// Yields chunks until the producer ends the stream. If the stream is destroyed,
/// buffered chunks are discarded and the destroy error is yielded once.
pub struct ByteStream {
    rx: mpsc::Receiver<Bytes>,
    destroyed: Arc<Destroyed>,
    destroyed_fut: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("finished", &self.finished)
            .finish()
    }
}

impl ByteStream {
    /// Create a connected feeder/stream pair.
    pub fn channel(capacity: usize) -> (StreamFeeder, ByteStream) {
        let (tx, rx) = mpsc::channel(capacity);
        let destroyed = Arc::new(Destroyed::default());
        let destroyed_fut = Box::pin(destroyed.token.clone().cancelled_owned());
        (
            StreamFeeder {
                tx,
                destroyed: Arc::clone(&destroyed),
            },
            ByteStream {
                rx,
                destroyed,
                destroyed_fut,
                finished: false,
            },
        )
    }

    /// An already-ended stream.
    pub fn empty() -> Self {
        let (feeder, stream) = Self::channel(1);
        drop(feeder);
        stream
    }

    /// Buffer the whole stream. Meant for small bodies and tests.
    pub async fn read_to_end(mut self) -> Result<Bytes, StreamError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn into_source(self) -> BodySource {
        self.boxed()
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.destroyed_fut.as_mut().poll(cx).is_ready() {
            self.finished = true;
            return Poll::Ready(Some(Err(self.destroyed.take())));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Producer half of a [`ByteStream`]. Dropping it ends the stream cleanly.
pub struct StreamFeeder {
    tx: mpsc::Sender<Bytes>,
    destroyed: Arc<Destroyed>,
}

impl Clone for StreamFeeder {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            destroyed: Arc::clone(&self.destroyed),
        }
    }
}

impl StreamFeeder {
    /// Push a chunk, waiting for buffer space.
    pub async fn push(&self, chunk: Bytes) -> Result<(), StreamError> {
        if chunk.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.destroyed.token.cancelled() => Err(StreamError::PeerClosed),
            sent = self.tx.send(chunk) => sent.map_err(|_| StreamError::PeerClosed),
        }
    }

    /// Destroy the stream; the consumer sees `error` instead of further chunks.
    pub fn destroy(&self, error: StreamError) {
        self.destroyed.set(error);
    }

    pub fn is_consumer_gone(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outbound byte stream writing chunk frames to a session.
pub struct StreamSink {
    session: Session,
    stream_id: StreamId,
    timeout: Duration,
}

impl StreamSink {
    pub fn new(session: Session, stream_id: StreamId, timeout: Duration) -> Self {
        Self {
            session,
            stream_id,
            timeout,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    async fn push(&self, request: StreamPushRequest) -> Result<(), StreamError> {
        let response = self
            .session
            .request(RequestBody::StreamPush(request), self.timeout)
            .await?;
        expect_response!(response, StreamPush)?;
        Ok(())
    }

    /// Write one non-terminal chunk. Resolves once the peer has taken it.
    pub async fn write(&mut self, data: Bytes) -> Result<(), StreamError> {
        if data.is_empty() {
            return Ok(());
        }
        self.push(StreamPushRequest::chunk(self.stream_id, data.to_vec()))
            .await
    }

    /// End the stream cleanly.
    pub async fn finish(self) -> Result<(), StreamError> {
        self.push(StreamPushRequest::end(self.stream_id)).await
    }

    /// End the stream with an error; the peer's consumer sees "peer reset".
    pub async fn abort(self) -> Result<(), StreamError> {
        self.push(StreamPushRequest::error(self.stream_id)).await
    }
}

/// Drain `source` into `sink` until it ends, fails, or `cancel` fires.
///
/// Source errors, cancellation and failed writes are forwarded as a terminal
/// error chunk. That last frame is best effort, bounded by the sink's timeout.
pub async fn pipe(
    mut source: BodySource,
    mut sink: StreamSink,
    cancel: CancellationToken,
) -> Result<(), StreamError> {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.abort().await;
                return Err(StreamError::PeerClosed);
            }
            item = source.next() => item,
        };
        match item {
            Some(Ok(chunk)) => {
                if let Err(e) = sink.write(chunk).await {
                    tracing::debug!(stream_id = sink.stream_id(), error = %e, "Chunk push failed, aborting stream");
                    let _ = sink.abort().await;
                    return Err(e);
                }
            }
            Some(Err(e)) => {
                tracing::debug!(stream_id = sink.stream_id(), error = %e, "Body source failed, aborting stream");
                let _ = sink.abort().await;
                return Err(e);
            }
            None => return sink.finish().await,
        }
    }
}

/// Registry has started closing; no new stream may be added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection is closing")]
pub struct Closing;

impl From<Closing> for ResponseError {
    fn from(e: Closing) -> Self {
        ResponseError::cancelled(e.to_string())
    }
}

struct InboundEntry {
    /// `None` once the peer has ended the stream.
    feeder: Option<StreamFeeder>,
    /// Consumer half, parked until claimed.
    parked: Option<ByteStream>,
}

impl InboundEntry {
    fn open() -> (Self, ByteStream) {
        let (feeder, stream) = ByteStream::channel(INBOUND_STREAM_CAPACITY);
        let entry = Self {
            feeder: Some(feeder),
            parked: None,
        };
        (entry, stream)
    }

    fn parked() -> Self {
        let (entry, stream) = Self::open();
        Self {
            parked: Some(stream),
            ..entry
        }
    }
}

#[derive(Default)]
struct InboundState {
    streams: HashMap<StreamId, InboundEntry>,
    closing: bool,
}

impl InboundState {
    /// Take a parked consumer, dropping the entry if the peer already ended it.
    fn take_parked(&mut self, stream_id: StreamId) -> Option<ByteStream> {
        let entry = self.streams.get_mut(&stream_id)?;
        let stream = entry.parked.take()?;
        if entry.feeder.is_none() {
            self.streams.remove(&stream_id);
        }
        Some(stream)
    }
}

/// Open inbound streams of one connection, keyed by stream id.
pub struct InboundStreams {
    state: StdMutex<InboundState>,
    /// Accept chunks for streams not registered yet, parking them until claimed.
    lazy: bool,
}

impl InboundStreams {
    /// Chunks for unknown streams are rejected.
    pub fn strict() -> Self {
        Self {
            state: StdMutex::new(InboundState::default()),
            lazy: false,
        }
    }

    /// Chunks for unknown streams open a parked stream, for peers that may start
    /// pushing before the call announcing the stream has been dispatched.
    pub fn lazy() -> Self {
        Self {
            state: StdMutex::new(InboundState::default()),
            lazy: true,
        }
    }

    fn state(&self) -> MutexGuard<'_, InboundState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a stream and hand its consumer half to the caller.
    pub fn register(&self, stream_id: StreamId) -> Result<ByteStream, Closing> {
        let mut state = self.state();
        if state.closing {
            return Err(Closing);
        }
        if let Some(stream) = state.take_parked(stream_id) {
            return Ok(stream);
        }
        let (entry, stream) = InboundEntry::open();
        state.streams.insert(stream_id, entry);
        Ok(stream)
    }

    /// Register a stream whose consumer will be claimed later.
    pub fn register_parked(&self, stream_id: StreamId) -> Result<(), Closing> {
        let mut state = self.state();
        if state.closing {
            return Err(Closing);
        }
        state.streams.insert(stream_id, InboundEntry::parked());
        Ok(())
    }

    /// Take the parked consumer of a registered stream. Streams the peer has
    /// already ended cleanly stay claimable until taken; reset ones are gone.
    pub fn claim(&self, stream_id: StreamId) -> Option<ByteStream> {
        self.state().take_parked(stream_id)
    }

    /// Route one chunk frame.
    pub async fn push(&self, request: StreamPushRequest) -> Result<(), ResponseError> {
        let stream_id = request.stream_id;
        let terminal = request.is_eos || request.is_error;
        let feeder = {
            let mut state = self.state();
            if state.closing {
                return Err(ResponseError::cancelled("connection is closing"));
            }
            if self.lazy && !state.streams.contains_key(&stream_id) {
                // A terminal frame may be all the stream ever carries.
                state.streams.insert(stream_id, InboundEntry::parked());
            }
            match state.streams.get_mut(&stream_id) {
                Some(entry) if terminal => {
                    let feeder = entry.feeder.take();
                    // A reset stream nobody has claimed yet has nothing left to deliver.
                    let unclaimed_reset = request.is_error && !self.lazy;
                    if entry.parked.is_none() || unclaimed_reset {
                        state.streams.remove(&stream_id);
                    }
                    Some(feeder)
                }
                Some(entry) => Some(entry.feeder.clone()),
                None => None,
            }
        };

        let feeder = match feeder {
            Some(Some(feeder)) => feeder,
            Some(None) if terminal => {
                tracing::debug!(stream_id, "Duplicate terminal chunk");
                return Ok(());
            }
            _ => {
                return Err(ResponseError::client_error(format!(
                    "stream {stream_id} is not open"
                )));
            }
        };

        if request.is_error {
            tracing::debug!(stream_id, "Stream reset by peer");
            feeder.destroy(StreamError::PeerReset);
            return Ok(());
        }

        let pushed = feeder.push(Bytes::from(request.data)).await;
        if request.is_eos {
            // The consumer ends once buffered data is read and every feeder is gone.
            drop(feeder);
            tracing::trace!(stream_id, "Stream ended by peer");
        }
        pushed.map_err(|_| {
            self.state().streams.remove(&stream_id);
            ResponseError::cancelled(format!("stream {stream_id} consumer went away"))
        })
    }

    /// Destroy one stream, if still open.
    pub fn destroy(&self, stream_id: StreamId, error: StreamError) {
        if let Some(feeder) = self
            .state()
            .streams
            .remove(&stream_id)
            .and_then(|entry| entry.feeder)
        {
            feeder.destroy(error);
        }
    }

    /// Mark closing and destroy every open stream with `error`.
    pub fn close(&self, error: StreamError) -> usize {
        let streams = {
            let mut state = self.state();
            state.closing = true;
            std::mem::take(&mut state.streams)
        };
        let count = streams.len();
        for feeder in streams.into_values().filter_map(|entry| entry.feeder) {
            feeder.destroy(error.clone());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
