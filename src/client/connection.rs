// A connection multiplexes every call and subscription a client has with
// one endpoint. Outbound frames are written under an async lock, one whole
// frame at a time, by a task of their own: a sender that stops waiting
// never leaves half a frame on the stream. A single read loop per
// connection routes inbound frames: replies by (topic hash, seq), pushes by
// subscription id. When the stream dies every waiter is failed and the
// connection is marked closed; the pool then opens a fresh one on the next
// use.

use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use hashbrown::HashMap;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    endpoint::Endpoint,
    error::{Error, Result},
    topic::TopicHash,
    transport::{BoxedReader, BoxedWriter, Transport},
    wire::{read_frame, Frame, FrameKind},
};
use crate::hex::HexPreviewExt;

type CallKey = (TopicHash, u64);
type ReplySender = oneshot::Sender<Result<Frame>>;
pub(crate) type PushReceiver = mpsc::UnboundedReceiver<Result<Frame>>;
type PushSender = mpsc::UnboundedSender<Result<Frame>>;

#[derive(Default)]
struct Routes {
    calls: HashMap<CallKey, ReplySender>,
    subscriptions: HashMap<u64, PushSender>,
}

pub(crate) struct Connection {
    endpoint: Endpoint,
    max_frame_len: usize,
    writer: AsyncMutex<BoxedWriter>,
    routes: Mutex<Routes>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    _keepalive: Option<Box<dyn Any + Send + Sync>>,
}

impl Connection {
    pub async fn open(
        transport: &dyn Transport,
        endpoint: Endpoint,
        connect_timeout: Duration,
        max_frame_len: usize,
    ) -> Result<Arc<Self>> {
        let span = debug_span!(
            "connection",
            remote = %endpoint,
            transport = transport.name()
        );
        let connect = transport.connect(endpoint);
        let duplex = tokio::time::timeout(connect_timeout, connect)
            .instrument(span.clone())
            .await
            .map_err(|_| {
                Error::connection_failed(format!(
                    "connect to {endpoint} timed out after {connect_timeout:?}"
                ))
            })??;
        let (reader, writer, keepalive) = duplex.into_parts();
        let conn = Arc::new(Self {
            endpoint,
            max_frame_len,
            writer: AsyncMutex::new(writer),
            routes: Mutex::new(Routes::default()),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
            _keepalive: keepalive,
        });
        let read_loop =
            Self::read_loop(Arc::downgrade(&conn), reader, max_frame_len);
        let handle = tokio::spawn(read_loop.instrument(span));
        *conn.reader.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(handle);
        debug!(remote = %endpoint, "connection established");
        Ok(conn)
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves a correlation slot for a call. The slot is released when
    /// the returned [`PendingCall`] is dropped, answered or not.
    pub fn register_call(
        self: &Arc<Self>,
        topic_hash: TopicHash,
    ) -> Result<PendingCall> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes();
            // checked under the routes lock so close() cannot miss the slot
            if !self.is_alive() {
                Err(self.closed_error())?
            }
            routes.calls.insert((topic_hash, seq), tx);
        }
        Ok(PendingCall {
            conn: self.clone(),
            key: (topic_hash, seq),
            rx: Some(rx),
        })
    }

    pub fn register_subscription(&self) -> Result<(u64, PushReceiver)> {
        let id = self.next_seq();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes();
        if !self.is_alive() {
            Err(self.closed_error())?
        }
        routes.subscriptions.insert(id, tx);
        Ok((id, rx))
    }

    /// Stops routing pushes for `id`. Closing the route ends the channel's
    /// receive loop.
    pub fn remove_subscription(&self, id: u64) -> bool {
        self.routes().subscriptions.remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn pending_calls(&self) -> usize {
        self.routes().calls.len()
    }

    /// Resolves once `frame` is fully written. Dropping the returned future
    /// early does not cut the frame short; it still goes out whole, and
    /// frames sent afterwards queue behind it.
    pub async fn send(self: &Arc<Self>, frame: &Frame) -> Result<()> {
        if !self.is_alive() {
            Err(self.closed_error())?
        }
        frame.ensure_within(self.max_frame_len)?;
        let bytes = frame.encode()?;
        trace!(
            kind = ?frame.kind,
            seq = frame.seq,
            body = %frame.body.hex(),
            "send"
        );
        let conn = self.clone();
        match tokio::spawn(async move { conn.write(bytes).await }).await {
            Ok(written) => written,
            // the stream may hold part of the frame now
            Err(e) => {
                let e = Error::connection_failed(format!("write aborted: {e}"));
                self.close(e.clone());
                Err(e)
            }
        }
    }

    async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if !self.is_alive() {
            Err(self.closed_error())?
        }
        let written: std::io::Result<()> = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            drop(writer);
            let e = Error::from(e);
            self.close(e.clone());
            Err(e)?
        }
        Ok(())
    }

    fn closed_error(&self) -> Error {
        Error::connection_failed(format!(
            "connection to {} is closed",
            self.endpoint
        ))
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, frame: Frame) {
        trace!(
            kind = ?frame.kind,
            seq = frame.seq,
            body = %frame.body.hex(),
            "recv"
        );
        match frame.kind {
            kind if kind.is_reply() => {
                let key = (frame.topic_hash, frame.seq);
                let waiter = self.routes().calls.remove(&key);
                match waiter {
                    Some(tx) => {
                        trace!(rtt_us = frame.age_micros(), "reply routed");
                        let _ = tx.send(Ok(frame));
                    }
                    // a rejected subscribe comes back under the subscription id
                    None if frame.kind == FrameKind::Failure
                        && self.routes().subscriptions.contains_key(&frame.seq) =>
                    {
                        self.route_push(frame)
                    }
                    None => warn!(
                        seq = frame.seq,
                        topic_hash = frame.topic_hash,
                        "discarding reply for unknown or resolved call"
                    ),
                }
            }
            FrameKind::Push => self.route_push(frame),
            other => warn!(kind = ?other, "peer sent a client-side frame kind"),
        }
    }

    fn route_push(&self, frame: Frame) {
        let id = frame.seq;
        let mut routes = self.routes();
        let delivered = match routes.subscriptions.get(&id) {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => {
                debug!(id, "discarding push for inactive subscription");
                return;
            }
        };
        if !delivered {
            routes.subscriptions.remove(&id);
        }
    }

    /// Marks the connection dead and fails every waiter with `error`.
    pub fn close(&self, error: Error) {
        let routes = {
            let mut routes = self.routes();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *routes)
        };
        debug!(
            remote = %self.endpoint,
            calls = routes.calls.len(),
            subscriptions = routes.subscriptions.len(),
            %error,
            "connection closed"
        );
        for (_, tx) in routes.calls {
            let _ = tx.send(Err(error.clone()));
        }
        for (_, tx) in routes.subscriptions {
            let _ = tx.send(Err(error.clone()));
        }
    }

    async fn read_loop(
        conn: Weak<Self>,
        mut reader: BoxedReader,
        max_frame_len: usize,
    ) {
        loop {
            let next = read_frame(&mut reader, max_frame_len).await;
            let Some(conn) = conn.upgrade() else {
                return;
            };
            match next {
                Ok(Some(frame)) => conn.route(frame),
                Ok(None) => {
                    let e = Error::connection_failed("connection closed by peer");
                    conn.close(e);
                    return;
                }
                Err(e) => {
                    conn.close(e);
                    return;
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let reader =
            self.reader.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = reader.take() {
            handle.abort();
        }
    }
}

/// An outstanding call slot. Dropping it before the reply arrives (e.g. on
/// timeout) deregisters the slot so a late reply is discarded, not misrouted.
pub(crate) struct PendingCall {
    conn: Arc<Connection>,
    key: CallKey,
    rx: Option<oneshot::Receiver<Result<Frame>>>,
}

impl PendingCall {
    pub fn seq(&self) -> u64 {
        self.key.1
    }

    pub async fn reply(mut self) -> Result<Frame> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::protocol("reply already consumed"));
        };
        rx.await.map_err(|_| {
            Error::connection_failed("connection dropped the call")
        })?
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.conn.routes().calls.remove(&self.key);
    }
}

/// Lazily opens one connection per endpoint and hands it to every caller.
///
/// Each endpoint has its own async slot: concurrent first uses queue on the
/// slot and reuse the connection the first of them opened, while other
/// endpoints stay unaffected.
type Slot = Arc<AsyncMutex<Option<Arc<Connection>>>>;

pub(crate) struct ConnectionPool {
    slots: Mutex<HashMap<Endpoint, Slot>>,
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
    max_frame_len: usize,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        max_frame_len: usize,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            transport,
            connect_timeout,
            max_frame_len,
        }
    }

    pub async fn get(&self, endpoint: Endpoint) -> Result<Arc<Connection>> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint)
            .or_default()
            .clone();
        let mut slot = slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_alive() {
                return Ok(conn.clone());
            }
            debug!(
                remote = %endpoint,
                "previous connection is dead, reconnecting"
            );
        }
        let conn = Connection::open(
            &*self.transport,
            endpoint,
            self.connect_timeout,
            self.max_frame_len,
        )
        .await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forgets the cached connection. In-flight users keep it alive until
    /// they finish.
    pub fn evict(&self, endpoint: &Endpoint) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint)
            .is_some()
    }
}
