mod codec;
mod connection;
mod context;
mod endpoint;
mod error;
mod subscription;
mod task;
mod topic;
mod transport;
mod wire;

// A client multiplexes every call, publish and subscription to an endpoint
// over one lazily opened connection. Callers never touch the network
// themselves: each operation becomes a task on the I/O pool, and the caller
// either parks on its completion or hands over a sink that hears about it
// later on some pool worker.
//
// Topic names are hashed per client. The hash only ever travels in call
// frames, where it routes replies back together with the per-connection
// sequence number; anything the peer must resolve (publish, subscribe)
// carries the topic by name inside the codec envelope.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{runtime::Handle, sync::oneshot};
use tracing::debug;
use typed_builder::TypedBuilder;

pub use self::{
    codec::{Codec, RawCodec, RkyvCodec, ZstdCodec},
    context::{Callbacks, CompletionSink, Timeout},
    endpoint::Endpoint,
    error::{Error, ErrorKind, Result},
    subscription::{
        ChannelState, Delivery, Subscription, SubscriptionHandlers,
        SubscriptionKey,
    },
    topic::{TopicHash, PUBLISH_HASH},
    transport::{BoxedReader, BoxedWriter, Duplex, TcpTransport, Transport},
    wire::{
        read_frame, write_frame, Frame, FrameKind, DEFAULT_MAX_FRAME_LEN,
        HEADER_LEN,
    },
};
#[cfg(feature = "quic")]
pub use self::transport::{QuicConfig, QuicTransport};
use self::{
    connection::ConnectionPool,
    context::CallContext,
    subscription::{receive_loop, SubscriptionChannel, SubscriptionManager},
    task::CallTask,
    topic::TopicHasher,
};
use crate::io::{self, IoContext};

#[derive(Clone, TypedBuilder)]
pub struct ClientConfig {
    /// Upper bound for establishing a connection, separate from call
    /// timeouts. Running out of it is a connection failure.
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    #[builder(default = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,
    #[builder(default = Arc::new(RkyvCodec))]
    pub codec: Arc<dyn Codec>,
    #[builder(default = Arc::new(TcpTransport))]
    pub transport: Arc<dyn Transport>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("max_frame_len", &self.max_frame_len)
            .field("codec", &self.codec.name())
            .field("transport", &self.transport.name())
            .finish()
    }
}

struct ClientInner {
    io: Arc<IoContext>,
    /// Whether `io` came from the process-wide pool.
    global: bool,
    hasher: TopicHasher,
    pool: Arc<ConnectionPool>,
    codec: Arc<dyn Codec>,
    subscriptions: Arc<SubscriptionManager>,
}

/// Handle to a client. Clones share connections and subscriptions; the
/// last one to go cancels every remaining subscription.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// A client on the process-wide pool with default settings. Fails with
    /// `NotInitialized` before [`io::global_init`].
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let io = io::global()?;
        Ok(Self::build(io, true, config))
    }

    /// A client on a pool the caller manages; unaffected by the global
    /// lifecycle.
    pub fn with_io_context(io: Arc<IoContext>, config: ClientConfig) -> Self {
        Self::build(io, false, config)
    }

    fn build(io: Arc<IoContext>, global: bool, config: ClientConfig) -> Self {
        debug!(?config, global, "client created");
        let pool = ConnectionPool::new(
            config.transport,
            config.connect_timeout,
            config.max_frame_len,
        );
        Self {
            inner: Arc::new(ClientInner {
                io,
                global,
                hasher: TopicHasher::new(),
                pool: Arc::new(pool),
                codec: config.codec,
                subscriptions: Arc::new(SubscriptionManager::new()),
            }),
        }
    }

    pub fn io_context(&self) -> &Arc<IoContext> {
        &self.inner.io
    }

    /// Stable for the lifetime of this client, unrelated to any other
    /// client's hashes.
    pub fn topic_hash(&self, topic: &str) -> TopicHash {
        self.inner.hasher.hash(topic)
    }

    /// A client on the global pool stops working once that pool has been
    /// torn down, even if a new one was started since.
    fn ensure_live(&self) -> Result<()> {
        if self.inner.global {
            let current = io::global()?;
            if !Arc::ptr_eq(&current, &self.inner.io) {
                Err(Error::not_initialized())?
            }
        }
        Ok(())
    }

    fn prepare(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &[u8],
        timeout: Timeout,
        publish: bool,
    ) -> Result<CallTask> {
        self.ensure_live()?;
        let mut ctx =
            CallContext::new(&self.inner.hasher, topic, payload, publish)?;
        ctx.set_timeout(timeout);
        Ok(CallTask::new(
            ctx,
            *endpoint,
            self.inner.pool.clone(),
            self.inner.codec.clone(),
        ))
    }

    /// Sends `payload` to `topic` and parks the calling thread until the
    /// response arrives, `timeout` runs out or the connection fails.
    pub fn call(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &[u8],
        timeout: impl Into<Timeout>,
    ) -> Result<Vec<u8>> {
        self.prepare(endpoint, topic, payload, timeout.into(), false)?
            .do_call_and_wait(&self.inner.io)
    }

    /// Returns once the transport has taken the message. No reply is
    /// expected; `timeout` only bounds the send.
    pub fn publish(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &[u8],
        timeout: impl Into<Timeout>,
    ) -> Result<()> {
        self.prepare(endpoint, topic, payload, timeout.into(), true)?
            .do_call_and_wait(&self.inner.io)
            .map(drop)
    }

    /// Schedules the call and returns. An `Err` here means nothing was
    /// scheduled and `sink` was dropped unused; otherwise `sink` hears the
    /// outcome exactly once.
    pub fn async_call(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &[u8],
        timeout: impl Into<Timeout>,
        sink: impl CompletionSink,
    ) -> Result<()> {
        self.prepare(endpoint, topic, payload, timeout.into(), false)?
            .do_call(&self.inner.io, Box::new(sink));
        Ok(())
    }

    /// `sink` succeeds with an empty response once the message is sent.
    pub fn async_publish(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        payload: &[u8],
        timeout: impl Into<Timeout>,
        sink: impl CompletionSink,
    ) -> Result<()> {
        self.prepare(endpoint, topic, payload, timeout.into(), true)?
            .do_call(&self.inner.io, Box::new(sink));
        Ok(())
    }

    /// Opens a push stream for `topic` at `endpoint` and returns once the
    /// subscribe request is on the wire. An existing subscription to the
    /// same pair is unsubscribed first and its `on_error` hears
    /// `Cancelled`.
    pub fn subscribe(
        &self,
        endpoint: &Endpoint,
        topic: &str,
        handlers: SubscriptionHandlers,
    ) -> Result<Subscription> {
        self.ensure_live()?;
        if topic.is_empty() {
            Err(Error::invalid_argument("topic is empty"))?
        }
        let topic_hash = self.inner.hasher.register(topic)?;
        let request = self.inner.codec.encode(topic, &[])?;

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let endpoint = *endpoint;
        let topic = topic.to_owned();
        self.inner.io.spawn(async move {
            let opened = inner
                .open_subscription(endpoint, &topic, topic_hash, request, handlers)
                .await;
            // the caller may release the client as soon as it hears back
            drop(inner);
            let _ = tx.send(opened);
        });
        io::wait(rx).unwrap_or_else(|| {
            Err(Error::cancelled(
                "I/O pool stopped before the subscription started",
            ))
        })
    }

    /// Cancels the subscription for the pair, if any. Returns whether one
    /// was active.
    pub fn unsubscribe(&self, endpoint: &Endpoint, topic: &str) -> bool {
        match self.inner.subscriptions.remove(endpoint, topic) {
            Some(channel) => channel.cancel(),
            None => false,
        }
    }

    pub fn subscription_state(
        &self,
        endpoint: &Endpoint,
        topic: &str,
    ) -> Option<ChannelState> {
        self.inner
            .subscriptions
            .get(endpoint, topic)
            .map(|channel| channel.state())
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.inner.subscriptions.keys()
    }

    /// Cancels the subscriptions at `endpoint` and forgets its connection.
    /// Calls still in flight finish on the old connection; the next one
    /// opens a new connection.
    pub fn disconnect(&self, endpoint: &Endpoint) -> bool {
        for key in self.active_subscriptions() {
            if key.endpoint == *endpoint {
                self.unsubscribe(endpoint, &key.topic);
            }
        }
        self.inner.pool.evict(endpoint)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("global", &self.inner.global)
            .field("workers", &self.inner.io.workers())
            .field("codec", &self.inner.codec.name())
            .field("topics", &self.inner.hasher.known_topics())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl ClientInner {
    async fn open_subscription(
        &self,
        endpoint: Endpoint,
        topic: &str,
        topic_hash: TopicHash,
        request: Vec<u8>,
        handlers: SubscriptionHandlers,
    ) -> Result<Subscription> {
        let conn = self.pool.get(endpoint).await?;
        let (id, pushes) = conn.register_subscription()?;
        let (on_message, on_error) = handlers.split();
        let channel = Arc::new(SubscriptionChannel::new(
            id,
            endpoint,
            topic,
            topic_hash,
            request,
            on_error,
            conn.clone(),
            Handle::current(),
        ));

        // the old stream is closed on the peer before the new one opens
        if let Some(previous) = self.subscriptions.register(channel.clone()) {
            debug!(topic, old = previous.id(), new = id, "replacing subscription");
            previous.supersede().await;
        }
        if let Err(e) = conn.send(&channel.subscribe_frame()).await {
            channel.cancel();
            self.subscriptions.deregister(&channel);
            Err(e)?
        }
        debug!(topic, id, remote = %endpoint, "subscribed");

        let manager: Weak<SubscriptionManager> =
            Arc::downgrade(&self.subscriptions);
        tokio::spawn(receive_loop(
            channel.clone(),
            pushes,
            on_message,
            self.codec.clone(),
            manager.clone(),
        ));
        Ok(Subscription::new(channel, manager))
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let subscriptions = self.subscriptions.len();
        self.subscriptions.clear();
        debug!(subscriptions, "client released");
    }
}
