// A subscription is a long-lived push stream for one (endpoint, topic) pair.
// The manager owns the canonical reference to every channel; the receive loop
// running on the I/O pool holds a second one while it waits for pushes.
// Cancellation, failure and replacement all flip the channel's state exactly
// once and drop its route on the connection, which ends the loop.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use hashbrown::HashMap;
use tokio::runtime::Handle;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    codec::Codec,
    connection::{Connection, PushReceiver},
    endpoint::Endpoint,
    error::{Error, ErrorKind},
    topic::TopicHash,
    wire::{Frame, FrameKind},
};

/// What a message handler wants to happen next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Active,
    /// Ended by the caller, by the message handler, or by a newer
    /// subscription to the same key.
    Cancelled,
    /// Ended by a transport, decode or remote error.
    Failed,
}

type MessageFn = Box<dyn FnMut(&[u8]) -> Delivery + Send>;
type ErrorFn = Box<dyn FnOnce(ErrorKind, &str) + Send>;

/// Callbacks for a subscription. Without a message handler pushes are
/// consumed and dropped; the stream stays open.
#[derive(Default)]
pub struct SubscriptionHandlers {
    on_message: Option<MessageFn>,
    on_error: Option<ErrorFn>,
}

impl SubscriptionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[u8]) -> Delivery + Send + 'static,
    {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Called at most once, when the channel fails or is superseded.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ErrorKind, &str) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub(crate) fn split(self) -> (Option<MessageFn>, Option<ErrorFn>) {
        (self.on_message, self.on_error)
    }
}

pub struct SubscriptionChannel {
    id: u64,
    endpoint: Endpoint,
    topic: Arc<str>,
    topic_hash: TopicHash,
    subscribe_request: Vec<u8>,
    state: Mutex<ChannelState>,
    on_error: Mutex<Option<ErrorFn>>,
    conn: Arc<Connection>,
    handle: Handle,
}

impl SubscriptionChannel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        endpoint: Endpoint,
        topic: &str,
        topic_hash: TopicHash,
        subscribe_request: Vec<u8>,
        on_error: Option<ErrorFn>,
        conn: Arc<Connection>,
        handle: Handle,
    ) -> Self {
        Self {
            id,
            endpoint,
            topic: Arc::from(topic),
            topic_hash,
            subscribe_request,
            state: Mutex::new(ChannelState::Active),
            on_error: Mutex::new(on_error),
            conn,
            handle,
        }
    }

    /// Subscription id on the connection; the peer echoes it in every push.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn topic_hash(&self) -> TopicHash {
        self.topic_hash
    }

    /// The encoded subscribe request, carrying the topic by name.
    pub fn subscribe_request(&self) -> &[u8] {
        &self.subscribe_request
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    pub(crate) fn subscribe_frame(&self) -> Frame {
        Frame::new(
            FrameKind::Subscribe,
            self.id,
            self.topic_hash,
            self.subscribe_request.clone(),
        )
    }

    fn transition(&self, to: ChannelState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ChannelState::Active {
            return false;
        }
        *state = to;
        true
    }

    /// Flips Active to Cancelled and stops routing pushes.
    fn begin_cancel(&self) -> bool {
        if !self.transition(ChannelState::Cancelled) {
            return false;
        }
        self.conn.remove_subscription(self.id);
        debug!(topic = %self.topic, id = self.id, "subscription cancelled");
        true
    }

    /// Nothing to tell a peer we are no longer connected to.
    fn unsubscribe_notice(&self) -> Option<Frame> {
        self.conn.is_alive().then(|| {
            Frame::new(
                FrameKind::Unsubscribe,
                self.id,
                self.topic_hash,
                self.subscribe_request.clone(),
            )
        })
    }

    /// Cancels the channel. The unsubscribe notice is sent in the
    /// background. Cancelling twice is a no-op.
    pub fn cancel(&self) -> bool {
        if !self.begin_cancel() {
            return false;
        }
        if let Some(notice) = self.unsubscribe_notice() {
            let conn = self.conn.clone();
            self.handle.spawn(async move {
                if let Err(e) = conn.send(&notice).await {
                    debug!(error = %e, "unsubscribe notice not delivered");
                }
            });
        }
        true
    }

    /// Like [`cancel`](Self::cancel) but waits until the notice is written.
    pub(crate) async fn cancel_now(&self) -> bool {
        if !self.begin_cancel() {
            return false;
        }
        self.send_unsubscribe().await;
        true
    }

    async fn send_unsubscribe(&self) {
        if let Some(notice) = self.unsubscribe_notice() {
            if let Err(e) = self.conn.send(&notice).await {
                debug!(error = %e, "unsubscribe notice not delivered");
            }
        }
    }

    /// Finishes off a channel that [`SubscriptionManager::register`]
    /// replaced: the peer hears the unsubscribe and the owner hears why.
    pub(crate) async fn supersede(&self) {
        self.send_unsubscribe().await;
        self.notify(ErrorKind::Cancelled, "superseded by a newer subscription");
    }

    fn fail(&self, error: &Error) -> bool {
        if !self.transition(ChannelState::Failed) {
            return false;
        }
        self.conn.remove_subscription(self.id);
        warn!(topic = %self.topic, id = self.id, %error, "subscription failed");
        self.notify(error.kind(), error.message());
        true
    }

    fn notify(&self, kind: ErrorKind, message: &str) {
        let callback = self
            .on_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(kind, message);
        }
    }
}

impl fmt::Debug for SubscriptionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionChannel")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

/// Delivers pushes to `on_message` until the channel ends.
pub(crate) async fn receive_loop(
    channel: Arc<SubscriptionChannel>,
    mut pushes: PushReceiver,
    mut on_message: Option<MessageFn>,
    codec: Arc<dyn Codec>,
    manager: Weak<SubscriptionManager>,
) {
    let span = debug_span!(
        "subscription",
        topic = %channel.topic,
        id = channel.id,
        remote = %channel.endpoint,
    );
    async move {
        let deregister = || {
            if let Some(manager) = manager.upgrade() {
                manager.deregister(&channel);
            }
        };
        let mut delivered = 0u64;
        while let Some(next) = pushes.recv().await {
            if !channel.is_active() {
                break;
            }
            let payload = next.and_then(|frame| match frame.kind {
                FrameKind::Push => codec.decode(&frame.body),
                FrameKind::Failure => {
                    let (message, partial) = codec.decode_topic(&frame.body)?;
                    Err(Error::remote(message, partial))
                }
                other => {
                    Err(Error::protocol(format!("{other:?} on a push stream")))
                }
            });
            let payload = match payload {
                Ok(payload) => payload,
                Err(e) => {
                    channel.fail(&e);
                    deregister();
                    return;
                }
            };
            delivered += 1;
            let delivery = match on_message.as_mut() {
                Some(on_message) => on_message(&payload),
                None => Delivery::Continue,
            };
            if delivery == Delivery::Cancel {
                debug!(delivered, "message handler cancelled the subscription");
                channel.cancel_now().await;
                deregister();
                return;
            }
        }
        // route dropped without an error: only possible if the connection
        // went away under us
        if channel.fail(&Error::connection_failed("push stream closed")) {
            deregister();
        }
        debug!(delivered, "receive loop finished");
    }
    .instrument(span)
    .await
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub endpoint: Endpoint,
    pub topic: String,
}

impl SubscriptionKey {
    pub fn new(endpoint: Endpoint, topic: &str) -> Self {
        Self {
            endpoint,
            topic: topic.to_owned(),
        }
    }
}

type Registry = HashMap<SubscriptionKey, Arc<SubscriptionChannel>>;

/// Registry of live subscriptions, at most one per (endpoint, topic).
#[derive(Default)]
pub struct SubscriptionManager {
    registry: Mutex<Registry>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `channel` under its key. An active channel already
    /// registered there is cancelled before the lock is released and handed
    /// back so the caller can [`supersede`](SubscriptionChannel::supersede)
    /// it.
    pub fn register(
        &self,
        channel: Arc<SubscriptionChannel>,
    ) -> Option<Arc<SubscriptionChannel>> {
        let key = SubscriptionKey::new(channel.endpoint(), channel.topic());
        let mut registry = self.registry();
        // state flip only; the notice goes out after the lock is gone
        registry
            .insert(key, channel)
            .filter(|previous| previous.begin_cancel())
    }

    /// Removes `channel` if it is still the one registered under its key.
    /// Idempotent.
    pub fn deregister(&self, channel: &SubscriptionChannel) -> bool {
        let key = SubscriptionKey::new(channel.endpoint(), channel.topic());
        let mut registry = self.registry();
        match registry.get(&key) {
            Some(current) if std::ptr::eq(&**current, channel) => {
                registry.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn remove(
        &self,
        endpoint: &Endpoint,
        topic: &str,
    ) -> Option<Arc<SubscriptionChannel>> {
        self.registry().remove(&SubscriptionKey::new(*endpoint, topic))
    }

    pub fn get(
        &self,
        endpoint: &Endpoint,
        topic: &str,
    ) -> Option<Arc<SubscriptionChannel>> {
        self.registry()
            .get(&SubscriptionKey::new(*endpoint, topic))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.registry().keys().cloned().collect()
    }

    /// Cancels and forgets every channel.
    pub fn clear(&self) {
        let channels: Vec<_> = self.registry().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.cancel();
        }
    }
}

/// Caller-side handle to a subscription. Dropping it leaves the
/// subscription running; call [`cancel`](Self::cancel) to end it.
#[derive(Clone)]
pub struct Subscription {
    channel: Arc<SubscriptionChannel>,
    manager: Weak<SubscriptionManager>,
}

impl Subscription {
    pub(crate) fn new(
        channel: Arc<SubscriptionChannel>,
        manager: Weak<SubscriptionManager>,
    ) -> Self {
        Self { channel, manager }
    }

    pub fn id(&self) -> u64 {
        self.channel.id()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.channel.endpoint()
    }

    pub fn topic(&self) -> &str {
        self.channel.topic()
    }

    pub fn topic_hash(&self) -> TopicHash {
        self.channel.topic_hash()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    /// Returns true if this call ended the subscription.
    pub fn cancel(&self) -> bool {
        let cancelled = self.channel.cancel();
        if let Some(manager) = self.manager.upgrade() {
            manager.deregister(&self.channel);
        }
        cancelled
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.channel.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use futures::future::BoxFuture;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::client::{
        codec::RkyvCodec,
        transport::{Duplex, Transport},
        wire::{read_frame, write_frame},
        Result,
    };

    struct PipeTransport {
        server_tx: tokio::sync::mpsc::UnboundedSender<DuplexStream>,
    }

    impl Transport for PipeTransport {
        fn connect(&self, _: Endpoint) -> BoxFuture<'static, Result<Duplex>> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let _ = self.server_tx.send(server);
            Box::pin(async move { Ok(Duplex::from_stream(client)) })
        }
    }

    fn endpoint() -> Endpoint {
        "127.0.0.1:7".parse().unwrap()
    }

    async fn connect() -> (Arc<Connection>, DuplexStream) {
        let (server_tx, mut server_rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Connection::open(
            &PipeTransport { server_tx },
            endpoint(),
            Duration::from_secs(1),
            1 << 20,
        )
        .await
        .unwrap();
        (conn, server_rx.recv().await.unwrap())
    }

    fn channel(
        conn: &Arc<Connection>,
        topic: &str,
        on_error: Option<ErrorFn>,
    ) -> (Arc<SubscriptionChannel>, PushReceiver) {
        let (id, pushes) = conn.register_subscription().unwrap();
        let request = RkyvCodec.encode(topic, &[]).unwrap();
        let channel = SubscriptionChannel::new(
            id,
            endpoint(),
            topic,
            7,
            request,
            on_error,
            conn.clone(),
            Handle::current(),
        );
        (Arc::new(channel), pushes)
    }

    async fn push(server: &mut DuplexStream, id: u64, payload: &[u8]) {
        let body = RkyvCodec.encode("ticker", payload).unwrap();
        let frame = Frame::new(FrameKind::Push, id, 7, body);
        write_frame(server, &frame).await.unwrap();
    }

    #[tokio::test]
    async fn registering_the_same_key_replaces_the_channel() {
        let (conn, _server) = connect().await;
        let manager = SubscriptionManager::new();
        let superseded = Arc::new(AtomicUsize::new(0));
        let counter = superseded.clone();
        let (first, _) = channel(
            &conn,
            "T",
            Some(Box::new(move |kind: ErrorKind, _: &str| {
                assert_eq!(kind, ErrorKind::Cancelled);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let (second, _) = channel(&conn, "T", None);

        assert!(manager.register(first.clone()).is_none());
        let replaced = manager.register(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        replaced.supersede().await;

        assert_eq!(manager.len(), 1);
        assert_eq!(first.state(), ChannelState::Cancelled);
        assert!(second.is_active());
        assert_eq!(superseded.load(Ordering::SeqCst), 1);

        // a stale channel cannot evict its replacement
        assert!(!manager.deregister(&first));
        assert!(manager.get(&endpoint(), "T").is_some());
        assert!(manager.deregister(&second));
        assert!(!manager.deregister(&second));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_tells_the_peer() {
        let (conn, mut server) = connect().await;
        let (channel, _pushes) = channel(&conn, "T", None);
        assert!(channel.cancel());
        assert!(!channel.cancel());
        assert!(!channel.cancel_now().await);

        let notice = read_frame(&mut server, 1 << 20).await.unwrap().unwrap();
        assert_eq!(notice.kind, FrameKind::Unsubscribe);
        assert_eq!(notice.seq, channel.id());
        assert_eq!(RkyvCodec.decode_topic(&notice.body).unwrap().0, "T");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_cancels_on_the_third_message() {
        let (conn, mut server) = connect().await;
        let manager = Arc::new(SubscriptionManager::new());
        let (channel, pushes) = channel(&conn, "ticker", None);
        manager.register(channel.clone());

        let (seen_tx, seen_rx) = mpsc::channel();
        let mut count = 0;
        let on_message: MessageFn = Box::new(move |payload: &[u8]| {
            count += 1;
            seen_tx.send(payload.to_vec()).unwrap();
            if count == 3 {
                Delivery::Cancel
            } else {
                Delivery::Continue
            }
        });
        let task = tokio::spawn(receive_loop(
            channel.clone(),
            pushes,
            Some(on_message),
            Arc::new(RkyvCodec),
            Arc::downgrade(&manager),
        ));

        for n in 1..=4u8 {
            push(&mut server, channel.id(), &[n]).await;
        }
        task.await.unwrap();

        let seen: Vec<_> = seen_rx.try_iter().collect();
        assert_eq!(seen, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(channel.state(), ChannelState::Cancelled);
        assert!(manager.is_empty());
        let notice = read_frame(&mut server, 1 << 20).await.unwrap().unwrap();
        assert_eq!(notice.kind, FrameKind::Unsubscribe);
    }

    #[tokio::test]
    async fn remote_failure_ends_the_stream() {
        let (conn, mut server) = connect().await;
        let manager = Arc::new(SubscriptionManager::new());
        let (err_tx, err_rx) = mpsc::channel();
        let (channel, pushes) = channel(
            &conn,
            "ticker",
            Some(Box::new(move |kind: ErrorKind, message: &str| {
                err_tx.send((kind, message.to_owned())).unwrap();
            })),
        );
        manager.register(channel.clone());
        let task = tokio::spawn(receive_loop(
            channel.clone(),
            pushes,
            None,
            Arc::new(RkyvCodec),
            Arc::downgrade(&manager),
        ));

        // messages without a handler are consumed silently
        push(&mut server, channel.id(), b"ignored").await;
        let body = RkyvCodec.encode("no such feed", &[]).unwrap();
        let failure = Frame::new(FrameKind::Failure, channel.id(), 7, body);
        write_frame(&mut server, &failure).await.unwrap();
        task.await.unwrap();

        assert_eq!(channel.state(), ChannelState::Failed);
        assert_eq!(
            err_rx.try_recv().unwrap(),
            (ErrorKind::RemoteError, "no such feed".to_owned())
        );
        assert!(err_rx.try_recv().is_err());
        assert!(manager.is_empty());
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn hangup_fails_active_channels() {
        let (conn, server) = connect().await;
        let (err_tx, err_rx) = mpsc::channel();
        let (channel, pushes) = channel(
            &conn,
            "ticker",
            Some(Box::new(move |kind: ErrorKind, _: &str| {
                err_tx.send(kind).unwrap()
            })),
        );
        let task = tokio::spawn(receive_loop(
            channel.clone(),
            pushes,
            None,
            Arc::new(RkyvCodec),
            Weak::new(),
        ));
        drop(server);
        task.await.unwrap();
        assert_eq!(channel.state(), ChannelState::Failed);
        assert_eq!(err_rx.try_recv().unwrap(), ErrorKind::ConnectionFailed);
    }
}
