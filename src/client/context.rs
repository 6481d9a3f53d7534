use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::oneshot;
use tracing::trace;

use super::{
    error::{Error, ErrorKind, Result},
    topic::{TopicHash, TopicHasher, PUBLISH_HASH},
};

/// Receives the outcome of an asynchronous call. Exactly one of the two
/// methods is invoked, exactly once, on an arbitrary I/O worker thread.
pub trait CompletionSink: Send + 'static {
    fn on_success(self: Box<Self>, response: Vec<u8>);
    fn on_error(self: Box<Self>, kind: ErrorKind, message: &str);
}

type SuccessFn = Box<dyn FnOnce(Vec<u8>) + Send>;
type ErrorFn = Box<dyn FnOnce(ErrorKind, &str) + Send>;

/// Closure-based [`CompletionSink`]. A missing success closure discards the
/// response; a missing error closure swallows the failure.
#[derive(Default)]
pub struct Callbacks {
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ErrorKind, &str) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl CompletionSink for Callbacks {
    fn on_success(self: Box<Self>, response: Vec<u8>) {
        match self.on_success {
            Some(f) => f(response),
            None => trace!("no success callback, response discarded"),
        }
    }

    fn on_error(self: Box<Self>, kind: ErrorKind, message: &str) {
        match self.on_error {
            Some(f) => f(kind, message),
            None => {
                trace!(
                    %kind,
                    reason = message,
                    "no error callback, failure swallowed"
                )
            }
        }
    }
}

/// How long a call may wait for its response once the request has been
/// handed to the I/O layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Infinite,
    After(Duration),
}

impl Timeout {
    pub fn from_millis(ms: u64) -> Self {
        Duration::from_millis(ms).into()
    }

    pub fn from_micros(us: u64) -> Self {
        Duration::from_micros(us).into()
    }

    pub fn duration(self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(d) => Some(d),
        }
    }
}

impl From<Duration> for Timeout {
    /// A zero duration means no timeout at all.
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::Infinite
        } else {
            Timeout::After(d)
        }
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Timeout::Infinite, Timeout::from)
    }
}

pub(crate) enum Completion {
    /// A thread is parked on the other end.
    Wait(oneshot::Sender<Result<Vec<u8>>>),
    Notify(Box<dyn CompletionSink>),
}

/// State of one in-flight request: what is sent, how long to wait, who to
/// tell. Resolving consumes the context, so completion happens at most once
/// by construction.
pub struct CallContext {
    topic_hash: TopicHash,
    topic: Arc<str>,
    publish: bool,
    request: Vec<u8>,
    timeout: Timeout,
    completion: Option<Completion>,
}

impl CallContext {
    /// Validates the request and assigns its topic hash. Nothing touches
    /// the network until the context is handed to a task.
    pub fn new(
        hasher: &TopicHasher,
        topic: &str,
        payload: &[u8],
        publish: bool,
    ) -> Result<Self> {
        if topic.is_empty() {
            Err(Error::invalid_argument("topic is empty"))?
        }
        if payload.is_empty() {
            Err(Error::invalid_argument("request payload is empty"))?
        }
        let topic_hash = if publish {
            PUBLISH_HASH
        } else {
            hasher.register(topic)?
        };
        Ok(Self {
            topic_hash,
            topic: Arc::from(topic),
            publish,
            request: payload.to_vec(),
            timeout: Timeout::Infinite,
            completion: None,
        })
    }

    pub fn topic_hash(&self) -> TopicHash {
        self.topic_hash
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_publish(&self) -> bool {
        self.publish
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: impl Into<Timeout>) {
        self.timeout = timeout.into();
    }

    pub(crate) fn set_completion(&mut self, completion: Completion) {
        self.completion = Some(completion);
    }

    /// Delivers the outcome and drops the context.
    pub(crate) fn resolve(self, outcome: Result<Vec<u8>>) {
        match (self.completion, outcome) {
            (Some(Completion::Wait(tx)), outcome) => {
                // the waiter may have given up; nothing else to tell
                let _ = tx.send(outcome);
            }
            (Some(Completion::Notify(sink)), Ok(response)) => {
                sink.on_success(response)
            }
            (Some(Completion::Notify(sink)), Err(e)) => {
                sink.on_error(e.kind(), e.message())
            }
            (None, outcome) => {
                trace!(ok = outcome.is_ok(), "call resolved without a listener")
            }
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("topic", &self.topic)
            .field("topic_hash", &self.topic_hash)
            .field("publish", &self.publish)
            .field("request_len", &self.request.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
