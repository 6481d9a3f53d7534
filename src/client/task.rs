use std::{future::Future, sync::Arc};

use tokio::sync::oneshot;
use tracing::{debug, debug_span, Instrument};

use super::{
    codec::Codec,
    connection::ConnectionPool,
    context::{CallContext, Completion, CompletionSink, Timeout},
    endpoint::Endpoint,
    error::{Error, Result},
    topic::TopicHash,
    wire::{Frame, FrameKind},
};
use crate::io::{self, IoContext};

/// Drives one [`CallContext`] through connect, send and (unless publishing)
/// await-response on the I/O pool, then resolves it.
pub(crate) struct CallTask {
    ctx: CallContext,
    endpoint: Endpoint,
    pool: Arc<ConnectionPool>,
    codec: Arc<dyn Codec>,
}

impl CallTask {
    pub fn new(
        ctx: CallContext,
        endpoint: Endpoint,
        pool: Arc<ConnectionPool>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            ctx,
            endpoint,
            pool,
            codec,
        }
    }

    /// Parks the calling thread until the exchange resolves.
    pub fn do_call_and_wait(mut self, io: &IoContext) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.ctx.set_completion(Completion::Wait(tx));
        io.spawn(self.run());
        io::wait(rx).unwrap_or_else(|| {
            Err(Error::cancelled("I/O pool stopped before the call completed"))
        })
    }

    /// Returns once the exchange is scheduled; `sink` hears the outcome.
    pub fn do_call(mut self, io: &IoContext, sink: Box<dyn CompletionSink>) {
        self.ctx.set_completion(Completion::Notify(sink));
        io.spawn(self.run());
    }

    async fn run(self) {
        let span = debug_span!(
            "call",
            topic = self.ctx.topic(),
            remote = %self.endpoint,
            publish = self.ctx.is_publish(),
        );
        let CallTask {
            ctx,
            endpoint,
            pool,
            codec,
        } = self;
        async move {
            // only borrow the context between await points; sinks are Send
            // but not Sync
            let outcome = match codec.encode(ctx.topic(), ctx.request()) {
                Ok(body) => {
                    let outbound = Outbound {
                        topic_hash: ctx.topic_hash(),
                        publish: ctx.is_publish(),
                        timeout: ctx.timeout(),
                        body,
                    };
                    exchange(&pool, &*codec, endpoint, outbound).await
                }
                Err(e) => Err(e),
            };
            match &outcome {
                Ok(response) => debug!(len = response.len(), "call completed"),
                Err(e) => debug!(error = %e, "call failed"),
            }
            ctx.resolve(outcome);
        }
        .instrument(span)
        .await
    }
}

struct Outbound {
    topic_hash: TopicHash,
    publish: bool,
    timeout: Timeout,
    body: Vec<u8>,
}

async fn exchange(
    pool: &ConnectionPool,
    codec: &dyn Codec,
    endpoint: Endpoint,
    outbound: Outbound,
) -> Result<Vec<u8>> {
    let conn = pool.get(endpoint).await?;

    if outbound.publish {
        let frame = Frame::new(
            FrameKind::Publish,
            conn.next_seq(),
            outbound.topic_hash,
            outbound.body,
        );
        // done as soon as the transport has taken the bytes
        return with_timeout(outbound.timeout, conn.send(&frame))
            .await
            .map(|_| Vec::new());
    }

    let pending = conn.register_call(outbound.topic_hash)?;
    let frame = Frame::new(
        FrameKind::Call,
        pending.seq(),
        outbound.topic_hash,
        outbound.body,
    );
    let reply = with_timeout(outbound.timeout, async {
        conn.send(&frame).await?;
        pending.reply().await
    })
    .await?;
    decode_reply(codec, reply)
}

/// The clock starts when the request is handed over for sending.
async fn with_timeout<T, F>(timeout: Timeout, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout.duration() {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            Error::timeout(format!("no response within {limit:?}"))
        })?,
    }
}

fn decode_reply(codec: &dyn Codec, reply: Frame) -> Result<Vec<u8>> {
    match reply.kind {
        FrameKind::Response => codec.decode(&reply.body),
        FrameKind::Failure => {
            let (message, partial) = codec.decode_topic(&reply.body)?;
            Err(Error::remote(message, partial))
        }
        other => Err(Error::protocol(format!("{other:?} is not a reply"))),
    }
}
