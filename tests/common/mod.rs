#![allow(dead_code)]

// Stub peer for the integration tests. It speaks the client's frame format
// with the default codec and knows a handful of topics:
//
//   echo       replies with the request payload
//   fail       answers with a remote failure carrying the payload
//   silent     never answers
//   slow       echoes after SLOW_REPLY
//   hangup     drops the connection
//   ticker     (subscribe) pushes TICKS messages, one every TICK
//   forbidden  (subscribe) rejects the subscription
//
// Any other subscription is accepted and stays quiet. Every inbound frame is
// recorded so tests can check what reached the peer.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use dendrite::{
    client::{read_frame, write_frame, Codec, Frame, FrameKind, RkyvCodec},
    ClientConfig, Endpoint, IoContext, PoolConfig,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::Mutex as AsyncMutex,
};

pub const SLOW_REPLY: Duration = Duration::from_millis(1500);
pub const TICKS: u8 = 5;
pub const TICK: Duration = Duration::from_millis(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pool() -> Arc<IoContext> {
    init_tracing();
    IoContext::new(PoolConfig::builder().worker_threads(2).build()).unwrap()
}

pub fn client(io: &Arc<IoContext>) -> dendrite::Client {
    dendrite::Client::with_io_context(io.clone(), ClientConfig::default())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seen {
    pub kind: FrameKind,
    pub seq: u64,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct Journal {
    connects: AtomicUsize,
    frames: Mutex<Vec<Seen>>,
}

impl Journal {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Seen> {
        self.frames.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: FrameKind) -> Vec<Seen> {
        self.frames().into_iter().filter(|f| f.kind == kind).collect()
    }

    /// Polls until `pred` holds or five seconds pass.
    pub fn wait_for(&self, pred: impl Fn(&[Seen]) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred(&self.frames()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    pub fn note_connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, seen: Seen) {
        self.frames.lock().unwrap().push(seen);
    }
}

pub struct StubServer {
    addr: SocketAddr,
    journal: Arc<Journal>,
}

impl StubServer {
    /// Listens on a loopback TCP port, served by `io`.
    pub fn tcp(io: &IoContext) -> Self {
        let listener = io
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let journal = Arc::new(Journal::default());
        let accepted = journal.clone();
        io.spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.note_connect();
                let (reader, writer) = stream.into_split();
                tokio::spawn(serve(reader, writer, accepted.clone()));
            }
        });
        Self { addr, journal }
    }

    pub fn from_parts(addr: SocketAddr, journal: Arc<Journal>) -> Self {
        Self { addr, journal }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.addr)
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

/// An endpoint nobody listens on.
pub fn dead_endpoint(io: &IoContext) -> Endpoint {
    let listener = io
        .block_on(TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Endpoint::from(addr)
}

type SharedWriter<W> = Arc<AsyncMutex<W>>;

async fn reply<W>(writer: &SharedWriter<W>, frame: Frame)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    let _ = write_frame(&mut *writer, &frame).await;
}

/// Serves one connection until the peer goes away or asks for a hangup.
pub async fn serve<R, W>(mut reader: R, writer: W, journal: Arc<Journal>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let codec = RkyvCodec;
    let writer: SharedWriter<W> = Arc::new(AsyncMutex::new(writer));
    let mut tasks = Vec::new();
    while let Ok(Some(frame)) = read_frame(&mut reader, 1 << 20).await {
        let Ok((topic, payload)) = codec.decode_topic(&frame.body) else {
            break;
        };
        journal.record(Seen {
            kind: frame.kind,
            seq: frame.seq,
            topic: topic.clone(),
            payload: payload.clone(),
        });
        let name = topic.clone();
        match (frame.kind, name.as_str()) {
            (FrameKind::Call, "echo") => {
                let body = codec.encode(&topic, &payload).unwrap();
                reply(&writer, frame.reply(FrameKind::Response, body)).await;
            }
            (FrameKind::Call, "fail") => {
                let body = codec.encode("bad request", &payload).unwrap();
                reply(&writer, frame.reply(FrameKind::Failure, body)).await;
            }
            (FrameKind::Call, "silent") => {}
            (FrameKind::Call, "slow") => {
                let writer = writer.clone();
                tasks.push(tokio::spawn(async move {
                    tokio::time::sleep(SLOW_REPLY).await;
                    let body = codec.encode(&topic, &payload).unwrap();
                    reply(&writer, frame.reply(FrameKind::Response, body)).await;
                }));
            }
            (FrameKind::Call, "hangup") => break,
            (FrameKind::Call, _) => {
                let body = codec.encode("unknown topic", &[]).unwrap();
                reply(&writer, frame.reply(FrameKind::Failure, body)).await;
            }
            (FrameKind::Subscribe, "ticker") => {
                let writer = writer.clone();
                tasks.push(tokio::spawn(async move {
                    for n in 1..=TICKS {
                        tokio::time::sleep(TICK).await;
                        let body = codec.encode(&topic, &[n]).unwrap();
                        reply(&writer, frame.reply(FrameKind::Push, body)).await;
                    }
                }));
            }
            (FrameKind::Subscribe, "forbidden") => {
                let body = codec.encode("not allowed", &[]).unwrap();
                reply(&writer, frame.reply(FrameKind::Failure, body)).await;
            }
            _ => {}
        }
    }
    for task in tasks {
        task.abort();
    }
}
