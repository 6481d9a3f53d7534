// Command-line front end: one call, publish or subscription against a
// remote endpoint, printed to stdout.

use std::{
    sync::{mpsc, Arc},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dendrite::{
    client::{Codec, RawCodec, RkyvCodec, Transport, ZstdCodec},
    Client, ClientConfig, Delivery, Endpoint, IoContext, PoolConfig,
    SubscriptionHandlers, Timeout,
};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dendrite")]
#[command(about = "Talk to a dendrite endpoint")]
struct Cli {
    #[command(flatten)]
    conn: ConnArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnArgs {
    /// Remote endpoint (ip:port)
    #[arg(long, short, default_value = "127.0.0.1:7700")]
    endpoint: Endpoint,

    #[arg(long, value_enum, default_value_t = TransportKind::Tcp)]
    transport: TransportKind,

    /// Skip server certificate checks (QUIC only)
    #[arg(long)]
    insecure: bool,

    /// Server name to verify (QUIC only)
    #[arg(long, default_value = "localhost")]
    server_name: String,

    #[arg(long, value_enum, default_value_t = CodecKind::Rkyv)]
    codec: CodecKind,

    /// Compress bodies with zstd on top of the codec
    #[arg(long)]
    zstd: bool,

    /// I/O worker threads (0 = one per hardware thread)
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportKind {
    Tcp,
    Quic,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CodecKind {
    Rkyv,
    Raw,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a request and print the response
    Call {
        topic: String,
        /// Request payload
        data: String,
        /// Milliseconds to wait for the response (0 = forever)
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        /// Print the response as hex
        #[arg(long)]
        hex: bool,
    },
    /// Send a one-way message
    Publish {
        topic: String,
        data: String,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Print pushed messages until enough have arrived
    Subscribe {
        topic: String,
        /// Stop after this many messages (0 = never)
        #[arg(long, default_value_t = 0)]
        count: usize,
        #[arg(long)]
        hex: bool,
    },
}

fn codec(args: &ConnArgs) -> Arc<dyn Codec> {
    match (args.codec, args.zstd) {
        (CodecKind::Rkyv, false) => Arc::new(RkyvCodec),
        (CodecKind::Rkyv, true) => Arc::new(ZstdCodec::new(RkyvCodec)),
        (CodecKind::Raw, false) => Arc::new(RawCodec),
        (CodecKind::Raw, true) => Arc::new(ZstdCodec::new(RawCodec)),
    }
}

fn transport(args: &ConnArgs, io: &IoContext) -> Result<Arc<dyn Transport>> {
    match args.transport {
        TransportKind::Tcp => Ok(Arc::new(dendrite::client::TcpTransport)),
        #[cfg(feature = "quic")]
        TransportKind::Quic => {
            let config = dendrite::client::QuicConfig::builder()
                .server_name(args.server_name.clone())
                .insecure(args.insecure)
                .build();
            let transport = dendrite::client::QuicTransport::new(io, config)
                .context("cannot bind QUIC endpoint")?;
            debug!(local = %transport.local_addr()?, "quic endpoint bound");
            Ok(Arc::new(transport))
        }
        #[cfg(not(feature = "quic"))]
        TransportKind::Quic => {
            let _ = io;
            bail!("built without QUIC support")
        }
    }
}

fn render(payload: &[u8], hex: bool) -> String {
    if hex {
        payload.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        String::from_utf8_lossy(payload).into_owned()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    debug!(?cli, "starting");

    let mut pool = PoolConfig::default();
    if cli.conn.workers > 0 {
        pool.worker_threads = cli.conn.workers;
    }
    let io = IoContext::new(pool)?;
    let config = ClientConfig::builder()
        .codec(codec(&cli.conn))
        .transport(transport(&cli.conn, &io)?)
        .build();
    let client = Client::with_io_context(io, config);
    let endpoint = cli.conn.endpoint;

    match cli.command {
        Command::Call {
            topic,
            data,
            timeout_ms,
            hex,
        } => {
            let timeout = Timeout::from_millis(timeout_ms);
            let response = client
                .call(&endpoint, &topic, data.as_bytes(), timeout)
                .with_context(|| format!("call {topic} at {endpoint}"))?;
            println!("{}", render(&response, hex));
        }
        Command::Publish {
            topic,
            data,
            timeout_ms,
        } => {
            let timeout = Timeout::from_millis(timeout_ms);
            client
                .publish(&endpoint, &topic, data.as_bytes(), timeout)
                .with_context(|| format!("publish {topic} at {endpoint}"))?;
            info!(%topic, "published");
        }
        Command::Subscribe { topic, count, hex } => {
            let (tx, rx) = mpsc::channel();
            let failed = tx.clone();
            let mut received = 0;
            let handlers = SubscriptionHandlers::new()
                .on_message(move |payload| {
                    received += 1;
                    let _ = tx.send(Ok(render(payload, hex)));
                    if count > 0 && received >= count {
                        Delivery::Cancel
                    } else {
                        Delivery::Continue
                    }
                })
                .on_error(move |kind, message| {
                    let _ = failed.send(Err(format!("{kind}: {message}")));
                });
            let subscription = client
                .subscribe(&endpoint, &topic, handlers)
                .with_context(|| format!("subscribe {topic} at {endpoint}"))?;
            info!(%topic, id = subscription.id(), "subscribed");

            let mut printed = 0;
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(Ok(line)) => {
                        println!("{line}");
                        printed += 1;
                        if count > 0 && printed >= count {
                            break;
                        }
                    }
                    Ok(Err(reason)) => bail!("subscription ended: {reason}"),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !subscription.is_active() {
                            let state = subscription.state();
                            warn!(?state, "subscription ended");
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }
    Ok(())
}
