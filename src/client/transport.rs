use std::{any::Any, fmt};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::debug;

use super::{endpoint::Endpoint, error::Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established byte stream, split into halves so the read loop and the
/// senders never contend for the same lock.
pub struct Duplex {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    // whatever must outlive the halves, e.g. the QUIC connection
    keepalive: Option<Box<dyn Any + Send + Sync>>,
}

impl Duplex {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            keepalive: None,
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer))
    }

    pub fn with_keepalive<K: Any + Send + Sync>(mut self, keepalive: K) -> Self {
        self.keepalive = Some(Box::new(keepalive));
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (BoxedReader, BoxedWriter, Option<Box<dyn Any + Send + Sync>>) {
        (self.reader, self.writer, self.keepalive)
    }
}

impl fmt::Debug for Duplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex")
            .field("keepalive", &self.keepalive.is_some())
            .finish_non_exhaustive()
    }
}

/// Opens byte streams to endpoints. Every connection the client makes goes
/// through exactly one `connect`.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, Result<Duplex>>;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Plain TCP with Nagle disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, Result<Duplex>> {
        Box::pin(async move {
            let stream = TcpStream::connect(endpoint.socket_addr()).await?;
            stream.set_nodelay(true)?;
            debug!(local = ?stream.local_addr().ok(), "tcp connected");
            let (reader, writer) = stream.into_split();
            Ok(Duplex::new(Box::new(reader), Box::new(writer)))
        })
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(feature = "quic")]
pub use quic::{QuicConfig, QuicTransport};

#[cfg(feature = "quic")]
mod quic {
    use std::{
        fs::File,
        io::BufReader,
        net::SocketAddr,
        path::PathBuf,
        sync::Arc,
        time::{Duration, SystemTime},
    };

    use futures::future::BoxFuture;
    use rustls::{
        client::{ServerCertVerified, ServerCertVerifier, ServerName},
        Certificate,
    };
    use tracing::debug;
    use typed_builder::TypedBuilder;

    use super::{Duplex, Transport};
    use crate::{
        client::{
            endpoint::Endpoint,
            error::{Error, Result},
        },
        io::IoContext,
    };

    #[derive(Clone, Debug, TypedBuilder)]
    pub struct QuicConfig {
        /// Name checked against the server certificate.
        #[builder(default = "localhost".into(), setter(into))]
        pub server_name: String,
        /// PEM bundle of trusted roots. Without it (and without `insecure`)
        /// no server certificate validates.
        #[builder(default, setter(strip_option, into))]
        pub root_ca_pem: Option<PathBuf>,
        /// Accept any server certificate. For self-signed test peers only.
        #[builder(default = false)]
        pub insecure: bool,
        #[builder(default = Duration::from_secs(5))]
        pub keep_alive_interval: Duration,
        #[builder(default = SocketAddr::from(([0, 0, 0, 0], 0)))]
        pub bind_addr: SocketAddr,
    }

    /// One bidirectional QUIC stream per connection, carried by a single
    /// local quinn endpoint shared by every connection of the transport.
    pub struct QuicTransport {
        endpoint: quinn::Endpoint,
        server_name: String,
    }

    impl QuicTransport {
        /// Binds the local UDP socket on the given pool.
        pub fn new(io: &IoContext, config: QuicConfig) -> Result<Self> {
            let tls = tls_config(&config)?;

            // keep idle connections alive between sparse calls
            let mut transport_config = quinn::TransportConfig::default();
            transport_config
                .keep_alive_interval(Some(config.keep_alive_interval));
            let mut client_config = quinn::ClientConfig::new(Arc::new(tls));
            client_config.transport_config(Arc::new(transport_config));

            let _guard = io.handle().enter();
            let mut endpoint = quinn::Endpoint::client(config.bind_addr)?;
            endpoint.set_default_client_config(client_config);
            Ok(Self {
                endpoint,
                server_name: config.server_name,
            })
        }

        pub fn local_addr(&self) -> Result<SocketAddr> {
            Ok(self.endpoint.local_addr()?)
        }
    }

    impl Transport for QuicTransport {
        fn connect(
            &self,
            remote: Endpoint,
        ) -> BoxFuture<'static, Result<Duplex>> {
            let endpoint = self.endpoint.clone();
            let server_name = self.server_name.clone();
            Box::pin(async move {
                let conn =
                    endpoint.connect(remote.socket_addr(), &server_name)?.await?;
                debug!(id = conn.stable_id(), "connected via QUIC");
                let (send, recv) = conn.open_bi().await?;
                Ok(Duplex::new(Box::new(recv), Box::new(send))
                    .with_keepalive(conn))
            })
        }

        fn name(&self) -> &'static str {
            "quic"
        }
    }

    fn tls_config(config: &QuicConfig) -> Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder().with_safe_defaults();
        if config.insecure {
            return Ok(builder
                .with_custom_certificate_verifier(Arc::new(
                    SkipServerVerification,
                ))
                .with_no_client_auth());
        }
        let mut roots = rustls::RootCertStore::empty();
        if let Some(path) = &config.root_ca_pem {
            let file = File::open(path).map_err(|e| {
                Error::invalid_argument(format!("{}: {e}", path.display()))
            })?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(file))
                .map_err(|e| {
                    Error::invalid_argument(format!("{}: {e}", path.display()))
                })?;
            for der in certs {
                roots.add(&Certificate(der))?;
            }
        }
        Ok(builder.with_root_certificates(roots).with_no_client_auth())
    }

    struct SkipServerVerification;

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &Certificate,
            _intermediates: &[Certificate],
            _server_name: &ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: SystemTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }
    }
}
