use std::collections::{HashMap, HashSet};
#[cfg(feature = "tls-rustls")]
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
#[cfg(feature = "tls-rustls")]
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "tls-rustls")]
use std::sync::LazyLock;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::controls::RawControl;
#[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
use crate::exop_impl::StartTLS;
use crate::ldap::{next_msgid, Ldap};
use crate::protocol::{
    ItemSender, LdapCodec, LdapOp, MaybeControls, ResultSender, DEFAULT_MAX_MESSAGE,
};
use crate::result::{LdapError, Result};
use crate::search::SearchItem;
use crate::RequestId;

use lber::common::TagClass;
use lber::structures::{Null, Tag};
use lber::DecodeError;

use futures_util::future::FutureExt;
#[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
use futures_util::future::TryFutureExt;
use futures_util::sink::SinkExt;
#[cfg(feature = "tls-native")]
use native_tls::TlsConnector;
#[cfg(unix)]
use percent_encoding::percent_decode;
#[cfg(feature = "tls-rustls")]
use rustls::{pki_types::CertificateDer, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, error::SendError, error::TrySendError, OwnedPermit};
#[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
use tokio::sync::oneshot;
use tokio::time;
#[cfg(all(feature = "tls-native", not(feature = "tls-rustls")))]
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream};
#[cfg(all(feature = "tls-rustls", not(feature = "tls-native")))]
use tokio_rustls::{client::TlsStream, TlsConnector as TokioTlsConnector};
use tokio_stream::StreamExt;
#[cfg(all(feature = "tls-native", feature = "tls-rustls"))]
compile_error!(r#"Only one of "tls-native" and "tls-rustls" may be enabled for TLS support"#);
#[cfg(all(feature = "tls-rustls", not(feature = "rustls-provider")))]
compile_error!(
    r#"No crypto provider selected for Rustls, use "tls-rustls-aws-lc-rs" or "tls-rustls-ring""#
);
use tokio_util::codec::{Decoder, Framed};
use url::{Host, Url};

const DEFAULT_SEARCH_BUFFER: usize = 32;

#[derive(Debug)]
enum ConnType {
    Tcp(TcpStream),
    #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
    Tls(TlsStream<TcpStream>),
    #[cfg(unix)]
    Unix(UnixStream),
}

#[cfg(feature = "tls-rustls")]
#[derive(Debug)]
struct NoCertVerification;

#[cfg(feature = "tls-rustls")]
impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer,
        _: &[CertificateDer],
        _: &ServerName,
        _: &[u8],
        _: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer,
        _: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(feature = "tls-rustls")]
static CACERTS: LazyLock<RootCertStore> = LazyLock::new(|| {
    let mut store = RootCertStore::empty();
    let cert_res = rustls_native_certs::load_native_certs();
    for e in &cert_res.errors {
        warn!("error loading native certificates: {}", e);
    }
    for cert in cert_res.certs {
        if let Err(e) = store.add(cert) {
            debug!("skipping native certificate: {}", e);
        }
    }
    store
});

impl AsyncRead for ConnType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_read(cx, buf),
            #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
            ConnType::Tls(tls) => Pin::new(tls).poll_read(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnType {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_write(cx, buf),
            #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
            ConnType::Tls(tls) => Pin::new(tls).poll_write(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_flush(cx),
            #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
            ConnType::Tls(tls) => Pin::new(tls).poll_flush(cx),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_shutdown(cx),
            #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
            ConnType::Tls(tls) => Pin::new(tls).poll_shutdown(cx),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_shutdown(cx),
        }
    }
}

/// Existing stream from which a connection can be created.
///
/// A connection may be created from a previously opened TCP or Unix
/// stream (the latter only if Unix domain sockets are supported) by
/// placing an instance of this structure in `LdapConnSettings`.
///
/// Since the stdlib streams can't be cloned, and `LdapConnSettings`
/// derives `Clone`, cloning the enum will produce the `Invalid`
/// variant. Thus, the settings should not be cloned if they
/// contain an existing stream.
pub enum StdStream {
    Tcp(std::net::TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Invalid,
}

impl Clone for StdStream {
    fn clone(&self) -> StdStream {
        StdStream::Invalid
    }
}

/// Additional settings for an LDAP connection.
///
/// The structure is opaque for better extensibility. An instance with
/// default values is constructed by [`new()`](#method.new), and all
/// available settings can be replaced through a builder-like interface,
/// by calling the appropriate functions.
#[derive(Clone, Default)]
pub struct LdapConnSettings {
    conn_timeout: Option<Duration>,
    op_timeout: Option<Duration>,
    search_buffer: Option<usize>,
    max_message: Option<usize>,
    #[cfg(feature = "tls-native")]
    connector: Option<TlsConnector>,
    #[cfg(feature = "tls-rustls")]
    config: Option<Arc<ClientConfig>>,
    #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
    starttls: bool,
    #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
    no_tls_verify: bool,
    std_stream: Option<StdStream>,
}

impl LdapConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings {
            ..Default::default()
        }
    }

    /// Set the connection timeout. If a connetion to the server can't
    /// be established before the timeout expires, an error will be
    /// returned to the user. Defaults to `None`, meaning an infinite
    /// timeout.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    /// Set the default timeout for every operation on the connection, used when
    /// the operation isn't given its own with
    /// [`Ldap::with_timeout()`](struct.Ldap.html#method.with_timeout).
    ///
    /// The same value bounds each socket write. Defaults to `None`, meaning
    /// no timeout.
    pub fn set_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Set the number of items a streaming Search buffers before the connection
    /// stops reading from the socket, waiting for the consumer to catch up.
    /// Defaults to 32; zero is treated as one.
    pub fn set_search_buffer(mut self, size: usize) -> Self {
        self.search_buffer = Some(size);
        self
    }

    /// Set the largest message, in bytes, accepted from the server. A message
    /// announcing a greater length fails the connection with a decoding error
    /// as soon as its header arrives. Defaults to 64 MiB.
    pub fn set_max_message_size(mut self, size: usize) -> Self {
        self.max_message = Some(size);
        self
    }

    #[cfg(feature = "tls-native")]
    /// Set a custom TLS connector, which enables setting various options
    /// when establishing a secure connection. The default of `None` will
    /// use a connector with default settings.
    pub fn set_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    #[cfg(feature = "tls-rustls")]
    /// Set a custom TLS configuration, which enables setting various options
    /// when establishing a secure connection. The default of `None` will
    /// use a configuration with default values.
    ///
    /// The default configuration will try to load the system certificate store
    /// and use it for verification.
    pub fn set_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.config = Some(config);
        self
    }

    #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
    /// If `true`, use the StartTLS extended operation to establish a
    /// secure connection. Defaults to `false`.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
    /// The `starttls` settings indicates whether the StartTLS extended
    /// operation will be used to establish a secure connection.
    pub fn starttls(&self) -> bool {
        self.starttls
    }

    #[cfg(not(any(feature = "tls-native", feature = "tls-rustls")))]
    /// Always `false` when no TLS support is compiled in.
    pub fn starttls(&self) -> bool {
        false
    }

    #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
    /// If `true`, try to establish a TLS connection without certificate
    /// verification. Defaults to `false`.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }

    /// Create an LDAP connection using a previously opened standard library
    /// stream (TCP or Unix, if applicable.) The full URL must still be provided
    /// in order to select connection details, such as TLS establishment or
    /// Unix domain socket operation.
    ///
    /// For Unix streams, the URL can be __ldapi:///__, since the path won't
    /// be used.
    ///
    /// If the provided stream doesn't match the URL (e.g., a Unix stream is
    /// given with the __ldap__ or __ldaps__ URL), an error will be returned.
    pub fn set_std_stream(mut self, stream: StdStream) -> Self {
        self.std_stream = Some(stream);
        self
    }
}

/// State of a connection shared between the connection task and all handles.
#[derive(Debug, Default)]
pub(crate) struct ConnState {
    closing: AtomicBool,
    last_error: OnceLock<Arc<io::Error>>,
}

impl ConnState {
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Record a terminal failure. Only the first one sticks.
    fn fail(&self, err: io::Error) -> LdapError {
        let ret = io::Error::new(err.kind(), err.to_string());
        if self.last_error.set(Arc::new(err)).is_ok() {
            error!("LDAP connection terminated: {}", ret);
        }
        self.close();
        LdapError::from(ret)
    }

    pub(crate) fn last_error(&self) -> Option<Arc<io::Error>> {
        self.last_error.get().cloned()
    }

    /// Error for an operation interrupted by the loss of the connection.
    pub(crate) fn closed_error(&self) -> LdapError {
        let decoding = self
            .last_error
            .get()
            .and_then(|e| e.get_ref())
            .and_then(|e| e.downcast_ref::<DecodeError>());
        match decoding {
            Some(de) => LdapError::Decoding { source: de.clone() },
            None => LdapError::ConnectionClosed,
        }
    }
}

// Marks the connection as closing before any waiter channel is dropped,
// which is why it's the first field of the connection struct.
struct Closer(Arc<ConnState>);

impl Drop for Closer {
    fn drop(&mut self) {
        self.0.close();
    }
}

enum LoopMode {
    #[cfg_attr(not(any(feature = "tls-native", feature = "tls-rustls")), allow(dead_code))]
    SingleOp,
    Continuous,
}

type Pending = (RequestId, ItemSender, (SearchItem, Vec<RawControl>));

#[allow(clippy::needless_doctest_main)]
/// Asynchronous connection to an LDAP server. __*__
///
/// Opening a connection with [`new()`](#method.new) will return a tuple consisting of
/// the connection itself and an [`Ldap`](struct.Ldap.html) handle for performing the LDAP
/// operations. The connection must be spawned on the active Tokio executor before using
/// the handle. A convenience macro, [`drive!`](macro.drive.html), is provided by the
/// library. For the connection `conn`, it does the equivalent of:
///
/// ```rust,no_run
/// # use ldapmux::LdapConnAsync;
/// # use log::warn;
/// # #[tokio::main]
/// # async fn main() {
/// # let (conn, _ldap) = LdapConnAsync::new("ldap://localhost:2389").await.unwrap();
/// tokio::spawn(async move {
///     if let Err(e) = conn.drive().await {
///         warn!("LDAP connection error: {}", e);
///     }
/// });
/// # }
/// ```
///
/// The connection task is the only reader of the socket. It writes requests in the order
/// they're submitted by the handles, routes every response to the operation waiting for
/// its message ID, and drops responses nobody is waiting for. A streaming Search gets a
/// bounded queue; while the queue is full, the task stops reading from the socket.
///
/// The `Ldap` handle can be freely cloned, with each clone capable of launching a separate
/// LDAP operation multiplexed on the original connection. Dropping the last handle will
/// send an Unbind and close the connection.
///
/// When the task ends because of an I/O or decoding error, the error is kept and can be
/// retrieved through [`Ldap::last_error()`](struct.Ldap.html#method.last_error); all
/// waiting and subsequent operations fail.
pub struct LdapConnAsync {
    closer: Closer,
    msgmap: Arc<Mutex<(RequestId, HashSet<RequestId>)>>,
    resultmap: HashMap<RequestId, ResultSender>,
    searchmap: HashMap<RequestId, ItemSender>,
    pending: Option<Pending>,
    rx: mpsc::UnboundedReceiver<(RequestId, LdapOp, Tag, MaybeControls, ResultSender)>,
    id_scrub_rx: mpsc::UnboundedReceiver<RequestId>,
    write_timeout: Option<Duration>,
    stream: Framed<ConnType, LdapCodec>,
}

/// Drive the connection until its completion. __*__
///
/// See the introduction of [LdapConnAsync](struct.LdapConnAsync.html) for the exact code produced by
/// the macro.
#[macro_export]
macro_rules! drive {
    ($conn:expr) => {
        $crate::tokio::spawn(async move {
            if let Err(e) = $conn.drive().await {
                $crate::log::warn!("LDAP connection error: {}", e);
            }
        });
    };
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

async fn reserve_slot(
    tx: Option<ItemSender>,
) -> std::result::Result<OwnedPermit<(SearchItem, Vec<RawControl>)>, SendError<()>> {
    match tx {
        Some(tx) => tx.reserve_owned().await,
        None => std::future::pending().await,
    }
}

fn ack(id: RequestId, tx: ResultSender) {
    if tx
        .send((Tag::Null(Null { ..Default::default() }), vec![]))
        .is_err()
    {
        warn!("ldap null result send error, op={}", id);
    }
}

impl LdapConnAsync {
    /// Open a connection to an LDAP server specified by `url`, using
    /// `settings` to specify additional parameters.
    pub async fn with_settings(settings: LdapConnSettings, url: &str) -> Result<(Self, Ldap)> {
        let url = Url::parse(url)?;
        Self::from_url_with_settings(settings, &url).await
    }

    /// Open a connection to an LDAP server specified by `url`.
    ///
    /// The `url` is an LDAP URL. Depending on the platform and compile-time features, the
    /// library will recognize one or more URL schemes.
    ///
    /// The __ldap__ scheme, which uses a plain TCP connection, is always available. Unix-like
    /// platforms also support __ldapi__, using Unix domain sockets. With the __tls-native__ or
    /// __tls-rustls__ feature, the __ldaps__ scheme and StartTLS over __ldap__ are additionally
    /// supported. Default ports are 389 for __ldap__ and 636 for __ldaps__.
    ///
    /// The connection element in the returned tuple must be spawned on the current Tokio
    /// executor before using the `Ldap` element. See the introduction to this struct's
    /// documentation.
    pub async fn new(url: &str) -> Result<(Self, Ldap)> {
        Self::with_settings(LdapConnSettings::new(), url).await
    }

    /// Open a connection to an LDAP server specified by an already parsed `Url`, using
    /// `settings` to specify additional parameters.
    pub async fn from_url_with_settings(
        settings: LdapConnSettings,
        url: &Url,
    ) -> Result<(Self, Ldap)> {
        if url.scheme() == "ldapi" {
            LdapConnAsync::new_unix(url, settings).await
        } else {
            let mut settings = settings;
            let timeout = settings.conn_timeout.take();
            let conn_future = LdapConnAsync::new_tcp(url, settings);
            Ok(if let Some(timeout) = timeout {
                time::timeout(timeout, conn_future).await?
            } else {
                conn_future.await
            }?)
        }
    }

    /// Open a connection to an LDAP server specified by an already parsed `Url`.
    pub async fn from_url(url: &Url) -> Result<(Self, Ldap)> {
        Self::from_url_with_settings(LdapConnSettings::new(), url).await
    }

    #[cfg(unix)]
    async fn new_unix(url: &Url, mut settings: LdapConnSettings) -> Result<(Self, Ldap)> {
        let stream = match settings.std_stream.take() {
            None => {
                let path = url.host_str().unwrap_or("");
                if path.is_empty() {
                    return Err(LdapError::EmptyUnixPath);
                }
                if path.contains(':') {
                    return Err(LdapError::PortInUnixPath);
                }
                let dec_path = percent_decode(path.as_bytes()).decode_utf8_lossy();
                UnixStream::connect(dec_path.as_ref()).await?
            }
            Some(StdStream::Unix(stream)) => {
                stream.set_nonblocking(true)?;
                UnixStream::from_std(stream)?
            }
            Some(StdStream::Tcp(_)) | Some(StdStream::Invalid) => {
                return Err(LdapError::MismatchedStreamType)
            }
        };
        Ok(Self::conn_pair(ConnType::Unix(stream), &settings))
    }

    #[cfg(not(unix))]
    async fn new_unix(_url: &Url, _settings: LdapConnSettings) -> Result<(Self, Ldap)> {
        Err(LdapError::UnknownScheme(String::from("ldapi")))
    }

    #[allow(unused_mut)]
    async fn new_tcp(url: &Url, mut settings: LdapConnSettings) -> Result<(Self, Ldap)> {
        let mut port = 389;
        let scheme = match url.scheme() {
            s @ "ldap" => {
                if settings.starttls() {
                    "starttls"
                } else {
                    s
                }
            }
            #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
            s @ "ldaps" => {
                settings = settings.set_starttls(false);
                port = 636;
                s
            }
            s => return Err(LdapError::UnknownScheme(String::from(s))),
        };
        if let Some(url_port) = url.port() {
            port = url_port;
        }
        let hostname = match url.host() {
            Some(Host::Domain(h)) if !h.is_empty() => h.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => String::from("localhost"),
        };
        let stream = match settings.std_stream.take() {
            None => TcpStream::connect((hostname.as_str(), port)).await?,
            Some(StdStream::Tcp(stream)) => {
                stream.set_nonblocking(true)?;
                TcpStream::from_std(stream)?
            }
            Some(_) => return Err(LdapError::MismatchedStreamType),
        };
        let (mut conn, mut ldap) = Self::conn_pair(ConnType::Tcp(stream), &settings);
        match scheme {
            "ldap" => (),
            #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
            s @ "ldaps" | s @ "starttls" => {
                if s == "starttls" {
                    let (tx, rx) = oneshot::channel();
                    tokio::spawn(async move {
                        conn.single_op(tx).await;
                    });
                    let (conn_res, res) =
                        tokio::try_join!(rx.map_err(LdapError::from), ldap.extended(StartTLS))?;
                    conn = conn_res?;
                    res.success()?;
                }
                let parts = conn.stream.into_parts();
                let stream = match parts.io {
                    ConnType::Tcp(stream) => stream,
                    _ => return Err(LdapError::MismatchedStreamType),
                };
                let tls_stream = LdapConnAsync::create_tls_stream(settings, &hostname, stream).await?;
                #[cfg(all(feature = "ntlm", feature = "tls-native"))]
                {
                    ldap.tls_endpoint_token =
                        Arc::new(LdapConnAsync::get_tls_endpoint_token(&tls_stream));
                }
                conn.stream = parts.codec.framed(ConnType::Tls(tls_stream));
                ldap.has_tls = true;
            }
            s => return Err(LdapError::UnknownScheme(String::from(s))),
        }
        Ok((conn, ldap))
    }

    #[cfg(feature = "tls-native")]
    async fn create_tls_stream(
        settings: LdapConnSettings,
        hostname: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>> {
        let connector = match settings.connector {
            Some(ref connector) => connector.clone(),
            None => LdapConnAsync::create_connector(&settings)?,
        };
        TokioTlsConnector::from(connector)
            .connect(hostname, stream)
            .await
            .map_err(LdapError::from)
    }

    #[cfg(feature = "tls-rustls")]
    async fn create_tls_stream(
        settings: LdapConnSettings,
        hostname: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>> {
        let no_tls_verify = settings.no_tls_verify;
        let config = match settings.config {
            Some(ref config) => config.clone(),
            None => LdapConnAsync::create_config(&settings),
        };
        let server_name = ServerName::try_from(hostname)
            .map(|sn| sn.to_owned())
            .or_else(|e| {
                if no_tls_verify && IpAddr::from_str(hostname).is_ok() {
                    ServerName::try_from("_irrelevant")
                } else {
                    Err(e)
                }
            })?;
        TokioTlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(LdapError::from)
    }

    #[cfg(feature = "tls-rustls")]
    fn create_config(settings: &LdapConnSettings) -> Arc<ClientConfig> {
        let mut config = ClientConfig::builder()
            .with_root_certificates(CACERTS.clone())
            .with_no_client_auth();
        if settings.no_tls_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertVerification));
        }
        Arc::new(config)
    }

    #[cfg(feature = "tls-native")]
    fn create_connector(settings: &LdapConnSettings) -> Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if settings.no_tls_verify {
            builder.danger_accept_invalid_certs(true);
        }
        Ok(builder.build()?)
    }

    #[cfg(all(feature = "ntlm", feature = "tls-native"))]
    fn get_tls_endpoint_token(s: &TlsStream<TcpStream>) -> Option<Vec<u8>> {
        match s.get_ref().tls_server_end_point() {
            Ok(ep) => {
                if ep.is_none() {
                    warn!("no endpoint token returned");
                }
                ep
            }
            Err(e) => {
                warn!("error calculating endpoint token: {}", e);
                None
            }
        }
    }

    fn conn_pair(ctype: ConnType, settings: &LdapConnSettings) -> (Self, Ldap) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id_scrub_tx, id_scrub_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnState::default());
        let conn = LdapConnAsync {
            closer: Closer(state.clone()),
            msgmap: Arc::new(Mutex::new((0, HashSet::new()))),
            resultmap: HashMap::new(),
            searchmap: HashMap::new(),
            pending: None,
            rx,
            id_scrub_rx,
            write_timeout: settings.op_timeout,
            stream: LdapCodec::new(settings.max_message.unwrap_or(DEFAULT_MAX_MESSAGE))
                .framed(ctype),
        };
        let ldap = Ldap {
            msgmap: conn.msgmap.clone(),
            tx,
            id_scrub_tx,
            state,
            #[cfg(all(feature = "ntlm", feature = "tls-native"))]
            tls_endpoint_token: Arc::new(None),
            has_tls: false,
            search_buffer: settings
                .search_buffer
                .unwrap_or(DEFAULT_SEARCH_BUFFER)
                .max(1),
            default_timeout: settings.op_timeout,
            last_id: 0,
            timeout: None,
            controls: None,
            search_opts: None,
            cancel: None,
        };
        (conn, ldap)
    }

    /// Repeatedly poll the connection until it exits.
    ///
    /// A panic inside the connection task is caught and recorded as the
    /// connection's terminal error.
    pub async fn drive(self) -> Result<()> {
        let state = self.closer.0.clone();
        match AssertUnwindSafe(self.turn(LoopMode::Continuous))
            .catch_unwind()
            .await
        {
            Ok(res) => res.map(|_| ()),
            Err(_) => Err(state.fail(io::Error::new(
                io::ErrorKind::Other,
                "connection task panicked",
            ))),
        }
    }

    #[cfg(any(feature = "tls-native", feature = "tls-rustls"))]
    pub(crate) async fn single_op(self, tx: oneshot::Sender<Result<Self>>) {
        if tx.send(self.turn(LoopMode::SingleOp).await).is_err() {
            warn!("single op send error");
        }
    }

    fn release(&mut self, id: RequestId) {
        self.resultmap.remove(&id);
        self.searchmap.remove(&id);
        let mut msgmap = self.msgmap.lock().unwrap_or_else(PoisonError::into_inner);
        msgmap.1.remove(&id);
    }

    fn scrub(&mut self, id: RequestId) {
        if self.pending.as_ref().is_some_and(|p| p.0 == id) {
            self.pending = None;
        }
        self.release(id);
    }

    async fn write(&mut self, id: RequestId, tag: Tag, controls: MaybeControls) -> Result<()> {
        let res = match self.write_timeout {
            Some(timeout) => time::timeout(timeout, self.stream.send((id, tag, controls)))
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))),
            None => self.stream.send((id, tag, controls)).await,
        };
        res.map_err(|e| self.closer.0.fail(e))
    }

    // Sent when the last handle goes away.
    async fn farewell(&mut self) {
        if self.closer.0.is_closing() {
            return;
        }
        self.closer.0.close();
        let Some(id) = next_msgid(&self.msgmap) else {
            return;
        };
        let unbind = Tag::Null(Null {
            id: 2,
            class: TagClass::Application,
            inner: (),
        });
        if let Err(e) = self.stream.send((id, unbind, None)).await {
            debug!("unbind on close: {}", e);
        }
        if let Err(e) = self.stream.close().await {
            debug!("socket close error: {}", e);
        }
    }

    async fn request(
        &mut self,
        id: RequestId,
        op: LdapOp,
        tag: Tag,
        controls: MaybeControls,
        tx: ResultSender,
    ) -> Result<bool> {
        match op {
            LdapOp::Single => {
                self.resultmap.insert(id, tx);
                self.write(id, tag, controls).await?;
            }
            LdapOp::Search(search_tx) => {
                self.searchmap.insert(id, search_tx);
                self.write(id, tag, controls).await?;
                ack(id, tx);
            }
            LdapOp::Abandon(msgid) => {
                self.scrub(msgid);
                self.release(id);
                self.write(id, tag, controls).await?;
                ack(id, tx);
            }
            LdapOp::Unbind => {
                self.release(id);
                self.closer.0.close();
                self.write(id, tag, controls).await?;
                if let Err(e) = self.stream.close().await {
                    warn!("socket close error: {}", e);
                }
                ack(id, tx);
                return Ok(false);
            }
        }
        Ok(true)
    }

    // Returns true when a result was delivered to a single-response waiter.
    fn response(&mut self, id: RequestId, tag: Tag, controls: Vec<RawControl>) -> Result<bool> {
        if let Some(tx) = self.searchmap.get(&id).cloned() {
            let protoop = match tag {
                Tag::StructureTag(protoop) => protoop,
                _ => {
                    return Err(self
                        .closer
                        .0
                        .fail(invalid_data(format!("unstructured search response, op={}", id))))
                }
            };
            let item = match protoop.id {
                4 => SearchItem::Entry(protoop),
                5 => SearchItem::Done(protoop),
                19 => SearchItem::Referral(protoop),
                25 => SearchItem::Intermediate(protoop),
                other => {
                    return Err(self.closer.0.fail(invalid_data(format!(
                        "unexpected protocol op {} in search response, op={}",
                        other, id
                    ))))
                }
            };
            let done = matches!(item, SearchItem::Done(_));
            match tx.try_send((item, controls)) {
                Ok(()) if done => self.release(id),
                Ok(()) => (),
                Err(TrySendError::Full(item)) => self.pending = Some((id, tx, item)),
                Err(TrySendError::Closed(_)) => {
                    warn!("ldap search item send error, op={}", id);
                    self.release(id);
                }
            }
        } else if let Some(tx) = self.resultmap.remove(&id) {
            self.release(id);
            if tx.send((tag, controls)).is_err() {
                warn!("ldap result send error, op={}", id);
            }
            return Ok(true);
        } else if id == 0 {
            warn!("unsolicited notification received");
        } else {
            warn!("unmatched id: {}", id);
        }
        Ok(false)
    }

    async fn turn(mut self, mode: LoopMode) -> Result<Self> {
        loop {
            let parked = self.pending.as_ref().map(|p| p.1.clone());
            tokio::select! {
                Some(req_id) = self.id_scrub_rx.recv() => self.scrub(req_id),
                permit = reserve_slot(parked), if self.pending.is_some() => {
                    if let Some((id, _, item)) = self.pending.take() {
                        match permit {
                            Ok(permit) => {
                                let done = matches!(item.0, SearchItem::Done(_));
                                permit.send(item);
                                if done {
                                    self.release(id);
                                }
                            },
                            Err(_) => {
                                warn!("ldap search item send error, op={}", id);
                                self.release(id);
                            },
                        }
                    }
                },
                op_tuple = self.rx.recv() => {
                    let Some((id, op, tag, controls, tx)) = op_tuple else {
                        self.farewell().await;
                        break;
                    };
                    if !self.request(id, op, tag, controls, tx).await? {
                        break;
                    }
                },
                resp = self.stream.next(), if self.pending.is_none() => {
                    let (id, (tag, controls)) = match resp {
                        None => {
                            debug!("connection closed by server");
                            self.closer.0.close();
                            break;
                        },
                        Some(Err(e)) => return Err(self.closer.0.fail(e)),
                        Some(Ok(resp)) => resp,
                    };
                    if self.response(id, tag, controls)? {
                        if let LoopMode::SingleOp = mode {
                            break;
                        }
                    }
                },
            };
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, entry, result_op, search_done};
    use crate::search::{Scope, SearchEntry};
    use tokio_util::sync::CancellationToken;

    fn dn_of(e: crate::ResultEntry) -> String {
        SearchEntry::construct(e).unwrap().dn
    }

    #[tokio::test]
    async fn compare_overtakes_search() {
        let (mut ldap, mut peer) = mock::connect().await;
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let search = peer.recv().await.unwrap();
            let compare = peer.recv().await.unwrap();
            assert_eq!((search.op_id(), compare.op_id()), (3, 14));
            peer.send(compare.id, result_op(15, 6, ""), vec![]).await;
            go_rx.await.unwrap();
            peer.send(search.id, entry("cn=a", &[]), vec![]).await;
            peer.send(search.id, entry("cn=b", &[]), vec![]).await;
            peer.send(search.id, search_done(0), vec![]).await;
            (search.id, compare.id, peer)
        });
        let mut stream = ldap
            .streaming_search("dc=example,dc=com", Scope::Subtree, "(cn=*)", &["cn"])
            .await
            .unwrap();
        let mut other = ldap.clone();
        let cmp = tokio::spawn(async move { other.compare("cn=a", "cn", "a").await });
        assert!(cmp.await.unwrap().unwrap().equal().unwrap());
        go_tx.send(()).unwrap();
        let mut seen = vec![];
        while let Some(e) = stream.next().await.unwrap() {
            seen.push(dn_of(e));
        }
        assert_eq!(seen, ["cn=a", "cn=b"]);
        assert_eq!(stream.finish().await.rc, 0);
        let (search_id, compare_id, _peer) = server.await.unwrap();
        assert_eq!(stream.msgid(), search_id);
        assert_eq!(compare_id, search_id + 1);
    }

    #[tokio::test]
    async fn interleaved_searches_see_only_their_entries() {
        const N: usize = 4;
        let (ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let mut reqs = vec![];
            for _ in 0..N {
                let req = peer.recv().await.unwrap();
                reqs.push((req.id, req.first_string()));
            }
            for round in 0..3 {
                for (id, base) in reqs.iter().rev() {
                    peer.send(*id, entry(&format!("cn={round},{base}"), &[]), vec![])
                        .await;
                }
            }
            for (id, _) in &reqs {
                peer.send(*id, search_done(0), vec![]).await;
            }
            peer
        });
        let mut callers = vec![];
        for i in 0..N {
            let mut ldap = ldap.clone();
            callers.push(tokio::spawn(async move {
                let base = format!("ou={i}");
                let (entries, _) = ldap
                    .search(&base, Scope::OneLevel, "(cn=*)", &["cn"])
                    .await
                    .unwrap()
                    .success()
                    .unwrap();
                (base, entries.into_iter().map(dn_of).collect::<Vec<_>>())
            }));
        }
        for caller in callers {
            let (base, dns) = caller.await.unwrap();
            let expected: Vec<_> = (0..3).map(|r| format!("cn={r},{base}")).collect();
            assert_eq!(dns, expected);
        }
        let _peer = server.await.unwrap();
        assert!(ldap.msgmap.lock().unwrap().1.is_empty());
    }

    #[tokio::test]
    async fn cancelled_search_releases_id() {
        let (mut ldap, mut peer) = mock::connect().await;
        let token = CancellationToken::new();
        let server = tokio::spawn(async move {
            let search = peer.recv().await.unwrap();
            peer.send(search.id, entry("cn=first", &[]), vec![]).await;
            let abandon = peer.recv().await.unwrap();
            assert_eq!(abandon.abandoned_id(), search.id);
            peer.send(search.id, entry("cn=late", &[]), vec![]).await;
            peer.send(search.id, search_done(0), vec![]).await;
            let del = peer.recv().await.unwrap();
            peer.send(del.id, result_op(11, 0, ""), vec![]).await;
            peer
        });
        let mut stream = ldap
            .with_cancel(token.clone())
            .streaming_search("", Scope::Subtree, "(cn=*)", &["cn"])
            .await
            .unwrap();
        assert_eq!(dn_of(stream.next().await.unwrap().unwrap()), "cn=first");
        token.cancel();
        assert!(matches!(stream.next().await, Err(LdapError::Cancelled)));
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(stream.finish().await.rc, 88);
        ldap.delete("cn=x").await.unwrap().success().unwrap();
        let _peer = server.await.unwrap();
        assert!(ldap.msgmap.lock().unwrap().1.is_empty());
    }

    #[tokio::test]
    async fn decode_failure_is_sticky() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            peer.recv().await.unwrap();
            // a SEQUENCE holding nothing but an OCTET STRING
            peer.send_raw(&[0x30, 0x03, 0x04, 0x01, 0x41]).await;
            peer
        });
        let err = ldap.delete("cn=x").await.unwrap_err();
        assert!(matches!(err, LdapError::Decoding { .. }));
        let _peer = server.await.unwrap();
        let last = ldap.last_error().unwrap();
        assert_eq!(last.kind(), io::ErrorKind::InvalidData);
        assert!(ldap.is_closed());
        assert!(matches!(
            ldap.delete("cn=y").await,
            Err(LdapError::Decoding { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_message_fails_connection() {
        let settings = LdapConnSettings::new().set_max_message_size(4096);
        let (mut ldap, mut peer) = mock::connect_with(settings).await;
        let server = tokio::spawn(async move {
            peer.recv().await.unwrap();
            // only the header of a SEQUENCE announcing 1 GiB
            peer.send_raw(&[0x30, 0x84, 0x40, 0x00, 0x00, 0x00]).await;
            peer
        });
        let err = ldap.delete("cn=x").await.unwrap_err();
        assert!(matches!(err, LdapError::Decoding { .. }));
        let _peer = server.await.unwrap();
        assert_eq!(ldap.last_error().unwrap().kind(), io::ErrorKind::InvalidData);
        assert!(ldap.is_closed());
    }

    #[tokio::test]
    async fn server_close_fails_waiters() {
        let (mut ldap, mut peer) = mock::connect().await;
        tokio::spawn(async move {
            peer.recv().await.unwrap();
            drop(peer);
        });
        assert!(matches!(
            ldap.delete("cn=x").await,
            Err(LdapError::ConnectionClosed)
        ));
        assert!(ldap.last_error().is_none());
    }

    #[tokio::test]
    async fn last_handle_sends_unbind() {
        let (ldap, mut peer) = mock::connect().await;
        let clone = ldap.clone();
        drop(ldap);
        drop(clone);
        let req = peer.recv().await.unwrap();
        assert_eq!(req.op_id(), 2);
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_consumer_keeps_order() {
        let settings = LdapConnSettings::new().set_search_buffer(1);
        let (mut ldap, mut peer) = mock::connect_with(settings).await;
        tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            for i in 0..6 {
                peer.send(req.id, entry(&format!("cn={i}"), &[]), vec![]).await;
            }
            peer.send(req.id, search_done(0), vec![]).await;
            peer
        });
        let mut stream = ldap
            .streaming_search("", Scope::Subtree, "(cn=*)", &["cn"])
            .await
            .unwrap();
        let mut seen = vec![];
        while let Some(e) = stream.next().await.unwrap() {
            time::sleep(Duration::from_millis(5)).await;
            seen.push(dn_of(e));
        }
        let expected: Vec<_> = (0..6).map(|i| format!("cn={i}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(stream.finish().await.rc, 0);
    }

    #[tokio::test]
    async fn unknown_scheme() {
        assert!(matches!(
            LdapConnAsync::new("http://localhost").await,
            Err(LdapError::UnknownScheme(_))
        ));
    }
}
