//! Connection entry point
//!
//! Decides per accepted socket whether it is served as plain HTTP, turned into
//! a CONNECT tunnel, or intercepted:
//! 1. Firewall check
//! 2. For TLS: read the ClientHello, mint a leaf for the SNI host and open the
//!    upstream TLS connection
//! 3. Hand the decrypted streams to the [`FilterPipeline`]

use super::certificate_authority::CertificateAuthority;
use super::error::MitmError;
use super::http_parser::{split_host_port, ParseError, ParseStatus, RequestParser};
use super::pipeline::{
    block_page, ConnectionContext, FilterPipeline, PlainUpstream, Scheme, TlsUpstream, Upstream,
};
use super::tls_config::{SniUtils, UpstreamTlsConfig};
use crate::callbacks::{BlockReason, BlockedRequest, EventReporter, FirewallRequest, ListenerKind};
use crate::filtering::domain::normalize_host;
use crate::filtering::{EngineOption, EngineToggles, RequestInfo, RuleStore};
use rustls::server::Acceptor;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Largest ClientHello buffered while looking for SNI
const MAX_CLIENT_HELLO: usize = 64 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Per-connection errors
#[derive(Debug, Error)]
pub enum InterceptionError {
    #[error("MITM error: {0}")]
    Mitm(#[from] MitmError),

    #[error("HTTP parse error: {0}")]
    Protocol(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{0} closed the connection mid-message")]
    UnexpectedEof(&'static str),

    #[error("Request does not name a host")]
    MissingHost,

    #[error("ClientHello carries no SNI host")]
    MissingSni,

    #[error("Client sent data before the CONNECT tunnel was established")]
    EarlyTunnelData,
}

/// Timeouts and limits applied to every connection
#[derive(Debug, Clone, Copy)]
pub struct InterceptorSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_filter_body: usize,
}

impl Default for InterceptorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_filter_body: 10 * 1024 * 1024,
        }
    }
}

/// MITM Interceptor
pub struct MitmInterceptor {
    /// Mints leaf certificates for intercepted hosts
    ca: Arc<CertificateAuthority>,

    store: Arc<RuleStore>,
    toggles: Arc<EngineToggles>,
    reporter: Arc<EventReporter>,
    pipeline: FilterPipeline,

    plain: PlainUpstream,
    tls: TlsUpstream,
    read_timeout: Duration,
}

impl MitmInterceptor {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        upstream_tls: &UpstreamTlsConfig,
        store: Arc<RuleStore>,
        toggles: Arc<EngineToggles>,
        reporter: Arc<EventReporter>,
        settings: InterceptorSettings,
    ) -> Self {
        let pipeline = FilterPipeline::new(
            Arc::clone(&store),
            Arc::clone(&reporter),
            settings.read_timeout,
            settings.max_filter_body,
        );
        let connector = TlsConnector::from(upstream_tls.client_config());

        Self {
            ca,
            store,
            toggles,
            reporter,
            pipeline,
            plain: PlainUpstream::new(settings.connect_timeout),
            tls: TlsUpstream::new(connector, settings.connect_timeout),
            read_timeout: settings.read_timeout,
        }
    }

    /// Serve one accepted connection to completion
    ///
    /// Failures are reported through the warn callback and returned.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: ListenerKind,
    ) -> Result<(), InterceptionError> {
        let local_port = stream.local_addr().map(|a| a.port()).unwrap_or_default();
        let request = FirewallRequest {
            peer,
            listener,
            local_port,
        };
        if !self.reporter.firewall_allows(&request) {
            return Ok(());
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let result = match listener {
            ListenerKind::Http => self.handle_http(stream, peer).await,
            ListenerKind::Https => self.handle_https(stream, peer).await,
        };

        if let Err(e) = &result {
            self.reporter
                .warn(&format!("Connection from {} ({:?}) failed: {}", peer, listener, e));
        }
        result
    }

    /// Snapshot the toggles once per connection
    fn context(
        &self,
        peer: SocketAddr,
        scheme: Scheme,
        authority: Option<String>,
    ) -> ConnectionContext {
        ConnectionContext {
            peer,
            scheme,
            authority,
            categories: self.toggles.categories(),
            options: self.toggles.options(),
        }
    }

    async fn handle_http(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), InterceptionError> {
        let mut parser = RequestParser::new();
        let mut received = Vec::new();
        let mut buf = vec![0u8; 8 * 1024];
        let mut status = ParseStatus::NeedMore;

        while !parser.headers_complete() {
            let n = timeout(self.read_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| InterceptionError::Timeout("client"))??;
            if n == 0 {
                if parser.has_started() {
                    return Err(InterceptionError::UnexpectedEof("client"));
                }
                return Ok(());
            }
            received.extend_from_slice(&buf[..n]);
            status = match parser.feed(&buf[..n]) {
                Ok(status) => status,
                Err(e) => {
                    let _ = stream.write_all(BAD_REQUEST).await;
                    return Err(e.into());
                }
            };
        }

        let Some(request) = parser.message() else {
            return Err(InterceptionError::UnexpectedEof("client"));
        };

        if !request.is_connect() {
            let ctx = self.context(peer, Scheme::Http, None);
            return self
                .pipeline
                .serve(stream, &ctx, &self.plain, None, received)
                .await;
        }

        // Nothing may follow CONNECT until the client has seen our 200
        if matches!(&status, ParseStatus::Complete { trailing } if !trailing.is_empty()) {
            return Err(InterceptionError::EarlyTunnelData);
        }

        let authority = request.target().to_string();
        let (host, port) = split_host_port(&authority, Scheme::Https.default_port());
        let ctx = self.context(peer, Scheme::Https, Some(authority.clone()));

        if let Some(event) = self.connect_block(&ctx, &host, &authority) {
            self.reporter.request_blocked(&event);
            stream.write_all(&block_page(&event)).await?;
            return Ok(());
        }

        stream.write_all(CONNECT_ESTABLISHED).await?;
        stream.flush().await?;

        if !ctx.options.contains(EngineOption::InterceptTls) {
            return self.tunnel(stream, &host, port, Vec::new()).await;
        }

        self.intercept(stream, ctx, &host, port, Vec::new()).await
    }

    async fn handle_https(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), InterceptionError> {
        let (sni, hello) = self.read_client_hello(&mut stream).await?;
        if !SniUtils::validate_hostname(&sni) {
            return Err(MitmError::InvalidHost(sni).into());
        }

        let port = Scheme::Https.default_port();
        let ctx = self.context(peer, Scheme::Https, Some(sni.clone()));

        if !ctx.options.contains(EngineOption::InterceptTls) {
            return self.tunnel(stream, &sni, port, hello).await;
        }

        self.intercept(stream, ctx, &sni, port, hello).await
    }

    /// Finish the client handshake with a minted leaf and run the pipeline
    ///
    /// `hello` holds ClientHello bytes already read from `client`.
    async fn intercept<S>(
        &self,
        client: S,
        ctx: ConnectionContext,
        host: &str,
        port: u16,
        hello: Vec<u8>,
    ) -> Result<(), InterceptionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (leaf, upstream) =
            tokio::join!(self.ca.get_or_generate(host), self.tls.connect(host, port));

        let (leaf, upstream) = match leaf.and_then(|leaf| upstream.map(|up| (leaf, up))) {
            Ok(prepared) => prepared,
            Err(e) if ctx.options.contains(EngineOption::TunnelOnInterceptFailure) => {
                self.reporter
                    .warn(&format!("Interception of {} failed, tunneling instead: {}", host, e));
                return self.tunnel(client, host, port, hello).await;
            }
            Err(e) => return Err(e.into()),
        };

        let acceptor = TlsAcceptor::from(leaf.server_config());
        let tls_stream = timeout(self.read_timeout, acceptor.accept(Rewind::new(client, hello)))
            .await
            .map_err(|_| InterceptionError::Timeout("client"))?
            .map_err(|e| MitmError::tls_handshake(host, e.to_string()))?;

        debug!(target_host = %host, "Client TLS handshake complete");

        self.pipeline
            .serve(tls_stream, &ctx, &self.tls, Some(upstream), Vec::new())
            .await
    }

    /// Relay raw bytes without inspection
    async fn tunnel<S>(
        &self,
        mut client: S,
        host: &str,
        port: u16,
        hello: Vec<u8>,
    ) -> Result<(), InterceptionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut server = self.plain.connect(host, port).await?;
        if !hello.is_empty() {
            server.write_all(&hello).await?;
        }

        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut server).await?;
        info!(
            target_host = %host,
            bytes_sent = sent,
            bytes_received = received,
            "Tunnel closed"
        );
        Ok(())
    }

    /// Read until a full ClientHello is buffered; returns its SNI and raw bytes
    async fn read_client_hello(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(String, Vec<u8>), InterceptionError> {
        let mut acceptor = Acceptor::default();
        let mut hello = Vec::new();
        let mut buf = vec![0u8; 4 * 1024];

        loop {
            let n = timeout(self.read_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| InterceptionError::Timeout("client"))??;
            if n == 0 {
                return Err(InterceptionError::UnexpectedEof("client"));
            }
            hello.extend_from_slice(&buf[..n]);

            let mut rd = &buf[..n];
            while !rd.is_empty() {
                if acceptor.read_tls(&mut rd)? == 0 {
                    break;
                }
            }

            match acceptor.accept() {
                Ok(Some(accepted)) => {
                    let sni = accepted
                        .client_hello()
                        .server_name()
                        .map(str::to_string)
                        .ok_or(InterceptionError::MissingSni)?;
                    return Ok((sni, hello));
                }
                Ok(None) if hello.len() <= MAX_CLIENT_HELLO => continue,
                Ok(None) => {
                    return Err(MitmError::tls_handshake("unknown", "ClientHello too large").into())
                }
                Err((e, _alert)) => {
                    return Err(MitmError::tls_handshake("unknown", e.to_string()).into())
                }
            }
        }
    }

    /// Network rule blocking a CONNECT target, checked before the tunnel opens
    fn connect_block(
        &self,
        ctx: &ConnectionContext,
        host: &str,
        authority: &str,
    ) -> Option<BlockedRequest> {
        let host = normalize_host(host);
        let url = format!("https://{}/", authority);
        let rules = self.store.lookup(&host, &ctx.categories);
        let info = RequestInfo {
            url: &url,
            host: &host,
            page_host: None,
        };
        let trigger = rules.blocking_url_trigger(&info)?;

        Some(BlockedRequest {
            category: trigger.category(),
            rule: trigger.rule_text().to_string(),
            host,
            url,
            reason: BlockReason::UrlTrigger,
        })
    }
}

/// Stream that replays already-read bytes before reading from `inner`
pub struct Rewind<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
