//! Per-connection filtering pipeline
//!
//! Drives HTTP/1.x transactions between a client stream and an upstream
//! stream: request rules are checked before anything is forwarded, responses
//! are classified, and HTML documents are buffered, filtered and re-framed.
//! Everything else is streamed through as it arrives.
//!
//! The pipeline is generic over both streams so the same code serves plain
//! HTTP, intercepted TLS and in-memory test streams.

use super::error::MitmError;
use super::http_parser::{
    split_host_port, BodyFraming, Headers, HttpResponse, HttpVersion, MessageParser, ParseStatus,
    RequestParser, ResponseParser, StartLine, StatusLine,
};
use super::interceptor::InterceptionError;
use super::tls_config::SniUtils;
use crate::callbacks::{BlockReason, BlockedRequest, EventReporter};
use crate::filtering::classify;
use crate::filtering::domain::normalize_host;
use crate::filtering::html::charset_is_utf8;
use crate::filtering::{
    CategoryMask, ClassifyRequest, ContentEncoding, ContentVerdict, DocumentFilter,
    DocumentOutcome, EngineOption, OptionSet, RequestInfo, RuleMatches, RuleStore,
};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, InterceptionError>;

const READ_BUFFER_SIZE: usize = 16 * 1024;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Scheme the client spoke to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Opens connections to origin servers
#[async_trait]
pub trait Upstream: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self, host: &str, port: u16) -> std::result::Result<Self::Stream, MitmError>;
}

/// Plain TCP to the origin
#[derive(Debug, Clone)]
pub struct PlainUpstream {
    connect_timeout: Duration,
}

impl PlainUpstream {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Upstream for PlainUpstream {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> std::result::Result<TcpStream, MitmError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| MitmError::upstream(host, "connect timed out"))?
            .map_err(|e| MitmError::upstream(host, e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(target_host = %host, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(stream)
    }
}

/// TLS to the origin, verified against the configured roots
#[derive(Clone)]
pub struct TlsUpstream {
    tcp: PlainUpstream,
    connector: TlsConnector,
}

impl TlsUpstream {
    pub fn new(connector: TlsConnector, connect_timeout: Duration) -> Self {
        Self {
            tcp: PlainUpstream::new(connect_timeout),
            connector,
        }
    }
}

#[async_trait]
impl Upstream for TlsUpstream {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self, host: &str, port: u16) -> std::result::Result<Self::Stream, MitmError> {
        let server_name = SniUtils::parse_server_name(host)?;
        let tcp = self.tcp.connect(host, port).await?;

        timeout(self.tcp.connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| MitmError::tls_handshake(host, "upstream handshake timed out"))?
            .map_err(|e| MitmError::tls_handshake(host, e.to_string()))
    }
}

/// Per-connection facts, captured once when the connection is accepted
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub peer: SocketAddr,
    pub scheme: Scheme,
    /// SNI host or CONNECT target. TLS upstreams always connect here; plain
    /// requests fall back to it when they carry no Host.
    pub authority: Option<String>,
    pub categories: CategoryMask,
    pub options: OptionSet,
}

impl ConnectionContext {
    fn document_filter(&self) -> DocumentFilter {
        DocumentFilter {
            hide_elements: self.options.contains(EngineOption::ElementHiding),
            scan_content: self.options.contains(EngineOption::ScanContentTriggers),
        }
    }
}

/// Outcome of one request/response exchange
enum Transaction<S> {
    /// Connection may carry another request
    Continue { upstream: Option<(String, S)> },
    /// Connection is finished
    Close,
}

/// Filters HTTP transactions against the rule store
pub struct FilterPipeline {
    store: Arc<RuleStore>,
    reporter: Arc<EventReporter>,
    read_timeout: Duration,
    max_filter_body: usize,
}

impl FilterPipeline {
    pub fn new(
        store: Arc<RuleStore>,
        reporter: Arc<EventReporter>,
        read_timeout: Duration,
        max_filter_body: usize,
    ) -> Self {
        Self {
            store,
            reporter,
            read_timeout,
            max_filter_body,
        }
    }

    /// Serve transactions on `client` until either side ends the connection
    ///
    /// `connected` is an upstream already opened to `ctx.authority`.
    /// `leftover` holds client bytes read before the pipeline took over.
    pub async fn serve<C, U>(
        &self,
        mut client: C,
        ctx: &ConnectionContext,
        upstream: &U,
        connected: Option<U::Stream>,
        leftover: Vec<u8>,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: Upstream,
    {
        let mut current = connected.and_then(|s| ctx.authority.clone().map(|a| (a, s)));
        let mut pending = leftover;

        loop {
            let outcome = self
                .transaction(&mut client, ctx, upstream, current.take(), &mut pending)
                .await?;

            match outcome {
                Transaction::Continue { upstream } => current = upstream,
                Transaction::Close => {
                    let _ = client.shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    async fn transaction<C, U>(
        &self,
        client: &mut C,
        ctx: &ConnectionContext,
        upstream: &U,
        current: Option<(String, U::Stream)>,
        pending: &mut Vec<u8>,
    ) -> Result<Transaction<U::Stream>>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: Upstream,
    {
        let mut parser = RequestParser::new();
        let head = read_head(
            &mut *client,
            &mut parser,
            std::mem::take(pending),
            self.read_timeout,
            "client",
        )
        .await;
        let request_status = match head {
            Ok(Some(status)) => status,
            Ok(None) => return Ok(Transaction::Close),
            Err(e) => {
                if matches!(e, InterceptionError::Protocol(_)) {
                    let _ = client.write_all(&error_response(400, "Bad Request")).await;
                }
                return Err(e);
            }
        };

        let Some(request) = parser.message().cloned() else {
            return Err(InterceptionError::UnexpectedEof("client"));
        };
        let framing = request.framing();

        let Some(authority) = request
            .authority()
            .map(str::to_string)
            .or_else(|| ctx.authority.clone())
        else {
            let _ = client.write_all(&error_response(400, "Bad Request")).await;
            return Err(InterceptionError::MissingHost);
        };

        let (request_host, _) = split_host_port(&authority, ctx.scheme.default_port());
        let host = normalize_host(&request_host);
        let url = request.absolute_url(ctx.scheme.as_str(), &authority);
        let rules = self.store.lookup(&host, &ctx.categories);

        let page_host = request
            .headers()
            .get("referer")
            .map(normalize_host)
            .filter(|h| !h.is_empty());

        let info = RequestInfo {
            url: &url,
            host: &host,
            page_host: page_host.as_deref(),
        };
        if let Some(trigger) = rules.blocking_url_trigger(&info) {
            let event = BlockedRequest {
                host: host.clone(),
                url: url.clone(),
                category: trigger.category(),
                rule: trigger.rule_text().to_string(),
                reason: BlockReason::UrlTrigger,
            };
            self.reporter.request_blocked(&event);
            client.write_all(&block_page(&event)).await?;
            client.flush().await?;
            return Ok(Transaction::Close);
        }

        let filter = ctx.document_filter();

        let mut outbound = request.clone();
        outbound.headers_mut().remove("proxy-connection");
        if outbound.target().contains("://") {
            let origin = outbound.origin_form().to_string();
            outbound.set_target(origin);
        }
        if !filter.is_noop(&rules) && request.headers().contains("accept-encoding") {
            let narrowed = narrow_accept_encoding(request.headers());
            outbound.headers_mut().set("Accept-Encoding", narrowed);
        }

        // The engine answers 100-continue itself, so the origin never sees it
        let expects_continue = request.headers().has_token("expect", "100-continue");
        if expects_continue {
            outbound.headers_mut().remove("expect");
        }
        let send_continue = expects_continue
            && request.version() == HttpVersion::Http11
            && framing != BodyFraming::None;
        let head = outbound.headers_to_vec();

        // TLS upstreams are pinned to the SNI host; plain ones follow the request
        let upstream_authority = match (ctx.scheme, &ctx.authority) {
            (Scheme::Https, Some(sni)) => sni.clone(),
            _ => authority.clone(),
        };
        let (upstream_host, upstream_port) =
            split_host_port(&upstream_authority, ctx.scheme.default_port());

        let mut reusable = match current {
            Some((a, stream)) if a == upstream_authority => Some(stream),
            _ => None,
        };
        let mut retry = reusable.is_some() && framing == BodyFraming::None;

        let (mut server, mut response_parser, mut response_status) = loop {
            let mut server = match reusable.take() {
                Some(stream) => stream,
                None => match upstream.connect(&upstream_host, upstream_port).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = client.write_all(&error_response(502, "Bad Gateway")).await;
                        return Err(e.into());
                    }
                },
            };

            let mut response_parser = ResponseParser::for_request(request.method());
            let exchange = async {
                server.write_all(&head).await?;
                if send_continue {
                    client.write_all(CONTINUE).await?;
                    client.flush().await?;
                }
                let trailing = pump_body(
                    &mut *client,
                    &mut parser,
                    request_status.clone(),
                    &mut server,
                    framing,
                    self.read_timeout,
                    "client",
                )
                .await?;
                let status = read_head(
                    &mut server,
                    &mut response_parser,
                    Vec::new(),
                    self.read_timeout,
                    "upstream",
                )
                .await?;
                Ok::<_, InterceptionError>((trailing, status))
            }
            .await;

            match exchange {
                Ok((trailing, Some(status))) => {
                    *pending = trailing;
                    break (server, response_parser, status);
                }
                Ok((_, None)) | Err(InterceptionError::Io(_)) if retry => {
                    debug!(
                        target_host = %upstream_host,
                        "Reused upstream connection was closed, reconnecting"
                    );
                    retry = false;
                }
                Ok((_, None)) => {
                    let _ = client.write_all(&error_response(502, "Bad Gateway")).await;
                    return Err(InterceptionError::UnexpectedEof("upstream"));
                }
                Err(e) => {
                    if !matches!(e, InterceptionError::UnexpectedEof("client")) {
                        let _ = client.write_all(&error_response(502, "Bad Gateway")).await;
                    }
                    return Err(e);
                }
            }
        };

        // Interim responses go straight through; 101 hands the connection over
        loop {
            let Some(response) = response_parser.message() else {
                return Err(InterceptionError::UnexpectedEof("upstream"));
            };

            if response.status() == 101 {
                client.write_all(&response.headers_to_vec()).await?;
                if let ParseStatus::Complete { trailing } = &response_status {
                    client.write_all(trailing).await?;
                }
                server.write_all(pending).await?;
                pending.clear();
                debug!(target_host = %host, "Switching protocols, relaying raw bytes");
                tokio::io::copy_bidirectional(client, &mut server).await?;
                return Ok(Transaction::Close);
            }

            if !response.is_informational() {
                break;
            }

            client.write_all(&response.headers_to_vec()).await?;
            let trailing = match response_status {
                ParseStatus::Complete { trailing } => trailing,
                ParseStatus::NeedMore => Vec::new(),
            };
            response_parser = ResponseParser::for_request(request.method());
            response_status = read_head(
                &mut server,
                &mut response_parser,
                trailing,
                self.read_timeout,
                "upstream",
            )
            .await?
            .ok_or(InterceptionError::UnexpectedEof("upstream"))?;
        }

        let Some(response) = response_parser.message() else {
            return Err(InterceptionError::UnexpectedEof("upstream"));
        };
        let response_framing = response.framing();
        let upstream_reusable =
            response.keep_alive() && response_framing != BodyFraming::UntilClose;
        let client_keep_alive = request.keep_alive() && response_framing != BodyFraming::UntilClose;
        let content_type = response.content_type().map(str::to_string);

        let verdict = self.reporter.classify(&ClassifyRequest {
            host: &host,
            url: &url,
            content_type: content_type.as_deref(),
            status: response.status(),
        });
        let verdict = match verdict {
            ContentVerdict::Block(category) if !ctx.categories.contains(category) => {
                ContentVerdict::Default
            }
            other => other,
        };

        match classify::resolve(verdict, content_type.as_deref()) {
            ContentVerdict::Block(category) => {
                let event = BlockedRequest {
                    host: host.clone(),
                    url: url.clone(),
                    category,
                    rule: String::new(),
                    reason: BlockReason::Classification,
                };
                self.reporter.request_blocked(&event);
                client.write_all(&block_page(&event)).await?;
                client.flush().await?;
                return Ok(Transaction::Close);
            }
            ContentVerdict::Html if self.is_filterable(response, &filter, &rules) => {
                let encoding =
                    ContentEncoding::from_header(response.headers().get("content-encoding"));
                let finished = self
                    .filter_document(
                        client,
                        &mut server,
                        response_parser,
                        response_status,
                        encoding,
                        &filter,
                        &rules,
                        &host,
                        &url,
                    )
                    .await?;
                if !finished {
                    return Ok(Transaction::Close);
                }
            }
            _ => {
                client.write_all(&response.headers_to_vec()).await?;
                pump_body(
                    &mut server,
                    &mut response_parser,
                    response_status,
                    client,
                    response_framing,
                    self.read_timeout,
                    "upstream",
                )
                .await?;
            }
        }

        if !client_keep_alive {
            return Ok(Transaction::Close);
        }

        let upstream = upstream_reusable.then_some((upstream_authority, server));
        Ok(Transaction::Continue { upstream })
    }

    fn is_filterable(
        &self,
        response: &HttpResponse,
        filter: &DocumentFilter,
        rules: &RuleMatches,
    ) -> bool {
        if response.framing() == BodyFraming::None || filter.is_noop(rules) {
            return false;
        }
        if let BodyFraming::ContentLength(len) = response.framing() {
            if len > self.max_filter_body as u64 {
                return false;
            }
        }
        let encoding = ContentEncoding::from_header(response.headers().get("content-encoding"));
        encoding.is_supported() && response.content_type().map_or(true, charset_is_utf8)
    }

    /// Buffer, decode and filter an HTML response, then relay it
    ///
    /// Bodies that outgrow the buffer limit are streamed unmodified. Returns
    /// false when the document was replaced by a block page.
    #[allow(clippy::too_many_arguments)]
    async fn filter_document<C, S>(
        &self,
        client: &mut C,
        server: &mut S,
        mut parser: ResponseParser,
        mut status: ParseStatus,
        encoding: ContentEncoding,
        filter: &DocumentFilter,
        rules: &RuleMatches,
        host: &str,
        url: &str,
    ) -> Result<bool>
    where
        C: AsyncWrite + Unpin + Send,
        S: AsyncRead + Unpin + Send,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        while matches!(status, ParseStatus::NeedMore) {
            let buffered = parser.message().map_or(0, |m| m.body().len());
            if buffered > self.max_filter_body {
                debug!(target_host = %host, buffered, "Document exceeds filter limit, streaming");
                let Some(response) = parser.message() else {
                    return Err(InterceptionError::UnexpectedEof("upstream"));
                };
                let framing = response.framing();
                client.write_all(&response.headers_to_vec()).await?;
                pump_body(
                    server,
                    &mut parser,
                    status,
                    client,
                    framing,
                    self.read_timeout,
                    "upstream",
                )
                .await?;
                return Ok(true);
            }

            let n = read_some(server, &mut buf, self.read_timeout, "upstream").await?;
            status = if n == 0 {
                parser.finish()?
            } else {
                parser.feed(&buf[..n])?
            };
        }

        let Some(mut response) = parser.into_message() else {
            return Err(InterceptionError::UnexpectedEof("upstream"));
        };

        let text = match encoding
            .decode(response.body(), self.max_filter_body)
            .map_err(|e| e.to_string())
            .and_then(|decoded| String::from_utf8(decoded).map_err(|e| e.to_string()))
        {
            Ok(text) => text,
            Err(reason) => {
                warn!(
                    target_host = %host,
                    error = %reason,
                    "Document could not be decoded, relaying unmodified"
                );
                client.write_all(&response.to_wire()).await?;
                client.flush().await?;
                return Ok(true);
            }
        };

        match filter.apply(&text, rules) {
            DocumentOutcome::Unchanged => {
                client.write_all(&response.to_wire()).await?;
            }
            DocumentOutcome::Filtered { html, removed } => {
                response.headers_mut().remove("content-encoding");
                response.replace_body(html.into_bytes());
                client.write_all(&response.to_wire()).await?;
                self.reporter.elements_blocked(host, removed);
            }
            DocumentOutcome::Blocked(trigger) => {
                let event = BlockedRequest {
                    host: host.to_string(),
                    url: url.to_string(),
                    category: trigger.category(),
                    rule: trigger.rule_text().to_string(),
                    reason: BlockReason::ContentTrigger,
                };
                self.reporter.request_blocked(&event);
                client.write_all(&block_page(&event)).await?;
                client.flush().await?;
                return Ok(false);
            }
        }

        client.flush().await?;
        Ok(true)
    }
}

/// Read with a deadline; a peer that vanished without TLS close_notify
/// reads as a clean EOF
async fn read_some<R>(
    src: &mut R,
    buf: &mut [u8],
    limit: Duration,
    side: &'static str,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout(limit, src.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(InterceptionError::Timeout(side)),
    }
}

/// Read until the parser has a complete head
///
/// `Ok(None)` means the peer closed or idled out before starting a message.
async fn read_head<R, S>(
    src: &mut R,
    parser: &mut MessageParser<S>,
    pending: Vec<u8>,
    limit: Duration,
    side: &'static str,
) -> Result<Option<ParseStatus>>
where
    R: AsyncRead + Unpin,
    S: StartLine,
{
    let mut status = if pending.is_empty() {
        ParseStatus::NeedMore
    } else {
        parser.feed(&pending)?
    };

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    while !parser.headers_complete() {
        let n = match read_some(src, &mut buf, limit, side).await {
            Ok(n) => n,
            Err(InterceptionError::Timeout(_)) if !parser.has_started() => return Ok(None),
            Err(e) => return Err(e),
        };
        if n == 0 {
            if !parser.has_started() {
                return Ok(None);
            }
            return Err(InterceptionError::UnexpectedEof(side));
        }
        status = parser.feed(&buf[..n])?;
    }

    Ok(Some(status))
}

/// Relay the rest of a message body from `src` to `dst`
///
/// Chunked bodies are re-chunked on the way out. Returns the bytes read past
/// the end of the message.
async fn pump_body<R, W, S>(
    src: &mut R,
    parser: &mut MessageParser<S>,
    mut status: ParseStatus,
    dst: &mut W,
    framing: BodyFraming,
    limit: Duration,
    side: &'static str,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: StartLine,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        write_body_piece(dst, framing, &parser.take_body()).await?;

        if let ParseStatus::Complete { trailing } = status {
            if framing == BodyFraming::Chunked {
                dst.write_all(b"0\r\n\r\n").await?;
            }
            dst.flush().await?;
            return Ok(trailing);
        }

        let n = read_some(src, &mut buf, limit, side).await?;
        status = if n == 0 {
            parser
                .finish()
                .map_err(|_| InterceptionError::UnexpectedEof(side))?
        } else {
            parser.feed(&buf[..n])?
        };
    }
}

async fn write_body_piece<W>(dst: &mut W, framing: BodyFraming, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    if framing == BodyFraming::Chunked {
        dst.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
        dst.write_all(data).await?;
        return dst.write_all(b"\r\n").await;
    }
    dst.write_all(data).await
}

/// Narrow the client's `Accept-Encoding` to codings the document filter
/// can decode, keeping the client's order and weights
///
/// Falls back to `identity` when nothing the client listed is decodable.
fn narrow_accept_encoding(headers: &Headers) -> String {
    let kept: Vec<&str> = headers
        .get_all("accept-encoding")
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|entry| {
            let coding = entry.split_once(';').map_or(*entry, |(c, _)| c).trim();
            !coding.is_empty() && ContentEncoding::from_header(Some(coding)).is_supported()
        })
        .collect();

    if kept.is_empty() {
        "identity".to_string()
    } else {
        kept.join(", ")
    }
}

fn local_response(status: u16, reason: &str, content_type: &str, body: String) -> Vec<u8> {
    let mut headers = Headers::new();
    headers.append("Content-Type", content_type);
    headers.append("Cache-Control", "no-store");
    headers.append("Connection", "close");

    let mut response = HttpResponse::new(
        StatusLine::new(HttpVersion::Http11, status, reason),
        headers,
    );
    response.replace_body(body.into_bytes());
    response.to_wire()
}

fn error_response(status: u16, reason: &str) -> Vec<u8> {
    local_response(
        status,
        reason,
        "text/plain; charset=utf-8",
        format!("{} {}\n", status, reason),
    )
}

/// Local 403 page sent in place of blocked content
pub fn block_page(event: &BlockedRequest) -> Vec<u8> {
    let body = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Blocked</title></head>\
         <body><h1>This content was blocked</h1><p>{}</p><p>{}</p></body></html>\n",
        escape_html(&event.url),
        event.category
    );
    local_response(403, "Forbidden", "text/html; charset=utf-8", body)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::Category;

    #[test]
    fn test_scheme_defaults() {
        assert_eq!(Scheme::Http.default_port(), 80);
        assert_eq!(Scheme::Https.default_port(), 443);
        assert_eq!(Scheme::Https.as_str(), "https");
    }

    #[test]
    fn test_block_page_is_complete_response() {
        let event = BlockedRequest {
            host: "ads.example.com".to_string(),
            url: "http://ads.example.com/<script>".to_string(),
            category: Category(3),
            rule: "||ads.example.com^".to_string(),
            reason: BlockReason::UrlTrigger,
        };

        let page = String::from_utf8(block_page(&event)).unwrap();
        assert!(page.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(page.contains("Connection: close\r\n"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));

        let (head, body) = page.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
    }

    #[test]
    fn test_error_response() {
        let response = String::from_utf8(error_response(502, "Bad Gateway")).unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(response.ends_with("502 Bad Gateway\n"));
    }

    #[test]
    fn test_accept_encoding_narrowed_to_decodable_codings() {
        let narrow = |value: &str| {
            let mut headers = Headers::new();
            headers.append("Accept-Encoding", value);
            narrow_accept_encoding(&headers)
        };

        assert_eq!(narrow("gzip, deflate, br"), "gzip, deflate");
        assert_eq!(narrow("br;q=1.0, gzip;q=0.8, *;q=0.1"), "gzip;q=0.8");
        assert_eq!(narrow("identity"), "identity");
        assert_eq!(narrow("br"), "identity");
        assert_eq!(narrow("*"), "identity");
        assert_eq!(narrow("Deflate ,"), "Deflate");
    }

    #[tokio::test]
    async fn test_pump_body_rechunks() {
        let mut parser = RequestParser::new();
        let status = parser
            .feed(b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        parser.feed(b"5\r\nhello\r\n").unwrap();
        parser.take_body();

        let mut src: &[u8] = b"0\r\n\r\nGET / HTTP/1.1\r\n";
        let mut dst = Vec::new();
        // the "hello" piece was drained above, so only the terminator is written
        let trailing = pump_body(
            &mut src,
            &mut parser,
            status,
            &mut dst,
            BodyFraming::Chunked,
            Duration::from_secs(1),
            "client",
        )
        .await
        .unwrap();

        assert_eq!(dst, b"0\r\n\r\n");
        assert_eq!(trailing, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_read_head_clean_eof() {
        let mut parser = RequestParser::new();
        let mut src: &[u8] = b"";
        let status = read_head(
            &mut src,
            &mut parser,
            Vec::new(),
            Duration::from_secs(1),
            "client",
        )
        .await
        .unwrap();
        assert!(status.is_none());

        let mut parser = RequestParser::new();
        let mut src: &[u8] = b"GET / HTTP/1.1\r\nHo";
        let result = read_head(
            &mut src,
            &mut parser,
            Vec::new(),
            Duration::from_secs(1),
            "client",
        )
        .await;
        assert!(matches!(result, Err(InterceptionError::UnexpectedEof("client"))));
    }
}
