//! Incremental HTTP/1.x parser
//!
//! The parser owns its partial-message state and is driven by [`MessageParser::feed`]
//! with whatever bytes the socket produced. It never blocks and never needs the
//! whole message at once. Headers keep their original names and order so a
//! message can be re-serialized the way it arrived.

use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Largest accepted start line plus header section
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Largest accepted number of header lines
pub const MAX_HEADERS: usize = 128;

/// HTTP parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid start line: {0}")]
    InvalidStartLine(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    #[error("Header parse error: {0}")]
    InvalidHeader(String),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Conflicting Content-Length headers")]
    ConflictingContentLength,

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Message too large: {0}")]
    TooLarge(&'static str),

    #[error("Incomplete HTTP message")]
    Incomplete,
}

/// Protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    /// Map a version number onto the versions the engine distinguishes
    ///
    /// `1.0` is HTTP/1.0, any other `1.x` is HTTP/1.1, `2.x` is HTTP/2 and
    /// anything else is treated as HTTP/1.1.
    pub fn from_major_minor(major: u32, minor: u32) -> Self {
        match (major, minor) {
            (1, 0) => HttpVersion::Http10,
            (2, _) => HttpVersion::Http2,
            _ => HttpVersion::Http11,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http2 => "HTTP/2.0",
        }
    }

    fn parse(token: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidVersion(token.to_string());

        let numbers = token.strip_prefix("HTTP/").ok_or_else(invalid)?;
        let (major, minor) = match numbers.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (numbers, "0"),
        };

        let digits =
            |s: &str| !s.is_empty() && s.len() <= 3 && s.bytes().all(|b| b.is_ascii_digit());
        if !digits(major) || !digits(minor) {
            return Err(invalid());
        }

        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.parse().map_err(|_| invalid())?;
        Ok(Self::from_major_minor(major, minor))
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive lookup
///
/// Names keep the case they arrived with; duplicates are kept in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace the first `name` header in place and drop the others, or
    /// append when absent
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut found = false;
        self.entries.retain_mut(|(n, v)| {
            if !n.eq_ignore_ascii_case(name) {
                return true;
            }
            if found {
                return false;
            }
            found = true;
            *v = value.clone();
            true
        });
        if !found {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Remove every `name` header; returns whether any was present
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// True when a comma-separated `name` header lists `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// First line of a message
pub trait StartLine: Sized + Clone + fmt::Debug {
    /// Messages of this kind with no length information run until close
    const READ_UNTIL_CLOSE: bool;

    fn parse(line: &str) -> Result<Self, ParseError>;

    fn write_to(&self, out: &mut String);

    fn version(&self) -> HttpVersion;

    /// Start lines that rule out a body regardless of headers
    fn forbids_body(&self) -> bool;
}

/// `METHOD target HTTP/x.y`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: String,
    target: String,
    version: HttpVersion,
}

impl RequestLine {
    pub fn new(method: &str, target: &str, version: HttpVersion) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            version,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target exactly as received
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl StartLine for RequestLine {
    const READ_UNTIL_CLOSE: bool = false;

    fn parse(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::InvalidStartLine(line.to_string()));
        };

        if !is_valid_method(method) {
            return Err(ParseError::InvalidMethod(method.to_string()));
        }
        if target.is_empty() || target.bytes().any(|b| b.is_ascii_control()) {
            return Err(ParseError::InvalidStartLine(line.to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: HttpVersion::parse(version)?,
        })
    }

    fn write_to(&self, out: &mut String) {
        out.push_str(&self.method);
        out.push(' ');
        out.push_str(&self.target);
        out.push(' ');
        out.push_str(self.version.as_str());
    }

    fn version(&self) -> HttpVersion {
        self.version
    }

    fn forbids_body(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// `HTTP/x.y status reason`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: HttpVersion,
    status: u16,
    reason: String,
}

impl StatusLine {
    pub fn new(version: HttpVersion, status: u16, reason: &str) -> Self {
        Self {
            version,
            status,
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl StartLine for StatusLine {
    const READ_UNTIL_CLOSE: bool = true;

    fn parse(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status = parts
            .next()
            .ok_or_else(|| ParseError::InvalidStartLine(line.to_string()))?;
        let reason = parts.next().unwrap_or_default();

        let version = HttpVersion::parse(version)?;
        if status.len() != 3 || !status.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidStatusCode(status.to_string()));
        }
        let status = status
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidStatusCode(status.to_string()))?;

        Ok(Self {
            version,
            status,
            reason: reason.trim().to_string(),
        })
    }

    fn write_to(&self, out: &mut String) {
        out.push_str(self.version.as_str());
        out.push(' ');
        out.push_str(&self.status.to_string());
        out.push(' ');
        out.push_str(&self.reason);
    }

    fn version(&self) -> HttpVersion {
        self.version
    }

    fn forbids_body(&self) -> bool {
        (100..200).contains(&self.status) || self.status == 204 || self.status == 304
    }
}

/// How the body was delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

/// A parsed request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage<S> {
    start: S,
    headers: Headers,
    body: Vec<u8>,
    framing: BodyFraming,
}

pub type HttpRequest = HttpMessage<RequestLine>;
pub type HttpResponse = HttpMessage<StatusLine>;

impl<S: StartLine> HttpMessage<S> {
    pub fn new(start: S, headers: Headers) -> Self {
        Self {
            start,
            headers,
            body: Vec::new(),
            framing: BodyFraming::None,
        }
    }

    pub fn start_line(&self) -> &S {
        &self.start
    }

    pub fn version(&self) -> HttpVersion {
        self.start.version()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Whether the connection may carry another message after this one
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        match self.version() {
            HttpVersion::Http10 => self.headers.has_token("connection", "keep-alive"),
            _ => true,
        }
    }

    /// Start line and headers in original order, terminated by CRLFCRLF
    pub fn headers_to_string(&self) -> String {
        let mut out = String::with_capacity(256);
        self.start.write_to(&mut out);
        for (name, value) in self.headers.iter() {
            out.push_str("\r\n");
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
        }
        out.push_str("\r\n\r\n");
        out
    }

    pub fn headers_to_vec(&self) -> Vec<u8> {
        self.headers_to_string().into_bytes()
    }

    /// Whole message for retransmission
    ///
    /// Chunked bodies were de-chunked while parsing, so they go out with a
    /// `Content-Length` instead.
    pub fn to_wire(&self) -> Vec<u8> {
        let head = match self.framing {
            BodyFraming::Chunked | BodyFraming::ContentLength(_) => {
                let mut copy = HttpMessage {
                    start: self.start.clone(),
                    headers: self.headers.clone(),
                    body: Vec::new(),
                    framing: self.framing,
                };
                copy.headers.remove("transfer-encoding");
                copy.headers
                    .set("Content-Length", self.body.len().to_string());
                copy.headers_to_vec()
            }
            _ => self.headers_to_vec(),
        };

        let mut out = head;
        out.extend_from_slice(&self.body);
        out
    }

    /// Swap in a new body and frame it with `Content-Length`
    pub fn replace_body(&mut self, body: Vec<u8>) {
        self.headers.remove("transfer-encoding");
        self.headers.set("Content-Length", body.len().to_string());
        self.framing = BodyFraming::ContentLength(body.len() as u64);
        self.body = body;
    }

    /// Move the body out, leaving it empty
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }
}

impl HttpMessage<RequestLine> {
    pub fn method(&self) -> &str {
        self.start.method()
    }

    pub fn target(&self) -> &str {
        self.start.target()
    }

    pub fn is_connect(&self) -> bool {
        self.start.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_head(&self) -> bool {
        self.start.method.eq_ignore_ascii_case("HEAD")
    }

    /// Rewrite the request target, e.g. absolute-form to origin-form
    pub fn set_target(&mut self, target: impl Into<String>) {
        self.start.target = target.into();
    }

    /// `host[:port]` the request is addressed to
    ///
    /// The CONNECT target, else the authority of an absolute-form target,
    /// else the Host header.
    pub fn authority(&self) -> Option<&str> {
        if self.is_connect() {
            return Some(self.target());
        }
        if let Some((_, rest)) = self.target().split_once("://") {
            let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
            let authority = &rest[..end];
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            if !authority.is_empty() {
                return Some(authority);
            }
        }
        self.headers
            .get("host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Target with any scheme and authority removed
    pub fn origin_form(&self) -> &str {
        match self.target().split_once("://") {
            Some((_, rest)) => match rest.find(['/', '?']) {
                Some(idx) => &rest[idx..],
                None => "/",
            },
            None => self.target(),
        }
    }

    /// Absolute URL for rule matching
    pub fn absolute_url(&self, scheme: &str, fallback_authority: &str) -> String {
        if self.target().contains("://") {
            return self.target().to_string();
        }
        let authority = self.authority().unwrap_or(fallback_authority);
        format!("{}://{}{}", scheme, authority, self.origin_form())
    }
}

impl HttpMessage<StatusLine> {
    pub fn status(&self) -> u16 {
        self.start.status()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status())
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals
pub fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (rest[..end].to_string(), port);
        }
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        _ => (authority.to_string(), default_port),
    }
}

/// Result of feeding bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    NeedMore,
    /// The message is complete; `trailing` belongs to the next message
    Complete { trailing: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Start,
    StartLine,
    Headers,
    Body(BodyState),
    Complete,
    Error(ParseError),
}

/// Resumable parser for one message
#[derive(Debug)]
pub struct MessageParser<S: StartLine> {
    state: State,
    buffer: Vec<u8>,
    start: Option<S>,
    headers: Headers,
    message: Option<HttpMessage<S>>,
    head_bytes: usize,
    trailer_bytes: usize,
    body_limit: Option<usize>,
    suppress_body: bool,
    _kind: PhantomData<S>,
}

pub type RequestParser = MessageParser<RequestLine>;
pub type ResponseParser = MessageParser<StatusLine>;

impl<S: StartLine> Default for MessageParser<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// Parser for the response to a request with `method`
    ///
    /// Responses to HEAD never carry a body.
    pub fn for_request(method: &str) -> Self {
        let mut parser = Self::new();
        parser.suppress_body = method.eq_ignore_ascii_case("HEAD");
        parser
    }
}

impl<S: StartLine> MessageParser<S> {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            buffer: Vec::new(),
            start: None,
            headers: Headers::new(),
            message: None,
            head_bytes: 0,
            trailer_bytes: 0,
            body_limit: None,
            suppress_body: false,
            _kind: PhantomData,
        }
    }

    /// Fail once more than `limit` body bytes are buffered
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = Some(limit);
        self
    }

    pub fn set_body_limit(&mut self, limit: Option<usize>) {
        self.body_limit = limit;
    }

    /// True once any byte of a message has been consumed
    pub fn has_started(&self) -> bool {
        self.state != State::Start || !self.buffer.is_empty()
    }

    pub fn headers_complete(&self) -> bool {
        self.message.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Message parsed so far; available once the headers are complete
    pub fn message(&self) -> Option<&HttpMessage<S>> {
        self.message.as_ref()
    }

    pub fn message_mut(&mut self) -> Option<&mut HttpMessage<S>> {
        self.message.as_mut()
    }

    pub fn into_message(self) -> Option<HttpMessage<S>> {
        self.message
    }

    /// Drain body bytes parsed so far, for streaming relays
    pub fn take_body(&mut self) -> Vec<u8> {
        self.message
            .as_mut()
            .map(HttpMessage::take_body)
            .unwrap_or_default()
    }

    /// Consume `data`; never blocks
    pub fn feed(&mut self, data: &[u8]) -> Result<ParseStatus, ParseError> {
        match &self.state {
            State::Error(e) => return Err(e.clone()),
            State::Complete => {
                return Ok(ParseStatus::Complete {
                    trailing: data.to_vec(),
                })
            }
            _ => {}
        }

        self.buffer.extend_from_slice(data);

        match self.advance() {
            Ok(()) => {}
            Err(e) => {
                self.state = State::Error(e.clone());
                return Err(e);
            }
        }

        if self.state == State::Complete {
            Ok(ParseStatus::Complete {
                trailing: std::mem::take(&mut self.buffer),
            })
        } else {
            Ok(ParseStatus::NeedMore)
        }
    }

    /// Signal end of input
    ///
    /// Completes a body delimited by connection close; anything else
    /// unfinished is an error.
    pub fn finish(&mut self) -> Result<ParseStatus, ParseError> {
        match &self.state {
            State::Complete => Ok(ParseStatus::Complete {
                trailing: Vec::new(),
            }),
            State::Body(BodyState::UntilClose) => {
                self.state = State::Complete;
                Ok(ParseStatus::Complete {
                    trailing: Vec::new(),
                })
            }
            State::Error(e) => Err(e.clone()),
            _ => {
                self.state = State::Error(ParseError::Incomplete);
                Err(ParseError::Incomplete)
            }
        }
    }

    fn advance(&mut self) -> Result<(), ParseError> {
        let mut pos = 0;

        loop {
            let consumed = match self.state.clone() {
                State::Start => {
                    // Tolerate stray CRLFs between pipelined messages
                    let skip = self.buffer[pos..]
                        .iter()
                        .take_while(|b| **b == b'\r' || **b == b'\n')
                        .count();
                    pos += skip;
                    if pos == self.buffer.len() {
                        break;
                    }
                    self.state = State::StartLine;
                    continue;
                }
                State::StartLine => {
                    let Some((line, used)) = self.next_line(pos)? else {
                        break;
                    };
                    self.start = Some(S::parse(&line)?);
                    self.state = State::Headers;
                    used
                }
                State::Headers => {
                    let Some((line, used)) = self.next_line(pos)? else {
                        break;
                    };
                    if line.is_empty() {
                        self.finish_head()?;
                    } else {
                        self.push_header(&line)?;
                    }
                    used
                }
                State::Body(body) => {
                    let Some(used) = self.advance_body(body, pos)? else {
                        break;
                    };
                    used
                }
                State::Complete | State::Error(_) => break,
            };

            pos += consumed;
        }

        self.buffer.drain(..pos);
        Ok(())
    }

    /// Next line starting at `pos` without its terminator, and the bytes used
    fn next_line(&mut self, pos: usize) -> Result<Option<(String, usize)>, ParseError> {
        let available = &self.buffer[pos..];
        let Some(newline) = available.iter().position(|b| *b == b'\n') else {
            if self.head_bytes + available.len() > MAX_HEAD_BYTES {
                return Err(ParseError::TooLarge("header section"));
            }
            return Ok(None);
        };

        let used = newline + 1;
        self.head_bytes += used;
        if self.head_bytes > MAX_HEAD_BYTES {
            return Err(ParseError::TooLarge("header section"));
        }

        let raw = &available[..newline];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = std::str::from_utf8(raw)
            .map(str::to_string)
            .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned());
        Ok(Some((line, used)))
    }

    fn push_header(&mut self, line: &str) -> Result<(), ParseError> {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::InvalidHeader("obsolete line folding".to_string()));
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;

        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ParseError::InvalidHeader(line.to_string()));
        }

        if self.headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooLarge("header count"));
        }

        self.headers.append(name, value.trim());
        Ok(())
    }

    fn finish_head(&mut self) -> Result<(), ParseError> {
        let start = self
            .start
            .take()
            .ok_or_else(|| ParseError::InvalidStartLine(String::new()))?;
        let headers = std::mem::take(&mut self.headers);

        let framing = self.framing(&start, &headers)?;
        let mut message = HttpMessage::new(start, headers);
        message.framing = framing;
        self.message = Some(message);

        self.state = match framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => State::Complete,
            BodyFraming::ContentLength(n) => State::Body(BodyState::Fixed { remaining: n }),
            BodyFraming::Chunked => State::Body(BodyState::ChunkSize),
            BodyFraming::UntilClose => State::Body(BodyState::UntilClose),
        };
        Ok(())
    }

    fn framing(&self, start: &S, headers: &Headers) -> Result<BodyFraming, ParseError> {
        if self.suppress_body || start.forbids_body() {
            return Ok(BodyFraming::None);
        }

        if headers.contains("transfer-encoding") {
            let last = headers
                .get_all("transfer-encoding")
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .last();
            return match last {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => Ok(BodyFraming::Chunked),
                _ if S::READ_UNTIL_CLOSE => Ok(BodyFraming::UntilClose),
                _ => Err(ParseError::InvalidHeader(
                    "transfer-encoding without chunked".to_string(),
                )),
            };
        }

        let mut length: Option<u64> = None;
        for value in headers
            .get_all("content-length")
            .flat_map(|v| v.split(','))
            .map(str::trim)
        {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength(value.to_string()));
            }
            let parsed = value
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(ParseError::ConflictingContentLength)
                }
                _ => length = Some(parsed),
            }
        }

        Ok(match length {
            Some(n) => BodyFraming::ContentLength(n),
            None if S::READ_UNTIL_CLOSE => BodyFraming::UntilClose,
            None => BodyFraming::None,
        })
    }

    /// Advance body parsing; `None` when more input is needed
    fn advance_body(&mut self, body: BodyState, pos: usize) -> Result<Option<usize>, ParseError> {
        let available = self.buffer.len() - pos;

        match body {
            BodyState::Fixed { remaining } => {
                if available == 0 {
                    return Ok(None);
                }
                let take = remaining.min(available as u64) as usize;
                self.append_body(pos, take)?;
                let remaining = remaining - take as u64;
                self.state = if remaining == 0 {
                    State::Complete
                } else {
                    State::Body(BodyState::Fixed { remaining })
                };
                Ok(Some(take))
            }
            BodyState::UntilClose => {
                if available == 0 {
                    return Ok(None);
                }
                self.append_body(pos, available)?;
                Ok(Some(available))
            }
            BodyState::ChunkSize => {
                let Some((line, used)) = self.chunk_line(pos)? else {
                    return Ok(None);
                };
                let size_text = line.split(';').next().unwrap_or_default().trim();
                if size_text.is_empty() || size_text.len() > 16 {
                    return Err(ParseError::InvalidChunk(line));
                }
                let size = u64::from_str_radix(size_text, 16)
                    .map_err(|_| ParseError::InvalidChunk(line.clone()))?;
                self.state = if size == 0 {
                    State::Body(BodyState::Trailers)
                } else {
                    State::Body(BodyState::ChunkData { remaining: size })
                };
                Ok(Some(used))
            }
            BodyState::ChunkData { remaining } => {
                if available == 0 {
                    return Ok(None);
                }
                let take = remaining.min(available as u64) as usize;
                self.append_body(pos, take)?;
                let remaining = remaining - take as u64;
                self.state = if remaining == 0 {
                    State::Body(BodyState::ChunkEnd)
                } else {
                    State::Body(BodyState::ChunkData { remaining })
                };
                Ok(Some(take))
            }
            BodyState::ChunkEnd => {
                let rest = &self.buffer[pos..];
                if rest.starts_with(b"\r\n") {
                    self.state = State::Body(BodyState::ChunkSize);
                    Ok(Some(2))
                } else if rest.starts_with(b"\n") {
                    self.state = State::Body(BodyState::ChunkSize);
                    Ok(Some(1))
                } else if rest.is_empty() || rest == b"\r" {
                    Ok(None)
                } else {
                    Err(ParseError::InvalidChunk("missing CRLF after chunk data".to_string()))
                }
            }
            BodyState::Trailers => {
                let Some((line, used)) = self.chunk_line(pos)? else {
                    return Ok(None);
                };
                if line.is_empty() {
                    self.state = State::Complete;
                }
                Ok(Some(used))
            }
        }
    }

    /// Line inside chunked framing; bounded separately from the header section
    fn chunk_line(&mut self, pos: usize) -> Result<Option<(String, usize)>, ParseError> {
        let available = &self.buffer[pos..];
        let Some(newline) = available.iter().position(|b| *b == b'\n') else {
            if self.trailer_bytes + available.len() > MAX_HEAD_BYTES {
                return Err(ParseError::TooLarge("chunk metadata"));
            }
            return Ok(None);
        };

        self.trailer_bytes += newline + 1;
        if self.trailer_bytes > MAX_HEAD_BYTES {
            return Err(ParseError::TooLarge("chunk metadata"));
        }

        let raw = &available[..newline];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        Ok(Some((String::from_utf8_lossy(raw).into_owned(), newline + 1)))
    }

    fn append_body(&mut self, pos: usize, len: usize) -> Result<(), ParseError> {
        let Some(message) = self.message.as_mut() else {
            return Err(ParseError::Incomplete);
        };
        if let Some(limit) = self.body_limit {
            if message.body.len() + len > limit {
                return Err(ParseError::TooLarge("body"));
            }
        }
        message.body.extend_from_slice(&self.buffer[pos..pos + len]);
        Ok(())
    }
}

/// Check if method is a valid token
fn is_valid_method(method: &str) -> bool {
    !method.is_empty() && method.len() <= 32 && method.bytes().all(is_token_byte)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_request(data: &[u8]) -> (HttpRequest, Vec<u8>) {
        let mut parser = RequestParser::new();
        match parser.feed(data).unwrap() {
            ParseStatus::Complete { trailing } => (parser.into_message().unwrap(), trailing),
            ParseStatus::NeedMore => panic!("request incomplete"),
        }
    }

    #[test]
    fn test_parse_simple_get_request() {
        let (request, trailing) = parse_request(b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n");

        assert_eq!(request.method(), "GET");
        assert_eq!(request.target(), "/path");
        assert_eq!(request.version(), HttpVersion::Http11);
        assert_eq!(request.headers().get("HOST"), Some("example.com"));
        assert_eq!(request.framing(), BodyFraming::None);
        assert!(trailing.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let data = b"POST /api HTTP/1.1\r\nHost: example.com\r\nContent-Length: 13\r\n\r\nHello, World!";
        let mut parser = RequestParser::new();

        for (i, byte) in data.iter().enumerate() {
            let status = parser.feed(std::slice::from_ref(byte)).unwrap();
            if i + 1 < data.len() {
                assert_eq!(status, ParseStatus::NeedMore);
            } else {
                assert_eq!(status, ParseStatus::Complete { trailing: vec![] });
            }
        }

        let request = parser.into_message().unwrap();
        assert_eq!(request.body(), b"Hello, World!");
    }

    #[test]
    fn test_version_inference() {
        let cases = [
            ("HTTP/1.0", HttpVersion::Http10),
            ("HTTP/1.1", HttpVersion::Http11),
            ("HTTP/1.2", HttpVersion::Http11),
            ("HTTP/2.0", HttpVersion::Http2),
            ("HTTP/2", HttpVersion::Http2),
            ("HTTP/3.0", HttpVersion::Http11),
        ];
        for (token, expected) in cases {
            let data = format!("GET / {}\r\n\r\n", token);
            let (request, _) = parse_request(data.as_bytes());
            assert_eq!(request.version(), expected, "{}", token);
        }
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut parser = RequestParser::new();
        assert!(matches!(
            parser.feed(b"GET / HTTX/1.1\r\n\r\n"),
            Err(ParseError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_header_order_and_duplicates_kept() {
        let data = b"GET / HTTP/1.1\r\nHost: a.com\r\nX-Dup: 1\r\nAccept: */*\r\nx-dup: 2\r\n\r\n";
        let (request, _) = parse_request(data);

        let names: Vec<&str> = request.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Host", "X-Dup", "Accept", "x-dup"]);
        assert_eq!(request.headers().get_all("x-dup").collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(request.headers_to_string().as_bytes(), &data[..]);
    }

    #[test]
    fn test_header_value_outlives_lookup_name() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/html");

        let value = {
            let name = String::from("content-type");
            headers.get(&name)
        };
        assert_eq!(value, Some("text/html"));
    }

    #[test]
    fn test_response_round_trip() {
        let data = b"HTTP/1.0 404 Not Found\r\nServer: test\r\nContent-Length: 0\r\n\r\n";
        let mut parser = ResponseParser::new();
        assert!(matches!(parser.feed(data).unwrap(), ParseStatus::Complete { .. }));

        let response = parser.into_message().unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.reason(), "Not Found");
        assert_eq!(response.headers_to_vec(), data.to_vec());
    }

    #[test]
    fn test_chunked_body_with_extensions_and_trailers() {
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nHello\r\n7\r\n, World\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut parser = ResponseParser::new();
        assert!(matches!(parser.feed(data).unwrap(), ParseStatus::Complete { .. }));

        let response = parser.into_message().unwrap();
        assert_eq!(response.framing(), BodyFraming::Chunked);
        assert_eq!(response.body(), b"Hello, World");
        assert!(!response.headers().contains("x-trailer"));
    }

    #[test]
    fn test_chunked_wins_over_content_length() {
        let data = b"POST / HTTP/1.1\r\nContent-Length: 100\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let (request, _) = parse_request(data);
        assert_eq!(request.body(), b"abc");
    }

    #[test]
    fn test_to_wire_reframes_chunked() {
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-A: 1\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let mut parser = ResponseParser::new();
        parser.feed(data).unwrap();
        let response = parser.into_message().unwrap();

        assert_eq!(
            response.to_wire(),
            b"HTTP/1.1 200 OK\r\nX-A: 1\r\nContent-Length: 3\r\n\r\nabc".to_vec()
        );
    }

    #[test]
    fn test_conflicting_content_length() {
        let mut parser = RequestParser::new();
        let result = parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n");
        assert_eq!(result, Err(ParseError::ConflictingContentLength));

        // Error state is absorbing
        assert_eq!(parser.feed(b"more"), Err(ParseError::ConflictingContentLength));
    }

    #[test]
    fn test_duplicate_equal_content_length_accepted() {
        let (request, _) = parse_request(b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(request.body(), b"ok");
    }

    #[test]
    fn test_obs_fold_rejected() {
        let mut parser = RequestParser::new();
        let result = parser.feed(b"GET / HTTP/1.1\r\nX-Long: a\r\n  continued\r\n\r\n");
        assert!(matches!(result, Err(ParseError::InvalidHeader(_))));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let mut parser = RequestParser::new();
        assert!(parser.feed(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n").is_err());

        let mut parser = RequestParser::new();
        assert!(parser.feed(b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n").is_err());
    }

    #[test]
    fn test_too_many_headers() {
        let mut data = String::from("GET / HTTP/1.1\r\n");
        for i in 0..=MAX_HEADERS {
            data.push_str(&format!("X-H{}: v\r\n", i));
        }
        data.push_str("\r\n");

        let mut parser = RequestParser::new();
        assert_eq!(parser.feed(data.as_bytes()), Err(ParseError::TooLarge("header count")));
    }

    #[test]
    fn test_oversized_head_without_newline() {
        let mut parser = RequestParser::new();
        let data = vec![b'A'; MAX_HEAD_BYTES + 1];
        assert!(matches!(parser.feed(&data), Err(ParseError::TooLarge(_))));
    }

    #[test]
    fn test_pipelined_trailing_bytes() {
        let data = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let (request, trailing) = parse_request(data);
        assert_eq!(request.target(), "/a");

        let (next, rest) = parse_request(&trailing);
        assert_eq!(next.target(), "/b");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_response_until_close() {
        let mut parser = ResponseParser::new();
        assert_eq!(
            parser.feed(b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\n\r\n<p>").unwrap(),
            ParseStatus::NeedMore
        );
        assert_eq!(parser.feed(b"hi</p>").unwrap(), ParseStatus::NeedMore);
        assert!(matches!(parser.finish().unwrap(), ParseStatus::Complete { .. }));

        let response = parser.into_message().unwrap();
        assert_eq!(response.framing(), BodyFraming::UntilClose);
        assert_eq!(response.body(), b"<p>hi</p>");
    }

    #[test]
    fn test_finish_mid_body_is_incomplete() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").unwrap();
        assert_eq!(parser.finish(), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut parser = ResponseParser::for_request("HEAD");
        let status = parser
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n")
            .unwrap();
        assert_eq!(status, ParseStatus::Complete { trailing: vec![] });
    }

    #[test]
    fn test_no_body_status_codes() {
        for status in ["204 No Content", "304 Not Modified", "100 Continue"] {
            let mut parser = ResponseParser::new();
            let data = format!("HTTP/1.1 {}\r\n\r\n", status);
            assert!(matches!(
                parser.feed(data.as_bytes()).unwrap(),
                ParseStatus::Complete { .. }
            ));
        }
    }

    #[test]
    fn test_body_limit() {
        let mut parser = ResponseParser::new().with_body_limit(4);
        let result = parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789");
        assert_eq!(result, Err(ParseError::TooLarge("body")));
    }

    #[test]
    fn test_streaming_take_body() {
        let mut parser = ResponseParser::new().with_body_limit(4);
        parser
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\n0123")
            .unwrap();
        assert!(parser.headers_complete());
        assert_eq!(parser.take_body(), b"0123");
        assert!(matches!(parser.feed(b"4567").unwrap(), ParseStatus::Complete { .. }));
        assert_eq!(parser.take_body(), b"4567");
    }

    #[test]
    fn test_request_authority_and_url() {
        let (request, _) = parse_request(b"GET http://Example.com:8080/a?b=1 HTTP/1.1\r\nHost: other\r\n\r\n");
        assert_eq!(request.authority(), Some("Example.com:8080"));
        assert_eq!(request.origin_form(), "/a?b=1");
        assert_eq!(
            request.absolute_url("http", "fallback"),
            "http://Example.com:8080/a?b=1"
        );

        let (request, _) = parse_request(b"GET /x HTTP/1.1\r\nHost: site.org\r\n\r\n");
        assert_eq!(request.absolute_url("https", "sni.org"), "https://site.org/x");

        let (request, _) = parse_request(b"CONNECT site.org:443 HTTP/1.1\r\n\r\n");
        assert!(request.is_connect());
        assert_eq!(request.authority(), Some("site.org:443"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.com:8443", 443), ("a.com".to_string(), 8443));
        assert_eq!(split_host_port("a.com", 80), ("a.com".to_string(), 80));
        assert_eq!(split_host_port("[::1]:8080", 80), ("::1".to_string(), 8080));
        assert_eq!(split_host_port("[::1]", 443), ("::1".to_string(), 443));
    }

    #[test]
    fn test_keep_alive_rules() {
        let (request, _) = parse_request(b"GET / HTTP/1.1\r\n\r\n");
        assert!(request.keep_alive());

        let (request, _) = parse_request(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!request.keep_alive());

        let (request, _) = parse_request(b"GET / HTTP/1.0\r\n\r\n");
        assert!(!request.keep_alive());

        let (request, _) = parse_request(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(request.keep_alive());
    }

    #[test]
    fn test_replace_body_sets_length() {
        let mut parser = ResponseParser::new();
        parser
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nab\r\n0\r\n\r\n")
            .unwrap();
        let mut response = parser.into_message().unwrap();
        response.replace_body(b"hello".to_vec());

        assert_eq!(response.headers().get("content-length"), Some("5"));
        assert!(!response.headers().contains("transfer-encoding"));
        assert_eq!(response.framing(), BodyFraming::ContentLength(5));
    }
}
