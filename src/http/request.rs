use std::fmt;

use crate::chunkqueue::ChunkQueue;
use crate::error::{EngineError, Result};

/// Maximum raw request-line length before a `414` (spec §4.5).
pub const MAX_URI_LEN: usize = 8 * 1024;
const MAX_HEADER_LINE: usize = 16 * 1024;
const MAX_HEADERS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Propfind,
    Connect,
    Trace,
    Unset(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Propfind => "PROPFIND",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
            Method::Unset(raw) => raw,
        }
    }

    pub fn is_allowed(&self, allowed: &[String]) -> bool {
        allowed.iter().any(|m| m == self.as_str())
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "PROPFIND" => Method::Propfind,
            "CONNECT" => Method::Connect,
            "TRACE" => Method::Trace,
            other => Method::Unset(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParsingState {
    RequestLine,
    Headers,
    Validating,
    Complete,
}

/// How the request body is framed, decided once headers are complete
/// (spec §4.5 validation step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
}

/// A single `name: value` header, case preserved, folded continuations
/// already merged into `value` (spec §4.5).
#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub version: HttpVersion,
    pub headers: Vec<HeaderLine>,
    pub framing: BodyFraming,
    pub expect_continue: bool,
    pub keep_alive: bool,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Incremental request-line + header parser reading from a `ChunkQueue`
/// (spec §4.5). Feed it more data and call `parse` again until it returns
/// `Done` or `Error`.
pub struct RequestParser {
    state: ParsingState,
    raw: Vec<u8>,
    method: Option<Method>,
    uri: Option<String>,
    version: Option<HttpVersion>,
    headers: Vec<HeaderLine>,
}

pub enum ParseProgress {
    NeedMore,
    Done(HttpRequest),
    Error(u16),
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParsingState::RequestLine,
            raw: Vec::new(),
            method: None,
            uri: None,
            version: None,
            headers: Vec::new(),
        }
    }

    /// Drives the state machine as far as the currently buffered bytes in
    /// `cq` allow, consuming only what it fully parses.
    pub fn parse(&mut self, cq: &mut ChunkQueue) -> Result<ParseProgress> {
        loop {
            match self.state {
                ParsingState::RequestLine => match self.try_take_line(cq, MAX_URI_LEN + 64)? {
                    None => return Ok(ParseProgress::NeedMore),
                    Some(line) => match self.parse_request_line(&line) {
                        Ok(()) => self.state = ParsingState::Headers,
                        Err(code) => return Ok(ParseProgress::Error(code)),
                    },
                },
                ParsingState::Headers => match self.try_take_line(cq, MAX_HEADER_LINE)? {
                    None => return Ok(ParseProgress::NeedMore),
                    Some(line) => {
                        if line.is_empty() {
                            self.state = ParsingState::Validating;
                            continue;
                        }
                        if self.headers.len() >= MAX_HEADERS {
                            return Ok(ParseProgress::Error(431));
                        }
                        if (line.starts_with(' ') || line.starts_with('\t'))
                            && let Some(last) = self.headers.last_mut()
                        {
                            last.value.push(' ');
                            last.value.push_str(line.trim());
                            continue;
                        }
                        match split_header(&line) {
                            Some((name, value)) => self.headers.push(HeaderLine { name, value }),
                            None => return Ok(ParseProgress::Error(400)),
                        }
                    }
                },
                ParsingState::Validating => {
                    return match self.validate() {
                        Ok(req) => {
                            self.state = ParsingState::Complete;
                            Ok(ParseProgress::Done(req))
                        }
                        Err(code) => Ok(ParseProgress::Error(code)),
                    };
                }
                ParsingState::Complete => return Ok(ParseProgress::Done(self.snapshot())),
            }
        }
    }

    fn snapshot(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.clone().unwrap_or(Method::Unset(String::new())),
            uri: self.uri.clone().unwrap_or_default(),
            version: self.version.unwrap_or(HttpVersion::Http11),
            headers: self.headers.clone(),
            framing: BodyFraming::None,
            expect_continue: false,
            keep_alive: true,
        }
    }

    /// Pulls one CRLF-terminated line out of `cq` without leaving partial
    /// progress behind on failure; returns `None` if no full line is
    /// buffered yet.
    fn try_take_line(&mut self, cq: &mut ChunkQueue, max_len: usize) -> Result<Option<String>> {
        let available = cq.extract_to(cq.length.min((max_len + 2) as u64))?;
        let Some(pos) = find_crlf(&available) else {
            if available.len() as u64 > max_len as u64 {
                return Err(EngineError::Parse("line exceeds maximum length".into()));
            }
            return Ok(None);
        };
        cq.skip((pos + 2) as u64);
        let line = String::from_utf8_lossy(&available[..pos]).into_owned();
        Ok(Some(line))
    }

    fn parse_request_line(&mut self, line: &str) -> std::result::Result<(), u16> {
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(uri), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(400);
        };
        if uri.len() > MAX_URI_LEN {
            return Err(414);
        }
        let version = match version {
            "HTTP/1.1" => HttpVersion::Http11,
            "HTTP/1.0" => HttpVersion::Http10,
            _ => return Err(505),
        };
        self.method = Some(Method::from(method));
        self.uri = Some(uri.to_string());
        self.version = Some(version);
        Ok(())
    }

    fn validate(&mut self) -> std::result::Result<HttpRequest, u16> {
        let version = self.version.unwrap_or(HttpVersion::Http11);
        let host = self
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"));
        if version == HttpVersion::Http11 && host.is_none() {
            return Err(400);
        }

        let content_length = self
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"));
        let transfer_encoding = self
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("transfer-encoding"));
        let is_chunked = transfer_encoding
            .map(|h| h.value.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        let framing = match (content_length, is_chunked) {
            (Some(_), true) => return Err(400),
            (Some(h), false) => {
                let len: u64 = h.value.trim().parse().map_err(|_| 400u16)?;
                BodyFraming::ContentLength(len)
            }
            (None, true) => BodyFraming::Chunked,
            (None, false) => BodyFraming::None,
        };

        let expect_continue = self
            .headers
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case("expect") && h.value.eq_ignore_ascii_case("100-continue"));

        let connection = self
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("connection"))
            .map(|h| h.value.to_ascii_lowercase());
        let keep_alive = match (version, connection.as_deref()) {
            (_, Some(v)) if v.contains("close") => false,
            (HttpVersion::Http10, Some(v)) if v.contains("keep-alive") => true,
            (HttpVersion::Http10, _) => false,
            _ => true,
        };

        Ok(HttpRequest {
            method: self.method.clone().unwrap_or(Method::Unset(String::new())),
            uri: self.uri.clone().unwrap_or_default(),
            version,
            headers: std::mem::take(&mut self.headers),
            framing,
            expect_continue,
            keep_alive,
        })
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn split_header(line: &str) -> Option<(String, String)> {
    let idx = line.find(':')?;
    let name = line[..idx].trim();
    if name.is_empty() {
        return None;
    }
    let value = line[idx + 1..].trim();
    Some((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut RequestParser, data: &[u8]) -> Result<ParseProgress> {
        let mut cq = ChunkQueue::new();
        cq.append_mem(data);
        parser.parse(&mut cq)
    }

    #[test]
    fn parses_simple_get() {
        let mut parser = RequestParser::new();
        let progress =
            feed_all(&mut parser, b"GET /foo HTTP/1.1\r\nHost: example.test\r\n\r\n").unwrap();
        match progress {
            ParseProgress::Done(req) => {
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.uri, "/foo");
                assert_eq!(req.version, HttpVersion::Http11);
                assert!(req.keep_alive);
            }
            _ => panic!("expected a complete parse"),
        }
    }

    #[test]
    fn missing_host_on_http11_is_400() {
        let mut parser = RequestParser::new();
        let progress = feed_all(&mut parser, b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(matches!(progress, ParseProgress::Error(400)));
    }

    #[test]
    fn content_length_and_chunked_together_is_400() {
        let mut parser = RequestParser::new();
        let progress = feed_all(
            &mut parser,
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert!(matches!(progress, ParseProgress::Error(400)));
    }

    #[test]
    fn uri_over_8kib_is_414() {
        let mut parser = RequestParser::new();
        let long_uri = "/".to_string() + &"a".repeat(9000);
        let request = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", long_uri);
        let progress = feed_all(&mut parser, request.as_bytes()).unwrap();
        assert!(matches!(progress, ParseProgress::Error(414)));
    }

    #[test]
    fn incremental_feed_across_chunk_boundary() {
        let mut parser = RequestParser::new();
        let mut cq = ChunkQueue::new();
        cq.append_mem(b"GET /foo HTTP/1.1\r\n");
        assert!(matches!(
            parser.parse(&mut cq).unwrap(),
            ParseProgress::NeedMore
        ));
        cq.append_mem(b"Host: example.test\r\n\r\n");
        assert!(matches!(
            parser.parse(&mut cq).unwrap(),
            ParseProgress::Done(_)
        ));
    }

    #[test]
    fn header_continuation_is_folded() {
        let mut parser = RequestParser::new();
        let progress = feed_all(
            &mut parser,
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: a\r\n b\r\n\r\n",
        )
        .unwrap();
        match progress {
            ParseProgress::Done(req) => {
                assert_eq!(req.header("X-Long"), Some("a b"));
            }
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn expect_100_continue_is_flagged() {
        let mut parser = RequestParser::new();
        let progress = feed_all(
            &mut parser,
            b"POST / HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n",
        )
        .unwrap();
        match progress {
            ParseProgress::Done(req) => assert!(req.expect_continue),
            _ => panic!("expected complete parse"),
        }
    }
}
