use std::fs;
use std::path::Path;

use crate::chunkqueue::ChunkQueue;
use crate::config::RouteConfig;
use crate::http::request::HttpVersion;
use halcyon_log::format_time;

/// Ordered, case-preserving response header (spec §4.5/§6).
#[derive(Debug, Clone)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(u64),
    Chunked,
    CloseDelimited,
    NoBody,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<HeaderLine>,
    pub body: ChunkQueue,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            status_text: status_text(status_code).to_string(),
            headers: Vec::new(),
            body: ChunkQueue::new(),
        }
    }

    pub fn set_status(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.status_text = status_text(code).to_string();
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if let Some(h) = self.headers.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
            h.value = value.into();
        } else {
            self.headers.push(HeaderLine {
                name: name.to_string(),
                value: value.into(),
            });
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) -> &mut Self {
        self.set_header("Content-Type", content_type);
        self.body = ChunkQueue::new();
        self.body.append_mem(&body);
        self
    }

    /// Picks the wire framing per spec §6: an explicit Content-Length wins,
    /// otherwise HTTP/1.1 falls back to chunked, HTTP/1.0 to close-delimited.
    pub fn resolve_framing(&self, version: HttpVersion, keep_alive: bool) -> BodyFraming {
        if matches!(self.status_code, 204 | 304) {
            return BodyFraming::NoBody;
        }
        if self.header("Content-Length").is_some() {
            return BodyFraming::ContentLength(self.body.length);
        }
        match version {
            HttpVersion::Http11 if keep_alive => BodyFraming::Chunked,
            _ => BodyFraming::CloseDelimited,
        }
    }

    /// Renders the status line and headers, filling in Date/Server/
    /// Connection/framing headers per spec §6. Does not include the body.
    pub fn render_head(
        &mut self,
        version: HttpVersion,
        keep_alive: bool,
        include_length: bool,
    ) -> Vec<u8> {
        let framing = self.resolve_framing(version, keep_alive);
        if include_length {
            match framing {
                BodyFraming::ContentLength(_) => {
                    self.set_header("Content-Length", self.body.length.to_string());
                }
                BodyFraming::Chunked => {
                    self.set_header("Transfer-Encoding", "chunked");
                }
                BodyFraming::CloseDelimited | BodyFraming::NoBody => {}
            }
        }
        if self.header("Date").is_none() {
            self.set_header("Date", format_time(std::time::SystemTime::now()));
        }
        if self.header("Server").is_none() {
            self.set_header("Server", "halcyond");
        }
        if self.header("Connection").is_none() {
            self.set_header(
                "Connection",
                if keep_alive && framing != BodyFraming::CloseDelimited {
                    "keep-alive"
                } else {
                    "close"
                },
            );
        }

        let mut out = format!(
            "{} {} {}\r\n",
            version.as_str(),
            self.status_code,
            self.status_text
        )
        .into_bytes();
        for h in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", h.name, h.value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    pub fn redirect(code: u16, target_url: &str) -> Self {
        let mut res = HttpResponse::new(code);
        res.set_header("Location", target_url)
            .set_header("Content-Length", "0");
        res
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

pub fn mime_type_for(extension: Option<&str>) -> &'static str {
    match extension {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub fn generate_autoindex(path: &Path, original_url: &str) -> HttpResponse {
    let mut html = format!("<html><body><h1>Index of {}</h1><ul>", original_url);
    if let Ok(entries) = path.read_dir() {
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        for name in names {
            html.push_str(&format!(
                "<li><a href=\"{}/{}\">{}</a></li>",
                original_url.trim_end_matches('/'),
                name,
                name
            ));
        }
    }
    html.push_str("</ul></body></html>");

    let mut res = HttpResponse::new(200);
    res.set_body(html.into_bytes(), "text/html");
    res
}

/// Builds an error response, preferring a configured error page for `code`
/// resolved against the matched route's document root.
pub fn handle_error(code: u16, route: Option<&RouteConfig>, error_pages: Option<&std::collections::HashMap<u16, String>>) -> HttpResponse {
    if let (Some(route), Some(pages)) = (route, error_pages)
        && let Some(path_str) = pages.get(&code)
    {
        let err_path = Path::new(&route.root).join(path_str.trim_start_matches('/'));
        if let Ok(content) = fs::read(err_path) {
            let mut res = HttpResponse::new(code);
            res.set_body(content, "text/html");
            return res;
        }
    }

    let mut res = HttpResponse::new(code);
    res.set_body(
        format!("{} {}", code, status_text(code)).into_bytes(),
        "text/plain",
    );
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_response_is_used_verbatim() {
        let mut res = HttpResponse::new(200);
        res.set_body(b"hi".to_vec(), "text/plain");
        let framing = res.resolve_framing(HttpVersion::Http11, true);
        assert_eq!(framing, BodyFraming::ContentLength(2));
    }

    #[test]
    fn keep_alive_http11_without_length_is_chunked() {
        let res = HttpResponse::new(200);
        let framing = res.resolve_framing(HttpVersion::Http11, true);
        assert_eq!(framing, BodyFraming::Chunked);
    }

    #[test]
    fn http10_without_length_is_close_delimited() {
        let res = HttpResponse::new(200);
        let framing = res.resolve_framing(HttpVersion::Http10, false);
        assert_eq!(framing, BodyFraming::CloseDelimited);
    }

    #[test]
    fn render_head_fills_ambient_headers() {
        let mut res = HttpResponse::new(200);
        res.set_body(b"ok".to_vec(), "text/plain");
        let head = res.render_head(HttpVersion::Http11, true, true);
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 2"));
        assert!(head.contains("Server: halcyond"));
        assert!(head.contains("Connection: keep-alive"));
    }
}
