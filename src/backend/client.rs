use crate::config::{BackendConfig, RouteConfig};
use crate::error::Result;
use crate::fastcgi::{self, RecordType, ROLE_RESPONDER};
use crate::http::{HttpRequest, HttpResponse};

const REQUEST_ID: u16 = 1;

/// Encodes one full FastCGI request (BeginRequest + Params + Stdin) for
/// `backend` (spec §4.11/§6). `keep_conn` is set so the backend leaves the
/// connection open for the next job on the same socket -- `backend::pool`
/// keeps one persistent connection per worker thread and reuses it across
/// requests. The caller's body bytes, already drained off the wire by the
/// VR's input filter chain, go out as the single STDIN stream.
pub fn encode_request(backend: &BackendConfig, route: &RouteConfig, request: &HttpRequest, body: &[u8]) -> Vec<u8> {
    let _ = backend;
    let script_filename = script_filename_for(route, &request.uri);
    let env = fastcgi::build_env(request, route, &script_filename);
    let params: Vec<(String, String)> = env.into_iter().collect();

    let mut wire = Vec::new();
    wire.extend(fastcgi::encode_begin_request(REQUEST_ID, ROLE_RESPONDER, true));
    wire.extend(fastcgi::encode_params(REQUEST_ID, &params));
    wire.extend(fastcgi::encode_stream_records(RecordType::Stdin, REQUEST_ID, body));
    wire
}

pub fn script_filename_for(route: &RouteConfig, uri: &str) -> String {
    let path = uri.split('?').next().unwrap_or(uri);
    let relative = path.strip_prefix(route.path.as_str()).unwrap_or(path);
    let relative = relative.trim_start_matches('/');
    format!("{}/{}", route.root.trim_end_matches('/'), relative)
}

/// Splits a FastCGI/CGI response into status/headers/body (spec §6): a
/// `Status:` header sets the code (default 200), every other header
/// line before the blank line carries straight through.
pub fn parse_cgi_response(stdout: &[u8]) -> HttpResponse {
    let split = stdout.windows(4).position(|w| w == b"\r\n\r\n");
    let (head, body): (&[u8], &[u8]) = match split {
        Some(pos) => (&stdout[..pos], &stdout[pos + 4..]),
        None => (stdout, &[]),
    };

    let mut status_code = 200u16;
    let mut headers = Vec::new();
    for line in String::from_utf8_lossy(head).split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim().to_string(), value.trim().to_string());
        if name.eq_ignore_ascii_case("status") {
            if let Some(code) = value.split(' ').next().and_then(|c| c.parse().ok()) {
                status_code = code;
            }
        } else {
            headers.push((name, value));
        }
    }

    let content_type = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "text/html".to_string());

    let mut res = HttpResponse::new(status_code);
    res.set_body(body.to_vec(), &content_type);
    for (name, value) in headers {
        if !name.eq_ignore_ascii_case("content-type") {
            res.set_header(&name, value);
        }
    }
    res
}

/// Decodes FastCGI Stdout/EndRequest records arriving on a connection,
/// accumulating stdout bytes until EndRequest closes out the job. Used by
/// `backend::pool`'s worker threads, which own the actual socket.
pub fn drain_records(raw: &mut Vec<u8>, stdout: &mut Vec<u8>) -> Result<bool> {
    let mut consumed_total = 0;
    let mut done = false;
    while let Some((record, consumed)) = fastcgi::decode_record(&raw[consumed_total..])? {
        consumed_total += consumed;
        match record.kind {
            RecordType::Stdout => stdout.extend_from_slice(&record.payload),
            RecordType::EndRequest => {
                done = true;
                break;
            }
            _ => {}
        }
    }
    raw.drain(..consumed_total);
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_and_headers_from_cgi_stdout() {
        let stdout = b"Status: 201 Created\r\nX-App: demo\r\n\r\nbody-bytes";
        let res = parse_cgi_response(stdout);
        assert_eq!(res.status_code, 201);
        assert_eq!(res.header("X-App"), Some("demo"));
        assert_eq!(res.body.length, 10);
    }

    #[test]
    fn defaults_to_200_without_a_status_header() {
        let stdout = b"Content-Type: text/plain\r\n\r\nhi";
        let res = parse_cgi_response(stdout);
        assert_eq!(res.status_code, 200);
        assert_eq!(res.header("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn drain_records_reports_end_request_and_keeps_trailing_bytes() {
        let mut wire = Vec::new();
        wire.extend(fastcgi::encode_stream_records(RecordType::Stdout, REQUEST_ID, b"hi"));
        wire.extend(fastcgi::encode_record(RecordType::EndRequest, REQUEST_ID, &[0, 0, 0, 0, 0, 0, 0, 0]));
        wire.extend(b"leftover");
        let mut stdout = Vec::new();
        let done = drain_records(&mut wire, &mut stdout).unwrap();
        assert!(done);
        assert_eq!(stdout, b"hi");
        assert_eq!(wire, b"leftover");
    }
}
