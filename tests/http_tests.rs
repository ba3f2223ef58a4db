use halcyon_httpd::chunkqueue::ChunkQueue;
use halcyon_httpd::http::{HttpResponse, HttpVersion, Method, ParseProgress, RequestParser};

fn parse(raw: &[u8]) -> ParseProgress {
    let mut cq = ChunkQueue::new();
    cq.append_mem(raw);
    let mut parser = RequestParser::new();
    parser.parse(&mut cq).unwrap()
}

#[test]
fn test_simple_get_request() {
    let raw = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
    match parse(raw) {
        ParseProgress::Done(req) => {
            assert_eq!(req.method, Method::Get);
            assert_eq!(req.uri, "/index.html");
            assert_eq!(req.version, HttpVersion::Http11);
            assert_eq!(req.header("Host"), Some("localhost"));
        }
        _ => panic!("expected a complete parse"),
    }
}

#[test]
fn test_fragmented_request_line_needs_more() {
    let mut cq = ChunkQueue::new();
    cq.append_mem(b"GET /path ");
    let mut parser = RequestParser::new();
    assert!(matches!(
        parser.parse(&mut cq).unwrap(),
        ParseProgress::NeedMore
    ));

    cq.append_mem(b"HTTP/1.1\r\n");
    assert!(matches!(
        parser.parse(&mut cq).unwrap(),
        ParseProgress::NeedMore
    ));

    cq.append_mem(b"Host: localhost\r\nUser-Agent: test\r\n\r\n");
    match parser.parse(&mut cq).unwrap() {
        ParseProgress::Done(req) => assert_eq!(req.uri, "/path"),
        _ => panic!("expected a complete parse"),
    }
}

#[test]
fn test_post_request_with_content_length_framing() {
    let raw = b"POST /api HTTP/1.1\r\nHost: x\r\nContent-Length: 13\r\n\r\nHello, World!";
    match parse(raw) {
        ParseProgress::Done(req) => {
            assert_eq!(req.method, Method::Post);
            assert_eq!(
                req.framing,
                halcyon_httpd::http::RequestBodyFraming::ContentLength(13)
            );
        }
        _ => panic!("expected a complete parse"),
    }
}

#[test]
fn test_post_fragmented_across_chunk_boundary() {
    let mut cq = ChunkQueue::new();
    cq.append_mem(b"POST /data HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n");
    let mut parser = RequestParser::new();
    assert!(matches!(
        parser.parse(&mut cq).unwrap(),
        ParseProgress::NeedMore
    ));

    cq.append_mem(b"\r\n");
    match parser.parse(&mut cq).unwrap() {
        ParseProgress::Done(req) => assert_eq!(
            req.framing,
            halcyon_httpd::http::RequestBodyFraming::ContentLength(10)
        ),
        _ => panic!("expected headers to complete without the body"),
    }
}

#[test]
fn test_unrecognized_method_is_tracked_not_rejected() {
    let raw = b"PATCH /invalid HTTP/1.1\r\nHost: x\r\n\r\n";
    match parse(raw) {
        ParseProgress::Done(req) => assert_eq!(req.method, Method::Unset("PATCH".to_string())),
        _ => panic!("expected a complete parse"),
    }
}

#[test]
fn test_missing_host_on_http11_is_rejected() {
    let raw = b"GET / HTTP/1.1\r\n\r\n";
    assert!(matches!(parse(raw), ParseProgress::Error(400)));
}

#[test]
fn test_response_generation() {
    let mut res = HttpResponse::new(200);
    res.set_header("Content-Type", "text/plain");
    res.set_body(b"Hello Rust".to_vec(), "text/plain");

    let head = res.render_head(HttpVersion::Http11, true, true);
    let s = String::from_utf8_lossy(&head);

    assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(s.contains("Content-Type: text/plain\r\n"));
    assert!(s.contains("Content-Length: 10\r\n"));
    assert_eq!(res.body.length, 10);
}

#[test]
fn test_response_framing_falls_back_to_chunked_on_keepalive() {
    let res = HttpResponse::new(200);
    let framing = res.resolve_framing(HttpVersion::Http11, true);
    assert_eq!(framing, halcyon_httpd::http::ResponseBodyFraming::Chunked);
}
