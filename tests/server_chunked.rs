use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use halcyon_httpd::config::{AppConfig, RouteConfig, ServerConfig};
use halcyon_httpd::server::Server;

fn spawn_server(test_root: &str, port: u16) {
    let mut config = AppConfig::default();

    let route = RouteConfig {
        path: "/".to_string(),
        methods: vec!["GET".to_string(), "HEAD".to_string(), "POST".to_string()],
        root: test_root.to_string(),
        default_file: "index.html".to_string(),
        ..Default::default()
    };

    let server_cfg = ServerConfig {
        server_name: "localhost".to_string(),
        ports: vec![port],
        default_server: true,
        routes: vec![route],
        ..Default::default()
    };
    config.servers.push(server_cfg);

    thread::spawn(move || {
        let mut server = Server::new(config).expect("server construction");
        server.warmup().expect("listener bind");
        server.run_until(|| false).expect("event loop");
    });

    thread::sleep(Duration::from_millis(300));
}

#[test]
fn test_chunked_body_is_drained_before_response() {
    let test_root = "./tmp_test_chunked_root";
    let _ = fs::remove_dir_all(test_root);
    fs::create_dir_all(test_root).unwrap();

    spawn_server(test_root, 18080);

    let mut stream = TcpStream::connect("127.0.0.1:18080").expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let headers = "POST /upload HTTP/1.1\r\n\
                   Host: localhost\r\n\
                   Transfer-Encoding: chunked\r\n\
                   Content-Type: text/plain\r\n\r\n";
    stream.write_all(headers.as_bytes()).unwrap();
    stream.write_all(b"5\r\nHello\r\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"7\r\n World!\r\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"0\r\n\r\n").unwrap();
    stream.flush().unwrap();

    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).expect("read response");
    let response = String::from_utf8_lossy(&buffer[..n]);

    // The route allows POST but the static handler has no upload
    // behavior; what's under test is that the chunked body was fully
    // consumed (no leftover bytes corrupting the next request), not the
    // particular status code.
    assert!(response.contains("405 Method Not Allowed"));

    let _ = fs::remove_dir_all(test_root);
}

#[test]
fn test_pipelined_requests_each_get_their_own_response() {
    let test_root = "./tmp_test_pipeline_root";
    let _ = fs::remove_dir_all(test_root);
    fs::create_dir_all(test_root).unwrap();
    fs::write(format!("{}/index.html", test_root), "Hello").unwrap();

    spawn_server(test_root, 18081);

    let mut stream = TcpStream::connect("127.0.0.1:18081").expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let pipeline_data = "GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
                         GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
    stream.write_all(pipeline_data.as_bytes()).unwrap();

    let mut received = String::new();
    let mut buffer = [0u8; 4096];
    // Keep reading until both responses have arrived or the socket times out.
    while received.matches("HTTP/1.1").count() < 2 {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => received.push_str(&String::from_utf8_lossy(&buffer[..n])),
            Err(_) => break,
        }
    }

    assert_eq!(received.matches("HTTP/1.1 200 OK").count(), 2);

    let _ = fs::remove_dir_all(test_root);
}
