use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::ServerConfig as RustlsServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCertUsingSni;
use rustls::sign::CertifiedKey;

use crate::config::TlsConfig;
use crate::error::{EngineError, Result};
use crate::iostream::{ReadOutcome, WriteOutcome};
use crate::stream::{StreamRef, notify};

use halcyon_log::debug;

/// Builds a `rustls::ServerConfig` from a route's certificate/key pair
/// (spec §4.10). Certificate chains are PEM; the key is the first
/// PKCS#8/RSA/EC private key found in the key file.
pub fn build_server_config(tls: &TlsConfig) -> Result<Arc<RustlsServerConfig>> {
    let cert_file = File::open(&tls.cert_path).map_err(EngineError::Io)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Invariant(format!("bad certificate file: {}", e)))?;
    if certs.is_empty() {
        return Err(EngineError::Invariant("no certificates in cert_path".into()));
    }

    let key_file = File::open(&tls.key_path).map_err(EngineError::Io)?;
    let mut key_reader = BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| EngineError::Invariant(format!("bad key file: {}", e)))?
        .ok_or_else(|| EngineError::Invariant("no private key in key_path".into()))?;

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EngineError::Invariant(format!("invalid tls certificate/key pair: {}", e)))?;

    Ok(Arc::new(config))
}

/// Builds one `rustls::ServerConfig` covering every virtual host on a
/// shared listener, picking a certificate per-connection by SNI (spec
/// §4.10/§4.12: TLS termination composes with host-based virtual hosting).
/// `entries` pairs a server's `server_name` with its certificate/key.
pub fn build_sni_config(entries: &[(String, TlsConfig)]) -> Result<Arc<RustlsServerConfig>> {
    let mut resolver = ResolvesServerCertUsingSni::new();
    for (name, tls) in entries {
        let cert_file = File::open(&tls.cert_path).map_err(EngineError::Io)?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Invariant(format!("bad certificate file for {}: {}", name, e)))?;

        let key_file = File::open(&tls.key_path).map_err(EngineError::Io)?;
        let mut key_reader = BufReader::new(key_file);
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| EngineError::Invariant(format!("bad key file for {}: {}", name, e)))?
            .ok_or_else(|| EngineError::Invariant(format!("no private key for {}", name)))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| EngineError::Invariant(format!("unsupported key type for {}: {}", name, e)))?;
        let certified = CertifiedKey::new(certs, signing_key);
        resolver
            .add(name, certified)
            .map_err(|e| EngineError::Invariant(format!("bad sni certificate for {}: {}", name, e)))?;
    }

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    Ok(Arc::new(config))
}

/// Pumps one non-blocking TLS connection (spec §4.10): plaintext read off
/// the wire lands in `raw`'s buffer exactly like `IoStream::do_read`, and
/// writes drain whatever `raw`'s connected source (the response stream)
/// has queued, so `connection.rs` can treat a TLS and a plain transport
/// identically above this layer.
pub struct TlsSession {
    sock: TcpStream,
    conn: rustls::ServerConnection,
    raw: StreamRef,
    sni_logged: bool,
}

impl TlsSession {
    pub fn new(sock: TcpStream, config: Arc<RustlsServerConfig>, raw: StreamRef) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| EngineError::Invariant(format!("tls session init failed: {}", e)))?;
        Ok(Self {
            sock,
            conn,
            raw,
            sni_logged: false,
        })
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn log_sni_once(&mut self) {
        if self.sni_logged || !self.conn.is_handshaking() {
            return;
        }
        self.sni_logged = true;
        let mut peek_buf = [0u8; 4096];
        if let Ok(n) = self.sock.peek(&mut peek_buf)
            && let Some(name) = sniff_sni(&peek_buf[..n])
        {
            debug!("tls clienthello sni={}", name);
        }
    }

    pub fn do_read(&mut self) -> Result<ReadOutcome> {
        self.log_sni_once();

        loop {
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => {
                    self.raw.borrow_mut().out.is_closed = true;
                    notify(&self.raw);
                    return Ok(ReadOutcome::Eof);
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }

        if let Err(e) = self.conn.process_new_packets() {
            return Err(EngineError::Invariant(format!("tls protocol error: {}", e)));
        }

        let mut total = 0usize;
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.raw.borrow_mut().out.append_mem(&buf[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
        if total > 0 {
            notify(&self.raw);
            Ok(ReadOutcome::Read(total))
        } else {
            Ok(ReadOutcome::WouldBlock)
        }
    }

    pub fn do_write(&mut self) -> Result<WriteOutcome> {
        let Some(source) = self.raw.borrow().source.clone() else {
            return Ok(WriteOutcome::WouldBlock);
        };

        let mut total = 0usize;
        loop {
            let extracted = {
                let mut src = source.borrow_mut();
                let take = src.out.length.min(16 * 1024) as usize;
                if take == 0 {
                    None
                } else {
                    Some(src.out.extract_to(take as u64)?)
                }
            };
            let Some(buf) = extracted else { break };
            match self.conn.writer().write(&buf) {
                Ok(n) => {
                    source.borrow_mut().out.skip(n as u64);
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }

        loop {
            if !self.conn.wants_write() {
                break;
            }
            match self.conn.write_tls(&mut self.sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }

        let should_close = {
            let src = source.borrow();
            src.out.is_closed && src.out.is_empty()
        };
        if should_close && total == 0 {
            return Ok(WriteOutcome::Wrote(0));
        }
        if total > 0 {
            Ok(WriteOutcome::Wrote(total))
        } else {
            Ok(WriteOutcome::WouldBlock)
        }
    }
}

/// Extracts the SNI server name from a raw TLS ClientHello, without
/// running a handshake, so the connection can be routed to the right
/// virtual host's certificate before TLS is set up (spec §4.10).
///
/// Returns `None` if `buf` doesn't yet contain a full ClientHello, or if
/// it has no server_name extension.
pub fn sniff_sni(buf: &[u8]) -> Option<String> {
    // TLS record header: type(1) version(2) length(2)
    if buf.len() < 5 || buf[0] != 0x16 {
        return None;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return None;
    }
    let handshake = &buf[5..5 + record_len];
    // Handshake header: type(1) length(3)
    if handshake.len() < 4 || handshake[0] != 0x01 {
        return None;
    }
    let mut pos = 4;
    // ClientHello: version(2) random(32) session_id
    pos += 2 + 32;
    if pos >= handshake.len() {
        return None;
    }
    let session_id_len = handshake[pos] as usize;
    pos += 1 + session_id_len;
    if pos + 2 > handshake.len() {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;
    if pos >= handshake.len() {
        return None;
    }
    let compression_len = handshake[pos] as usize;
    pos += 1 + compression_len;
    if pos + 2 > handshake.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(handshake.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]);
        let ext_len = u16::from_be_bytes([handshake[pos + 2], handshake[pos + 3]]) as usize;
        let ext_start = pos + 4;
        let ext_end = ext_start + ext_len;
        if ext_end > extensions_end {
            return None;
        }
        if ext_type == 0 {
            return parse_sni_extension(&handshake[ext_start..ext_end]);
        }
        pos = ext_end;
    }
    None
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let list = &data[2..(2 + list_len).min(data.len())];
    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = u16::from_be_bytes([list[pos + 1], list[pos + 2]]) as usize;
        let name_start = pos + 3;
        let name_end = name_start + name_len;
        if name_end > list.len() {
            return None;
        }
        if name_type == 0 {
            return String::from_utf8(list[name_start..name_end].to_vec()).ok();
        }
        pos = name_end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_sni_returns_none_for_non_tls_bytes() {
        assert_eq!(sniff_sni(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn sniff_sni_returns_none_on_truncated_record() {
        assert_eq!(sniff_sni(&[0x16, 0x03, 0x01, 0x00, 0xff]), None);
    }
}
