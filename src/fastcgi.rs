use std::collections::HashMap;

use crate::config::RouteConfig;
use crate::error::{EngineError, Result};
use crate::http::HttpRequest;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
}

impl RecordType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(RecordType::BeginRequest),
            2 => Ok(RecordType::AbortRequest),
            3 => Ok(RecordType::EndRequest),
            4 => Ok(RecordType::Params),
            5 => Ok(RecordType::Stdin),
            6 => Ok(RecordType::Stdout),
            7 => Ok(RecordType::Stderr),
            other => Err(EngineError::Parse(format!("unknown fastcgi record type {}", other))),
        }
    }
}

pub const ROLE_RESPONDER: u16 = 1;

#[derive(Debug)]
pub struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub payload: Vec<u8>,
}

/// Splits `payload` into `FCGI_MAX_LEN`-sized records; a zero-length
/// payload is still emitted once, as the protocol uses it to terminate a
/// stream (spec §4.11).
const MAX_RECORD_LEN: usize = 0xFFFF;

pub fn encode_stream_records(kind: RecordType, request_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if payload.is_empty() {
        out.extend(encode_record(kind, request_id, &[]));
        return out;
    }
    for chunk in payload.chunks(MAX_RECORD_LEN) {
        out.extend(encode_record(kind, request_id, chunk));
    }
    out
}

pub fn encode_record(kind: RecordType, request_id: u16, payload: &[u8]) -> Vec<u8> {
    let padding = (8 - (payload.len() % 8)) % 8;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + padding);
    out.push(VERSION);
    out.push(kind as u8);
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.push(padding as u8);
    out.push(0); // reserved
    out.extend_from_slice(payload);
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

pub fn encode_begin_request(request_id: u16, role: u16, keep_conn: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&role.to_be_bytes());
    body.push(if keep_conn { 1 } else { 0 });
    body.extend_from_slice(&[0u8; 5]);
    encode_record(RecordType::BeginRequest, request_id, &body)
}

pub fn encode_params(request_id: u16, params: &[(String, String)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in params {
        encode_length(&mut body, name.len());
        encode_length(&mut body, value.len());
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(value.as_bytes());
    }
    encode_stream_records(RecordType::Params, request_id, &body)
}

fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Parses one full record out of `buf`, returning the record and the
/// number of bytes consumed, or `None` if the header or payload isn't
/// fully buffered yet.
pub fn decode_record(buf: &[u8]) -> Result<Option<(Record, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let kind = RecordType::from_u8(buf[1])?;
    let request_id = u16::from_be_bytes([buf[2], buf[3]]);
    let content_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let padding_len = buf[6] as usize;
    let total = HEADER_LEN + content_len + padding_len;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = buf[HEADER_LEN..HEADER_LEN + content_len].to_vec();
    Ok(Some((
        Record {
            kind,
            request_id,
            payload,
        },
        total,
    )))
}

/// Builds the CGI/1.1 environment for a request dispatched to a FastCGI
/// upstream (spec §6). `script_filename` is the route's resolved
/// document-root-relative path to the PHP/etc. script.
pub fn build_env(request: &HttpRequest, route: &RouteConfig, script_filename: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    let (path, query) = match request.uri.split_once('?') {
        Some((p, q)) => (p, q),
        None => (request.uri.as_str(), ""),
    };

    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("SERVER_PROTOCOL".to_string(), request.version.as_str().to_string());
    env.insert("REQUEST_METHOD".to_string(), request.method.as_str().to_string());
    env.insert("SCRIPT_FILENAME".to_string(), script_filename.to_string());
    env.insert("SCRIPT_NAME".to_string(), path.to_string());
    env.insert("REQUEST_URI".to_string(), request.uri.clone());
    env.insert("QUERY_STRING".to_string(), query.to_string());
    env.insert("DOCUMENT_ROOT".to_string(), route.root.clone());

    if let Some(len) = request.header("content-length") {
        env.insert("CONTENT_LENGTH".to_string(), len.to_string());
    }
    if let Some(ct) = request.header("content-type") {
        env.insert("CONTENT_TYPE".to_string(), ct.to_string());
    }

    for header in &request.headers {
        if header.name.eq_ignore_ascii_case("content-length")
            || header.name.eq_ignore_ascii_case("content-type")
        {
            continue;
        }
        let key = format!("HTTP_{}", header.name.to_uppercase().replace('-', "_"));
        env.insert(key, header.value.clone());
    }

    env
}
