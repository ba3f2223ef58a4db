pub use crate::config::{AppConfig, BackendConfig, RouteConfig, ServerConfig, TlsConfig};
pub use crate::error::{EngineError, Result};
pub use crate::http::*;

pub use halcyon_log::{debug, errors, info, trace, warn};
pub use mio::{
    Events, Interest, Poll, Token,
    event::Event,
    net::{TcpListener, TcpStream},
};
pub use std::collections::HashMap;
pub use std::fs::{self, File, OpenOptions};
pub use std::io::{ErrorKind, Read, Write};
pub use std::net::SocketAddr;
pub use std::os::unix::fs::MetadataExt;
pub use std::path::{Path, PathBuf};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use std::{
    fmt::{self, Display},
    io,
    str::FromStr,
    time::SystemTime,
};

pub const READ_BUF_SIZE: usize = 4096;

// 4xx Client Errors
pub const HTTP_BAD_REQUEST: u16 = 400;
pub const HTTP_FORBIDDEN: u16 = 403;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_METHOD_NOT_ALLOWED: u16 = 405;
pub const HTTP_PAYLOAD_TOO_LARGE: u16 = 413;
pub const HTTP_URI_TOO_LONG: u16 = 414;

// 5xx Server Errors
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;
pub const HTTP_NOT_IMPLEMENTED: u16 = 501;
pub const HTTP_BAD_GATEWAY: u16 = 502;
pub const HTTP_SERVICE_UNAVAILABLE: u16 = 503;
pub const HTTP_GATEWAY_TIMEOUT: u16 = 504;

pub const HTTP_OK: u16 = 200;
pub const HTTP_FOUND: u16 = 302;
pub const HTTP_CREATED: u16 = 201;

pub const ONE_MB: usize = 1_024 * 1024;
pub const MAX_CHUNK_READ: usize = u16::MAX as usize - 8; // leaves room for FastCGI padding
