use halcyon_yaml::FromYaml;
use halcyon_yaml_derive::FromYaml as DeriveFromYaml;
use std::collections::HashMap;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_NAME: &str = "_";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576;
pub const DEFAULT_ROUTE_PATH: &str = "/";
pub const DEFAULT_ROOT: &str = "./www";
pub const DEFAULT_FILE: &str = "index.html";

#[derive(Debug, Clone, DeriveFromYaml)]
pub struct RouteConfig {
    pub path: String,
    pub methods: Vec<String>,
    pub redirection: Option<String>,
    pub root: String,
    pub default_file: String,
    pub autoindex: bool,
    pub upstream: Option<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_ROUTE_PATH.to_string(),
            methods: vec!["GET".to_string(), "HEAD".to_string()],
            redirection: None,
            root: DEFAULT_ROOT.to_string(),
            default_file: DEFAULT_FILE.to_string(),
            autoindex: false,
            upstream: None,
        }
    }
}

#[derive(Debug, Clone, DeriveFromYaml)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
    pub worker_threads: usize,
    pub io_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            worker_threads: 1,
            io_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, DeriveFromYaml)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub server_name: String,
    pub default_server: bool,
    pub error_pages: HashMap<u16, String>,
    pub client_max_body_size: usize,
    pub routes: Vec<RouteConfig>,
    pub backend: Option<BackendConfig>,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ports: vec![DEFAULT_PORT],
            server_name: DEFAULT_SERVER_NAME.to_string(),
            default_server: false,
            error_pages: HashMap::new(),
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            routes: Vec::new(),
            backend: None,
            tls: None,
        }
    }
}

/// Upstream pool a FastCGI route is dispatched to. `name` matches a route's
/// `upstream` field; `address` is `host:port` for TCP or an absolute path
/// for a unix socket (detected by a leading `/`).
#[derive(Debug, Clone, DeriveFromYaml)]
pub struct BackendConfig {
    pub name: String,
    pub address: String,
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            max_connections: 8,
            connect_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, DeriveFromYaml)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: String::new(),
            key_path: String::new(),
        }
    }
}
