pub mod display;
pub mod types;
pub mod validate;

pub use display::display_config;
pub use types::{AppConfig, BackendConfig, RouteConfig, ServerConfig, TlsConfig};
pub use validate::validate_configs;
