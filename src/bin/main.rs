use std::process::ExitCode;

use halcyon_httpd::config::{self, AppConfig};
use halcyon_httpd::error::CleanError;
use halcyon_httpd::server::Server;
use halcyon_yaml::FromYaml;

fn run() -> Result<(), CleanError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .ok_or_else(|| CleanError(halcyon_httpd::error::EngineError::Parse(
            "usage: halcyond <config.yaml>".to_string(),
        )))?;

    let raw = std::fs::read_to_string(&config_path)?;
    let mut app_config = AppConfig::from_str(&raw)?;

    app_config.servers = config::validate_configs(app_config.servers);
    config::display_config(&app_config.servers);

    let mut server = Server::new(app_config)?;
    server.warmup()?;

    tracing::info!("halcyond starting");
    server.run_until(|| false)?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}
