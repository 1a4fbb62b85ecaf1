#[cfg(not(target_arch = "wasm32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    use log::{info, warn};
    use ptt_headset_bridge::commands::{self, Cli};
    use ptt_headset_bridge::config::AppConfig;
    use ptt_headset_bridge::logging;

    let cli = Cli::parse();

    // Loaded before the logger exists, so failures are reported after init.
    let loaded = AppConfig::load_config().await;
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };
    logging::init(cli.log_level.as_deref().unwrap_or(&config.logging.level));
    match loaded {
        Ok(_) => info!("Configuration loaded"),
        Err(e) => warn!("Using default configuration: {}", e),
    }

    commands::run(cli.command, config).await
}

// The browser build is driven from JavaScript through the library.
#[cfg(target_arch = "wasm32")]
fn main() {}
