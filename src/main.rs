use anyhow::Result;
use bracketbot::config::TradingConfig;
use bracketbot::engine::Engine;
use bracketbot::gateway::OrderIntent;
use bracketbot::persist::LogTradeStore;
use bracketbot::tws::TwsGateway;
use log::info;
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger with default info level if RUST_LOG not set
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    env_logger::init();
    info!("Starting bracket trading engine");

    // Get config file from command line argument or use default
    let args: Vec<String> = env::args().collect();
    let config_file = if args.len() > 1 {
        &args[1]
    } else {
        "config.json"
    };

    info!("Loading configuration from: {}", config_file);
    let config = TradingConfig::load_from_file(config_file)?;

    let gateway = Arc::new(TwsGateway::connect(config.tws_config.clone()).await?);
    let engine = Engine::new(config, gateway, Arc::new(LogTradeStore));

    // Trading intents arrive on this channel; the webhook layer that
    // produces them lives outside this binary.
    let (_intent_tx, intent_rx) = mpsc::channel::<OrderIntent>(64);
    engine.start(intent_rx).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, exiting");
    Ok(())
}
