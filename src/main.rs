mod actuate;
mod bridge;
mod cli;
mod config;
mod identity;
mod radio;
mod session;
mod shadow;

use anyhow::Result;
use config::Config;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use actuate::{Dispatcher, SysfsLed};
use bridge::Bridge;
use identity::DeviceIdentity;
use radio::SocketRadio;
use session::SessionService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("debug".parse()?)
                    .add_directive("rumqttc=warn".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    info!("Service started");

    let config = Config::from(cli::parse());
    info!("Configuration loaded successfully");
    debug!("{:#?}", config);

    let identity = DeviceIdentity::new(config.radio_address, &config.device_prefix);
    info!(
        "bridging radio address {} as twin {}",
        identity.radio_address, identity.twin_id
    );

    // The session owns the connection; it reconnects and resubscribes in
    // the background while the bridge loop runs in the foreground
    let (session, mut notifications) = SessionService::connect(&config, &identity).await?;
    let publisher = session.publisher();

    // Desired-state consumer: decode notifications and actuate, confirming
    // each outcome back through the session
    let mut dispatcher = Dispatcher::new(publisher.clone(), config.timing.flash_hold)
        .with_actuator("led", Box::new(SysfsLed::new(config.led_path.clone())));
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            dispatcher.handle_notification(&notification).await;
        }
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to listen for interrupt signal");
            return;
        }
        let _ = shutdown_tx.send(());
    });

    let radio = SocketRadio::new(config.radio_socket.clone(), Duration::from_millis(500));
    let bridge = Bridge::new(
        radio,
        publisher,
        session.state_receiver(),
        config.bridge.clone(),
    );

    // Runs until interrupted; at-most-once delivery, no final flush
    bridge.run(shutdown_rx).await?;

    Ok(())
}
