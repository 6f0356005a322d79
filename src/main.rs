use anyhow::Result;
use clap::Parser;
use mip_live_feed::{
    cli::Args,
    client::LiveEventClient,
    config::Config,
    events::create_event_channel,
    formatter::OutputFormat,
    monitoring::{FeedHealth, setup_metrics},
    tracing_setup::setup_tracing,
    transport::Transports,
    ui::{UIController, UIOptions},
    visibility::VisibilityHandle,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_tracing(&args.log_level, args.json_logs, !args.no_color)?;
    info!("Starting MIP live feed client v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_args(&args)?);

    if config.metrics.enabled {
        setup_metrics(config.metrics.port).await?;
        info!("Metrics server started on port {}", config.metrics.port);
    }

    let transports = Transports::http(&config.api)?;
    let (event_sender, event_receiver) = create_event_channel();

    // A terminal is always "visible"; the gate matters for embedded consumers.
    let mut handle = LiveEventClient::spawn(
        config.clone(),
        transports,
        Some(event_sender),
        VisibilityHandle::new(true),
    );

    let mut ui = UIController::new(
        event_receiver,
        OutputFormat::from(args.format.as_str()),
        UIOptions {
            colored: !args.no_color,
            quiet: args.quiet,
            max_events: args.max_events,
        },
    );

    info!("Client started. Press Ctrl+C to shutdown...");
    tokio::select! {
        _ = ui.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
    }

    let health = FeedHealth::from_state(&*handle.state().lock().await);
    info!(health = %health.to_json(), "Final feed health");

    handle.teardown().await;
    info!("Client stopped successfully");
    Ok(())
}
