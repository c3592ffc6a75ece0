use anyhow::Context;
use stream_ws_sdk::{init_logging, prelude::*};

/// Stream the topics given on the command line until Ctrl-C.
///
/// Endpoint and timeouts come from `STREAM_WS_*` variables (or `.env`).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let topics: Vec<String> = std::env::args().skip(1).collect();
    if topics.is_empty() {
        anyhow::bail!("usage: stream-ws-sdk <topic> [topic...]");
    }

    let config = ClientConfig::from_env().context("loading configuration")?;
    let mut builder = StreamClient::builder().config(config);
    if let Ok(token) = std::env::var("STREAM_WS_TOKEN") {
        builder = builder.token_provider(std::sync::Arc::new(StaticTokenProvider::new(token)));
    }
    let client = builder.build().context("building client")?;

    client.on_any_event(|event| println!("{} {}", event.topic, event.payload));
    client.on_state_change(|state| tracing::info!(%state, "Connection state"));
    client.on_error(|error| eprintln!("error: {}", error));

    client.subscribe(&topics)?;
    client.start();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    client.stop();

    let stats = client.stats();
    println!(
        "received {} frames, delivered {} events, dropped {} duplicates",
        stats.frames_received, stats.events_delivered, stats.duplicates_dropped
    );
    Ok(())
}
