//! Stock ticker demo
//!
//! Shares one stream between two "components" through the registry, prints
//! price updates, and simulates the host being hidden and shown again.
//!
//! ```text
//! STREAM_WS_URL=ws://localhost:8080/ws/stocks cargo run --example ticker_demo -- 005930 000660
//! ```

use std::sync::Arc;
use std::time::Duration;
use stream_ws_sdk::{init_logging, prelude::*, JsonFrameCodec};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let codes: Vec<String> = std::env::args().skip(1).collect();
    let codes = if codes.is_empty() {
        vec!["005930".to_string(), "000660".to_string()]
    } else {
        codes
    };

    let config = ClientConfig::from_env()?;
    let factory = || {
        StreamClient::builder()
            .config(config.clone())
            .codec(Arc::new(JsonFrameCodec::stock_ticker()))
            .build()
    };

    let registry = StreamRegistry::global();
    let ticker = registry.acquire("stocks", factory)?;
    let watchlist = registry.acquire("stocks", factory)?;
    println!("client {} shared by {} leases", ticker.id(), registry.lease_count("stocks"));

    ticker.on_any_event(|event| {
        let price = event.payload.get("currentPrice").cloned().unwrap_or_default();
        println!("{} -> {}", event.topic, price);
    });
    ticker.on_error(|error| eprintln!("stream error: {}", error));
    ticker.subscribe(&codes)?;

    let opened = tokio::time::timeout(Duration::from_secs(15), ticker.wait_for_state(ConnectionState::is_open)).await;
    if opened.is_err() {
        eprintln!("connection did not open within 15s; state {}", ticker.get_state());
    }

    tokio::time::sleep(Duration::from_secs(10)).await;

    let gate = VisibilityGate::new((*watchlist).clone());
    println!("host hidden: {:?}", gate.set_visible(false));
    tokio::time::sleep(Duration::from_secs(3)).await;
    println!("host visible: {:?}", gate.set_visible(true));
    tokio::time::sleep(Duration::from_secs(10)).await;

    for code in &codes {
        println!("latest {}: {:?} (live: {})", code, watchlist.get_latest(code), watchlist.is_live());
    }

    drop(watchlist);
    drop(gate);
    drop(ticker);
    println!("registry empty: {}", !registry.contains("stocks"));
    Ok(())
}
