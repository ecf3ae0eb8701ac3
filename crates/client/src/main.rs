//! Notifier Client - command line listener
//!
//! Connects with the token in `NOTIFIER_TOKEN` and prints every notification
//! as one JSON line until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use notifier_client::{logging, ClientConfig, NotificationClient, StaticToken};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::DEFAULT_FILTER);

    let token = std::env::var("NOTIFIER_TOKEN").context("NOTIFIER_TOKEN is not set")?;
    let config = ClientConfig::from_env();
    tracing::info!("Connecting to {}", config.ws_url);

    let client = NotificationClient::builder()
        .config(config)
        .auth(Arc::new(StaticToken(token)))
        .build()
        .context("failed to build notification client")?;

    let _subscription = client.subscribe(|notification| {
        match serde_json::to_string(notification) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Failed to encode notification: {}", e),
        }
    });
    client.spawn_watchdog(WATCHDOG_INTERVAL);

    let mut states = client.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!("Connection state: {:?}", state);
            }
        }
    }

    client.disconnect_all();
    client.shutdown();
    Ok(())
}
