//! Whiteflag relay daemon entrypoint.
//!
//! Starts one listener/sender pipeline per configured chain and logs every
//! Whiteflag message observed on the receive bus. State lives in the
//! in-process store; embedders wanting durable state run the crate as a
//! library and supply their own [`whiteflag_relay::store::StateStore`].
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` (or `--config`) selects the JSON configuration file
//! - `RUST_LOG` controls verbosity

use std::sync::Arc;
use tokio_util::task::TaskTracker;

use whiteflag_relay::bus::{MessageBus, RelayEvent};
use whiteflag_relay::chain::ChainRegistry;
use whiteflag_relay::config::Config;
use whiteflag_relay::store::MemoryStore;
use whiteflag_relay::util::{SigDown, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::load()?;
    if config.chains().is_empty() {
        tracing::warn!("no chains configured, nothing to do");
        return Ok(());
    }

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();
    let tracker = TaskTracker::new();

    let store = Arc::new(MemoryStore::new());
    let bus = MessageBus::new();
    let registry = ChainRegistry::from_config(
        &config,
        store.clone(),
        store,
        bus.clone(),
        &tracker,
        cancel.clone(),
    )
    .await;
    if registry.is_empty() {
        tracing::error!("no chain came up, exiting");
        return Err("no chain came up".into());
    }
    tracing::info!(chains = registry.len(), "relay running");

    let mut events = bus.subscribe();
    tracker.spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(RelayEvent::MessageReceived(message)) => {
                        let meta = &message.meta_header;
                        tracing::info!(
                            chain = %meta.blockchain,
                            block = meta.block_number,
                            transaction = %meta.transaction_hash,
                            originator = %meta.originator_address,
                            "whiteflag message received"
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "receive bus consumer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });

    sig_down.recv().await;
    tracing::info!("shutting down");
    tracker.close();
    tracker.wait().await;
    Ok(())
}
