//! Keyward Sync
//!
//! Keeps a local view of the shared key object in sync, makes sure the
//! configured key set exists and logs what it would publish.

use anyhow::Result;
use keyward_config::{KeywardConfig, LogFormat};
use keyward_keys::{init_key_store, spawn_watch, KeyStore, KeyType};
use keyward_logging::{init_console_logging, init_logging, service_span};
use tokio::signal;
use tracing::{error, info, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = KeywardConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize logging
    match config.log_format {
        LogFormat::Json => init_logging("keyward-sync", config.log_level()),
        LogFormat::Console => init_console_logging("keyward-sync", config.log_level()),
    }

    run(config)
        .instrument(service_span("keyward-sync", env!("CARGO_PKG_VERSION")))
        .await
}

async fn run(config: KeywardConfig) -> Result<()> {
    info!(
        backend = ?config.store_backend,
        namespace = %config.namespace,
        object = %config.object_name,
        "Starting Keyward Sync"
    );

    let key_store = init_key_store(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize key store: {}", e))?;

    let watch = spawn_watch(key_store.clone());

    let key_type = KeyType::from(config.key_type);
    let key_set = key_store
        .key_set(&config.keyset, key_type)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load key set {}: {}", config.keyset, e))?;

    match key_type {
        KeyType::AsymmetricSigning => {
            let active = key_set.active_key()?;
            let jwks = key_set.public_key_set()?;
            info!(
                key_set = %config.keyset,
                signing_key_id = active.signer()?.key_id(),
                created_at = active.created_at(),
                jwks = %serde_json::to_string(&jwks)?,
                "Publishing signing keys"
            );
        }
        KeyType::SymmetricAead => {
            info!(
                key_set = %config.keyset,
                active_id = ?key_set.active_id(),
                versions = key_set.all_versions()?.len(),
                "Encryption key set ready"
            );
        }
    }

    // Wait for shutdown signal
    info!("Keyward Sync running. Press Ctrl+C to stop.");
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
        }
    }

    watch.stop().await?;
    info!("Keyward Sync stopped");

    Ok(())
}
