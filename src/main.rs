//! Tollgate - control plane for a payment-gated service daemon

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tollgate::{
    blockchain::{
        EthWsEventSource, FileMetadataSource, HttpMetadataSource, LogFilter, MetadataSource,
        WsSourceConfig,
    },
    config::{Args, StorageBackend},
    listener::{ContractEventListener, ListenerConfig},
    logging,
    reconfig::{Broadcaster, ProcessingGate},
    server::{self, AppState},
    state::LiveState,
    storage::{AtomicStore, MemoryConnector, NatsKvConnector, StoreConnector, StoreSource},
    training::{HttpTrainingProvider, ModelRegistry, ReconcilerConfig, Scope, StatusReconciler},
};

/// How long background tasks get to wind down after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init_tracing(&args.log_level, args.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Tollgate");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Organization: {} / service {}", args.organization_id, args.service_id);
    info!("Daemon group: {}", args.daemon_group_name);
    info!("Storage backend: {:?}", args.storage.storage_backend);
    info!(
        "Chain: {}",
        if args.blockchain_enabled {
            args.ethereum_ws_url.as_str()
        } else {
            "disabled"
        }
    );
    info!("======================================");

    let metadata_source: Arc<dyn MetadataSource> = match (&args.metadata_file, &args.metadata_url) {
        (Some(path), _) => Arc::new(FileMetadataSource::new(path, &args.daemon_group_name)),
        (None, Some(url)) => Arc::new(HttpMetadataSource::new(url, &args.daemon_group_name)?),
        (None, None) => {
            error!("Either METADATA_FILE or METADATA_URL must be set");
            std::process::exit(1);
        }
    };

    let metadata = match metadata_source.fetch(&args.organization_id).await {
        Ok(metadata) => metadata,
        Err(e) => {
            error!("Failed to load organization metadata: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Organization metadata loaded: group {} with {} storage endpoint(s)",
        metadata.group_id(),
        metadata.storage_endpoints().len()
    );

    // Connect the initial store (memory fallback in dev mode)
    let (connector, store): (Arc<dyn StoreConnector>, Arc<dyn AtomicStore>) =
        match args.storage.storage_backend {
            StorageBackend::Memory => {
                let connector: Arc<dyn StoreConnector> = Arc::new(MemoryConnector::new());
                let store = connector.connect(&metadata).await?;
                (connector, store)
            }
            StorageBackend::Nats => {
                let connector: Arc<dyn StoreConnector> = Arc::new(NatsKvConnector::new(
                    args.storage.storage_bucket.clone(),
                    args.storage.nats_user.clone(),
                    args.storage.nats_password.clone(),
                ));
                match connector.connect(&metadata).await {
                    Ok(store) => {
                        info!("Store connected successfully");
                        (connector, store)
                    }
                    Err(e) if args.dev_mode => {
                        warn!("Store connection failed (dev mode, using memory store): {}", e);
                        let connector: Arc<dyn StoreConnector> = Arc::new(MemoryConnector::new());
                        let store = connector.connect(&metadata).await?;
                        (connector, store)
                    }
                    Err(e) => {
                        error!("Store connection failed: {}", e);
                        std::process::exit(1);
                    }
                }
            }
        };

    let group_id = metadata.group_id().to_string();
    let live = Arc::new(LiveState::new(metadata, store));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let broadcaster = Arc::new(Broadcaster::new(args.broadcast_buffer, args.broadcast_overflow));
    let gate = Arc::new(ProcessingGate::spawn(&broadcaster, shutdown_rx.clone()));

    let mut state = AppState::new(args.clone(), Arc::clone(&live), broadcaster, gate);

    if args.blockchain_enabled {
        let events = Arc::new(EthWsEventSource::new(WsSourceConfig {
            url: args.ethereum_ws_url.clone(),
            ..WsSourceConfig::default()
        }));
        let filter = LogFilter::organization_updates(
            &args.registry_address,
            &args.metadata_event_signature,
            &args.organization_id,
        );
        let listener = Arc::new(ContractEventListener::new(
            args.organization_id.clone(),
            filter,
            ListenerConfig {
                reconnect_delay: args.reconnect_delay(),
                max_reconnect_delay: args.max_reconnect_delay(),
                max_reconnect_attempts: args.max_reconnect_attempts,
            },
            events,
            Arc::clone(&metadata_source),
            Arc::clone(&connector),
            Arc::clone(&live),
        ));

        let running = Arc::clone(&listener);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = running.run(rx).await {
                error!("Contract event listener stopped: {}", e);
            }
        }));
        info!("Contract event listener enabled for {}", args.registry_address);
        state = state.with_listener(listener);
    }

    if args.model_training_enabled {
        if let Some(endpoint) = &args.training_endpoint {
            let provider = Arc::new(HttpTrainingProvider::new(endpoint)?);
            let source: Arc<dyn StoreSource> = live.clone();
            let registry = ModelRegistry::new(source);
            let reconciler = Arc::new(StatusReconciler::new(
                registry,
                provider,
                ReconcilerConfig {
                    concurrency: args.model_update_concurrency,
                    ..ReconcilerConfig::default()
                },
            ));

            let scope = Scope::new(&args.organization_id, &args.service_id, group_id);
            if let Some(handle) = reconciler.manage_update_model_status_workers(
                scope,
                args.model_poll_interval(),
                shutdown_rx.clone(),
            ) {
                tasks.push(handle);
            }
            info!(
                "Model status reconciliation enabled (every {}s)",
                args.model_poll_interval_secs
            );
            state = state.with_reconciler(reconciler);
        }
    }

    let server = tokio::spawn(server::run(Arc::new(state), shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
        server.await
    };
    match tokio::time::timeout(SHUTDOWN_GRACE, drain).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Server error: {:?}", e),
        Ok(Err(e)) => error!("Server task failed: {}", e),
        Err(_) => warn!("Timed out waiting for tasks to stop"),
    }

    live.current().store.close().await;
    info!("Tollgate stopped");
    Ok(())
}
