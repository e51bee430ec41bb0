/**
 * SAPHIR KERNEL - Point d'entrée principal
 *
 * RÔLE :
 * Orchestration des modules : config, store, transport MQTT, dispatcher,
 * health, API REST. Bootstrap complet avec injection de dépendances — les
 * services sont construits une fois ici et passés par Arc, aucun état global.
 *
 * ARCHITECTURE : ingestion MQTT → store → (presence à la lecture, dispatcher
 * à l'écho) + API REST pour le dashboard.
 */
use saphir_kernel::config::load_config;
use saphir_kernel::dispatch::CommandDispatcher;
use saphir_kernel::health::HealthTracker;
use saphir_kernel::http::{build_router, AppState};
use saphir_kernel::mqtt::{create_mqtt_transport, spawn_mqtt_listener};
use saphir_kernel::store::DeviceStore;
use saphir_kernel::transport::Transport;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    // Variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = load_config().await;

    // miroir d'état, seuil de présence depuis la config
    let store = Arc::new(DeviceStore::new(time::Duration::milliseconds(
        cfg.stale_threshold_ms as i64,
    )));

    // client MQTT partagé listener/dispatcher/health
    let (transport, eventloop) = create_mqtt_transport(&cfg);

    // le dispatcher s'abonne au store pour résoudre ses attentes sur écho
    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        transport.clone() as Arc<dyn Transport>,
        &cfg.topic_root,
    ));

    // MQTT remplit le store
    spawn_mqtt_listener(
        eventloop,
        transport.clone(),
        store.clone(),
        cfg.topic_root.clone(),
    );

    // publication périodique du health
    let health_tracker = HealthTracker::new();
    health_tracker.spawn_health_publisher(store.clone(), dispatcher.clone(), transport.clone());

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        store,
        dispatcher,
        transport,
        health_tracker,
        command_timeout_ms: cfg.command_timeout_ms,
    };

    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    info!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
