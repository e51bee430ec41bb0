/**
 * API REST SAPHIR - Surface HTTP du kernel
 *
 * RÔLE :
 * Expose le miroir d'état et le dispatcher de commandes au dashboard et aux
 * outils d'administration.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key (header x-api-key)
 * - Routes : /health, /system/health, /devices, /devices/{id},
 *   /devices/{id}/toggle, /devices/{id}/servo
 * - Les issues de commandes sont des valeurs de retour mappées en codes HTTP,
 *   jamais des exceptions : le dashboard choisit quoi afficher (revert de la
 *   valeur optimiste, bouton retry...)
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Validation côté middleware avant traitement métier
 */
use crate::dispatch::{CommandDispatcher, CommandOutcome, RejectReason, ToggleMeta};
use crate::health::HealthTracker;
use crate::models::DeviceSnapshot;
use crate::mqtt::MqttTransport;
use crate::store::DeviceStore;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DeviceStore>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub transport: Arc<MqttTransport>,
    pub health_tracker: HealthTracker,
    pub command_timeout_ms: u64,
}

#[derive(serde::Serialize)]
struct DeviceView {
    device_id: String,
    /// Dernier flag annoncé par le device lui-même.
    online: bool,
    /// Présence croisée avec la fraîcheur : la seule valeur à afficher.
    effective_online: bool,
    last_seen: String, // RFC3339 pour l'API
    stale: bool,
    stale_for_seconds: i64,
    gpio: HashMap<u8, u8>,
    sensors: HashMap<String, f64>,
    /// Pins avec une commande en vol (indicateur "en cours" côté UI).
    pending_pins: Vec<u8>,
}

fn to_view(
    snapshot: &DeviceSnapshot,
    now: OffsetDateTime,
    threshold: time::Duration,
    dispatcher: &CommandDispatcher,
) -> DeviceView {
    let age = now - snapshot.last_seen;
    let stale = age >= threshold;
    let pending_pins = dispatcher.pending_pins(&snapshot.device_id);

    DeviceView {
        device_id: snapshot.device_id.clone(),
        online: snapshot.online,
        effective_online: snapshot.online && !stale,
        last_seen: snapshot.last_seen.format(&Rfc3339).unwrap_or_default(),
        stale,
        stale_for_seconds: age.whole_seconds().max(0),
        gpio: snapshot.gpio.clone(),
        sensors: snapshot.sensors.clone(),
        pending_pins,
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("SAPHIR_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        error!("SECURITY: SAPHIR_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/toggle", post(post_toggle))
        .route("/devices/{id}/servo", post(post_servo))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health (état infrastructure)
async fn get_system_health(State(app): State<AppState>) -> Json<crate::health::KernelHealth> {
    let health = app
        .health_tracker
        .get_health(&app.store, &app.dispatcher, &app.transport);
    Json(health)
}

// GET /devices (liste)
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    let now = OffsetDateTime::now_utc();
    let threshold = app.store.stale_threshold();
    let list: Vec<DeviceView> = app
        .store
        .list()
        .iter()
        .map(|s| to_view(s, now, threshold, &app.dispatcher))
        .collect();
    Json(list)
}

// GET /devices/{id} (détail)
async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    let Some(snapshot) = app.store.get(&id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(to_view(
        &snapshot,
        OffsetDateTime::now_utc(),
        app.store.stale_threshold(),
        &app.dispatcher,
    )))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    addr: String,
    pin: u8,
    state: u8,
    #[serde(rename = "override", default)]
    override_mode: bool,
    timeout_ms: Option<u64>,
}

// POST /devices/{id}/toggle
async fn post_toggle(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let meta = ToggleMeta { addr: req.addr, override_mode: req.override_mode };
    let timeout_ms = req.timeout_ms.unwrap_or(app.command_timeout_ms);
    let outcome = app
        .dispatcher
        .send_toggle(&id, req.pin, req.state, meta, timeout_ms)
        .await;

    let (code, body) = match outcome {
        CommandOutcome::Confirmed => (
            StatusCode::OK,
            serde_json::json!({ "outcome": "confirmed" }),
        ),
        CommandOutcome::TimedOut => (
            StatusCode::GATEWAY_TIMEOUT,
            serde_json::json!({ "outcome": "timed_out" }),
        ),
        CommandOutcome::Superseded => (
            StatusCode::CONFLICT,
            serde_json::json!({ "outcome": "superseded" }),
        ),
        CommandOutcome::Rejected(reason) => (
            reject_status(&reason),
            serde_json::json!({ "outcome": "rejected", "reason": reason.to_string() }),
        ),
    };
    (code, Json(body))
}

#[derive(Debug, Deserialize)]
struct ServoRequest {
    addr: String,
    angle: u8,
}

// POST /devices/{id}/servo (fire-and-forget, 202 si publié)
async fn post_servo(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ServoRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.dispatcher.send_servo(&id, &req.addr, req.angle).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "ok": true }))),
        Err(reason) => (
            reject_status(&reason),
            Json(serde_json::json!({ "ok": false, "reason": reason.to_string() })),
        ),
    }
}

fn reject_status(reason: &RejectReason) -> StatusCode {
    match reason {
        RejectReason::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        RejectReason::DeviceOffline => StatusCode::CONFLICT,
        RejectReason::PublishFailed(_) => StatusCode::BAD_GATEWAY,
    }
}
