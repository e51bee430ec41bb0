use crate::models::DeviceSnapshot;
use time::{Duration, OffsetDateTime};

/// Seuil de péremption par défaut : au-delà, un device silencieux n'est plus
/// considéré en ligne même si son dernier flag annoncé était "online".
pub const STALE_THRESHOLD_MS: i64 = 15_000;

pub fn default_stale_threshold() -> Duration {
    Duration::milliseconds(STALE_THRESHOLD_MS)
}

/// Présence effective = flag auto-déclaré ET fraîcheur des messages.
///
/// Le message "status/offline" est un last-will délivré par le broker lors
/// d'une déconnexion propre ; il n'arrive jamais si le device perd le courant
/// ou le réseau brutalement. La fraîcheur est donc un second signal
/// obligatoire, recalculé à la demande : aucun timer de fond n'est requis.
pub fn effective_online(
    snapshot: &DeviceSnapshot,
    now: OffsetDateTime,
    threshold: Duration,
) -> bool {
    snapshot.online && (now - snapshot.last_seen) < threshold
}
