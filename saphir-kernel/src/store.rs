/**
 * DEVICE STATE STORE - Miroir canonique de l'état des devices
 *
 * RÔLE :
 * Registre unique des snapshots par device, muté exclusivement par les
 * événements classifiés. Expose lecture, présence effective et notification
 * de changement (liste d'observateurs générique, découplée de tout framework
 * de rendu).
 *
 * FONCTIONNEMENT :
 * - ingest() crée le snapshot à la volée, applique le champ concerné,
 *   avance last_seen inconditionnellement puis notifie chaque abonné
 *   une fois, de façon synchrone, avant de rendre la main
 * - get() est une lecture pure (clone du snapshot)
 * - aucune suppression : un device observé reste dans le registre
 *
 * UTILITÉ DANS SAPHIR :
 * 🎯 Source de vérité unique pour le dashboard et le dispatcher
 * 🎯 Le dispatcher observe les ingestions pour résoudre ses attentes
 * 🎯 Service explicite injecté par référence, aucun singleton global
 */
use crate::models::{DeviceEvent, DeviceSnapshot, DevicesMap, EventKind};
use crate::presence;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use time::{Duration, OffsetDateTime};
use tracing::debug;

pub type Subscriber = Box<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Ticket d'abonnement, à repasser à `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

pub struct DeviceStore {
    devices: Mutex<DevicesMap>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_sub_id: AtomicU64,
    stale_threshold: Duration,
}

impl DeviceStore {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            devices: Mutex::new(DevicesMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Applique un événement classifié au miroir puis notifie les abonnés.
    /// Total sur les événements bien formés : ne peut pas échouer, ne suspend
    /// jamais (mise à jour + fan-out synchrones).
    pub fn ingest(&self, event: &DeviceEvent) {
        let now = OffsetDateTime::now_utc();
        {
            let mut devices = self.devices.lock();
            let snapshot = devices
                .entry(event.device_id.clone())
                .or_insert_with(|| DeviceSnapshot::new(&event.device_id, now));

            match &event.kind {
                EventKind::Status { online } => snapshot.online = *online,
                EventKind::Gpio { pin, level } => {
                    snapshot.gpio.insert(*pin, *level);
                }
                EventKind::Sensor { addr, value } => {
                    snapshot.sensors.insert(addr.clone(), *value);
                }
            }
            // last_seen avance pour TOUT événement classifié, le type importe peu
            snapshot.last_seen = now;
        }
        debug!("[store] ingested {:?} for {}", event.kind, event.device_id);

        // fan-out hors du verrou des snapshots : un abonné peut relire le store.
        // Les callbacks ne doivent pas se (dés)abonner pendant la notification.
        let subscribers = self.subscribers.lock();
        for (_, callback) in subscribers.iter() {
            callback(event);
        }
    }

    /// Lecture pure, sans effet de bord.
    pub fn get(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn list(&self) -> Vec<DeviceSnapshot> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Présence effective recalculée à la demande (voir `presence`).
    /// `false` si le device n'a jamais été observé.
    pub fn effective_online(&self, device_id: &str, now: OffsetDateTime) -> bool {
        self.devices
            .lock()
            .get(device_id)
            .map(|s| presence::effective_online(s, now, self.stale_threshold))
            .unwrap_or(false)
    }

    /// Enregistre un observateur appelé après chaque ingestion réussie.
    pub fn subscribe(&self, callback: impl Fn(&DeviceEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_sub_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new(presence::default_stale_threshold())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn gpio_event(device_id: &str, pin: u8, level: u8) -> DeviceEvent {
        DeviceEvent {
            device_id: device_id.to_string(),
            kind: EventKind::Gpio { pin, level },
        }
    }

    fn status_event(device_id: &str, online: bool) -> DeviceEvent {
        DeviceEvent {
            device_id: device_id.to_string(),
            kind: EventKind::Status { online },
        }
    }

    #[test]
    fn test_gpio_apply_all_pins() {
        // P1 : toute ingestion gpio/p=v se relit en gpio[p]==v, last_seen avance
        let store = DeviceStore::default();
        for pin in 0u8..=39 {
            for level in [0u8, 1] {
                let before = store.get("saph-aa11").map(|s| s.last_seen);
                store.ingest(&gpio_event("saph-aa11", pin, level));
                let snapshot = store.get("saph-aa11").unwrap();
                assert_eq!(snapshot.gpio.get(&pin), Some(&level));
                if let Some(before) = before {
                    assert!(snapshot.last_seen >= before);
                }
            }
        }
    }

    #[test]
    fn test_status_idempotent() {
        // P2 : deux "online" consécutifs laissent online=true, seul last_seen bouge
        let store = DeviceStore::default();
        store.ingest(&status_event("saph-aa11", true));
        let first = store.get("saph-aa11").unwrap();
        store.ingest(&status_event("saph-aa11", true));
        let second = store.get("saph-aa11").unwrap();
        assert!(first.online && second.online);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(second.gpio, first.gpio);
    }

    #[test]
    fn test_snapshot_created_lazily_and_keys_grow() {
        let store = DeviceStore::default();
        assert!(store.get("saph-aa11").is_none());
        assert!(!store.effective_online("saph-aa11", OffsetDateTime::now_utc()));

        store.ingest(&gpio_event("saph-aa11", 2, 1));
        store.ingest(&DeviceEvent {
            device_id: "saph-aa11".into(),
            kind: EventKind::Sensor { addr: "0x48".into(), value: 21.5 },
        });
        store.ingest(&status_event("saph-aa11", true));

        // une seule entrée par device, les clés observées sont toutes retenues
        assert_eq!(store.device_count(), 1);
        let snapshot = store.get("saph-aa11").unwrap();
        assert_eq!(snapshot.gpio.get(&2), Some(&1));
        assert_eq!(snapshot.sensors.get("0x48"), Some(&21.5));
        assert!(snapshot.online);
    }

    #[test]
    fn test_staleness_overrides_flag() {
        // P3 / scénario B : silencieux depuis 20s, flag online encore true
        let store = DeviceStore::default();
        store.ingest(&status_event("saph-aa11", true));
        let now = OffsetDateTime::now_utc();
        assert!(store.effective_online("saph-aa11", now));

        let later = now + Duration::milliseconds(20_000);
        assert!(!store.effective_online("saph-aa11", later));
        assert!(store.get("saph-aa11").unwrap().online, "flag stocké inchangé");
    }

    #[test]
    fn test_subscribers_notified_once_per_ingest() {
        let store = DeviceStore::default();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        store.ingest(&gpio_event("saph-aa11", 2, 1));
        store.ingest(&status_event("saph-bb22", false));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(store.unsubscribe(id));
        store.ingest(&gpio_event("saph-aa11", 2, 0));
        assert_eq!(count.load(Ordering::SeqCst), 2, "plus de notification après unsubscribe");
        assert!(!store.unsubscribe(id), "ticket déjà consommé");
    }
}
