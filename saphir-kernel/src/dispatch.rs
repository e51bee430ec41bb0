/**
 * COMMAND DISPATCHER - Émulation requête/réponse sur bus fire-and-forget
 *
 * RÔLE :
 * Envoie les commandes de contrôle (toggle GPIO, servo) et attend via le store
 * l'écho du device confirmant l'effet réel, avec timeout borné.
 *
 * FONCTIONNEMENT :
 * - Fast-reject si lien coupé ou device hors ligne : échec certain, on ne
 *   publie pas et on n'attend pas
 * - Le waiter est enregistré AVANT la publication : un device qui répond plus
 *   vite que nous serait sinon manqué
 * - Course écho vs timeout via oneshot + tokio::time::timeout, l'issue est
 *   toujours retournée à l'appelant, jamais levée en exception
 *
 * UTILITÉ DANS SAPHIR :
 * 🎯 Le dashboard affiche confirmé / en attente / échec sans deviner
 * 🎯 Une commande remplacée par une plus récente est proprement annulée
 * 🎯 Un écho non sollicité reste un simple état ordinaire du store
 */
use crate::models::{EventKind, ServoCommand, ToggleCommand};
use crate::store::DeviceStore;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Issue terminale d'une commande. Par clé (device, pin) l'automate est :
/// IDLE → PENDING → {CONFIRMED, TIMED_OUT, SUPERSEDED} → IDLE.
/// REJECTED ne quitte jamais IDLE (chemin fast-reject).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Confirmed,
    TimedOut,
    Superseded,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("transport not connected")]
    NotConnected,
    #[error("device offline")]
    DeviceOffline,
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Métadonnées d'une commande toggle : adresse I2C de l'extender visé et
/// drapeau override (forcer une pin pilotée par le firmware).
#[derive(Debug, Clone, Default)]
pub struct ToggleMeta {
    pub addr: String,
    pub override_mode: bool,
}

struct PendingEntry {
    /// Numéro de série : distingue notre entrée d'une remplaçante qui aurait
    /// repris la clé pendant l'attente (chemin timeout).
    seq: u64,
    desired: u8,
    issued_at: OffsetDateTime,
    tx: oneshot::Sender<CommandOutcome>,
}

type PendingKey = (String, u8);
type PendingMap = HashMap<PendingKey, PendingEntry>;

pub struct CommandDispatcher {
    store: Arc<DeviceStore>,
    transport: Arc<dyn Transport>,
    topic_root: String,
    pending: Arc<Mutex<PendingMap>>,
    seq: AtomicU64,
}

impl CommandDispatcher {
    /// Construit le dispatcher et branche son observateur sur le store : les
    /// échos gpio ingérés résolvent les attentes correspondantes.
    pub fn new(store: Arc<DeviceStore>, transport: Arc<dyn Transport>, topic_root: &str) -> Self {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));

        let observed = pending.clone();
        store.subscribe(move |event| {
            let EventKind::Gpio { pin, level } = &event.kind else {
                return;
            };
            let key = (event.device_id.clone(), *pin);
            let mut map = observed.lock();
            // Confirmation uniquement si l'écho porte le niveau demandé ; un
            // écho sans entrée en attente est déjà appliqué par le store et ne
            // nous concerne pas.
            let matches = map.get(&key).map(|e| e.desired == *level).unwrap_or(false);
            if matches {
                if let Some(entry) = map.remove(&key) {
                    // résolution et retrait sous le même verrou : aucune
                    // fenêtre où has_pending est faux avec un waiter non résolu
                    let _ = entry.tx.send(CommandOutcome::Confirmed);
                }
            }
        });

        Self {
            store,
            transport,
            topic_root: topic_root.to_string(),
            pending,
            seq: AtomicU64::new(1),
        }
    }

    /// Envoie une commande toggle et attend l'écho du device.
    ///
    /// Ordre imposé : fast-reject, enregistrement du waiter, publication,
    /// course écho vs timeout. Une commande plus récente sur la même clé
    /// annule la précédente avec l'issue `Superseded` (cancel-the-old).
    pub async fn send_toggle(
        &self,
        device_id: &str,
        pin: u8,
        desired: u8,
        meta: ToggleMeta,
        timeout_ms: u64,
    ) -> CommandOutcome {
        let desired = if desired == 0 { 0 } else { 1 };

        // 1. fast-reject : échec certain, pas de publication ni d'attente
        if !self.transport.link_status().is_connected() {
            return CommandOutcome::Rejected(RejectReason::NotConnected);
        }
        if !self
            .store
            .effective_online(device_id, OffsetDateTime::now_utc())
        {
            return CommandOutcome::Rejected(RejectReason::DeviceOffline);
        }

        // 2. enregistrement AVANT publication
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key: PendingKey = (device_id.to_string(), pin);
        let (tx, mut rx) = oneshot::channel();
        {
            let mut map = self.pending.lock();
            let entry = PendingEntry {
                seq,
                desired,
                issued_at: OffsetDateTime::now_utc(),
                tx,
            };
            if let Some(previous) = map.insert(key.clone(), entry) {
                let age = OffsetDateTime::now_utc() - previous.issued_at;
                debug!(
                    "[dispatch] superseding toggle on {} pin {} after {}ms",
                    device_id,
                    pin,
                    age.whole_milliseconds()
                );
                let _ = previous.tx.send(CommandOutcome::Superseded);
            }
        }

        // 3. publication via le contrat transport
        let command = ToggleCommand {
            addr: meta.addr,
            pin,
            state: desired,
            override_mode: meta.override_mode,
        };
        let topic = format!("{}/{}/cmd/toggle", self.topic_root, device_id);
        let payload = match serde_json::to_string(&command) {
            Ok(payload) => payload,
            Err(e) => {
                self.unregister(&key, seq);
                return CommandOutcome::Rejected(RejectReason::PublishFailed(e.to_string()));
            }
        };
        if let Err(e) = self.transport.publish(&topic, payload, false).await {
            self.unregister(&key, seq);
            return CommandOutcome::Rejected(RejectReason::PublishFailed(e.to_string()));
        }
        debug!("[dispatch] toggle {} pin {} -> {} (timeout {}ms)", device_id, pin, desired, timeout_ms);

        // 4. course écho vs timeout
        match timeout(Duration::from_millis(timeout_ms), &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // canal fermé sans résolution : ne devrait pas arriver
                warn!("[dispatch] waiter dropped for {} pin {}", device_id, pin);
                self.unregister(&key, seq);
                CommandOutcome::TimedOut
            }
            Err(_) => {
                // on ne retire que NOTRE entrée : une commande plus récente a
                // pu reprendre la clé pendant l'attente
                if !self.unregister(&key, seq) {
                    // résolution concurrente juste avant l'échéance
                    if let Ok(outcome) = rx.try_recv() {
                        return outcome;
                    }
                }
                CommandOutcome::TimedOut
            }
        }
    }

    /// Commande servo : mêmes gardes fast-reject, mais fire-and-forget.
    /// Un servo ne publie pas d'écho gpio, il n'y a donc pas de boucle de
    /// confirmation à attendre.
    pub async fn send_servo(
        &self,
        device_id: &str,
        addr: &str,
        angle: u8,
    ) -> Result<(), RejectReason> {
        if !self.transport.link_status().is_connected() {
            return Err(RejectReason::NotConnected);
        }
        if !self
            .store
            .effective_online(device_id, OffsetDateTime::now_utc())
        {
            return Err(RejectReason::DeviceOffline);
        }

        let command = ServoCommand {
            addr: addr.to_string(),
            // butée mécanique
            angle: angle.min(180),
        };
        let topic = format!("{}/{}/cmd/servo", self.topic_root, device_id);
        let payload =
            serde_json::to_string(&command).map_err(|e| RejectReason::PublishFailed(e.to_string()))?;
        self.transport
            .publish(&topic, payload, false)
            .await
            .map_err(|e| RejectReason::PublishFailed(e.to_string()))?;
        debug!("[dispatch] servo {} addr {} -> {}°", device_id, addr, command.angle);
        Ok(())
    }

    /// Vrai ssi une commande est en vol pour cette clé. Faux immédiatement
    /// après chaque issue terminale (indicateur "en cours" côté dashboard).
    pub fn has_pending(&self, device_id: &str, pin: u8) -> bool {
        self.pending
            .lock()
            .contains_key(&(device_id.to_string(), pin))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pins du device avec une commande en vol, triées. Énumère la carte des
    /// attentes elle-même : une pin jamais encore échoée par le device n'a pas
    /// d'entrée gpio dans le snapshot mais doit quand même apparaître.
    pub fn pending_pins(&self, device_id: &str) -> Vec<u8> {
        let mut pins: Vec<u8> = self
            .pending
            .lock()
            .keys()
            .filter(|(id, _)| id == device_id)
            .map(|(_, pin)| *pin)
            .collect();
        pins.sort_unstable();
        pins
    }

    /// Retire l'entrée de la clé uniquement si c'est encore la nôtre.
    fn unregister(&self, key: &PendingKey, seq: u64) -> bool {
        let mut map = self.pending.lock();
        if map.get(key).map(|e| e.seq == seq).unwrap_or(false) {
            map.remove(key);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceEvent;
    use crate::transport::LinkStatus;
    use async_trait::async_trait;
    use std::time::Instant;

    struct StubTransport {
        link: Mutex<LinkStatus>,
        published: Mutex<Vec<(String, String)>>,
    }

    impl StubTransport {
        fn new(link: LinkStatus) -> Arc<Self> {
            Arc::new(Self {
                link: Mutex::new(link),
                published: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<(String, String)> {
            self.published.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn publish(&self, topic: &str, payload: String, _retained: bool) -> anyhow::Result<()> {
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }

        fn link_status(&self) -> LinkStatus {
            *self.link.lock()
        }
    }

    /// Lien annoncé connecté mais toute publication échoue (broker parti
    /// entre le fast-reject et l'envoi).
    struct BrokenTransport;

    #[async_trait]
    impl Transport for BrokenTransport {
        async fn publish(&self, _topic: &str, _payload: String, _retained: bool) -> anyhow::Result<()> {
            anyhow::bail!("broker pipe closed")
        }

        fn link_status(&self) -> LinkStatus {
            LinkStatus::Connected
        }
    }

    fn gpio_event(device_id: &str, pin: u8, level: u8) -> DeviceEvent {
        DeviceEvent {
            device_id: device_id.to_string(),
            kind: EventKind::Gpio { pin, level },
        }
    }

    fn online_store(device_id: &str) -> Arc<DeviceStore> {
        let store = Arc::new(DeviceStore::default());
        store.ingest(&DeviceEvent {
            device_id: device_id.to_string(),
            kind: EventKind::Status { online: true },
        });
        store
    }

    fn meta() -> ToggleMeta {
        ToggleMeta { addr: "0x20".into(), override_mode: false }
    }

    #[tokio::test]
    async fn test_confirmed_by_matching_echo() {
        // P4 / scénario A : écho gpio/2=1 après enregistrement -> Confirmed
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            transport.clone(),
            "saphir",
        ));

        let d = dispatcher.clone();
        let call = tokio::spawn(async move { d.send_toggle("saph-aa11", 2, 1, meta(), 5_000).await });

        // laisser la commande s'enregistrer et publier
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.has_pending("saph-aa11", 2));
        store.ingest(&gpio_event("saph-aa11", 2, 1));

        assert_eq!(call.await.unwrap(), CommandOutcome::Confirmed);
        assert!(!dispatcher.has_pending("saph-aa11", 2));
        assert_eq!(store.get("saph-aa11").unwrap().gpio.get(&2), Some(&1));

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "saphir/saph-aa11/cmd/toggle");
        let cmd: ToggleCommand = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!((cmd.pin, cmd.state, cmd.addr.as_str()), (2, 1, "0x20"));
    }

    #[tokio::test]
    async fn test_wrong_level_echo_does_not_confirm() {
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = Arc::new(CommandDispatcher::new(store.clone(), transport, "saphir"));

        let d = dispatcher.clone();
        let call = tokio::spawn(async move { d.send_toggle("saph-aa11", 2, 1, meta(), 200).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // écho au mauvais niveau : état ordinaire, la commande reste en vol
        store.ingest(&gpio_event("saph-aa11", 2, 0));
        assert!(dispatcher.has_pending("saph-aa11", 2));

        assert_eq!(call.await.unwrap(), CommandOutcome::TimedOut);
        assert!(!dispatcher.has_pending("saph-aa11", 2));
    }

    #[tokio::test]
    async fn test_timeout_without_echo() {
        // P5 : pas d'écho -> TimedOut à l'échéance, plus rien en vol ensuite
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = CommandDispatcher::new(store, transport, "saphir");

        let started = Instant::now();
        let outcome = dispatcher.send_toggle("saph-aa11", 4, 1, meta(), 100).await;
        assert_eq!(outcome, CommandOutcome::TimedOut);
        assert!(started.elapsed() >= std::time::Duration::from_millis(100));
        assert!(!dispatcher.has_pending("saph-aa11", 4));
    }

    #[tokio::test]
    async fn test_supersession_cancels_older_command() {
        // P6 : la seconde commande sur la même clé résout la première en
        // Superseded ; l'écho de la seconde ne confirme jamais la première
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = Arc::new(CommandDispatcher::new(store.clone(), transport, "saphir"));

        let d1 = dispatcher.clone();
        let first = tokio::spawn(async move { d1.send_toggle("saph-aa11", 2, 1, meta(), 2_000).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let d2 = dispatcher.clone();
        let second = tokio::spawn(async move { d2.send_toggle("saph-aa11", 2, 0, meta(), 2_000).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(first.await.unwrap(), CommandOutcome::Superseded);
        assert!(dispatcher.has_pending("saph-aa11", 2), "la remplaçante reste en vol");

        store.ingest(&gpio_event("saph-aa11", 2, 0));
        assert_eq!(second.await.unwrap(), CommandOutcome::Confirmed);
        assert!(!dispatcher.has_pending("saph-aa11", 2));
    }

    #[tokio::test]
    async fn test_fast_reject_not_connected() {
        // scénario C : lien coupé -> Rejected immédiat, aucune publication
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Error);
        let dispatcher = CommandDispatcher::new(store, transport.clone(), "saphir");

        let started = Instant::now();
        let outcome = dispatcher.send_toggle("saph-aa11", 2, 1, meta(), 5_000).await;
        assert_eq!(outcome, CommandOutcome::Rejected(RejectReason::NotConnected));
        assert!(started.elapsed() < std::time::Duration::from_millis(100), "pas d'attente");
        assert!(transport.published().is_empty());
        assert!(!dispatcher.has_pending("saph-aa11", 2));
    }

    #[tokio::test]
    async fn test_fast_reject_device_offline() {
        // device jamais vu -> présence effective fausse -> Rejected
        let store = Arc::new(DeviceStore::default());
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = CommandDispatcher::new(store, transport.clone(), "saphir");

        let outcome = dispatcher.send_toggle("saph-aa11", 2, 1, meta(), 5_000).await;
        assert_eq!(outcome, CommandOutcome::Rejected(RejectReason::DeviceOffline));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_echo_is_plain_state() {
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = CommandDispatcher::new(store.clone(), transport, "saphir");

        store.ingest(&gpio_event("saph-aa11", 9, 1));
        assert!(!dispatcher.has_pending("saph-aa11", 9));
        assert_eq!(store.get("saph-aa11").unwrap().gpio.get(&9), Some(&1));
    }

    #[tokio::test]
    async fn test_independent_keys_run_concurrently() {
        // aucun verrouillage croisé : deux pins du même device en parallèle
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = Arc::new(CommandDispatcher::new(store.clone(), transport, "saphir"));

        let d2 = dispatcher.clone();
        let on_pin_2 = tokio::spawn(async move { d2.send_toggle("saph-aa11", 2, 1, meta(), 2_000).await });
        let d3 = dispatcher.clone();
        let on_pin_3 = tokio::spawn(async move { d3.send_toggle("saph-aa11", 3, 0, meta(), 2_000).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.pending_count(), 2);
        store.ingest(&gpio_event("saph-aa11", 3, 0));
        store.ingest(&gpio_event("saph-aa11", 2, 1));

        assert_eq!(on_pin_2.await.unwrap(), CommandOutcome::Confirmed);
        assert_eq!(on_pin_3.await.unwrap(), CommandOutcome::Confirmed);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_pins_listed_before_first_echo() {
        // premier toggle sur une pin jamais observée : le snapshot n'a pas
        // encore d'entrée gpio, la pin doit quand même être listée en vol
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = Arc::new(CommandDispatcher::new(store.clone(), transport, "saphir"));

        let d = dispatcher.clone();
        let call = tokio::spawn(async move { d.send_toggle("saph-aa11", 7, 1, meta(), 2_000).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get("saph-aa11").unwrap().gpio.is_empty());
        assert_eq!(dispatcher.pending_pins("saph-aa11"), vec![7]);
        assert!(dispatcher.pending_pins("saph-bb22").is_empty(), "clé d'un autre device");

        store.ingest(&gpio_event("saph-aa11", 7, 1));
        assert_eq!(call.await.unwrap(), CommandOutcome::Confirmed);
        assert!(dispatcher.pending_pins("saph-aa11").is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_resolves_entry() {
        // publication en échec après enregistrement : Rejected immédiat et
        // l'entrée est retirée, pas de waiter orphelin jusqu'au timeout
        let store = online_store("saph-aa11");
        let dispatcher = CommandDispatcher::new(store, Arc::new(BrokenTransport), "saphir");

        let started = Instant::now();
        let outcome = dispatcher.send_toggle("saph-aa11", 2, 1, meta(), 5_000).await;
        assert!(matches!(
            outcome,
            CommandOutcome::Rejected(RejectReason::PublishFailed(_))
        ));
        assert!(started.elapsed() < std::time::Duration::from_millis(100), "pas d'attente");
        assert!(!dispatcher.has_pending("saph-aa11", 2));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_servo_fire_and_forget() {
        let store = online_store("saph-aa11");
        let transport = StubTransport::new(LinkStatus::Connected);
        let dispatcher = CommandDispatcher::new(store, transport.clone(), "saphir");

        dispatcher.send_servo("saph-aa11", "0x40", 200).await.unwrap();
        let published = transport.published();
        assert_eq!(published[0].0, "saphir/saph-aa11/cmd/servo");
        let cmd: ServoCommand = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(cmd.angle, 180, "angle clampé à la butée");
        assert_eq!(dispatcher.pending_count(), 0, "pas d'attente pour un servo");
    }
}
