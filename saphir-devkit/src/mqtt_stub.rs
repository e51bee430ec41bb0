/*!
Mock Transport pour développement sans broker

Implémente le contrat `Transport` du kernel en mémoire : enregistre toutes les
publications, expose un canal pour les observer, et laisse piloter l'état du
lien (utile pour tester les fast-reject du dispatcher).
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use saphir_kernel::transport::{LinkStatus, Transport};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

/// Mock du transport pub/sub, partageable par clone.
#[derive(Clone)]
pub struct MockTransport {
    published: Arc<Mutex<Vec<MockMessage>>>,
    link: Arc<Mutex<LinkStatus>>,
    watchers: Arc<Mutex<Vec<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            // connecté par défaut : le cas nominal des tests
            link: Arc::new(Mutex::new(LinkStatus::Connected)),
            watchers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_link_status(&self, status: LinkStatus) {
        *self.link.lock() = status;
    }

    /// Canal recevant une copie de chaque publication (simulateur de device,
    /// assertions asynchrones...).
    pub fn watch_published(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        rx
    }

    /// Tous les messages publiés (pour assertions de tests).
    pub fn published(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON.
    pub fn last_json<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_str(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: String, retained: bool) -> anyhow::Result<()> {
        let message = MockMessage {
            topic: topic.to_string(),
            payload,
            retained,
        };
        self.published.lock().push(message.clone());
        // un watcher fermé est simplement purgé
        self.watchers
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
        log::info!("📤 [MOCK] published to {}", message.topic);
        Ok(())
    }

    fn link_status(&self) -> LinkStatus {
        *self.link.lock()
    }
}

/// Builder de couples topic/payload conformes à la grammaire devices.
pub struct SaphirMessageBuilder {
    root: String,
}

impl SaphirMessageBuilder {
    pub fn new<S: Into<String>>(root: S) -> Self {
        Self { root: root.into() }
    }

    /// Message status/online tel qu'émis par le device (ou son last-will).
    pub fn status_online(&self, device_id: &str, online: bool) -> (String, String) {
        (
            format!("{}/{}/status/online", self.root, device_id),
            if online { "online" } else { "offline" }.to_string(),
        )
    }

    /// Écho gpio tel qu'émis par le device après application d'un niveau.
    pub fn gpio_level(&self, device_id: &str, pin: u8, level: u8) -> (String, String) {
        (
            format!("{}/{}/gpio/{}", self.root, device_id, pin),
            level.to_string(),
        )
    }

    /// Lecture capteur.
    pub fn sensor_reading(&self, device_id: &str, addr: &str, value: f64) -> (String, String) {
        (
            format!("{}/{}/sensor/{}", self.root, device_id, addr),
            value.to_string(),
        )
    }
}

impl Default for SaphirMessageBuilder {
    fn default() -> Self {
        Self::new("saphir")
    }
}
