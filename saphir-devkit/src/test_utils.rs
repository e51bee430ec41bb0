/*!
Test Harness pour le noyau Saphir

Câble store + dispatcher + transport mock pour dérouler des scénarios complets
sans broker :
- injection de messages devices (status, gpio, sensor) via le classifier réel
- simulation d'un device qui applique les toggles reçus et publie son écho
- assertions sur les publications du kernel
*/

use crate::mqtt_stub::{MockTransport, SaphirMessageBuilder};
use anyhow::Result;
use saphir_kernel::classify::classify;
use saphir_kernel::dispatch::CommandDispatcher;
use saphir_kernel::models::{DeviceEvent, EventKind, ToggleCommand};
use saphir_kernel::store::DeviceStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const ROOT: &str = "saphir";

/// Harness de test complet : le chemin message → classify → store → dispatcher
/// est exactement celui du kernel, seul le broker est remplacé.
pub struct TestHarness {
    pub store: Arc<DeviceStore>,
    pub transport: MockTransport,
    pub dispatcher: Arc<CommandDispatcher>,
    pub builder: SaphirMessageBuilder,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let store = Arc::new(DeviceStore::default());
        let transport = MockTransport::new();
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            Arc::new(transport.clone()),
            ROOT,
        ));

        Self {
            store,
            transport,
            dispatcher,
            builder: SaphirMessageBuilder::new(ROOT),
        }
    }

    /// Injecte un couple topic/payload brut, via le classifier réel.
    pub fn feed(&self, topic: &str, payload: &str) -> Result<()> {
        let event = classify(ROOT, topic, payload)?;
        self.store.ingest(&event);
        Ok(())
    }

    pub fn feed_status(&self, device_id: &str, online: bool) {
        let (topic, payload) = self.builder.status_online(device_id, online);
        self.feed(&topic, &payload).expect("builder produit un message valide");
    }

    pub fn feed_gpio(&self, device_id: &str, pin: u8, level: u8) {
        let (topic, payload) = self.builder.gpio_level(device_id, pin, level);
        self.feed(&topic, &payload).expect("builder produit un message valide");
    }

    pub fn feed_sensor(&self, device_id: &str, addr: &str, value: f64) {
        let (topic, payload) = self.builder.sensor_reading(device_id, addr, value);
        self.feed(&topic, &payload).expect("builder produit un message valide");
    }

    /// Simule un device : chaque cmd/toggle publié par le kernel est appliqué
    /// puis son écho gpio est réinjecté après `delay`.
    pub fn spawn_echo_device(&self, delay: Duration) -> JoinHandle<()> {
        let mut published = self.transport.watch_published();
        let store = self.store.clone();

        tokio::spawn(async move {
            while let Some(msg) = published.recv().await {
                if !msg.topic.ends_with("/cmd/toggle") {
                    continue;
                }
                let Some(device_id) = msg.topic.split('/').nth(1).map(str::to_string) else {
                    continue;
                };
                let Ok(cmd) = serde_json::from_str::<ToggleCommand>(&msg.payload) else {
                    log::warn!("⚠️ [ECHO] payload toggle invalide: {}", msg.payload);
                    continue;
                };
                tokio::time::sleep(delay).await;
                log::info!("📨 [ECHO] {} applied pin {} -> {}", device_id, cmd.pin, cmd.state);
                // écho du device : le niveau réellement appliqué
                store.ingest(&DeviceEvent {
                    device_id,
                    kind: EventKind::Gpio { pin: cmd.pin, level: cmd.state },
                });
            }
        })
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
