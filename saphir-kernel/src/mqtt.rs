/**
 * MQTT TRANSPORT & LISTENER - Lien entre le bus et le noyau
 *
 * RÔLE :
 * Implémente le contrat `Transport` au-dessus de rumqttc et alimente le store
 * depuis les topics devices (status, gpio, sensor). Tient à jour l'état du
 * lien pour le fast-reject du dispatcher et le health.
 *
 * FONCTIONNEMENT :
 * - abonnements posés à chaque ConnAck (couvre aussi les reconnexions)
 * - chaque Publish entrant passe par classify() ; un message malformé est
 *   loggué puis jeté, il ne doit jamais casser l'ingestion des suivants
 * - erreur de connexion : status -> error, compteur de reconnexions, retry 2s
 */
use crate::classify::classify;
use crate::config::{KernelConfig, MqttConf};
use crate::store::DeviceStore;
use crate::transport::{LinkStatus, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, error, info};

pub struct MqttTransport {
    client: AsyncClient,
    link: Mutex<LinkStatus>,
    reconnects: AtomicU32,
}

impl MqttTransport {
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn set_link(&self, status: LinkStatus) {
        *self.link.lock() = status;
    }

    fn mark_connection_error(&self) {
        self.set_link(LinkStatus::Error);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: String, retained: bool) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retained, payload)
            .await?;
        Ok(())
    }

    fn link_status(&self) -> LinkStatus {
        *self.link.lock()
    }
}

/// Crée le client partagé kernel/dispatcher et l'eventloop à donner au listener.
pub fn create_mqtt_transport(cfg: &KernelConfig) -> (Arc<MqttTransport>, EventLoop) {
    let mqtt_cfg = cfg.mqtt.clone().unwrap_or_else(MqttConf::default);
    let mut opts = MqttOptions::new("saphir-kernel", &mqtt_cfg.host, mqtt_cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, eventloop) = AsyncClient::new(opts, 10);

    let transport = Arc::new(MqttTransport {
        client,
        link: Mutex::new(LinkStatus::Connecting),
        reconnects: AtomicU32::new(0),
    });
    (transport, eventloop)
}

/// Boucle d'ingestion : remplit le store depuis les messages devices.
pub fn spawn_mqtt_listener(
    mut eventloop: EventLoop,
    transport: Arc<MqttTransport>,
    store: Arc<DeviceStore>,
    topic_root: String,
) {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    transport.set_link(LinkStatus::Connected);
                    info!("[mqtt] connected, subscribing device topics");
                    let filters = [
                        format!("{topic_root}/+/status/online"),
                        format!("{topic_root}/+/gpio/+"),
                        format!("{topic_root}/+/sensor/#"),
                    ];
                    for filter in filters {
                        if let Err(e) = transport.client.subscribe(&filter, QoS::AtLeastOnce).await {
                            error!("[mqtt] subscribe {} failed: {:?}", filter, e);
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    match String::from_utf8(p.payload.to_vec()) {
                        Ok(payload) => match classify(&topic_root, &p.topic, &payload) {
                            Ok(event) => store.ingest(&event),
                            // flux non fiable : log-and-drop, jamais d'erreur propagée
                            Err(e) => debug!("[mqtt] dropped message on {}: {}", p.topic, e),
                        },
                        Err(_) => debug!("[mqtt] non-UTF8 payload on {}", p.topic),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[mqtt] connection error: {:?}", e);
                    transport.mark_connection_error();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}
