use crate::dispatch::CommandDispatcher;
use crate::mqtt::MqttTransport;
use crate::store::DeviceStore;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, error};

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub devices_tracked: u32,
    pub pending_commands: u32,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(
        &self,
        store: &DeviceStore,
        dispatcher: &CommandDispatcher,
        transport: &MqttTransport,
    ) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_tracked: store.device_count() as u32,
            pending_commands: dispatcher.pending_count() as u32,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: transport.link_status().to_string(),
            mqtt_reconnects: transport.reconnects(),
        }
    }

    /// Démarre la publication périodique du health kernel (30s).
    pub fn spawn_health_publisher(
        &self,
        store: Arc<DeviceStore>,
        dispatcher: Arc<CommandDispatcher>,
        transport: Arc<MqttTransport>,
    ) {
        let tracker = self.clone();

        task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let health = tracker.get_health(&store, &dispatcher, &transport);
                let Ok(payload) = serde_json::to_string(&health) else { continue };
                match transport.publish("saphir/kernel/health", payload, false).await {
                    Ok(()) => debug!(
                        "[health] published kernel health (uptime: {}s, devices: {})",
                        health.uptime_seconds, health.devices_tracked
                    ),
                    Err(e) => error!("[health] failed to publish: {:?}", e),
                }
            }
        });
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    // Approximation simple - en production on pourrait utiliser sysinfo
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return (kb as f32) / 1024.0; // KB -> MB
                        }
                    }
                }
            }
        }
    }

    // Fallback approximatif
    12.0
}
