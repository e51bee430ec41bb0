use crate::presence::STALE_THRESHOLD_MS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    #[serde(default)]
    pub mqtt: Option<MqttConf>,
    /// Racine des topics consommés et produits (marqueur fixe de la grammaire).
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    /// Seuil de péremption de la présence effective.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// Timeout par défaut d'attente d'écho pour une commande toggle.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883 }
    }
}

fn default_topic_root() -> String {
    "saphir".into()
}

fn default_stale_threshold_ms() -> u64 {
    STALE_THRESHOLD_MS as u64
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_http_port() -> u16 {
    8080
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: Some(MqttConf::default()),
            topic_root: default_topic_root(),
            stale_threshold_ms: default_stale_threshold_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            http_port: default_http_port(),
        }
    }
}

fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("[kernel] config invalide: {e}");
        KernelConfig::default()
    })
}

/// Charge la config YAML (chemin via SAPHIR_KERNEL_CONFIG, défaut kernel.yaml).
/// Permissif : tout problème retombe sur la config par défaut.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("SAPHIR_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        warn!("[kernel] pas de kernel.yaml, usage config par défaut");
        KernelConfig::default()
    }
}
