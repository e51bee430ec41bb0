use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Miroir en mémoire du dernier état connu d'un device.
/// Créé paresseusement au premier message, jamais supprimé : les clés gpio et
/// sensors ne font que croître (une pin observée reste visible même périmée).
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub device_id: String,
    /// Dernier flag de vivacité annoncé par le device lui-même.
    pub online: bool,
    /// Horodatage du dernier message entrant, toutes catégories confondues.
    pub last_seen: OffsetDateTime,
    /// Derniers niveaux confirmés des pins digitales (0 ou 1).
    pub gpio: HashMap<u8, u8>,
    /// Dernières lectures analogiques, par adresse de capteur.
    pub sensors: HashMap<String, f64>,
}

impl DeviceSnapshot {
    pub fn new(device_id: &str, now: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            online: false,
            last_seen: now,
            gpio: HashMap::new(),
            sensors: HashMap::new(),
        }
    }
}

/// Événement typé produit par le classifier à partir d'un couple topic/payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub device_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Status { online: bool },
    Gpio { pin: u8, level: u8 },
    Sensor { addr: String, value: f64 },
}

/// Payload JSON de commande toggle (kernel → device).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleCommand {
    /// Adresse I2C de l'extender GPIO visé (ex: "0x20").
    pub addr: String,
    pub pin: u8,
    pub state: u8,
    #[serde(rename = "override", default)]
    pub override_mode: bool,
}

/// Payload JSON de commande servo (kernel → device).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoCommand {
    pub addr: String,
    /// Angle cible en degrés, butées mécaniques 0..180.
    pub angle: u8,
}

pub type DevicesMap = HashMap<String, DeviceSnapshot>;
