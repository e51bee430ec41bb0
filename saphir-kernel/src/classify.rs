use crate::models::{DeviceEvent, EventKind};
use thiserror::Error;

/// Préfixe imposé des identifiants de devices (série gravée sur la carte,
/// ex: "saph-aa11").
const DEVICE_ID_PREFIX: &str = "saph-";

/// Raisons de rejet d'un message entrant. Le flux est non fiable et continu :
/// ces erreurs sont logguées puis jetées par l'appelant, jamais propagées.
#[derive(Debug, Error, PartialEq)]
pub enum ClassifyError {
    #[error("topic outside root: {0}")]
    WrongRoot(String),
    #[error("topic too short: {0}")]
    ShortTopic(String),
    #[error("bad device id: {0}")]
    BadDeviceId(String),
    #[error("unknown category: {0}")]
    UnknownCategory(String),
    #[error("bad key '{key}' for category {category}")]
    BadKey { category: &'static str, key: String },
    #[error("bad payload '{payload}' for category {category}")]
    BadPayload { category: &'static str, payload: String },
}

/// Forme attendue d'un identifiant device : "saph-" suivi d'un suffixe court
/// alphanumérique minuscule.
pub fn is_device_id(id: &str) -> bool {
    match id.strip_prefix(DEVICE_ID_PREFIX) {
        Some(suffix) => {
            !suffix.is_empty()
                && suffix.len() <= 16
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        }
        None => false,
    }
}

/// Parse un couple topic/payload en événement typé. Pur, sans effet de bord :
/// l'application au miroir est du ressort du store.
///
/// Grammaire consommée :
///   <root>/<deviceId>/status/online   payload "online"|"offline"|"1"|"0"
///   <root>/<deviceId>/gpio/<pin>      payload entier, 0 ou non-zéro
///   <root>/<deviceId>/sensor/<addr>   payload flottant
pub fn classify(root: &str, topic: &str, payload: &str) -> Result<DeviceEvent, ClassifyError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < 4 {
        return Err(ClassifyError::ShortTopic(topic.to_string()));
    }
    if segments[0] != root {
        return Err(ClassifyError::WrongRoot(topic.to_string()));
    }
    let device_id = segments[1];
    if !is_device_id(device_id) {
        return Err(ClassifyError::BadDeviceId(device_id.to_string()));
    }

    let kind = match segments[2] {
        "status" => {
            if segments.len() != 4 || segments[3] != "online" {
                return Err(ClassifyError::BadKey {
                    category: "status",
                    key: segments[3..].join("/"),
                });
            }
            match payload.trim() {
                "online" | "1" => EventKind::Status { online: true },
                "offline" | "0" => EventKind::Status { online: false },
                other => {
                    return Err(ClassifyError::BadPayload {
                        category: "status",
                        payload: other.to_string(),
                    })
                }
            }
        }
        "gpio" => {
            if segments.len() != 4 {
                return Err(ClassifyError::BadKey {
                    category: "gpio",
                    key: segments[3..].join("/"),
                });
            }
            let pin: u8 = segments[3].parse().map_err(|_| ClassifyError::BadKey {
                category: "gpio",
                key: segments[3].to_string(),
            })?;
            let raw: i64 = payload
                .trim()
                .parse()
                .map_err(|_| ClassifyError::BadPayload {
                    category: "gpio",
                    payload: payload.to_string(),
                })?;
            // Toute valeur non nulle est normalisée à 1 : certains firmwares
            // publient la valeur brute du registre plutôt qu'un niveau logique.
            let level = if raw == 0 { 0 } else { 1 };
            EventKind::Gpio { pin, level }
        }
        "sensor" => {
            // L'adresse est une clé opaque ; on rejoint les segments restants
            // pour tolérer des adresses hiérarchiques ("bme280/temp").
            let addr = segments[3..].join("/");
            if addr.is_empty() {
                return Err(ClassifyError::BadKey {
                    category: "sensor",
                    key: addr,
                });
            }
            let value: f64 = payload
                .trim()
                .parse()
                .map_err(|_| ClassifyError::BadPayload {
                    category: "sensor",
                    payload: payload.to_string(),
                })?;
            if !value.is_finite() {
                return Err(ClassifyError::BadPayload {
                    category: "sensor",
                    payload: payload.to_string(),
                });
            }
            EventKind::Sensor { addr, value }
        }
        other => return Err(ClassifyError::UnknownCategory(other.to_string())),
    };

    Ok(DeviceEvent {
        device_id: device_id.to_string(),
        kind,
    })
}
