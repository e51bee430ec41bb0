/*!
# Saphir DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement autour du kernel Saphir avec:
- Transport mock conforme au contrat `Transport`, sans broker MQTT
- Builders de messages conformes à la grammaire topic des devices
- Harness de test câblant store + dispatcher + transport mock
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockTransport, SaphirMessageBuilder};
pub use test_utils::TestHarness;
