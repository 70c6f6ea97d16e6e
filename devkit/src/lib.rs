/*!
# Fluxmap DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le développement autour du serveur Fluxmap avec:
- Stubs MQTT pour tests sans broker
- Constructeurs de payloads uplink au format amont
- Harness de test pour scénarios d'ingestion
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{FluxmapMessageBuilder, MockMqttClient};
pub use test_utils::TestHarness;
