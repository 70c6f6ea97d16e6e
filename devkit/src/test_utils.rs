/*!
Test Harness pour scénarios d'ingestion Fluxmap

Facilite l'écriture de tests autour du serveur avec:
- Setup automatique du mock MQTT
- Envoi d'uplinks capteur prêts à l'emploi
- Attente et assertions sur les messages échangés
*/

use crate::mqtt_stub::{FluxmapMessageBuilder, MockMqttClient};
use serde_json::Value;
use std::time::Duration;
use anyhow::Result;

/// Harness de test complet pour scénarios Fluxmap
pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        Self {
            mqtt_client: MockMqttClient::new(),
        }
    }

    /// Simule un uplink entrant d'un device sur le topic de son application
    pub async fn send_uplink(&self, app_id: &str, dev_id: &str, fields: Value) -> Result<()> {
        let topic = FluxmapMessageBuilder::uplink_topic(app_id, dev_id);
        let payload = serde_json::to_vec(&FluxmapMessageBuilder::uplink(fields))?;
        self.mqtt_client.inject(topic, payload).await?;
        log::info!("📨 Sent test uplink from {}:{}", app_id, dev_id);
        Ok(())
    }

    /// Simule un uplink qualité d'air complet
    pub async fn send_air_quality(
        &self,
        app_id: &str,
        dev_id: &str,
        temp: f64,
        co2: f64,
        humidity: f64,
    ) -> Result<()> {
        let fields = FluxmapMessageBuilder::air_quality_fields(temp, co2, 12.0, 18.0, humidity);
        self.send_uplink(app_id, dev_id, fields).await
    }

    /// Attend et vérifie qu'un message a été publié sur un topic
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.mqtt_client.last_json_on::<Value>(topic)? {
                log::info!("✅ Received expected message on {}", topic);
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        log::warn!("⏰ Timeout waiting for message on {}", topic);
        Ok(None)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_records_uplinks() {
        let harness = TestHarness::new();
        let mut receiver = harness.mqtt_client.incoming_receiver();

        harness
            .send_air_quality("app1", "sbox2", 21.5, 410.0, 55.0)
            .await
            .unwrap();

        let message = receiver.recv().await.unwrap();
        assert_eq!(message.topic, "app1/devices/sbox2/up");
        let payload: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload["payload_fields"]["temp"], 21.5);
        assert!(payload["metadata"]["time"].is_string());
    }

    #[tokio::test]
    async fn test_wait_for_message_times_out() {
        let harness = TestHarness::new();
        let found = harness.wait_for_message("nothing/here", 120).await.unwrap();
        assert!(found.is_none());
    }
}
