/*!
Mock MQTT Client pour développement sans broker

Permet de développer et tester l'ingestion Fluxmap sans démarrer un broker
MQTT réel. Enregistre les publications et souscriptions, et permet
d'injecter des uplinks comme s'ils arrivaient du réseau amont.
*/

use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use anyhow::Result;

/// Un message MQTT tel que vu par le mock (publié ou injecté).
#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    /// Décode le payload en JSON (les uplinks Fluxmap sont toujours du JSON).
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Mock MQTT Client, signatures compatibles avec rumqttc::AsyncClient
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Branche le flux des messages injectés (côté consommateur du test).
    pub fn incoming_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.incoming.lock().unwrap() = Some(sender);
        receiver
    }

    /// Enregistre une publication (signature compatible AsyncClient).
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage { topic: topic.into(), payload: payload.into(), qos, retain };
        log::info!("📤 [MOCK] {} bytes published on {}", message.payload.len(), message.topic);
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    /// Enregistre une souscription (signature compatible AsyncClient).
    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::info!("📥 [MOCK] subscribed to {}", topic);
        self.subscriptions.lock().unwrap().push(topic);
        Ok(())
    }

    /// Injecte un message entrant, comme s'il venait du broker amont.
    pub async fn inject<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        log::info!("📨 [MOCK] injected incoming on {}", message.topic);
        if let Some(sender) = self.incoming.lock().unwrap().as_ref() {
            sender.send(message).map_err(|e| anyhow::anyhow!("inject failed: {}", e))?;
        }
        Ok(())
    }

    /// Toutes les publications enregistrées, dans l'ordre.
    pub fn published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Topics souscrits, dans l'ordre.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Publications sur un topic exact.
    pub fn published_on(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Uplinks publiés pour une application, tous devices confondus.
    pub fn uplinks_for(&self, app_id: &str) -> Vec<MockMessage> {
        let prefix = format!("{}/devices/", app_id);
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic.starts_with(&prefix) && msg.topic.ends_with("/up"))
            .cloned()
            .collect()
    }

    /// Dernier message JSON publié sur un topic, décodé.
    pub fn last_json_on<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.published_on(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    /// Oublie tout l'historique enregistré.
    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

/// Helper pour construire des messages au format de l'amont Fluxmap
pub struct FluxmapMessageBuilder;

impl FluxmapMessageBuilder {
    /// Topic uplink d'un device dans le schéma amont v2
    pub fn uplink_topic(app_id: &str, dev_id: &str) -> String {
        format!("{}/devices/{}/up", app_id, dev_id)
    }

    /// Enveloppe un ensemble de payload_fields dans un uplink daté maintenant
    pub fn uplink(fields: Value) -> Value {
        Self::uplink_at(fields, &chrono::Utc::now().to_rfc3339())
    }

    /// Enveloppe un ensemble de payload_fields dans un uplink daté explicitement
    pub fn uplink_at(fields: Value, time: &str) -> Value {
        serde_json::json!({
            "payload_fields": fields,
            "metadata": {
                "time": time
            }
        })
    }

    /// payload_fields complet d'un capteur qualité d'air
    pub fn air_quality_fields(temp: f64, co2: f64, pm25: f64, pm10: f64, humidity: f64) -> Value {
        serde_json::json!({
            "temp": temp,
            "co2": co2,
            "pm25": pm25,
            "pm10": pm10,
            "humidity": humidity
        })
    }

    /// Commande observateur connect-application
    pub fn connect_application(app_id: &str, access_key: &str) -> Value {
        serde_json::json!({
            "command": "connect-application",
            "app_id": app_id,
            "access_key": access_key
        })
    }

    /// Commande observateur location-change
    pub fn location_change(app_id: &str, dev_id: &str, lat: f64, lng: f64) -> Value {
        serde_json::json!({
            "command": "location-change",
            "app_id": app_id,
            "dev_id": dev_id,
            "lat": lat,
            "lng": lng
        })
    }
}
