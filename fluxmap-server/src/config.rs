use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub title: String,
    pub mqtt: MqttConf,
    pub http: HttpConf,
    /// Gabarit du topic uplink amont : {app} est remplacé par l'app id,
    /// le segment '+' marque la position du device id.
    pub uplink_topic: String,
    pub snapshot_path: String,
    /// Métriques observées, dans l'ordre de déclaration.
    pub metrics: Vec<MetricConf>,
    /// Corrections d'unité appliquées aux champs du payload avant extraction.
    pub unit_corrections: Vec<UnitCorrection>,
    /// Table device id -> coordonnées, spécifique au déploiement.
    pub locations: HashMap<String, GeoPoint>,
    pub map_center: GeoPoint,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MetricConf {
    pub key: String,
    pub title: String,
    pub y_axis_label: String,
    /// Bornes suggérées pour l'axe Y (indicatives, jamais imposées aux données)
    pub min_y: f64,
    pub max_y: f64,
    /// Nombre max d'échantillons retenus par device
    pub window: usize,
    /// Champ de payload_fields lu par l'extracteur
    pub field: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UnitCorrection {
    pub field: String,
    pub factor: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let metric = |key: &str, title: &str, label: &str, max_y: f64, field: &str| MetricConf {
            key: key.into(),
            title: title.into(),
            y_axis_label: label.into(),
            min_y: 0.0,
            max_y,
            window: 30,
            field: field.into(),
        };

        // Coordonnées fixes du déploiement (les nodes n'envoient pas leur position)
        let locations: HashMap<String, GeoPoint> = [
            ("sbox2", 38.026, -78.501),
            ("sbox3", 38.019, -78.473),
            ("sbox4", 38.047, -78.483),
            ("sbox5", 38.035, -78.491),
            ("sbox6", 38.027, -78.515),
            ("sbox7", 38.025, -78.516),
            ("sbox8", 38.029, -78.484),
            ("sbox9", 38.025, -78.469),
            ("sbox10", 38.031, -78.479),
            ("sbox11", 38.029, -78.484),
        ]
        .into_iter()
        .map(|(id, lat, lng)| (id.to_string(), GeoPoint { lat, lng }))
        .collect();

        Self {
            title: "Smart Cville AQ sensor network".into(),
            mqtt: MqttConf { host: "localhost".into(), port: 1883 },
            http: HttpConf { port: 7270 },
            uplink_topic: "{app}/devices/+/up".into(),
            snapshot_path: "db.json".into(),
            metrics: vec![
                metric("temperature", "Temperature", "Temperature (°C)", 50.0, "temp"),
                metric("co2", "CO2", "CO2 (ppm)", 5000.0, "co2"),
                metric("pm25", "Particulate Matter (2.5)", "PM (2.5)", 100.0, "pm25"),
                metric("pm10", "Particulate Matter (10)", "PM (10)", 100.0, "pm10"),
                metric("humidity", "Humidity", "Humidity (%)", 100.0, "humidity"),
            ],
            // côté node on a fait /100, donc *100 ici pour normaliser
            unit_corrections: vec![UnitCorrection { field: "analog_in_1".into(), factor: 100.0 }],
            locations,
            map_center: GeoPoint { lat: 38.029341, lng: -78.476682 },
        }
    }
}

pub async fn load_config() -> ServerConfig {
    let path = std::env::var("FLUXMAP_CONFIG").unwrap_or_else(|_| "fluxmap.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() { return ServerConfig::default(); }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[server] config invalide: {e}");
            ServerConfig::default()
        })
    } else {
        eprintln!("[server] pas de fluxmap.yaml, usage config par défaut");
        ServerConfig::default()
    }
}
