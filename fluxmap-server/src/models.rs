use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

/// Une mesure horodatée issue d'un uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub value: f64,
}

/// État d'un device : identité, position, et une série bornée par métrique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub eui: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub series: HashMap<String, VecDeque<Sample>>,
}

pub type DevicesMap = HashMap<String, DeviceRecord>;

/// Clé composite "app:dev" utilisée par le store et le fichier snapshot.
pub fn device_key(app_id: &str, dev_id: &str) -> String {
    format!("{}:{}", app_id, dev_id)
}

/// Découpe une clé composite en (app_id, dev_id).
pub fn split_device_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Bloc identité + position repris dans chaque événement sortant.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub app_id: String,
    pub dev_id: String,
    pub eui: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// Vue instantanée d'un device pour l'API /devices.
#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub app_id: String,
    pub dev_id: String,
    pub eui: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub series: HashMap<String, Vec<Sample>>,
}
