/**
 * DEVICE SERIES STORE - État télémétrie de tous les devices
 *
 * RÔLE :
 * Table (app id, device id) -> séries temporelles par métrique + dernière
 * position connue. Seul propriétaire de l'état mutable télémétrie.
 *
 * FONCTIONNEMENT :
 * - Clés composites "app:dev" (le format du fichier snapshot)
 * - Chaque série est bornée par la fenêtre de sa métrique : éviction FIFO
 *   du plus ancien échantillon au dépassement
 * - Les devices ne sont jamais supprimés pendant la vie du process
 * - Rechargement en bloc depuis le snapshot au démarrage uniquement
 */

use crate::models::{device_key, split_device_key, DeviceInfo, DeviceRecord, DeviceView, DevicesMap, Sample};
use crate::registry::MetricRegistry;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

pub struct DeviceStore {
    registry: Arc<MetricRegistry>,
    devices: DevicesMap,
}

impl DeviceStore {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self { registry, devices: HashMap::new() }
    }

    /// Retourne le device, en le créant au besoin avec une série vide pour
    /// chaque métrique enregistrée et sans position. Idempotent.
    pub fn upsert_device(&mut self, app_id: &str, dev_id: &str) -> &mut DeviceRecord {
        let key = device_key(app_id, dev_id);
        let registry = &self.registry;
        self.devices.entry(key).or_insert_with(|| DeviceRecord {
            eui: dev_id.to_string(),
            lat: None,
            lng: None,
            series: registry.iter().map(|d| (d.key.clone(), Default::default())).collect(),
        })
    }

    /// Ajoute un échantillon en respectant la fenêtre de la métrique.
    pub fn append_sample(
        &mut self,
        app_id: &str,
        dev_id: &str,
        metric: &str,
        sample: Sample,
    ) -> Result<(), StoreError> {
        let window = self
            .registry
            .window_of(metric)
            .ok_or_else(|| StoreError::UnknownMetric(metric.to_string()))?;
        let key = device_key(app_id, dev_id);
        let record = self
            .devices
            .get_mut(&key)
            .ok_or(StoreError::UnknownDevice(key.clone()))?;

        let series = record.series.entry(metric.to_string()).or_default();
        series.push_back(sample);
        while series.len() > window {
            series.pop_front();
        }
        Ok(())
    }

    /// Écrase la position du device. Échoue si le device est inconnu.
    pub fn set_location(
        &mut self,
        app_id: &str,
        dev_id: &str,
        lat: f64,
        lng: f64,
    ) -> Result<(), StoreError> {
        let key = device_key(app_id, dev_id);
        let record = self
            .devices
            .get_mut(&key)
            .ok_or(StoreError::UnknownDevice(key.clone()))?;
        record.lat = Some(lat);
        record.lng = Some(lng);
        Ok(())
    }

    /// Bloc identité + position d'un device, pour les événements sortants.
    pub fn device_info(&self, app_id: &str, dev_id: &str) -> Option<DeviceInfo> {
        self.devices.get(&device_key(app_id, dev_id)).map(|r| DeviceInfo {
            app_id: app_id.to_string(),
            dev_id: dev_id.to_string(),
            eui: r.eui.clone(),
            lat: r.lat,
            lng: r.lng,
        })
    }

    /// Vue instantanée de tous les devices : identité, position, et pour
    /// chaque métrique enregistrée ses échantillons en ordre chronologique.
    /// Sans effet de bord.
    pub fn snapshot_view(&self) -> Vec<DeviceView> {
        self.devices
            .iter()
            .map(|(key, record)| {
                let (app_id, dev_id) = split_device_key(key).unwrap_or((key.as_str(), ""));
                let series = self
                    .registry
                    .iter()
                    .map(|def| {
                        let samples = record
                            .series
                            .get(&def.key)
                            .map(|s| s.iter().cloned().collect())
                            .unwrap_or_default();
                        (def.key.clone(), samples)
                    })
                    .collect();
                DeviceView {
                    app_id: app_id.to_string(),
                    dev_id: dev_id.to_string(),
                    eui: record.eui.clone(),
                    lat: record.lat,
                    lng: record.lng,
                    series,
                }
            })
            .collect()
    }

    /// Copie de la table pour la persistance.
    pub fn export(&self) -> DevicesMap {
        self.devices.clone()
    }

    /// Remplacement en bloc depuis le snapshot — démarrage uniquement.
    /// Les séries manquantes (métrique ajoutée depuis) sont créées vides,
    /// les séries trop longues (fenêtre réduite depuis) sont retaillées.
    pub fn load_from_snapshot(&mut self, mut devices: DevicesMap) {
        for record in devices.values_mut() {
            for def in self.registry.iter() {
                let series = record.series.entry(def.key.clone()).or_default();
                while series.len() > def.window {
                    series.pop_front();
                }
            }
        }
        let count = devices.len();
        self.devices = devices;
        if count > 0 {
            println!("[store] restored {} devices from snapshot", count);
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
