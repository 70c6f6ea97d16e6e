/**
 * UPLINK NORMALIZER - Du message brut aux événements typés
 *
 * RÔLE :
 * Invoqué une fois par uplink entrant : résout l'identité du device,
 * applique les corrections d'unité et la table de positions, extrait chaque
 * métrique enregistrée, alimente le store et diffuse les value-change.
 *
 * FONCTIONNEMENT :
 * - Les métriques sont traitées dans l'ordre de déclaration du registre
 * - Champ absent : métrique ignorée pour ce message
 * - Extraction en erreur : loguée avec la clé et le payload, les métriques
 *   restantes de CE message sont abandonnées ; les échantillons déjà
 *   ajoutés et leurs événements restent acquis
 * - Device absent de la table de positions : position inchangée, aucun
 *   placement par défaut
 */

use crate::config::{GeoPoint, UnitCorrection};
use crate::fanout::Fanout;
use crate::registry::{MetricRegistry, RegistryError};
use crate::models::Sample;
use crate::state::Shared;
use crate::store::{DeviceStore, StoreError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extraction(#[from] RegistryError),
}

pub struct Normalizer {
    registry: Arc<MetricRegistry>,
    store: Shared<DeviceStore>,
    fanout: Fanout,
    corrections: Vec<UnitCorrection>,
    locations: HashMap<String, GeoPoint>,
}

impl Normalizer {
    pub fn new(
        registry: Arc<MetricRegistry>,
        store: Shared<DeviceStore>,
        fanout: Fanout,
        corrections: Vec<UnitCorrection>,
        locations: HashMap<String, GeoPoint>,
    ) -> Self {
        Self { registry, store, fanout, corrections, locations }
    }

    /// Traite un uplink complet : mutations du store puis diffusion, un
    /// événement par métrique extraite, dans l'ordre d'enregistrement.
    pub fn handle_uplink(
        &self,
        app_id: &str,
        dev_id: &str,
        mut payload: Value,
    ) -> Result<(), NormalizeError> {
        apply_corrections(&mut payload, &self.corrections);
        let ts = observation_time(&payload, app_id, dev_id);

        let mut store = self.store.lock();
        store.upsert_device(app_id, dev_id);

        if let Some(point) = self.locations.get(dev_id) {
            store.set_location(app_id, dev_id, point.lat, point.lng)?;
        }

        for def in self.registry.iter() {
            match self.registry.extract(&def.key, &payload) {
                Ok(None) => {}
                Ok(Some(value)) => {
                    store.append_sample(app_id, dev_id, &def.key, Sample { ts, value })?;
                    if let Some(device) = store.device_info(app_id, dev_id) {
                        self.fanout.emit_change(&def.key, device, ts, value);
                    }
                }
                Err(e) => {
                    eprintln!(
                        "[normalizer] [{}] uplink from {}: {} (payload: {})",
                        app_id, dev_id, e, payload
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Corrections fixes, indépendantes du device, appliquées avant extraction.
/// Un champ absent ou non numérique est laissé tel quel.
fn apply_corrections(payload: &mut Value, corrections: &[UnitCorrection]) {
    for correction in corrections {
        let Some(field) = payload
            .get_mut("payload_fields")
            .and_then(|fields| fields.get_mut(&correction.field))
        else {
            continue;
        };
        if let Some(v) = field.as_f64() {
            if let Some(n) = serde_json::Number::from_f64(v * correction.factor) {
                *field = Value::Number(n);
            }
        }
    }
}

/// Horodatage de l'observation amont (metadata.time, RFC 3339).
/// Absent ou illisible : l'heure d'ingestion fait foi, c'est logué.
fn observation_time(payload: &Value, app_id: &str, dev_id: &str) -> OffsetDateTime {
    let parsed = payload
        .get("metadata")
        .and_then(|m| m.get("time"))
        .and_then(|t| t.as_str())
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());
    match parsed {
        Some(ts) => ts,
        None => {
            eprintln!("[normalizer] [{}] uplink from {} without metadata.time, using ingest time", app_id, dev_id);
            OffsetDateTime::now_utc()
        }
    }
}
