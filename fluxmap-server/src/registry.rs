/**
 * METRIC REGISTRY - Catalogue des métriques observées
 *
 * RÔLE :
 * Déclare, à l'initialisation seulement, les métriques que le serveur extrait
 * des uplinks : clé stable, titre, bornes d'axe suggérées, fenêtre de
 * rétention, et un extracteur payload brut -> valeur numérique optionnelle.
 *
 * FONCTIONNEMENT :
 * - Construit depuis la config (un extracteur de champ par métrique)
 * - L'ordre de déclaration est préservé : le normaliseur et l'API /metrics
 *   itèrent toujours dans cet ordre
 * - Immutable après construction, aucun enregistrement à chaud
 */

use crate::config::MetricConf;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Échec d'extraction : le payload est malformé pour cette métrique.
/// Un champ simplement absent n'est pas une erreur (Ok(None)).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("metric '{metric}' extraction failed: {reason}")]
    Extraction { metric: String, reason: String },
}

/// Extracteur : payload brut -> valeur optionnelle, ou raison d'échec.
pub type Extractor = Box<dyn Fn(&Value) -> Result<Option<f64>, String> + Send + Sync>;

pub struct MetricDef {
    pub key: String,
    pub title: String,
    pub y_axis_label: String,
    pub min_y: f64,
    pub max_y: f64,
    pub window: usize,
    pub extractor: Extractor,
}

/// Définition d'une métrique telle qu'exposée au rendu (sans l'extracteur).
#[derive(Debug, Clone, Serialize)]
pub struct MetricView {
    pub key: String,
    pub title: String,
    pub y_axis_label: String,
    pub min_y: f64,
    pub max_y: f64,
    pub window: usize,
}

pub struct MetricRegistry {
    defs: Vec<MetricDef>,
    index: HashMap<String, usize>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self { defs: Vec::new(), index: HashMap::new() }
    }

    /// Construit le registre depuis les déclarations de la config.
    pub fn from_config(metrics: &[MetricConf]) -> Self {
        let mut registry = Self::new();
        for conf in metrics {
            registry.register(MetricDef {
                key: conf.key.clone(),
                title: conf.title.clone(),
                y_axis_label: conf.y_axis_label.clone(),
                min_y: conf.min_y,
                max_y: conf.max_y,
                window: conf.window,
                extractor: field_extractor(&conf.field),
            });
        }
        registry
    }

    /// Enregistre une métrique (initialisation seulement).
    /// Une clé en doublon est une erreur de config : ignorée, loguée.
    pub fn register(&mut self, def: MetricDef) {
        if self.index.contains_key(&def.key) {
            eprintln!("[registry] duplicate metric key '{}' ignored", def.key);
            return;
        }
        self.index.insert(def.key.clone(), self.defs.len());
        self.defs.push(def);
    }

    /// Applique l'extracteur de la métrique au payload.
    pub fn extract(&self, key: &str, payload: &Value) -> Result<Option<f64>, RegistryError> {
        let def = self.get(key).ok_or_else(|| RegistryError::UnknownMetric(key.to_string()))?;
        (def.extractor)(payload).map_err(|reason| RegistryError::Extraction {
            metric: key.to_string(),
            reason,
        })
    }

    pub fn get(&self, key: &str) -> Option<&MetricDef> {
        self.index.get(key).map(|&i| &self.defs[i])
    }

    pub fn window_of(&self, key: &str) -> Option<usize> {
        self.get(key).map(|d| d.window)
    }

    /// Itération dans l'ordre de déclaration, relançable à volonté.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDef> {
        self.defs.iter()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn views(&self) -> Vec<MetricView> {
        self.defs
            .iter()
            .map(|d| MetricView {
                key: d.key.clone(),
                title: d.title.clone(),
                y_axis_label: d.y_axis_label.clone(),
                min_y: d.min_y,
                max_y: d.max_y,
                window: d.window,
            })
            .collect()
    }
}

/// Extracteur standard : lit payload_fields.<field> dans le message brut.
/// Champ absent -> Ok(None) ; payload_fields manquant ou valeur non
/// numérique -> erreur d'extraction.
pub fn field_extractor(field: &str) -> Extractor {
    let field = field.to_string();
    Box::new(move |payload| {
        let fields = payload
            .get("payload_fields")
            .ok_or_else(|| "payload_fields missing".to_string())?;
        match fields.get(&field) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| format!("field '{}' is not numeric: {}", field, v)),
        }
    })
}
