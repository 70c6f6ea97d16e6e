/**
 * SNAPSHOT PERSISTENCE - Reprise d'état entre deux exécutions
 *
 * RÔLE :
 * Sérialise au même endroit l'état des devices et les clés d'accès des
 * applications, pour recharger le store et rétablir les sessions au
 * démarrage suivant.
 *
 * FONCTIONNEMENT :
 * - load() au démarrage, meilleur effort : fichier absent = état vide
 * - save() en écriture synchrone : les chemins de terminaison (SIGINT,
 *   SIGTERM, faute non gérée) doivent aboutir avant la fin du process
 * - Le hook de panique fait un flush d'urgence avec try_lock pour ne pas
 *   s'interbloquer sur un verrou tenu par le thread fautif
 */

use crate::models::DevicesMap;
use crate::sessions::SessionManager;
use crate::state::Shared;
use crate::store::DeviceStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Le contenu du fichier db.json : devices + clés d'accès par application.
/// Les poignées de souscription vivantes ne sont jamais persistées.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub devices: DevicesMap,
    pub applications: HashMap<String, String>,
}

/// Charge le snapshot au démarrage. Absence de fichier ou contenu illisible :
/// on démarre vide, c'est logué, jamais fatal.
pub fn load(path: &str) -> Snapshot {
    if !Path::new(path).exists() {
        println!("[persist] no snapshot at {}, starting empty", path);
        return Snapshot::default();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Snapshot>(&content) {
            Ok(snapshot) => {
                println!(
                    "[persist] loaded {} devices, {} applications from {}",
                    snapshot.devices.len(),
                    snapshot.applications.len(),
                    path
                );
                snapshot
            }
            Err(e) => {
                eprintln!("[persist] snapshot invalide: {}", e);
                Snapshot::default()
            }
        },
        Err(e) => {
            eprintln!("[persist] failed to read {}: {}", path, e);
            Snapshot::default()
        }
    }
}

/// Écriture synchrone du snapshot.
pub fn save(path: &str, snapshot: &Snapshot) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Capture l'état courant : copie du store + clés des sessions.
pub fn collect(store: &Shared<DeviceStore>, sessions: &SessionManager) -> Snapshot {
    Snapshot {
        devices: store.lock().export(),
        applications: sessions.credentials_snapshot(),
    }
}

/// Attend SIGINT/SIGTERM, sauvegarde, puis termine le process.
pub fn spawn_signal_flush(path: String, store: Shared<DeviceStore>, sessions: Arc<SessionManager>) {
    tokio::spawn(async move {
        wait_for_termination().await;
        let snapshot = collect(&store, &sessions);
        match save(&path, &snapshot) {
            Ok(()) => println!(
                "[persist] snapshot saved to {} ({} devices, {} applications)",
                path,
                snapshot.devices.len(),
                snapshot.applications.len()
            ),
            Err(e) => eprintln!("[persist] failed to save snapshot: {}", e),
        }
        std::process::exit(0);
    });
}

/// Flush d'urgence sur faute non gérée, avant que le process ne tombe.
pub fn install_panic_flush(path: String, store: Shared<DeviceStore>, sessions: Arc<SessionManager>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        eprintln!("[persist] unhandled fault, emergency flush to {}", path);
        let devices = store.try_lock().map(|s| s.export());
        let applications = sessions.try_credentials_snapshot();
        match (devices, applications) {
            (Some(devices), Some(applications)) => {
                if let Err(e) = save(&path, &Snapshot { devices, applications }) {
                    eprintln!("[persist] emergency flush failed: {}", e);
                }
            }
            // un verrou est tenu par le thread fautif : on ne risque pas
            // l'interblocage, le snapshot précédent reste sur disque
            _ => eprintln!("[persist] state locked during fault, emergency flush skipped"),
        }
        default_hook(info);
    }));
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                eprintln!("[persist] SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::models::Sample;
    use crate::registry::MetricRegistry;
    use crate::state::new_state;
    use time::OffsetDateTime;

    fn populated_store() -> Shared<DeviceStore> {
        let registry = Arc::new(MetricRegistry::from_config(&ServerConfig::default().metrics));
        let store = new_state(DeviceStore::new(registry));
        {
            let mut s = store.lock();
            s.upsert_device("app1", "sbox2");
            s.set_location("app1", "sbox2", 38.026, -78.501).unwrap();
            for value in [10.0, 20.0, 30.0] {
                s.append_sample(
                    "app1",
                    "sbox2",
                    "temperature",
                    Sample { ts: OffsetDateTime::UNIX_EPOCH, value },
                )
                .unwrap();
            }
        }
        store
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json").to_string_lossy().to_string();

        let store = populated_store();
        let mut applications = HashMap::new();
        applications.insert("app1".to_string(), "ttn-account-v2.secret".to_string());
        let snapshot = Snapshot { devices: store.lock().export(), applications };
        save(&path, &snapshot).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.applications.get("app1").map(String::as_str), Some("ttn-account-v2.secret"));
        let record = &loaded.devices["app1:sbox2"];
        assert_eq!(record.eui, "sbox2");
        assert_eq!((record.lat, record.lng), (Some(38.026), Some(-78.501)));
        let values: Vec<f64> = record.series["temperature"].iter().map(|s| s.value).collect();
        assert_eq!(values, [10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_load_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing.json").to_string_lossy().to_string();
        let snapshot = load(&path);
        assert!(snapshot.devices.is_empty());
        assert!(snapshot.applications.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "{ not json").unwrap();
        let snapshot = load(&path.to_string_lossy());
        assert!(snapshot.devices.is_empty());
    }
}
