/**
 * FLUXMAP SERVER - Point d'entrée principal du serveur de carte capteurs
 *
 * RÔLE : Orchestration de tous les modules : config, registre de métriques,
 * store, sessions amont, normalisation, diffusion, persistance, HTTP.
 *
 * ARCHITECTURE : Ingestion MQTT par application + diffusion WebSocket +
 * API REST de lecture + snapshot JSON pour reprise après redémarrage.
 * UTILITÉ : Collecte les uplinks d'un réseau de capteurs et pousse les
 * mesures normalisées vers les observateurs en temps réel.
 */

mod config;
mod fanout;
mod http;
mod models;
mod normalizer;
mod persist;
mod registry;
mod sessions;
mod state;
mod store;
mod uplink;

use crate::fanout::Fanout;
use crate::normalizer::Normalizer;
use crate::registry::MetricRegistry;
use crate::sessions::SessionManager;
use crate::state::new_state;
use crate::store::DeviceStore;
use crate::uplink::MqttUplink;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let cfg = Arc::new(config::load_config().await);

    // registre de métriques, figé après construction
    let metric_registry = Arc::new(MetricRegistry::from_config(&cfg.metrics));
    println!("[server] registered {} metrics", metric_registry.len());

    // store des devices, rechargé depuis le snapshot
    let store = new_state(DeviceStore::new(metric_registry.clone()));
    let snapshot = persist::load(&cfg.snapshot_path);
    store.lock().load_from_snapshot(snapshot.devices);

    // chaîne ingestion : transport -> sessions -> normaliseur -> diffusion
    let fanout = Fanout::new(256);
    let normalizer = Arc::new(Normalizer::new(
        metric_registry.clone(),
        store.clone(),
        fanout.clone(),
        cfg.unit_corrections.clone(),
        cfg.locations.clone(),
    ));
    let transport = Arc::new(MqttUplink::new(&cfg.mqtt, &cfg.uplink_topic));
    let sessions = Arc::new(SessionManager::new(transport, normalizer));

    // rétablit les sessions du snapshot (échecs logués, jamais bloquants)
    sessions.restore(snapshot.applications);

    // persistance sur terminaison normale, signal, ou faute non gérée
    persist::install_panic_flush(cfg.snapshot_path.clone(), store.clone(), sessions.clone());
    persist::spawn_signal_flush(cfg.snapshot_path.clone(), store.clone(), sessions.clone());

    // fabrique l'état unique pour Axum
    let app_state = http::AppState {
        store,
        sessions,
        fanout,
        registry: metric_registry,
        cfg: cfg.clone(),
    };

    // HTTP + WebSocket observateurs
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
    println!("[server] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
