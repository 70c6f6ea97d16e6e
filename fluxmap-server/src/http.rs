/**
 * API & CANAL OBSERVATEURS - Façade HTTP/WebSocket du serveur
 *
 * RÔLE :
 * Expose la vue instantanée (devices, métriques, config d'affichage) en
 * lecture seule pour le collaborateur de rendu, et le canal WebSocket
 * bidirectionnel des observateurs temps réel.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, routes : /health, /devices, /metrics, /config, /ws
 * - Chaque socket /ws reçoit le flux broadcast complet et peut émettre des
 *   commandes : connect-application, location-change
 * - Le résultat d'un connect-application revient au seul socket demandeur ;
 *   les location-change acceptés sont diffusés à tout le monde
 * - Pas d'authentification des observateurs : les viewers sont anonymes
 */

use crate::config::ServerConfig;
use crate::fanout::Fanout;
use crate::models::DeviceView;
use crate::registry::{MetricRegistry, MetricView};
use crate::sessions::SessionManager;
use crate::state::Shared;
use crate::store::DeviceStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Clone)]
pub struct AppState {
    pub store: Shared<DeviceStore>,
    pub sessions: Arc<SessionManager>,
    pub fanout: Fanout,
    pub registry: Arc<MetricRegistry>,
    pub cfg: Arc<ServerConfig>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/devices", get(get_devices))
        .route("/metrics", get(get_metrics))
        .route("/config", get(get_config))
        .route("/ws", get(ws_upgrade))
        .with_state(app_state)
}

// GET /devices (vue instantanée complète)
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(app.store.lock().snapshot_view())
}

// GET /metrics (définitions du registre)
async fn get_metrics(State(app): State<AppState>) -> Json<Vec<MetricView>> {
    Json(app.registry.views())
}

// GET /config (titre + centre de carte pour le rendu)
async fn get_config(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "title": app.cfg.title,
        "map_center": app.cfg.map_center,
    }))
}

// GET /ws (canal observateur bidirectionnel)
async fn ws_upgrade(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_observer(socket, app))
}

/// Commandes entrantes d'un observateur, étiquetées par "command".
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
enum ObserverCommand {
    ConnectApplication { app_id: String, access_key: String },
    LocationChange { app_id: String, dev_id: String, lat: f64, lng: f64 },
}

/// Réponses adressées au seul socket demandeur.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ObserverReply {
    Connected { app_id: String },
    ConnectFailed { app_id: String, error: String },
}

async fn handle_observer(socket: WebSocket, app: AppState) {
    println!("[fanout] observer connected ({} active)", app.fanout.observer_count() + 1);
    let (mut sender, mut receiver) = socket.split();
    let mut events = app.fanout.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(16);

    // Sortant : flux broadcast + réponses directes de ce socket
    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        eprintln!("[fanout] observer lagging, {} events skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Entrant : commandes de l'observateur
    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else { continue };
        match serde_json::from_str::<ObserverCommand>(&text) {
            Ok(ObserverCommand::ConnectApplication { app_id, access_key }) => {
                println!("[fanout] observer asks to connect application {}", app_id);
                // en tâche séparée : un handshake qui traîne ne bloque que
                // cette application, pas les commandes suivantes du socket
                let sessions = app.sessions.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let reply = match sessions.connect(&app_id, &access_key).await {
                        Ok(()) => ObserverReply::Connected { app_id },
                        Err(e) => ObserverReply::ConnectFailed { app_id, error: e.to_string() },
                    };
                    if let Ok(json) = serde_json::to_string(&reply) {
                        let _ = reply_tx.send(json).await;
                    }
                });
            }
            Ok(ObserverCommand::LocationChange { app_id, dev_id, lat, lng }) => {
                app.fanout.relocate(&app.store, &app_id, &dev_id, lat, lng);
            }
            Err(e) => eprintln!("[fanout] invalid observer command: {} ({})", e, text),
        }
    }

    send_task.abort();
    println!("[fanout] observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_command_wire_format() {
        let cmd: ObserverCommand = serde_json::from_str(
            r#"{"command":"connect-application","app_id":"app1","access_key":"ttn-account-v2.secret"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ObserverCommand::ConnectApplication { ref app_id, .. } if app_id == "app1"));

        let cmd: ObserverCommand = serde_json::from_str(
            r#"{"command":"location-change","app_id":"app1","dev_id":"dev9","lat":38.0,"lng":-78.5}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ObserverCommand::LocationChange { lat, .. } if lat == 38.0));
    }

    #[test]
    fn test_observer_reply_wire_format() {
        let ok = serde_json::to_value(&ObserverReply::Connected { app_id: "app1".into() }).unwrap();
        assert_eq!(ok["event"], "connected");
        let failed = serde_json::to_value(&ObserverReply::ConnectFailed {
            app_id: "app1".into(),
            error: "access key rejected by the upstream broker".into(),
        })
        .unwrap();
        assert_eq!(failed["event"], "connect-failed");
        assert_eq!(failed["app_id"], "app1");
    }
}
