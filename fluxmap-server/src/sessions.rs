/**
 * SESSION MANAGER - Une souscription amont vivante par application, au plus
 *
 * RÔLE :
 * Ouvre, remplace et démonte les souscriptions amont. Garantit l'invariant
 * central : jamais deux souscriptions vivantes pour le même app id.
 *
 * FONCTIONNEMENT :
 * - connect() remplace-sans-fusionner : l'ancienne session est démontée
 *   (poignée fermée, task consommatrice annulée) avant d'ouvrir la nouvelle
 * - Chaque session porte un id de génération (uuid) : la task d'une session
 *   remplacée ne peut jamais toucher l'entrée de sa remplaçante
 * - Clé refusée -> session retirée ; une reconnexion avec une autre clé
 *   repart de zéro sans nettoyage manuel
 * - Erreur de transport avant handshake -> entrée conservée Disconnected,
 *   poignée fermée, pas de retry automatique
 * - Après handshake, les uplinks sont remis au normaliseur dans l'ordre
 *   d'arrivée (une seule task consommatrice par session)
 */

use crate::normalizer::Normalizer;
use crate::state::{new_state, Shared};
use crate::uplink::{UplinkError, UplinkEvent, UplinkTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("access key rejected by the upstream broker")]
    AuthRejected,
    #[error("upstream connection failed: {0}")]
    Transport(String),
    #[error("connect superseded by a newer request")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

pub struct AppSession {
    pub id: Uuid,
    pub access_key: String,
    pub state: SessionState,
    handle: Box<dyn crate::uplink::UplinkHandle>,
    task: Option<JoinHandle<()>>,
}

impl AppSession {
    fn teardown(self) {
        self.handle.close();
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

pub type SessionsMap = HashMap<String, AppSession>;

pub struct SessionManager {
    sessions: Shared<SessionsMap>,
    transport: Arc<dyn UplinkTransport>,
    normalizer: Arc<Normalizer>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn UplinkTransport>, normalizer: Arc<Normalizer>) -> Self {
        Self { sessions: new_state(HashMap::new()), transport, normalizer }
    }

    /// Connecte une application à l'amont. Toute session existante pour cet
    /// app id est démontée d'abord, même si son handshake est encore en
    /// cours. Résout quand le handshake aboutit ou échoue.
    pub async fn connect(&self, app_id: &str, access_key: &str) -> Result<(), SessionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let id = Uuid::new_v4();

        {
            let mut map = self.sessions.lock();
            if let Some(old) = map.remove(app_id) {
                println!("[sessions] [{}] replacing existing session", app_id);
                old.teardown();
            }

            println!("[sessions] [{}] connecting upstream", app_id);
            let (handle, events) = self.transport.open(app_id, access_key);
            let task = tokio::spawn(consume_events(
                self.sessions.clone(),
                self.normalizer.clone(),
                app_id.to_string(),
                id,
                events,
                ready_tx,
            ));
            map.insert(
                app_id.to_string(),
                AppSession {
                    id,
                    access_key: access_key.to_string(),
                    state: SessionState::Connecting,
                    handle,
                    task: Some(task),
                },
            );
        }

        match ready_rx.await {
            Ok(result) => result,
            // la task a été annulée : une connexion plus récente a pris la place
            Err(_) => Err(SessionError::Superseded),
        }
    }

    /// État courant d'une session, si elle existe.
    pub fn state_of(&self, app_id: &str) -> Option<SessionState> {
        self.sessions.lock().get(app_id).map(|s| s.state)
    }

    /// app id -> clé d'accès, pour le snapshot de terminaison.
    pub fn credentials_snapshot(&self) -> HashMap<String, String> {
        self.sessions
            .lock()
            .iter()
            .map(|(app_id, s)| (app_id.clone(), s.access_key.clone()))
            .collect()
    }

    /// Variante sans blocage pour le flush d'urgence (hook de panique).
    pub fn try_credentials_snapshot(&self) -> Option<HashMap<String, String>> {
        self.sessions.try_lock().map(|map| {
            map.iter().map(|(app_id, s)| (app_id.clone(), s.access_key.clone())).collect()
        })
    }

    /// Rétablit les sessions enregistrées dans le snapshot au démarrage.
    /// Chaque échec est logué, jamais bloquant pour les autres applications.
    pub fn restore(self: &Arc<Self>, applications: HashMap<String, String>) {
        for (app_id, access_key) in applications {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.connect(&app_id, &access_key).await {
                    eprintln!("[sessions] [{}] restore failed: {}", app_id, e);
                }
            });
        }
    }
}

/// Task consommatrice : pilote le flux d'événements d'une session, du
/// handshake jusqu'à la fermeture. Ne touche l'entrée partagée que si l'id
/// de génération correspond encore.
async fn consume_events(
    sessions: Shared<SessionsMap>,
    normalizer: Arc<Normalizer>,
    app_id: String,
    id: Uuid,
    mut events: mpsc::Receiver<UplinkEvent>,
    ready_tx: oneshot::Sender<Result<(), SessionError>>,
) {
    let mut ready = Some(ready_tx);
    while let Some(event) = events.recv().await {
        match event {
            UplinkEvent::Connected => {
                set_state_if_current(&sessions, &app_id, id, SessionState::Connected);
                if let Some(tx) = ready.take() {
                    println!("[sessions] [{}] connected upstream", app_id);
                    let _ = tx.send(Ok(()));
                }
            }
            UplinkEvent::Uplink { dev_id, payload } => {
                if let Err(e) = normalizer.handle_uplink(&app_id, &dev_id, payload) {
                    eprintln!("[sessions] [{}] uplink from {} aborted: {}", app_id, dev_id, e);
                }
            }
            UplinkEvent::Error(UplinkError::AuthRejected) => {
                eprintln!("[sessions] [{}] access key is not correct", app_id);
                set_state_if_current(&sessions, &app_id, id, SessionState::Failed);
                remove_if_current(&sessions, &app_id, id);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(SessionError::AuthRejected));
                }
                break;
            }
            UplinkEvent::Error(UplinkError::Transport(reason)) => {
                if let Some(tx) = ready.take() {
                    eprintln!("[sessions] [{}] could not connect upstream: {}", app_id, reason);
                    // pas de retry automatique : l'entrée reste Disconnected,
                    // un nouveau connect() repartira proprement
                    set_state_if_current(&sessions, &app_id, id, SessionState::Disconnected);
                    close_if_current(&sessions, &app_id, id);
                    let _ = tx.send(Err(SessionError::Transport(reason)));
                    break;
                }
                eprintln!("[sessions] [{}] upstream error, transport will retry: {}", app_id, reason);
            }
        }
    }
}

fn set_state_if_current(sessions: &Shared<SessionsMap>, app_id: &str, id: Uuid, state: SessionState) {
    let mut map = sessions.lock();
    if let Some(s) = map.get_mut(app_id) {
        if s.id == id {
            s.state = state;
        }
    }
}

fn close_if_current(sessions: &Shared<SessionsMap>, app_id: &str, id: Uuid) {
    let map = sessions.lock();
    if let Some(s) = map.get(app_id) {
        if s.id == id {
            s.handle.close();
        }
    }
}

fn remove_if_current(sessions: &Shared<SessionsMap>, app_id: &str, id: Uuid) {
    let mut map = sessions.lock();
    let current = map.get(app_id).map(|s| s.id == id).unwrap_or(false);
    if current {
        if let Some(s) = map.remove(app_id) {
            // la task consommatrice, c'est nous : elle sort de sa boucle seule
            s.handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::fanout::Fanout;
    use crate::registry::MetricRegistry;
    use crate::store::DeviceStore;
    use crate::uplink::UplinkHandle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{sleep, Duration};

    struct StubHandle {
        closed: Arc<AtomicBool>,
    }

    impl UplinkHandle for StubHandle {
        fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    struct OpenedSession {
        access_key: String,
        closed: Arc<AtomicBool>,
        tx: mpsc::Sender<UplinkEvent>,
    }

    /// Transport bouchonné : chaque open() est enregistré, le test pousse
    /// les événements de handshake lui-même.
    #[derive(Default)]
    struct StubTransport {
        opened: Mutex<Vec<Arc<OpenedSession>>>,
    }

    impl StubTransport {
        async fn opened_session(&self, n: usize) -> Arc<OpenedSession> {
            for _ in 0..200 {
                if let Some(o) = self.opened.lock().get(n) {
                    return o.clone();
                }
                sleep(Duration::from_millis(5)).await;
            }
            panic!("session {} never opened", n);
        }
    }

    impl UplinkTransport for StubTransport {
        fn open(
            &self,
            _app_id: &str,
            access_key: &str,
        ) -> (Box<dyn UplinkHandle>, mpsc::Receiver<UplinkEvent>) {
            let (tx, rx) = mpsc::channel(16);
            let closed = Arc::new(AtomicBool::new(false));
            self.opened.lock().push(Arc::new(OpenedSession {
                access_key: access_key.to_string(),
                closed: closed.clone(),
                tx,
            }));
            (Box::new(StubHandle { closed }), rx)
        }
    }

    fn manager() -> (Arc<SessionManager>, Arc<StubTransport>, Shared<DeviceStore>) {
        let registry = Arc::new(MetricRegistry::from_config(&ServerConfig::default().metrics));
        let store = new_state(DeviceStore::new(registry.clone()));
        let fanout = Fanout::new(16);
        let normalizer =
            Arc::new(Normalizer::new(registry, store.clone(), fanout, Vec::new(), HashMap::new()));
        let transport = Arc::new(StubTransport::default());
        (Arc::new(SessionManager::new(transport.clone(), normalizer)), transport, store)
    }

    #[tokio::test]
    async fn test_connect_resolves_on_handshake() {
        let (manager, transport, _store) = manager();
        let m = manager.clone();
        let join = tokio::spawn(async move { m.connect("app1", "secret").await });

        let opened = transport.opened_session(0).await;
        assert_eq!(opened.access_key, "secret");
        assert_eq!(manager.state_of("app1"), Some(SessionState::Connecting));

        opened.tx.send(UplinkEvent::Connected).await.unwrap();
        join.await.unwrap().unwrap();
        assert_eq!(manager.state_of("app1"), Some(SessionState::Connected));
    }

    #[tokio::test]
    async fn test_bad_key_discards_session_then_good_key_succeeds() {
        let (manager, transport, _store) = manager();

        let m = manager.clone();
        let join = tokio::spawn(async move { m.connect("app1", "badkey").await });
        let first = transport.opened_session(0).await;
        first.tx.send(UplinkEvent::Error(UplinkError::AuthRejected)).await.unwrap();
        assert!(matches!(join.await.unwrap(), Err(SessionError::AuthRejected)));
        // la session condamnée a disparu, aucun nettoyage manuel nécessaire
        assert_eq!(manager.state_of("app1"), None);

        let m = manager.clone();
        let join = tokio::spawn(async move { m.connect("app1", "goodkey").await });
        let second = transport.opened_session(1).await;
        second.tx.send(UplinkEvent::Connected).await.unwrap();
        join.await.unwrap().unwrap();
        assert_eq!(manager.state_of("app1"), Some(SessionState::Connected));
        assert_eq!(manager.credentials_snapshot().get("app1"), Some(&"goodkey".to_string()));
    }

    #[tokio::test]
    async fn test_replace_before_resolve_keeps_exactly_one_session() {
        let (manager, transport, _store) = manager();

        let m = manager.clone();
        let first_join = tokio::spawn(async move { m.connect("app1", "c1").await });
        let first = transport.opened_session(0).await;

        // second connect pour le même app id avant la fin du premier handshake
        let m = manager.clone();
        let second_join = tokio::spawn(async move { m.connect("app1", "c2").await });
        let second = transport.opened_session(1).await;

        // la première souscription est fermée, le premier connect est supplanté
        assert!(matches!(first_join.await.unwrap(), Err(SessionError::Superseded)));
        assert!(first.closed.load(Ordering::Relaxed));

        second.tx.send(UplinkEvent::Connected).await.unwrap();
        second_join.await.unwrap().unwrap();

        let creds = manager.credentials_snapshot();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds.get("app1"), Some(&"c2".to_string()));
        assert!(!second.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_transport_error_leaves_session_disconnected() {
        let (manager, transport, _store) = manager();
        let m = manager.clone();
        let join = tokio::spawn(async move { m.connect("app1", "key").await });
        let opened = transport.opened_session(0).await;
        opened
            .tx
            .send(UplinkEvent::Error(UplinkError::Transport("broker unreachable".into())))
            .await
            .unwrap();
        assert!(matches!(join.await.unwrap(), Err(SessionError::Transport(_))));
        // l'entrée reste, éligible à un futur connect(), la poignée est fermée
        assert_eq!(manager.state_of("app1"), Some(SessionState::Disconnected));
        assert!(opened.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_uplinks_reach_the_store_in_order() {
        let (manager, transport, store) = manager();
        let m = manager.clone();
        let join = tokio::spawn(async move { m.connect("app1", "key").await });
        let opened = transport.opened_session(0).await;
        opened.tx.send(UplinkEvent::Connected).await.unwrap();
        join.await.unwrap().unwrap();

        for temp in [10, 20, 30] {
            opened
                .tx
                .send(UplinkEvent::Uplink {
                    dev_id: "sbox2".into(),
                    payload: serde_json::json!({
                        "payload_fields": { "temp": temp },
                        "metadata": { "time": "2026-08-04T12:00:00Z" }
                    }),
                })
                .await
                .unwrap();
        }
        // la task consommatrice traite en arrière-plan
        sleep(Duration::from_millis(50)).await;

        let view = store.lock().snapshot_view();
        let dev = view.iter().find(|d| d.dev_id == "sbox2").unwrap();
        let values: Vec<f64> = dev.series["temperature"].iter().map(|s| s.value).collect();
        assert_eq!(values, [10.0, 20.0, 30.0]);
    }
}
