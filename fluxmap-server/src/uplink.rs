/**
 * UPLINK TRANSPORT - Abonnement pub/sub amont, une souscription par application
 *
 * RÔLE :
 * Abstrait le réseau amont derrière open(app_id, access_key) -> (poignée de
 * fermeture, flux d'événements). Le gestionnaire de sessions ne voit jamais
 * rumqttc directement, ce qui permet un transport bouchonné dans les tests.
 *
 * FONCTIONNEMENT :
 * - MqttUplink : un AsyncClient + EventLoop rumqttc par session, credentials
 *   app_id / access_key, souscription au topic uplink de l'application
 * - La boucle poll() tourne dans une task dédiée et traduit les événements
 *   bruts : ConnAck -> Connected, Publish -> Uplink, erreurs classées
 *   AuthRejected / Transport
 * - close() est idempotent et utilisable avant la fin du handshake : la
 *   poignée existe dès open(), avant toute connexion réelle
 */

use crate::config::MqttConf;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, Incoming, MqttOptions, QoS};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UplinkError {
    #[error("access key rejected by upstream")]
    AuthRejected,
    #[error("upstream transport error: {0}")]
    Transport(String),
}

#[derive(Debug)]
pub enum UplinkEvent {
    /// Handshake abouti, la souscription est active.
    Connected,
    /// Un message de device, payload JSON brut.
    Uplink { dev_id: String, payload: Value },
    Error(UplinkError),
}

/// Poignée de fermeture d'une souscription. close() est idempotent.
pub trait UplinkHandle: Send + Sync {
    fn close(&self);
}

/// Collaborateur réseau amont : ouvre une souscription par application.
pub trait UplinkTransport: Send + Sync {
    fn open(&self, app_id: &str, access_key: &str)
        -> (Box<dyn UplinkHandle>, mpsc::Receiver<UplinkEvent>);
}

pub struct MqttUplink {
    host: String,
    port: u16,
    topic_template: String,
}

impl MqttUplink {
    pub fn new(conf: &MqttConf, topic_template: &str) -> Self {
        Self {
            host: conf.host.clone(),
            port: conf.port,
            topic_template: topic_template.to_string(),
        }
    }
}

struct MqttUplinkHandle {
    client: AsyncClient,
    closed: Arc<AtomicBool>,
}

impl UplinkHandle for MqttUplinkHandle {
    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        // déconnexion en file ; sans effet si jamais connecté
        let _ = self.client.try_disconnect();
    }
}

impl UplinkTransport for MqttUplink {
    fn open(
        &self,
        app_id: &str,
        access_key: &str,
    ) -> (Box<dyn UplinkHandle>, mpsc::Receiver<UplinkEvent>) {
        let topic = self.topic_template.replace("{app}", app_id);
        let dev_segment = topic.split('/').position(|s| s == "+");
        if dev_segment.is_none() {
            eprintln!("[uplink] [{}] no '+' segment in topic '{}', device ids will be unreadable", app_id, topic);
        }

        let mut opts = MqttOptions::new(format!("fluxmap-{}", app_id), &self.host, self.port);
        opts.set_credentials(app_id, access_key);
        opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        let closed = Arc::new(AtomicBool::new(false));
        let handle = MqttUplinkHandle { client: client.clone(), closed: closed.clone() };
        let (tx, rx) = mpsc::channel(64);
        let app = app_id.to_string();

        tokio::spawn(async move {
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                eprintln!("[uplink] [{}] subscribe failed: {:?}", app, e);
                let _ = tx.send(UplinkEvent::Error(UplinkError::Transport(format!("{:?}", e)))).await;
                return;
            }

            loop {
                if closed.load(Ordering::Relaxed) {
                    break;
                }
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success
                            && tx.send(UplinkEvent::Connected).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        let Some(dev_id) = device_id_from_topic(&p.topic, dev_segment) else {
                            continue;
                        };
                        match serde_json::from_slice::<Value>(&p.payload) {
                            Ok(payload) => {
                                if tx.send(UplinkEvent::Uplink { dev_id, payload }).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                eprintln!("[uplink] [{}] invalid uplink JSON from {}: {}", app, dev_id, e)
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let err = classify(&e);
                        let fatal = matches!(err, UplinkError::AuthRejected);
                        if tx.send(UplinkEvent::Error(err)).await.is_err() || fatal {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        (Box::new(handle), rx)
    }
}

/// Extrait le device id du topic reçu, au segment marqué '+' dans le gabarit.
fn device_id_from_topic(topic: &str, dev_segment: Option<usize>) -> Option<String> {
    topic.split('/').nth(dev_segment?).map(|s| s.to_string())
}

/// Sépare le refus d'authentification (fatal pour la session) des erreurs
/// de transport (transitoires).
fn classify(e: &ConnectionError) -> UplinkError {
    match e {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
                UplinkError::AuthRejected
            }
            other => UplinkError::Transport(format!("connection refused: {:?}", other)),
        },
        other => UplinkError::Transport(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_from_topic() {
        let template = "{app}/devices/+/up".replace("{app}", "app1");
        let seg = template.split('/').position(|s| s == "+");
        assert_eq!(seg, Some(2));
        assert_eq!(
            device_id_from_topic("app1/devices/sbox2/up", seg),
            Some("sbox2".to_string())
        );
        assert_eq!(device_id_from_topic("app1/devices", seg), None);
        assert_eq!(device_id_from_topic("whatever", None), None);
    }

    #[test]
    fn test_classify_auth_vs_transport() {
        let auth = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(matches!(classify(&auth), UplinkError::AuthRejected));
        let auth = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(matches!(classify(&auth), UplinkError::AuthRejected));
        let busy = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        assert!(matches!(classify(&busy), UplinkError::Transport(_)));
    }
}
