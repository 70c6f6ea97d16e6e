/**
 * BROADCAST FAN-OUT - Diffusion des événements vers les observateurs
 *
 * RÔLE :
 * Pousse chaque value-change et location-change vers tous les observateurs
 * WebSocket connectés au moment de l'émission. Meilleur effort : aucun
 * acquittement, un observateur à la traîne saute des événements.
 *
 * FONCTIONNEMENT :
 * - Un seul canal broadcast partagé par toutes les sessions : chaque
 *   observateur reçoit les événements de toutes les applications
 * - relocate() porte la commande observateur location-change : device
 *   inconnu -> ignoré silencieusement (logué), sinon écriture du store puis
 *   diffusion à tous, demandeur compris
 */

use crate::models::DeviceInfo;
use crate::state::Shared;
use crate::store::DeviceStore;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Événement poussé aux observateurs, étiqueté par "event" sur le fil.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PushEvent {
    ValueChange {
        metric: String,
        device: DeviceInfo,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        value: f64,
    },
    LocationChange {
        device: DeviceInfo,
        lat: f64,
        lng: f64,
    },
}

#[derive(Clone)]
pub struct Fanout {
    tx: broadcast::Sender<PushEvent>,
}

impl Fanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Diffuse un value-change. Sans observateur connecté, l'événement est
    /// simplement perdu.
    pub fn emit_change(&self, metric: &str, device: DeviceInfo, ts: OffsetDateTime, value: f64) {
        let _ = self.tx.send(PushEvent::ValueChange {
            metric: metric.to_string(),
            device,
            ts,
            value,
        });
    }

    pub fn emit_location_change(&self, device: DeviceInfo, lat: f64, lng: f64) {
        let _ = self.tx.send(PushEvent::LocationChange { device, lat, lng });
    }

    /// Commande observateur : repositionne un device puis diffuse à tous.
    /// Device inconnu : aucun changement d'état, aucune diffusion, pas
    /// d'erreur remontée au demandeur.
    pub fn relocate(&self, store: &Shared<DeviceStore>, app_id: &str, dev_id: &str, lat: f64, lng: f64) {
        let device = {
            let mut store = store.lock();
            match store.set_location(app_id, dev_id, lat, lng) {
                Ok(()) => store.device_info(app_id, dev_id),
                Err(e) => {
                    eprintln!("[fanout] [{}] relocation of {} ignored: {}", app_id, dev_id, e);
                    return;
                }
            }
        };
        if let Some(device) = device {
            println!("[fanout] [{}] device {} relocated to ({}, {})", app_id, dev_id, lat, lng);
            self.emit_location_change(device, lat, lng);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::MetricRegistry;
    use crate::state::new_state;
    use std::sync::Arc;

    fn store() -> Shared<DeviceStore> {
        let registry = Arc::new(MetricRegistry::from_config(&ServerConfig::default().metrics));
        new_state(DeviceStore::new(registry))
    }

    fn device(app_id: &str, dev_id: &str) -> DeviceInfo {
        DeviceInfo {
            app_id: app_id.into(),
            dev_id: dev_id.into(),
            eui: dev_id.into(),
            lat: None,
            lng: None,
        }
    }

    #[test]
    fn test_every_subscriber_receives_the_event() {
        let fanout = Fanout::new(8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        fanout.emit_change("temperature", device("app1", "sbox2"), OffsetDateTime::now_utc(), 21.0);

        for rx in [&mut a, &mut b] {
            let event = rx.try_recv().unwrap();
            assert!(matches!(event, PushEvent::ValueChange { ref metric, value, .. }
                if metric == "temperature" && value == 21.0));
        }
    }

    #[test]
    fn test_emit_without_observers_is_a_noop() {
        let fanout = Fanout::new(8);
        fanout.emit_location_change(device("app1", "sbox2"), 38.0, -78.5);
        assert_eq!(fanout.observer_count(), 0);
    }

    #[test]
    fn test_relocate_updates_store_and_broadcasts() {
        let fanout = Fanout::new(8);
        let store = store();
        store.lock().upsert_device("app1", "dev9");
        let mut rx = fanout.subscribe();

        fanout.relocate(&store, "app1", "dev9", 38.0, -78.5);

        let info = store.lock().device_info("app1", "dev9").unwrap();
        assert_eq!((info.lat, info.lng), (Some(38.0), Some(-78.5)));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PushEvent::LocationChange { lat, lng, .. }
            if lat == 38.0 && lng == -78.5));
    }

    #[test]
    fn test_relocate_unknown_device_is_silent() {
        let fanout = Fanout::new(8);
        let store = store();
        let mut rx = fanout.subscribe();

        // ne panique pas, ne diffuse rien, ne crée pas le device
        fanout.relocate(&store, "app1", "dev9", 38.0, -78.5);

        assert!(rx.try_recv().is_err());
        assert!(store.lock().is_empty());
    }

    #[test]
    fn test_value_change_wire_format() {
        let event = PushEvent::ValueChange {
            metric: "temperature".into(),
            device: DeviceInfo {
                app_id: "app1".into(),
                dev_id: "sbox2".into(),
                eui: "sbox2".into(),
                lat: Some(38.026),
                lng: Some(-78.501),
            },
            ts: OffsetDateTime::UNIX_EPOCH,
            value: 21.5,
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["event"], "value-change");
        assert_eq!(json["metric"], "temperature");
        assert_eq!(json["device"]["eui"], "sbox2");
        assert_eq!(json["ts"], "1970-01-01T00:00:00Z");
        assert_eq!(json["value"], 21.5);
    }
}
