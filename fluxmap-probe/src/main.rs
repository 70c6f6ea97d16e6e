use fluxmap_devkit::FluxmapMessageBuilder;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::SystemTime;
use tokio::time::{sleep, Duration};

/// Capteur simulé : publie des uplinks qualité d'air synthétiques sur le
/// topic de son application, pour développer le serveur sans matériel.
struct ProbeConfig {
    mqtt_host: String,
    mqtt_port: u16,
    app_id: String,
    devices: Vec<String>,
    interval_secs: u64,
}

impl ProbeConfig {
    // config volontairement par variables d'environnement, défauts en dur
    fn from_env() -> Self {
        let devices = std::env::var("FLUXMAP_PROBE_DEVICES")
            .unwrap_or_else(|_| "sbox2,sbox3,sbox4".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            mqtt_host: std::env::var("FLUXMAP_MQTT_HOST").unwrap_or_else(|_| "localhost".into()),
            mqtt_port: std::env::var("FLUXMAP_MQTT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(1883),
            app_id: std::env::var("FLUXMAP_PROBE_APP").unwrap_or_else(|_| "cville-aq".into()),
            devices,
            interval_secs: std::env::var("FLUXMAP_PROBE_INTERVAL")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(10),
        }
    }
}

/// Valeurs synthétiques déterministes : une sinusoïde lente par device,
/// déphasée par l'index, pour des courbes lisibles sur la carte.
fn synthetic_fields(tick: u64, device_index: usize) -> serde_json::Value {
    let t = tick as f64 / 6.0 + device_index as f64;
    let mut fields = FluxmapMessageBuilder::air_quality_fields(
        18.0 + 6.0 * t.sin(),
        420.0 + 80.0 * (t / 2.0).sin(),
        10.0 + 5.0 * (t / 3.0).cos(),
        16.0 + 6.0 * (t / 3.0).sin(),
        55.0 + 20.0 * (t / 4.0).cos(),
    );
    // côté node la tension est divisée par 100, le serveur la renormalise
    fields["analog_in_1"] = serde_json::json!(2.0 + 0.5 * (t / 5.0).sin());
    fields
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ProbeConfig::from_env();
    println!(
        "[probe] simulating {} devices for application {} every {}s",
        cfg.devices.len(),
        cfg.app_id,
        cfg.interval_secs
    );

    // MQTT async
    let mut opts = MqttOptions::new(format!("fluxmap-probe-{}", cfg.app_id), &cfg.mqtt_host, cfg.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    // Boucle d'événements MQTT (le client ne vit que si on poll)
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    println!("[probe] connected to broker");
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[probe] MQTT loop erreur: {:?}", e);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // Boucle de publication des uplinks
    let mut tick: u64 = 0;
    loop {
        for (index, dev_id) in cfg.devices.iter().enumerate() {
            let topic = FluxmapMessageBuilder::uplink_topic(&cfg.app_id, dev_id);
            let uplink = FluxmapMessageBuilder::uplink_at(
                synthetic_fields(tick, index),
                &humantime::format_rfc3339(SystemTime::now()).to_string(),
            );
            let payload = serde_json::to_vec(&uplink)?;
            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                eprintln!("[probe] publish uplink erreur: {:?}", e);
            }
        }
        tick += 1;
        sleep(Duration::from_secs(cfg.interval_secs)).await;
    }
}
