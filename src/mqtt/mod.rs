pub mod internal_commands;
pub mod ha_interface;

use std::collections::HashMap;
use lazy_static::lazy_static;
use tokio::sync::RwLock;
use crate::config::MqttConfig;
use crate::models::Roster;
use crate::mqtt::ha_interface::HaDiscover;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};
use serde::{Serialize, Deserialize};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct AppStatus {
    pub start_time: Instant,
    pub last_message_sent: Option<Instant>,
}

impl AppStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_message_sent: None,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// One decoded value routed to its external channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub external_id: String,
    pub channel: String,
    pub value: f64,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub meter_name: String,
}

/// All values decoded from one meter answer
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MeteringData {
    pub id: String,
    pub meter_name: String,
    pub long_address: u32,
    pub transmission_time: u64,
    pub records: Vec<ChannelRecord>,
}

impl MeteringData {
    /// Flat channel -> value map as published per device
    pub fn values(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for record in self.records.iter() {
            map.insert(record.channel.clone(), serde_json::Value::from(record.value));
        }
        map
    }
}

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub struct SubscribeData {
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>
}

pub enum Transmission {
    Metering(MeteringData),
    AutoDiscovery(HaDiscover),
    Subscribe(SubscribeData),
    Publish(PublishData)
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
    base_topic: String,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        debug!("Adding callback for topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub async fn send(&self, topic: String, payload: String) {
        let v = match self.calls.get(&topic) {
            Some(v) => v,
            None => {
                debug!("Send for unknown topic {topic}");
                return;
            }
        };

        for call in v {
            debug!("Sending to callback: {payload}");
            if call.send(payload.clone()).await.is_err() {
                warn!("Callback for {topic} is gone");
            }
        }
    }

    pub fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    pub static ref APP_STATUS: RwLock<AppStatus> = RwLock::new(AppStatus::new());
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx,mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions   = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new thread to handle the incomming commands
        let reconnect_c = client.clone();
        tokio::spawn( async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = match String::from_utf8(p.payload.to_vec()) {
                            Ok(s) => s,
                            Err(_) => {
                                warn!("Non UTF-8 payload on {topic} ignored");
                                continue;
                            }
                        };
                        debug!("Received MQTT command {payload:?}");

                        let callback = CALLBACKS.read().await;
                        callback.send(topic.clone(), payload.clone()).await;
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");

                        /* We are connected resubstribe to everything */
                        let callbacks = CALLBACKS.read().await.get_topics();
                        for callback in callbacks {
                            /* Move the resubscription to it's own thread */
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(callback.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {callback} failed: {e}");
                                }
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return (MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
            base_topic: config.base_topic.clone(),
        }, mtx);
    }

    pub async fn start_thread(&mut self) {

        // Handle all the incomming metering stuff
        while !self.exit_thread {
            let option = self.rx.recv().await;

            let transmission = match option {
                Some(t) => t,
                None => {
                    debug!("Reading returned none, we exit now");
                    self.exit_thread = true;
                    continue;
                }
            };

            match transmission {
                Transmission::Metering(data) => self.publish_metering(data).await,
                Transmission::AutoDiscovery(disc) => {
                    match serde_json::to_string(&disc) {
                        Ok(payload) => {
                            let _ = self.client.publish(disc.discover_topic.clone(), QoS::AtLeastOnce, true, payload).await;
                        }
                        Err(e) => error!("Discovery for {} can not be serialized: {e}", disc.get_dev_id()),
                    }
                }
                Transmission::Subscribe(subscribe_data) => {
                    let topic = format!("{}/{}", self.base_topic, subscribe_data.topic);
                    if self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await.is_ok() {
                        CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                        info!("Registered Callback {topic}");
                    }
                },
                Transmission::Publish(publish_data) => {
                    match self.client.publish(
                        publish_data.topic,
                        match publish_data.qos {
                            0 => QoS::AtMostOnce,
                            1 => QoS::AtLeastOnce,
                            2 => QoS::ExactlyOnce,
                            _ => QoS::AtMostOnce,
                        },
                        publish_data.retain,
                        publish_data.payload
                    ).await {
                        Err(e) => { error!("Error publishing: {}", e); },
                        Ok(_) => { debug!("Published successfully"); }
                    }
                },
            };
        }

        info!("Thread exit, waiting");
    }

    /* Best effort, a failed publish is logged and the batch is gone */
    async fn publish_metering(&self, data: MeteringData) {
        debug!("Metering data received: {}", data.id);

        let raw = match serde_json::to_string(&data) {
            Ok(s) => s,
            Err(e) => {
                error!("Metering data of {} can not be serialized: {e}", data.meter_name);
                return;
            }
        };

        match self.client.publish(format!("{}/raw", self.base_topic), QoS::AtLeastOnce, false, raw).await {
            Err(e) => { error!("Error sending: {}", e); },
            Ok(_) => {
                debug!("Send successfully");
                APP_STATUS.write().await.last_message_sent = Some(Instant::now());
            }
        }

        let values = serde_json::Value::Object(data.values()).to_string();
        if let Err(e) = self.client.publish(format!("{}/devs/{}", self.base_topic, data.meter_name), QoS::AtLeastOnce, false, values).await {
            error!("Error sending values of {}: {}", data.meter_name, e);
        }
    }
}

pub async fn get_app_status() -> AppStatus {
    APP_STATUS.read().await.clone()
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>, base_topic: &str) {
    let app_status = get_app_status().await;

    let uptime_publish = PublishData {
        topic: format!("{base_topic}/mgt/uptime"),
        payload: app_status.uptime_seconds().to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}

pub async fn publish_meter_count(mqtt_sender: &Sender<Transmission>, base_topic: &str, count: usize) {
    let count_publish = PublishData {
        topic: format!("{base_topic}/mgt/meters/count"),
        payload: count.to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(count_publish)).await;
}

/// Tell the outside world about a freshly built roster
pub async fn announce_roster(mqtt_sender: &Sender<Transmission>, roster: &Roster, config: &MqttConfig) {
    publish_meter_count(mqtt_sender, &config.base_topic, roster.len()).await;

    if !config.ha_enabled {
        return;
    }

    for meter in roster.meters() {
        let discover = ha_interface::discovery_for_meter(meter, &config.base_topic);
        let _ = mqtt_sender.send(Transmission::AutoDiscovery(discover)).await;
    }
}
