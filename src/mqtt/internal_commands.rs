
use log::{error, info, warn};
use tokio::sync::mpsc::Sender;
use crate::config::{config_write, ConfigBases, ConfigOperation};
use crate::models::DeviceNode;
use crate::mqtt::{PublishData, SubscribeData, Transmission};

/// Payloads on `<base>/devices/set` replace the whole device tree
pub fn parse_device_tree(payload: &str) -> Result<Vec<DeviceNode>, serde_json::Error> {
    serde_json::from_str(payload)
}

fn bridge_discovery(base_topic: &str) -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!(r###"
        {{
          "dev": {{
            "ids":"m2m_management",
            "name":"meterlink2mqtt Bridge",
            "manufacturer":"meterlink2mqtt",
            "model":"Bridge"
          }},
          "o": {{
            "name":"meterlink2mqtt",
            "sw_version":"{version}"
          }},
          "cmps":{{
            "restart": {{
              "p":"button",
              "device_class":"restart",
              "name":"restart",
              "object_id":"bridge_restart",
              "payload_press":"restart",
              "unique_id":"m2m_management_bridge_restart",
              "command_topic": "{base_topic}/mgt/command"
            }},
            "uptime": {{
              "p":"sensor",
              "name":"uptime",
              "object_id":"uptime",
              "unique_id":"m2m_management_uptime",
              "state_topic": "{base_topic}/mgt/uptime",
              "state_class": "measurement",
              "unit_of_measurement": "s"
            }},
            "meters": {{
              "p":"sensor",
              "name":"meters",
              "object_id":"meter_count",
              "unique_id":"m2m_management_meter_count",
              "state_topic": "{base_topic}/mgt/meters/count",
              "state_class": "measurement"
            }}
          }}
        }}"###)
}

pub struct CommandHandler {
   sender: Sender<Transmission>,
   base_topic: String,
}

impl CommandHandler {

  pub fn new(sender: Sender<Transmission>, base_topic: String) -> Self {
    return CommandHandler {
      sender: sender,
      base_topic: base_topic,
    }
  }

  async fn subscribe(&self, topic: &str) -> tokio::sync::mpsc::Receiver<String> {
        let (sender, receiver) = tokio::sync::mpsc::channel(10);
        let register = Transmission::Subscribe(SubscribeData{
            topic: topic.to_string(),
            sender
        });
        let _ = self.sender.send(register).await;
        receiver
  }

  pub async fn start_thread(&self) {
        info!("Starting CommandHandler thread");
        let mut commands = self.subscribe("mgt/command").await;
        let mut devices = self.subscribe("devices/set").await;

        let p = Transmission::Publish(PublishData {
            topic: "homeassistant/device/m2m_bridge/config".to_string(),
            payload: bridge_discovery(&self.base_topic),
            qos: 0,
            retain: true,
        });
        let _ = self.sender.send(p).await;

        info!("Start waiting for command messages");
        loop {
            tokio::select! {
                c = commands.recv() => {
                    let Some(c) = c else { return; };
                    info!("Received command {c}");

                    if c.trim() == "restart" {
                        /* if we exit that thread the rest will exit, too */
                        info!("Request to shutdown received");
                        return;
                    }
                    warn!("Unknown command {c} ignored");
                }
                d = devices.recv() => {
                    let Some(d) = d else { return; };
                    match parse_device_tree(&d) {
                        Ok(nodes) => {
                            info!("New device tree with {} records received", nodes.len());
                            config_write().update_config(ConfigOperation::CHANGE, ConfigBases::Devices(nodes));
                        }
                        Err(e) => error!("Device tree rejected: {e}"),
                    }
                }
            }
        }
  }
}
