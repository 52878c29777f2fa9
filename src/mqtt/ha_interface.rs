use serde::{Deserialize, Serialize};

use crate::models::Meter;
use crate::roster::channels::{self, ChannelInfo};

const ORIGIN_NAME: &str = "meterlink2mqtt";
const PROTO: &str = "meterlink";

#[derive(Serialize)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
}
#[derive(Serialize)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
}

fn is_none_str(value: &String) -> bool {
    if value.is_empty() || value == "NONE" {
        return true;
    }
    return false;
}

#[derive(Serialize, PartialEq, Deserialize, Clone, Default)]
pub enum HAPlatform {
    #[default]
    Sensor,
}

impl HAPlatform {
    pub fn to_string(&self) -> String {
        match self {
            HAPlatform::Sensor => "sensor".to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: String,
    pub value_template: String,
    pub unique_id: String,
    pub object_id: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub state_class: String,
}

impl HaComponent {
    pub fn new(platform: HAPlatform, device: String, dclass: String, uof: String, name: String, json_key: String, state_class: String) -> Self {
        let safe_name = name.replace(" ", "_");
        let safe_device = device.replace(" ", "_");

        return HaComponent {
            p: platform.to_string(),
            name: name,
            device_class: dclass,
            unit_of_measurement: uof,
            value_template: format!("{{{{ value_json.{json_key} }}}}"),
            unique_id: format!("m2m_{PROTO}_{safe_device}_{json_key}").to_lowercase(),
            object_id: format!("{safe_device}_{safe_name}").to_lowercase(),
            state_class: state_class,
         }
    }

    /// Sensor for one channel, unknown codes get a bare sensor without unit
    pub fn for_channel(device: &str, code: &str, info: Option<ChannelInfo>) -> Self {
        match info {
            Some(info) => HaComponent::new(
                HAPlatform::Sensor,
                device.to_string(),
                info.device_class.to_string(),
                info.unit.to_string(),
                info.note,
                code.to_string(),
                info.state_class.to_string(),
            ),
            None => HaComponent::new(
                HAPlatform::Sensor,
                device.to_string(),
                "NONE".to_string(),
                "NONE".to_string(),
                code.to_string(),
                code.to_string(),
                "measurement".to_string(),
            ),
        }
    }
}

#[derive(Serialize)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub state_topic: String,
    pub qos: u32,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscover {
    pub fn new(name: String, manu: String, model: String, state_topic: String) -> Self {
        let safe_name = name.replace(" ", "_");
        return HaDiscover {
            discover_topic: format!("homeassistant/device/m2m_{PROTO}-{safe_name}/config"),
            dev: HaDevice {
                ids: format!("m2m_{PROTO}_{safe_name}"),
                name: name,
                manufacturer: manu,
                model: model,
            },
            o: HaOrigin {
                name: ORIGIN_NAME.to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            cmps: serde_json::Map::new(),
            state_topic: state_topic,
            qos: 1
        }
    }

    pub fn get_dev_id(&self) -> String {
        return self.dev.ids.clone();
    }
}

/// Discovery document with one sensor per read enabled channel of the meter
pub fn discovery_for_meter(meter: &Meter, base_topic: &str) -> HaDiscover {
    let mut discover = HaDiscover::new(
        meter.display_name.clone(),
        "meterlink".to_string(),
        format!("long address {}", meter.long_address),
        format!("{}/devs/{}", base_topic, meter.display_name),
    );

    let mut codes: Vec<&String> = meter.channels.values()
        .filter(|c| c.read_enabled)
        .map(|c| &c.channel_code)
        .collect();
    codes.sort();

    for code in codes {
        let cmp = HaComponent::for_channel(&meter.display_name, code, channels::describe(code));
        if let Ok(value) = serde_json::to_value(cmp) {
            discover.cmps.insert(code.clone(), value);
        }
    }

    discover
}
