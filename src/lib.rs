//! Polling engine for electricity meters behind a TCP gateway
//!
//! The device tree is turned into a roster of meters, the agent walks that
//! roster request by request over one TCP link and hands every decoded
//! answer to the MQTT sink.

pub mod models;
pub mod protocol;
pub mod roster;
pub mod agent;
pub mod config;
pub mod mqtt;

// Re-export common types for easier access
pub use models::{DeviceNode, Meter, Roster};
pub use protocol::Catalog;
pub use agent::{Agent, AgentExit, AgentHandle};
pub use mqtt::{CALLBACKS, MeteringData, MqttManager};
pub use config::CONFIG;

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs();
}

pub fn get_id(protocol: String, meter_name: &String) -> String {
    return format!("{}-{}-{:?}", protocol, meter_name, get_unix_ts());
}
