use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

pub const DEFAULT_METER_CONSTANT: f64 = 1250.0;

/// Kind of a configuration node, only meter roots are addressable on the wire
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub enum NodeKind {
    #[serde(rename = "node")]
    MeterRoot,
    #[default]
    #[serde(rename = "plain")]
    Plain,
}

/* The host hands out loosely typed records, flags may be 0/1, strings or real booleans */
#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let v: Option<Loose> = Option::deserialize(d)?;
    Ok(match v {
        Some(Loose::Bool(b)) => b,
        Some(Loose::Int(i)) => i != 0,
        Some(Loose::Float(f)) => f != 0.0,
        Some(Loose::Text(s)) => matches!(s.trim(), "1" | "true" | "yes"),
        None => false,
    })
}

fn de_long_address<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let v: Option<Loose> = Option::deserialize(d)?;
    Ok(match v {
        Some(Loose::Int(i)) if i > 0 => u32::try_from(i).ok(),
        Some(Loose::Float(f)) if f >= 1.0 && f <= u32::MAX as f64 => Some(f as u32),
        Some(Loose::Text(s)) => s.trim().parse::<u32>().ok().filter(|a| *a > 0),
        _ => None,
    })
}

fn de_node_kind<'de, D: Deserializer<'de>>(d: D) -> Result<NodeKind, D::Error> {
    let v: Option<String> = Option::deserialize(d)?;
    Ok(match v.as_deref().map(str::trim) {
        Some("node") | Some("meter") | Some("meter-root") => NodeKind::MeterRoot,
        _ => NodeKind::Plain,
    })
}

fn de_poll_time_factor<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let v: Option<Loose> = Option::deserialize(d)?;
    let f = match v {
        Some(Loose::Int(i)) => i,
        Some(Loose::Float(f)) => f as i64,
        Some(Loose::Text(s)) => s.trim().parse::<i64>().unwrap_or(1),
        _ => 1,
    };
    Ok(f.clamp(1, u32::MAX as i64) as u32)
}

fn default_poll_time_factor() -> u32 { 1 }

/// One raw record of the device/channel tree as delivered by the host.
///
/// Field names accept both the snake_case form and the host's legacy keys.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DeviceNode {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default, alias = "folder", deserialize_with = "de_flag")]
    pub is_folder: bool,
    #[serde(default, alias = "foldertype", deserialize_with = "de_node_kind")]
    pub node_kind: NodeKind,
    #[serde(default, alias = "longadr", deserialize_with = "de_long_address", skip_serializing_if = "Option::is_none")]
    pub long_address: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_code: Option<String>,
    /* legacy name field, display name on meter roots and channel code on leaves */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan: Option<String>,

    #[serde(default, alias = "handkti", skip_serializing_if = "Option::is_none")]
    pub current_coeff: Option<f64>,
    #[serde(default, alias = "handktu", skip_serializing_if = "Option::is_none")]
    pub voltage_coeff: Option<f64>,
    #[serde(default, alias = "ks", skip_serializing_if = "Option::is_none")]
    pub power_coeff: Option<f64>,
    #[serde(default, alias = "constant", skip_serializing_if = "Option::is_none")]
    pub meter_constant: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, alias = "r", deserialize_with = "de_flag")]
    pub read_enabled: bool,
    #[serde(default = "default_poll_time_factor", alias = "pollmeterfctr", deserialize_with = "de_poll_time_factor")]
    pub poll_time_factor: u32,
}

impl DeviceNode {
    pub fn is_meter_root(&self) -> bool {
        self.node_kind == NodeKind::MeterRoot
    }

    pub fn display_name(&self) -> String {
        self.display_name.clone()
            .or_else(|| self.chan.clone())
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn channel_code(&self) -> Option<&str> {
        self.channel_code.as_deref()
            .or(self.chan.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/* Zero, negative and missing coefficients all fall back to the neutral value */
fn coeff_or(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => default,
    }
}

/// Per meter calibration data, computed once when the roster is built
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationAssets {
    pub current_coeff: f64,
    pub voltage_coeff: f64,
    pub power_scale: f64,
    pub meter_constant: f64,
    pub password: String,
    pub energy_scale: f64,
}

impl CalibrationAssets {
    pub fn from_node(node: &DeviceNode) -> Self {
        let current_coeff = coeff_or(node.current_coeff, 1.0);
        let voltage_coeff = coeff_or(node.voltage_coeff, 1.0);
        let meter_constant = coeff_or(node.meter_constant, DEFAULT_METER_CONSTANT);

        CalibrationAssets {
            current_coeff,
            voltage_coeff,
            power_scale: coeff_or(node.power_coeff, 1.0),
            meter_constant,
            password: node.password.clone().unwrap_or_default(),
            energy_scale: current_coeff * voltage_coeff / (2.0 * meter_constant),
        }
    }
}

impl Default for CalibrationAssets {
    fn default() -> Self {
        CalibrationAssets::from_node(&DeviceNode::default())
    }
}

/// Routing data of one configured channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub external_id: String,
    pub channel_code: String,
    pub read_enabled: bool,
    pub poll_time_factor: u32,
}

/// One scheduled catalog request of a meter together with its decimation state
#[derive(Debug, Clone, PartialEq)]
pub struct PollDescriptor {
    pub template_index: usize,
    pub poll_time_factor: u32,
    pub countdown: u32,
}

impl PollDescriptor {
    pub fn new(template_index: usize, poll_time_factor: u32) -> Self {
        PollDescriptor {
            template_index,
            poll_time_factor: poll_time_factor.max(1),
            countdown: 0,
        }
    }

    /// Advances the decimation state by one visit and reports whether the
    /// request is due on this visit. Countdown runs 0, f-1, ..., 1, 0.
    pub fn tick(&mut self) -> bool {
        if self.countdown == 0 {
            self.countdown = self.poll_time_factor - 1;
            true
        } else {
            self.countdown -= 1;
            false
        }
    }
}

/// Position of a meter inside its own poll plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// The session open request has to go out before anything else
    SessionOpen,
    /// Scan the poll plan starting at this index
    Next(usize),
}

#[derive(Debug, Clone)]
pub struct Meter {
    pub long_address: u32,
    pub display_name: String,
    pub assets: CalibrationAssets,
    pub channels: HashMap<String, ChannelDescriptor>,
    pub polls: Vec<PollDescriptor>,
    pub cursor: Cursor,
}

/// Ordered list of meters plus the address index used to route responses.
/// Always built as a whole, the agent swaps it on reload.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    meters: Vec<Meter>,
    index: HashMap<u32, usize>,
}

impl Roster {
    /// Later meters with an address already present are dropped
    pub fn from_meters(meters: Vec<Meter>) -> Self {
        let mut roster = Roster::default();
        for meter in meters {
            if roster.index.contains_key(&meter.long_address) {
                continue;
            }
            roster.index.insert(meter.long_address, roster.meters.len());
            roster.meters.push(meter);
        }
        roster
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    pub fn meters(&self) -> &[Meter] {
        &self.meters
    }

    pub fn get(&self, pos: usize) -> Option<&Meter> {
        self.meters.get(pos)
    }

    pub fn get_mut(&mut self, pos: usize) -> Option<&mut Meter> {
        self.meters.get_mut(pos)
    }

    pub fn position_of(&self, long_address: u32) -> Option<usize> {
        self.index.get(&long_address).copied()
    }

    pub fn reset_cursors(&mut self) {
        for meter in self.meters.iter_mut() {
            meter.cursor = Cursor::SessionOpen;
        }
    }
}
