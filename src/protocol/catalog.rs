use super::ProtocolError;

const CMD_READ_ENERGY: u8 = 0x05;
const CMD_READ_AUX: u8 = 0x08;
const AUX_INSTANT: u8 = 0x16;

/// How the payload of a template's response is laid out and scaled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Energy,
    Power,
    Voltage,
    Current,
    Frequency,
}

/// A device independent request, address and CRC are stamped on when sending
#[derive(Debug, Clone, PartialEq)]
pub struct PollTemplate {
    /// Exact channel code for single channel entries, group id for families
    pub key: &'static str,
    pub kind: PayloadKind,
    /// Channel codes in the order the response carries the values
    pub channels: &'static [&'static str],
    pub request: Vec<u8>,
}

impl PollTemplate {
    fn new(key: &'static str, kind: PayloadKind, channels: &'static [&'static str], request: &[u8]) -> Self {
        PollTemplate { key, kind, channels, request: request.to_vec() }
    }

    pub fn payload_len(&self) -> usize {
        self.channels.len() * 4
    }

    /// True when the answer to this request carries a value for `channel_code`
    pub fn serves(&self, channel_code: &str) -> bool {
        self.channels.contains(&channel_code)
    }
}

/// Every request one meter can answer in a single pass, the same for all meters
#[derive(Debug, Clone)]
pub struct Catalog {
    templates: Vec<PollTemplate>,
}

impl Catalog {
    pub fn build() -> Self {
        let templates = vec![
            PollTemplate::new("E", PayloadKind::Energy, &["EAP", "EAM", "ERP", "ERM"], &[CMD_READ_ENERGY, 0x00, 0x00]),
            PollTemplate::new("P", PayloadKind::Power, &["P0", "P1", "P2", "P3"], &[CMD_READ_AUX, AUX_INSTANT, 0x00]),
            PollTemplate::new("Q", PayloadKind::Power, &["Q0", "Q1", "Q2", "Q3"], &[CMD_READ_AUX, AUX_INSTANT, 0x04]),
            PollTemplate::new("S", PayloadKind::Power, &["S0", "S1", "S2", "S3"], &[CMD_READ_AUX, AUX_INSTANT, 0x08]),
            PollTemplate::new("I", PayloadKind::Current, &["I1", "I2", "I3"], &[CMD_READ_AUX, AUX_INSTANT, 0x21]),
            PollTemplate::new("U", PayloadKind::Voltage, &["U1", "U2", "U3"], &[CMD_READ_AUX, AUX_INSTANT, 0x11]),
            PollTemplate::new("f", PayloadKind::Frequency, &["f"], &[CMD_READ_AUX, AUX_INSTANT, 0x40]),
        ];
        Catalog { templates }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PollTemplate> {
        self.templates.iter()
    }

    pub fn get(&self, index: usize) -> Result<&PollTemplate, ProtocolError> {
        self.templates.get(index).ok_or(ProtocolError::UnknownTemplate(index))
    }

    /// Exact code first, then the measurement group given by the first letter
    pub fn resolve(&self, channel_code: &str) -> Option<usize> {
        if let Some(idx) = self.templates.iter().position(|t| t.key == channel_code) {
            return Some(idx);
        }

        let group = channel_code.chars().next()?;
        self.templates.iter().position(|t| t.key.chars().count() == 1 && t.key.starts_with(group))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::build()
    }
}
