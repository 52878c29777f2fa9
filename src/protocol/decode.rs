use crate::models::CalibrationAssets;
use super::{catalog::{PayloadKind, PollTemplate}, frame, ProtocolError};

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedValue {
    pub channel: String,
    pub value: f64,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/* Session open answers carry a single status byte, 0 means accepted */
pub fn check_session_reply(frame: &[u8]) -> Result<(), ProtocolError> {
    match frame::payload(frame) {
        [0x00] => Ok(()),
        [status] => Err(ProtocolError::DeviceStatus(*status)),
        other => Err(ProtocolError::PayloadLength { expected: 1, got: other.len() }),
    }
}

/// Decode the answer to `template` into calibrated channel values
pub fn decode_payload(frame: &[u8], template: &PollTemplate, assets: &CalibrationAssets) -> Result<Vec<DecodedValue>, ProtocolError> {
    let payload = frame::payload(frame);

    if let [status] = payload {
        return Err(ProtocolError::DeviceStatus(*status));
    }

    if payload.len() != template.payload_len() {
        return Err(ProtocolError::PayloadLength { expected: template.payload_len(), got: payload.len() });
    }

    let values = payload
        .chunks_exact(4)
        .zip(template.channels.iter())
        .map(|(raw, chan)| {
            let raw = [raw[0], raw[1], raw[2], raw[3]];
            let value = match template.kind {
                PayloadKind::Energy => u32::from_be_bytes(raw) as f64 * assets.energy_scale,
                PayloadKind::Power => {
                    i32::from_be_bytes(raw) as f64 * assets.power_scale * assets.current_coeff * assets.voltage_coeff / 1000.0
                }
                PayloadKind::Voltage => u32::from_be_bytes(raw) as f64 / 100.0 * assets.voltage_coeff,
                PayloadKind::Current => u32::from_be_bytes(raw) as f64 / 1000.0 * assets.current_coeff,
                PayloadKind::Frequency => u32::from_be_bytes(raw) as f64 / 100.0,
            };
            DecodedValue { channel: chan.to_string(), value: round4(value) }
        })
        .collect();

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{bind_address_and_checksum, Catalog};

    fn reply(address: u32, values: &[u32]) -> Vec<u8> {
        let body: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        bind_address_and_checksum(&body, address)
    }

    #[test]
    fn test_decode_voltage() {
        let catalog = Catalog::build();
        let template = catalog.get(catalog.resolve("U1").unwrap()).unwrap();
        let frame = reply(555, &[23012, 22950, 23100]);

        let values = decode_payload(&frame, template, &CalibrationAssets::default()).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], DecodedValue { channel: "U1".to_string(), value: 230.12 });
        assert_eq!(values[2].channel, "U3");
        assert_eq!(values[2].value, 231.0);
    }

    #[test]
    fn test_decode_energy_uses_scale() {
        let catalog = Catalog::build();
        let template = catalog.get(0).unwrap();
        let frame = reply(7, &[2500, 0, 5000, 1]);

        let values = decode_payload(&frame, template, &CalibrationAssets::default()).unwrap();
        assert_eq!(values[0].channel, "EAP");
        assert_eq!(values[0].value, 1.0);
        assert_eq!(values[2].value, 2.0);
        assert_eq!(values[3].value, 0.0004);
    }

    #[test]
    fn test_decode_negative_power() {
        let catalog = Catalog::build();
        let template = catalog.get(catalog.resolve("Q0").unwrap()).unwrap();
        let frame = reply(7, &[(-1500i32) as u32, 500, 0, 0]);
        let assets = CalibrationAssets { current_coeff: 2.0, ..Default::default() };

        let values = decode_payload(&frame, template, &assets).unwrap();
        assert_eq!(values[0].value, -3.0);
        assert_eq!(values[1].value, 1.0);
    }

    #[test]
    fn test_decode_length_mismatch() {
        let catalog = Catalog::build();
        let template = catalog.get(0).unwrap();
        let frame = reply(7, &[1, 2]);
        assert_eq!(
            decode_payload(&frame, template, &CalibrationAssets::default()),
            Err(ProtocolError::PayloadLength { expected: 16, got: 8 })
        );
    }

    #[test]
    fn test_status_replies() {
        let catalog = Catalog::build();
        let refused = bind_address_and_checksum(&[0x05], 7);
        assert_eq!(check_session_reply(&refused), Err(ProtocolError::DeviceStatus(5)));
        assert_eq!(
            decode_payload(&refused, catalog.get(0).unwrap(), &CalibrationAssets::default()),
            Err(ProtocolError::DeviceStatus(5))
        );

        let accepted = bind_address_and_checksum(&[0x00], 7);
        assert_eq!(check_session_reply(&accepted), Ok(()));
    }
}
