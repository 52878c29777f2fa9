use crc16::{State, MODBUS};

use crate::models::CalibrationAssets;
use super::ProtocolError;

pub const ADDRESS_LEN: usize = 4;
pub const CRC_LEN: usize = 2;
pub const MIN_FRAME_LEN: usize = ADDRESS_LEN + 1 + CRC_LEN;

const CMD_OPEN_SESSION: u8 = 0x01;
const ACCESS_LEVEL_USER: u8 = 0x01;
const PASSWORD_LEN: usize = 6;

fn checksum(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

/// Unaddressed session open request carrying the meter password
pub fn session_open_request(assets: &CalibrationAssets) -> Vec<u8> {
    let mut body = vec![CMD_OPEN_SESSION, ACCESS_LEVEL_USER];
    let mut password = [0u8; PASSWORD_LEN];
    for (dst, src) in password.iter_mut().zip(assets.password.bytes()) {
        *dst = src;
    }
    body.extend_from_slice(&password);
    body
}

/// Prefix the long address and append the CRC trailer (low byte first)
pub fn bind_address_and_checksum(body: &[u8], long_address: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ADDRESS_LEN + body.len() + CRC_LEN);
    frame.extend_from_slice(&long_address.to_be_bytes());
    frame.extend_from_slice(body);
    let crc = checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

pub fn validate(frame: &[u8]) -> Result<(), ProtocolError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(ProtocolError::TooShort(frame.len()));
    }

    let (data, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let calculated = checksum(data);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if calculated != received {
        return Err(ProtocolError::ChecksumMismatch { calculated, received });
    }
    Ok(())
}

pub fn extract_sender_address(frame: &[u8]) -> Result<u32, ProtocolError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(ProtocolError::TooShort(frame.len()));
    }
    Ok(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]))
}

/// Everything between address and CRC, the frame must have been validated
pub fn payload(frame: &[u8]) -> &[u8] {
    if frame.len() < MIN_FRAME_LEN {
        return &[];
    }
    &frame[ADDRESS_LEN..frame.len() - CRC_LEN]
}
