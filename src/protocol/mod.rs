use thiserror::Error;

pub mod catalog;
pub mod frame;
pub mod decode;

pub use catalog::{Catalog, PayloadKind, PollTemplate};
pub use decode::{check_session_reply, decode_payload, DecodedValue};
pub use frame::{bind_address_and_checksum, extract_sender_address, session_open_request, validate};

/// Errors of the meter wire protocol, all of them are recoverable per message
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("Frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("CRC mismatch, calculated {calculated:04x} but frame carries {received:04x}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    #[error("Meter answered with status {0:#04x}")]
    DeviceStatus(u8),
    #[error("Payload has {got} bytes, expected {expected}")]
    PayloadLength { expected: usize, got: usize },
    #[error("No poll template with index {0}")]
    UnknownTemplate(usize),
}
