//! Partner message framing.
//!
//! Layout: `[version:1][type:1][partner_id:1][sequence:1][data_length:1][payload]`.

use serde::{Deserialize, Serialize};

use crate::errors::{CardError, CardResult, FaultCode};

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 5;
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0x01,
    Transaction = 0x02,
    Response = 0x03,
    Error = 0x04,
    Authentication = 0x05,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> CardResult<Self> {
        match byte {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::Transaction),
            0x03 => Ok(Self::Response),
            0x04 => Ok(Self::Error),
            0x05 => Ok(Self::Authentication),
            other => Err(CardError::ValidationError(format!(
                "Unknown message type {:#04x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub version: u8,
    pub message_type: MessageType,
    pub partner_id: u8,
    pub sequence: u8,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(self.version);
        bytes.push(self.message_type.as_byte());
        bytes.push(self.partner_id);
        bytes.push(self.sequence);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Stateful encoder; every produced message takes the next sequence number,
/// wrapping at 256.
#[derive(Debug, Default)]
pub struct MessageCodec {
    sequence: u8,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next encoded message will carry.
    pub fn next_sequence(&self) -> u8 {
        self.sequence
    }

    pub fn encode(
        &mut self,
        message_type: MessageType,
        partner_id: u8,
        payload: &[u8],
    ) -> CardResult<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CardError::BufferTooSmall {
                needed: payload.len(),
                capacity: MAX_PAYLOAD_LEN,
            });
        }

        let message = ProtocolMessage {
            version: PROTOCOL_VERSION,
            message_type,
            partner_id,
            sequence: self.sequence,
            payload: payload.to_vec(),
        };
        self.sequence = self.sequence.wrapping_add(1);
        Ok(message.to_bytes())
    }

    pub fn decode(bytes: &[u8]) -> CardResult<ProtocolMessage> {
        if bytes.len() < HEADER_LEN {
            return Err(CardError::WrongLength {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(CardError::ValidationError(format!(
                "Unsupported protocol version {:#04x}",
                bytes[0]
            )));
        }

        let message_type = MessageType::from_byte(bytes[1])?;
        let data_length = bytes[4] as usize;
        if bytes.len() != HEADER_LEN + data_length {
            return Err(CardError::WrongLength {
                expected: HEADER_LEN + data_length,
                actual: bytes.len(),
            });
        }

        Ok(ProtocolMessage {
            version: bytes[0],
            message_type,
            partner_id: bytes[2],
            sequence: bytes[3],
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    pub fn handshake(&mut self, partner_id: u8) -> CardResult<Vec<u8>> {
        self.encode(MessageType::Handshake, partner_id, &[])
    }

    pub fn transaction(&mut self, partner_id: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        self.encode(MessageType::Transaction, partner_id, data)
    }

    /// Response payload is `response_code || data`.
    pub fn response(&mut self, partner_id: u8, response_code: u8, data: &[u8]) -> CardResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(response_code);
        payload.extend_from_slice(data);
        self.encode(MessageType::Response, partner_id, &payload)
    }

    pub fn error(&mut self, partner_id: u8, code: FaultCode) -> CardResult<Vec<u8>> {
        self.encode(MessageType::Error, partner_id, &[code.as_byte()])
    }

    pub fn authentication(&mut self, partner_id: u8, auth_data: &[u8]) -> CardResult<Vec<u8>> {
        self.encode(MessageType::Authentication, partner_id, auth_data)
    }
}
