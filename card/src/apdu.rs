//! Short APDU framing for the command channel.

use std::fmt;

use crate::errors::{status, CardError, CardResult, FaultCode};

pub const HEADER_LEN: usize = 4;
pub const MAX_DATA_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Initialize = 0x01,
    Authenticate = 0x02,
    ProcessTransaction = 0x03,
    GetBalance = 0x04,
    GetStatus = 0x05,
    UpdateKeys = 0x06,
    VerifySignature = 0x07,
    EstablishSession = 0x08,
    EncryptData = 0x09,
    DecryptData = 0x0A,
    AddPartner = 0x0B,
    RemovePartner = 0x0C,
    PartnerMessage = 0x0D,
    CloseSession = 0x0E,
}

impl Opcode {
    pub const ALL: [Opcode; 14] = [
        Opcode::Initialize,
        Opcode::Authenticate,
        Opcode::ProcessTransaction,
        Opcode::GetBalance,
        Opcode::GetStatus,
        Opcode::UpdateKeys,
        Opcode::VerifySignature,
        Opcode::EstablishSession,
        Opcode::EncryptData,
        Opcode::DecryptData,
        Opcode::AddPartner,
        Opcode::RemovePartner,
        Opcode::PartnerMessage,
        Opcode::CloseSession,
    ];

    pub fn ins(self) -> u8 {
        self as u8
    }

    pub fn from_ins(ins: u8) -> CardResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|opcode| opcode.ins() == ins)
            .ok_or(CardError::UnsupportedOperation(ins))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#04x})", self, self.ins())
    }
}

/// Decoded command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

impl Command {
    pub fn new(ins: u8, p1: u8, p2: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            cla: 0x00,
            ins,
            p1,
            p2,
            data: data.into(),
            le: None,
        }
    }

    pub fn for_opcode(opcode: Opcode, data: impl Into<Vec<u8>>) -> Self {
        Self::new(opcode.ins(), 0x00, 0x00, data)
    }

    /// Parse `CLA INS P1 P2 [Lc data] [Le]`.
    pub fn parse(bytes: &[u8]) -> CardResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(CardError::Transport(format!(
                "Command of {} bytes is shorter than the header",
                bytes.len()
            )));
        }

        let (cla, ins, p1, p2) = (bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[HEADER_LEN..];

        let (data, le) = match body.len() {
            0 => (Vec::new(), None),
            1 => (Vec::new(), Some(body[0])),
            _ => {
                let lc = body[0] as usize;
                if lc == 0 {
                    return Err(CardError::Transport(
                        "Extended length commands are not supported".to_string(),
                    ));
                }
                let rest = &body[1..];
                match rest.len().checked_sub(lc) {
                    Some(0) => (rest.to_vec(), None),
                    Some(1) => (rest[..lc].to_vec(), Some(rest[lc])),
                    _ => {
                        return Err(CardError::Transport(format!(
                            "Lc {} does not match {} data bytes",
                            lc,
                            rest.len()
                        )))
                    }
                }
            }
        };

        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le,
        })
    }

    pub fn to_bytes(&self) -> CardResult<Vec<u8>> {
        if self.data.len() > MAX_DATA_LEN {
            return Err(CardError::BufferTooSmall {
                needed: self.data.len(),
                capacity: MAX_DATA_LEN,
            });
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + 2 + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            bytes.push(self.data.len() as u8);
            bytes.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            bytes.push(le);
        }
        Ok(bytes)
    }

    pub fn opcode(&self) -> CardResult<Opcode> {
        Opcode::from_ins(self.ins)
    }

    /// Require exactly `len` data bytes.
    pub fn expect_len(&self, len: usize) -> CardResult<&[u8]> {
        if self.data.len() != len {
            return Err(CardError::WrongLength {
                expected: len,
                actual: self.data.len(),
            });
        }
        Ok(&self.data)
    }
}

/// Response APDU: `data || SW1 SW2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub status: u16,
}

impl Response {
    pub fn success(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            status: status::SW_NO_ERROR,
        }
    }

    /// Fault responses carry the one-byte external fault code as data.
    pub fn fault(error: &CardError) -> Self {
        Self {
            data: vec![error.fault_code().as_byte()],
            status: error.status_word(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == status::SW_NO_ERROR
    }

    pub fn fault_code(&self) -> Option<FaultCode> {
        if self.is_success() {
            return None;
        }
        self.data.first().copied().and_then(FaultCode::from_byte)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 2);
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.status.to_be_bytes());
        bytes
    }

    /// Append the status word to `data` in place. The returned buffer is the
    /// only copy of the payload; wiping it is the transport's job.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = self.data;
        bytes.extend_from_slice(&self.status.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> CardResult<Self> {
        if bytes.len() < 2 {
            return Err(CardError::Transport(
                "Response is missing its status word".to_string(),
            ));
        }
        let split = bytes.len() - 2;
        Ok(Self {
            data: bytes[..split].to_vec(),
            status: u16::from_be_bytes([bytes[split], bytes[split + 1]]),
        })
    }
}

impl From<CardResult<Vec<u8>>> for Response {
    fn from(result: CardResult<Vec<u8>>) -> Self {
        match result {
            Ok(data) => Response::success(data),
            Err(err) => Response::fault(&err),
        }
    }
}
