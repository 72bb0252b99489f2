use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardError {
    // Precondition errors
    Precondition(String),

    // Validation errors
    ValidationError(String),
    WrongLength { expected: usize, actual: usize },
    InvalidAmount(String),
    InsufficientFunds { requested: i16, available: i16 },
    InvalidPartner(u8),
    UnsupportedOperation(u8),
    ClassNotSupported(u8),
    Transport(String),

    // Authorization errors
    AuthenticationFailed(String),
    InvalidSignature(String),

    // Resource errors
    RegistryFull,
    BufferTooSmall { needed: usize, capacity: usize },
    CounterExhausted,

    // Internal errors
    CryptoError(String),
    LoggingError(String),
    ConfigError(String),
    StorageError(String),
}

/// Fault taxonomy used when reasoning about rollback and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCategory {
    Precondition,
    Validation,
    Authorization,
    Resource,
    Internal,
}

/// Fault codes surfaced to the caller at the command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultCode {
    InvalidPartner = 0x01,
    InsufficientFunds = 0x02,
    InvalidSignature = 0x03,
    Transport = 0x04,
    AuthenticationFailed = 0x05,
}

impl FaultCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::InvalidPartner),
            0x02 => Some(Self::InsufficientFunds),
            0x03 => Some(Self::InvalidSignature),
            0x04 => Some(Self::Transport),
            0x05 => Some(Self::AuthenticationFailed),
            _ => None,
        }
    }
}

/// ISO 7816 status words used on the response channel.
pub mod status {
    pub const SW_NO_ERROR: u16 = 0x9000;
    pub const SW_WRONG_LENGTH: u16 = 0x6700;
    pub const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
    pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    pub const SW_WRONG_DATA: u16 = 0x6A80;
    pub const SW_FILE_FULL: u16 = 0x6A84;
    pub const SW_DATA_NOT_FOUND: u16 = 0x6A88;
    pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const SW_CLA_NOT_SUPPORTED: u16 = 0x6E00;
    pub const SW_UNKNOWN: u16 = 0x6F00;
}

impl CardError {
    pub fn category(&self) -> FaultCategory {
        match self {
            CardError::Precondition(_) => FaultCategory::Precondition,

            CardError::ValidationError(_)
            | CardError::WrongLength { .. }
            | CardError::InvalidAmount(_)
            | CardError::InsufficientFunds { .. }
            | CardError::InvalidPartner(_)
            | CardError::UnsupportedOperation(_)
            | CardError::ClassNotSupported(_)
            | CardError::Transport(_) => FaultCategory::Validation,

            CardError::AuthenticationFailed(_) | CardError::InvalidSignature(_) => {
                FaultCategory::Authorization
            }

            CardError::RegistryFull
            | CardError::BufferTooSmall { .. }
            | CardError::CounterExhausted => FaultCategory::Resource,

            CardError::CryptoError(_)
            | CardError::LoggingError(_)
            | CardError::ConfigError(_)
            | CardError::StorageError(_) => FaultCategory::Internal,
        }
    }

    /// Collapse an internal fault onto one of the five caller-visible codes.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            CardError::Precondition(_) | CardError::AuthenticationFailed(_) => {
                FaultCode::AuthenticationFailed
            }
            CardError::InvalidSignature(_) => FaultCode::InvalidSignature,
            CardError::InvalidAmount(_) | CardError::InsufficientFunds { .. } => {
                FaultCode::InsufficientFunds
            }
            CardError::InvalidPartner(_) | CardError::RegistryFull => FaultCode::InvalidPartner,
            _ => FaultCode::Transport,
        }
    }

    pub fn status_word(&self) -> u16 {
        match self {
            CardError::Precondition(_) | CardError::InsufficientFunds { .. } => {
                status::SW_CONDITIONS_NOT_SATISFIED
            }
            CardError::AuthenticationFailed(_) | CardError::InvalidSignature(_) => {
                status::SW_SECURITY_STATUS_NOT_SATISFIED
            }
            CardError::ValidationError(_) | CardError::InvalidAmount(_) => status::SW_WRONG_DATA,
            CardError::WrongLength { .. } | CardError::Transport(_) => status::SW_WRONG_LENGTH,
            CardError::InvalidPartner(_) => status::SW_DATA_NOT_FOUND,
            CardError::RegistryFull
            | CardError::BufferTooSmall { .. }
            | CardError::CounterExhausted => status::SW_FILE_FULL,
            CardError::UnsupportedOperation(_) => status::SW_INS_NOT_SUPPORTED,
            CardError::ClassNotSupported(_) => status::SW_CLA_NOT_SUPPORTED,
            CardError::CryptoError(_)
            | CardError::LoggingError(_)
            | CardError::ConfigError(_)
            | CardError::StorageError(_) => status::SW_UNKNOWN,
        }
    }
}

impl fmt::Display for CardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CardError::Precondition(msg) => write!(f, "Precondition not satisfied: {}", msg),

            CardError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            CardError::WrongLength { expected, actual } => {
                write!(f, "Wrong length: expected {}, got {}", expected, actual)
            }
            CardError::InvalidAmount(msg) => write!(f, "Invalid amount: {}", msg),
            CardError::InsufficientFunds {
                requested,
                available,
            } => write!(
                f,
                "Insufficient funds: requested {}, available {}",
                requested, available
            ),
            CardError::InvalidPartner(id) => write!(f, "Invalid partner: {:#04x}", id),
            CardError::UnsupportedOperation(ins) => {
                write!(f, "Unsupported operation: {:#04x}", ins)
            }
            CardError::ClassNotSupported(cla) => write!(f, "Class not supported: {:#04x}", cla),
            CardError::Transport(msg) => write!(f, "Transport error: {}", msg),

            CardError::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            CardError::InvalidSignature(msg) => write!(f, "Invalid signature: {}", msg),

            CardError::RegistryFull => write!(f, "Partner registry is full"),
            CardError::BufferTooSmall { needed, capacity } => write!(
                f,
                "Buffer too small: needed {}, capacity {}",
                needed, capacity
            ),
            CardError::CounterExhausted => write!(f, "Transaction counter exhausted"),

            CardError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            CardError::LoggingError(msg) => write!(f, "Transaction log error: {}", msg),
            CardError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            CardError::StorageError(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for CardError {}

pub type CardResult<T> = Result<T, CardError>;

// Helper macro for easy error creation
#[macro_export]
macro_rules! card_error {
    ($variant:ident, $msg:expr) => {
        $crate::errors::CardError::$variant($msg.to_string())
    };
    ($variant:ident) => {
        $crate::errors::CardError::$variant
    };
}

impl From<std::io::Error> for CardError {
    fn from(error: std::io::Error) -> Self {
        CardError::StorageError(error.to_string())
    }
}

impl From<serde_json::Error> for CardError {
    fn from(error: serde_json::Error) -> Self {
        CardError::ConfigError(format!("JSON error: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_faults_collapse_to_transport() {
        for err in [
            CardError::CryptoError("entropy".into()),
            CardError::LoggingError("signer offline".into()),
            CardError::ConfigError("bad level".into()),
            CardError::StorageError("disk".into()),
        ] {
            assert_eq!(err.category(), FaultCategory::Internal);
            assert_eq!(err.fault_code(), FaultCode::Transport);
            assert_eq!(err.status_word(), status::SW_UNKNOWN);
        }
    }

    #[test]
    fn funds_faults_share_code() {
        let short = CardError::InsufficientFunds {
            requested: 2000,
            available: 1000,
        };
        let invalid = card_error!(InvalidAmount, "zero");
        assert_eq!(short.fault_code(), FaultCode::InsufficientFunds);
        assert_eq!(invalid.fault_code(), FaultCode::InsufficientFunds);
        assert_ne!(short.status_word(), invalid.status_word());
    }

    #[test]
    fn precondition_maps_to_authentication_failed() {
        let err = card_error!(Precondition, "not authenticated");
        assert_eq!(err.category(), FaultCategory::Precondition);
        assert_eq!(err.fault_code(), FaultCode::AuthenticationFailed);
        assert_eq!(err.status_word(), status::SW_CONDITIONS_NOT_SATISFIED);
    }

    #[test]
    fn fault_code_bytes_round_trip() {
        for code in [
            FaultCode::InvalidPartner,
            FaultCode::InsufficientFunds,
            FaultCode::InvalidSignature,
            FaultCode::Transport,
            FaultCode::AuthenticationFailed,
        ] {
            assert_eq!(FaultCode::from_byte(code.as_byte()), Some(code));
        }
        assert_eq!(FaultCode::from_byte(0x00), None);
    }
}
