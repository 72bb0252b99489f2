// lib.rs - Core library structure for the partner card

pub mod apdu;
pub mod app_state;
pub mod codec;
pub mod config;
pub mod config_store;
pub mod crypto;
pub mod errors;
pub mod key_vault;
pub mod ledger;
pub mod partner;
pub mod secret;
pub mod session;

// Re-export common types
pub use apdu::{Command, Opcode, Response};
pub use app_state::{DeviceContext, DeviceState, SharedDevice};
pub use codec::{MessageCodec, MessageType, ProtocolMessage};
pub use config::{CardConfig, Environment};
pub use config_store::ConfigStore;
pub use crypto::CryptoOps;
pub use errors::{CardError, CardResult, FaultCategory, FaultCode};
pub use key_vault::KeyVault;
pub use ledger::{
    JournalEntry, LedgerAuthority, TransactionLedger, TransactionPayload, TransactionReceipt,
    TransactionRecord,
};
pub use partner::PartnerRegistry;
pub use secret::SecretBuffer;
pub use session::SessionStateMachine;
