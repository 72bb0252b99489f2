use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::apdu::{Command, Response};
use crate::codec::MessageCodec;
use crate::config::CardConfig;
use crate::crypto::HASH_LEN;
use crate::errors::CardResult;
use crate::key_vault::KeyVault;
use crate::ledger::TransactionLedger;
use crate::partner::PartnerRegistry;
use crate::session::SessionStateMachine;

/// Applet-wide lifecycle state. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceState {
    Uninitialized = 0x00,
    Initialized = 0x01,
    Authenticated = 0x02,
    Active = 0x03,
}

impl DeviceState {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// All state of one device. Handed explicitly to the state machine; there is
/// no process-wide card state.
#[derive(Debug)]
pub struct DeviceContext {
    pub(crate) state: DeviceState,
    pub(crate) authenticated: bool,
    pub(crate) vault: KeyVault,
    pub(crate) ledger: TransactionLedger,
    pub(crate) partners: PartnerRegistry,
    pub(crate) codec: MessageCodec,
    /// SHA-256 of the last accepted authentication challenge.
    pub(crate) last_challenge: Option<[u8; HASH_LEN]>,
    config: CardConfig,
    machine: SessionStateMachine,
}

impl DeviceContext {
    pub fn new(config: CardConfig) -> CardResult<Self> {
        config.validate()?;
        let ledger =
            TransactionLedger::new(config.max_transaction_amount, config.journal_capacity)?;

        Ok(Self {
            state: DeviceState::Uninitialized,
            authenticated: false,
            vault: KeyVault::new(),
            ledger,
            partners: PartnerRegistry::new(),
            codec: MessageCodec::new(),
            last_challenge: None,
            config,
            machine: SessionStateMachine::new(),
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn partners(&self) -> &PartnerRegistry {
        &self.partners
    }

    pub fn balance(&self) -> i16 {
        self.ledger.balance()
    }

    pub fn counter(&self) -> u16 {
        self.ledger.counter()
    }

    /// Run one decoded command to completion.
    pub fn execute(&mut self, command: &Command) -> Response {
        let machine = self.machine;
        machine.dispatch(self, command)
    }

    /// Run one raw APDU and return the raw response bytes.
    pub fn process(&mut self, apdu: &[u8]) -> Vec<u8> {
        let machine = self.machine;
        machine.process(self, apdu).into_bytes()
    }

    /// Drop the authenticated session without touching keys or balance.
    pub(crate) fn end_session(&mut self) {
        self.vault.erase_session();
        self.authenticated = false;
    }
}

/// Thread-safe device handle. Each call holds the lock for a whole command.
#[derive(Debug, Clone)]
pub struct SharedDevice(pub Arc<Mutex<DeviceContext>>);

impl SharedDevice {
    pub fn new(inner: DeviceContext) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }

    pub fn process(&self, apdu: &[u8]) -> Vec<u8> {
        self.0.lock().process(apdu)
    }

    pub fn execute(&self, command: &Command) -> Response {
        self.0.lock().execute(command)
    }

    pub fn read<F, T>(&self, op: F) -> T
    where
        F: FnOnce(&DeviceContext) -> T,
    {
        let guard = self.0.lock();
        op(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::Opcode;
    use crate::errors::status;

    #[test]
    fn fresh_device_is_uninitialized() {
        let device = DeviceContext::new(CardConfig::default()).unwrap();
        assert_eq!(device.state(), DeviceState::Uninitialized);
        assert!(!device.is_authenticated());
        assert!(!device.vault().has_identity());
        assert_eq!(device.balance(), 0);
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = CardConfig::default();
        config.journal_capacity = 0;
        assert!(DeviceContext::new(config).is_err());
    }

    #[test]
    fn states_are_ordered() {
        assert!(DeviceState::Uninitialized < DeviceState::Initialized);
        assert!(DeviceState::Authenticated < DeviceState::Active);
        assert_eq!(DeviceState::Active.as_byte(), 0x03);
    }

    #[test]
    fn shared_device_serializes_commands() {
        let device = SharedDevice::new(DeviceContext::new(CardConfig::default()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let device = device.clone();
                std::thread::spawn(move || {
                    device.execute(&Command::for_opcode(Opcode::GetStatus, Vec::new()))
                })
            })
            .collect();

        for handle in handles {
            let response = handle.join().unwrap();
            assert_eq!(response.status, status::SW_NO_ERROR);
            assert_eq!(response.data[0], DeviceState::Uninitialized.as_byte());
        }
        assert_eq!(device.read(|ctx| ctx.state()), DeviceState::Uninitialized);
    }
}
