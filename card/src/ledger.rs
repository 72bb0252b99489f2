use arrayvec::ArrayVec;
use chrono::{DateTime, Utc};

use crate::crypto::{CryptoOps, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::errors::{CardError, CardResult};

const TRANSACTION_DOMAIN: &[u8] = b"zereans.txn.v1";
const RECORD_DOMAIN: &[u8] = b"zereans.txn.record.v1";

/// Upper bound on retained journal entries, whatever the configuration asks.
pub const MAX_JOURNAL_CAPACITY: usize = 32;
pub const PAYLOAD_LEN: usize = 6;
/// `counter || amount || new_balance || integrity_tag`.
pub const RECORD_LEN: usize = 6 + SIGNATURE_LEN;

/// Cryptographic collaborator for the ledger: checks the authority's
/// transaction authorization and signs the tamper-evident record.
pub trait LedgerAuthority {
    fn verify_authorization(&self, payload: &[u8], signature: &[u8]) -> CardResult<bool>;
    fn sign_record(&self, record: &[u8]) -> CardResult<[u8; SIGNATURE_LEN]>;
}

/// Canonical `{amount, balance, counter}` payload the authority signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionPayload {
    pub amount: i16,
    pub balance: i16,
    pub counter: u16,
}

impl TransactionPayload {
    pub fn to_bytes(&self) -> [u8; PAYLOAD_LEN] {
        let mut bytes = [0u8; PAYLOAD_LEN];
        bytes[0..2].copy_from_slice(&self.amount.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.balance.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }

    /// Domain-separated message covered by the authorization signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(TRANSACTION_DOMAIN.len() + PAYLOAD_LEN);
        message.extend_from_slice(TRANSACTION_DOMAIN);
        message.extend_from_slice(&self.to_bytes());
        message
    }
}

/// Signed log record emitted with every committed transaction.
#[derive(Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub counter: u16,
    pub amount: i16,
    pub new_balance: i16,
    pub integrity_tag: [u8; SIGNATURE_LEN],
}

impl TransactionRecord {
    /// Message covered by the integrity tag.
    pub fn signed_bytes(counter: u16, amount: i16, new_balance: i16) -> Vec<u8> {
        let mut message = Vec::with_capacity(RECORD_DOMAIN.len() + 6);
        message.extend_from_slice(RECORD_DOMAIN);
        message.extend_from_slice(&counter.to_be_bytes());
        message.extend_from_slice(&amount.to_be_bytes());
        message.extend_from_slice(&new_balance.to_be_bytes());
        message
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[0..2].copy_from_slice(&self.counter.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.amount.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.new_balance.to_be_bytes());
        bytes[6..].copy_from_slice(&self.integrity_tag);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> CardResult<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(CardError::WrongLength {
                expected: RECORD_LEN,
                actual: bytes.len(),
            });
        }
        let mut integrity_tag = [0u8; SIGNATURE_LEN];
        integrity_tag.copy_from_slice(&bytes[6..]);
        Ok(Self {
            counter: u16::from_be_bytes([bytes[0], bytes[1]]),
            amount: i16::from_be_bytes([bytes[2], bytes[3]]),
            new_balance: i16::from_be_bytes([bytes[4], bytes[5]]),
            integrity_tag,
        })
    }

    /// Check the integrity tag against the device identity that produced it.
    pub fn verify(&self, device_public_key: &[u8; PUBLIC_KEY_LEN]) -> bool {
        let message = Self::signed_bytes(self.counter, self.amount, self.new_balance);
        CryptoOps::verify(device_public_key, &message, &self.integrity_tag)
    }
}

impl std::fmt::Debug for TransactionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRecord")
            .field("counter", &self.counter)
            .field("amount", &self.amount)
            .field("new_balance", &self.new_balance)
            .field("integrity_tag", &hex::encode(self.integrity_tag))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub record: TransactionRecord,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub balance: i16,
    pub counter: u16,
}

/// Result of a committed transaction.
#[derive(Debug, Clone)]
pub struct TransactionReceipt {
    pub new_balance: i16,
    pub record: TransactionRecord,
}

impl TransactionReceipt {
    /// `new_balance || record`, as returned on the command channel.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + RECORD_LEN);
        bytes.extend_from_slice(&self.new_balance.to_be_bytes());
        bytes.extend_from_slice(&self.record.to_bytes());
        bytes
    }
}

/// Sole owner of the balance and the transaction counter.
#[derive(Debug)]
pub struct TransactionLedger {
    balance: i16,
    counter: u16,
    ceiling: i16,
    journal: ArrayVec<JournalEntry, MAX_JOURNAL_CAPACITY>,
    journal_capacity: usize,
}

impl TransactionLedger {
    pub fn new(ceiling: i16, journal_capacity: usize) -> CardResult<Self> {
        if ceiling <= 0 {
            return Err(CardError::ConfigError(format!(
                "Transaction ceiling must be positive, got {}",
                ceiling
            )));
        }
        if journal_capacity == 0 || journal_capacity > MAX_JOURNAL_CAPACITY {
            return Err(CardError::ConfigError(format!(
                "Journal capacity must be within 1..={}, got {}",
                MAX_JOURNAL_CAPACITY, journal_capacity
            )));
        }

        Ok(Self {
            balance: 0,
            counter: 0,
            ceiling,
            journal: ArrayVec::new(),
            journal_capacity,
        })
    }

    /// Start a fresh ledger at `starting_balance` with counter 0.
    pub fn reset(&mut self, starting_balance: i16) -> CardResult<()> {
        if starting_balance < 0 {
            return Err(CardError::InvalidAmount(format!(
                "Starting balance cannot be negative: {}",
                starting_balance
            )));
        }
        self.balance = starting_balance;
        self.counter = 0;
        self.journal.clear();
        Ok(())
    }

    pub fn balance(&self) -> i16 {
        self.balance
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    pub fn ceiling(&self) -> i16 {
        self.ceiling
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            balance: self.balance,
            counter: self.counter,
        }
    }

    /// Most recent committed records, oldest first.
    pub fn journal(&self) -> &[JournalEntry] {
        &self.journal
    }

    /// Payload an authority has to sign to authorize `amount` right now.
    pub fn payload_for(&self, amount: i16) -> TransactionPayload {
        TransactionPayload {
            amount,
            balance: self.balance,
            counter: self.counter,
        }
    }

    /// Debit `amount` atomically.
    ///
    /// Balance, counter and journal change together or not at all: inputs
    /// and the authorization are checked before anything is touched, and a
    /// failure to produce the signed record restores the pre-call snapshot.
    pub fn apply_transaction<A: LedgerAuthority + ?Sized>(
        &mut self,
        amount: i16,
        authorization: &[u8],
        authority: &A,
    ) -> CardResult<TransactionReceipt> {
        if amount <= 0 || amount > self.ceiling {
            return Err(CardError::InvalidAmount(format!(
                "Amount {} outside 1..={}",
                amount, self.ceiling
            )));
        }
        if amount > self.balance {
            return Err(CardError::InsufficientFunds {
                requested: amount,
                available: self.balance,
            });
        }
        if self.counter == u16::MAX {
            return Err(CardError::CounterExhausted);
        }

        let payload = self.payload_for(amount);
        if !authority.verify_authorization(&payload.signing_bytes(), authorization)? {
            return Err(CardError::InvalidSignature(
                "Transaction authorization rejected".to_string(),
            ));
        }

        let snapshot = self.snapshot();
        self.balance -= amount;
        self.counter += 1;

        let record = match self.build_record(amount, authority) {
            Ok(record) => record,
            Err(err) => {
                self.restore(snapshot);
                log::warn!(
                    "Transaction {} rolled back: record construction failed",
                    snapshot.counter + 1
                );
                return Err(CardError::LoggingError(err.to_string()));
            }
        };

        if self.journal.len() >= self.journal_capacity {
            self.journal.remove(0);
        }
        self.journal.push(JournalEntry {
            record: record.clone(),
            recorded_at: Utc::now(),
        });

        log::info!(
            "Transaction {} committed: amount {}, balance {}",
            self.counter,
            amount,
            self.balance
        );

        Ok(TransactionReceipt {
            new_balance: self.balance,
            record,
        })
    }

    fn build_record<A: LedgerAuthority + ?Sized>(
        &self,
        amount: i16,
        authority: &A,
    ) -> CardResult<TransactionRecord> {
        let message = TransactionRecord::signed_bytes(self.counter, amount, self.balance);
        let integrity_tag = authority.sign_record(&message)?;
        Ok(TransactionRecord {
            counter: self.counter,
            amount,
            new_balance: self.balance,
            integrity_tag,
        })
    }

    fn restore(&mut self, snapshot: LedgerSnapshot) {
        self.balance = snapshot.balance;
        self.counter = snapshot.counter;
    }
}
