use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use zeroize::Zeroizing;

use crate::crypto::{CryptoOps, PUBLIC_KEY_LEN, SESSION_KEY_LEN, SIGNATURE_LEN};
use crate::errors::{CardError, CardResult};
use crate::ledger::LedgerAuthority;
use crate::secret::SecretBuffer;

/// Owns the device identity key pair, the issuing authority's public key and
/// the one-shot session key.
///
/// No key material exists until [`KeyVault::generate_identity`] runs. The
/// identity private key never leaves this type; callers only ever see public
/// keys, signatures and wrapped session keys.
pub struct KeyVault {
    identity: Option<SigningKey>,
    authority: Option<VerifyingKey>,
    session_key: SecretBuffer<SESSION_KEY_LEN>,
    key_generation: u32,
}

impl KeyVault {
    pub fn new() -> Self {
        Self {
            identity: None,
            authority: None,
            session_key: SecretBuffer::zeroed(),
            key_generation: 0,
        }
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    /// Number of identity key pairs produced so far (initial generation counts).
    pub fn key_generation(&self) -> u32 {
        self.key_generation
    }

    /// Produce the first identity key pair. Refuses to overwrite an existing one.
    pub fn generate_identity(&mut self) -> CardResult<[u8; PUBLIC_KEY_LEN]> {
        if self.identity.is_some() {
            return Err(CardError::Precondition(
                "Identity already generated; rotate instead".to_string(),
            ));
        }

        let signing_key = fresh_signing_key()?;
        let public_key = signing_key.verifying_key().to_bytes();
        self.identity = Some(signing_key);
        self.key_generation = self.key_generation.saturating_add(1);
        log::debug!("Identity key pair generated");
        Ok(public_key)
    }

    /// Replace the identity key pair. The new pair is fully built before the
    /// old one is dropped, so either both halves change or neither does.
    pub fn rotate(&mut self) -> CardResult<[u8; PUBLIC_KEY_LEN]> {
        if self.identity.is_none() {
            return Err(CardError::Precondition(
                "No identity to rotate".to_string(),
            ));
        }

        let replacement = fresh_signing_key()?;
        let public_key = replacement.verifying_key().to_bytes();
        // The previous key zeroizes when dropped here.
        drop(self.identity.replace(replacement));
        self.session_key.wipe();
        self.key_generation = self.key_generation.saturating_add(1);
        log::info!("Identity key pair rotated (generation {})", self.key_generation);
        Ok(public_key)
    }

    pub fn set_authority(&mut self, public_key: &[u8; PUBLIC_KEY_LEN]) -> CardResult<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key).map_err(|e| {
            CardError::ValidationError(format!("Authority key is not a valid point: {}", e))
        })?;
        // verify_strict refuses every signature under a small-order key.
        if verifying_key.is_weak() {
            return Err(CardError::ValidationError(
                "Authority key has small order".to_string(),
            ));
        }
        self.authority = Some(verifying_key);
        Ok(())
    }

    pub fn authority_public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.authority.map(|key| key.to_bytes())
    }

    pub fn public_key(&self) -> CardResult<[u8; PUBLIC_KEY_LEN]> {
        Ok(self.signing_key()?.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> CardResult<[u8; SIGNATURE_LEN]> {
        Ok(CryptoOps::sign(self.signing_key()?, message))
    }

    /// Verify against the device identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CardResult<bool> {
        let public_key = self.public_key()?;
        Ok(CryptoOps::verify(&public_key, message, signature))
    }

    /// Verify against the issuing authority.
    pub fn verify_authority(&self, message: &[u8], signature: &[u8]) -> CardResult<bool> {
        self.signing_key()?;
        let authority = self.authority.ok_or_else(|| {
            CardError::Precondition("No authority key has been recorded".to_string())
        })?;
        Ok(CryptoOps::verify(&authority.to_bytes(), message, signature))
    }

    /// Generate a fresh session key and return it wrapped for `peer_public`.
    /// Any session key still pending is discarded first.
    pub fn establish_session(&mut self, peer_public: &[u8; PUBLIC_KEY_LEN]) -> CardResult<Vec<u8>> {
        self.signing_key()?;
        self.session_key.fill_random()?;

        let wrapped = CryptoOps::wrap_session_key(peer_public, self.session_key.expose()?);
        if wrapped.is_err() {
            self.session_key.wipe();
        }
        wrapped
    }

    pub fn has_session(&self) -> bool {
        self.session_key.is_armed()
    }

    pub fn session_key_is_zeroed(&self) -> bool {
        self.session_key.is_zeroed()
    }

    /// Encrypt under the session key. The key is wiped before this returns.
    pub fn encrypt(&mut self, data: &[u8]) -> CardResult<Vec<u8>> {
        if self.identity.is_none() {
            self.session_key.wipe();
            return Err(CardError::Precondition("No identity present".to_string()));
        }
        let key = self.session_key.consume()?;
        CryptoOps::seal(&key, data)
    }

    /// Decrypt under the session key. The key is wiped before this returns.
    pub fn decrypt(&mut self, data: &[u8]) -> CardResult<Zeroizing<Vec<u8>>> {
        if self.identity.is_none() {
            self.session_key.wipe();
            return Err(CardError::Precondition("No identity present".to_string()));
        }
        let key = self.session_key.consume()?;
        CryptoOps::open(&key, data)
    }

    pub fn erase_session(&mut self) {
        self.session_key.wipe();
    }

    /// Zero every secret held by the vault. Safe to call in any state.
    pub fn erase_all(&mut self) {
        self.identity = None;
        self.authority = None;
        self.session_key.wipe();
    }

    fn signing_key(&self) -> CardResult<&SigningKey> {
        self.identity.as_ref().ok_or_else(|| {
            CardError::Precondition("Key vault has not been initialized".to_string())
        })
    }
}

impl Default for KeyVault {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerAuthority for KeyVault {
    fn verify_authorization(&self, payload: &[u8], signature: &[u8]) -> CardResult<bool> {
        self.verify_authority(payload, signature)
    }

    fn sign_record(&self, record: &[u8]) -> CardResult<[u8; SIGNATURE_LEN]> {
        self.sign(record)
    }
}

impl fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVault")
            .field(
                "public_key",
                &self
                    .identity
                    .as_ref()
                    .map(|key| hex::encode(key.verifying_key().to_bytes())),
            )
            .field(
                "authority",
                &self.authority.map(|key| hex::encode(key.to_bytes())),
            )
            .field("session_armed", &self.session_key.is_armed())
            .field("key_generation", &self.key_generation)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

fn fresh_signing_key() -> CardResult<SigningKey> {
    let seed = Zeroizing::new(CryptoOps::random_bytes::<32>()?);
    Ok(SigningKey::from_bytes(&seed))
}
