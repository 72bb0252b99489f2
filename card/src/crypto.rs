//! Stateless cryptographic primitives shared by the vault and the ledger.
//!
//! Nothing in this module keeps key material between calls: keys come in as
//! borrowed buffers and every derived secret is returned inside `Zeroizing`.

use crate::errors::{CardError, CardResult};
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const HASH_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// `ephemeral_public || nonce || sealed session key`.
pub const WRAPPED_SESSION_KEY_LEN: usize = PUBLIC_KEY_LEN + NONCE_LEN + SESSION_KEY_LEN + TAG_LEN;

const SESSION_WRAP_DOMAIN: &[u8] = b"zereans.session.wrap.v1";

#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoOps;

impl CryptoOps {
    /// SHA-256 digest of `data`.
    pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
        Self::hash_parts(&[data])
    }

    /// SHA-256 over the concatenation of `parts`.
    pub fn hash_parts(parts: &[&[u8]]) -> [u8; HASH_LEN] {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut output = [0u8; HASH_LEN];
        output.copy_from_slice(&digest);
        output
    }

    pub fn verify_integrity(data: &[u8], expected: &[u8]) -> bool {
        expected.len() == HASH_LEN && Self::hash(data).as_slice() == expected
    }

    pub fn random_bytes<const N: usize>() -> CardResult<[u8; N]> {
        let mut bytes = [0u8; N];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CardError::CryptoError(format!("Entropy source failed: {}", e)))?;
        Ok(bytes)
    }

    pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        key.sign(message).to_bytes()
    }

    /// Strict Ed25519 verification. Malformed keys or signatures verify as false.
    pub fn verify(public_key: &[u8; PUBLIC_KEY_LEN], message: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(signature_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        let signature = Signature::from_bytes(&signature_bytes);
        verifying_key.verify_strict(message, &signature).is_ok()
    }

    /// AES-256-GCM seal. Output is `nonce || ciphertext || tag`.
    pub fn seal(key: &[u8; SESSION_KEY_LEN], plaintext: &[u8]) -> CardResult<Vec<u8>> {
        Self::seal_with_aad(key, plaintext, &[])
    }

    pub fn open(key: &[u8; SESSION_KEY_LEN], sealed: &[u8]) -> CardResult<Zeroizing<Vec<u8>>> {
        Self::open_with_aad(key, sealed, &[])
    }

    fn seal_with_aad(
        key: &[u8; SESSION_KEY_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CardResult<Vec<u8>> {
        let key = aead_key(key)?;
        let nonce_bytes = Self::random_bytes::<NONCE_LEN>()?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        in_out.extend_from_slice(plaintext);
        key.seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| CardError::CryptoError("Encryption failure".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    fn open_with_aad(
        key: &[u8; SESSION_KEY_LEN],
        sealed: &[u8],
        aad: &[u8],
    ) -> CardResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CardError::CryptoError(
                "Ciphertext shorter than nonce and authentication tag".to_string(),
            ));
        }
        let key = aead_key(key)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&sealed[..NONCE_LEN]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = Zeroizing::new(sealed[NONCE_LEN..].to_vec());
        let plaintext_len = key
            .open_in_place(nonce, Aad::from(aad), in_out.as_mut_slice())
            .map_err(|_| CardError::CryptoError("Decryption failure".to_string()))?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    /// X25519 public key for a (clamped) secret scalar.
    pub fn x25519_public(secret: &[u8; 32]) -> [u8; PUBLIC_KEY_LEN] {
        MontgomeryPoint::mul_base_clamped(*secret).to_bytes()
    }

    /// Wrap `session_key` for the holder of `peer_public` using an ephemeral
    /// X25519 agreement.
    pub fn wrap_session_key(
        peer_public: &[u8; PUBLIC_KEY_LEN],
        session_key: &[u8; SESSION_KEY_LEN],
    ) -> CardResult<Vec<u8>> {
        let ephemeral_secret = Zeroizing::new(Self::random_bytes::<32>()?);
        let ephemeral_public = Self::x25519_public(&ephemeral_secret);
        let shared = Zeroizing::new(
            MontgomeryPoint(*peer_public)
                .mul_clamped(*ephemeral_secret)
                .to_bytes(),
        );
        let wrap_key = derive_wrap_key(&shared, &ephemeral_public, peer_public)?;

        let sealed = Self::seal_with_aad(&wrap_key, session_key, &ephemeral_public)?;
        let mut wrapped = Vec::with_capacity(WRAPPED_SESSION_KEY_LEN);
        wrapped.extend_from_slice(&ephemeral_public);
        wrapped.extend_from_slice(&sealed);
        debug_assert_eq!(wrapped.len(), WRAPPED_SESSION_KEY_LEN);
        Ok(wrapped)
    }

    /// Host-side inverse of [`CryptoOps::wrap_session_key`].
    pub fn unwrap_session_key(
        recipient_secret: &[u8; 32],
        wrapped: &[u8],
    ) -> CardResult<Zeroizing<[u8; SESSION_KEY_LEN]>> {
        if wrapped.len() != WRAPPED_SESSION_KEY_LEN {
            return Err(CardError::WrongLength {
                expected: WRAPPED_SESSION_KEY_LEN,
                actual: wrapped.len(),
            });
        }

        let mut ephemeral_public = [0u8; PUBLIC_KEY_LEN];
        ephemeral_public.copy_from_slice(&wrapped[..PUBLIC_KEY_LEN]);
        let recipient_public = Self::x25519_public(recipient_secret);
        let shared = Zeroizing::new(
            MontgomeryPoint(ephemeral_public)
                .mul_clamped(*recipient_secret)
                .to_bytes(),
        );
        let wrap_key = derive_wrap_key(&shared, &ephemeral_public, &recipient_public)?;

        let plaintext =
            Self::open_with_aad(&wrap_key, &wrapped[PUBLIC_KEY_LEN..], &ephemeral_public)?;
        if plaintext.len() != SESSION_KEY_LEN {
            return Err(CardError::CryptoError(
                "Unwrapped session key has unexpected length".to_string(),
            ));
        }
        let mut session_key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        session_key.copy_from_slice(&plaintext);
        Ok(session_key)
    }
}

fn aead_key(key: &[u8; SESSION_KEY_LEN]) -> CardResult<LessSafeKey> {
    let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|e| CardError::CryptoError(format!("Invalid encryption key: {e}")))?;
    Ok(LessSafeKey::new(unbound_key))
}

fn derive_wrap_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; PUBLIC_KEY_LEN],
    recipient_public: &[u8; PUBLIC_KEY_LEN],
) -> CardResult<Zeroizing<[u8; SESSION_KEY_LEN]>> {
    // An all-zero agreement means the peer sent a low-order point.
    if shared.iter().all(|&byte| byte == 0) {
        return Err(CardError::CryptoError(
            "Key agreement produced a degenerate shared secret".to_string(),
        ));
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(SESSION_WRAP_DOMAIN)
        .map_err(|e| CardError::CryptoError(format!("HMAC error: {}", e)))?;
    mac.update(shared);
    mac.update(ephemeral_public);
    mac.update(recipient_public);
    let digest = mac.finalize().into_bytes();

    let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    key.copy_from_slice(&digest[..SESSION_KEY_LEN]);
    Ok(key)
}
