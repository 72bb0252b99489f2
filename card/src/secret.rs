//! Scoped secret buffers.
//!
//! Every long-lived secret on the card sits in a [`SecretBuffer`]. Reading a
//! one-shot secret goes through [`SecretBuffer::consume`], which hands out a
//! [`ConsumeGuard`]; the guard wipes and disarms the buffer when it goes out of
//! scope, so the secret is erased on success, on fault and on early return
//! alike.

use std::fmt;
use std::ops::Deref;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::errors::{CardError, CardResult};

pub struct SecretBuffer<const N: usize> {
    bytes: [u8; N],
    armed: bool,
}

impl<const N: usize> SecretBuffer<N> {
    pub fn zeroed() -> Self {
        Self {
            bytes: [0u8; N],
            armed: false,
        }
    }

    /// Take ownership of `source`, wiping the caller's copy.
    pub fn from_array(source: &mut [u8; N]) -> Self {
        let mut buffer = Self::zeroed();
        buffer.bytes.copy_from_slice(source);
        buffer.armed = true;
        source.zeroize();
        buffer
    }

    /// Overwrite the buffer with fresh OS entropy and arm it.
    pub fn fill_random(&mut self) -> CardResult<()> {
        self.wipe();
        OsRng
            .try_fill_bytes(&mut self.bytes)
            .map_err(|e| CardError::CryptoError(format!("Entropy source failed: {}", e)))?;
        self.armed = true;
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|&byte| byte == 0)
    }

    pub(crate) fn expose(&self) -> CardResult<&[u8; N]> {
        if !self.armed {
            return Err(CardError::Precondition(
                "Secret buffer holds no key material".to_string(),
            ));
        }
        Ok(&self.bytes)
    }

    /// Borrow the secret for exactly one use.
    pub(crate) fn consume(&mut self) -> CardResult<ConsumeGuard<'_, N>> {
        if !self.armed {
            return Err(CardError::Precondition(
                "Secret buffer holds no key material".to_string(),
            ));
        }
        Ok(ConsumeGuard { buffer: self })
    }

    pub fn wipe(&mut self) {
        self.bytes.zeroize();
        self.armed = false;
    }
}

impl<const N: usize> Default for SecretBuffer<N> {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl<const N: usize> Drop for SecretBuffer<N> {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl<const N: usize> fmt::Debug for SecretBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBuffer")
            .field("len", &N)
            .field("armed", &self.armed)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// One-shot view of a [`SecretBuffer`]; wipes the buffer on drop.
pub struct ConsumeGuard<'a, const N: usize> {
    buffer: &'a mut SecretBuffer<N>,
}

impl<const N: usize> Deref for ConsumeGuard<'_, N> {
    type Target = [u8; N];

    fn deref(&self) -> &Self::Target {
        &self.buffer.bytes
    }
}

impl<const N: usize> Drop for ConsumeGuard<'_, N> {
    fn drop(&mut self) {
        self.buffer.wipe();
    }
}
