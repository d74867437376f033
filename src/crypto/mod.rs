//! Narrow capability interface over the underlying primitives.
//!
//! Everything that draws randomness or runs the AEAD goes through a
//! [`CryptoProvider`], so key generation and message sealing can be swapped
//! or faulted in tests. Key agreement and signatures are deterministic
//! functions of provider-generated seeds and use the dalek types directly.

mod x25519;
pub use x25519::*;

use crate::Error;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use rand::TryRngCore;
use rand::rngs::OsRng;

/// AES-GCM-SIV uses 12-byte (96-bit) nonces.
pub const NONCE_SIZE: usize = 12;

/// Source of randomness and authenticated encryption.
pub trait CryptoProvider: Send + Sync {
    /// Fills `dest` with cryptographically secure random bytes.
    fn fill_random(&self, dest: &mut [u8]) -> Result<(), Error>;

    /// Encrypts and authenticates `plaintext` bound to `aad`.
    fn seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Reverses [`CryptoProvider::seal`]; fails if anything was tampered with.
    fn open(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// Generates a fresh 32-byte seed for key pair derivation.
pub(crate) fn generate_random_seed(provider: &dyn CryptoProvider) -> Result<Box<[u8; 32]>, Error> {
    let mut seed = Box::new([0u8; 32]);
    provider.fill_random(seed.as_mut_slice())?;
    Ok(seed)
}

/// Operating system randomness with AES-256-GCM-SIV.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsCryptoProvider;

impl CryptoProvider for OsCryptoProvider {
    fn fill_random(&self, dest: &mut [u8]) -> Result<(), Error> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|err| Error::KeyGeneration(err.to_string()))
    }

    fn seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key));
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|err| Error::Encryption(err.to_string()))
    }

    fn open(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|err| Error::Decryption(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let provider = OsCryptoProvider;
        let key = [7u8; 32];
        let nonce = [1u8; NONCE_SIZE];

        let sealed = provider.seal(&key, &nonce, b"payload", b"ad").unwrap();
        assert_ne!(sealed.as_slice(), b"payload");

        let opened = provider.open(&key, &nonce, &sealed, b"ad").unwrap();
        assert_eq!(opened, b"payload");

        let err = provider.open(&key, &nonce, &sealed, b"other").unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[test]
    fn test_random_seeds_differ() {
        let provider = OsCryptoProvider;
        let a = generate_random_seed(&provider).unwrap();
        let b = generate_random_seed(&provider).unwrap();
        assert_ne!(a, b);
    }
}
