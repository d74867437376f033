use crate::Error;
use crate::crypto::{CryptoProvider, X25519PublicKey, X25519Secret, generate_random_seed};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A user's long-term identity.
///
/// One 32-byte seed yields both halves: an Ed25519 key that signs pre-keys
/// and an X25519 key used in the agreement itself.
pub struct IdentityKey {
    signing: Box<SigningKey>,
    agreement: X25519Secret,
}

impl IdentityKey {
    pub fn generate(provider: &dyn CryptoProvider) -> Result<Self, Error> {
        let seed = generate_random_seed(provider)
            .map_err(|err| Error::KeyGeneration(format!("identity seed: {err}")))?;
        let signing = Box::new(SigningKey::from_bytes(&seed));

        Ok(Self {
            signing,
            agreement: X25519Secret::from(seed),
        })
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Key peers use to check pre-key signatures.
    pub fn signing_key_public(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The identity as it enters X3DH and the session associated data.
    pub fn dh_key_public(&self) -> X25519PublicKey {
        self.agreement.public_key()
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.agreement.dh(public_key)
    }
}

impl Zeroize for IdentityKey {
    fn zeroize(&mut self) {
        self.agreement.zeroize();
    }
}

impl ZeroizeOnDrop for IdentityKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NONCE_SIZE, OsCryptoProvider};

    #[test]
    fn test_signatures_verify_under_the_public_signing_key() {
        let identity = IdentityKey::generate(&OsCryptoProvider).unwrap();
        let verifying = identity.signing_key_public();

        let signature = identity.sign(b"pre-key 1");
        assert!(verifying.verify_strict(b"pre-key 1", &signature).is_ok());
        assert!(verifying.verify_strict(b"pre-key 2", &signature).is_err());
    }

    #[test]
    fn test_two_identities_agree_on_one_secret() {
        let first = IdentityKey::generate(&OsCryptoProvider).unwrap();
        let second = IdentityKey::generate(&OsCryptoProvider).unwrap();

        assert_ne!(first.dh_key_public(), second.dh_key_public());
        assert_eq!(
            first.dh(&second.dh_key_public()).as_bytes(),
            second.dh(&first.dh_key_public()).as_bytes()
        );
    }

    #[test]
    fn test_generation_needs_entropy() {
        struct Dry;
        impl CryptoProvider for Dry {
            fn fill_random(&self, _: &mut [u8]) -> Result<(), Error> {
                Err(Error::KeyGeneration("no entropy".to_string()))
            }
            fn seal(
                &self,
                _: &[u8; 32],
                _: &[u8; NONCE_SIZE],
                _: &[u8],
                _: &[u8],
            ) -> Result<Vec<u8>, Error> {
                Err(Error::Encryption("unused".to_string()))
            }
            fn open(
                &self,
                _: &[u8; 32],
                _: &[u8; NONCE_SIZE],
                _: &[u8],
                _: &[u8],
            ) -> Result<Vec<u8>, Error> {
                Err(Error::Decryption("unused".to_string()))
            }
        }

        assert!(matches!(IdentityKey::generate(&Dry), Err(Error::KeyGeneration(_))));
    }
}
