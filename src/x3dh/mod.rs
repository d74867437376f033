mod identity_key;
pub use identity_key::*;
mod one_time_pre_key;
pub use one_time_pre_key::OneTimePreKey;
pub(crate) use one_time_pre_key::OneTimePreKeyStore;
mod pre_key;
pub use pre_key::SignedPreKey;
pub(crate) use pre_key::SignedPreKeyStore;

use crate::Error;
use crate::crypto::{CryptoProvider, X25519PublicKey, X25519Secret, generate_random_seed};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const SALT: &[u8] = b"Parley-X3DH-Salt";

/// Root key material both parties agree on after X3DH.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct X3DHSharedSecret(pub(crate) Box<[u8; 32]>);

/// What the initiator walks away with: the agreed secret and the ephemeral
/// key the responder needs to reach it.
pub struct X3DHInitiation {
    shared_secret: X3DHSharedSecret,
    ephemeral_key: X25519PublicKey,
}

impl X3DHInitiation {
    pub fn ephemeral_key(&self) -> X25519PublicKey {
        self.ephemeral_key
    }

    pub fn into_shared_secret(self) -> X3DHSharedSecret {
        self.shared_secret
    }
}

/// Responder keys claimed for exactly one establishment.
///
/// `one_time_pre_key` is `None` when the responder ran out and the
/// establishment falls back to the signed pre-key.
#[derive(Clone, Debug)]
pub struct X3DHPublicKeys {
    pub(crate) identity_key: X25519PublicKey,
    pub(crate) signing_key: VerifyingKey,
    pub(crate) signed_pre_key: (u32, X25519PublicKey),
    pub(crate) signed_pre_key_signature: Signature,
    pub(crate) one_time_pre_key: Option<(u32, X25519PublicKey)>,
}

impl X3DHPublicKeys {
    pub(crate) fn new(
        identity_key: X25519PublicKey,
        signing_key: VerifyingKey,
        signed_pre_key_signature: Signature,
        signed_pre_key: (u32, X25519PublicKey),
        one_time_pre_key: Option<(u32, X25519PublicKey)>,
    ) -> Self {
        Self {
            identity_key,
            signing_key,
            signed_pre_key,
            signed_pre_key_signature,
            one_time_pre_key,
        }
    }

    /// Fails with [`Error::UntrustedIdentity`] unless `signing_key` signed the
    /// signed pre-key.
    pub fn verify(&self) -> Result<(), Error> {
        let (_, signed_pre_key) = self.signed_pre_key;
        self.signing_key
            .verify_strict(signed_pre_key.as_bytes(), &self.signed_pre_key_signature)
            .map_err(|err| Error::UntrustedIdentity(format!("bad signed pre-key signature: {err}")))
    }

    #[inline]
    pub fn identity_key(&self) -> X25519PublicKey {
        self.identity_key
    }

    /// `(id, key)` of the signed pre-key.
    #[inline]
    pub fn signed_pre_key(&self) -> (u32, X25519PublicKey) {
        self.signed_pre_key
    }

    /// `(id, key)` of the claimed one-time pre-key, if one was left.
    #[inline]
    pub fn one_time_pre_key(&self) -> Option<(u32, X25519PublicKey)> {
        self.one_time_pre_key
    }
}

/// Extended Triple Diffie-Hellman agreement between an online initiator and a
/// responder that is represented only by its published keys.
///
/// `info` binds derived secrets to one deployment; two instances with
/// different info never agree even on identical keys.
pub struct X3DH {
    info: Vec<u8>,
}

impl X3DH {
    pub fn new(info: &[u8]) -> Self {
        Self {
            info: info.to_vec(),
        }
    }

    /// Verifies `responder` and runs the agreement with a fresh ephemeral key.
    pub fn initiate(
        &self,
        provider: &dyn CryptoProvider,
        initiator: &IdentityKey,
        responder: &X3DHPublicKeys,
    ) -> Result<X3DHInitiation, Error> {
        responder.verify()?;

        let ephemeral = X25519Secret::from(generate_random_seed(provider)?);
        let (_, signed_pre_key) = responder.signed_pre_key();

        let exchanges = [
            initiator.dh(&signed_pre_key),
            ephemeral.dh(&responder.identity_key()),
            ephemeral.dh(&signed_pre_key),
        ];
        let one_time = responder
            .one_time_pre_key()
            .map(|(_, key)| ephemeral.dh(&key));

        Ok(X3DHInitiation {
            shared_secret: self.derive(&exchanges, one_time.as_ref())?,
            ephemeral_key: ephemeral.public_key(),
        })
    }

    /// Mirrors [`X3DH::initiate`] from the responder's private keys.
    ///
    /// Takes the one-time pre-key by value; it is dropped, and zeroized, once
    /// the secret is derived.
    pub fn respond(
        &self,
        responder: &IdentityKey,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<OneTimePreKey>,
        initiator_identity: &X25519PublicKey,
        ephemeral_key: &X25519PublicKey,
    ) -> Result<X3DHSharedSecret, Error> {
        let exchanges = [
            signed_pre_key.dh(initiator_identity),
            responder.dh(ephemeral_key),
            signed_pre_key.dh(ephemeral_key),
        ];
        let one_time = one_time_pre_key.map(|key| key.dh(ephemeral_key));

        self.derive(&exchanges, one_time.as_ref())
    }

    /// HKDF over the concatenated DH outputs, the one-time exchange last.
    fn derive(
        &self,
        exchanges: &[SharedSecret; 3],
        one_time: Option<&SharedSecret>,
    ) -> Result<X3DHSharedSecret, Error> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(128));
        for secret in exchanges.iter().chain(one_time) {
            ikm.extend_from_slice(secret.as_bytes());
        }

        let mut okm = Box::new([0u8; 32]);
        Hkdf::<Sha256>::new(Some(SALT), &ikm)
            .expand(&self.info, okm.as_mut_slice())
            .map_err(|_| Error::KeyGeneration("X3DH output length rejected by HKDF".to_string()))?;

        Ok(X3DHSharedSecret(okm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OsCryptoProvider;

    struct Responder {
        identity: IdentityKey,
        signed_pre_key: SignedPreKey,
        one_time_pre_key: Option<OneTimePreKey>,
    }

    impl Responder {
        fn new(with_one_time_key: bool) -> Self {
            let provider = OsCryptoProvider;
            Self {
                identity: IdentityKey::generate(&provider).unwrap(),
                signed_pre_key: SignedPreKey::generate(&provider, 7).unwrap(),
                one_time_pre_key: with_one_time_key
                    .then(|| OneTimePreKey::generate(&provider, 42).unwrap()),
            }
        }

        fn published(&self) -> X3DHPublicKeys {
            X3DHPublicKeys::new(
                self.identity.dh_key_public(),
                self.identity.signing_key_public(),
                self.signed_pre_key.signature(&self.identity),
                (self.signed_pre_key.id(), self.signed_pre_key.public_key()),
                self.one_time_pre_key
                    .as_ref()
                    .map(|key| (key.id(), key.public_key())),
            )
        }

        fn respond(
            self,
            x3dh: &X3DH,
            initiator: &IdentityKey,
            ephemeral: &X25519PublicKey,
        ) -> X3DHSharedSecret {
            x3dh.respond(
                &self.identity,
                &self.signed_pre_key,
                self.one_time_pre_key,
                &initiator.dh_key_public(),
                ephemeral,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_both_sides_derive_the_same_secret() {
        for with_one_time_key in [true, false] {
            let initiator = IdentityKey::generate(&OsCryptoProvider).unwrap();
            let responder = Responder::new(with_one_time_key);
            let x3dh = X3DH::new(b"parley-test");

            let initiation = x3dh
                .initiate(&OsCryptoProvider, &initiator, &responder.published())
                .unwrap();
            let ephemeral = initiation.ephemeral_key();
            let responder_secret = responder.respond(&x3dh, &initiator, &ephemeral);

            assert_eq!(initiation.into_shared_secret().0, responder_secret.0);
        }
    }

    #[test]
    fn test_info_separates_deployments() {
        let initiator = IdentityKey::generate(&OsCryptoProvider).unwrap();
        let responder = Responder::new(true);

        let initiation = X3DH::new(b"deployment-a")
            .initiate(&OsCryptoProvider, &initiator, &responder.published())
            .unwrap();
        let ephemeral = initiation.ephemeral_key();
        let other = responder.respond(&X3DH::new(b"deployment-b"), &initiator, &ephemeral);

        assert_ne!(initiation.into_shared_secret().0, other.0);
    }

    #[test]
    fn test_dropping_the_one_time_key_changes_the_secret() {
        let initiator = IdentityKey::generate(&OsCryptoProvider).unwrap();
        let responder = Responder::new(true);
        let x3dh = X3DH::new(b"parley-test");

        let initiation = x3dh
            .initiate(&OsCryptoProvider, &initiator, &responder.published())
            .unwrap();
        let ephemeral = initiation.ephemeral_key();
        let Responder {
            identity,
            signed_pre_key,
            ..
        } = responder;
        let without = x3dh
            .respond(
                &identity,
                &signed_pre_key,
                None,
                &initiator.dh_key_public(),
                &ephemeral,
            )
            .unwrap();

        assert_ne!(initiation.into_shared_secret().0, without.0);
    }

    #[test]
    fn test_signature_from_another_identity_is_untrusted() {
        let initiator = IdentityKey::generate(&OsCryptoProvider).unwrap();
        let responder = Responder::new(false);
        let impostor = IdentityKey::generate(&OsCryptoProvider).unwrap();

        let mut keys = responder.published();
        keys.signing_key = impostor.signing_key_public();

        let result = X3DH::new(b"parley-test").initiate(&OsCryptoProvider, &initiator, &keys);
        assert!(matches!(result, Err(Error::UntrustedIdentity(_))));
    }
}
