use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes.into())
    }
}

/// Boxed X25519 private key. Clearing it wipes the scalar.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct X25519Secret(Box<StaticSecret>);

impl X25519Secret {
    pub(crate) fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(PublicKey::from(&*self.0))
    }

    pub(crate) fn dh(&self, peer: &X25519PublicKey) -> SharedSecret {
        self.0.diffie_hellman(&peer.0)
    }
}

/// Takes ownership of a seed; the seed buffer is wiped once the key exists.
impl From<Box<[u8; 32]>> for X25519Secret {
    fn from(mut seed: Box<[u8; 32]>) -> Self {
        let secret = Box::new(StaticSecret::from(*seed));
        seed.zeroize();
        Self(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_seeds_agree() {
        let left = X25519Secret::from(Box::new([3u8; 32]));
        let right = X25519Secret::from(Box::new([9u8; 32]));

        assert_eq!(
            left.dh(&right.public_key()).as_bytes(),
            right.dh(&left.public_key()).as_bytes()
        );
    }

    #[test]
    fn test_public_bytes_rebuild_the_key() {
        let public = X25519Secret::from(Box::new([5u8; 32])).public_key();
        assert_eq!(X25519PublicKey::from(public.to_bytes()), public);
        assert_eq!(public.as_bytes(), &public.to_bytes());
    }
}
