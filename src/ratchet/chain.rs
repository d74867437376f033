use crate::Error;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Symmetric-key ratchet deriving one message key per step.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Chain {
    pub(crate) chain_key: Box<[u8; 32]>,
    pub(crate) index: u32,
}

impl Chain {
    pub(crate) fn new(chain_key: Box<[u8; 32]>) -> Self {
        Self {
            chain_key,
            index: 0,
        }
    }

    /// An all-zero chain key marks a chain that has not been started yet.
    pub(crate) fn is_initialized(&self) -> bool {
        self.chain_key.as_ref() != &[0u8; 32]
    }

    /// Advances the chain and returns the next message key.
    pub(crate) fn next(&mut self) -> Result<Box<[u8; 32]>, Error> {
        let chain_result = Self::mac(&self.chain_key, 0x01)?;
        let message_result = Self::mac(&self.chain_key, 0x02)?;

        self.chain_key.copy_from_slice(&chain_result);
        self.index = self.index.wrapping_add(1);

        let mut message_key = Box::new([0u8; 32]);
        message_key.copy_from_slice(&message_result);
        Ok(message_key)
    }

    fn mac(key: &[u8; 32], constant: u8) -> Result<[u8; 32], Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_slice())
            .map_err(|err| Error::KeyGeneration(format!("chain HMAC: {err}")))?;
        mac.update(&[constant]);

        let mut output = [0u8; 32];
        output.copy_from_slice(&mac.finalize().into_bytes());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_deterministic() {
        let mut a = Chain::new(Box::new([4u8; 32]));
        let mut b = Chain::new(Box::new([4u8; 32]));

        let first = a.next().unwrap();
        assert_eq!(first, b.next().unwrap());
        assert_ne!(first, a.next().unwrap());
        assert_eq!(a.index, 2);
    }

    #[test]
    fn test_default_chain_is_uninitialized() {
        assert!(!Chain::default().is_initialized());
        assert!(Chain::new(Box::new([1u8; 32])).is_initialized());
    }
}
