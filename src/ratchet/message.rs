use crate::Error;
use crate::crypto::X25519PublicKey;

/// Ratchet key, previous chain length and message number.
pub(super) const HEADER_SIZE: usize = 32 + 4 + 4;

#[derive(Clone, Debug)]
pub(super) struct MessageHeader {
    pub(super) ratchet_key: X25519PublicKey,
    pub(super) previous_chain_length: u32,
    pub(super) number: u32,
}

impl MessageHeader {
    pub(super) fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let (key, counters) = out.split_at_mut(32);
        key.copy_from_slice(self.ratchet_key.as_bytes());
        counters[..4].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        counters[4..].copy_from_slice(&self.number.to_be_bytes());
        out
    }

    pub(super) fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_SIZE] = bytes.try_into().ok()?;
        let (key, counters) = bytes.split_first_chunk::<32>()?;
        let (previous, number) = counters.split_first_chunk::<4>()?;

        Some(Self {
            ratchet_key: X25519PublicKey::from(*key),
            previous_chain_length: u32::from_be_bytes(*previous),
            number: u32::from_be_bytes(number.try_into().ok()?),
        })
    }
}

/// One sealed ratchet message: the encrypted header followed by the payload.
///
/// On the wire: `u32` big-endian header length, header, payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Nonce followed by the sealed [`MessageHeader`].
    pub header: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let header_len = u32::try_from(self.header.len()).unwrap_or(u32::MAX);
        let parts: [&[u8]; 3] = [&header_len.to_be_bytes(), &self.header, &self.ciphertext];
        parts.concat()
    }

    /// Splits a framed message. Only the framing is checked here; the header
    /// and payload are authenticated on decrypt.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let (prefix, rest) = bytes
            .split_first_chunk::<4>()
            .ok_or_else(|| Error::Validation("ratchet message too short".to_string()))?;
        let header_len = u32::from_be_bytes(*prefix) as usize;

        let (header, ciphertext) = rest.split_at_checked(header_len).ok_or_else(|| {
            Error::Validation(format!("ratchet header length {header_len} exceeds message"))
        })?;

        Ok(Self {
            header: header.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_counters_are_big_endian() {
        let header = MessageHeader {
            ratchet_key: X25519PublicKey::from([9u8; 32]),
            previous_chain_length: 3,
            number: 258,
        };

        let encoded = header.encode();
        assert_eq!(&encoded[32..], &[0, 0, 0, 3, 0, 0, 1, 2]);

        let decoded = MessageHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.ratchet_key, header.ratchet_key);
        assert_eq!(decoded.previous_chain_length, 3);
        assert_eq!(decoded.number, 258);
    }

    #[test]
    fn test_header_of_wrong_length_does_not_decode() {
        assert!(MessageHeader::decode(&[0u8; HEADER_SIZE - 1]).is_none());
        assert!(MessageHeader::decode(&[0u8; HEADER_SIZE + 1]).is_none());
    }

    #[test]
    fn test_framing_prefixes_the_header_length() {
        let message = RatchetMessage {
            header: vec![1, 2, 3],
            ciphertext: vec![4, 5],
        };

        let framed = message.to_bytes();
        assert_eq!(framed, vec![0, 0, 0, 3, 1, 2, 3, 4, 5]);
        assert_eq!(RatchetMessage::from_bytes(&framed).unwrap(), message);
    }

    #[test]
    fn test_short_frames_are_rejected() {
        assert!(RatchetMessage::from_bytes(&[]).is_err());
        assert!(RatchetMessage::from_bytes(&[0, 0]).is_err());
        assert!(matches!(
            RatchetMessage::from_bytes(&[0, 0, 0, 9, 1]),
            Err(Error::Validation(_))
        ));
    }
}
