mod chain;
mod message;
mod state;

pub use message::RatchetMessage;

use crate::Error;
use crate::crypto::{CryptoProvider, NONCE_SIZE, X25519PublicKey, X25519Secret, generate_random_seed};
use crate::x3dh::X3DHSharedSecret;
use chain::Chain;
use hkdf::Hkdf;
use message::MessageHeader;
use sha2::Sha256;
use state::{Key, RatchetState};
use std::collections::HashMap;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

fn expand(hkdf: &Hkdf<Sha256>, label: &[u8]) -> Result<Key, Error> {
    let mut out = Box::new([0u8; 32]);
    hkdf.expand(label, out.as_mut_slice())
        .map_err(|_| Error::KeyGeneration("HKDF output length rejected".to_string()))?;
    Ok(out)
}

/// Keys produced by one step of the root chain.
struct RootStep {
    root_key: Key,
    chain_key: Key,
    next_header_key: Key,
}

impl RootStep {
    fn derive(root_key: &[u8; 32], dh_output: SharedSecret) -> Result<Self, Error> {
        let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output.as_bytes());
        Ok(Self {
            root_key: expand(&hkdf, b"Parley-E2E-Root")?,
            chain_key: expand(&hkdf, b"Parley-E2E-Chain")?,
            next_header_key: expand(&hkdf, b"Parley-E2E-Next-Header")?,
        })
    }
}

/// The first header keys of each side, taken straight from the X3DH secret.
///
/// Returns `(initiator's sending header key, responder's next sending header key)`.
fn initial_header_keys(secret: &[u8; 32]) -> Result<(Key, Key), Error> {
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    Ok((
        expand(&hkdf, b"Parley-Header-Key-A")?,
        expand(&hkdf, b"Parley-Next-Header-Key-B")?,
    ))
}

/// AEAD key and nonce for one message key.
fn payload_key(message_key: &[u8; 32]) -> Result<(Zeroizing<[u8; 32]>, [u8; NONCE_SIZE]), Error> {
    let mut okm = Zeroizing::new([0u8; 32 + NONCE_SIZE]);
    Hkdf::<Sha256>::new(None, message_key)
        .expand(b"Parley-E2E-Keys", okm.as_mut_slice())
        .map_err(|_| Error::KeyGeneration("HKDF output length rejected".to_string()))?;

    let (key, nonce) = okm.split_at(32);
    let mut aead_key = Zeroizing::new([0u8; 32]);
    aead_key.copy_from_slice(key);
    let mut aead_nonce = [0u8; NONCE_SIZE];
    aead_nonce.copy_from_slice(nonce);
    Ok((aead_key, aead_nonce))
}

/// Double Ratchet session half with encrypted headers.
///
/// A DH step replaces the root key whenever the conversation changes
/// direction, so a leaked chain key only exposes the rest of its own chain.
/// Headers are sealed as well, which keeps ratchet keys and counters off the
/// wire. Keys for messages that were skipped over are kept until they arrive,
/// at most `max_skip` per chain.
#[derive(Clone)]
pub struct DoubleRatchet {
    state: RatchetState,
    /// `(header key, message number) -> message key`
    skipped: HashMap<(Key, u32), Key>,
    max_skip: u32,
}

impl Zeroize for DoubleRatchet {
    fn zeroize(&mut self) {
        self.state.zeroize();
        for ((mut header_key, _), mut message_key) in self.skipped.drain() {
            header_key.zeroize();
            message_key.zeroize();
        }
    }
}

impl ZeroizeOnDrop for DoubleRatchet {}

impl DoubleRatchet {
    /// Starts the initiator's side, ratcheting once against the responder's
    /// signed pre-key so the first message can be sent right away.
    pub(crate) fn new_initiator(
        provider: &dyn CryptoProvider,
        mut shared_secret: X3DHSharedSecret,
        responder_ratchet_key: &X25519PublicKey,
        max_skip: u32,
        associated_data: Box<[u8; 64]>,
    ) -> Result<Self, Error> {
        let ratchet_key = X25519Secret::from(generate_random_seed(provider)?);
        let first = RootStep::derive(&shared_secret.0, ratchet_key.dh(responder_ratchet_key))?;
        let (send_header_key, next_receive_header_key) = initial_header_keys(&shared_secret.0)?;
        shared_secret.zeroize();

        Ok(Self {
            state: RatchetState {
                associated_data,
                ratchet_key,
                root_key: first.root_key,
                send_chain: Chain::new(first.chain_key),
                send_count: 0,
                previous_chain_length: 0,
                send_header_key: Some(send_header_key),
                next_send_header_key: first.next_header_key,
                receive_chain: Chain::default(),
                receive_count: 0,
                receive_header_key: None,
                next_receive_header_key: Some(next_receive_header_key),
            },
            skipped: HashMap::new(),
            max_skip,
        })
    }

    /// Starts the responder's side. `signed_pre_key` is the key pair the
    /// initiator ratcheted against.
    pub(crate) fn new_responder(
        shared_secret: X3DHSharedSecret,
        signed_pre_key: X25519Secret,
        max_skip: u32,
        associated_data: Box<[u8; 64]>,
    ) -> Result<Self, Error> {
        let (next_receive_header_key, next_send_header_key) =
            initial_header_keys(&shared_secret.0)?;

        Ok(Self {
            state: RatchetState {
                associated_data,
                ratchet_key: signed_pre_key,
                root_key: shared_secret.0.clone(),
                send_chain: Chain::default(),
                send_count: 0,
                previous_chain_length: 0,
                send_header_key: None,
                next_send_header_key,
                receive_chain: Chain::default(),
                receive_count: 0,
                receive_header_key: None,
                next_receive_header_key: Some(next_receive_header_key),
            },
            skipped: HashMap::new(),
            max_skip,
        })
    }

    /// Current ratchet public key, sent in every header.
    pub fn ratchet_public_key(&self) -> X25519PublicKey {
        self.state.ratchet_key.public_key()
    }

    /// Number of message keys held for messages that have not arrived yet.
    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    pub fn encrypt(
        &mut self,
        provider: &dyn CryptoProvider,
        plaintext: &[u8],
    ) -> Result<RatchetMessage, Error> {
        let header = self.seal_header(
            provider,
            &MessageHeader {
                ratchet_key: self.ratchet_public_key(),
                previous_chain_length: self.state.previous_chain_length,
                number: self.state.send_count,
            },
        )?;

        // The chain only moves once the payload is sealed
        let mut chain = self.state.send_chain.clone();
        let message_key = chain.next()?;
        let (key, nonce) = payload_key(&message_key)?;
        let ciphertext = provider.seal(&key, &nonce, plaintext, &self.bound_to(&header))?;

        self.state.send_chain = chain;
        self.state.send_count = self.state.send_count.wrapping_add(1);

        Ok(RatchetMessage { header, ciphertext })
    }

    /// Decrypts `message`, advancing the ratchet.
    ///
    /// On any error the ratchet is restored to its state before the call, so
    /// forged or replayed messages cannot desynchronize it.
    pub fn decrypt(
        &mut self,
        provider: &dyn CryptoProvider,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, Error> {
        let snapshot = self.clone();
        let result = self.advance_and_open(provider, message);
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    fn advance_and_open(
        &mut self,
        provider: &dyn CryptoProvider,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, Error> {
        if let Some(plaintext) = self.open_skipped(provider, message)? {
            return Ok(plaintext);
        }

        let (header, new_chain) = self.open_header(provider, &message.header)?;
        if new_chain {
            self.skip_until(header.previous_chain_length)?;
            self.dh_step(provider, &header.ratchet_key)?;
        }
        self.skip_until(header.number)?;

        let message_key = self.state.receive_chain.next()?;
        self.state.receive_count = self.state.receive_count.wrapping_add(1);

        self.open_payload(provider, &message_key, message)
    }

    /// Header nonce followed by the sealed header.
    fn seal_header(
        &self,
        provider: &dyn CryptoProvider,
        header: &MessageHeader,
    ) -> Result<Vec<u8>, Error> {
        let header_key = self
            .state
            .send_header_key
            .as_deref()
            .ok_or_else(|| Error::Encryption("ratchet has no sending header key yet".to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        provider.fill_random(&mut nonce)?;
        let sealed = provider.seal(
            header_key,
            &nonce,
            &header.encode(),
            self.state.associated_data.as_slice(),
        )?;

        Ok([nonce.as_slice(), sealed.as_slice()].concat())
    }

    fn read_header(
        &self,
        provider: &dyn CryptoProvider,
        sealed: &[u8],
        header_key: &[u8; 32],
    ) -> Option<MessageHeader> {
        let (nonce, ciphertext) = sealed.split_first_chunk::<NONCE_SIZE>()?;
        let plaintext = provider
            .open(header_key, nonce, ciphertext, self.state.associated_data.as_slice())
            .ok()?;
        MessageHeader::decode(&plaintext)
    }

    /// Opens the header with the current receiving header key, then with the
    /// next one. The flag is set when the next key matched, meaning the
    /// sender has started a new chain.
    fn open_header(
        &self,
        provider: &dyn CryptoProvider,
        sealed: &[u8],
    ) -> Result<(MessageHeader, bool), Error> {
        [
            (self.state.receive_header_key.as_deref(), false),
            (self.state.next_receive_header_key.as_deref(), true),
        ]
        .into_iter()
        .find_map(|(header_key, new_chain)| {
            self.read_header(provider, sealed, header_key?)
                .map(|header| (header, new_chain))
        })
        .ok_or_else(|| Error::Decryption("no receiving header key opens this message".to_string()))
    }

    fn open_skipped(
        &mut self,
        provider: &dyn CryptoProvider,
        message: &RatchetMessage,
    ) -> Result<Option<Vec<u8>>, Error> {
        let Some(slot) = self
            .skipped
            .keys()
            .find(|(header_key, number)| {
                self.read_header(provider, &message.header, header_key)
                    .is_some_and(|header| header.number == *number)
            })
            .cloned()
        else {
            return Ok(None);
        };

        match self.skipped.remove(&slot) {
            Some(message_key) => self.open_payload(provider, &message_key, message).map(Some),
            None => Ok(None),
        }
    }

    fn open_payload(
        &self,
        provider: &dyn CryptoProvider,
        message_key: &[u8; 32],
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, Error> {
        let (key, nonce) = payload_key(message_key)?;
        provider.open(&key, &nonce, &message.ciphertext, &self.bound_to(&message.header))
    }

    /// Payload AAD: the session's associated data followed by the sealed header.
    fn bound_to(&self, sealed_header: &[u8]) -> Vec<u8> {
        [self.state.associated_data.as_slice(), sealed_header].concat()
    }

    /// Receives the peer's new ratchet key and starts fresh chains in both
    /// directions.
    fn dh_step(
        &mut self,
        provider: &dyn CryptoProvider,
        remote_ratchet_key: &X25519PublicKey,
    ) -> Result<(), Error> {
        let fresh = X25519Secret::from(generate_random_seed(provider)?);
        let receiving =
            RootStep::derive(&self.state.root_key, self.state.ratchet_key.dh(remote_ratchet_key))?;
        let sending = RootStep::derive(&receiving.root_key, fresh.dh(remote_ratchet_key))?;

        let state = &mut self.state;
        state.previous_chain_length = state.send_chain.index;
        state.send_count = 0;
        state.receive_count = 0;

        state.receive_header_key = state
            .next_receive_header_key
            .replace(receiving.next_header_key);
        state.receive_chain = Chain::new(receiving.chain_key);

        state.send_header_key = Some(std::mem::replace(
            &mut state.next_send_header_key,
            sending.next_header_key,
        ));
        state.send_chain = Chain::new(sending.chain_key);

        state.ratchet_key = fresh;
        state.root_key = sending.root_key;
        Ok(())
    }

    /// Stores the message keys of the current receiving chain up to `until`.
    fn skip_until(&mut self, until: u32) -> Result<(), Error> {
        let state = &mut self.state;
        if state.receive_count.saturating_add(self.max_skip) < until {
            return Err(Error::Decryption(format!(
                "message {until} is more than {} ahead of the chain",
                self.max_skip
            )));
        }
        if !state.receive_chain.is_initialized() {
            return Ok(());
        }

        while state.receive_count < until {
            let message_key = state.receive_chain.next()?;
            if let Some(header_key) = &state.receive_header_key {
                self.skipped
                    .insert((header_key.clone(), state.receive_count), message_key);
            }
            state.receive_count = state.receive_count.wrapping_add(1);
        }
        Ok(())
    }
}
