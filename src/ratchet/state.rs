use crate::crypto::X25519Secret;
use crate::ratchet::chain::Chain;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) type Key = Box<[u8; 32]>;

#[derive(Clone)]
pub(crate) struct RatchetState {
    /// `IK_initiator || IK_responder`, bound into every header and payload.
    pub(crate) associated_data: Box<[u8; 64]>,
    pub(crate) ratchet_key: X25519Secret,
    pub(crate) root_key: Key,

    pub(crate) send_chain: Chain,
    pub(crate) send_count: u32,
    /// Length of the sending chain before the last DH step.
    pub(crate) previous_chain_length: u32,
    pub(crate) send_header_key: Option<Key>,
    pub(crate) next_send_header_key: Key,

    pub(crate) receive_chain: Chain,
    pub(crate) receive_count: u32,
    pub(crate) receive_header_key: Option<Key>,
    pub(crate) next_receive_header_key: Option<Key>,
}

impl Zeroize for RatchetState {
    fn zeroize(&mut self) {
        self.associated_data.zeroize();
        self.ratchet_key.zeroize();
        self.root_key.zeroize();
        self.send_chain.zeroize();
        self.receive_chain.zeroize();
        self.next_send_header_key.zeroize();
        self.send_header_key.iter_mut().for_each(|key| key.zeroize());
        self.receive_header_key.iter_mut().for_each(|key| key.zeroize());
        self.next_receive_header_key.iter_mut().for_each(|key| key.zeroize());
    }
}

impl ZeroizeOnDrop for RatchetState {}
