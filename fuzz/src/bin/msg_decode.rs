#[macro_use]
extern crate afl;
use parley::ratchet::RatchetMessage;
use parley::realtime::InboundEvent;

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = RatchetMessage::from_bytes(data);
        if let Ok(text) = std::str::from_utf8(data) {
            let _ = serde_json::from_str::<InboundEvent>(text);
        }
    });
}
