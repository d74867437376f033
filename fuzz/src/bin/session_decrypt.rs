#[macro_use]
extern crate afl;
use parley::{
    EncryptedPayload, EncryptionScheme, KeyManager, OsCryptoProvider, SessionConfig,
    SessionCoordinator, SessionStore, UserId,
};
use std::sync::Arc;

fn main() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
    let (sessions, session_id) = runtime.block_on(async {
        let keys = Arc::new(KeyManager::new(
            Arc::new(OsCryptoProvider),
            SessionConfig::default(),
        ));
        keys.setup_encryption(&alice).await.expect("alice keys");
        keys.setup_encryption(&bob).await.expect("bob keys");

        let sessions = SessionCoordinator::new(keys, Arc::new(SessionStore::new()));
        let session_id = sessions
            .establish_session(&alice, &bob)
            .await
            .expect("session");
        (sessions, session_id)
    });

    fuzz!(|data: &[u8]| {
        let payload = EncryptedPayload {
            scheme: EncryptionScheme::DoubleRatchetV1,
            session_id: session_id.clone(),
            body: data.to_vec(),
        };
        let _ = runtime.block_on(sessions.decrypt(&alice, &bob, &payload));
    });
}
